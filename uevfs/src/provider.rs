//! Mount orchestration over all registered containers.
//!
//! [`VfsFileProvider`] owns every piece of mount state: the registry, the key
//! store, the merged file index, and the global data cell. Callers register
//! opened containers, then drive the lifecycle with [`mount`] and
//! [`submit_keys`] (or their async forms).
//!
//! # Mount Pass
//!
//! ```text
//! mount() / submit_keys()
//!     │
//!     ├── for each eligible Unmounted reader
//!     │       ├── offer to GlobalDataCache (spawn_blocking)
//!     │       └── spawn task ──► acquire permit ──► spawn_blocking(mount_to)
//!     │                                                 │
//!     │                         Ok ──► mark_mounted ────┤
//!     │                 InvalidKey ──► (silent) ────────┤
//!     │                      Other ──► warn! ───────────┤
//!     │                                                 ▼
//!     └── join_all ──────────────────────────────► newly-mounted count
//! ```
//!
//! Each call waits for the tasks it spawned and nothing else. Two calls may
//! run at the same time; the registry's atomic move guarantees a reader is
//! counted by exactly one of them.
//!
//! [`mount`]: VfsFileProvider::mount
//! [`submit_keys`]: VfsFileProvider::submit_keys

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConfigFile, ProviderConfig};
use crate::error::{VfsError, VfsResult};
use crate::global_data::{GlobalData, GlobalDataCache};
use crate::index::{FileIndex, GameFile, PackageId};
use crate::keys::{AesKey, KeyId, KeyStore};
use crate::reader::{ArchiveReader, ReaderId, ReaderState, VfsReader};
use crate::registry::{MountRegistry, MountState};

/// Result of one mount attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MountOutcome {
    /// Parsed and moved to *Mounted* by this attempt.
    Mounted,
    /// Parsed, but a concurrent call moved the reader first.
    AlreadyMounted,
    /// The key did not fit.
    InvalidKey,
    /// Parsing failed; the reader stays *Unmounted*.
    Failed,
}

/// Point-in-time summary of the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderStatus {
    pub registered: usize,
    pub mounted: usize,
    pub unmounted: usize,
    pub files: usize,
    pub resolved_keys: usize,
    pub required_keys: Vec<KeyId>,
    pub global_data_loaded: bool,
}

struct ProviderState {
    registry: MountRegistry,
    keys: KeyStore,
    index: FileIndex,
    global_data: GlobalDataCache,
    config: ProviderConfig,
}

/// Merged, queryable catalog over a set of game-data containers.
///
/// # Example
///
/// ```ignore
/// use uevfs::{ProviderConfig, VfsFileProvider};
///
/// let provider = VfsFileProvider::new(ProviderConfig::default());
/// for reader in discovered_readers {
///     provider.register(reader);
/// }
///
/// // Mount everything that needs no key
/// let mounted = provider.mount()?;
///
/// // Later, when a key arrives
/// let unlocked = provider.submit_key(key_id, key)?;
///
/// if let Some(file) = provider.lookup("Game/Maps/Entry.umap") {
///     println!("{} from {}", file.path, file.reader_name);
/// }
/// ```
pub struct VfsFileProvider {
    state: Arc<ProviderState>,
    limiter: Arc<Semaphore>,
    /// Runtime backing the blocking API, created on first use.
    runtime: Mutex<Option<Arc<Runtime>>>,
    disposed: AtomicBool,
}

impl VfsFileProvider {
    /// Create an empty provider.
    pub fn new(config: ProviderConfig) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_mounts.max(1)));
        let state = ProviderState {
            registry: MountRegistry::new(),
            keys: KeyStore::new(),
            index: FileIndex::new(config.case_sensitivity),
            global_data: GlobalDataCache::new(config.global_container_name.clone()),
            config,
        };

        Self {
            state: Arc::new(state),
            limiter,
            runtime: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Create a provider from a configuration file's settings.
    ///
    /// Keys in the file are not submitted; call
    /// [`submit_config_keys`](Self::submit_config_keys) after registering.
    pub fn from_config_file(config: &ConfigFile) -> Self {
        Self::new(config.provider_config())
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.state.config
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Hand an opened container to the provider. It starts *Unmounted*.
    ///
    /// An encrypted container marks its key id as required, even when that
    /// id was resolved earlier: `mount` never applies stored keys, so the
    /// container stays blocked until the key is submitted again.
    pub fn register(&self, reader: Arc<dyn ArchiveReader>) -> Arc<VfsReader> {
        let handle = self.state.registry.insert(reader);

        if handle.is_encrypted() {
            if let Some(id) = handle.encryption_key_id() {
                self.state.keys.mark_required(id);
            }
        }

        debug!(
            reader = %handle.display_name(),
            id = %handle.id(),
            encrypted = handle.is_encrypted(),
            has_directory_index = handle.has_directory_index(),
            "Registered container"
        );

        handle
    }

    /// Register several containers.
    pub fn register_all(
        &self,
        readers: impl IntoIterator<Item = Arc<dyn ArchiveReader>>,
    ) -> Vec<Arc<VfsReader>> {
        readers.into_iter().map(|r| self.register(r)).collect()
    }

    // ------------------------------------------------------------------
    // Mounting
    // ------------------------------------------------------------------

    /// Mount every unencrypted, indexed container not yet mounted.
    ///
    /// Blocking form of [`mount_async`](Self::mount_async).
    ///
    /// # Errors
    ///
    /// Per-container failures are never returned. This only fails if called
    /// from inside an async runtime or if the internal runtime cannot be
    /// built.
    pub fn mount(&self) -> VfsResult<usize> {
        let runtime = self.blocking_runtime()?;
        Ok(runtime.block_on(self.mount_async()))
    }

    /// Mount every unencrypted, indexed container not yet mounted.
    ///
    /// Returns how many containers this call mounted.
    pub async fn mount_async(&self) -> usize {
        if self.is_disposed() {
            warn!("Mount requested after dispose; ignoring");
            return 0;
        }

        let unmounted = self.state.registry.unmounted();
        let offer = self.spawn_global_offer(&unmounted);
        let mut tasks = Vec::new();

        for reader in unmounted {
            if reader.is_encrypted() || !reader.has_directory_index() {
                debug!(
                    reader = %reader.display_name(),
                    encrypted = reader.is_encrypted(),
                    has_directory_index = reader.has_directory_index(),
                    "Skipping container"
                );
                continue;
            }

            tasks.push(self.spawn_attempt(reader, None));
        }

        let attempted = tasks.len();
        let mounted = join_attempts(tasks).await;
        join_global_offer(offer).await;

        info!(attempted, mounted, "Mount pass complete");
        mounted
    }

    /// Submit one key. Sugar for [`submit_keys`](Self::submit_keys).
    pub fn submit_key(&self, id: KeyId, key: AesKey) -> VfsResult<usize> {
        self.submit_keys([(id, key)])
    }

    /// Async form of [`submit_key`](Self::submit_key).
    pub async fn submit_key_async(&self, id: KeyId, key: AesKey) -> usize {
        self.submit_keys_async([(id, key)]).await
    }

    /// Try each key against every unmounted container declaring its id.
    ///
    /// Blocking form of [`submit_keys_async`](Self::submit_keys_async).
    ///
    /// # Errors
    ///
    /// Same as [`mount`](Self::mount).
    pub fn submit_keys(
        &self,
        keys: impl IntoIterator<Item = (KeyId, AesKey)>,
    ) -> VfsResult<usize> {
        let runtime = self.blocking_runtime()?;
        Ok(runtime.block_on(self.submit_keys_async(keys)))
    }

    /// Try each key against every unmounted container declaring its id.
    ///
    /// Containers sharing an id are attempted independently: a wrong key or
    /// a corrupt container never blocks its siblings. Returns how many
    /// containers this call mounted.
    pub async fn submit_keys_async(
        &self,
        keys: impl IntoIterator<Item = (KeyId, AesKey)>,
    ) -> usize {
        if self.is_disposed() {
            warn!("Key submission after dispose; ignoring");
            return 0;
        }

        let mut tasks = Vec::new();
        let mut offers = Vec::new();

        for (id, key) in keys {
            let candidates = self.state.registry.unmounted_by_key(id);
            offers.extend(self.spawn_global_offer(&candidates));

            for reader in candidates {
                if !reader.has_directory_index() {
                    debug!(
                        reader = %reader.display_name(),
                        key_id = %id,
                        "Skipping container without directory index"
                    );
                    continue;
                }

                tasks.push(self.spawn_attempt(reader, Some((id, key.clone()))));
            }
        }

        let attempted = tasks.len();
        let mounted = join_attempts(tasks).await;
        for offer in offers {
            join_global_offer(Some(offer)).await;
        }

        info!(attempted, mounted, "Key submission complete");
        mounted
    }

    /// Submit every key listed in a configuration file.
    pub fn submit_config_keys(&self, config: &ConfigFile) -> VfsResult<usize> {
        self.submit_keys(config.keys.iter().map(|(id, key)| (*id, key.clone())))
    }

    /// Offer the global container among `candidates` to the global data
    /// cache on the blocking pool. `None` when there is nothing to build.
    fn spawn_global_offer(&self, candidates: &[Arc<VfsReader>]) -> Option<JoinHandle<()>> {
        if self.state.global_data.is_set() {
            return None;
        }

        let matching: Vec<Arc<VfsReader>> = candidates
            .iter()
            .filter(|r| self.state.global_data.matches(r))
            .cloned()
            .collect();
        if matching.is_empty() {
            return None;
        }

        let state = Arc::clone(&self.state);
        Some(tokio::task::spawn_blocking(move || {
            for reader in &matching {
                state.global_data.try_compute(reader);
            }
        }))
    }

    fn spawn_attempt(
        &self,
        reader: Arc<VfsReader>,
        key: Option<(KeyId, AesKey)>,
    ) -> JoinHandle<MountOutcome> {
        let state = Arc::clone(&self.state);
        let limiter = Arc::clone(&self.limiter);

        tokio::spawn(async move {
            // The semaphore is never closed; without a permit we still mount.
            let _permit = limiter.acquire_owned().await.ok();
            let name = reader.display_name();

            match tokio::task::spawn_blocking(move || attempt_mount(&state, &reader, key)).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(reader = %name, error = %e, "Mount task panicked");
                    MountOutcome::Failed
                }
            }
        })
    }

    fn blocking_runtime(&self) -> VfsResult<Arc<Runtime>> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(VfsError::AsyncContext);
        }

        let mut slot = self.runtime.lock();
        if let Some(runtime) = slot.as_ref() {
            return Ok(Arc::clone(runtime));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("uevfs-mount")
            .build()
            .map_err(|e| VfsError::RuntimeCreation(e.to_string()))?;
        let runtime = Arc::new(runtime);
        *slot = Some(Arc::clone(&runtime));

        Ok(runtime)
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// The merged file index.
    pub fn index(&self) -> &FileIndex {
        &self.state.index
    }

    /// Snapshot of every indexed file.
    pub fn files(&self) -> Vec<Arc<GameFile>> {
        self.state.index.files()
    }

    /// Look up a file by logical path.
    pub fn lookup(&self, path: &str) -> Option<Arc<GameFile>> {
        self.state.index.lookup(path)
    }

    /// Look up a file by package id.
    pub fn lookup_by_id(&self, id: PackageId) -> Option<Arc<GameFile>> {
        self.state.index.lookup_by_id(id)
    }

    pub fn unmounted_readers(&self) -> Vec<Arc<VfsReader>> {
        self.state.registry.unmounted()
    }

    /// Unmounted containers waiting for the key with this id.
    pub fn unmounted_readers_by_key(&self, id: KeyId) -> Vec<Arc<VfsReader>> {
        self.state.registry.unmounted_by_key(id)
    }

    pub fn mounted_readers(&self) -> Vec<Arc<VfsReader>> {
        self.state.registry.mounted()
    }

    /// Keys that unlocked at least one container.
    pub fn keys(&self) -> HashMap<KeyId, AesKey> {
        self.state.keys.resolved()
    }

    /// Key ids still blocking at least one container.
    pub fn required_keys(&self) -> Vec<KeyId> {
        self.state.keys.required()
    }

    pub fn global_data(&self) -> Option<Arc<GlobalData>> {
        self.state.global_data.get()
    }

    /// Current state of a registered container.
    pub fn reader_state(&self, id: ReaderId) -> Option<ReaderState> {
        let reader = self.state.registry.get(id)?;
        let state = match self.state.registry.state_of(id)? {
            MountState::Mounted => ReaderState::Mounted,
            MountState::Unmounted => match reader.block_reason() {
                Some(reason) => ReaderState::Blocked(reason),
                None => ReaderState::Ready,
            },
        };
        Some(state)
    }

    /// Point-in-time summary.
    pub fn status(&self) -> ProviderStatus {
        let registered = self.state.registry.len();
        let mounted = self.state.registry.mounted_count();

        ProviderStatus {
            registered,
            mounted,
            unmounted: registered.saturating_sub(mounted),
            files: self.state.index.len(),
            resolved_keys: self.state.keys.resolved().len(),
            required_keys: self.state.keys.required(),
            global_data_loaded: self.state.global_data.is_set(),
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Release every mounted container's resources.
    ///
    /// Runs once; later calls (including the one from `Drop`) do nothing.
    /// Mount and key-submission calls made afterwards mount nothing.
    /// Must not overlap an in-flight mount or key submission.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mounted = self.state.registry.mounted();
        for reader in &mounted {
            reader.inner().dispose();
        }

        info!(disposed = mounted.len(), "Provider disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Default for VfsFileProvider {
    fn default() -> Self {
        Self::new(ProviderConfig::default())
    }
}

impl Drop for VfsFileProvider {
    fn drop(&mut self) {
        self.dispose();

        // Dropping a runtime blocks, which panics inside async contexts.
        if let Some(runtime) = self.runtime.lock().take() {
            if let Ok(runtime) = Arc::try_unwrap(runtime) {
                runtime.shutdown_background();
            }
        }
    }
}

impl fmt::Debug for VfsFileProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VfsFileProvider")
            .field("config", &self.state.config)
            .field("status", &self.status())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Parse one container and record the outcome. Runs on the blocking pool.
fn attempt_mount(
    state: &ProviderState,
    reader: &VfsReader,
    key: Option<(KeyId, AesKey)>,
) -> MountOutcome {
    let result = reader.mount_into(&state.index, key.as_ref().map(|(_, k)| k));

    match result {
        Ok(()) => {
            let won = state.registry.mark_mounted(reader.id());

            if let Some((id, key)) = key {
                reader.record_key(key.clone());
                state.keys.resolve(id, key);
                state.keys.clear_required(&id);
            }

            if won {
                debug!(reader = %reader.display_name(), "Mounted container");
                MountOutcome::Mounted
            } else {
                debug!(reader = %reader.display_name(), "Container already mounted by another call");
                MountOutcome::AlreadyMounted
            }
        }
        Err(e) if e.is_invalid_key() => {
            debug!(reader = %reader.display_name(), "Key rejected by container");
            MountOutcome::InvalidKey
        }
        Err(e) => {
            warn!(
                reader = %reader.display_name(),
                path = %reader.path().display(),
                error = %e,
                "Failed to mount container"
            );
            MountOutcome::Failed
        }
    }
}

async fn join_global_offer(offer: Option<JoinHandle<()>>) {
    if let Some(offer) = offer {
        if let Err(e) = offer.await {
            warn!(error = %e, "Global data task failed to complete");
        }
    }
}

/// Wait for every attempt and count the ones that mounted.
async fn join_attempts(tasks: Vec<JoinHandle<MountOutcome>>) -> usize {
    join_all(tasks)
        .await
        .into_iter()
        .filter(|result| match result {
            Ok(outcome) => *outcome == MountOutcome::Mounted,
            Err(e) => {
                warn!(error = %e, "Mount task failed to complete");
                false
            }
        })
        .count()
}
