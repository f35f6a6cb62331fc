//! Container reader capability and the provider's per-reader handle.
//!
//! Format-specific readers (pak, IoStore, ...) implement [`ArchiveReader`].
//! The provider never branches on the concrete format: it only looks at the
//! declared `is_encrypted` and `has_directory_index` flags and calls
//! [`ArchiveReader::mount_to`].
//!
//! # Reader Lifecycle
//!
//! ```text
//!                 register()
//!                     │
//!         ┌───────────┼──────────────┐
//!         ▼           ▼              ▼
//!   Blocked(no     Blocked(needs    Ready
//!    index)          key)             │
//!      │               │ submit_keys  │ mount
//!      │ (never)       └──────┬───────┘
//!      ▼                      ▼
//!     ──                   Mounted (terminal)
//! ```

use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::error::MountError;
use crate::global_data::GlobalData;
use crate::index::{CaseSensitivity, FileIndex, IndexWriter};
use crate::keys::{AesKey, KeyId};

/// Provider-unique identifier assigned to a reader at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReaderId(pub u64);

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Capability contract for an opened container.
///
/// Implementations must be safe to share across the provider's mount tasks.
/// `mount_to` may be called more than once for the same reader (e.g. a retry
/// after a wrong key, or two racing orchestrator calls), so it must be
/// repeatable.
pub trait ArchiveReader: Send + Sync {
    /// File name of the container (e.g. `pakchunk0-Windows.utoc`).
    fn name(&self) -> &str;

    /// Full path of the container.
    fn path(&self) -> &Path;

    /// Whether the container's index is encrypted.
    fn is_encrypted(&self) -> bool;

    /// Whether structural metadata listing the contained files is available.
    fn has_directory_index(&self) -> bool;

    /// Key id declared by the container. Meaningful only if encrypted.
    fn encryption_key_id(&self) -> Option<KeyId>;

    /// Parse the container and add every contained file to `index`.
    ///
    /// # Errors
    ///
    /// - [`MountError::InvalidKey`] if `key` does not decrypt the container
    /// - any other variant if parsing fails
    fn mount_to(
        &self,
        index: &IndexWriter<'_>,
        case: CaseSensitivity,
        key: Option<&AesKey>,
    ) -> Result<(), MountError>;

    /// Build engine-global metadata from this container.
    ///
    /// Only the distinguished global container supports this.
    fn read_global_data(&self) -> Result<GlobalData, MountError> {
        Err(MountError::Unsupported(format!(
            "{} does not carry global data",
            self.name()
        )))
    }

    /// Release handles, mappings, and other underlying resources.
    fn dispose(&self) {}
}

/// Why an unmounted reader cannot be parsed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockReason {
    /// No directory index; a key cannot substitute for it.
    MissingDirectoryIndex,
    /// Encrypted and waiting for the key with this id.
    NeedsKey(Option<KeyId>),
}

/// Observable state of a registered reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReaderState {
    /// Cannot be parsed with what the provider currently has.
    Blocked(BlockReason),
    /// Eligible for the next `mount()` call.
    Ready,
    /// Merged into the file index. Terminal.
    Mounted,
}

/// A registered reader, as held by the provider.
///
/// Wraps the external [`ArchiveReader`] with its provider-assigned id and the
/// key that eventually unlocked it.
pub struct VfsReader {
    id: ReaderId,
    name: Arc<str>,
    inner: Arc<dyn ArchiveReader>,
    resolved_key: OnceLock<AesKey>,
}

impl VfsReader {
    pub(crate) fn new(id: ReaderId, inner: Arc<dyn ArchiveReader>) -> Self {
        Self {
            id,
            name: Arc::from(inner.name()),
            inner,
            resolved_key: OnceLock::new(),
        }
    }

    pub fn id(&self) -> ReaderId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.is_encrypted()
    }

    pub fn has_directory_index(&self) -> bool {
        self.inner.has_directory_index()
    }

    pub fn encryption_key_id(&self) -> Option<KeyId> {
        self.inner.encryption_key_id()
    }

    /// Key that unlocked this reader, once a keyed mount succeeded.
    pub fn resolved_key(&self) -> Option<&AesKey> {
        self.resolved_key.get()
    }

    /// The underlying format-specific reader.
    pub fn inner(&self) -> &Arc<dyn ArchiveReader> {
        &self.inner
    }

    /// Short name used in log lines: the last path component.
    pub fn display_name(&self) -> String {
        self.path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.to_string())
    }

    /// Why this reader cannot be parsed yet, ignoring registry state.
    pub fn block_reason(&self) -> Option<BlockReason> {
        if !self.has_directory_index() {
            Some(BlockReason::MissingDirectoryIndex)
        } else if self.is_encrypted() {
            Some(BlockReason::NeedsKey(self.encryption_key_id()))
        } else {
            None
        }
    }

    /// Mount into `index`, attributing entries to this reader.
    pub(crate) fn mount_into(
        &self,
        index: &FileIndex,
        key: Option<&AesKey>,
    ) -> Result<(), MountError> {
        let writer = index.writer(self.id, Arc::clone(&self.name));
        self.inner.mount_to(&writer, index.case_sensitivity(), key)
    }

    pub(crate) fn record_key(&self, key: AesKey) {
        let _ = self.resolved_key.set(key);
    }
}

impl fmt::Debug for VfsReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VfsReader")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("path", &self.path())
            .field("encrypted", &self.is_encrypted())
            .field("has_directory_index", &self.has_directory_index())
            .field("encryption_key_id", &self.encryption_key_id())
            .finish()
    }
}
