//! Integration tests for the mount lifecycle.
//!
//! These tests drive a [`VfsFileProvider`] through realistic sequences of
//! `mount` and `submit_keys` calls using scripted containers:
//! - Unencrypted, encrypted, index-less and corrupt containers
//! - Keys arriving late, wrong, or in batches
//! - Concurrent orchestrator calls over the same containers
//!
//! Run with: `cargo test --test mount_lifecycle`

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uevfs::global_data::{PackageObjectIndex, ScriptObjectEntry};
use uevfs::{
    AesKey, ArchiveReader, BlockReason, CaseSensitivity, FileEntry, GlobalData, IndexWriter,
    KeyId, MountError, PackageId, ProviderConfig, ReaderState, VfsFileProvider,
};

// ============================================================================
// Helper Functions
// ============================================================================

const G1: KeyId = KeyId::new(0x1111_1111, 0x2222_2222, 0x3333_3333, 0x4444_4444);
const G2: KeyId = KeyId::new(0, 0, 0, 2);

fn correct_key() -> AesKey {
    AesKey::new([0x42; 32])
}

fn wrong_key() -> AesKey {
    AesKey::new([0x13; 32])
}

/// How a scripted container behaves once its key checks out.
#[derive(Clone, Copy)]
enum Behavior {
    Parse,
    Corrupt,
    Panic,
    /// Reports a key mismatch even without a key.
    RejectKey,
}

/// Scripted container.
struct ScriptedReader {
    name: String,
    path: PathBuf,
    key_id: Option<KeyId>,
    indexed: bool,
    behavior: Behavior,
    files: Vec<String>,
    delay: Duration,
    global_delay: Duration,
    parses: AtomicUsize,
    global_reads: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedReader {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: PathBuf::from(format!("/Game/Content/Paks/{}", name)),
            key_id: None,
            indexed: true,
            behavior: Behavior::Parse,
            files: vec![format!("Game/{}/Asset.uasset", name)],
            delay: Duration::ZERO,
            global_delay: Duration::ZERO,
            parses: AtomicUsize::new(0),
            global_reads: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn encrypted(mut self, id: KeyId) -> Self {
        self.key_id = Some(id);
        self
    }

    fn without_index(mut self) -> Self {
        self.indexed = false;
        self
    }

    fn behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    fn files(mut self, files: &[&str]) -> Self {
        self.files = files.iter().map(|f| f.to_string()).collect();
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn global_delay(mut self, delay: Duration) -> Self {
        self.global_delay = delay;
        self
    }

    fn track_concurrency(mut self, in_flight: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>) -> Self {
        self.in_flight = Arc::clone(in_flight);
        self.peak = Arc::clone(peak);
        self
    }

    fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn parses(&self) -> usize {
        self.parses.load(Ordering::SeqCst)
    }
}

impl ArchiveReader for ScriptedReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn is_encrypted(&self) -> bool {
        self.key_id.is_some()
    }

    fn has_directory_index(&self) -> bool {
        self.indexed
    }

    fn encryption_key_id(&self) -> Option<KeyId> {
        self.key_id
    }

    fn mount_to(
        &self,
        index: &IndexWriter<'_>,
        _case: CaseSensitivity,
        key: Option<&AesKey>,
    ) -> Result<(), MountError> {
        if self.key_id.is_some() && key != Some(&correct_key()) {
            return Err(MountError::InvalidKey);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.parses.fetch_add(1, Ordering::SeqCst);

        match self.behavior {
            Behavior::Parse => {
                for (i, file) in self.files.iter().enumerate() {
                    index.add(FileEntry::new(file.clone()).with_range(i as u64 * 0x1000, 0x1000));
                }
                Ok(())
            }
            Behavior::Corrupt => Err(MountError::Parse("directory index checksum mismatch".into())),
            Behavior::Panic => panic!("reader exploded"),
            Behavior::RejectKey => Err(MountError::InvalidKey),
        }
    }

    fn read_global_data(&self) -> Result<GlobalData, MountError> {
        self.global_reads.fetch_add(1, Ordering::SeqCst);
        if !self.global_delay.is_zero() {
            std::thread::sleep(self.global_delay);
        }
        Ok(GlobalData::new(
            self.name.clone(),
            vec!["/Script/CoreUObject".to_string(), "Object".to_string()],
            vec![ScriptObjectEntry {
                object_name: 1,
                global_index: PackageObjectIndex(7),
                outer_index: PackageObjectIndex::NULL,
                cdo_class_index: PackageObjectIndex::NULL,
            }],
        ))
    }
}

fn provider() -> VfsFileProvider {
    VfsFileProvider::new(ProviderConfig::default())
}

// ============================================================================
// Integration Tests
// ============================================================================

/// A mounts on `mount`, B mounts on key submission, corrupt C stays behind.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_plain_then_keyed_with_corrupt_sibling() {
    let provider = provider();
    let a = ScriptedReader::new("A.pak").build();
    let b = ScriptedReader::new("B.pak").encrypted(G1).build();
    let c = ScriptedReader::new("C.pak")
        .encrypted(G1)
        .behavior(Behavior::Corrupt)
        .build();

    let a_handle = provider.register(a.clone());
    let b_handle = provider.register(b.clone());
    let c_handle = provider.register(c.clone());
    assert_eq!(provider.required_keys(), vec![G1]);

    assert_eq!(provider.mount_async().await, 1);
    assert_eq!(provider.reader_state(a_handle.id()), Some(ReaderState::Mounted));
    assert_eq!(b.parses(), 0);

    assert_eq!(provider.submit_key_async(G1, correct_key()).await, 1);

    assert_eq!(provider.reader_state(b_handle.id()), Some(ReaderState::Mounted));
    assert_eq!(
        provider.reader_state(c_handle.id()),
        Some(ReaderState::Blocked(BlockReason::NeedsKey(Some(G1))))
    );
    assert_eq!(c.parses(), 1);

    assert!(provider.required_keys().is_empty());
    assert_eq!(provider.keys().get(&G1), Some(&correct_key()));
    assert_eq!(b_handle.resolved_key(), Some(&correct_key()));
    assert_eq!(c_handle.resolved_key(), None);

    let mounted: Vec<_> = provider.mounted_readers().iter().map(|r| r.id()).collect();
    assert_eq!(mounted, vec![a_handle.id(), b_handle.id()]);
    assert_eq!(provider.unmounted_readers_by_key(G1).len(), 1);
}

#[tokio::test]
async fn test_readers_without_index_never_mount() {
    let provider = provider();
    let plain = ScriptedReader::new("bare.pak").without_index().build();
    let keyed = ScriptedReader::new("bare_keyed.pak")
        .encrypted(G1)
        .without_index()
        .build();

    provider.register(plain.clone());
    let keyed_handle = provider.register(keyed.clone());

    assert_eq!(provider.mount_async().await, 0);
    assert_eq!(provider.submit_key_async(G1, correct_key()).await, 0);
    assert_eq!(provider.mount_async().await, 0);

    assert_eq!(plain.parses() + keyed.parses(), 0);
    assert_eq!(provider.mounted_readers().len(), 0);
    assert_eq!(
        provider.reader_state(keyed_handle.id()),
        Some(ReaderState::Blocked(BlockReason::MissingDirectoryIndex))
    );
}

#[tokio::test]
async fn test_unencrypted_reader_mounts_exactly_once() {
    let provider = provider();
    let reader = ScriptedReader::new("pakchunk0.pak").build();
    provider.register(reader.clone());

    assert_eq!(provider.mount_async().await, 1);
    assert_eq!(provider.mount_async().await, 0);
    assert_eq!(provider.mount_async().await, 0);

    assert_eq!(reader.parses(), 1);
}

#[tokio::test]
async fn test_correct_key_mounts_whole_eligible_set() {
    let provider = provider();
    for i in 0..5 {
        provider.register(ScriptedReader::new(&format!("chunk{}.pak", i)).encrypted(G1).build());
    }
    provider.register(ScriptedReader::new("other.pak").encrypted(G2).build());
    provider.register(ScriptedReader::new("noindex.pak").encrypted(G1).without_index().build());

    assert_eq!(provider.submit_key_async(G1, correct_key()).await, 5);
    assert_eq!(provider.required_keys(), vec![G2]);
    assert_eq!(provider.files().len(), 5);
}

#[tokio::test]
async fn test_wrong_key_mounts_nothing() {
    let provider = provider();
    let reader = ScriptedReader::new("locked.pak").encrypted(G1).build();
    let handle = provider.register(reader.clone());

    assert_eq!(provider.submit_key_async(G1, wrong_key()).await, 0);

    assert_eq!(provider.required_keys(), vec![G1]);
    assert!(provider.keys().is_empty());
    assert_eq!(handle.resolved_key(), None);
    assert_eq!(provider.unmounted_readers().len(), 1);

    // The right key still works afterwards
    assert_eq!(provider.submit_key_async(G1, correct_key()).await, 1);
}

#[tokio::test]
async fn test_batch_submission_counts_across_ids() {
    let provider = provider();
    provider.register(ScriptedReader::new("g1.pak").encrypted(G1).build());
    provider.register(ScriptedReader::new("g2.pak").encrypted(G2).build());
    provider.register(ScriptedReader::new("g2_p.pak").encrypted(G2).build());

    let mounted = provider
        .submit_keys_async([(G1, correct_key()), (G2, correct_key())])
        .await;

    assert_eq!(mounted, 3);
    assert!(provider.required_keys().is_empty());
    assert_eq!(provider.keys().len(), 2);
}

#[tokio::test]
async fn test_global_data_computed_once() {
    let provider = provider();
    let global = ScriptedReader::new("Global.utoc")
        .encrypted(KeyId::MAIN)
        .without_index()
        .build();
    provider.register(global.clone());
    provider.register(ScriptedReader::new("plain.pak").build());

    assert!(provider.global_data().is_none());

    provider.mount_async().await;
    provider.mount_async().await;
    provider.submit_key_async(KeyId::MAIN, correct_key()).await;

    let data = provider.global_data().expect("global data should be set");
    assert_eq!(data.source(), "Global.utoc");
    assert_eq!(data.script_object_name(PackageObjectIndex(7)), Some("Object"));
    assert_eq!(global.global_reads.load(Ordering::SeqCst), 1);
    assert!(provider.status().global_data_loaded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_never_double_mount() {
    let provider = Arc::new(provider());
    let mut readers = Vec::new();
    for i in 0..12 {
        let reader = ScriptedReader::new(&format!("plain{}.pak", i))
            .delay(Duration::from_millis(2))
            .build();
        provider.register(reader.clone());
        readers.push(reader);
    }
    for i in 0..12 {
        let reader = ScriptedReader::new(&format!("keyed{}.pak", i))
            .encrypted(G1)
            .delay(Duration::from_millis(2))
            .build();
        provider.register(reader.clone());
        readers.push(reader);
    }

    let calls: Vec<_> = (0..4)
        .map(|i| {
            let provider = Arc::clone(&provider);
            tokio::spawn(async move {
                if i % 2 == 0 {
                    provider.mount_async().await
                } else {
                    provider.submit_key_async(G1, correct_key()).await
                }
            })
        })
        .collect();

    let mut total = 0;
    for call in calls {
        total += call.await.unwrap();
    }

    assert_eq!(total, 24);
    assert_eq!(provider.mounted_readers().len(), 24);
    assert!(provider.unmounted_readers().is_empty());
    assert!(readers.iter().all(|r| r.parses() >= 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_key_submissions_record_key_once() {
    let provider = provider();
    let slow = ScriptedReader::new("slow.pak")
        .encrypted(G1)
        .delay(Duration::from_millis(50))
        .build();
    let corrupt = ScriptedReader::new("corrupt.pak")
        .encrypted(G1)
        .behavior(Behavior::Corrupt)
        .build();
    let slow_handle = provider.register(slow.clone());
    let corrupt_handle = provider.register(corrupt.clone());

    let (first, second) = tokio::join!(
        provider.submit_key_async(G1, correct_key()),
        provider.submit_key_async(G1, correct_key()),
    );

    // Both calls parsed the slow container; only one may count it
    assert_eq!(slow.parses(), 2);
    assert_eq!(first + second, 1);

    assert_eq!(provider.reader_state(slow_handle.id()), Some(ReaderState::Mounted));
    assert_eq!(slow_handle.resolved_key(), Some(&correct_key()));
    assert_eq!(provider.keys().len(), 1);
    assert_eq!(provider.keys().get(&G1), Some(&correct_key()));
    assert!(provider.required_keys().is_empty());

    assert_eq!(corrupt.parses(), 2);
    assert_eq!(corrupt_handle.resolved_key(), None);
    assert_eq!(provider.unmounted_readers_by_key(G1).len(), 1);
}

#[tokio::test]
async fn test_late_reader_with_resolved_key_is_required() {
    let provider = provider();
    provider.register(ScriptedReader::new("early.pak").encrypted(G1).build());
    assert_eq!(provider.submit_key_async(G1, correct_key()).await, 1);
    assert!(provider.required_keys().is_empty());

    let late = provider.register(ScriptedReader::new("late.pak").encrypted(G1).build());
    assert_eq!(provider.required_keys(), vec![G1]);

    assert_eq!(provider.mount_async().await, 0);
    assert_eq!(
        provider.reader_state(late.id()),
        Some(ReaderState::Blocked(BlockReason::NeedsKey(Some(G1))))
    );
    assert_eq!(provider.required_keys(), vec![G1]);

    assert_eq!(provider.submit_key_async(G1, correct_key()).await, 1);
    assert!(provider.required_keys().is_empty());
}

#[tokio::test]
async fn test_unkeyed_reader_rejecting_key_stays_ready() {
    let provider = provider();
    let odd = ScriptedReader::new("odd.pak")
        .behavior(Behavior::RejectKey)
        .build();
    let handle = provider.register(odd.clone());

    assert_eq!(provider.mount_async().await, 0);
    assert_eq!(odd.parses(), 1);
    assert_eq!(provider.reader_state(handle.id()), Some(ReaderState::Ready));
    assert!(provider.files().is_empty());
    assert!(provider.mounted_readers().is_empty());
}

/// Building global data must not stall other tasks on the runtime.
#[tokio::test]
async fn test_global_data_build_does_not_block_runtime() {
    let provider = provider();
    provider.register(
        ScriptedReader::new("global.utoc")
            .encrypted(KeyId::MAIN)
            .without_index()
            .global_delay(Duration::from_millis(200))
            .build(),
    );

    let ticks = Arc::new(AtomicUsize::new(0));
    let ticker = {
        let ticks = Arc::clone(&ticks);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(10));
            loop {
                interval.tick().await;
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    assert_eq!(provider.mount_async().await, 0);
    ticker.abort();

    assert!(provider.global_data().is_some());
    assert!(ticks.load(Ordering::SeqCst) >= 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_bound_is_respected() {
    let provider = VfsFileProvider::new(ProviderConfig::default().with_max_concurrent_mounts(2));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for i in 0..10 {
        provider.register(
            ScriptedReader::new(&format!("chunk{}.pak", i))
                .delay(Duration::from_millis(5))
                .track_concurrency(&in_flight, &peak)
                .build(),
        );
    }

    assert_eq!(provider.mount_async().await, 10);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_panicking_reader_is_a_parse_failure() {
    let provider = provider();
    let bomb = provider.register(ScriptedReader::new("bomb.pak").behavior(Behavior::Panic).build());
    provider.register(ScriptedReader::new("fine.pak").build());

    assert_eq!(provider.mount_async().await, 1);
    assert_eq!(provider.reader_state(bomb.id()), Some(ReaderState::Ready));
}

#[tokio::test]
async fn test_last_writer_wins_on_path_conflict() {
    let provider = provider();
    provider.register(
        ScriptedReader::new("base.pak")
            .files(&["Game/Maps/Entry.umap"])
            .build(),
    );
    provider.mount_async().await;

    let patch = provider.register(
        ScriptedReader::new("base_p.pak")
            .files(&["Game/Maps/Entry.umap"])
            .build(),
    );
    provider.mount_async().await;

    let file = provider.lookup("Game/Maps/Entry.umap").unwrap();
    assert_eq!(file.reader, patch.id());
    assert_eq!(&*file.reader_name, "base_p.pak");
    assert_eq!(provider.files().len(), 1);
}

#[tokio::test]
async fn test_case_insensitive_lookup() {
    let provider = VfsFileProvider::new(
        ProviderConfig::default().with_case_sensitivity(CaseSensitivity::Insensitive),
    );
    provider.register(
        ScriptedReader::new("chunk.pak")
            .files(&["Game/Characters/Hero.uasset"])
            .build(),
    );
    provider.mount_async().await;

    let file = provider.lookup("game/characters/HERO.uasset").unwrap();
    assert_eq!(file.path, "Game/Characters/Hero.uasset");
    assert!(provider.lookup_by_id(PackageId(1)).is_none());
}

#[test]
fn test_blocking_facade() {
    let provider = provider();
    provider.register(ScriptedReader::new("A.pak").build());
    provider.register(ScriptedReader::new("B.pak").encrypted(G1).build());

    assert_eq!(provider.mount().unwrap(), 1);
    assert_eq!(provider.submit_key(G1, wrong_key()).unwrap(), 0);
    assert_eq!(provider.submit_keys([(G1, correct_key())]).unwrap(), 1);

    let status = provider.status();
    assert_eq!(status.mounted, 2);
    assert_eq!(status.unmounted, 0);
    assert_eq!(status.files, 2);
}

#[test]
fn test_dispose_releases_mounted_readers() {
    struct Disposable {
        inner: ScriptedReader,
        disposed: Arc<AtomicUsize>,
    }

    impl ArchiveReader for Disposable {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn path(&self) -> &Path {
            self.inner.path()
        }
        fn is_encrypted(&self) -> bool {
            self.inner.is_encrypted()
        }
        fn has_directory_index(&self) -> bool {
            self.inner.has_directory_index()
        }
        fn encryption_key_id(&self) -> Option<KeyId> {
            self.inner.encryption_key_id()
        }
        fn mount_to(
            &self,
            index: &IndexWriter<'_>,
            case: CaseSensitivity,
            key: Option<&AesKey>,
        ) -> Result<(), MountError> {
            self.inner.mount_to(index, case, key)
        }
        fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    let disposed = Arc::new(AtomicUsize::new(0));
    let provider = provider();
    for name in ["a.pak", "b.pak"] {
        provider.register(Arc::new(Disposable {
            inner: ScriptedReader::new(name),
            disposed: Arc::clone(&disposed),
        }));
    }
    provider.register(Arc::new(Disposable {
        inner: ScriptedReader::new("locked.pak").encrypted(G1),
        disposed: Arc::clone(&disposed),
    }));

    provider.mount().unwrap();
    provider.dispose();
    assert!(provider.is_disposed());
    drop(provider);

    assert_eq!(disposed.load(Ordering::SeqCst), 2);
}
