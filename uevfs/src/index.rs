//! Merged file catalog shared by all mounted containers.
//!
//! The [`FileIndex`] maps logical paths (and package ids) to [`GameFile`]
//! entries. Mounted readers write into it concurrently through an
//! [`IndexWriter`], which stamps every entry with the owning reader.
//!
//! # Merge Policy
//!
//! When two containers contribute the same logical path, the most recent
//! insert wins and silently replaces the earlier entry. There is no priority
//! ordering; callers needing deterministic precedence sequence their mount
//! calls accordingly.
//!
//! # Path Normalisation
//!
//! Keys are normalised before insert and lookup: backslashes become `/` and
//! leading slashes are stripped. In [`CaseSensitivity::Insensitive`] mode the
//! key is also lowercased. The entry itself keeps the path as the container
//! reported it.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::reader::ReaderId;

/// Path matching mode, fixed when the index is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CaseSensitivity {
    /// Paths must match exactly.
    #[default]
    Sensitive,
    /// Paths match regardless of ASCII/Unicode case.
    Insensitive,
}

impl CaseSensitivity {
    /// Build from an "is case insensitive" flag.
    pub fn from_insensitive(insensitive: bool) -> Self {
        if insensitive {
            CaseSensitivity::Insensitive
        } else {
            CaseSensitivity::Sensitive
        }
    }

    /// Check if this is the case-insensitive mode.
    pub fn is_insensitive(&self) -> bool {
        matches!(self, CaseSensitivity::Insensitive)
    }

    /// Normalise a logical path into an index key.
    pub fn normalize(&self, path: &str) -> String {
        let path = path.replace('\\', "/");
        let path = path.trim_start_matches('/');
        match self {
            CaseSensitivity::Sensitive => path.to_string(),
            CaseSensitivity::Insensitive => path.to_lowercase(),
        }
    }
}

impl fmt::Display for CaseSensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseSensitivity::Sensitive => write!(f, "case-sensitive"),
            CaseSensitivity::Insensitive => write!(f, "case-insensitive"),
        }
    }
}

/// 64-bit package identifier used by IoStore containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageId(pub u64);

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// File metadata reported by a container reader.
///
/// Offsets and sizes are opaque to the index; they only mean something to
/// the reader that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub package_id: Option<PackageId>,
    pub offset: u64,
    pub size: u64,
    pub uncompressed_size: u64,
}

impl FileEntry {
    /// Create an entry for `path` with zeroed location metadata.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            package_id: None,
            offset: 0,
            size: 0,
            uncompressed_size: 0,
        }
    }

    /// Set the package id.
    pub fn with_package_id(mut self, id: PackageId) -> Self {
        self.package_id = Some(id);
        self
    }

    /// Set the byte range inside the container.
    pub fn with_range(mut self, offset: u64, size: u64) -> Self {
        self.offset = offset;
        self.size = size;
        if self.uncompressed_size == 0 {
            self.uncompressed_size = size;
        }
        self
    }

    /// Set the uncompressed size.
    pub fn with_uncompressed_size(mut self, size: u64) -> Self {
        self.uncompressed_size = size;
        self
    }
}

/// An indexed file, immutable once inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameFile {
    /// Logical path as reported by the container.
    pub path: String,
    pub package_id: Option<PackageId>,
    pub offset: u64,
    pub size: u64,
    pub uncompressed_size: u64,
    /// Reader that contributed this entry.
    pub reader: ReaderId,
    /// Name of the contributing reader.
    pub reader_name: Arc<str>,
}

impl GameFile {
    /// Build an indexed file from reader metadata.
    pub fn from_entry(entry: FileEntry, reader: ReaderId, reader_name: Arc<str>) -> Self {
        Self {
            path: entry.path,
            package_id: entry.package_id,
            offset: entry.offset,
            size: entry.size,
            uncompressed_size: entry.uncompressed_size,
            reader,
            reader_name,
        }
    }

    /// File extension without the dot, if any.
    pub fn extension(&self) -> Option<&str> {
        let name = self.path.rsplit('/').next().unwrap_or(&self.path);
        name.rsplit_once('.').map(|(_, ext)| ext)
    }
}

/// Concurrent path→file and id→file catalog.
///
/// Single-entry insertion is the atomic unit: a lookup sees either the old
/// entry or the new one, never a partial write.
pub struct FileIndex {
    by_path: DashMap<String, Arc<GameFile>>,
    by_id: DashMap<PackageId, Arc<GameFile>>,
    case: CaseSensitivity,
}

impl FileIndex {
    /// Create an empty index with the given matching mode.
    pub fn new(case: CaseSensitivity) -> Self {
        Self {
            by_path: DashMap::new(),
            by_id: DashMap::new(),
            case,
        }
    }

    /// Matching mode of this index.
    pub fn case_sensitivity(&self) -> CaseSensitivity {
        self.case
    }

    /// Insert `file` under `path`, replacing any previous entry.
    ///
    /// Returns the replaced entry.
    pub fn insert(&self, path: &str, file: Arc<GameFile>) -> Option<Arc<GameFile>> {
        self.by_path.insert(self.case.normalize(path), file)
    }

    /// Insert `file` under a package id, replacing any previous entry.
    pub fn insert_by_id(&self, id: PackageId, file: Arc<GameFile>) -> Option<Arc<GameFile>> {
        self.by_id.insert(id, file)
    }

    /// Look up a file by logical path.
    pub fn lookup(&self, path: &str) -> Option<Arc<GameFile>> {
        self.by_path
            .get(&self.case.normalize(path))
            .map(|f| Arc::clone(f.value()))
    }

    /// Look up a file by package id.
    pub fn lookup_by_id(&self, id: PackageId) -> Option<Arc<GameFile>> {
        self.by_id.get(&id).map(|f| Arc::clone(f.value()))
    }

    /// Check if a logical path is indexed.
    pub fn contains(&self, path: &str) -> bool {
        self.by_path.contains_key(&self.case.normalize(path))
    }

    /// Number of indexed paths.
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    /// Number of entries indexed by package id.
    pub fn id_count(&self) -> usize {
        self.by_id.len()
    }

    /// Snapshot of every indexed file.
    pub fn files(&self) -> Vec<Arc<GameFile>> {
        self.by_path.iter().map(|f| Arc::clone(f.value())).collect()
    }

    /// Sorted snapshot of the normalised paths.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.by_path.iter().map(|f| f.key().clone()).collect();
        paths.sort();
        paths
    }

    /// Snapshot of files currently attributed to `reader`.
    pub fn files_from(&self, reader: ReaderId) -> Vec<Arc<GameFile>> {
        self.by_path
            .iter()
            .filter(|f| f.value().reader == reader)
            .map(|f| Arc::clone(f.value()))
            .collect()
    }

    /// Create a writer that stamps entries with `reader`.
    pub fn writer(&self, reader: ReaderId, reader_name: Arc<str>) -> IndexWriter<'_> {
        IndexWriter {
            index: self,
            reader,
            reader_name,
        }
    }
}

impl fmt::Debug for FileIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileIndex")
            .field("files", &self.by_path.len())
            .field("ids", &self.by_id.len())
            .field("case", &self.case)
            .finish()
    }
}

/// Handle a mounting reader uses to add its files to the index.
pub struct IndexWriter<'a> {
    index: &'a FileIndex,
    reader: ReaderId,
    reader_name: Arc<str>,
}

impl IndexWriter<'_> {
    /// Add one file, under its path and, if present, its package id.
    pub fn add(&self, entry: FileEntry) {
        let file = Arc::new(GameFile::from_entry(
            entry,
            self.reader,
            Arc::clone(&self.reader_name),
        ));

        if let Some(id) = file.package_id {
            self.index.insert_by_id(id, Arc::clone(&file));
        }
        let path = file.path.clone();
        self.index.insert(&path, file);
    }

    /// Matching mode of the target index.
    pub fn case_sensitivity(&self) -> CaseSensitivity {
        self.index.case_sensitivity()
    }

    /// The reader this writer attributes entries to.
    pub fn reader(&self) -> ReaderId {
        self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn file(path: &str, reader: u64) -> Arc<GameFile> {
        Arc::new(GameFile::from_entry(
            FileEntry::new(path),
            ReaderId(reader),
            Arc::from(format!("reader{}", reader)),
        ))
    }

    #[test]
    fn test_normalize_strips_leading_slash_and_backslashes() {
        let case = CaseSensitivity::Sensitive;
        assert_eq!(case.normalize("/Game\\Content/Map.umap"), "Game/Content/Map.umap");
    }

    #[test]
    fn test_normalize_insensitive_lowercases() {
        let case = CaseSensitivity::Insensitive;
        assert_eq!(case.normalize("Game/Content/Map.UMAP"), "game/content/map.umap");
    }

    #[test]
    fn test_case_sensitive_lookup() {
        let index = FileIndex::new(CaseSensitivity::Sensitive);
        index.insert("Game/A.uasset", file("Game/A.uasset", 1));

        assert!(index.lookup("Game/A.uasset").is_some());
        assert!(index.lookup("game/a.uasset").is_none());
    }

    #[test]
    fn test_case_insensitive_lookup_keeps_original_path() {
        let index = FileIndex::new(CaseSensitivity::Insensitive);
        index.insert("Game/A.uasset", file("Game/A.uasset", 1));

        let found = index.lookup("GAME/a.UASSET").unwrap();
        assert_eq!(found.path, "Game/A.uasset");
    }

    #[test]
    fn test_last_writer_wins() {
        let index = FileIndex::new(CaseSensitivity::Sensitive);
        assert!(index.insert("Game/A.uasset", file("Game/A.uasset", 1)).is_none());

        let replaced = index.insert("Game/A.uasset", file("Game/A.uasset", 2));
        assert_eq!(replaced.unwrap().reader, ReaderId(1));
        assert_eq!(index.lookup("Game/A.uasset").unwrap().reader, ReaderId(2));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_writer_indexes_by_id_and_stamps_owner() {
        let index = FileIndex::new(CaseSensitivity::Sensitive);
        let writer = index.writer(ReaderId(9), Arc::from("pakchunk0.utoc"));

        writer.add(
            FileEntry::new("Game/B.uasset")
                .with_package_id(PackageId(42))
                .with_range(128, 64),
        );

        let by_path = index.lookup("Game/B.uasset").unwrap();
        let by_id = index.lookup_by_id(PackageId(42)).unwrap();
        assert!(Arc::ptr_eq(&by_path, &by_id));
        assert_eq!(by_path.reader, ReaderId(9));
        assert_eq!(&*by_path.reader_name, "pakchunk0.utoc");
        assert_eq!(by_path.offset, 128);
        assert_eq!(by_path.uncompressed_size, 64);
        assert_eq!(index.id_count(), 1);
    }

    #[test]
    fn test_files_from_reader() {
        let index = FileIndex::new(CaseSensitivity::Sensitive);
        index.insert("a", file("a", 1));
        index.insert("b", file("b", 2));
        index.insert("c", file("c", 1));

        assert_eq!(index.files_from(ReaderId(1)).len(), 2);
        assert_eq!(index.paths(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_extension() {
        assert_eq!(file("Game/Maps/L.umap", 1).extension(), Some("umap"));
        assert_eq!(file("Game/README", 1).extension(), None);
    }

    #[test]
    fn test_concurrent_inserts() {
        let index = Arc::new(FileIndex::new(CaseSensitivity::Insensitive));

        let handles: Vec<_> = (0..8u64)
            .map(|r| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    let writer = index.writer(ReaderId(r), Arc::from("reader"));
                    for i in 0..250 {
                        writer.add(FileEntry::new(format!("Game/R{}/F{}.uasset", r, i)));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(index.len(), 2000);
        assert!(index.contains("game/r7/f249.uasset"));
    }

    proptest! {
        #[test]
        fn prop_insensitive_lookup_ignores_case(path in "[A-Za-z0-9_]{1,12}(/[A-Za-z0-9_]{1,12}){0,3}\\.[a-z]{3,6}") {
            let index = FileIndex::new(CaseSensitivity::Insensitive);
            index.insert(&path, file(&path, 1));

            prop_assert!(index.lookup(&path.to_uppercase()).is_some());
            prop_assert!(index.lookup(&path.to_lowercase()).is_some());
            let slashed = format!("/{}", path);
            prop_assert!(index.lookup(&slashed).is_some());
        }

        #[test]
        fn prop_sensitive_lookup_is_exact(path in "[a-z]{1,12}/[A-Z]{1,12}\\.uasset") {
            let index = FileIndex::new(CaseSensitivity::Sensitive);
            index.insert(&path, file(&path, 1));

            prop_assert!(index.lookup(&path).is_some());
            prop_assert!(index.lookup(&path.to_lowercase()).is_none());
        }
    }
}
