//! Engine-global metadata read from the distinguished global container.
//!
//! IoStore games ship one container (by default `global.utoc`) holding the
//! global name map and the script-object table that every package refers to.
//! The [`GlobalDataCache`] builds [`GlobalData`] from that container the first
//! time it is offered, whether or not the container itself can be mounted.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{VfsError, VfsResult};
use crate::reader::VfsReader;

/// Default name of the global container.
pub const DEFAULT_GLOBAL_CONTAINER: &str = "global.utoc";

/// Index of an object in the global script-object table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageObjectIndex(pub u64);

impl PackageObjectIndex {
    /// Index value meaning "no object".
    pub const NULL: PackageObjectIndex = PackageObjectIndex(u64::MAX);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for PackageObjectIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// One entry of the script-object table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptObjectEntry {
    /// Index into the global name map.
    pub object_name: u32,
    pub global_index: PackageObjectIndex,
    pub outer_index: PackageObjectIndex,
    pub cdo_class_index: PackageObjectIndex,
}

/// Read-only engine-global metadata.
#[derive(Debug, Clone)]
pub struct GlobalData {
    source: String,
    name_map: Vec<String>,
    script_objects: HashMap<PackageObjectIndex, ScriptObjectEntry>,
}

impl GlobalData {
    /// Build global data from a name map and the script-object table.
    ///
    /// Entries are keyed by their `global_index`; a later duplicate replaces
    /// an earlier one.
    pub fn new(
        source: impl Into<String>,
        name_map: Vec<String>,
        entries: impl IntoIterator<Item = ScriptObjectEntry>,
    ) -> Self {
        let script_objects = entries
            .into_iter()
            .map(|entry| (entry.global_index, entry))
            .collect();

        Self {
            source: source.into(),
            name_map,
            script_objects,
        }
    }

    /// Name of the container this was read from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn name_map(&self) -> &[String] {
        &self.name_map
    }

    pub fn script_object_count(&self) -> usize {
        self.script_objects.len()
    }

    /// Look up a script object by its global index.
    pub fn script_object(&self, index: PackageObjectIndex) -> Option<&ScriptObjectEntry> {
        self.script_objects.get(&index)
    }

    /// Resolve the name of a script object through the name map.
    pub fn script_object_name(&self, index: PackageObjectIndex) -> Option<&str> {
        let entry = self.script_object(index)?;
        self.name_map
            .get(entry.object_name as usize)
            .map(String::as_str)
    }

    /// Resolve the name of a script object's outer, if it has one.
    pub fn outer_name(&self, index: PackageObjectIndex) -> Option<&str> {
        let entry = self.script_object(index)?;
        if entry.outer_index.is_null() {
            return None;
        }
        self.script_object_name(entry.outer_index)
    }
}

/// At-most-once cell for [`GlobalData`].
///
/// Offers are cheap for every reader except the global container. Offers of
/// the global container are serialised so the data is never built twice.
#[derive(Debug)]
pub struct GlobalDataCache {
    container_name: String,
    slot: Mutex<Option<Arc<GlobalData>>>,
}

impl GlobalDataCache {
    /// Create an empty cache matching readers named `container_name`.
    pub fn new(container_name: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            slot: Mutex::new(None),
        }
    }

    /// Name the global container is matched against (case-insensitively).
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Check if `reader` is the global container.
    pub fn matches(&self, reader: &VfsReader) -> bool {
        reader.name().eq_ignore_ascii_case(&self.container_name)
    }

    /// Offer a reader. Builds and stores global data if the cache is unset
    /// and the reader is the global container.
    ///
    /// Returns whether global data was newly set by this call. A failed build
    /// is logged and leaves the cache unset, so a later offer may retry.
    pub fn try_compute(&self, reader: &VfsReader) -> bool {
        match self.compute(reader) {
            Ok(newly_set) => newly_set,
            Err(e) => {
                warn!(reader = %reader.display_name(), error = %e, "Failed to read global data");
                false
            }
        }
    }

    /// Like [`try_compute`](Self::try_compute), but reports build failures.
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::GlobalData`] if the global container could not
    /// produce its metadata.
    pub fn compute(&self, reader: &VfsReader) -> VfsResult<bool> {
        if !self.matches(reader) {
            return Ok(false);
        }

        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Ok(false);
        }

        let data = reader
            .inner()
            .read_global_data()
            .map_err(|source| VfsError::GlobalData {
                reader: reader.name().to_string(),
                source,
            })?;

        info!(
            reader = %reader.display_name(),
            names = data.name_map().len(),
            script_objects = data.script_object_count(),
            "Loaded global data"
        );
        *slot = Some(Arc::new(data));
        Ok(true)
    }

    /// The global data, once computed.
    pub fn get(&self) -> Option<Arc<GlobalData>> {
        self.slot.lock().clone()
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl Default for GlobalDataCache {
    fn default() -> Self {
        Self::new(DEFAULT_GLOBAL_CONTAINER)
    }
}
