//! uevfs - Merged file catalog over packaged game-data containers
//!
//! This library drives the mount lifecycle of pak-style and IoStore-style
//! containers: deciding which can be parsed now, parsing them concurrently,
//! merging their contents into one path index, and re-attempting encrypted
//! containers as AES keys arrive.
//!
//! Container parsing itself lives behind the [`ArchiveReader`] trait.
//!
//! # Quick Start
//!
//! ```ignore
//! use uevfs::{ConfigFile, VfsFileProvider};
//!
//! let config = ConfigFile::load()?;
//! let provider = VfsFileProvider::from_config_file(&config);
//! provider.register_all(open_containers("/Game/Content/Paks")?);
//!
//! provider.mount()?;
//! provider.submit_config_keys(&config)?;
//!
//! println!("{} files indexed", provider.files().len());
//! ```

pub mod config;
pub mod error;
pub mod global_data;
pub mod index;
pub mod keys;
pub mod logging;
pub mod provider;
pub mod reader;
pub mod registry;

pub use config::{ConfigFile, ProviderConfig};
pub use error::{MountError, VfsError, VfsResult};
pub use global_data::{GlobalData, GlobalDataCache};
pub use index::{CaseSensitivity, FileEntry, FileIndex, GameFile, IndexWriter, PackageId};
pub use keys::{AesKey, KeyId, KeyStore};
pub use logging::{init_logging, LoggingConfig};
pub use provider::{ProviderStatus, VfsFileProvider};
pub use reader::{ArchiveReader, BlockReason, ReaderId, ReaderState, VfsReader};
pub use registry::{MountRegistry, MountState};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
