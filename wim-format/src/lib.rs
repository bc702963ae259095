mod builder;
mod compression;
mod de;
mod error;
pub mod extract;
mod file;
pub mod fs;
mod hash;
mod header;
mod integrity;
mod lookup_table;
mod metadata;
pub mod path;
pub mod reparse;
mod resource;
mod ser;
pub mod tree;
mod xml;

pub use builder::{hash_file, ImageBuilder};
pub use compression::Compression;
pub use error::{Error, Result};
pub use extract::{ExtractCommand, ExtractFlags, ExtractOptions, ExtractProgress, ProgressMsg};
pub use file::{ImageSelector, Wim, WriteFlags};
pub use hash::{Sha1Hash, SHA1_LEN};
pub use header::{HeaderFlags, ResourceEntry, ResourceFlags, WimHeader};
pub use integrity::{IntegrityTable, INTEGRITY_CHUNK_SIZE};
pub use lookup_table::{LookupTable, LookupTableEntry, Stream, StreamId, StreamSource};
pub use metadata::SecurityData;
pub use path::WimPath;
pub use resource::{copy_stream_to, read_stream};
pub use tree::{Dentry, DentryId, DentryTree, FileAttributes, Inode, InodeId, Timestamps};
pub use xml::{ImageInfo, WimInfo};
