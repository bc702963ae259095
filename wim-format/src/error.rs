use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unsupported: {0}")]
    UnsupportedFeature(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(#[from] std::collections::TryReserveError),

    #[error("Path does not exist in the image: '{0}'")]
    PathNotFound(String),

    #[error("Not a regular file: '{0}'")]
    NotARegularFile(String),

    #[error("Target is not a directory. Path: '{}'", .0.display())]
    NotADirectory(PathBuf),

    #[error("Stat failed. Path: '{}'", .1.display())]
    Stat(#[source] std::io::Error, PathBuf),

    #[error("Creating directory failed. Path: '{}'", .1.display())]
    Mkdir(#[source] std::io::Error, PathBuf),

    #[error("Opening file failed. Path: '{}'", .1.display())]
    Open(#[source] std::io::Error, PathBuf),

    #[error("Reading failed. Path: '{}'", .1.display())]
    Read(#[source] std::io::Error, PathBuf),

    #[error("Writing failed. Path: '{}'", .1.display())]
    Write(#[source] std::io::Error, PathBuf),

    #[error("Link creation failed. Path: '{}'", .1.display())]
    Link(#[source] std::io::Error, PathBuf),

    #[error("Setting timestamps failed. Path: '{}'", .1.display())]
    Timestamps(#[source] std::io::Error, PathBuf),

    #[error("Mounting volume failed. Path: '{}'", .1.display())]
    BackendMount(#[source] std::io::Error, PathBuf),

    #[error("Unmounting volume failed. Path: '{}'", .1.display())]
    BackendUnmount(#[source] std::io::Error, PathBuf),

    #[error("Renaming '{}' to '{}' failed", from.display(), to.display())]
    Rename {
        #[source]
        source: std::io::Error,
        from: PathBuf,
        to: PathBuf,
        /// Set when removing the temporary file failed as well.
        cleanup: Option<std::io::Error>,
    },

    #[error("Image {0} does not exist")]
    InvalidImage(u32),

    #[error("Invalid WIM header")]
    InvalidHeader(#[source] std::io::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Stream {0} is referenced but missing from the lookup table")]
    StreamNotFound(crate::Sha1Hash),

    #[error("Integrity check failed for chunk {chunk}")]
    IntegrityMismatch { chunk: u32 },

    #[error("Split WIM set mismatch: {0}")]
    SplitSetMismatch(String),

    #[error("WIM has no backing file")]
    NoFilename,

    #[error("Extraction was cancelled by the progress callback")]
    Aborted,
}

impl Error {
    pub(crate) fn invalid_data(msg: impl std::fmt::Display) -> Error {
        Error::InvalidData(msg.to_string())
    }
}
