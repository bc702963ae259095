use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot open WIM `{}`", .path.display())]
    OpenArchive {
        path: PathBuf,
        #[source]
        source: wim_format::Error,
    },

    #[error("No image `{image}` in `{}`", .path.display())]
    NoSuchImage { image: String, path: PathBuf },

    #[error("`{}` holds {count} images; name one or pass `all`", .path.display())]
    ImageRequired { path: PathBuf, count: u32 },

    #[error("Cannot process directory entry")]
    ProcessDirEntry {
        #[source]
        source: jwalk::Error,
    },

    #[error("Cannot capture `{}`", .path.display())]
    Capture {
        path: PathBuf,
        #[source]
        source: wim_format::Error,
    },

    #[error("Cannot write WIM `{}`", .path.display())]
    WriteArchive {
        path: PathBuf,
        #[source]
        source: wim_format::Error,
    },

    #[error("Cannot extract from `{}`", .path.display())]
    Extract {
        path: PathBuf,
        #[source]
        source: wim_format::Error,
    },

    #[error("Integrity check of `{}` failed", .path.display())]
    Integrity {
        path: PathBuf,
        #[source]
        source: wim_format::Error,
    },

    #[error("Cannot change image information")]
    UpdateInfo {
        #[source]
        source: wim_format::Error,
    },

    #[error("Cannot serialize JSON")]
    Json {
        #[source]
        source: serde_json::Error,
    },

    #[error("Refusing to capture `{}` into itself", .path.display())]
    CaptureIntoSelf { path: PathBuf },
}
