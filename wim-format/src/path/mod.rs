use relative_path::{Component, RelativePath};
use std::fmt;

mod error;

pub use self::error::IntoWimPathError;

/// The separator used inside images.
pub const PATH_WIM_SEP: &str = "/";

#[cfg(not(windows))]
const RESERVED_NAME_CHARS: &[char] = &['/', '\0'];

#[cfg(windows)]
const RESERVED_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '\0'];

/// A canonical path inside an image: `/`-separated, no leading or trailing
/// separator, no `.` or `..` components. The empty path is the image root.
#[derive(Debug, Clone, Default, PartialOrd, Ord, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct WimPath(pub(crate) String);

impl WimPath {
    /// Canonicalizes a user supplied path. Both `/` and `\` separate
    /// components.
    pub fn new(path: &str) -> std::result::Result<WimPath, IntoWimPathError> {
        if path.contains('\0') {
            return Err(IntoWimPathError::UnrepresentableStr);
        }
        let unix = path.replace('\\', PATH_WIM_SEP);
        let normalized = RelativePath::new(unix.trim_start_matches('/')).normalize();
        if normalized
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(IntoWimPathError::EscapesRoot);
        }
        Ok(WimPath(normalized.as_str().trim_end_matches('/').to_string()))
    }

    pub fn root() -> WimPath {
        WimPath(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.split(PATH_WIM_SEP).filter(|c| !c.is_empty())
    }
}

impl fmt::Display for WimPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

/// Whether an image name can be used as a directory name when extracting
/// every image of a WIM.
pub fn image_name_ok_as_dir(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(RESERVED_NAME_CHARS)
}
