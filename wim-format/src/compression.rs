use std::fmt;

use crate::header::HeaderFlags;

/// Compression scheme a WIM declares for its chunked resources.
///
/// Only uncompressed resources can be read or written; compressed ones are
/// reported as unsupported when their content is requested.
#[derive(Clone, Copy, Eq, PartialEq, Default)]
pub enum Compression {
    #[default]
    None,
    Xpress,
    Lzx,
    Unknown,
}

impl Compression {
    pub fn from_header_flags(flags: HeaderFlags) -> Compression {
        if !flags.contains(HeaderFlags::COMPRESSION) {
            return Compression::None;
        }
        if flags.contains(HeaderFlags::COMPRESS_LZX) {
            Compression::Lzx
        } else if flags.contains(HeaderFlags::COMPRESS_XPRESS) {
            Compression::Xpress
        } else {
            Compression::Unknown
        }
    }

    pub fn header_flags(self) -> HeaderFlags {
        match self {
            Compression::None | Compression::Unknown => HeaderFlags::empty(),
            Compression::Xpress => HeaderFlags::COMPRESSION | HeaderFlags::COMPRESS_XPRESS,
            Compression::Lzx => HeaderFlags::COMPRESSION | HeaderFlags::COMPRESS_LZX,
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Compression::None => "None",
            Compression::Xpress => "XPRESS",
            Compression::Lzx => "LZX",
            Compression::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Debug for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
