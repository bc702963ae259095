//! Symbolic link and junction reparse buffers.
//!
//! A WIM stores reparse data as the unnamed stream of a reparse-point inode,
//! without the 8-byte tag/length header; the tag lives in the dentry.

use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

pub const IO_REPARSE_TAG_MOUNT_POINT: u32 = 0xA000_0003;
pub const IO_REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

const SYMLINK_FLAG_RELATIVE: u32 = 0x1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReparseData {
    pub tag: u32,
    pub substitute_name: String,
    pub print_name: String,
    pub relative: bool,
}

fn utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn name_at(buf: &[u8], offset: usize, len: usize) -> Result<String> {
    let raw = buf
        .get(offset..offset + len)
        .ok_or_else(|| Error::invalid_data("reparse name out of bounds"))?;
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(Error::invalid_data)
}

impl ReparseData {
    /// Symlink reparse data for a POSIX link target.
    pub fn from_unix_target(target: &str) -> ReparseData {
        let name = target.replace('/', "\\");
        ReparseData {
            tag: IO_REPARSE_TAG_SYMLINK,
            substitute_name: name.clone(),
            print_name: name,
            relative: !target.starts_with('/'),
        }
    }

    pub fn is_link(&self) -> bool {
        self.tag == IO_REPARSE_TAG_SYMLINK || self.tag == IO_REPARSE_TAG_MOUNT_POINT
    }

    pub fn parse(tag: u32, buf: &[u8]) -> Result<ReparseData> {
        let header_len = match tag {
            IO_REPARSE_TAG_SYMLINK => 12,
            IO_REPARSE_TAG_MOUNT_POINT => 8,
            _ => {
                return Err(Error::UnsupportedFeature(format!(
                    "reparse tag {:#010x}",
                    tag
                )))
            }
        };
        if buf.len() < header_len {
            return Err(Error::invalid_data("reparse data too short"));
        }
        let sub_off = LittleEndian::read_u16(&buf[0..2]) as usize;
        let sub_len = LittleEndian::read_u16(&buf[2..4]) as usize;
        let print_off = LittleEndian::read_u16(&buf[4..6]) as usize;
        let print_len = LittleEndian::read_u16(&buf[6..8]) as usize;
        let relative = tag == IO_REPARSE_TAG_SYMLINK
            && LittleEndian::read_u32(&buf[8..12]) & SYMLINK_FLAG_RELATIVE != 0;

        let names = &buf[header_len..];
        Ok(ReparseData {
            tag,
            substitute_name: name_at(names, sub_off, sub_len)?,
            print_name: name_at(names, print_off, print_len)?,
            relative,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let sub = utf16(&self.substitute_name);
        let print = utf16(&self.print_name);
        if sub.len() + print.len() > u16::MAX as usize - 12 {
            return Err(Error::InvalidParameter("reparse target too long".into()));
        }

        let mut out = vec![];
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(sub.len() as u16).to_le_bytes());
        out.extend_from_slice(&(sub.len() as u16).to_le_bytes());
        out.extend_from_slice(&(print.len() as u16).to_le_bytes());
        if self.tag == IO_REPARSE_TAG_SYMLINK {
            let flags = if self.relative { SYMLINK_FLAG_RELATIVE } else { 0 };
            out.extend_from_slice(&flags.to_le_bytes());
        }
        out.extend_from_slice(&sub);
        out.extend_from_slice(&print);
        Ok(out)
    }

    /// The link target as a POSIX path: the NT `\??\` prefix and any drive
    /// letter are dropped and separators become `/`.
    pub fn unix_target(&self) -> String {
        let mut target = self.substitute_name.as_str();
        if let Some(rest) = target.strip_prefix("\\??\\") {
            target = rest;
        }
        let bytes = target.as_bytes();
        if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
            target = &target[2..];
        }
        target.replace('\\', "/")
    }
}

/// Rewrites an absolute link target that points inside `capture_root` so it
/// is relative to the image root. Targets outside the root are left alone.
pub fn fixup_target(target: &str, capture_root: &Path) -> Option<String> {
    let rest = Path::new(target).strip_prefix(capture_root).ok()?;
    if !target.starts_with('/') {
        return None;
    }
    let rest = rest.to_str()?;
    Some(format!("/{}", rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symlink_round_trip() {
        let data = ReparseData::from_unix_target("../lib/libfoo.so");
        assert!(data.relative);
        let bytes = data.to_bytes().unwrap();
        let back = ReparseData::parse(IO_REPARSE_TAG_SYMLINK, &bytes).unwrap();
        assert_eq!(back, data);
        assert_eq!(back.unix_target(), "../lib/libfoo.so");
    }

    #[test]
    fn windows_targets_are_converted() {
        let data = ReparseData {
            tag: IO_REPARSE_TAG_MOUNT_POINT,
            substitute_name: "\\??\\C:\\Users\\Public".into(),
            print_name: "C:\\Users\\Public".into(),
            relative: false,
        };
        let bytes = data.to_bytes().unwrap();
        let back = ReparseData::parse(IO_REPARSE_TAG_MOUNT_POINT, &bytes).unwrap();
        assert_eq!(back.unix_target(), "/Users/Public");
    }

    #[test]
    fn unknown_tag_is_unsupported() {
        assert!(matches!(
            ReparseData::parse(0x8000_0017, &[0u8; 16]),
            Err(Error::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn fixup_inside_and_outside_root() {
        let root = Path::new("/srv/capture");
        assert_eq!(
            fixup_target("/srv/capture/etc/hosts", root).as_deref(),
            Some("/etc/hosts")
        );
        assert_eq!(fixup_target("/usr/bin/env", root), None);
        assert_eq!(fixup_target("etc/hosts", root), None);
    }
}
