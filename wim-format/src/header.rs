use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

use crate::Sha1Hash;

pub(crate) const MAGIC_BYTES: &[u8; 8] = b"MSWIM\0\0\0";
pub(crate) const HEADER_SIZE: u32 = 208;
pub(crate) const WIM_VERSION: u32 = 0x10d00;
pub(crate) const WIM_CHUNK_SIZE: u32 = 32768;
pub(crate) const GUID_LEN: usize = 16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HeaderFlags: u32 {
        const RESERVED = 0x0000_0001;
        const COMPRESSION = 0x0000_0002;
        const READONLY = 0x0000_0004;
        const SPANNED = 0x0000_0008;
        const RESOURCE_ONLY = 0x0000_0010;
        const METADATA_ONLY = 0x0000_0020;
        const WRITE_IN_PROGRESS = 0x0000_0040;
        const RP_FIX = 0x0000_0080;
        const COMPRESS_RESERVED = 0x0001_0000;
        const COMPRESS_XPRESS = 0x0002_0000;
        const COMPRESS_LZX = 0x0004_0000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceFlags: u8 {
        const FREE = 0x01;
        const METADATA = 0x02;
        const COMPRESSED = 0x04;
        const SPANNED = 0x08;
    }
}

/// Location of a resource inside a WIM file.
///
/// `size` is the number of bytes the resource occupies on disk and
/// `original_size` the number of bytes it expands to. They only differ for
/// compressed resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceEntry {
    pub size: u64,
    pub flags: ResourceFlags,
    pub offset: u64,
    pub original_size: u64,
}

impl ResourceEntry {
    pub(crate) const DISK_SIZE: u64 = 24;
    pub(crate) const MAX_SIZE: u64 = (1 << 56) - 1;

    pub fn uncompressed(offset: u64, size: u64) -> ResourceEntry {
        ResourceEntry {
            size,
            flags: ResourceFlags::empty(),
            offset,
            original_size: size,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags.contains(ResourceFlags::COMPRESSED)
    }

    /// End of the on-disk extent.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WimHeader {
    pub magic_bytes: [u8; 8],
    pub header_size: u32,
    pub version: u32,
    pub flags: HeaderFlags,
    pub chunk_size: u32,
    pub guid: [u8; GUID_LEN],
    pub part_number: u16,
    pub total_parts: u16,
    pub image_count: u32,
    pub lookup_table: ResourceEntry,
    pub xml_data: ResourceEntry,
    pub boot_metadata: ResourceEntry,
    pub boot_index: u32,
    pub integrity: ResourceEntry,
}

impl WimHeader {
    pub fn new() -> WimHeader {
        WimHeader {
            magic_bytes: *MAGIC_BYTES,
            header_size: HEADER_SIZE,
            version: WIM_VERSION,
            flags: HeaderFlags::empty(),
            chunk_size: WIM_CHUNK_SIZE,
            guid: generate_guid(),
            part_number: 1,
            total_parts: 1,
            image_count: 0,
            lookup_table: ResourceEntry::default(),
            xml_data: ResourceEntry::default(),
            boot_metadata: ResourceEntry::default(),
            boot_index: 0,
            integrity: ResourceEntry::default(),
        }
    }

    pub fn is_split(&self) -> bool {
        self.total_parts != 1
    }
}

impl Default for WimHeader {
    fn default() -> Self {
        WimHeader::new()
    }
}

// Not cryptographically random, only needs to distinguish WIMs from each other.
fn generate_guid() -> [u8; GUID_LEN] {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut seed = now.to_le_bytes().to_vec();
    seed.extend_from_slice(&std::process::id().to_le_bytes());
    let hash = Sha1Hash::of(&seed);
    let mut guid = [0u8; GUID_LEN];
    guid.copy_from_slice(&hash.0[..GUID_LEN]);
    guid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_header_defaults() {
        let h = WimHeader::new();
        assert_eq!(&h.magic_bytes, MAGIC_BYTES);
        assert_eq!(h.header_size, 208);
        assert_eq!(h.part_number, 1);
        assert_eq!(h.total_parts, 1);
        assert!(!h.is_split());
        assert_ne!(h.guid, [0u8; GUID_LEN]);
    }

    #[test]
    fn resource_entry_end() {
        let e = ResourceEntry::uncompressed(208, 100);
        assert_eq!(e.end(), 308);
        assert!(!e.is_compressed());
    }
}
