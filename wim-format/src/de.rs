use std::io::{ErrorKind, Read, Result};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::header::{HeaderFlags, ResourceEntry, ResourceFlags, WimHeader, GUID_LEN, MAGIC_BYTES};
use crate::lookup_table::LookupTableEntry;
use crate::Sha1Hash;

pub(crate) trait DeserializeOwned {
    fn deserialize_owned<R: Read>(reader: &mut R) -> Result<Self>
    where
        Self: Sized;
}

fn invalid(msg: &'static str) -> std::io::Error {
    std::io::Error::new(ErrorKind::InvalidData, msg)
}

impl DeserializeOwned for ResourceEntry {
    fn deserialize_owned<R: Read>(reader: &mut R) -> Result<Self> {
        let mut size = [0u8; 8];
        reader.read_exact(&mut size[..7])?;
        let flags = ResourceFlags::from_bits_retain(reader.read_u8()?);
        let offset = reader.read_u64::<LittleEndian>()?;
        let original_size = reader.read_u64::<LittleEndian>()?;
        Ok(ResourceEntry {
            size: u64::from_le_bytes(size),
            flags,
            offset,
            original_size,
        })
    }
}

impl DeserializeOwned for WimHeader {
    fn deserialize_owned<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic_bytes = [0u8; 8];
        reader.read_exact(&mut magic_bytes)?;
        if &magic_bytes != MAGIC_BYTES {
            return Err(invalid("magic bytes invalid"));
        }

        let header_size = reader.read_u32::<LittleEndian>()?;
        if header_size != crate::header::HEADER_SIZE {
            return Err(invalid("unexpected header size"));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        let flags = HeaderFlags::from_bits_retain(reader.read_u32::<LittleEndian>()?);
        let chunk_size = reader.read_u32::<LittleEndian>()?;
        let mut guid = [0u8; GUID_LEN];
        reader.read_exact(&mut guid)?;
        let part_number = reader.read_u16::<LittleEndian>()?;
        let total_parts = reader.read_u16::<LittleEndian>()?;
        if part_number == 0 || part_number > total_parts {
            return Err(invalid("invalid part number"));
        }
        let image_count = reader.read_u32::<LittleEndian>()?;
        let lookup_table = ResourceEntry::deserialize_owned(reader)?;
        let xml_data = ResourceEntry::deserialize_owned(reader)?;
        let boot_metadata = ResourceEntry::deserialize_owned(reader)?;
        let boot_index = reader.read_u32::<LittleEndian>()?;
        if boot_index > image_count {
            return Err(invalid("boot index out of range"));
        }
        let integrity = ResourceEntry::deserialize_owned(reader)?;
        let mut reserved = [0u8; 60];
        reader.read_exact(&mut reserved)?;

        Ok(WimHeader {
            magic_bytes,
            header_size,
            version,
            flags,
            chunk_size,
            guid,
            part_number,
            total_parts,
            image_count,
            lookup_table,
            xml_data,
            boot_metadata,
            boot_index,
            integrity,
        })
    }
}

impl DeserializeOwned for LookupTableEntry {
    fn deserialize_owned<R: Read>(reader: &mut R) -> Result<Self> {
        let resource = ResourceEntry::deserialize_owned(reader)?;
        let part_number = reader.read_u16::<LittleEndian>()?;
        let refcnt = reader.read_u32::<LittleEndian>()?;
        let mut hash = Sha1Hash::ZERO;
        reader.read_exact(&mut hash.0)?;
        Ok(LookupTableEntry {
            resource,
            part_number,
            refcnt,
            hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ser::Serialize;
    use std::io::Cursor;

    #[test]
    fn header_is_208_bytes() {
        let mut buf = Vec::new();
        WimHeader::new().write(&mut buf).unwrap();
        assert_eq!(buf.len(), 208);
        assert_eq!(&buf[..8], b"MSWIM\0\0\0");
    }

    #[test]
    fn header_round_trip() {
        let mut header = WimHeader::new();
        header.image_count = 3;
        header.boot_index = 2;
        header.flags = HeaderFlags::RP_FIX;
        header.xml_data = ResourceEntry::uncompressed(0x1234, 77);
        header.boot_metadata = ResourceEntry {
            flags: ResourceFlags::METADATA,
            ..ResourceEntry::uncompressed(208, 400)
        };

        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        let back = WimHeader::deserialize_owned(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut buf = Vec::new();
        WimHeader::new().write(&mut buf).unwrap();
        buf[0] = b'X';
        let err = WimHeader::deserialize_owned(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn resource_entry_uses_seven_byte_size() {
        let entry = ResourceEntry {
            size: 0x00ff_ffff_ffff_ffff,
            flags: ResourceFlags::COMPRESSED,
            offset: 1,
            original_size: 2,
        };
        let mut buf = Vec::new();
        entry.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 24);
        assert_eq!(buf[7], ResourceFlags::COMPRESSED.bits());
        let back = ResourceEntry::deserialize_owned(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn lookup_table_entry_is_50_bytes() {
        let entry = LookupTableEntry {
            resource: ResourceEntry::uncompressed(208, 5),
            part_number: 1,
            refcnt: 2,
            hash: Sha1Hash::of(b"hello"),
        };
        let mut buf = Vec::new();
        entry.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 50);
    }
}
