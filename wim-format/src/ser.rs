use std::io::{Result, Seek, Write};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::header::{ResourceEntry, WimHeader};
use crate::lookup_table::LookupTableEntry;

pub(crate) trait Serialize {
    fn write<W: Write>(&self, writer: &mut W) -> Result<()>;
}

impl<T: Serialize> Serialize for [T] {
    fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        for item in self.iter() {
            item.write(writer)?;
        }
        Ok(())
    }
}

impl Serialize for ResourceEntry {
    fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        if self.size > ResourceEntry::MAX_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "resource larger than 2^56 bytes",
            ));
        }
        writer.write_all(&self.size.to_le_bytes()[..7])?;
        writer.write_u8(self.flags.bits())?;
        writer.write_u64::<LittleEndian>(self.offset)?;
        writer.write_u64::<LittleEndian>(self.original_size)
    }
}

impl Serialize for WimHeader {
    fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic_bytes)?;
        writer.write_u32::<LittleEndian>(self.header_size)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.flags.bits())?;
        writer.write_u32::<LittleEndian>(self.chunk_size)?;
        writer.write_all(&self.guid)?;
        writer.write_u16::<LittleEndian>(self.part_number)?;
        writer.write_u16::<LittleEndian>(self.total_parts)?;
        writer.write_u32::<LittleEndian>(self.image_count)?;
        self.lookup_table.write(writer)?;
        self.xml_data.write(writer)?;
        self.boot_metadata.write(writer)?;
        writer.write_u32::<LittleEndian>(self.boot_index)?;
        self.integrity.write(writer)?;
        writer.write_all(&[0u8; 60])
    }
}

impl Serialize for LookupTableEntry {
    fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.resource.write(writer)?;
        writer.write_u16::<LittleEndian>(self.part_number)?;
        writer.write_u32::<LittleEndian>(self.refcnt)?;
        writer.write_all(&self.hash.0)
    }
}

/// Writes `value` at the current position and logs the extent it covers.
pub(crate) fn write_traced<T, W>(value: &T, writer: &mut W, what: &str) -> Result<u64>
where
    T: Serialize + ?Sized,
    W: Write + Seek,
{
    let start = writer.stream_position()?;
    value.write(writer)?;
    let end = writer.stream_position()?;
    tracing::debug!(
        start = format_args!("{:#x}", start),
        end = format_args!("{:#x}", end),
        bytes = end - start,
        "serialized {}",
        what
    );
    Ok(start)
}
