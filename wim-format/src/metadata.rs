//! Metadata resource: security data followed by the image's dentry tree.

use std::collections::{HashMap, HashSet};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::tree::{AltStream, DentryId, DentryTree, FileAttributes, Inode, InodeId, Timestamps};
use crate::Sha1Hash;

const DENTRY_DISK_SIZE: usize = 102;
const ADS_ENTRY_DISK_SIZE: usize = 38;
const RP_FLAG_NOT_FIXED: u16 = 0x0001;

#[inline(always)]
fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// `offset + align8(len)` for an on-disk length field.
fn advance(offset: usize, len: u64) -> Result<usize> {
    usize::try_from(len)
        .ok()
        .and_then(|len| len.checked_add(7))
        .and_then(|len| offset.checked_add(len & !7))
        .ok_or_else(|| {
            Error::invalid_data(format!("length {:#x} at {:#x} is out of range", len, offset))
        })
}

/// Security descriptors of an image, kept as opaque blobs indexed by
/// `Inode::security_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityData {
    pub descriptors: Vec<Vec<u8>>,
}

impl SecurityData {
    fn disk_len(&self) -> usize {
        let raw = 8
            + 8 * self.descriptors.len()
            + self.descriptors.iter().map(Vec::len).sum::<usize>();
        align8(raw)
    }

    fn write(&self, out: &mut Vec<u8>) {
        let total = self.disk_len();
        let start = out.len();
        put_u32(out, total as u32);
        put_u32(out, self.descriptors.len() as u32);
        for sd in self.descriptors.iter() {
            put_u64(out, sd.len() as u64);
        }
        for sd in self.descriptors.iter() {
            out.extend_from_slice(sd);
        }
        out.resize(start + total, 0);
    }

    /// Returns the parsed data and the offset of the root dentry.
    fn parse(buf: &[u8]) -> Result<(SecurityData, usize)> {
        let head = bytes(buf, 0, 8)?;
        let mut total = LittleEndian::read_u32(&head[0..4]) as usize;
        let count = LittleEndian::read_u32(&head[4..8]) as usize;
        if total == 0 {
            total = 8;
        }
        if total < 8 || total > buf.len() || count > (total - 8) / 8 {
            return Err(Error::invalid_data("security data length out of range"));
        }

        let sizes = bytes(buf, 8, count * 8)?;
        let mut offset = 8 + count * 8;
        let mut descriptors = vec![];
        descriptors.try_reserve_exact(count)?;
        for i in 0..count {
            let len = LittleEndian::read_u64(&sizes[i * 8..]);
            if len > (total - offset) as u64 {
                return Err(Error::invalid_data("security descriptor overruns its block"));
            }
            let len = len as usize;
            descriptors.push(bytes(buf, offset, len)?.to_vec());
            offset += len;
        }
        Ok((SecurityData { descriptors }, align8(total)))
    }
}

fn bytes(buf: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or_else(|| Error::invalid_data(format!("metadata read out of bounds at {:#x}", offset)))
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn utf16_bytes(name: &str) -> Result<Vec<u8>> {
    let out: Vec<u8> = name.encode_utf16().flat_map(u16::to_le_bytes).collect();
    if out.len() > u16::MAX as usize {
        return Err(Error::InvalidParameter(format!("name too long: '{}'", name)));
    }
    Ok(out)
}

fn decode_utf16(raw: &[u8]) -> Result<String> {
    if raw.len() % 2 != 0 {
        return Err(Error::invalid_data("odd UTF-16 name length"));
    }
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(Error::invalid_data)
}

struct RawDentry {
    inode: Inode,
    subdir_offset: u64,
    hard_link_group_id: u64,
    name: String,
    short_name: String,
    next: usize,
}

fn read_ads_entries(
    buf: &[u8],
    mut offset: usize,
    count: usize,
) -> Result<(Vec<AltStream>, usize)> {
    let mut ads = vec![];
    for _ in 0..count {
        let fixed = bytes(buf, offset, ADS_ENTRY_DISK_SIZE)?;
        let length = LittleEndian::read_u64(&fixed[0..8]);
        let mut hash = Sha1Hash::ZERO;
        hash.0.copy_from_slice(&fixed[16..36]);
        let name_nbytes = LittleEndian::read_u16(&fixed[36..38]) as usize;
        if length < (ADS_ENTRY_DISK_SIZE + name_nbytes) as u64 {
            return Err(Error::invalid_data("alternate stream entry too short"));
        }
        let name = decode_utf16(bytes(buf, offset + ADS_ENTRY_DISK_SIZE, name_nbytes)?)?;
        ads.push(AltStream { name, hash });
        offset = advance(offset, length)?;
    }
    Ok((ads, offset))
}

/// Reads the dentry at `offset`; `None` marks the end of a children list.
fn read_dentry(buf: &[u8], offset: usize) -> Result<Option<RawDentry>> {
    let length = LittleEndian::read_u64(bytes(buf, offset, 8)?);
    if length == 0 {
        return Ok(None);
    }
    if length < DENTRY_DISK_SIZE as u64 {
        return Err(Error::invalid_data(format!("dentry at {:#x} is too short", offset)));
    }
    let d = bytes(buf, offset, DENTRY_DISK_SIZE)?;

    let attributes = FileAttributes::from_bits_retain(LittleEndian::read_u32(&d[8..12]));
    let security_id = LittleEndian::read_i32(&d[12..16]);
    let subdir_offset = LittleEndian::read_u64(&d[16..24]);
    let timestamps = Timestamps {
        creation: LittleEndian::read_u64(&d[40..48]),
        last_access: LittleEndian::read_u64(&d[48..56]),
        last_write: LittleEndian::read_u64(&d[56..64]),
    };
    let mut hash = Sha1Hash::ZERO;
    hash.0.copy_from_slice(&d[64..84]);
    let num_ads = LittleEndian::read_u16(&d[96..98]) as usize;
    let short_nbytes = LittleEndian::read_u16(&d[98..100]) as usize;
    let name_nbytes = LittleEndian::read_u16(&d[100..102]) as usize;

    let mut inode = Inode::new(attributes);
    inode.security_id = security_id;
    inode.timestamps = timestamps;
    inode.hash = hash;
    let hard_link_group_id = if attributes.contains(FileAttributes::REPARSE_POINT) {
        inode.reparse_tag = LittleEndian::read_u32(&d[88..92]);
        inode.not_rpfixed = LittleEndian::read_u16(&d[94..96]) & RP_FLAG_NOT_FIXED != 0;
        0
    } else {
        LittleEndian::read_u64(&d[88..96])
    };

    let mut needed = DENTRY_DISK_SIZE + name_nbytes + short_nbytes;
    if name_nbytes > 0 {
        needed += 2;
    }
    if short_nbytes > 0 {
        needed += 2;
    }
    if needed as u64 > length {
        return Err(Error::invalid_data(format!("dentry at {:#x} overruns its length", offset)));
    }
    let name_off = offset + DENTRY_DISK_SIZE;
    let name = decode_utf16(bytes(buf, name_off, name_nbytes)?)?;
    let short_off = name_off + if name_nbytes > 0 { name_nbytes + 2 } else { 0 };
    let short_name = decode_utf16(bytes(buf, short_off, short_nbytes)?)?;

    let (ads, next) = read_ads_entries(buf, advance(offset, length)?, num_ads)?;
    inode.ads = ads;

    Ok(Some(RawDentry {
        inode,
        subdir_offset,
        hard_link_group_id,
        name,
        short_name,
        next,
    }))
}

/// Parses a metadata resource into its security data and dentry tree.
pub fn parse_metadata_resource(buf: &[u8]) -> Result<(DentryTree, SecurityData)> {
    let (security, root_offset) = SecurityData::parse(buf)?;
    let root = read_dentry(buf, root_offset)?
        .ok_or_else(|| Error::invalid_data("metadata resource has no root dentry"))?;
    if !root.inode.is_directory() {
        return Err(Error::invalid_data("root dentry is not a directory"));
    }

    let mut tree = DentryTree::with_root(root.inode);
    let mut groups: HashMap<u64, InodeId> = HashMap::new();
    let mut visited_lists = HashSet::new();
    let mut pending = vec![(tree.root(), root.subdir_offset)];

    while let Some((dir, list_offset)) = pending.pop() {
        if list_offset == 0 {
            continue;
        }
        let mut offset = usize::try_from(list_offset)
            .map_err(|_| Error::invalid_data("subdirectory offset out of range"))?;
        if !visited_lists.insert(offset) {
            return Err(Error::invalid_data(format!(
                "directory list at {:#x} is referenced twice",
                offset
            )));
        }

        while let Some(raw) = read_dentry(buf, offset)? {
            offset = raw.next;
            let inode = match raw.hard_link_group_id {
                0 => tree.add_inode(raw.inode),
                group => match groups.get(&group) {
                    Some(id) => *id,
                    None => {
                        let id = tree.add_inode(raw.inode);
                        groups.insert(group, id);
                        id
                    }
                },
            };
            let child = tree
                .add_child(dir, &raw.name, inode)
                .map_err(|e| Error::invalid_data(e))?;
            if !raw.short_name.is_empty() {
                tree.set_short_name(child, raw.short_name);
            }
            if tree.inode(inode).is_directory() {
                pending.push((child, raw.subdir_offset));
            }
        }
    }

    tracing::debug!(
        dentries = tree.dentry_count(),
        inodes = tree.inode_count(),
        "parsed metadata resource"
    );
    Ok((tree, security))
}

struct Layout {
    subdir_offsets: HashMap<DentryId, u64>,
    group_ids: HashMap<InodeId, u64>,
}

fn dentry_len(tree: &DentryTree, id: DentryId) -> Result<usize> {
    let dentry = tree.dentry(id);
    let mut len = DENTRY_DISK_SIZE;
    let name = utf16_bytes(&dentry.name)?.len();
    if name > 0 {
        len += name + 2;
    }
    let short = utf16_bytes(&dentry.short_name)?.len();
    if short > 0 {
        len += short + 2;
    }
    Ok(align8(len))
}

fn ads_len(ads: &AltStream) -> Result<usize> {
    let name = utf16_bytes(&ads.name)?.len();
    Ok(align8(ADS_ENTRY_DISK_SIZE + name + if name > 0 { 2 } else { 0 }))
}

fn disk_span(tree: &DentryTree, id: DentryId) -> Result<usize> {
    let mut span = dentry_len(tree, id)?;
    for ads in tree.dentry_inode(id).ads.iter() {
        span += ads_len(ads)?;
    }
    Ok(span)
}

fn write_dentry(out: &mut Vec<u8>, tree: &DentryTree, id: DentryId, layout: &Layout) -> Result<()> {
    let start = out.len();
    let dentry = tree.dentry(id);
    let inode = tree.inode(dentry.inode);
    let length = dentry_len(tree, id)?;
    let name = utf16_bytes(&dentry.name)?;
    let short = utf16_bytes(&dentry.short_name)?;

    put_u64(out, length as u64);
    put_u32(out, inode.attributes.bits());
    out.extend_from_slice(&inode.security_id.to_le_bytes());
    put_u64(out, layout.subdir_offsets.get(&id).copied().unwrap_or(0));
    put_u64(out, 0);
    put_u64(out, 0);
    put_u64(out, inode.timestamps.creation);
    put_u64(out, inode.timestamps.last_access);
    put_u64(out, inode.timestamps.last_write);
    out.extend_from_slice(&inode.hash.0);
    put_u32(out, 0);
    if inode.is_reparse_point() {
        put_u32(out, inode.reparse_tag);
        put_u16(out, 0);
        put_u16(out, if inode.not_rpfixed { RP_FLAG_NOT_FIXED } else { 0 });
    } else {
        put_u64(out, layout.group_ids.get(&dentry.inode).copied().unwrap_or(0));
    }
    put_u16(out, inode.ads.len() as u16);
    put_u16(out, short.len() as u16);
    put_u16(out, name.len() as u16);
    if !name.is_empty() {
        out.extend_from_slice(&name);
        put_u16(out, 0);
    }
    if !short.is_empty() {
        out.extend_from_slice(&short);
        put_u16(out, 0);
    }
    out.resize(start + length, 0);

    for ads in inode.ads.iter() {
        let start = out.len();
        let len = ads_len(ads)?;
        let name = utf16_bytes(&ads.name)?;
        put_u64(out, len as u64);
        put_u64(out, 0);
        out.extend_from_slice(&ads.hash.0);
        put_u16(out, name.len() as u16);
        if !name.is_empty() {
            out.extend_from_slice(&name);
            put_u16(out, 0);
        }
        out.resize(start + len, 0);
    }
    Ok(())
}

/// Serializes security data and `tree` into a metadata resource.
///
/// Layout: security data, root dentry, end marker, then one children list
/// per directory in breadth-first order, each followed by an end marker.
pub fn write_metadata_resource(tree: &DentryTree, security: &SecurityData) -> Result<Vec<u8>> {
    let root = tree.root();
    let directories: Vec<DentryId> = tree
        .breadth_first(root)
        .into_iter()
        .filter(|&id| tree.dentry_inode(id).is_directory())
        .collect();

    let mut group_ids = HashMap::new();
    for (id, inode) in tree.inodes() {
        if inode.link_count() > 1 && !inode.is_reparse_point() {
            group_ids.insert(id, id.0 as u64 + 1);
        }
    }

    let mut subdir_offsets = HashMap::new();
    let mut cur = security.disk_len() + disk_span(tree, root)? + 8;
    for &dir in directories.iter() {
        subdir_offsets.insert(dir, cur as u64);
        for child in tree.dentry(dir).children() {
            cur += disk_span(tree, child)?;
        }
        cur += 8;
    }
    let layout = Layout {
        subdir_offsets,
        group_ids,
    };

    let mut out = vec![];
    out.try_reserve_exact(cur)?;
    security.write(&mut out);
    write_dentry(&mut out, tree, root, &layout)?;
    put_u64(&mut out, 0);
    for &dir in directories.iter() {
        for child in tree.dentry(dir).children() {
            write_dentry(&mut out, tree, child, &layout)?;
        }
        put_u64(&mut out, 0);
    }
    debug_assert_eq!(out.len(), cur);
    Ok(out)
}
