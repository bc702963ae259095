//! Conversions between filesystem metadata and inode fields.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use filetime::FileTime;

use crate::tree::{FileAttributes, Timestamps};

/// 100ns intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;
const FILETIME_TICKS_PER_SEC: u64 = 10_000_000;

pub fn filetime_from_system_time(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => FILETIME_UNIX_EPOCH
            .saturating_add(d.as_secs().saturating_mul(FILETIME_TICKS_PER_SEC))
            .saturating_add(d.subsec_nanos() as u64 / 100),
        Err(e) => {
            let d = e.duration();
            let ticks = d.as_secs() * FILETIME_TICKS_PER_SEC + d.subsec_nanos() as u64 / 100;
            FILETIME_UNIX_EPOCH.saturating_sub(ticks)
        }
    }
}

pub fn system_time_from_filetime(ft: u64) -> SystemTime {
    let ticks_to_duration = |t: u64| {
        Duration::new(t / FILETIME_TICKS_PER_SEC, ((t % FILETIME_TICKS_PER_SEC) * 100) as u32)
    };
    if ft >= FILETIME_UNIX_EPOCH {
        UNIX_EPOCH + ticks_to_duration(ft - FILETIME_UNIX_EPOCH)
    } else {
        UNIX_EPOCH - ticks_to_duration(FILETIME_UNIX_EPOCH - ft)
    }
}

pub fn now_filetime() -> u64 {
    filetime_from_system_time(SystemTime::now())
}

pub(crate) fn to_file_time(ft: u64) -> FileTime {
    FileTime::from_system_time(system_time_from_filetime(ft))
}

pub fn timestamps_from_metadata(meta: &std::fs::Metadata) -> Timestamps {
    let write = meta
        .modified()
        .map(filetime_from_system_time)
        .unwrap_or_else(|_| now_filetime());
    Timestamps {
        creation: meta.created().map(filetime_from_system_time).unwrap_or(write),
        last_access: meta.accessed().map(filetime_from_system_time).unwrap_or(write),
        last_write: write,
    }
}

pub fn attributes_from_metadata(meta: &std::fs::Metadata) -> FileAttributes {
    let mut attrs = if meta.is_dir() {
        FileAttributes::DIRECTORY
    } else {
        FileAttributes::NORMAL
    };
    if meta.permissions().readonly() {
        attrs.remove(FileAttributes::NORMAL);
        attrs.insert(FileAttributes::READONLY);
    }
    attrs
}

/// Ownership and mode of a file captured on a UNIX system.
///
/// Stored as the `$$__wimlib_UNIX_data` alternate stream: a zero u16
/// version followed by uid, gid and mode as little-endian u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixData {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl UnixData {
    pub const DISK_SIZE: usize = 14;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::DISK_SIZE);
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.gid.to_le_bytes());
        out.extend_from_slice(&self.mode.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Option<UnixData> {
        if buf.len() != Self::DISK_SIZE || buf[0..2] != [0, 0] {
            return None;
        }
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Some(UnixData {
            uid: u32_at(2),
            gid: u32_at(6),
            mode: u32_at(10),
        })
    }

    #[cfg(unix)]
    pub fn from_metadata(meta: &std::fs::Metadata) -> UnixData {
        use std::os::unix::fs::MetadataExt;

        UnixData {
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filetime_conversion() {
        assert_eq!(filetime_from_system_time(UNIX_EPOCH), FILETIME_UNIX_EPOCH);
        let t = UNIX_EPOCH + Duration::new(1_600_000_000, 123_456_700);
        assert_eq!(system_time_from_filetime(filetime_from_system_time(t)), t);
        let before = UNIX_EPOCH - Duration::from_secs(86_400);
        assert_eq!(system_time_from_filetime(filetime_from_system_time(before)), before);
    }

    #[test]
    fn unix_data_layout() {
        let data = UnixData {
            uid: 1000,
            gid: 100,
            mode: 0o100644,
        };
        let bytes = data.to_bytes();
        assert_eq!(bytes.len(), UnixData::DISK_SIZE);
        assert_eq!(UnixData::from_bytes(&bytes), Some(data));
        assert_eq!(UnixData::from_bytes(&bytes[1..]), None);
    }
}
