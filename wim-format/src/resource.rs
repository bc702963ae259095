//! Reading resource and stream content.

use std::fs::File;
use std::io::{prelude::*, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::header::ResourceEntry;
use crate::lookup_table::{Stream, StreamSource};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

fn check_uncompressed(resource: &ResourceEntry) -> Result<()> {
    if resource.is_compressed() {
        return Err(Error::UnsupportedFeature(
            "compressed resources cannot be read".into(),
        ));
    }
    Ok(())
}

/// Opens `path` positioned at the start of `resource`, limited to its length.
pub(crate) fn open_resource(path: &Path, resource: &ResourceEntry) -> Result<std::io::Take<File>> {
    check_uncompressed(resource)?;
    let mut file = File::open(path).map_err(|e| Error::Open(e, path.to_path_buf()))?;
    file.seek(SeekFrom::Start(resource.offset))
        .map_err(|e| Error::Read(e, path.to_path_buf()))?;
    Ok(file.take(resource.original_size))
}

pub(crate) fn read_resource(path: &Path, resource: &ResourceEntry) -> Result<Vec<u8>> {
    let mut reader = open_resource(path, resource)?;
    let mut buf = vec![];
    buf.try_reserve_exact(resource.original_size as usize)?;
    reader
        .read_to_end(&mut buf)
        .map_err(|e| Error::Read(e, path.to_path_buf()))?;
    if buf.len() as u64 != resource.original_size {
        return Err(Error::invalid_data(format!(
            "resource at {:#x} is truncated",
            resource.offset
        )));
    }
    Ok(buf)
}

fn source_path(stream: &Stream) -> PathBuf {
    match &stream.source {
        StreamSource::Wim { path, .. } => path.to_path_buf(),
        StreamSource::File(path) => path.clone(),
        StreamSource::Buffer(_) => PathBuf::from("<memory>"),
    }
}

/// Copies exactly `stream.size` bytes of the stream's content into `writer`.
///
/// `dest` only names the destination in errors.
pub fn copy_stream_to<W: Write>(stream: &Stream, writer: &mut W, dest: &Path) -> Result<u64> {
    let src = source_path(stream);
    let mut reader: Box<dyn Read + '_> = match &stream.source {
        StreamSource::Wim { path, resource } => Box::new(open_resource(path, resource)?),
        StreamSource::File(path) => Box::new(
            File::open(path)
                .map_err(|e| Error::Open(e, path.clone()))?
                .take(stream.size),
        ),
        StreamSource::Buffer(data) => Box::new(&data[..]),
    };

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Read(e, src)),
        };
        writer
            .write_all(&buf[..n])
            .map_err(|e| Error::Write(e, dest.to_path_buf()))?;
        copied += n as u64;
    }

    if copied != stream.size {
        return Err(Error::invalid_data(format!(
            "stream {} yielded {} bytes, expected {}",
            stream.hash, copied, stream.size
        )));
    }
    Ok(copied)
}

/// Reads a whole stream into memory. Meant for small streams such as reparse data.
pub fn read_stream(stream: &Stream) -> Result<Vec<u8>> {
    if let StreamSource::Buffer(data) = &stream.source {
        return Ok(data.to_vec());
    }
    let mut buf = vec![];
    buf.try_reserve_exact(stream.size as usize)?;
    copy_stream_to(stream, &mut buf, Path::new("<memory>"))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sha1Hash;
    use std::sync::Arc;

    #[test]
    fn copy_bounded_wim_resource() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789abcdef").unwrap();

        let stream = Stream::new(
            Sha1Hash::of(b"4567"),
            4,
            StreamSource::Wim {
                path: Arc::new(path),
                resource: ResourceEntry::uncompressed(4, 4),
            },
        );
        assert_eq!(read_stream(&stream).unwrap(), b"4567");
    }

    #[test]
    fn truncated_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"abc").unwrap();

        let stream = Stream::new(Sha1Hash::ZERO, 10, StreamSource::File(path));
        match read_stream(&stream) {
            Err(Error::InvalidData(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn compressed_resource_unsupported() {
        let mut resource = ResourceEntry::uncompressed(0, 4);
        resource.flags = crate::ResourceFlags::COMPRESSED;
        match read_resource(Path::new("unused.wim"), &resource) {
            Err(Error::UnsupportedFeature(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
