//! Memory-mapped file I/O.
//!
//! Reads map the whole file read-only; writes create-and-truncate to the
//! final size and map read-write. Mappings above [`MAP_CHUNK`] bytes are
//! split into chunks so platforms that cap a single mapping at 31-bit
//! sizes keep working.

use anyhow::{bail, Context, Result};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Size of one mapping chunk (1 GiB).
pub const MAP_CHUNK: u64 = 1024 * 1024 * 1024;

enum Chunk {
    Ro(Mmap),
    Rw(MmapMut),
}

impl Chunk {
    fn as_slice(&self) -> &[u8] {
        match self {
            Chunk::Ro(m) => m,
            Chunk::Rw(m) => m,
        }
    }
}

/// A file opened through chunked memory mappings.
///
/// `read`/`write` advance internal positions; the `_at` variants are
/// stateless. Any access past the mapped length is an error rather than an
/// extension of the file.
pub struct MemoryMappedFile {
    path: PathBuf,
    file: Option<File>,
    chunks: Vec<Chunk>,
    len: u64,
    writable: bool,
    read_pos: u64,
    write_pos: u64,
}

impl MemoryMappedFile {
    /// Map an existing file read-only in its entirety.
    pub fn open_read(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        let chunks = map_chunks(&file, len, false)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            chunks,
            len,
            writable: false,
            read_pos: 0,
            write_pos: 0,
        })
    }

    /// Create (or truncate) a file of exactly `len` bytes and map it
    /// read-write. `perm` applies POSIX permission bits at creation; on
    /// non-POSIX file systems the owner bits degrade to read-only toggling.
    pub fn create_write(path: &Path, len: u64, perm: Option<u32>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("create {}", path.display()))?;
        file.set_len(len)
            .with_context(|| format!("truncate {} to {}", path.display(), len))?;
        if let Some(mode) = perm {
            apply_permissions(&file, mode)
                .with_context(|| format!("set permissions on {}", path.display()))?;
        }
        let chunks = map_chunks(&file, len, true)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            chunks,
            len,
            writable: true,
            read_pos: 0,
            write_pos: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if self.file.is_none() {
            bail!("{}: file is closed", self.path.display());
        }
        let end = offset
            .checked_add(len as u64)
            .context("offset + length overflows")?;
        if end > self.len {
            bail!(
                "{}: range {}..{} out of bounds (len {})",
                self.path.display(),
                offset,
                end,
                self.len
            );
        }
        Ok(())
    }

    /// Borrow a read-only view of `len` bytes at `offset`. The range must
    /// not straddle a chunk boundary; callers that stream use `read_at`.
    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(&[]);
        }
        let (chunk, within) = (offset / MAP_CHUNK, (offset % MAP_CHUNK) as usize);
        let data = self.chunks[chunk as usize].as_slice();
        if within + len > data.len() {
            bail!(
                "{}: slice {}..+{} crosses a mapping boundary",
                self.path.display(),
                offset,
                len
            );
        }
        Ok(&data[within..within + len])
    }

    /// Copy bytes at `offset` into `buf`, handling chunk boundaries.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.check_range(offset, buf.len())?;
        let mut copied = 0usize;
        while copied < buf.len() {
            let pos = offset + copied as u64;
            let (chunk, within) = ((pos / MAP_CHUNK) as usize, (pos % MAP_CHUNK) as usize);
            let data = self.chunks[chunk].as_slice();
            let n = (buf.len() - copied).min(data.len() - within);
            buf[copied..copied + n].copy_from_slice(&data[within..within + n]);
            copied += n;
        }
        Ok(())
    }

    /// Sequential read from the internal cursor.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_at(buf, self.read_pos)?;
        self.read_pos += buf.len() as u64;
        Ok(())
    }

    /// Copy `data` into the mapping at `offset`, handling chunk boundaries.
    pub fn write_at(&mut self, data: &[u8], offset: u64) -> Result<()> {
        if !self.writable {
            bail!("{}: mapped read-only", self.path.display());
        }
        self.check_range(offset, data.len())?;
        let mut copied = 0usize;
        while copied < data.len() {
            let pos = offset + copied as u64;
            let (chunk, within) = ((pos / MAP_CHUNK) as usize, (pos % MAP_CHUNK) as usize);
            let dst = match &mut self.chunks[chunk] {
                Chunk::Rw(m) => m,
                Chunk::Ro(_) => bail!("read-only chunk in writable mapping"),
            };
            let n = (data.len() - copied).min(dst.len() - within);
            dst[within..within + n].copy_from_slice(&data[copied..copied + n]);
            copied += n;
        }
        Ok(())
    }

    /// Sequential write at the internal cursor.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.write_at(data, self.write_pos)?;
        self.write_pos += data.len() as u64;
        Ok(())
    }

    pub fn write_pos(&self) -> u64 {
        self.write_pos
    }

    /// Flush dirty pages to disk.
    pub fn force(&mut self) -> Result<()> {
        for chunk in &self.chunks {
            if let Chunk::Rw(m) = chunk {
                m.flush()
                    .with_context(|| format!("flush {}", self.path.display()))?;
            }
        }
        Ok(())
    }

    /// Flush, unmap and close. Idempotent; also runs on drop.
    pub fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let flush = self.force();
        self.chunks.clear();
        self.file = None;
        flush
    }
}

impl Drop for MemoryMappedFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn map_chunks(file: &File, len: u64, writable: bool) -> Result<Vec<Chunk>> {
    let mut chunks = Vec::new();
    let mut offset = 0u64;
    while offset < len {
        let chunk_len = (len - offset).min(MAP_CHUNK) as usize;
        let chunk = if writable {
            // Safety: the mapping is exclusively owned by this handle and
            // unmapped before the file handle is dropped.
            let m = unsafe {
                MmapOptions::new()
                    .offset(offset)
                    .len(chunk_len)
                    .map_mut(file)
            }
            .context("mmap read-write")?;
            Chunk::Rw(m)
        } else {
            let m = unsafe { MmapOptions::new().offset(offset).len(chunk_len).map(file) }
                .context("mmap read-only")?;
            Chunk::Ro(m)
        };
        chunks.push(chunk);
        offset += chunk_len as u64;
    }
    Ok(chunks)
}

#[cfg(unix)]
fn apply_permissions(file: &File, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

#[cfg(not(unix))]
fn apply_permissions(file: &File, mode: u32) -> Result<()> {
    // Best effort: only the owner-write bit translates.
    let mut perms = file.metadata()?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    file.set_permissions(perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let payload = b"0123456789abcdef";

        let mut w = MemoryMappedFile::create_write(&path, payload.len() as u64, None).unwrap();
        w.write(&payload[..8]).unwrap();
        w.write(&payload[8..]).unwrap();
        assert_eq!(w.write_pos(), payload.len() as u64);
        w.close().unwrap();
        w.close().unwrap(); // idempotent

        let mut r = MemoryMappedFile::open_read(&path).unwrap();
        let mut buf = vec![0u8; payload.len()];
        r.read(&mut buf).unwrap();
        assert_eq!(&buf, payload);
        assert_eq!(r.slice(10, 3).unwrap(), b"abc");
    }

    #[test]
    fn out_of_range_access_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("small.bin");
        let mut w = MemoryMappedFile::create_write(&path, 4, None).unwrap();
        assert!(w.write_at(b"12345", 0).is_err());
        assert!(w.write_at(b"12", 3).is_err());
        w.write_at(b"1234", 0).unwrap();
        w.close().unwrap();

        let r = MemoryMappedFile::open_read(&path).unwrap();
        let mut buf = [0u8; 2];
        assert!(r.read_at(&mut buf, 3).is_err());
        assert!(r.read_at(&mut buf, u64::MAX).is_err());
    }

    #[test]
    fn empty_file_maps_without_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        let mut w = MemoryMappedFile::create_write(&path, 0, None).unwrap();
        assert!(w.is_empty());
        w.force().unwrap();
        w.close().unwrap();
        let r = MemoryMappedFile::open_read(&path).unwrap();
        assert_eq!(r.len(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn creation_applies_permission_bits() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exec.sh");
        let mut w = MemoryMappedFile::create_write(&path, 2, Some(0o755)).unwrap();
        w.write(b"#!").unwrap();
        w.close().unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o755);
    }

    #[test]
    fn writes_rejected_on_read_only_mapping() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ro.bin");
        std::fs::write(&path, b"abcd").unwrap();
        let mut r = MemoryMappedFile::open_read(&path).unwrap();
        assert!(r.write_at(b"x", 0).is_err());
    }
}
