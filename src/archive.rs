//! Small-file archive packing and concurrent extraction.
//!
//! Files at or below the small-file limit are batched into a single linear
//! archive: per entry `path_len u32 | perm u32 | data_len u64 | path |
//! data`, repeated until the declared archive size is consumed. The client
//! packs through mmapped reads; the server parses the stream off a bounded
//! channel and writes each entry through mmap into a temp file that is
//! moved over the target.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::fsutil::{ensure_parent_exists, move_over, normalize_under_root};
use crate::mmap::MemoryMappedFile;
use crate::protocol::{
    ARCHIVE_ENTRY_HEADER_LEN, ARCHIVE_FILE_LIMIT, ARCHIVE_SIZE_LIMIT, EXTRACT_CHANNEL_BLOCKS,
    TMP_SUFFIX,
};

#[derive(Debug, Clone)]
struct PendingEntry {
    /// Wire path, `/`-separated.
    rel_path: String,
    abs_path: PathBuf,
    perm: u32,
    size: u64,
}

/// Accumulates small files destined for one archive.
///
/// `add` only records metadata; the bytes are read when the holder is
/// frozen into [`SmallFilesHolder::to_bytes`], which runs off the async
/// threads so the upload loop keeps moving.
#[derive(Debug)]
pub struct SmallFilesHolder {
    root: PathBuf,
    entries: Vec<PendingEntry>,
    projected_size: u64,
}

impl SmallFilesHolder {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            entries: Vec::new(),
            projected_size: 0,
        }
    }

    /// Queue `rel` (relative to the workspace root) for this archive.
    pub fn add(&mut self, rel: &Path, perm: u32, size: u64) {
        let rel_path = wire_path(rel);
        self.projected_size +=
            (ARCHIVE_ENTRY_HEADER_LEN + rel_path.len()) as u64 + size;
        self.entries.push(PendingEntry {
            abs_path: self.root.join(rel),
            rel_path,
            perm,
            size,
        });
    }

    pub fn file_count(&self) -> usize {
        self.entries.len()
    }

    pub fn projected_size(&self) -> u64 {
        self.projected_size
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once the holder should be frozen and a new one started.
    pub fn is_nearly_full(&self) -> bool {
        self.projected_size >= ARCHIVE_SIZE_LIMIT || self.entries.len() >= ARCHIVE_FILE_LIMIT
    }

    /// Serialise every entry into one linear buffer. Files that vanished
    /// or shrank since the walk are dropped with a warning; the sync is
    /// not failed for them.
    pub fn to_bytes(self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.projected_size.min(ARCHIVE_SIZE_LIMIT * 2) as usize);
        for entry in self.entries {
            let mapped = match MemoryMappedFile::open_read(&entry.abs_path) {
                Ok(m) => m,
                Err(e) => {
                    warn!("skipping {}: {}", entry.abs_path.display(), e);
                    continue;
                }
            };
            if mapped.len() != entry.size {
                warn!(
                    "skipping {}: size changed from {} to {} during sync",
                    entry.abs_path.display(),
                    entry.size,
                    mapped.len()
                );
                continue;
            }
            out.extend_from_slice(&(entry.rel_path.len() as u32).to_be_bytes());
            out.extend_from_slice(&entry.perm.to_be_bytes());
            out.extend_from_slice(&entry.size.to_be_bytes());
            out.extend_from_slice(entry.rel_path.as_bytes());
            let start = out.len();
            out.resize(start + entry.size as usize, 0);
            mapped
                .read_at(&mut out[start..], 0)
                .with_context(|| format!("read {}", entry.abs_path.display()))?;
        }
        Ok(out)
    }
}

fn wire_path(rel: &Path) -> String {
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}

/// Feeds one archive's bytes to its extraction task. Dropping the sink
/// early closes the channel and the task reports failure.
pub struct ArchiveSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl ArchiveSink {
    pub async fn feed(&self, block: Vec<u8>) -> Result<()> {
        self.tx
            .send(block)
            .await
            .map_err(|_| anyhow::anyhow!("archive extractor terminated early"))
    }
}

/// Server-side pool of concurrent archive extraction tasks, one per
/// received archive, each fed through a bounded channel that stalls the
/// network receiver when the disk cannot keep up.
pub struct ExtractorPool {
    root: PathBuf,
    running: Vec<(u64, JoinHandle<i32>)>,
}

impl ExtractorPool {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            running: Vec::new(),
        }
    }

    /// Start extracting an archive of `archive_size` bytes. The returned
    /// sink accepts the data blocks as they arrive off the socket.
    pub fn extract(&mut self, seq_id: u64, archive_size: u64) -> ArchiveSink {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(EXTRACT_CHANNEL_BLOCKS);
        let root = self.root.clone();
        let handle = tokio::task::spawn_blocking(move || {
            match extract_archive(&root, rx, archive_size) {
                Ok(()) => 0,
                Err(e) => {
                    warn!("archive {} extraction failed: {:#}", seq_id, e);
                    1
                }
            }
        });
        self.running.push((seq_id, handle));
        ArchiveSink { tx }
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Collect finished extractions as `(seq_id, status)` pairs, status 0
    /// on success. With `block_until_some`, waits for the oldest running
    /// task when none have finished yet.
    pub async fn check_extracted(&mut self, block_until_some: bool) -> Vec<(u64, i32)> {
        let mut done = Vec::new();
        let mut i = 0;
        while i < self.running.len() {
            if self.running[i].1.is_finished() {
                let (seq_id, handle) = self.running.remove(i);
                done.push((seq_id, handle.await.unwrap_or(1)));
            } else {
                i += 1;
            }
        }
        if done.is_empty() && block_until_some && !self.running.is_empty() {
            let (seq_id, handle) = self.running.remove(0);
            done.push((seq_id, handle.await.unwrap_or(1)));
        }
        done
    }
}

/// Blocking half of the extraction: pull blocks off the channel, parse
/// entries inline and write each through mmap. Entries whose path escapes
/// the workspace root are skipped with a warning; their bytes are
/// consumed and discarded. I/O failures fail the whole archive.
fn extract_archive(root: &Path, rx: mpsc::Receiver<Vec<u8>>, archive_size: u64) -> Result<()> {
    let mut feed = ByteFeed::new(rx, archive_size);
    let mut header = [0u8; ARCHIVE_ENTRY_HEADER_LEN];
    while feed.consumed() < archive_size {
        feed.read_exact(&mut header).context("archive entry header")?;
        let path_len = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
        let perm = u32::from_be_bytes(header[4..8].try_into().unwrap());
        let data_len = u64::from_be_bytes(header[8..16].try_into().unwrap());

        let mut path_buf = vec![0u8; path_len];
        feed.read_exact(&mut path_buf).context("archive entry path")?;
        let rel = std::str::from_utf8(&path_buf).context("archive entry path is not UTF-8")?;

        let target = match normalize_under_root(root, Path::new(rel)) {
            Ok(p) => p,
            Err(e) => {
                warn!("refusing archive entry {:?}: {}", rel, e);
                feed.skip(data_len).context("skip refused entry")?;
                continue;
            }
        };
        write_entry(&mut feed, &target, perm, data_len)
            .with_context(|| format!("write archive entry {:?}", rel))?;
    }
    Ok(())
}

fn write_entry(feed: &mut ByteFeed, target: &Path, perm: u32, data_len: u64) -> Result<()> {
    ensure_parent_exists(target)?;
    let tmp = tmp_path(target);
    let mut out = MemoryMappedFile::create_write(&tmp, data_len, Some(perm))?;
    let mut chunk = [0u8; 64 * 1024];
    let mut remaining = data_len;
    while remaining > 0 {
        let n = chunk.len().min(remaining as usize);
        if let Err(e) = feed.read_exact(&mut chunk[..n]) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        if let Err(e) = out.write(&chunk[..n]) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        remaining -= n as u64;
    }
    out.force()?;
    out.close()?;
    move_over(&tmp, target)
}

pub fn tmp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(TMP_SUFFIX);
    target.with_file_name(name)
}

/// Blocking reader over the archive byte channel, capped at the declared
/// archive size.
struct ByteFeed {
    rx: mpsc::Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
    consumed: u64,
    limit: u64,
}

impl ByteFeed {
    fn new(rx: mpsc::Receiver<Vec<u8>>, limit: u64) -> Self {
        Self {
            rx,
            buf: Vec::new(),
            pos: 0,
            consumed: 0,
            limit,
        }
    }

    fn consumed(&self) -> u64 {
        self.consumed
    }

    fn fill(&mut self) -> Result<()> {
        if self.pos < self.buf.len() {
            return Ok(());
        }
        match self.rx.blocking_recv() {
            Some(chunk) => {
                self.buf = chunk;
                self.pos = 0;
                Ok(())
            }
            None => bail!(
                "archive stream ended after {} of {} bytes",
                self.consumed,
                self.limit
            ),
        }
    }

    fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        if self.consumed + out.len() as u64 > self.limit {
            bail!(
                "archive entry overruns declared size ({} + {} > {})",
                self.consumed,
                out.len(),
                self.limit
            );
        }
        let mut filled = 0usize;
        while filled < out.len() {
            self.fill()?;
            let n = (out.len() - filled).min(self.buf.len() - self.pos);
            out[filled..filled + n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            filled += n;
        }
        self.consumed += out.len() as u64;
        Ok(())
    }

    fn skip(&mut self, mut n: u64) -> Result<()> {
        if self.consumed + n > self.limit {
            bail!("archive skip overruns declared size");
        }
        while n > 0 {
            self.fill()?;
            let step = n.min((self.buf.len() - self.pos) as u64);
            self.pos += step as usize;
            self.consumed += step;
            n -= step;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn holder_with(root: &Path, files: &[(&str, &[u8], u32)]) -> SmallFilesHolder {
        let mut holder = SmallFilesHolder::new(root);
        for (rel, data, perm) in files {
            let abs = root.join(rel);
            std::fs::create_dir_all(abs.parent().unwrap()).unwrap();
            std::fs::write(&abs, data).unwrap();
            holder.add(Path::new(rel), *perm, data.len() as u64);
        }
        holder
    }

    #[test]
    fn rollover_thresholds_are_inclusive() {
        let dir = TempDir::new().unwrap();
        let mut holder = SmallFilesHolder::new(dir.path());
        assert!(!holder.is_nearly_full());
        for i in 0..ARCHIVE_FILE_LIMIT - 1 {
            holder.add(Path::new(&format!("f{i}")), 0o644, 1);
        }
        assert!(!holder.is_nearly_full());
        holder.add(Path::new("last"), 0o644, 1);
        assert!(holder.is_nearly_full());

        let mut big = SmallFilesHolder::new(dir.path());
        let entry_overhead = (ARCHIVE_ENTRY_HEADER_LEN + 1) as u64;
        big.add(Path::new("x"), 0o644, ARCHIVE_SIZE_LIMIT - entry_overhead - 1);
        assert!(!big.is_nearly_full());
        big.add(Path::new("y"), 0o644, 1 + entry_overhead);
        assert!(big.is_nearly_full());
    }

    #[test]
    fn pack_produces_parseable_entries() {
        let dir = TempDir::new().unwrap();
        let holder = holder_with(
            dir.path(),
            &[("a.txt", b"hello", 0o644), ("sub/b.bin", &[7u8; 300], 0o600)],
        );
        let bytes = holder.to_bytes().unwrap();

        // First entry header.
        let path_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        assert_eq!(path_len, "a.txt".len());
        let perm = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(perm, 0o644);
        let data_len = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
        assert_eq!(data_len, 5);
        assert_eq!(&bytes[16..16 + path_len], b"a.txt");
        assert_eq!(&bytes[16 + path_len..16 + path_len + 5], b"hello");
    }

    #[test]
    fn vanished_files_are_dropped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let mut holder = holder_with(dir.path(), &[("keep.txt", b"data", 0o644)]);
        holder.add(Path::new("ghost.txt"), 0o644, 4);
        let bytes = holder.to_bytes().unwrap();
        let path_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        assert_eq!(&bytes[16..16 + path_len], b"keep.txt");
        // Only the surviving entry is present.
        assert_eq!(bytes.len(), 16 + path_len + 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn extract_round_trip_with_permissions() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let holder = holder_with(
            src.path(),
            &[
                ("one.txt", b"first", 0o640),
                ("deep/two.txt", &[9u8; 1024], 0o755),
            ],
        );
        let bytes = holder.to_bytes().unwrap();
        let total = bytes.len() as u64;

        let mut pool = ExtractorPool::new(dst.path());
        let sink = pool.extract(1, total);
        // Feed in deliberately awkward chunk sizes.
        for chunk in bytes.chunks(37) {
            sink.feed(chunk.to_vec()).await.unwrap();
        }
        drop(sink);

        let done = pool.check_extracted(true).await;
        assert_eq!(done, vec![(1, 0)]);
        assert_eq!(std::fs::read(dst.path().join("one.txt")).unwrap(), b"first");
        assert_eq!(
            std::fs::read(dst.path().join("deep/two.txt")).unwrap(),
            vec![9u8; 1024]
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dst.path().join("one.txt"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o7777, 0o640);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn traversal_entries_are_skipped_without_failing() {
        let dst = TempDir::new().unwrap();
        let mut bytes = Vec::new();
        // Malicious entry first.
        let evil_path = b"../evil.txt";
        bytes.extend_from_slice(&(evil_path.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&0o644u32.to_be_bytes());
        bytes.extend_from_slice(&4u64.to_be_bytes());
        bytes.extend_from_slice(evil_path);
        bytes.extend_from_slice(b"evil");
        // Honest entry second.
        bytes.extend_from_slice(&(b"ok.txt".len() as u32).to_be_bytes());
        bytes.extend_from_slice(&0o644u32.to_be_bytes());
        bytes.extend_from_slice(&2u64.to_be_bytes());
        bytes.extend_from_slice(b"ok.txt");
        bytes.extend_from_slice(b"ok");

        let mut pool = ExtractorPool::new(dst.path());
        let sink = pool.extract(5, bytes.len() as u64);
        sink.feed(bytes).await.unwrap();
        drop(sink);

        let done = pool.check_extracted(true).await;
        assert_eq!(done, vec![(5, 0)]);
        assert!(!dst.path().parent().unwrap().join("evil.txt").exists());
        assert_eq!(std::fs::read(dst.path().join("ok.txt")).unwrap(), b"ok");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn truncated_stream_reports_failure() {
        let dst = TempDir::new().unwrap();
        let mut pool = ExtractorPool::new(dst.path());
        let sink = pool.extract(9, 1000);
        sink.feed(vec![0u8; 10]).await.unwrap();
        drop(sink); // channel closes 990 bytes short
        let done = pool.check_extracted(true).await;
        assert_eq!(done, vec![(9, 1)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nonblocking_check_returns_empty_while_running() {
        let dst = TempDir::new().unwrap();
        let mut pool = ExtractorPool::new(dst.path());
        let sink = pool.extract(3, 4);
        // Nothing fed yet: the task is parked on the channel.
        let done = pool.check_extracted(false).await;
        assert!(done.is_empty());
        assert_eq!(pool.in_flight(), 1);
        sink.feed(vec![0, 0, 0, 0]).await.unwrap();
        // A 4-byte archive with a bogus header is a failure, but it must
        // still be reported exactly once.
        drop(sink);
        let done = pool.check_extracted(true).await;
        assert_eq!(done.len(), 1);
        assert_eq!(pool.in_flight(), 0);
    }
}
