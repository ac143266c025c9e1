//! Client driver: orchestrates one full push of a workspace.
//!
//! Phases: connect and handshake, parallel clock probe / remote tree
//! fetch / local walk, plan build and commit, breadth-first upload with
//! archive batching, ACK drains, Bye. Failures propagate upward; nothing
//! retries automatically.

use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::archive::SmallFilesHolder;
use crate::auth;
use crate::config::{DanglingPolicy, TlsMaterial, WorkspaceConfig};
use crate::conn::{connect_tcp, Connection};
use crate::filter::RuleSet;
use crate::fsutil::perm_bits;
use crate::mmap::MemoryMappedFile;
use crate::net::Socket;
use crate::plan::{build_plan, strip_deletes, Action, SyncPlan};
use crate::protocol::SMALL_FILE_LIMIT;
use crate::tls;
use crate::tree::glob_files_relative;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Drain per-file ACKs whenever this many are outstanding.
    pub ack_pending_limit: usize,
    pub dangling: DanglingPolicy,
    pub connect_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            ack_pending_limit: 256,
            dangling: DanglingPolicy::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub planned_actions: usize,
    pub files_uploaded: u64,
    pub archives_uploaded: u64,
    pub bytes_sent: u64,
    pub clock_skew_millis: i64,
    pub elapsed: Duration,
}

impl SyncReport {
    pub fn throughput_mib_s(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= f64::EPSILON {
            return 0.0;
        }
        self.bytes_sent as f64 / (1024.0 * 1024.0) / secs
    }
}

/// Push `workspace` to the server at `host:port` (overridden by the
/// workspace's own host/port when set).
pub async fn run_sync(
    workspace: &WorkspaceConfig,
    host: &str,
    port: u16,
    opts: &SyncOptions,
) -> Result<SyncReport> {
    let start = Instant::now();
    let host = workspace.host.as_deref().unwrap_or(host);
    let port = workspace.port.unwrap_or(port);

    let mut conn = open_connection(host, port, workspace.tls.as_ref(), opts.connect_timeout).await?;
    conn.client_hello().await.context("hello")?;
    conn.client_auth(&workspace.remote_name, workspace.aes_key.as_ref())
        .await?;
    info!("authenticated against workspace {}", workspace.remote_name);

    // Local walk in parallel with the wire round trips.
    let ignore = Arc::new(RuleSet::parse(&workspace.ignore_patterns)?);
    let walk_root = workspace.path.clone();
    let walk_ignore = Arc::clone(&ignore);
    let walk = tokio::task::spawn_blocking(move || glob_files_relative(&walk_root, &walk_ignore));

    let skew = conn.probe_clock_skew().await?;
    debug!("clock skew {} ms", skew);
    let remote_tree = conn.fetch_file_tree().await?;
    let local_tree = walk.await.context("walk task")??;

    let mut forest = build_plan(Some(&local_tree), remote_tree.as_ref(), skew);
    match opts.dangling {
        DanglingPolicy::Remove => {}
        DanglingPolicy::Keep => forest = strip_deletes(forest),
        DanglingPolicy::Panic => {
            if forest.iter().any(SyncPlan::contains_delete) {
                bail!("plan would delete remote files and --dangling panic is set");
            }
        }
    }
    let planned_actions: usize = forest.iter().map(SyncPlan::action_count).sum();
    info!("plan built: {} actions", planned_actions);

    conn.commit_plan(&forest).await?;

    let mut uploader = Uploader {
        conn,
        root: workspace.path.clone(),
        holder: SmallFilesHolder::new(&workspace.path),
        pending_pack: None,
        next_seq: 0,
        in_flight_archives: HashSet::new(),
        pending_files: HashMap::new(),
        failures: Vec::new(),
        report: SyncReport {
            planned_actions,
            clock_skew_millis: skew,
            ..SyncReport::default()
        },
        ack_pending_limit: opts.ack_pending_limit.max(1),
    };

    uploader.upload_forest(&forest).await?;
    uploader.drain().await?;

    let Uploader {
        mut conn,
        failures,
        mut report,
        ..
    } = uploader;

    if !failures.is_empty() {
        bail!(
            "{} transfer(s) failed: {}",
            failures.len(),
            failures.join(", ")
        );
    }

    conn.bye().await?;
    conn.shutdown().await;
    report.elapsed = start.elapsed();
    Ok(report)
}

async fn open_connection(
    host: &str,
    port: u16,
    tls_material: Option<&TlsMaterial>,
    timeout: Duration,
) -> Result<Connection> {
    let stream = connect_tcp(host, port, timeout).await?;
    let sock = match tls_material {
        Some(material) => {
            let cfg = tls::load_client_config(&material.cert)?;
            let connector = tokio_rustls::TlsConnector::from(Arc::new(cfg));
            let tls_stream = connector
                .connect(tls::server_name_for(host), stream)
                .await
                .context("TLS handshake")?;
            Socket::TlsClient(Box::new(tls_stream))
        }
        None => {
            warn!("TLS not configured: transport is cleartext");
            Socket::Plain(stream)
        }
    };
    Ok(Connection::new(sock))
}

struct Uploader {
    conn: Connection,
    root: std::path::PathBuf,
    holder: SmallFilesHolder,
    pending_pack: Option<tokio::task::JoinHandle<Result<Vec<u8>>>>,
    next_seq: u64,
    in_flight_archives: HashSet<u64>,
    /// nonce -> wire path, awaiting server ACK.
    pending_files: HashMap<u64, String>,
    failures: Vec<String>,
    report: SyncReport,
    ack_pending_limit: usize,
}

impl Uploader {
    /// Breadth-first walk over the plan, batching small files and
    /// streaming large ones.
    async fn upload_forest(&mut self, forest: &[SyncPlan]) -> Result<()> {
        let mut queue: VecDeque<&SyncPlan> = forest.iter().collect();
        while let Some(node) = queue.pop_front() {
            if node.action == Action::Upload && !node.is_dir() {
                self.upload_file_node(node).await?;
            }
            queue.extend(node.children.iter());
        }
        Ok(())
    }

    async fn upload_file_node(&mut self, node: &SyncPlan) -> Result<()> {
        let abs = self.root.join(&node.path);
        let md = match std::fs::metadata(&abs) {
            Ok(md) if md.is_file() => md,
            Ok(_) => {
                warn!("{} is no longer a file, skipping", abs.display());
                return Ok(());
            }
            Err(e) => {
                warn!("{} vanished during sync: {}", abs.display(), e);
                return Ok(());
            }
        };
        let size = md.len();
        let perm = perm_bits(&md);

        if size <= SMALL_FILE_LIMIT {
            self.holder.add(&node.path, perm, size);
            if self.holder.is_nearly_full() {
                self.rotate_holder().await?;
            }
            return Ok(());
        }

        let wire_path = wire_path(&node.path);
        let file = match MemoryMappedFile::open_read(&abs) {
            Ok(f) => f,
            Err(e) => {
                warn!("cannot map {}: {:#}", abs.display(), e);
                self.failures.push(wire_path);
                return Ok(());
            }
        };
        let nonce = auth::random_nonce();
        self.conn
            .upload_file(nonce, perm, &wire_path, &file)
            .await
            .with_context(|| format!("upload {}", wire_path))?;
        self.pending_files.insert(nonce, wire_path);
        self.report.files_uploaded += 1;
        self.report.bytes_sent += file.len();

        if self.pending_files.len() >= self.ack_pending_limit {
            self.drain_file_acks().await?;
        }
        Ok(())
    }

    /// Freeze the current holder into a background packing task, shipping
    /// the previously packed archive first so at most one pack is in
    /// flight.
    async fn rotate_holder(&mut self) -> Result<()> {
        self.ship_pending_pack().await?;
        let full = std::mem::replace(&mut self.holder, SmallFilesHolder::new(&self.root));
        if full.is_empty() {
            return Ok(());
        }
        self.pending_pack = Some(tokio::task::spawn_blocking(move || full.to_bytes()));
        Ok(())
    }

    async fn ship_pending_pack(&mut self) -> Result<()> {
        if let Some(handle) = self.pending_pack.take() {
            let bytes = handle.await.context("archive pack task")??;
            if bytes.is_empty() {
                return Ok(());
            }
            self.next_seq += 1;
            let seq_id = self.next_seq;
            self.conn
                .upload_archive(seq_id, &bytes)
                .await
                .with_context(|| format!("upload archive {}", seq_id))?;
            self.in_flight_archives.insert(seq_id);
            self.report.archives_uploaded += 1;
            self.report.bytes_sent += bytes.len() as u64;
        }
        Ok(())
    }

    async fn drain_file_acks(&mut self) -> Result<()> {
        for (nonce, code) in self.conn.confirm_files().await? {
            match self.pending_files.remove(&nonce) {
                Some(path) if code != 0 => {
                    warn!("server reported failure {} for {}", code, path);
                    self.failures.push(path);
                }
                Some(_) => {}
                None => warn!("ACK for unknown nonce {}", nonce),
            }
        }
        Ok(())
    }

    /// Phase 5: flush the tail archive, then loop ConfirmArchives until
    /// every in-flight seq id reported, and clear remaining file ACKs.
    async fn drain(&mut self) -> Result<()> {
        self.rotate_holder().await?;
        self.ship_pending_pack().await?;

        while !self.in_flight_archives.is_empty() {
            let acks = self.conn.confirm_archives(false).await?;
            if acks.is_empty() {
                bail!(
                    "server lost track of {} archive(s)",
                    self.in_flight_archives.len()
                );
            }
            for (seq_id, code) in acks {
                if !self.in_flight_archives.remove(&seq_id) {
                    warn!("ACK for unknown archive {}", seq_id);
                    continue;
                }
                if code != 0 {
                    warn!("archive {} failed with status {}", seq_id, code);
                    self.failures.push(format!("archive #{}", seq_id));
                }
            }
        }

        self.drain_file_acks().await?;
        if !self.pending_files.is_empty() {
            bail!(
                "{} file ACK(s) never arrived",
                self.pending_files.len()
            );
        }
        Ok(())
    }
}

fn wire_path(rel: &Path) -> String {
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}
