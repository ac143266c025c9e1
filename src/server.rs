//! Server side: accept loop, per-connection lounge, workspace admission.
//!
//! Each accepted connection gets one lounge task. The lounge runs the
//! hello and auth phases, binds exclusively to a workspace, then
//! dispatches incoming messages until Bye or an error. Handler errors
//! close the connection and release the workspace; the accept loop keeps
//! running.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::archive::{tmp_path, ExtractorPool};
use crate::auth;
use crate::config::{Role, WorkspaceConfig};
use crate::conn::Connection;
use crate::filter::RuleSet;
use crate::fsutil::{ensure_dir_exists, ensure_parent_exists, move_over, normalize_under_root, now_millis};
use crate::message::{encode_ack_list, Message};
use crate::mmap::MemoryMappedFile;
use crate::net::Socket;
use crate::plan::{plan_from_bytes, Action, SyncPlan};
use crate::protocol::{response_code, PROTOCOL_VERSION};
use crate::tree::{glob_files_relative, tree_to_bytes};

/// Tracks which `(role, workspace)` pairs are currently bound to a
/// lounge. At most one lounge may hold a pair at a time.
#[derive(Debug, Default)]
pub struct Admission {
    held: Mutex<HashSet<(Role, String)>>,
}

impl Admission {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Non-blocking acquire; the returned guard releases on drop, which
    /// covers every lounge exit path including panics unwinding the task.
    pub fn try_acquire(self: &Arc<Self>, role: Role, name: &str) -> Option<WorkspaceGuard> {
        let mut held = self.held.lock();
        if held.insert((role, name.to_string())) {
            Some(WorkspaceGuard {
                admission: Arc::clone(self),
                key: (role, name.to_string()),
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, role: Role, name: &str) -> bool {
        self.held.lock().contains(&(role, name.to_string()))
    }
}

pub struct WorkspaceGuard {
    admission: Arc<Admission>,
    key: (Role, String),
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        self.admission.held.lock().remove(&self.key);
    }
}

pub struct Server {
    bind: String,
    workspaces: Arc<Vec<WorkspaceConfig>>,
    admission: Arc<Admission>,
    tls: Option<tokio_rustls::TlsAcceptor>,
}

impl Server {
    pub fn new(
        bind: String,
        workspaces: Vec<WorkspaceConfig>,
        tls: Option<rustls::ServerConfig>,
    ) -> Self {
        Self {
            bind,
            workspaces: Arc::new(workspaces),
            admission: Admission::new(),
            tls: tls.map(|cfg| tokio_rustls::TlsAcceptor::from(Arc::new(cfg))),
        }
    }

    /// Accept connections forever, spawning one lounge task per client.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind)
            .await
            .with_context(|| format!("bind {}", self.bind))?;
        if self.tls.is_none() {
            warn!("TLS not configured: connections are cleartext");
        }
        info!("janus server listening on {}", self.bind);
        loop {
            let (stream, peer) = listener.accept().await.context("accept")?;
            stream.set_nodelay(true).ok();
            let workspaces = Arc::clone(&self.workspaces);
            let admission = Arc::clone(&self.admission);
            let tls = self.tls.clone();
            tokio::spawn(async move {
                debug!("connection from {}", peer);
                let sock = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(s) => Socket::TlsServer(Box::new(s)),
                        Err(e) => {
                            warn!("{}: TLS handshake failed: {}", peer, e);
                            return;
                        }
                    },
                    None => Socket::Plain(stream),
                };
                let conn = Connection::new(sock);
                if let Err(e) = run_lounge(conn, workspaces, admission).await {
                    warn!("{}: connection closed: {:#}", peer, e);
                }
            });
        }
    }
}

async fn run_lounge(
    mut conn: Connection,
    workspaces: Arc<Vec<WorkspaceConfig>>,
    admission: Arc<Admission>,
) -> Result<()> {
    server_hello(&mut conn).await?;
    let (workspace, _guard) = server_auth(&mut conn, &workspaces, &admission).await?;
    ensure_dir_exists(&workspace.path)?;
    info!(
        "workspace {} bound at {}",
        workspace.name,
        workspace.path.display()
    );

    let mut lounge = Lounge {
        extractor: ExtractorPool::new(&workspace.path),
        ignore: Arc::new(RuleSet::parse(&workspace.ignore_patterns)?),
        protect: Arc::new(RuleSet::parse(&workspace.protect_patterns)?),
        root: workspace.path.clone(),
        pending_file_acks: Vec::new(),
        stop: false,
        conn,
    };
    let result = lounge.dispatch().await;
    lounge.conn.shutdown().await;
    result
}

/// Three-way version negotiation, server side.
async fn server_hello(conn: &mut Connection) -> Result<()> {
    match conn.recv().await? {
        Message::Hello { versions } => {
            if versions.first() != Some(&PROTOCOL_VERSION) {
                bail!("client offered unsupported protocol versions {:?}", versions);
            }
        }
        other => bail!("expected Hello, got {}", other.type_name()),
    }
    conn.send(&Message::Hello {
        versions: vec![PROTOCOL_VERSION],
    })
    .await?;
    match conn.recv().await? {
        Message::Hello { versions } => {
            if versions.first() != Some(&PROTOCOL_VERSION) {
                bail!("client failed to confirm protocol version");
            }
        }
        other => bail!("expected confirming Hello, got {}", other.type_name()),
    }
    Ok(())
}

/// Challenge-response auth plus workspace admission. An unknown
/// workspace still goes through the motions so probing client names
/// learns nothing.
async fn server_auth(
    conn: &mut Connection,
    workspaces: &[WorkspaceConfig],
    admission: &Arc<Admission>,
) -> Result<(WorkspaceConfig, WorkspaceGuard)> {
    let requested = match conn.recv().await? {
        Message::Auth { payload } => String::from_utf8(payload).context("workspace name")?,
        other => bail!("expected Auth, got {}", other.type_name()),
    };
    let workspace = workspaces
        .iter()
        .find(|w| w.role == Role::Server && w.name == requested);

    let challenge = auth::random_challenge();
    conn.send(&Message::Auth {
        payload: challenge.clone(),
    })
    .await?;
    let response = match conn.recv().await? {
        Message::Auth { payload } => payload,
        other => bail!("expected Auth response, got {}", other.type_name()),
    };

    let verified = workspace.filter(|ws| match &ws.aes_key {
        Some(key) => auth::decrypt_challenge(key, &response)
            .map(|opened| opened == challenge)
            .unwrap_or(false),
        None => {
            if response == challenge {
                warn!(
                    "workspace {} accepted without a key: configure a secret",
                    ws.name
                );
                true
            } else {
                false
            }
        }
    });

    let workspace = match verified {
        Some(ws) => ws,
        None => {
            conn.send(&Message::CommonResponse {
                code: response_code::AUTH_FAILED,
                msg: "authentication failed".to_string(),
                data: Vec::new(),
            })
            .await?;
            bail!("authentication failed for workspace {:?}", requested);
        }
    };

    match admission.try_acquire(Role::Server, &workspace.name) {
        Some(guard) => {
            conn.send(&Message::CommonResponse {
                code: response_code::OK,
                msg: String::new(),
                data: Vec::new(),
            })
            .await?;
            Ok((workspace.clone(), guard))
        }
        None => {
            conn.send(&Message::CommonResponse {
                code: response_code::WORKSPACE_LOCKED,
                msg: workspace.name.clone(),
                data: Vec::new(),
            })
            .await?;
            bail!("workspace {} already locked", workspace.name);
        }
    }
}

struct Lounge {
    conn: Connection,
    root: std::path::PathBuf,
    ignore: Arc<RuleSet>,
    protect: Arc<RuleSet>,
    pending_file_acks: Vec<(u64, i32)>,
    extractor: ExtractorPool,
    stop: bool,
}

impl Lounge {
    async fn dispatch(&mut self) -> Result<()> {
        while !self.stop {
            let msg = self.conn.recv().await?;
            debug!("dispatch {}", msg.type_name());
            match msg {
                Message::FetchFileTree => self.on_fetch_tree().await?,
                Message::GetSystemTimeMillis => self.on_system_time().await?,
                Message::CommitSyncPlan { subtrees } => self.on_commit_plan(subtrees).await?,
                Message::UploadFile {
                    nonce,
                    perm,
                    size,
                    path,
                } => self.on_upload_file(nonce, perm, size, path).await?,
                Message::UploadArchive {
                    seq_id,
                    archive_size,
                } => self.on_upload_archive(seq_id, archive_size).await?,
                Message::ConfirmArchives { no_block } => self.on_confirm_archives(no_block).await?,
                Message::ConfirmFiles => self.on_confirm_files().await?,
                Message::Bye => {
                    self.conn.send(&Message::Bye).await?;
                    self.stop = true;
                }
                other => bail!("unexpected {} in ready state", other.type_name()),
            }
        }
        Ok(())
    }

    async fn respond_ok(&mut self, data: Vec<u8>) -> Result<()> {
        self.conn
            .send(&Message::CommonResponse {
                code: response_code::OK,
                msg: String::new(),
                data,
            })
            .await
    }

    async fn on_fetch_tree(&mut self) -> Result<()> {
        let root = self.root.clone();
        let ignore = Arc::clone(&self.ignore);
        let tree = tokio::task::spawn_blocking(move || glob_files_relative(&root, &ignore))
            .await
            .context("tree walk task")??;
        self.respond_ok(tree_to_bytes(&tree)).await
    }

    async fn on_system_time(&mut self) -> Result<()> {
        self.respond_ok((now_millis() as u64).to_be_bytes().to_vec())
            .await
    }

    /// Apply the committed plan: deletions first (honouring the protect
    /// list), then directory pre-creation for uploads. File contents
    /// arrive afterwards through UploadFile/UploadArchive.
    async fn on_commit_plan(&mut self, subtrees: Vec<Vec<u8>>) -> Result<()> {
        let forest: Vec<SyncPlan> = subtrees
            .iter()
            .map(|bytes| plan_from_bytes(bytes))
            .collect::<Result<_>>()
            .context("decode sync plan")?;
        let root = self.root.clone();
        let protect = Arc::clone(&self.protect);
        let actions: usize = forest.iter().map(SyncPlan::action_count).sum();
        tokio::task::spawn_blocking(move || -> Result<()> {
            for node in &forest {
                apply_plan_node(&root, node, &protect)?;
            }
            Ok(())
        })
        .await
        .context("plan apply task")??;
        info!("plan committed: {} actions", actions);
        self.respond_ok(Vec::new()).await
    }

    /// Receive one large file into `path.janus-sync-tmp` and move it over
    /// the target. Path escapes are fatal for the connection; local I/O
    /// failures only fail this file's ACK, and the declared bytes are
    /// consumed either way so framing survives.
    async fn on_upload_file(
        &mut self,
        nonce: u64,
        perm: u32,
        size: u64,
        path: String,
    ) -> Result<()> {
        let target = normalize_under_root(&self.root, Path::new(&path))
            .with_context(|| format!("UploadFile path {:?}", path))?;

        let mut sink = match prepare_file_sink(&target, perm, size) {
            Ok(sink) => Some(sink),
            Err(e) => {
                warn!("cannot write {}: {:#}", target.display(), e);
                None
            }
        };

        let mut received = 0u64;
        while received < size {
            let data = match self.conn.recv().await? {
                Message::DataBlock { data } => data,
                other => bail!(
                    "expected DataBlock for {} ({} of {} bytes), got {}",
                    path,
                    received,
                    size,
                    other.type_name()
                ),
            };
            if received + data.len() as u64 > size {
                bail!("DataBlock overruns declared size of {}", path);
            }
            if let Some(file) = sink.as_mut() {
                if let Err(e) = file.write(&data) {
                    warn!("write {} failed: {:#}", target.display(), e);
                    let _ = std::fs::remove_file(tmp_path(&target));
                    sink = None;
                }
            }
            received += data.len() as u64;
            self.conn.recycle(data);
        }

        let status = match sink {
            Some(mut file) => match finish_file_sink(&mut file, &target) {
                Ok(()) => 0,
                Err(e) => {
                    warn!("finalize {} failed: {:#}", target.display(), e);
                    1
                }
            },
            None => 1,
        };
        self.pending_file_acks.push((nonce, status));
        Ok(())
    }

    /// Splice archive data blocks into the extractor pool. The response
    /// acknowledges the transfer; extraction status arrives later via
    /// ConfirmArchives.
    async fn on_upload_archive(&mut self, seq_id: u64, archive_size: u64) -> Result<()> {
        let sink = self.extractor.extract(seq_id, archive_size);
        let mut received = 0u64;
        let mut feeding = true;
        while received < archive_size {
            let data = match self.conn.recv().await? {
                Message::DataBlock { data } => data,
                other => bail!(
                    "expected DataBlock for archive {} ({} of {} bytes), got {}",
                    seq_id,
                    received,
                    archive_size,
                    other.type_name()
                ),
            };
            if received + data.len() as u64 > archive_size {
                bail!("DataBlock overruns archive {} declared size", seq_id);
            }
            received += data.len() as u64;
            if feeding {
                // A dead extractor already recorded its failure; keep
                // draining so the connection stays framed.
                if sink.feed(data).await.is_err() {
                    feeding = false;
                }
            } else {
                self.conn.recycle(data);
            }
        }
        drop(sink);
        self.respond_ok(Vec::new()).await
    }

    async fn on_confirm_archives(&mut self, no_block: bool) -> Result<()> {
        let done = self.extractor.check_extracted(!no_block).await;
        self.respond_ok(encode_ack_list(&done)).await
    }

    async fn on_confirm_files(&mut self) -> Result<()> {
        let acks = std::mem::take(&mut self.pending_file_acks);
        self.respond_ok(encode_ack_list(&acks)).await
    }
}

fn prepare_file_sink(target: &Path, perm: u32, size: u64) -> Result<MemoryMappedFile> {
    ensure_parent_exists(target)?;
    MemoryMappedFile::create_write(&tmp_path(target), size, Some(perm))
}

fn finish_file_sink(file: &mut MemoryMappedFile, target: &Path) -> Result<()> {
    file.force()?;
    file.close()?;
    move_over(&tmp_path(target), target)
}

fn apply_plan_node(root: &Path, node: &SyncPlan, protect: &RuleSet) -> Result<()> {
    match node.action {
        Action::DeleteRemote => {
            let abs = match normalize_under_root(root, &node.path) {
                Ok(p) => p,
                Err(e) => {
                    warn!("refusing deletion of {:?}: {}", node.path, e);
                    return Ok(());
                }
            };
            delete_protected(&abs, &node.path, protect);
        }
        Action::Upload if node.is_dir() => {
            let abs = normalize_under_root(root, &node.path)
                .with_context(|| format!("upload directory {:?}", node.path))?;
            ensure_dir_exists(&abs)?;
        }
        Action::Upload | Action::None => {}
    }
    for child in &node.children {
        apply_plan_node(root, child, protect)?;
    }
    Ok(())
}

/// Recursive deletion that leaves protected paths (and their ancestors)
/// in place. Returns true when anything under `abs` survived.
fn delete_protected(abs: &Path, rel: &Path, protect: &RuleSet) -> bool {
    let md = match std::fs::symlink_metadata(abs) {
        Ok(md) => md,
        Err(_) => return false, // already gone
    };
    let is_dir = md.is_dir();
    if protect.matches(rel, is_dir) {
        info!("protect rule keeps {}", rel.display());
        return true;
    }
    if is_dir {
        let mut survivors = false;
        if let Ok(entries) = std::fs::read_dir(abs) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                survivors |= delete_protected(&entry.path(), &rel.join(&name), protect);
            }
        }
        if survivors {
            return true;
        }
        if let Err(e) = std::fs::remove_dir(abs) {
            warn!("delete {} failed: {}", abs.display(), e);
            return true;
        }
        false
    } else {
        if let Err(e) = std::fs::remove_file(abs) {
            warn!("delete {} failed: {}", abs.display(), e);
            return true;
        }
        false
    }
}
