//! Stateful request/response layer over a [`Socket`].
//!
//! A `Connection` exclusively owns its socket; every send and receive
//! goes through `&mut self`, so frames on one connection are strictly
//! serialised and DataBlocks always belong to the operation announced
//! immediately before them. The client-side protocol operations live
//! here; the server's dispatcher drives the same primitives from the
//! lounge.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::auth;
use crate::fsutil::now_millis;
use crate::message::{decode_ack_list, BufferPool, Message};
use crate::mmap::MemoryMappedFile;
use crate::net::Socket;
use crate::plan::{plan_to_bytes, SyncPlan};
use crate::protocol::{
    msg_type, response_code, DATA_BLOCK_LEN, HEADER_LEN, MAGIC, PROTOCOL_VERSION,
};
use crate::tree::{tree_from_bytes, FileTree};

/// Raised when the server refuses admission because another client holds
/// the workspace. The binary maps this to exit code 2.
#[derive(Debug)]
pub struct WorkspaceLocked(pub String);

impl fmt::Display for WorkspaceLocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "workspace locked by another client: {}", self.0)
    }
}

impl std::error::Error for WorkspaceLocked {}

pub struct Connection {
    sock: Socket,
    pool: Arc<BufferPool>,
}

impl Connection {
    pub fn new(sock: Socket) -> Self {
        Self {
            sock,
            pool: BufferPool::new(32),
        }
    }

    /// Hand a DataBlock buffer back for reuse.
    pub fn recycle(&self, buf: Vec<u8>) {
        self.pool.recycle(buf);
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let mut body = self.pool.acquire();
        msg.encode_body(&mut body);
        let res = self.send_frame(msg.type_code(), &body).await;
        self.pool.recycle(body);
        res.with_context(|| format!("send {}", msg.type_name()))
    }

    /// Send one DataBlock without copying the payload into a `Message`.
    pub async fn send_data_block(&mut self, data: &[u8]) -> Result<()> {
        self.send_frame(msg_type::DATA_BLOCK, data)
            .await
            .context("send DataBlock")
    }

    async fn send_frame(&mut self, type_code: u32, body: &[u8]) -> Result<()> {
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(MAGIC);
        header[4..8].copy_from_slice(&type_code.to_be_bytes());
        header[8..16].copy_from_slice(&(body.len() as u64).to_be_bytes());
        self.sock.write_all(&header).await?;
        if !body.is_empty() {
            self.sock.write_all(body).await?;
        }
        Ok(())
    }

    /// Receive the next message. DataBlock payloads are moved out of the
    /// pooled read buffer rather than copied; return them with
    /// [`Connection::recycle`] when drained.
    pub async fn recv(&mut self) -> Result<Message> {
        let mut header = [0u8; HEADER_LEN];
        self.sock
            .read_exact(&mut header)
            .await
            .context("read frame header")?;
        let (type_code, body_len) = Message::decode_header(&header)?;
        let mut body = self.pool.acquire();
        body.resize(body_len as usize, 0);
        if body_len > 0 {
            self.sock
                .read_exact(&mut body)
                .await
                .context("read frame body")?;
        }
        if type_code == msg_type::DATA_BLOCK {
            return Ok(Message::DataBlock { data: body });
        }
        let msg = Message::decode_body(type_code, &body);
        self.pool.recycle(body);
        msg
    }

    /// Receive and insist on a `CommonResponse`; non-zero codes become
    /// errors (fatal client-side).
    pub async fn expect_ok(&mut self) -> Result<(String, Vec<u8>)> {
        match self.recv().await? {
            Message::CommonResponse { code, msg, data } => {
                if code == response_code::WORKSPACE_LOCKED {
                    return Err(WorkspaceLocked(msg).into());
                }
                if code != response_code::OK {
                    bail!("server refused: code {} ({})", code, msg);
                }
                Ok((msg, data))
            }
            other => bail!("expected CommonResponse, got {}", other.type_name()),
        }
    }

    pub async fn shutdown(&mut self) {
        let _ = self.sock.shutdown().await;
    }

    // Client-side operations, in session order.

    /// Three-way version negotiation: offer, echo, confirm.
    pub async fn client_hello(&mut self) -> Result<()> {
        self.send(&Message::Hello {
            versions: vec![PROTOCOL_VERSION],
        })
        .await?;
        match self.recv().await? {
            Message::Hello { versions } => {
                if versions.first() != Some(&PROTOCOL_VERSION) {
                    bail!(
                        "server negotiated unsupported protocol version {:?}",
                        versions
                    );
                }
            }
            other => bail!("expected Hello, got {}", other.type_name()),
        }
        self.send(&Message::Hello {
            versions: vec![PROTOCOL_VERSION],
        })
        .await
    }

    /// Mutual challenge-response. Without a key the challenge is echoed
    /// verbatim; the session is then only as private as its transport.
    pub async fn client_auth(&mut self, workspace: &str, key: Option<&[u8; 32]>) -> Result<()> {
        self.send(&Message::Auth {
            payload: workspace.as_bytes().to_vec(),
        })
        .await?;
        let challenge = match self.recv().await? {
            Message::Auth { payload } => payload,
            other => bail!("expected Auth challenge, got {}", other.type_name()),
        };
        let response = match key {
            Some(key) => auth::encrypt_challenge(key, &challenge),
            None => challenge,
        };
        self.send(&Message::Auth { payload: response }).await?;
        self.expect_ok().await.context("authentication")?;
        Ok(())
    }

    /// Measure clock skew as `server − local − rtt/2`. Several probes
    /// run back to back and the lowest-RTT sample wins, since queueing
    /// delay only ever inflates the estimate.
    pub async fn probe_clock_skew(&mut self) -> Result<i64> {
        const SAMPLES: u32 = 3;
        let mut best_rtt = i64::MAX;
        let mut best_skew = 0i64;
        for _ in 0..SAMPLES {
            let t0 = now_millis();
            self.send(&Message::GetSystemTimeMillis).await?;
            let (_, data) = self.expect_ok().await.context("clock probe")?;
            let t1 = now_millis();
            if data.len() != 8 {
                bail!("malformed time probe response ({} bytes)", data.len());
            }
            let server = u64::from_be_bytes(data[..8].try_into().unwrap()) as i64;
            let rtt = t1 - t0;
            if rtt < best_rtt {
                best_rtt = rtt;
                best_skew = server - t0 - rtt / 2;
            }
        }
        Ok(best_skew)
    }

    pub async fn fetch_file_tree(&mut self) -> Result<Option<FileTree>> {
        self.send(&Message::FetchFileTree).await?;
        let (_, data) = self.expect_ok().await.context("fetch remote tree")?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(tree_from_bytes(&data).context("remote tree decode")?))
    }

    /// Ship the whole plan forest in one message; the server deletes and
    /// pre-creates directories before replying.
    pub async fn commit_plan(&mut self, forest: &[SyncPlan]) -> Result<()> {
        let subtrees = forest.iter().map(plan_to_bytes).collect();
        self.send(&Message::CommitSyncPlan { subtrees }).await?;
        self.expect_ok().await.context("commit sync plan")?;
        Ok(())
    }

    /// Stream one large file: header then DataBlocks totalling its size.
    /// The ACK arrives later through [`Connection::confirm_files`].
    pub async fn upload_file(
        &mut self,
        nonce: u64,
        perm: u32,
        wire_path: &str,
        file: &MemoryMappedFile,
    ) -> Result<()> {
        let size = file.len();
        self.send(&Message::UploadFile {
            nonce,
            perm,
            size,
            path: wire_path.to_string(),
        })
        .await?;
        let mut buf = self.pool.acquire();
        let mut offset = 0u64;
        while offset < size {
            let n = ((size - offset) as usize).min(DATA_BLOCK_LEN);
            buf.resize(n, 0);
            file.read_at(&mut buf, offset)
                .with_context(|| format!("read {} at {}", file.path().display(), offset))?;
            if let Err(e) = self.send_data_block(&buf).await {
                self.pool.recycle(buf);
                return Err(e);
            }
            offset += n as u64;
        }
        self.pool.recycle(buf);
        Ok(())
    }

    /// Ship one packed archive and wait for the transfer-level response.
    /// Extraction completion arrives later through
    /// [`Connection::confirm_archives`].
    pub async fn upload_archive(&mut self, seq_id: u64, bytes: &[u8]) -> Result<()> {
        self.send(&Message::UploadArchive {
            seq_id,
            archive_size: bytes.len() as u64,
        })
        .await?;
        for chunk in bytes.chunks(DATA_BLOCK_LEN.max(1)) {
            self.send_data_block(chunk).await?;
        }
        self.expect_ok()
            .await
            .with_context(|| format!("upload archive {}", seq_id))?;
        Ok(())
    }

    pub async fn confirm_files(&mut self) -> Result<Vec<(u64, i32)>> {
        self.send(&Message::ConfirmFiles).await?;
        let (_, data) = self.expect_ok().await.context("confirm files")?;
        decode_ack_list(&data)
    }

    pub async fn confirm_archives(&mut self, no_block: bool) -> Result<Vec<(u64, i32)>> {
        self.send(&Message::ConfirmArchives { no_block }).await?;
        let (_, data) = self.expect_ok().await.context("confirm archives")?;
        decode_ack_list(&data)
    }

    /// Say goodbye and wait for the server's Bye.
    pub async fn bye(&mut self) -> Result<()> {
        self.send(&Message::Bye).await?;
        match self.recv().await? {
            Message::Bye => Ok(()),
            other => bail!("expected Bye, got {}", other.type_name()),
        }
    }
}

/// Establish the TCP leg of a connection with a bounded timeout; TLS
/// wrapping, when configured, happens above this.
pub async fn connect_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<tokio::net::TcpStream> {
    let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port)))
        .await
        .map_err(|_| anyhow::anyhow!("connect to {}:{} timed out", host, port))?
        .with_context(|| format!("connect to {}:{}", host, port))?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        (
            Connection::new(Socket::Plain(client.unwrap())),
            Connection::new(Socket::Plain(server.unwrap().0)),
        )
    }

    #[tokio::test]
    async fn messages_cross_the_wire_intact() {
        let (mut a, mut b) = pair().await;
        a.send(&Message::UploadFile {
            nonce: 77,
            perm: 0o600,
            size: 1024,
            path: "x/y.bin".into(),
        })
        .await
        .unwrap();
        match b.recv().await.unwrap() {
            Message::UploadFile {
                nonce,
                perm,
                size,
                path,
            } => {
                assert_eq!((nonce, perm, size, path.as_str()), (77, 0o600, 1024, "x/y.bin"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn data_blocks_round_trip_through_the_pool() {
        let (mut a, mut b) = pair().await;
        a.send_data_block(&[5u8; 4096]).await.unwrap();
        match b.recv().await.unwrap() {
            Message::DataBlock { data } => {
                assert_eq!(data.len(), 4096);
                assert!(data.iter().all(|&x| x == 5));
                b.recycle(data);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn hello_negotiates_version_one() {
        let (mut client, mut server) = pair().await;
        let server_side = tokio::spawn(async move {
            match server.recv().await.unwrap() {
                Message::Hello { versions } => assert_eq!(versions, vec![PROTOCOL_VERSION]),
                other => panic!("unexpected {other:?}"),
            }
            server
                .send(&Message::Hello {
                    versions: vec![PROTOCOL_VERSION],
                })
                .await
                .unwrap();
            match server.recv().await.unwrap() {
                Message::Hello { .. } => {}
                other => panic!("unexpected {other:?}"),
            }
        });
        client.client_hello().await.unwrap();
        server_side.await.unwrap();
    }

    #[tokio::test]
    async fn version_mismatch_is_fatal() {
        let (mut client, mut server) = pair().await;
        let server_side = tokio::spawn(async move {
            let _ = server.recv().await.unwrap();
            server
                .send(&Message::Hello { versions: vec![99] })
                .await
                .unwrap();
        });
        assert!(client.client_hello().await.is_err());
        server_side.await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_response_code_is_an_error() {
        let (mut client, mut server) = pair().await;
        server
            .send(&Message::CommonResponse {
                code: 7,
                msg: "broken".into(),
                data: Vec::new(),
            })
            .await
            .unwrap();
        let err = client.expect_ok().await.unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn locked_workspace_is_distinguishable() {
        let (mut client, mut server) = pair().await;
        server
            .send(&Message::CommonResponse {
                code: response_code::WORKSPACE_LOCKED,
                msg: "ws".into(),
                data: Vec::new(),
            })
            .await
            .unwrap();
        let err = client.expect_ok().await.unwrap_err();
        assert!(err.downcast_ref::<WorkspaceLocked>().is_some());
    }
}
