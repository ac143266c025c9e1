//! Framed message codec for the Janus protocol.
//!
//! Every message on the wire is `MAGIC | TYPE (u32 BE) | BODY_LEN (u64 BE)`
//! followed by a type-specific body. All integers are big-endian and all
//! strings UTF-8 with `/` as the path separator regardless of platform.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::protocol::{msg_type, HEADER_LEN, MAGIC, MAX_BODY_LEN};

/// One protocol message, decoded.
///
/// The sum type replaces the runtime type registry of older designs: the
/// compiler enforces that every variant is handled by encode and decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Offered (client) or chosen (server) protocol versions.
    Hello { versions: Vec<u64> },
    /// Workspace name, random challenge, or the encrypted challenge,
    /// depending on the handshake step.
    Auth { payload: Vec<u8> },
    GetSystemTimeMillis,
    FetchFileTree,
    /// Serialised plan subtrees, each length-prefixed on the wire.
    CommitSyncPlan { subtrees: Vec<Vec<u8>> },
    /// Announces a single-file transfer; DataBlocks totalling `size` follow.
    UploadFile {
        nonce: u64,
        perm: u32,
        size: u64,
        path: String,
    },
    /// Announces an archive transfer; DataBlocks totalling `archive_size` follow.
    UploadArchive { seq_id: u64, archive_size: u64 },
    ConfirmArchives { no_block: bool },
    ConfirmFiles,
    Bye,
    /// Server status reply. `code` 0 means success; `data` is an optional
    /// opaque payload (serialised tree, time probe, ACK list).
    CommonResponse {
        code: i32,
        msg: String,
        data: Vec<u8>,
    },
    /// Opaque bytes belonging to the preceding UploadFile/UploadArchive.
    DataBlock { data: Vec<u8> },
}

impl Message {
    pub fn type_code(&self) -> u32 {
        match self {
            Message::Hello { .. } => msg_type::HELLO,
            Message::Auth { .. } => msg_type::AUTH,
            Message::GetSystemTimeMillis => msg_type::GET_SYSTEM_TIME_MILLIS,
            Message::FetchFileTree => msg_type::FETCH_FILE_TREE,
            Message::CommitSyncPlan { .. } => msg_type::COMMIT_SYNC_PLAN,
            Message::UploadFile { .. } => msg_type::UPLOAD_FILE,
            Message::UploadArchive { .. } => msg_type::UPLOAD_ARCHIVE,
            Message::ConfirmArchives { .. } => msg_type::CONFIRM_ARCHIVES,
            Message::ConfirmFiles => msg_type::CONFIRM_FILES,
            Message::Bye => msg_type::BYE,
            Message::CommonResponse { .. } => msg_type::COMMON_RESPONSE,
            Message::DataBlock { .. } => msg_type::DATA_BLOCK,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "Hello",
            Message::Auth { .. } => "Auth",
            Message::GetSystemTimeMillis => "GetSystemTimeMillis",
            Message::FetchFileTree => "FetchFileTree",
            Message::CommitSyncPlan { .. } => "CommitSyncPlan",
            Message::UploadFile { .. } => "UploadFile",
            Message::UploadArchive { .. } => "UploadArchive",
            Message::ConfirmArchives { .. } => "ConfirmArchives",
            Message::ConfirmFiles => "ConfirmFiles",
            Message::Bye => "Bye",
            Message::CommonResponse { .. } => "CommonResponse",
            Message::DataBlock { .. } => "DataBlock",
        }
    }

    /// Serialise the body into `out` (which is cleared first).
    pub fn encode_body(&self, out: &mut Vec<u8>) {
        out.clear();
        match self {
            Message::Hello { versions } => {
                for v in versions {
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
            Message::Auth { payload } => out.extend_from_slice(payload),
            Message::GetSystemTimeMillis
            | Message::FetchFileTree
            | Message::ConfirmFiles
            | Message::Bye => {}
            Message::CommitSyncPlan { subtrees } => {
                for sub in subtrees {
                    out.extend_from_slice(&(sub.len() as u64).to_be_bytes());
                    out.extend_from_slice(sub);
                }
            }
            Message::UploadFile {
                nonce,
                perm,
                size,
                path,
            } => {
                out.extend_from_slice(&nonce.to_be_bytes());
                out.extend_from_slice(&perm.to_be_bytes());
                out.extend_from_slice(&0u32.to_be_bytes()); // reserved
                out.extend_from_slice(&size.to_be_bytes());
                out.extend_from_slice(path.as_bytes());
            }
            Message::UploadArchive {
                seq_id,
                archive_size,
            } => {
                out.extend_from_slice(&seq_id.to_be_bytes());
                out.extend_from_slice(&archive_size.to_be_bytes());
            }
            Message::ConfirmArchives { no_block } => {
                out.extend_from_slice(&(u32::from(*no_block)).to_be_bytes());
            }
            Message::CommonResponse { code, msg, data } => {
                out.extend_from_slice(&code.to_be_bytes());
                out.extend_from_slice(&(msg.len() as u32).to_be_bytes());
                out.extend_from_slice(msg.as_bytes());
                out.extend_from_slice(data);
            }
            Message::DataBlock { data } => out.extend_from_slice(data),
        }
    }

    /// Serialise the full frame (header + body) into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        self.encode_body(&mut body);
        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(MAGIC);
        frame.extend_from_slice(&self.type_code().to_be_bytes());
        frame.extend_from_slice(&(body.len() as u64).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    /// Parse a 16-byte frame header. Returns `(type_code, body_len)`.
    pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(u32, u64)> {
        if &header[0..4] != MAGIC {
            bail!("bad magic in frame header");
        }
        let type_code = u32::from_be_bytes(header[4..8].try_into().unwrap());
        let body_len = u64::from_be_bytes(header[8..16].try_into().unwrap());
        if body_len > MAX_BODY_LEN {
            bail!(
                "frame body too large: {} bytes (max {})",
                body_len,
                MAX_BODY_LEN
            );
        }
        if !is_known_type(type_code) {
            bail!("unknown message type 0x{:x}", type_code);
        }
        Ok((type_code, body_len))
    }

    /// Decode a body previously announced by a header of `type_code`.
    pub fn decode_body(type_code: u32, body: &[u8]) -> Result<Message> {
        let mut r = BodyReader::new(body);
        let msg = match type_code {
            msg_type::HELLO => {
                if body.len() % 8 != 0 {
                    bail!("Hello body length {} is not a multiple of 8", body.len());
                }
                let mut versions = Vec::with_capacity(body.len() / 8);
                while r.remaining() > 0 {
                    versions.push(r.u64()?);
                }
                Message::Hello { versions }
            }
            msg_type::AUTH => Message::Auth {
                payload: body.to_vec(),
            },
            msg_type::GET_SYSTEM_TIME_MILLIS => Message::GetSystemTimeMillis,
            msg_type::FETCH_FILE_TREE => Message::FetchFileTree,
            msg_type::COMMIT_SYNC_PLAN => {
                let mut subtrees = Vec::new();
                while r.remaining() > 0 {
                    let len = r.u64()? as usize;
                    subtrees.push(r.bytes(len).context("plan subtree")?.to_vec());
                }
                Message::CommitSyncPlan { subtrees }
            }
            msg_type::UPLOAD_FILE => {
                let nonce = r.u64()?;
                let perm = r.u32()?;
                let _reserved = r.u32()?;
                let size = r.u64()?;
                let path = std::str::from_utf8(r.rest())
                    .context("UploadFile path is not UTF-8")?
                    .to_string();
                Message::UploadFile {
                    nonce,
                    perm,
                    size,
                    path,
                }
            }
            msg_type::UPLOAD_ARCHIVE => Message::UploadArchive {
                seq_id: r.u64()?,
                archive_size: r.u64()?,
            },
            msg_type::CONFIRM_ARCHIVES => Message::ConfirmArchives {
                no_block: r.u32()? != 0,
            },
            msg_type::CONFIRM_FILES => Message::ConfirmFiles,
            msg_type::BYE => Message::Bye,
            msg_type::COMMON_RESPONSE => {
                let code = r.i32()?;
                let msg_len = r.u32()? as usize;
                let msg = std::str::from_utf8(r.bytes(msg_len).context("response message")?)
                    .context("response message is not UTF-8")?
                    .to_string();
                Message::CommonResponse {
                    code,
                    msg,
                    data: r.rest().to_vec(),
                }
            }
            msg_type::DATA_BLOCK => Message::DataBlock {
                data: body.to_vec(),
            },
            other => bail!("unknown message type 0x{:x}", other),
        };
        Ok(msg)
    }
}

fn is_known_type(code: u32) -> bool {
    matches!(
        code,
        msg_type::HELLO
            | msg_type::AUTH
            | msg_type::GET_SYSTEM_TIME_MILLIS
            | msg_type::FETCH_FILE_TREE
            | msg_type::COMMIT_SYNC_PLAN
            | msg_type::UPLOAD_FILE
            | msg_type::UPLOAD_ARCHIVE
            | msg_type::CONFIRM_ARCHIVES
            | msg_type::CONFIRM_FILES
            | msg_type::BYE
            | msg_type::COMMON_RESPONSE
            | msg_type::DATA_BLOCK
    )
}

/// Count-prefixed `{id: u64, code: i32}` list used by the ConfirmFiles and
/// ConfirmArchives response payloads.
pub fn encode_ack_list(acks: &[(u64, i32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + acks.len() * 12);
    out.extend_from_slice(&(acks.len() as u32).to_be_bytes());
    for (id, code) in acks {
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&code.to_be_bytes());
    }
    out
}

pub fn decode_ack_list(data: &[u8]) -> Result<Vec<(u64, i32)>> {
    let mut r = BodyReader::new(data);
    let count = r.u32()? as usize;
    let mut acks = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
        acks.push((r.u64()?, r.i32()?));
    }
    if r.remaining() != 0 {
        bail!("trailing bytes after ACK list");
    }
    Ok(acks)
}

/// Cursor over a message body with bounds-checked big-endian reads.
pub struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!(
                "truncated body: wanted {} bytes, {} remain",
                n,
                self.remaining()
            );
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}

/// Thread-safe pool of body/frame buffers.
///
/// Hot message types (DataBlock, CommonResponse, UploadFile, Hello, Auth)
/// are encoded into and decoded out of recycled buffers instead of fresh
/// allocations. Recycling an already-recycled buffer is harmless: the pool
/// just keeps at most `max_buffers` of them.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_buffers: usize,
}

impl BufferPool {
    pub fn new(max_buffers: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(max_buffers)),
            max_buffers,
        })
    }

    /// Borrow a cleared buffer, allocating if the pool is empty.
    pub fn acquire(&self) -> Vec<u8> {
        self.free.lock().pop().unwrap_or_default()
    }

    /// Return a buffer for reuse; dropped silently once the pool is full.
    pub fn recycle(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_buffers {
            free.push(buf);
        }
    }
}
