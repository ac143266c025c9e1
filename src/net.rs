//! Async socket abstraction.
//!
//! Wraps a plain TCP stream or either side of a TLS session behind one
//! type so the protocol layer never cares which transport is underneath.
//! Reads and writes go through `&mut self`, which keeps each direction
//! single-reader / single-writer by construction.

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub enum Socket {
    Plain(TcpStream),
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl Socket {
    /// Read up to `buf.len()` bytes; 0 means EOF. An elapsed deadline is
    /// an error; `None` waits forever.
    pub async fn read_some(&mut self, buf: &mut [u8], deadline: Option<Duration>) -> Result<usize> {
        match deadline {
            None => self.read_inner(buf).await,
            Some(limit) => match tokio::time::timeout(limit, self.read_inner(buf)).await {
                Ok(res) => res,
                Err(_) => bail!("read timed out after {:?}", limit),
            },
        }
    }

    async fn read_inner(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Socket::Plain(s) => s.read(buf).await,
            Socket::TlsClient(s) => s.read(buf).await,
            Socket::TlsServer(s) => s.read(buf).await,
        }
        .context("socket read")?;
        Ok(n)
    }

    /// Read exactly `buf.len()` bytes or fail (EOF mid-buffer included).
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self {
            Socket::Plain(s) => s.read_exact(buf).await,
            Socket::TlsClient(s) => s.read_exact(buf).await,
            Socket::TlsServer(s) => s.read_exact(buf).await,
        }
        .context("socket read_exact")?;
        Ok(())
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Socket::Plain(s) => s.write_all(buf).await,
            Socket::TlsClient(s) => s.write_all(buf).await,
            Socket::TlsServer(s) => s.write_all(buf).await,
        }
        .context("socket write")?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        match self {
            Socket::Plain(s) => s.flush().await,
            Socket::TlsClient(s) => s.flush().await,
            Socket::TlsServer(s) => s.flush().await,
        }
        .context("socket flush")?;
        Ok(())
    }

    /// Graceful close: flush buffered data and send the transport's
    /// shutdown (TLS close_notify where applicable). Errors are reported
    /// but the socket is unusable either way.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Socket::Plain(s) => s.shutdown().await,
            Socket::TlsClient(s) => s.shutdown().await,
            Socket::TlsServer(s) => s.shutdown().await,
        }
        .context("socket shutdown")?;
        Ok(())
    }
}
