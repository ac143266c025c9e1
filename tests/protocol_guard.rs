//! Framing and state-machine defence tests against a live server.

use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use janus_sync::auth::derive_key;
use janus_sync::config::{Role, WorkspaceConfig};
use janus_sync::conn::{connect_tcp, Connection};
use janus_sync::message::Message;
use janus_sync::net::Socket;
use janus_sync::server::Server;

const SECRET: &[u8] = b"hunter2";

fn workspace(root: &Path) -> WorkspaceConfig {
    WorkspaceConfig {
        name: "ws".to_string(),
        remote_name: "ws".to_string(),
        role: Role::Server,
        path: root.to_path_buf(),
        host: None,
        port: None,
        aes_key: Some(derive_key(SECRET)),
        ignore_patterns: Vec::new(),
        protect_patterns: Vec::new(),
        tls: None,
    }
}

async fn start_server(root: &Path) -> u16 {
    let port = {
        let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let p = sock.local_addr().unwrap().port();
        drop(sock);
        p
    };
    let server = Server::new(format!("127.0.0.1:{port}"), vec![workspace(root)], None);
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    for _ in 0..50u32 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    port
}

/// Read until the peer closes; returns the bytes seen.
async fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
        }
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_magic_closes_the_connection() -> Result<()> {
    let root = tempfile::tempdir()?;
    let port = start_server(root.path()).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let mut frame = Message::Hello { versions: vec![1] }.encode();
    frame[0..4].copy_from_slice(b"NOPE");
    stream.write_all(&frame).await?;
    // The server must drop us without answering.
    assert!(read_to_eof(&mut stream).await.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_message_type_closes_the_connection() -> Result<()> {
    let root = tempfile::tempdir()?;
    let port = start_server(root.path()).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let mut frame = Vec::new();
    frame.extend_from_slice(b"jANu");
    frame.extend_from_slice(&0x7777u32.to_be_bytes());
    frame.extend_from_slice(&0u64.to_be_bytes());
    stream.write_all(&frame).await?;
    assert!(read_to_eof(&mut stream).await.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversize_body_closes_the_connection() -> Result<()> {
    let root = tempfile::tempdir()?;
    let port = start_server(root.path()).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let mut frame = Vec::new();
    frame.extend_from_slice(b"jANu");
    frame.extend_from_slice(&0x1000u32.to_be_bytes());
    frame.extend_from_slice(&(2u64 * 1024 * 1024 * 1024).to_be_bytes());
    stream.write_all(&frame).await?;
    assert!(read_to_eof(&mut stream).await.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_message_for_state_is_fatal() -> Result<()> {
    let root = tempfile::tempdir()?;
    let port = start_server(root.path()).await;

    // FetchFileTree before Hello is a state violation.
    let stream = connect_tcp("127.0.0.1", port, Duration::from_secs(5)).await?;
    let mut conn = Connection::new(Socket::Plain(stream));
    conn.send(&Message::FetchFileTree).await?;
    assert!(conn.recv().await.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn traversal_in_upload_path_is_fatal() -> Result<()> {
    let root = tempfile::tempdir()?;
    let port = start_server(root.path()).await;

    let stream = connect_tcp("127.0.0.1", port, Duration::from_secs(5)).await?;
    let mut conn = Connection::new(Socket::Plain(stream));
    conn.client_hello().await?;
    conn.client_auth("ws", Some(&derive_key(SECRET))).await?;
    conn.send(&Message::UploadFile {
        nonce: 1,
        perm: 0o644,
        size: 4,
        path: "../escape.txt".to_string(),
    })
    .await?;
    conn.send_data_block(b"evil").await?;
    // The server aborts the connection instead of writing outside the
    // workspace.
    assert!(conn.recv().await.is_err());
    assert!(!root.path().parent().unwrap().join("escape.txt").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_file_acks_drain_in_order_of_confirm() -> Result<()> {
    let root = tempfile::tempdir()?;
    let port = start_server(root.path()).await;

    let stream = connect_tcp("127.0.0.1", port, Duration::from_secs(5)).await?;
    let mut conn = Connection::new(Socket::Plain(stream));
    conn.client_hello().await?;
    conn.client_auth("ws", Some(&derive_key(SECRET))).await?;
    conn.commit_plan(&[]).await?;

    // Pipeline two uploads before draining a single ACK.
    for (nonce, name) in [(11u64, "one.bin"), (22u64, "two.bin")] {
        conn.send(&Message::UploadFile {
            nonce,
            perm: 0o644,
            size: 3,
            path: name.to_string(),
        })
        .await?;
        conn.send_data_block(b"abc").await?;
    }
    let acks = conn.confirm_files().await?;
    assert_eq!(acks, vec![(11, 0), (22, 0)]);
    assert_eq!(std::fs::read(root.path().join("one.bin"))?, b"abc");
    assert_eq!(std::fs::read(root.path().join("two.bin"))?, b"abc");

    // A second drain is empty.
    assert!(conn.confirm_files().await?.is_empty());
    conn.bye().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nonblocking_archive_confirm_returns_immediately() -> Result<()> {
    let root = tempfile::tempdir()?;
    let port = start_server(root.path()).await;

    let stream = connect_tcp("127.0.0.1", port, Duration::from_secs(5)).await?;
    let mut conn = Connection::new(Socket::Plain(stream));
    conn.client_hello().await?;
    conn.client_auth("ws", Some(&derive_key(SECRET))).await?;

    // No archives in flight: both variants answer with an empty list.
    assert!(conn.confirm_archives(true).await?.is_empty());
    assert!(conn.confirm_archives(false).await?.is_empty());
    conn.bye().await?;
    Ok(())
}
