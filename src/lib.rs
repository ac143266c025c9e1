//! Janus
//!
//! High-throughput one-way directory synchronisation: a client pushes a
//! local workspace to a server over a framed binary protocol so the
//! server's copy becomes byte- and permission-identical, skipping files
//! whose remote version is already current.

pub mod archive;
pub mod auth;
pub mod client;
pub mod config;
pub mod conn;
pub mod filter;
pub mod fsutil;
pub mod message;
pub mod mmap;
pub mod net;
pub mod plan;
pub mod protocol;
pub mod server;
pub mod tls;
pub mod tree;
