//! Shared protocol constants for the Janus framed transport

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"jANu";
pub const PROTOCOL_VERSION: u64 = 1;

/// Frame header: MAGIC (4) | TYPE (u32 BE) | BODY_LEN (u64 BE)
pub const HEADER_LEN: usize = 16;

// Maximum message body size (1 GiB) - prevents DoS via memory exhaustion
pub const MAX_BODY_LEN: u64 = 1024 * 1024 * 1024;

// Preferred payload size for a single DataBlock frame
pub const DATA_BLOCK_LEN: usize = 2 * 1024 * 1024;

// Files at or below this size travel inside archives; larger files
// take the single-file path
pub const SMALL_FILE_LIMIT: u64 = 256 * 1024;

// Archive rollover thresholds
pub const ARCHIVE_SIZE_LIMIT: u64 = 128 * 1024 * 1024;
pub const ARCHIVE_FILE_LIMIT: usize = 1024;

// Per-entry archive header: path_len u32 | perm u32 | data_len u64
pub const ARCHIVE_ENTRY_HEADER_LEN: usize = 16;

// Backpressure window between the network receiver and the archive
// extractor, in data blocks
pub const EXTRACT_CHANNEL_BLOCKS: usize = 192;

// Suffix for temp files written next to each target before the atomic move
pub const TMP_SUFFIX: &str = ".janus-sync-tmp";

// Message type IDs (keep numeric values stable on the wire)
pub mod msg_type {
    pub const HELLO: u32 = 0x1000;
    pub const AUTH: u32 = 0x1001;
    pub const GET_SYSTEM_TIME_MILLIS: u32 = 0x1801;
    pub const FETCH_FILE_TREE: u32 = 0x2001;
    pub const COMMIT_SYNC_PLAN: u32 = 0x2002;
    pub const UPLOAD_FILE: u32 = 0x2003;
    pub const UPLOAD_ARCHIVE: u32 = 0x2004;
    pub const CONFIRM_ARCHIVES: u32 = 0x2005;
    pub const CONFIRM_FILES: u32 = 0x2006;
    pub const BYE: u32 = 0x2007;
    pub const COMMON_RESPONSE: u32 = 0xA001;
    pub const DATA_BLOCK: u32 = 0xA002;
}

// Response codes carried in CommonResponse
pub mod response_code {
    pub const OK: i32 = 0;
    pub const AUTH_FAILED: i32 = 1;
    pub const WORKSPACE_LOCKED: i32 = 2;
    pub const INTERNAL: i32 = 3;
}
