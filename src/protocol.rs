//! Shared protocol constants for the guestlink services

/// Version reported by the heartbeat line and the default router.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Well-known vsock ports, one per service
pub mod ports {
    pub const TUNNEL: u32 = 5001;
    pub const HEARTBEAT: u32 = 5002;
    pub const EVENTS: u32 = 5003;
    pub const HTTP: u32 = 80;
}

// Listen backlogs. Heartbeat and event push service a single peer at a time.
pub mod backlog {
    pub const HEARTBEAT: i32 = 1;
    pub const EVENTS: i32 = 1;
    pub const TUNNEL: i32 = 128;
    pub const HTTP: i32 = 64;
}

// Relay copy buffer (64KiB per direction)
pub const RELAY_CHUNK: usize = 64 * 1024;

// Longest accepted `CONNECT <port>` line, excluding the newline
pub const MAX_HANDSHAKE_LINE: usize = 255;

// Request framing limits. Headers are capped to bound memory; buffered bodies
// are capped separately, streamed uploads are not.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
pub const STREAM_CHUNK: usize = 64 * 1024;

// Centralized timeout constants
pub mod timeouts {
    // Tunnel handshake line must arrive within this window (ms)
    pub const HANDSHAKE_MS: u64 = 5_000;

    // Fixed pause after a failed accept before looping again (ms)
    pub const ACCEPT_BACKOFF_MS: u64 = 100;

    // Longest a blocked accept waits before rechecking for stop (ms)
    pub const ACCEPT_WAKE_MS: u64 = 250;
}
