use thiserror::Error;

use lanyard_models::Snowflake;

/// Failures while establishing the TLS transport.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("dns resolution failed for {0}")]
    Dns(String),
    #[error("tcp connect failed: {0}")]
    Tcp(std::io::Error),
    #[error("tls handshake failed: {0}")]
    Tls(std::io::Error),
    #[error("tls handshake timed out after {0}s")]
    HandshakeTimeout(u64),
    #[error("invalid ca bundle {path}: {reason}")]
    CaBundle { path: String, reason: String },
}

/// Failures in the WebSocket framing layer.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("upgrade rejected: {0}")]
    Handshake(String),
    #[error("server sent a bad Sec-WebSocket-Accept value")]
    BadAccept,
    #[error("websocket upgrade timed out after {0}s")]
    UpgradeTimeout(u64),
    #[error("invalid frame: {0}")]
    Frame(String),
    #[error("frame payload of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures in the zlib-stream transport.
#[derive(Debug, Error)]
pub enum InflateError {
    #[error("inflate failed: {0}")]
    Stream(String),
    #[error("inflate failed {0} times in a row; stream context is corrupt")]
    Corrupt(u32),
    #[error("decompressed payload is not utf-8")]
    NotUtf8,
}

/// Failures in voice connection management.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("already connected to a voice channel in guild {0}")]
    AlreadyConnected(Snowflake),
    #[error("no voice connection for guild {0}")]
    NotConnected(Snowflake),
    #[error("voice signalling for guild {0} did not become ready within {1}s")]
    ReadinessTimeout(Snowflake, u64),
    #[error("the owning shard is no longer running")]
    ShardGone,
    #[error("media client failed to start: {0}")]
    MediaStart(String),
}

/// Top-level shard failure. Only `Fatal` escapes to the cluster; every
/// other variant is consumed by the shard's own reconnect loop.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Ws(#[from] WsError),
    #[error(transparent)]
    Inflate(#[from] InflateError),
    #[error("json decode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("gateway closed the connection with fatal code {code}")]
    Fatal { code: u16 },
}

impl GatewayError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Fatal { .. } | GatewayError::Config(_))
    }
}
