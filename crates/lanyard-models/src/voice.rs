use serde::{Deserialize, Serialize};

use crate::snowflake::Snowflake;

/// A user's voice state as delivered by VOICE_STATE_UPDATE dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceState {
    pub user_id: Snowflake,
    pub channel_id: Option<Snowflake>,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    pub session_id: String,
    #[serde(default)]
    pub deaf: bool,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_stream: bool,
    #[serde(default)]
    pub self_video: bool,
    #[serde(default)]
    pub suppress: bool,
}

/// VOICE_SERVER_UPDATE: the signalling endpoint and token for a guild's
/// voice server. `endpoint` is null while the server is reallocating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceServerUpdate {
    pub guild_id: Snowflake,
    pub token: String,
    pub endpoint: Option<String>,
}

// ── Events originated by the voice media client ──────────────────────────────
//
// These are emitted from the media client's own task, so their event
// context carries no shard handle.

/// The media client finished its signalling handshake and can send audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceReady {
    pub guild_id: Snowflake,
    pub channel_id: Snowflake,
}

/// A user in the connected channel started or stopped talking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceUserTalking {
    pub guild_id: Snowflake,
    pub user_id: Snowflake,
    pub speaking: bool,
}

/// The media client's send buffer drained below its refill threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceBufferSend {
    pub guild_id: Snowflake,
    pub buffer_remaining: usize,
}

/// A received, already-decrypted audio payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceReceive {
    pub guild_id: Snowflake,
    pub user_id: Option<Snowflake>,
    pub payload: Vec<u8>,
}

/// A user-inserted track marker was reached during playback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceTrackMarker {
    pub guild_id: Snowflake,
    pub label: String,
}
