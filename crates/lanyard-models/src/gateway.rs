use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::intents::Intents;
use crate::snowflake::Snowflake;

// Client -> Server opcodes
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_PRESENCE_UPDATE: u8 = 3;
pub const OP_VOICE_STATE_UPDATE: u8 = 4;
pub const OP_RESUME: u8 = 6;
pub const OP_REQUEST_GUILD_MEMBERS: u8 = 8;

// Server -> Client opcodes
pub const OP_DISPATCH: u8 = 0;
pub const OP_RECONNECT: u8 = 7;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

// Gateway close codes that invalidate the session. Anything not listed
// here is retried, resuming when a session exists.
pub const CLOSE_AUTHENTICATION_FAILED: u16 = 4004;
pub const CLOSE_INVALID_SHARD: u16 = 4010;
pub const CLOSE_SHARDING_REQUIRED: u16 = 4011;
pub const CLOSE_INVALID_INTENTS: u16 = 4013;
pub const CLOSE_DISALLOWED_INTENTS: u16 = 4014;

/// True if the close code means the session can never be resumed and a
/// fresh identify is required.
pub fn close_code_invalidates_session(code: u16) -> bool {
    matches!(
        code,
        CLOSE_AUTHENTICATION_FAILED
            | CLOSE_INVALID_SHARD
            | CLOSE_SHARDING_REQUIRED
            | CLOSE_INVALID_INTENTS
            | CLOSE_DISALLOWED_INTENTS
    )
}

/// True if reconnecting can never succeed (bad token, bad intents, bad
/// shard coordinates). These stop the shard outright.
pub fn close_code_is_fatal(code: u16) -> bool {
    matches!(
        code,
        CLOSE_AUTHENTICATION_FAILED
            | CLOSE_INVALID_SHARD
            | CLOSE_INVALID_INTENTS
            | CLOSE_DISALLOWED_INTENTS
    )
}

// Dispatch event names
pub const EVENT_READY: &str = "READY";
pub const EVENT_RESUMED: &str = "RESUMED";
pub const EVENT_GUILD_CREATE: &str = "GUILD_CREATE";
pub const EVENT_GUILD_UPDATE: &str = "GUILD_UPDATE";
pub const EVENT_GUILD_DELETE: &str = "GUILD_DELETE";
pub const EVENT_CHANNEL_CREATE: &str = "CHANNEL_CREATE";
pub const EVENT_CHANNEL_DELETE: &str = "CHANNEL_DELETE";
pub const EVENT_GUILD_MEMBER_ADD: &str = "GUILD_MEMBER_ADD";
pub const EVENT_GUILD_MEMBER_REMOVE: &str = "GUILD_MEMBER_REMOVE";
pub const EVENT_MESSAGE_CREATE: &str = "MESSAGE_CREATE";
pub const EVENT_VOICE_STATE_UPDATE: &str = "VOICE_STATE_UPDATE";
pub const EVENT_VOICE_SERVER_UPDATE: &str = "VOICE_SERVER_UPDATE";

/// The gateway message envelope. Every frame in either direction is one
/// of these; `s` and `t` are only present on dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayMessage {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> String {
        // The envelope contains only JSON-safe types, so this cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Outbound payload builders ────────────────────────────────────────────────

/// Identify command for a fresh session.
pub fn identify(
    token: &str,
    intents: Intents,
    shard_index: u32,
    shard_total: u32,
    large_threshold: u32,
) -> GatewayMessage {
    GatewayMessage {
        op: OP_IDENTIFY,
        d: Some(json!({
            "token": token,
            "intents": intents.bits(),
            "shard": [shard_index, shard_total],
            "compress": false,
            "large_threshold": large_threshold,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "lanyard",
                "device": "lanyard",
            },
        })),
        s: None,
        t: None,
    }
}

/// Resume command replaying events missed since `sequence`.
pub fn resume(token: &str, session_id: &str, sequence: u64) -> GatewayMessage {
    GatewayMessage {
        op: OP_RESUME,
        d: Some(json!({
            "token": token,
            "session_id": session_id,
            "seq": sequence,
        })),
        s: None,
        t: None,
    }
}

/// Heartbeat carrying the last seen sequence (or null before any dispatch).
pub fn heartbeat(sequence: Option<u64>) -> GatewayMessage {
    GatewayMessage {
        op: OP_HEARTBEAT,
        d: Some(sequence.map_or(Value::Null, Into::into)),
        s: None,
        t: None,
    }
}

/// Voice state update. `channel_id = None` leaves the current channel.
pub fn voice_state_update(
    guild_id: Snowflake,
    channel_id: Option<Snowflake>,
    self_mute: bool,
    self_deaf: bool,
) -> GatewayMessage {
    GatewayMessage {
        op: OP_VOICE_STATE_UPDATE,
        d: Some(json!({
            "guild_id": guild_id,
            "channel_id": channel_id,
            "self_mute": self_mute,
            "self_deaf": self_deaf,
        })),
        s: None,
        t: None,
    }
}

/// Request guild member chunks for one guild.
pub fn request_guild_members(guild_id: Snowflake, query: &str, limit: u32) -> GatewayMessage {
    GatewayMessage {
        op: OP_REQUEST_GUILD_MEMBERS,
        d: Some(json!({
            "guild_id": guild_id,
            "query": query,
            "limit": limit,
        })),
        s: None,
        t: None,
    }
}

/// Presence update for the bot user.
pub fn presence_update(status: &str, activities: Vec<Value>) -> GatewayMessage {
    GatewayMessage {
        op: OP_PRESENCE_UPDATE,
        d: Some(json!({
            "status": status,
            "activities": activities,
            "since": Value::Null,
            "afk": false,
        })),
        s: None,
        t: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip_skips_absent_fields() {
        let msg = heartbeat(Some(312));
        let raw = msg.to_json();
        assert_eq!(raw, r#"{"op":1,"d":312}"#);

        let parsed = GatewayMessage::parse(&raw).unwrap();
        assert_eq!(parsed.op, OP_HEARTBEAT);
        assert_eq!(parsed.d, Some(serde_json::json!(312)));
        assert!(parsed.s.is_none());
        assert!(parsed.t.is_none());
    }

    #[test]
    fn heartbeat_before_any_dispatch_sends_null() {
        assert_eq!(heartbeat(None).to_json(), r#"{"op":1,"d":null}"#);
    }

    #[test]
    fn parses_dispatch_with_sequence_and_name() {
        let raw = r#"{"op":0,"t":"READY","s":1,"d":{"session_id":"abc"}}"#;
        let msg = GatewayMessage::parse(raw).unwrap();
        assert_eq!(msg.op, OP_DISPATCH);
        assert_eq!(msg.s, Some(1));
        assert_eq!(msg.t.as_deref(), Some("READY"));
    }

    #[test]
    fn identify_carries_shard_coordinates() {
        let msg = identify("tok", Intents::default_unprivileged(), 2, 8, 250);
        let d = msg.d.unwrap();
        assert_eq!(d["shard"], serde_json::json!([2, 8]));
        assert_eq!(d["compress"], serde_json::json!(false));
        assert_eq!(d["large_threshold"], serde_json::json!(250));
    }

    #[test]
    fn voice_leave_sends_null_channel() {
        let msg = voice_state_update(Snowflake(100), None, false, false);
        let d = msg.d.unwrap();
        assert_eq!(d["guild_id"], serde_json::json!("100"));
        assert!(d["channel_id"].is_null());
    }

    #[test]
    fn close_code_classification() {
        assert!(close_code_invalidates_session(CLOSE_AUTHENTICATION_FAILED));
        assert!(close_code_invalidates_session(CLOSE_SHARDING_REQUIRED));
        assert!(!close_code_invalidates_session(1006));

        assert!(close_code_is_fatal(CLOSE_DISALLOWED_INTENTS));
        assert!(close_code_is_fatal(CLOSE_INVALID_SHARD));
        // Sharding required: the session is gone but a fresh identify with
        // a corrected shard count can succeed, so the shard keeps retrying.
        assert!(!close_code_is_fatal(CLOSE_SHARDING_REQUIRED));
        assert!(!close_code_is_fatal(1001));
    }
}
