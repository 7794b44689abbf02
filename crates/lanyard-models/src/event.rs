use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gateway;
use crate::snowflake::Snowflake;
use crate::voice::{
    VoiceBufferSend, VoiceReady, VoiceReceive, VoiceServerUpdate, VoiceState, VoiceTrackMarker,
    VoiceUserTalking,
};

/// Minimal view of the bot user, enough for session bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Snowflake,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

/// Minimal view of a guild decoded from GUILD_CREATE. Full guild DTOs
/// live with the REST layer; the shard only needs enough to keep its
/// counters and the cache collaborator current.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildSummary {
    pub id: Snowflake,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub member_count: u64,
    #[serde(default)]
    pub channel_ids: Vec<Snowflake>,
}

/// Minimal view of a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub name: String,
}

/// Minimal view of a custom emoji.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmojiSummary {
    pub id: Snowflake,
    #[serde(default)]
    pub name: String,
}

/// Minimal view of a role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSummary {
    pub id: Snowflake,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
}

/// READY dispatch payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub user: Option<UserSummary>,
    #[serde(default)]
    pub shard: Option<(u32, u32)>,
}

/// A guild became unavailable or the bot was removed from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildUnavailable {
    pub id: Snowflake,
    #[serde(default)]
    pub unavailable: bool,
}

/// A decoded server event ready for dispatch to user handlers.
///
/// Events the runtime itself consumes get typed variants; everything
/// else passes through as `Other` with its raw payload.
#[derive(Debug, Clone)]
pub enum ShardEvent {
    Ready(Ready),
    Resumed,
    GuildCreate(GuildSummary),
    GuildDelete(GuildUnavailable),
    ChannelCreate(ChannelSummary),
    ChannelDelete(ChannelSummary),
    GuildMemberAdd { guild_id: Snowflake },
    GuildMemberRemove { guild_id: Snowflake },
    VoiceStateUpdate(VoiceState),
    VoiceServerUpdate(VoiceServerUpdate),
    VoiceReady(VoiceReady),
    VoiceUserTalking(VoiceUserTalking),
    VoiceBufferSend(VoiceBufferSend),
    VoiceReceive(VoiceReceive),
    VoiceTrackMarker(VoiceTrackMarker),
    Other { name: String, data: Value },
}

impl ShardEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ShardEvent::Ready(_) => EventKind::Ready,
            ShardEvent::Resumed => EventKind::Resumed,
            ShardEvent::GuildCreate(_) => EventKind::GuildCreate,
            ShardEvent::GuildDelete(_) => EventKind::GuildDelete,
            ShardEvent::ChannelCreate(_) => EventKind::ChannelCreate,
            ShardEvent::ChannelDelete(_) => EventKind::ChannelDelete,
            ShardEvent::GuildMemberAdd { .. } => EventKind::GuildMemberAdd,
            ShardEvent::GuildMemberRemove { .. } => EventKind::GuildMemberRemove,
            ShardEvent::VoiceStateUpdate(_) => EventKind::VoiceStateUpdate,
            ShardEvent::VoiceServerUpdate(_) => EventKind::VoiceServerUpdate,
            ShardEvent::VoiceReady(_) => EventKind::VoiceReady,
            ShardEvent::VoiceUserTalking(_) => EventKind::VoiceUserTalking,
            ShardEvent::VoiceBufferSend(_) => EventKind::VoiceBufferSend,
            ShardEvent::VoiceReceive(_) => EventKind::VoiceReceive,
            ShardEvent::VoiceTrackMarker(_) => EventKind::VoiceTrackMarker,
            ShardEvent::Other { .. } => EventKind::Other,
        }
    }
}

/// Handler slot key: one handler may be registered per kind, and
/// re-registering replaces the previous handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    Resumed,
    GuildCreate,
    GuildDelete,
    ChannelCreate,
    ChannelDelete,
    GuildMemberAdd,
    GuildMemberRemove,
    VoiceStateUpdate,
    VoiceServerUpdate,
    VoiceReady,
    VoiceUserTalking,
    VoiceBufferSend,
    VoiceReceive,
    VoiceTrackMarker,
    /// Any dispatch without a typed decoder; the handler receives the raw
    /// payload under `ShardEvent::Other`.
    Other,
}

impl EventKind {
    /// Map a wire event name to its handler slot. Unknown names fall into
    /// the `Other` slot.
    pub fn from_name(name: &str) -> Self {
        match name {
            gateway::EVENT_READY => EventKind::Ready,
            gateway::EVENT_RESUMED => EventKind::Resumed,
            gateway::EVENT_GUILD_CREATE => EventKind::GuildCreate,
            gateway::EVENT_GUILD_DELETE => EventKind::GuildDelete,
            gateway::EVENT_CHANNEL_CREATE => EventKind::ChannelCreate,
            gateway::EVENT_CHANNEL_DELETE => EventKind::ChannelDelete,
            gateway::EVENT_GUILD_MEMBER_ADD => EventKind::GuildMemberAdd,
            gateway::EVENT_GUILD_MEMBER_REMOVE => EventKind::GuildMemberRemove,
            gateway::EVENT_VOICE_STATE_UPDATE => EventKind::VoiceStateUpdate,
            gateway::EVENT_VOICE_SERVER_UPDATE => EventKind::VoiceServerUpdate,
            _ => EventKind::Other,
        }
    }
}
