//! Event decoding and dispatch (L5).
//!
//! Two registries: event name → decoder, and event kind → user handler.
//! Both are frozen before the cluster starts running; one handler per
//! kind, and re-registering a kind replaces the previous handler.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use lanyard_models::event::{
    ChannelSummary, EmojiSummary, GuildSummary, GuildUnavailable, Ready, RoleSummary, UserSummary,
};
use lanyard_models::gateway as wire;
use lanyard_models::voice::{VoiceServerUpdate, VoiceState};
use lanyard_models::{EventKind, ShardEvent, Snowflake};

use crate::shard::ShardHandle;

// ── Collaborator traits ──────────────────────────────────────────────────────

/// Monotonic clock for heartbeat and readiness timers, separate from the
/// wall clock used by backoff jitter. Swappable in tests.
pub trait Clock: Send + Sync {
    /// Seconds since an arbitrary fixed origin.
    fn now(&self) -> u64;
}

pub struct MonotonicClock {
    started: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { started: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Object cache collaborator. The runtime never writes entities itself;
/// decoders push the minimal records they extract through this trait.
pub trait Cache: Send + Sync {
    fn find_user(&self, _id: Snowflake) -> Option<UserSummary> {
        None
    }
    fn find_guild(&self, _id: Snowflake) -> Option<GuildSummary> {
        None
    }
    fn find_channel(&self, _id: Snowflake) -> Option<ChannelSummary> {
        None
    }
    fn find_emoji(&self, _id: Snowflake) -> Option<EmojiSummary> {
        None
    }
    fn find_role(&self, _id: Snowflake) -> Option<RoleSummary> {
        None
    }
    fn store_user(&self, _user: &UserSummary) {}
    fn store_guild(&self, _guild: &GuildSummary) {}
    fn remove_guild(&self, _id: Snowflake) {}
    fn store_channel(&self, _channel: &ChannelSummary) {}
    fn remove_channel(&self, _id: Snowflake) {}
}

/// Default cache: remembers nothing.
pub struct NoopCache;

impl Cache for NoopCache {}

// ── Decoder registry ─────────────────────────────────────────────────────────

pub type Decoder = fn(&Value, &dyn Cache) -> Result<ShardEvent, serde_json::Error>;

pub struct DecoderRegistry {
    by_name: HashMap<&'static str, Decoder>,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        let mut registry = Self { by_name: HashMap::new() };
        registry.register(wire::EVENT_READY, decode_ready);
        registry.register(wire::EVENT_RESUMED, |_, _| Ok(ShardEvent::Resumed));
        registry.register(wire::EVENT_GUILD_CREATE, decode_guild_create);
        registry.register(wire::EVENT_GUILD_DELETE, decode_guild_delete);
        registry.register(wire::EVENT_CHANNEL_CREATE, decode_channel_create);
        registry.register(wire::EVENT_CHANNEL_DELETE, decode_channel_delete);
        registry.register(wire::EVENT_GUILD_MEMBER_ADD, decode_member_add);
        registry.register(wire::EVENT_GUILD_MEMBER_REMOVE, decode_member_remove);
        registry.register(wire::EVENT_VOICE_STATE_UPDATE, decode_voice_state);
        registry.register(wire::EVENT_VOICE_SERVER_UPDATE, decode_voice_server);
        registry
    }
}

impl DecoderRegistry {
    pub fn register(&mut self, name: &'static str, decoder: Decoder) {
        self.by_name.insert(name, decoder);
    }

    /// Decode a dispatch payload. Names without a registered decoder pass
    /// through as `ShardEvent::Other` with the raw payload.
    pub fn decode(
        &self,
        name: &str,
        data: &Value,
        cache: &dyn Cache,
    ) -> Result<ShardEvent, serde_json::Error> {
        match self.by_name.get(name) {
            Some(decoder) => decoder(data, cache),
            None => Ok(ShardEvent::Other {
                name: name.to_string(),
                data: data.clone(),
            }),
        }
    }
}

fn decode_ready(data: &Value, cache: &dyn Cache) -> Result<ShardEvent, serde_json::Error> {
    let ready: Ready = serde_json::from_value(data.clone())?;
    if let Some(user) = &ready.user {
        cache.store_user(user);
    }
    Ok(ShardEvent::Ready(ready))
}

fn decode_guild_create(data: &Value, cache: &dyn Cache) -> Result<ShardEvent, serde_json::Error> {
    // GUILD_CREATE carries full channel objects; the summary keeps ids.
    let channel_ids = data
        .get("channels")
        .and_then(Value::as_array)
        .map(|channels| {
            channels
                .iter()
                .filter_map(|c| c.get("id"))
                .filter_map(|id| serde_json::from_value::<Snowflake>(id.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let guild = GuildSummary {
        id: serde_json::from_value(data.get("id").cloned().unwrap_or(Value::Null))?,
        name: data
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        member_count: data.get("member_count").and_then(Value::as_u64).unwrap_or(0),
        channel_ids,
    };
    cache.store_guild(&guild);
    Ok(ShardEvent::GuildCreate(guild))
}

fn decode_guild_delete(data: &Value, cache: &dyn Cache) -> Result<ShardEvent, serde_json::Error> {
    let gone: GuildUnavailable = serde_json::from_value(data.clone())?;
    cache.remove_guild(gone.id);
    Ok(ShardEvent::GuildDelete(gone))
}

fn decode_channel_create(data: &Value, cache: &dyn Cache) -> Result<ShardEvent, serde_json::Error> {
    let channel: ChannelSummary = serde_json::from_value(data.clone())?;
    cache.store_channel(&channel);
    Ok(ShardEvent::ChannelCreate(channel))
}

fn decode_channel_delete(data: &Value, cache: &dyn Cache) -> Result<ShardEvent, serde_json::Error> {
    let channel: ChannelSummary = serde_json::from_value(data.clone())?;
    cache.remove_channel(channel.id);
    Ok(ShardEvent::ChannelDelete(channel))
}

fn decode_member_add(data: &Value, _cache: &dyn Cache) -> Result<ShardEvent, serde_json::Error> {
    let guild_id = serde_json::from_value(data.get("guild_id").cloned().unwrap_or(Value::Null))?;
    Ok(ShardEvent::GuildMemberAdd { guild_id })
}

fn decode_member_remove(data: &Value, _cache: &dyn Cache) -> Result<ShardEvent, serde_json::Error> {
    let guild_id = serde_json::from_value(data.get("guild_id").cloned().unwrap_or(Value::Null))?;
    Ok(ShardEvent::GuildMemberRemove { guild_id })
}

fn decode_voice_state(data: &Value, _cache: &dyn Cache) -> Result<ShardEvent, serde_json::Error> {
    Ok(ShardEvent::VoiceStateUpdate(serde_json::from_value(data.clone())?))
}

fn decode_voice_server(data: &Value, _cache: &dyn Cache) -> Result<ShardEvent, serde_json::Error> {
    Ok(ShardEvent::VoiceServerUpdate(serde_json::from_value(data.clone())?))
}

// ── Handler registry ─────────────────────────────────────────────────────────

/// Context passed alongside every dispatched event.
#[derive(Clone)]
pub struct EventContext {
    /// Handle of the shard the event arrived on. `None` for events that
    /// originate on a voice media client's own task.
    pub shard: Option<ShardHandle>,
}

type Handler = Box<dyn Fn(&EventContext, &ShardEvent) + Send + Sync>;

#[derive(Default)]
pub struct HandlerRegistry {
    slots: HashMap<EventKind, Handler>,
}

impl HandlerRegistry {
    /// Register the handler for one event kind. The last registration for
    /// a kind wins.
    pub fn on<F>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(&EventContext, &ShardEvent) + Send + Sync + 'static,
    {
        self.slots.insert(kind, Box::new(handler));
    }

    pub fn handles(&self, kind: EventKind) -> bool {
        self.slots.contains_key(&kind)
    }

    /// Invoke the registered handler, if any. Handler panics are caught
    /// here; a broken callback must not take the shard down with it.
    pub fn dispatch(&self, ctx: &EventContext, event: &ShardEvent) {
        let Some(handler) = self.slots.get(&event.kind()) else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| handler(ctx, event))).is_err() {
            tracing::warn!(kind = ?event.kind(), "event handler panicked; shard continues");
        }
    }
}

/// Cloneable sink for components that emit events from their own tasks
/// (voice media clients). Events emitted here carry no shard handle.
#[derive(Clone)]
pub struct EventSink {
    handlers: Arc<HandlerRegistry>,
}

impl EventSink {
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self { handlers }
    }

    pub fn emit(&self, event: ShardEvent) {
        let ctx = EventContext { shard: None };
        self.handlers.dispatch(&ctx, &event);
    }
}
