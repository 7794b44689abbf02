//! Per-guild voice connection management (L4).
//!
//! A shard can hold one voice connection per guild. The record is created
//! empty on `connect_voice`; the gateway later delivers the session id
//! (VOICE_STATE_UPDATE for the bot user) and the endpoint plus token
//! (VOICE_SERVER_UPDATE), in either order. Once all three are present the
//! media client is constructed and started on its own task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use lanyard_models::gateway as wire;
use lanyard_models::voice::{VoiceServerUpdate, VoiceState};
use lanyard_models::Snowflake;

use crate::dispatch::{Clock, EventSink};
use crate::error::VoiceError;
use crate::shard::ShardHandle;

/// Seconds a record may sit incomplete before it is torn down.
pub const VOICE_READY_TIMEOUT_SECS: u64 = 30;

/// The media client consumed through a narrow seam: Opus, encryption and
/// the UDP transport all live behind it.
pub trait MediaClient: Send {
    fn start(&mut self) -> Result<(), VoiceError>;
    /// Must stop the client's task; called before the record is dropped.
    fn stop(&mut self);
}

/// Everything a media client needs to begin its signalling handshake.
#[derive(Clone)]
pub struct VoiceSession {
    pub guild_id: Snowflake,
    pub channel_id: Snowflake,
    /// Signalling hostname with any `:port` suffix stripped.
    pub endpoint: String,
    pub session_id: String,
    pub token: String,
    /// Handle back to the owning shard for outbound voice-state updates.
    pub shard: ShardHandle,
    /// Sink for voice events; emissions carry no shard handle.
    pub events: EventSink,
}

pub trait MediaClientFactory: Send + Sync {
    fn create(&self, session: VoiceSession) -> Box<dyn MediaClient>;
}

/// Default factory for gateways running without a media stack.
pub struct NullMediaFactory;

impl MediaClientFactory for NullMediaFactory {
    fn create(&self, session: VoiceSession) -> Box<dyn MediaClient> {
        tracing::debug!(guild_id = %session.guild_id, "no media factory configured; voice is signalling-only");
        struct Null;
        impl MediaClient for Null {
            fn start(&mut self) -> Result<(), VoiceError> {
                Ok(())
            }
            fn stop(&mut self) {}
        }
        Box::new(Null)
    }
}

/// One voice channel's signalling state.
pub struct VoiceConn {
    pub channel_id: Snowflake,
    pub endpoint: Option<String>,
    pub session_id: Option<String>,
    pub token: Option<String>,
    media: Option<Box<dyn MediaClient>>,
    created_at: u64,
}

impl VoiceConn {
    fn new(channel_id: Snowflake, now: u64) -> Self {
        Self {
            channel_id,
            endpoint: None,
            session_id: None,
            token: None,
            media: None,
            created_at: now,
        }
    }

    /// All signalling pieces present, media client not yet constructed.
    pub fn is_ready(&self) -> bool {
        self.media.is_none()
            && self.endpoint.is_some()
            && self.session_id.is_some()
            && self.token.is_some()
    }

    /// Media client constructed and running.
    pub fn is_active(&self) -> bool {
        self.media.is_some()
    }
}

/// Owned snapshot of a voice record, safe to hand out without holding the
/// connection map's mutex.
#[derive(Debug, Clone)]
pub struct VoiceInfo {
    pub channel_id: Snowflake,
    pub endpoint: Option<String>,
    pub session_id: Option<String>,
    pub token: Option<String>,
    pub active: bool,
}

pub struct VoiceManager {
    conns: Mutex<HashMap<Snowflake, VoiceConn>>,
    factory: Arc<dyn MediaClientFactory>,
    shard: ShardHandle,
    events: EventSink,
    clock: Arc<dyn Clock>,
}

impl VoiceManager {
    pub fn new(
        shard: ShardHandle,
        events: EventSink,
        factory: Arc<dyn MediaClientFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            factory,
            shard,
            events,
            clock,
        }
    }

    /// Begin joining a voice channel. Sends the voice-state update at the
    /// front of the outbound queue; the record completes asynchronously.
    pub fn connect_voice(&self, guild_id: Snowflake, channel_id: Snowflake) -> Result<(), VoiceError> {
        {
            let mut conns = self.lock();
            if conns.contains_key(&guild_id) {
                return Err(VoiceError::AlreadyConnected(guild_id));
            }
            conns.insert(guild_id, VoiceConn::new(channel_id, self.clock.now()));
        }
        // Queue push happens with the connection map unlocked; the two
        // mutexes are never held together.
        self.shard.queue_message(
            wire::voice_state_update(guild_id, Some(channel_id), false, false).to_json(),
            true,
        );
        Ok(())
    }

    /// Leave the guild's voice channel and stop its media client.
    pub fn disconnect_voice(&self, guild_id: Snowflake) -> Result<(), VoiceError> {
        let removed = self.lock().remove(&guild_id);
        let Some(mut conn) = removed else {
            return Err(VoiceError::NotConnected(guild_id));
        };
        if let Some(media) = conn.media.as_mut() {
            media.stop();
        }
        self.shard.queue_message(
            wire::voice_state_update(guild_id, None, false, false).to_json(),
            true,
        );
        tracing::info!(guild_id = %guild_id, "voice disconnected");
        Ok(())
    }

    pub fn get_voice(&self, guild_id: Snowflake) -> Option<VoiceInfo> {
        self.lock().get(&guild_id).map(|conn| VoiceInfo {
            channel_id: conn.channel_id,
            endpoint: conn.endpoint.clone(),
            session_id: conn.session_id.clone(),
            token: conn.token.clone(),
            active: conn.is_active(),
        })
    }

    /// Run `f` against the live record while the map lock is held.
    pub fn with_voice<R>(&self, guild_id: Snowflake, f: impl FnOnce(&VoiceConn) -> R) -> Option<R> {
        self.lock().get(&guild_id).map(f)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// The bot user's own VOICE_STATE_UPDATE supplies the session id.
    pub fn on_voice_state_update(&self, bot_user: Snowflake, state: &VoiceState) {
        if state.user_id != bot_user {
            return;
        }
        let Some(guild_id) = state.guild_id else {
            return;
        };
        {
            let mut conns = self.lock();
            let Some(conn) = conns.get_mut(&guild_id) else {
                return;
            };
            conn.session_id = Some(state.session_id.clone());
        }
        self.try_activate(guild_id);
    }

    /// VOICE_SERVER_UPDATE supplies the endpoint and token.
    pub fn on_voice_server_update(&self, update: &VoiceServerUpdate) {
        {
            let mut conns = self.lock();
            let Some(conn) = conns.get_mut(&update.guild_id) else {
                return;
            };
            conn.token = Some(update.token.clone());
            conn.endpoint = update.endpoint.as_deref().map(strip_port).map(str::to_string);
        }
        self.try_activate(update.guild_id);
    }

    /// Drop the record when the guild itself goes away.
    pub fn remove_guild(&self, guild_id: Snowflake) {
        if let Some(mut conn) = self.lock().remove(&guild_id) {
            if let Some(media) = conn.media.as_mut() {
                media.stop();
            }
            tracing::debug!(guild_id = %guild_id, "voice record dropped with its guild");
        }
    }

    /// Tear down records that never became ready. Returns the expired
    /// guild ids so the shard can surface the error.
    pub fn sweep(&self) -> Vec<Snowflake> {
        let now = self.clock.now();
        let mut expired = Vec::new();
        let mut conns = self.lock();
        conns.retain(|guild_id, conn| {
            let stale =
                !conn.is_active() && now.saturating_sub(conn.created_at) >= VOICE_READY_TIMEOUT_SECS;
            if stale {
                expired.push(*guild_id);
            }
            !stale
        });
        expired
    }

    /// Stop every media client; used on shard shutdown.
    pub fn shutdown(&self) {
        let mut conns = self.lock();
        for conn in conns.values_mut() {
            if let Some(media) = conn.media.as_mut() {
                media.stop();
            }
        }
        conns.clear();
    }

    /// Construct and start the media client once session, token and
    /// endpoint are all present. The factory runs with the map unlocked.
    fn try_activate(&self, guild_id: Snowflake) {
        let session = {
            let conns = self.lock();
            let Some(conn) = conns.get(&guild_id) else {
                return;
            };
            if !conn.is_ready() {
                return;
            }
            VoiceSession {
                guild_id,
                channel_id: conn.channel_id,
                endpoint: conn.endpoint.clone().unwrap_or_default(),
                session_id: conn.session_id.clone().unwrap_or_default(),
                token: conn.token.clone().unwrap_or_default(),
                shard: self.shard.clone(),
                events: self.events.clone(),
            }
        };

        let mut media = self.factory.create(session.clone());
        if let Err(err) = media.start() {
            tracing::error!(guild_id = %guild_id, error = %err, "voice media client failed to start");
            return;
        }

        let mut conns = self.lock();
        match conns.get_mut(&guild_id) {
            // Still wanted and nobody else activated it meanwhile.
            Some(conn) if conn.media.is_none() => {
                conn.media = Some(media);
                tracing::info!(
                    guild_id = %guild_id,
                    endpoint = %session.endpoint,
                    "voice media client started"
                );
            }
            _ => media.stop(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Snowflake, VoiceConn>> {
        self.conns.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `host:port` → `host`. The gateway reports signalling endpoints with a
/// port suffix the websocket layer supplies itself.
fn strip_port(endpoint: &str) -> &str {
    endpoint.split(':').next().unwrap_or(endpoint)
}
