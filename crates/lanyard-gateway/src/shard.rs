//! Gateway shard (L2): one connection, one partition of guild traffic.
//!
//! The shard owns the protocol state machine: identify/resume, heartbeat
//! cadence, sequence tracking, zlib-stream inflation and event dispatch.
//! All of that logic is synchronous and driven by the async session loop
//! in [`Shard::run`], which owns the socket.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use lanyard_models::gateway as wire;
use lanyard_models::{GatewayMessage, ShardEvent, Snowflake};

use crate::backoff::{self, Backoff};
use crate::config::GatewayConfig;
use crate::dispatch::{Cache, Clock, DecoderRegistry, EventContext, EventSink, HandlerRegistry};
use crate::error::{GatewayError, InflateError, VoiceError, WsError};
use crate::queue::OutboundQueue;
use crate::stream::{tls_client_config, StreamActivity};
use crate::voice::{MediaClientFactory, VoiceManager};
use crate::ws::{WsClient, WsEvent};
use crate::zlib::ZlibStream;

/// Seconds a shard may wait in Identifying/Resuming before the connection
/// is declared stuck and replaced.
const READY_DEADLINE_SECS: u64 = 30;

/// Shard coordinates: `0 <= index < total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardId {
    pub index: u32,
    pub total: u32,
}

impl ShardId {
    pub fn new(index: u32, total: u32) -> Self {
        Self { index, total }
    }

    /// Whether this shard owns the given guild under the platform's
    /// partition function.
    pub fn owns_guild(&self, guild_id: Snowflake) -> bool {
        self.total != 0 && guild_id.0 % self.total as u64 == self.index as u64
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.index, self.total)
    }
}

/// Connection lifetime broken down for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uptime {
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
}

impl From<Duration> for Uptime {
    fn from(d: Duration) -> Self {
        let total = d.as_secs();
        Self {
            days: total / 86_400,
            hours: total % 86_400 / 3_600,
            minutes: total % 3_600 / 60,
            seconds: total % 60,
        }
    }
}

impl fmt::Display for Uptime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}d {}h {}m {}s",
            self.days, self.hours, self.minutes, self.seconds
        )
    }
}

/// Counters shared between the shard task and its handles.
#[derive(Debug, Default)]
pub struct ShardStats {
    pub connected: AtomicBool,
    pub ready: AtomicBool,
    pub resumes: AtomicU32,
    pub reconnects: AtomicU32,
    pub sequence: AtomicU64,
    pub guilds: AtomicU64,
    pub members: AtomicU64,
    pub channels: AtomicU64,
    pub decompressed_bytes_in: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    connected_at: Mutex<Option<Instant>>,
}

impl ShardStats {
    fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        *self.connected_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        *self.connected_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn uptime(&self) -> Option<Uptime> {
        self.connected_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|at| Uptime::from(at.elapsed()))
    }
}

/// Lightweight, copyable reference to a running shard. Safe to hold in
/// user callbacks and on voice tasks; it never keeps the shard alive.
#[derive(Clone)]
pub struct ShardHandle {
    pub id: ShardId,
    queue: Arc<OutboundQueue>,
    stats: Arc<ShardStats>,
    wake: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    voice: Weak<VoiceManager>,
}

impl ShardHandle {
    /// Queue an already-encoded JSON message for transmission. Front
    /// insertion is for urgent traffic and triggers an immediate drain.
    pub fn queue_message(&self, json: String, to_front: bool) {
        if to_front {
            self.queue.push_front(json);
            self.wake.notify_one();
        } else {
            self.queue.push_back(json);
        }
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn is_connected(&self) -> bool {
        self.stats.connected.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.stats.ready.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> Option<Uptime> {
        self.stats.uptime()
    }

    pub fn guild_count(&self) -> u64 {
        self.stats.guilds.load(Ordering::SeqCst)
    }

    pub fn member_count(&self) -> u64 {
        self.stats.members.load(Ordering::SeqCst)
    }

    pub fn channel_count(&self) -> u64 {
        self.stats.channels.load(Ordering::SeqCst)
    }

    pub fn decompressed_bytes_in(&self) -> u64 {
        self.stats.decompressed_bytes_in.load(Ordering::SeqCst)
    }

    pub fn bytes_in(&self) -> u64 {
        self.stats.bytes_in.load(Ordering::SeqCst)
    }

    pub fn bytes_out(&self) -> u64 {
        self.stats.bytes_out.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> u32 {
        self.stats.resumes.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> u32 {
        self.stats.reconnects.load(Ordering::SeqCst)
    }

    /// Voice manager of the owning shard, if it is still running.
    pub fn voice(&self) -> Option<Arc<VoiceManager>> {
        self.voice.upgrade()
    }

    /// Join a voice channel on one of this shard's guilds.
    pub fn connect_voice(&self, guild_id: Snowflake, channel_id: Snowflake) -> Result<(), VoiceError> {
        self.voice
            .upgrade()
            .ok_or(VoiceError::ShardGone)?
            .connect_voice(guild_id, channel_id)
    }

    /// Leave the voice channel on a guild and stop its media client.
    pub fn disconnect_voice(&self, guild_id: Snowflake) -> Result<(), VoiceError> {
        self.voice
            .upgrade()
            .ok_or(VoiceError::ShardGone)?
            .disconnect_voice(guild_id)
    }

    /// Snapshot of the voice record for a guild, if one exists.
    pub fn get_voice(&self, guild_id: Snowflake) -> Option<crate::voice::VoiceInfo> {
        self.voice.upgrade()?.get_voice(guild_id)
    }

    /// Ask the shard to close its connection and stop.
    pub fn request_stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn for_tests(id: ShardId, queue: Arc<OutboundQueue>, stats: Arc<ShardStats>) -> Self {
        Self {
            id,
            queue,
            stats,
            wake: Arc::new(Notify::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            voice: Weak::new(),
        }
    }
}

/// Everything a shard consumes but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub handlers: Arc<HandlerRegistry>,
    pub decoders: Arc<DecoderRegistry>,
    pub cache: Arc<dyn Cache>,
    pub clock: Arc<dyn Clock>,
    pub media: Arc<dyn MediaClientFactory>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Disconnected,
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    Running,
    Reconnecting,
    Closed,
}

/// Outcome of handling one inbound message or tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Wait a jittered 1-5 s, then resume (if allowed) or re-identify on
    /// the same connection.
    InvalidSession { resumable: bool },
    /// Tear the socket down and reconnect, preserving the session.
    Reconnect,
    Fatal(u16),
}

enum SessionEnd {
    Retry,
    Shutdown,
}

pub struct Shard {
    config: Arc<GatewayConfig>,
    id: ShardId,
    state: SessionState,
    state_entered_at: u64,
    session_id: Option<String>,
    sequence: Option<u64>,
    heartbeat_interval_ms: u64,
    last_heartbeat_sent: u64,
    last_heartbeat_ack: u64,
    bot_user: Option<Snowflake>,
    /// Per-guild (member, channel) counts so deletes decrement correctly.
    guild_meta: HashMap<Snowflake, (u64, u64)>,
    queue: Arc<OutboundQueue>,
    wake: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    zlib: ZlibStream,
    voice: Arc<VoiceManager>,
    collab: Collaborators,
    stats: Arc<ShardStats>,
    backoff: Backoff,
}

impl Shard {
    pub fn new(config: Arc<GatewayConfig>, index: u32, collab: Collaborators) -> Self {
        let id = ShardId::new(index, config.shard_count);
        let queue = Arc::new(OutboundQueue::new());
        let stats = Arc::new(ShardStats::default());
        let wake = Arc::new(Notify::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let events = EventSink::new(Arc::clone(&collab.handlers));
        let voice = Arc::new_cyclic(|weak: &Weak<VoiceManager>| {
            let handle = ShardHandle {
                id,
                queue: Arc::clone(&queue),
                stats: Arc::clone(&stats),
                wake: Arc::clone(&wake),
                shutdown: Arc::clone(&shutdown),
                voice: weak.clone(),
            };
            VoiceManager::new(handle, events, Arc::clone(&collab.media), Arc::clone(&collab.clock))
        });

        Self {
            config,
            id,
            state: SessionState::Disconnected,
            state_entered_at: 0,
            session_id: None,
            sequence: None,
            heartbeat_interval_ms: 0,
            last_heartbeat_sent: 0,
            last_heartbeat_ack: 0,
            bot_user: None,
            guild_meta: HashMap::new(),
            queue,
            wake,
            shutdown,
            zlib: ZlibStream::new(),
            voice,
            collab,
            stats,
            backoff: Backoff::new(),
        }
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn handle(&self) -> ShardHandle {
        ShardHandle {
            id: self.id,
            queue: Arc::clone(&self.queue),
            stats: Arc::clone(&self.stats),
            wake: Arc::clone(&self.wake),
            shutdown: Arc::clone(&self.shutdown),
            voice: Arc::downgrade(&self.voice),
        }
    }

    pub fn voice(&self) -> &VoiceManager {
        &self.voice
    }

    // ── Connection driver ────────────────────────────────────────────────────

    /// Run until shut down or a fatal error. Transient failures reconnect
    /// with exponential backoff, resuming the session when possible.
    pub async fn run(&mut self) -> Result<(), GatewayError> {
        self.config.validate()?;
        let tls = tls_client_config(self.config.ca_bundle.as_deref())?;
        let path = self.config.gateway_path();

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.state = SessionState::Closed;
                return Ok(());
            }

            self.state = SessionState::Connecting;
            // A dead connection's backlog would be stale on the new one.
            self.queue.clear();
            self.zlib.reset();
            self.heartbeat_interval_ms = 0;

            let connect = WsClient::connect(
                &self.config.gateway_host,
                self.config.gateway_port,
                &path,
                Arc::clone(&tls),
                Arc::clone(&self.wake),
            )
            .await;

            match connect {
                Ok(mut ws) => {
                    tracing::info!(shard = %self.id, host = %self.config.gateway_host, "shard connecting");
                    self.stats.mark_connected();
                    let end = self.run_session(&mut ws).await;
                    self.stats.mark_disconnected();
                    self.sync_byte_counters(&ws);

                    match end {
                        Ok(SessionEnd::Shutdown) => {
                            ws.close(1000).await;
                            self.voice.shutdown();
                            self.state = SessionState::Closed;
                            tracing::info!(shard = %self.id, "shard shut down");
                            return Ok(());
                        }
                        Ok(SessionEnd::Retry) => {
                            ws.close(1000).await;
                        }
                        Err(err) if err.is_fatal() => {
                            ws.close(1000).await;
                            self.voice.shutdown();
                            self.state = SessionState::Closed;
                            tracing::error!(shard = %self.id, error = %err, "shard stopping: unrecoverable failure");
                            return Err(err);
                        }
                        Err(err) => {
                            ws.close(1002).await;
                            tracing::warn!(shard = %self.id, error = %err, "session ended with error");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(shard = %self.id, error = %err, "connect failed");
                }
            }

            self.state = SessionState::Reconnecting;
            let delay = self.backoff.next_delay();
            tracing::info!(shard = %self.id, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_session(&mut self, ws: &mut WsClient) -> Result<SessionEnd, GatewayError> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(SessionEnd::Shutdown);
            }

            match ws.drive().await {
                Ok(StreamActivity::Data) => loop {
                    let Some(event) = ws.handle_buffer()? else {
                        break;
                    };
                    match event {
                        WsEvent::Upgraded => {
                            self.enter_state(SessionState::AwaitingHello);
                        }
                        WsEvent::Text(raw) => {
                            match self.handle_text(&raw) {
                                Flow::Continue => {}
                                flow => {
                                    if let Some(end) = self.apply_flow(flow, ws).await? {
                                        return Ok(end);
                                    }
                                }
                            }
                            self.drain_queue(ws);
                        }
                        WsEvent::Binary(bytes) => {
                            for raw in self.inflate_frame(&bytes)? {
                                match self.handle_text(&raw) {
                                    Flow::Continue => {}
                                    flow => {
                                        if let Some(end) = self.apply_flow(flow, ws).await? {
                                            return Ok(end);
                                        }
                                    }
                                }
                            }
                            self.drain_queue(ws);
                        }
                        WsEvent::Closed(code) => {
                            return self.handle_close(code);
                        }
                    }
                },
                Ok(StreamActivity::Tick) => {
                    ws.on_second()?;
                    match self.on_tick() {
                        Flow::Continue => {}
                        flow => {
                            if let Some(end) = self.apply_flow(flow, ws).await? {
                                return Ok(end);
                            }
                        }
                    }
                    self.drain_queue(ws);
                    self.sync_byte_counters(ws);
                }
                Ok(StreamActivity::Wake) => {
                    self.drain_queue(ws);
                }
                Ok(StreamActivity::Eof) => {
                    tracing::warn!(shard = %self.id, "gateway closed the stream");
                    return Ok(SessionEnd::Retry);
                }
                Err(WsError::Io(err)) => {
                    tracing::warn!(shard = %self.id, error = %err, "socket error");
                    return Ok(SessionEnd::Retry);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn apply_flow(
        &mut self,
        flow: Flow,
        ws: &mut WsClient,
    ) -> Result<Option<SessionEnd>, GatewayError> {
        match flow {
            Flow::Continue => Ok(None),
            Flow::Reconnect => Ok(Some(SessionEnd::Retry)),
            Flow::Fatal(code) => Err(GatewayError::Fatal { code }),
            Flow::InvalidSession { resumable } => {
                let delay = backoff::jittered_delay_secs(1, 5);
                tracing::info!(
                    shard = %self.id,
                    resumable,
                    delay_ms = delay.as_millis() as u64,
                    "invalid session; re-authenticating after delay"
                );
                tokio::time::sleep(delay).await;
                if resumable && self.session_id.is_some() {
                    self.send_resume();
                } else {
                    self.send_identify();
                }
                self.drain_queue(ws);
                Ok(None)
            }
        }
    }

    /// One message per call site; front-of-queue traffic triggered a wake
    /// and drains immediately, bulk traffic rides the one-second tick.
    fn drain_queue(&mut self, ws: &mut WsClient) {
        if !ws.is_connected() {
            return;
        }
        if let Some(message) = self.queue.pop_front() {
            tracing::trace!(target: "wire", shard = %self.id, bytes = message.len(), "gateway_out");
            ws.send_text(&message);
        }
    }

    fn sync_byte_counters(&self, ws: &WsClient) {
        self.stats.bytes_in.store(ws.bytes_in(), Ordering::SeqCst);
        self.stats.bytes_out.store(ws.bytes_out(), Ordering::SeqCst);
    }

    fn inflate_frame(&mut self, bytes: &[u8]) -> Result<Vec<String>, GatewayError> {
        match self.zlib.feed(bytes) {
            Ok(messages) => {
                self.stats
                    .decompressed_bytes_in
                    .store(self.zlib.decompressed_total(), Ordering::SeqCst);
                Ok(messages)
            }
            Err(err @ InflateError::Corrupt(_)) => {
                tracing::warn!(shard = %self.id, error = %err, "zlib context corrupt; resetting and reconnecting");
                self.zlib.reset();
                Err(err.into())
            }
            Err(err) => {
                tracing::warn!(shard = %self.id, error = %err, "dropping undecodable frame");
                Ok(Vec::new())
            }
        }
    }

    // ── Protocol state machine ───────────────────────────────────────────────

    fn enter_state(&mut self, state: SessionState) {
        self.state = state;
        self.state_entered_at = self.collab.clock.now();
    }

    fn handle_text(&mut self, raw: &str) -> Flow {
        let msg = match GatewayMessage::parse(raw) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(shard = %self.id, error = %err, "malformed gateway message");
                return Flow::Continue;
            }
        };
        tracing::trace!(target: "wire", shard = %self.id, op = msg.op, seq = ?msg.s, event = ?msg.t, bytes = raw.len(), "gateway_in");
        self.handle_message(msg)
    }

    fn handle_message(&mut self, msg: GatewayMessage) -> Flow {
        match msg.op {
            wire::OP_HELLO => self.on_hello(msg.d.as_ref()),
            wire::OP_HEARTBEAT_ACK => {
                self.last_heartbeat_ack = self.collab.clock.now();
                Flow::Continue
            }
            wire::OP_HEARTBEAT => {
                // The server may request an immediate beat.
                self.queue.push_front(wire::heartbeat(self.sequence).to_json());
                Flow::Continue
            }
            wire::OP_RECONNECT => {
                tracing::info!(shard = %self.id, "server requested reconnect");
                Flow::Reconnect
            }
            wire::OP_INVALID_SESSION => {
                let resumable = msg.d.as_ref().and_then(Value::as_bool).unwrap_or(false);
                if !resumable {
                    self.session_id = None;
                    self.sequence = None;
                    self.stats.sequence.store(0, Ordering::SeqCst);
                }
                Flow::InvalidSession { resumable }
            }
            wire::OP_DISPATCH => {
                if let Some(s) = msg.s {
                    // Sequence only moves forward within a session.
                    if self.sequence.is_none_or(|current| s > current) {
                        self.sequence = Some(s);
                        self.stats.sequence.store(s, Ordering::SeqCst);
                    }
                }
                if let Some(name) = msg.t.as_deref() {
                    self.handle_dispatch(name, msg.d.unwrap_or(Value::Null));
                }
                Flow::Continue
            }
            other => {
                tracing::warn!(shard = %self.id, op = other, "unknown gateway opcode");
                Flow::Continue
            }
        }
    }

    fn on_hello(&mut self, data: Option<&Value>) -> Flow {
        let interval = data
            .and_then(|d| d.get("heartbeat_interval"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if interval == 0 {
            tracing::warn!(shard = %self.id, "hello without heartbeat_interval");
            return Flow::Reconnect;
        }
        self.heartbeat_interval_ms = interval;

        // Spread first beats across the fleet: back-date the send clock by
        // a random fraction of the interval.
        let now = self.collab.clock.now();
        let interval_secs = self.heartbeat_interval_secs();
        let jitter_secs = (backoff::heartbeat_jitter() * interval_secs as f64) as u64;
        self.last_heartbeat_sent = (now + jitter_secs).saturating_sub(interval_secs);
        self.last_heartbeat_ack = now;

        if let (Some(session), Some(seq)) = (self.session_id.as_deref(), self.sequence) {
            tracing::info!(shard = %self.id, session = session, seq, "resuming session");
            self.send_resume();
        } else {
            tracing::info!(shard = %self.id, "identifying");
            self.send_identify();
        }
        Flow::Continue
    }

    fn send_identify(&mut self) {
        self.queue.push_front(
            wire::identify(
                &self.config.token,
                self.config.intents,
                self.id.index,
                self.id.total,
                self.config.large_threshold,
            )
            .to_json(),
        );
        self.enter_state(SessionState::Identifying);
    }

    fn send_resume(&mut self) {
        let session = self.session_id.clone().unwrap_or_default();
        self.queue.push_front(
            wire::resume(&self.config.token, &session, self.sequence.unwrap_or(0)).to_json(),
        );
        self.enter_state(SessionState::Resuming);
    }

    fn handle_dispatch(&mut self, name: &str, data: Value) {
        let event = match self.collab.decoders.decode(name, &data, self.collab.cache.as_ref()) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(shard = %self.id, event = name, error = %err, "malformed event payload");
                return;
            }
        };

        self.apply_event(&event);

        let ctx = EventContext { shard: Some(self.handle()) };
        self.collab.handlers.dispatch(&ctx, &event);
    }

    /// Internal bookkeeping the shard performs before user handlers see
    /// the event.
    fn apply_event(&mut self, event: &ShardEvent) {
        match event {
            ShardEvent::Ready(ready) => {
                self.session_id = Some(ready.session_id.clone());
                self.bot_user = ready.user.as_ref().map(|u| u.id);
                self.stats.ready.store(true, Ordering::SeqCst);
                self.stats.reconnects.fetch_add(1, Ordering::SeqCst);
                self.backoff.reset();
                self.enter_state(SessionState::Running);
                tracing::info!(shard = %self.id, session = %ready.session_id, "shard ready");
            }
            ShardEvent::Resumed => {
                self.stats.ready.store(true, Ordering::SeqCst);
                self.stats.resumes.fetch_add(1, Ordering::SeqCst);
                self.backoff.reset();
                self.enter_state(SessionState::Running);
                tracing::info!(shard = %self.id, seq = ?self.sequence, "session resumed");
            }
            ShardEvent::GuildCreate(guild) => {
                let members = guild.member_count;
                let channels = guild.channel_ids.len() as u64;
                if let Some((old_members, old_channels)) =
                    self.guild_meta.insert(guild.id, (members, channels))
                {
                    self.stats.members.fetch_sub(old_members, Ordering::SeqCst);
                    self.stats.channels.fetch_sub(old_channels, Ordering::SeqCst);
                } else {
                    self.stats.guilds.fetch_add(1, Ordering::SeqCst);
                }
                self.stats.members.fetch_add(members, Ordering::SeqCst);
                self.stats.channels.fetch_add(channels, Ordering::SeqCst);
            }
            ShardEvent::GuildDelete(gone) => {
                if let Some((members, channels)) = self.guild_meta.remove(&gone.id) {
                    self.stats.guilds.fetch_sub(1, Ordering::SeqCst);
                    self.stats.members.fetch_sub(members, Ordering::SeqCst);
                    self.stats.channels.fetch_sub(channels, Ordering::SeqCst);
                }
                self.voice.remove_guild(gone.id);
            }
            ShardEvent::ChannelCreate(channel) => {
                self.stats.channels.fetch_add(1, Ordering::SeqCst);
                if let Some(guild_id) = channel.guild_id {
                    if let Some((_, channels)) = self.guild_meta.get_mut(&guild_id) {
                        *channels += 1;
                    }
                }
            }
            ShardEvent::ChannelDelete(channel) => {
                if let Some(guild_id) = channel.guild_id {
                    if let Some((_, channels)) = self.guild_meta.get_mut(&guild_id) {
                        *channels = channels.saturating_sub(1);
                        self.stats.channels.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }
            ShardEvent::GuildMemberAdd { guild_id } => {
                self.stats.members.fetch_add(1, Ordering::SeqCst);
                if let Some((members, _)) = self.guild_meta.get_mut(guild_id) {
                    *members += 1;
                }
            }
            ShardEvent::GuildMemberRemove { guild_id } => {
                if let Some((members, _)) = self.guild_meta.get_mut(guild_id) {
                    *members = members.saturating_sub(1);
                    self.stats.members.fetch_sub(1, Ordering::SeqCst);
                }
            }
            ShardEvent::VoiceStateUpdate(state) => {
                if let Some(bot_user) = self.bot_user {
                    self.voice.on_voice_state_update(bot_user, state);
                }
            }
            ShardEvent::VoiceServerUpdate(update) => {
                self.voice.on_voice_server_update(update);
            }
            _ => {}
        }
    }

    fn heartbeat_interval_secs(&self) -> u64 {
        (self.heartbeat_interval_ms / 1_000).max(1)
    }

    /// One-second housekeeping: heartbeat cadence, ack deadline, ready
    /// deadline and the voice readiness sweep.
    fn on_tick(&mut self) -> Flow {
        let now = self.collab.clock.now();

        if matches!(self.state, SessionState::Identifying | SessionState::Resuming)
            && now.saturating_sub(self.state_entered_at) >= READY_DEADLINE_SECS
        {
            tracing::warn!(shard = %self.id, state = ?self.state, "no READY/RESUMED within deadline; reconnecting");
            return Flow::Reconnect;
        }

        if self.heartbeat_interval_ms > 0
            && matches!(
                self.state,
                SessionState::Identifying | SessionState::Resuming | SessionState::Running
            )
        {
            let interval = self.heartbeat_interval_secs();

            if now.saturating_sub(self.last_heartbeat_sent) >= interval {
                self.queue.push_front(wire::heartbeat(self.sequence).to_json());
                self.last_heartbeat_sent = now;
                tracing::debug!(shard = %self.id, seq = ?self.sequence, "heartbeat queued");
            }

            // Ack deadline: 1.5 intervals of silence means a dead link.
            if now.saturating_sub(self.last_heartbeat_ack) >= interval + interval / 2 {
                tracing::warn!(
                    shard = %self.id,
                    last_ack_secs_ago = now - self.last_heartbeat_ack,
                    "heartbeat ack overdue; reconnecting"
                );
                return Flow::Reconnect;
            }
        }

        for guild_id in self.voice.sweep() {
            let err = VoiceError::ReadinessTimeout(guild_id, crate::voice::VOICE_READY_TIMEOUT_SECS);
            tracing::error!(shard = %self.id, error = %err, "voice record torn down");
        }

        Flow::Continue
    }

    fn handle_close(&mut self, code: u16) -> Result<SessionEnd, GatewayError> {
        if wire::close_code_is_fatal(code) {
            tracing::error!(shard = %self.id, code, "gateway refused the session permanently");
            return Err(GatewayError::Fatal { code });
        }
        if wire::close_code_invalidates_session(code) {
            tracing::warn!(shard = %self.id, code, "close invalidated the session; will re-identify");
            self.session_id = None;
            self.sequence = None;
            self.stats.sequence.store(0, Ordering::SeqCst);
        } else {
            tracing::info!(shard = %self.id, code, "gateway closed; will resume");
        }
        Ok(SessionEnd::Retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::NoopCache;
    use crate::voice::NullMediaFactory;
    use lanyard_models::EventKind;
    use std::sync::atomic::AtomicU64 as TestAtomicU64;

    struct FakeClock(TestAtomicU64);

    impl FakeClock {
        fn advance(&self, secs: u64) {
            self.0.fetch_add(secs, Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn shard_with_clock() -> (Shard, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock(TestAtomicU64::new(1_000)));
        let collab = Collaborators {
            handlers: Arc::new(HandlerRegistry::default()),
            decoders: Arc::new(DecoderRegistry::default()),
            cache: Arc::new(NoopCache),
            clock: clock.clone(),
            media: Arc::new(NullMediaFactory),
        };
        let shard = Shard::new(Arc::new(GatewayConfig::new("bot-token")), 0, collab);
        (shard, clock)
    }

    fn hello(interval_ms: u64) -> String {
        format!(r#"{{"op":10,"d":{{"heartbeat_interval":{interval_ms}}}}}"#)
    }

    const READY: &str =
        r#"{"op":0,"t":"READY","s":1,"d":{"session_id":"abc","user":{"id":"1","username":"bot","bot":true}}}"#;

    #[test]
    fn hello_without_session_identifies() {
        let (mut shard, _) = shard_with_clock();
        assert_eq!(shard.handle_text(&hello(41_250)), Flow::Continue);

        assert_eq!(shard.state, SessionState::Identifying);
        let sent = shard.queue.pop_front().unwrap();
        assert!(sent.contains(r#""op":2"#));
        assert!(sent.contains("bot-token"));
        assert!(sent.contains(r#""shard":[0,1]"#));
    }

    #[test]
    fn ready_marks_shard_running_with_session() {
        let (mut shard, _) = shard_with_clock();
        shard.handle_text(&hello(41_250));
        assert_eq!(shard.handle_text(READY), Flow::Continue);

        assert_eq!(shard.state, SessionState::Running);
        assert_eq!(shard.session_id.as_deref(), Some("abc"));
        assert_eq!(shard.sequence, Some(1));
        assert_eq!(shard.bot_user, Some(Snowflake(1)));
        assert!(shard.stats.ready.load(Ordering::SeqCst));
        assert_eq!(shard.stats.reconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ready_callback_fires_with_session_and_shard() {
        let clock = Arc::new(FakeClock(TestAtomicU64::new(1_000)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();

        let mut handlers = HandlerRegistry::default();
        handlers.on(EventKind::Ready, move |ctx, event| {
            let ShardEvent::Ready(ready) = event else { return };
            let shard_index = ctx.shard.as_ref().map(|h| h.id.index);
            seen_in_handler
                .lock()
                .unwrap()
                .push((ready.session_id.clone(), shard_index));
        });

        let collab = Collaborators {
            handlers: Arc::new(handlers),
            decoders: Arc::new(DecoderRegistry::default()),
            cache: Arc::new(NoopCache),
            clock,
            media: Arc::new(NullMediaFactory),
        };
        let mut shard = Shard::new(Arc::new(GatewayConfig::new("bot-token")), 0, collab);

        shard.handle_text(&hello(41_250));
        shard.handle_text(READY);
        assert_eq!(*seen.lock().unwrap(), vec![("abc".to_string(), Some(0))]);
    }

    #[test]
    fn hello_with_existing_session_resumes() {
        let (mut shard, _) = shard_with_clock();
        shard.session_id = Some("abc".into());
        shard.sequence = Some(88);

        shard.handle_text(&hello(41_250));
        assert_eq!(shard.state, SessionState::Resuming);
        let sent = shard.queue.pop_front().unwrap();
        assert!(sent.contains(r#""op":6"#));
        assert!(sent.contains(r#""session_id":"abc""#));
        assert!(sent.contains(r#""seq":88"#));
    }

    #[test]
    fn resumed_increments_resume_counter() {
        let (mut shard, _) = shard_with_clock();
        shard.session_id = Some("abc".into());
        shard.sequence = Some(88);
        shard.handle_text(&hello(41_250));

        shard.handle_text(r#"{"op":0,"t":"RESUMED","s":89,"d":{}}"#);
        assert_eq!(shard.state, SessionState::Running);
        assert_eq!(shard.stats.resumes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sequence_only_advances_forward() {
        let (mut shard, _) = shard_with_clock();
        shard.handle_text(&hello(41_250));
        shard.handle_text(READY);

        shard.handle_text(r#"{"op":0,"t":"MESSAGE_CREATE","s":7,"d":{}}"#);
        assert_eq!(shard.sequence, Some(7));

        // A replayed lower sequence must not move the counter back.
        shard.handle_text(r#"{"op":0,"t":"MESSAGE_CREATE","s":3,"d":{}}"#);
        assert_eq!(shard.sequence, Some(7));
    }

    #[test]
    fn heartbeat_fires_on_interval_and_carries_sequence() {
        let (mut shard, clock) = shard_with_clock();
        shard.handle_text(&hello(10_000));
        shard.handle_text(READY);
        shard.queue.clear();

        // One full interval elapses; first-beat jitter only moves the beat
        // earlier, and the ack deadline (1.5 intervals) is still ahead.
        clock.advance(10);
        assert_eq!(shard.on_tick(), Flow::Continue);
        let beat = shard.queue.pop_front().unwrap();
        assert!(beat.contains(r#""op":1"#));
        assert!(beat.contains(r#""d":1"#));
    }

    #[test]
    fn missed_acks_force_reconnect_preserving_session() {
        let (mut shard, clock) = shard_with_clock();
        shard.handle_text(&hello(40_000));
        shard.handle_text(READY);
        shard.queue.clear();

        // Acks stop arriving: 1.5 intervals later the shard gives up.
        clock.advance(40 + 20);
        assert_eq!(shard.on_tick(), Flow::Reconnect);
        assert_eq!(shard.session_id.as_deref(), Some("abc"));
        assert_eq!(shard.sequence, Some(1));
    }

    #[test]
    fn acks_keep_the_connection_alive() {
        let (mut shard, clock) = shard_with_clock();
        shard.handle_text(&hello(40_000));
        shard.handle_text(READY);

        for _ in 0..5 {
            clock.advance(40);
            shard.handle_text(r#"{"op":11}"#);
            assert_eq!(shard.on_tick(), Flow::Continue);
        }
    }

    #[test]
    fn invalid_session_nonresumable_clears_state() {
        let (mut shard, _) = shard_with_clock();
        shard.handle_text(&hello(41_250));
        shard.handle_text(READY);

        let flow = shard.handle_text(r#"{"op":9,"d":false}"#);
        assert_eq!(flow, Flow::InvalidSession { resumable: false });
        assert!(shard.session_id.is_none());
        assert!(shard.sequence.is_none());
    }

    #[test]
    fn invalid_session_resumable_preserves_state() {
        let (mut shard, _) = shard_with_clock();
        shard.handle_text(&hello(41_250));
        shard.handle_text(READY);

        let flow = shard.handle_text(r#"{"op":9,"d":true}"#);
        assert_eq!(flow, Flow::InvalidSession { resumable: true });
        assert_eq!(shard.session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn server_reconnect_request_preserves_session() {
        let (mut shard, _) = shard_with_clock();
        shard.handle_text(&hello(41_250));
        shard.handle_text(READY);

        assert_eq!(shard.handle_text(r#"{"op":7}"#), Flow::Reconnect);
        assert_eq!(shard.session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn identify_stall_reconnects_after_deadline() {
        let (mut shard, clock) = shard_with_clock();
        shard.handle_text(&hello(120_000));
        assert_eq!(shard.state, SessionState::Identifying);

        clock.advance(READY_DEADLINE_SECS - 1);
        assert_eq!(shard.on_tick(), Flow::Continue);
        clock.advance(1);
        assert_eq!(shard.on_tick(), Flow::Reconnect);
    }

    #[test]
    fn fatal_close_codes_stop_the_shard() {
        let (mut shard, _) = shard_with_clock();
        shard.session_id = Some("abc".into());

        let result = shard.handle_close(wire::CLOSE_AUTHENTICATION_FAILED);
        assert!(matches!(result, Err(GatewayError::Fatal { code: 4004 })));
    }

    #[test]
    fn session_invalidating_close_clears_session_but_retries() {
        let (mut shard, _) = shard_with_clock();
        shard.session_id = Some("abc".into());
        shard.sequence = Some(5);

        let result = shard.handle_close(wire::CLOSE_SHARDING_REQUIRED);
        assert!(matches!(result, Ok(SessionEnd::Retry)));
        assert!(shard.session_id.is_none());
        assert!(shard.sequence.is_none());
    }

    #[test]
    fn transient_close_preserves_session_for_resume() {
        let (mut shard, _) = shard_with_clock();
        shard.session_id = Some("abc".into());
        shard.sequence = Some(5);

        assert!(matches!(shard.handle_close(1001), Ok(SessionEnd::Retry)));
        assert_eq!(shard.session_id.as_deref(), Some("abc"));
        assert_eq!(shard.sequence, Some(5));
    }

    #[test]
    fn guild_events_drive_the_counters() {
        let (mut shard, _) = shard_with_clock();
        shard.handle_text(&hello(41_250));
        shard.handle_text(READY);

        shard.handle_text(
            r#"{"op":0,"t":"GUILD_CREATE","s":2,"d":{"id":"10","name":"ops","member_count":4,"channels":[{"id":"20"},{"id":"21"}]}}"#,
        );
        let handle = shard.handle();
        assert_eq!(handle.guild_count(), 1);
        assert_eq!(handle.member_count(), 4);
        assert_eq!(handle.channel_count(), 2);

        shard.handle_text(r#"{"op":0,"t":"GUILD_MEMBER_ADD","s":3,"d":{"guild_id":"10"}}"#);
        assert_eq!(handle.member_count(), 5);

        shard.handle_text(r#"{"op":0,"t":"CHANNEL_DELETE","s":4,"d":{"id":"21","guild_id":"10"}}"#);
        assert_eq!(handle.channel_count(), 1);

        shard.handle_text(r#"{"op":0,"t":"GUILD_DELETE","s":5,"d":{"id":"10"}}"#);
        assert_eq!(handle.guild_count(), 0);
        assert_eq!(handle.member_count(), 0);
        assert_eq!(handle.channel_count(), 0);
    }

    #[test]
    fn voice_signalling_dispatches_reach_the_manager() {
        let (mut shard, _) = shard_with_clock();
        shard.handle_text(&hello(41_250));
        shard.handle_text(READY);

        shard.voice().connect_voice(Snowflake(100), Snowflake(200)).unwrap();
        shard.handle_text(
            r#"{"op":0,"t":"VOICE_STATE_UPDATE","s":2,"d":{"user_id":"1","channel_id":"200","guild_id":"100","session_id":"vs"}}"#,
        );
        shard.handle_text(
            r#"{"op":0,"t":"VOICE_SERVER_UPDATE","s":3,"d":{"guild_id":"100","token":"vt","endpoint":"voice.lanyard.chat:443"}}"#,
        );

        let info = shard.voice().get_voice(Snowflake(100)).unwrap();
        assert!(info.active);
        assert_eq!(info.endpoint.as_deref(), Some("voice.lanyard.chat"));
        assert_eq!(info.session_id.as_deref(), Some("vs"));
        assert_eq!(info.token.as_deref(), Some("vt"));
    }

    #[test]
    fn malformed_event_payload_is_survivable() {
        let (mut shard, _) = shard_with_clock();
        shard.handle_text(&hello(41_250));
        shard.handle_text(READY);

        // GUILD_CREATE with a nonsense id must log and continue.
        let flow = shard.handle_text(r#"{"op":0,"t":"GUILD_CREATE","s":2,"d":{"id":{}}}"#);
        assert_eq!(flow, Flow::Continue);
        assert_eq!(shard.state, SessionState::Running);
        // The sequence still advanced.
        assert_eq!(shard.sequence, Some(2));
    }

    #[test]
    fn shard_partition_function() {
        let id = ShardId::new(1, 4);
        assert!(id.owns_guild(Snowflake(5)));
        assert!(!id.owns_guild(Snowflake(4)));
    }

    #[test]
    fn uptime_breakdown_formats() {
        let uptime = Uptime::from(Duration::from_secs(90_061));
        assert_eq!(uptime, Uptime { days: 1, hours: 1, minutes: 1, seconds: 1 });
        assert_eq!(uptime.to_string(), "1d 1h 1m 1s");
    }
}
