//! End-to-end flows exercised through the public API: cluster assembly,
//! voice signalling to media-client handoff, and dispatch conventions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use lanyard_gateway::dispatch::HandlerRegistry;
use lanyard_gateway::models::voice::{VoiceReady, VoiceServerUpdate, VoiceState};
use lanyard_gateway::models::{EventKind, ShardEvent, Snowflake};
use lanyard_gateway::stream::tls_client_config;
use lanyard_gateway::voice::{MediaClient, MediaClientFactory, VoiceSession};
use lanyard_gateway::{ClusterBuilder, ConnectError, EventSink, GatewayConfig, VoiceError};

#[derive(Default)]
struct RecordingFactory {
    sessions: Mutex<Vec<VoiceSession>>,
    stopped: Arc<AtomicBool>,
}

impl MediaClientFactory for RecordingFactory {
    fn create(&self, session: VoiceSession) -> Box<dyn MediaClient> {
        self.sessions.lock().unwrap().push(session);

        struct Recorder(Arc<AtomicBool>);
        impl MediaClient for Recorder {
            fn start(&mut self) -> Result<(), VoiceError> {
                Ok(())
            }
            fn stop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }
        Box::new(Recorder(self.stopped.clone()))
    }
}

fn bot_voice_state(guild: u64, channel: u64, session: &str) -> VoiceState {
    VoiceState {
        user_id: Snowflake(1),
        channel_id: Some(Snowflake(channel)),
        guild_id: Some(Snowflake(guild)),
        session_id: session.to_string(),
        deaf: false,
        mute: false,
        self_deaf: false,
        self_mute: false,
        self_stream: false,
        self_video: false,
        suppress: false,
    }
}

#[test]
fn voice_handshake_hands_off_to_the_media_client() {
    let factory = Arc::new(RecordingFactory::default());
    let cluster = ClusterBuilder::new(GatewayConfig::new("tok"))
        .media_factory(factory.clone())
        .build()
        .unwrap();

    let voice = cluster.shard(0).unwrap().voice();
    voice.connect_voice(Snowflake(100), Snowflake(200)).unwrap();

    // The join request goes out at the front of the queue.
    assert_eq!(cluster.handle(0).unwrap().queue_size(), 1);

    // Signalling completes: session id from the bot's voice state, then
    // endpoint and token from the server update.
    voice.on_voice_state_update(Snowflake(1), &bot_voice_state(100, 200, "s"));
    voice.on_voice_server_update(&VoiceServerUpdate {
        guild_id: Snowflake(100),
        token: "t".into(),
        endpoint: Some("x.y:443".into()),
    });

    let sessions = factory.sessions.lock().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].endpoint, "x.y");
    assert_eq!(sessions[0].session_id, "s");
    assert_eq!(sessions[0].token, "t");
    assert_eq!(sessions[0].guild_id, Snowflake(100));
    drop(sessions);

    voice.disconnect_voice(Snowflake(100)).unwrap();
    assert!(factory.stopped.load(Ordering::SeqCst));
}

#[test]
fn one_voice_connection_per_guild() {
    let cluster = ClusterBuilder::new(GatewayConfig::new("tok")).build().unwrap();
    let voice = cluster.shard(0).unwrap().voice();

    voice.connect_voice(Snowflake(100), Snowflake(200)).unwrap();
    assert!(matches!(
        voice.connect_voice(Snowflake(100), Snowflake(999)),
        Err(VoiceError::AlreadyConnected(_))
    ));

    // A different guild is fine.
    voice.connect_voice(Snowflake(101), Snowflake(300)).unwrap();
    assert_eq!(voice.connection_count(), 2);
}

#[test]
fn shard_handle_exposes_the_voice_operations() {
    let cluster = ClusterBuilder::new(GatewayConfig::new("tok")).build().unwrap();
    let handle = cluster.handle(0).unwrap().clone();

    handle.connect_voice(Snowflake(100), Snowflake(200)).unwrap();
    let info = handle.get_voice(Snowflake(100)).unwrap();
    assert_eq!(info.channel_id, Snowflake(200));
    assert!(!info.active);

    handle.disconnect_voice(Snowflake(100)).unwrap();
    assert!(handle.get_voice(Snowflake(100)).is_none());
}

#[test]
fn voice_originated_events_carry_no_shard_handle() {
    let shard_seen = Arc::new(Mutex::new(Vec::new()));
    let shard_seen_in_handler = shard_seen.clone();

    let mut handlers = HandlerRegistry::default();
    handlers.on(EventKind::VoiceReady, move |ctx, event| {
        let ShardEvent::VoiceReady(ready) = event else { return };
        shard_seen_in_handler
            .lock()
            .unwrap()
            .push((ctx.shard.is_none(), ready.guild_id));
    });

    let sink = EventSink::new(Arc::new(handlers));
    sink.emit(ShardEvent::VoiceReady(VoiceReady {
        guild_id: Snowflake(100),
        channel_id: Snowflake(200),
    }));

    assert_eq!(*shard_seen.lock().unwrap(), vec![(true, Snowflake(100))]);
}

#[test]
fn urgent_messages_count_toward_queue_size() {
    let cluster = ClusterBuilder::new(GatewayConfig::new("tok")).build().unwrap();
    let handle = cluster.handle(0).unwrap();

    handle.queue_message(r#"{"op":8,"d":{}}"#.into(), false);
    handle.queue_message(r#"{"op":1,"d":null}"#.into(), true);
    assert_eq!(handle.queue_size(), 2);
    assert!(!handle.is_connected());
}

#[test]
fn guilds_partition_across_the_cluster() {
    let mut config = GatewayConfig::new("tok");
    config.shard_count = 3;
    let cluster = ClusterBuilder::new(config).build().unwrap();

    for guild in [0u64, 1, 2, 3, 100, 101] {
        let handle = cluster.shard_for_guild(Snowflake(guild)).unwrap();
        assert_eq!(handle.id.index as u64, guild % 3);
    }
}

#[test]
fn missing_ca_bundle_is_a_connect_error() {
    let missing = std::path::Path::new("/nonexistent/roots.pem");
    assert!(matches!(
        tls_client_config(Some(missing)),
        Err(ConnectError::CaBundle { .. })
    ));
}

#[test]
fn empty_ca_bundle_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.pem");
    std::fs::write(&path, "").unwrap();
    assert!(matches!(
        tls_client_config(Some(path.as_path())),
        Err(ConnectError::CaBundle { reason, .. }) if reason.contains("no certificates")
    ));
}

#[test]
fn default_trust_anchors_build_without_a_bundle() {
    assert!(tls_client_config(None).is_ok());
}
