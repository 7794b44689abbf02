//! Gateway shard runtime for the Lanyard client library.
//!
//! Each [`shard::Shard`] owns one TLS WebSocket to the platform gateway
//! and a disjoint partition of guild traffic; a [`cluster::Cluster`]
//! supervises the fleet. Layering, leaves first: the buffered secure
//! stream, the WebSocket framer, the gateway protocol state machine with
//! its outbound queue and zlib-stream inflater, per-guild voice
//! signalling, and the cluster with its event registries.

pub mod backoff;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod queue;
pub mod shard;
pub mod stream;
pub mod voice;
pub mod ws;
pub mod zlib;

pub use cluster::{Cluster, ClusterBuilder};
pub use config::GatewayConfig;
pub use dispatch::{Cache, Clock, EventContext, EventSink, HandlerRegistry, NoopCache};
pub use error::{ConnectError, GatewayError, InflateError, VoiceError, WsError};
pub use shard::{Shard, ShardHandle, ShardId, Uptime};
pub use voice::{MediaClient, MediaClientFactory, VoiceInfo, VoiceManager, VoiceSession};

pub use lanyard_models as models;
