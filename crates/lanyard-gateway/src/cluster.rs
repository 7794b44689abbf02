//! Shard supervisor (L5).
//!
//! A cluster owns every shard of one bot process. Handlers, decoders and
//! collaborators are registered on the builder and frozen before any
//! shard connects; from then on the registries are read-only.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use lanyard_models::{EventKind, ShardEvent, Snowflake};

use crate::config::GatewayConfig;
use crate::dispatch::{
    Cache, Clock, Decoder, DecoderRegistry, EventContext, HandlerRegistry, MonotonicClock, NoopCache,
};
use crate::error::GatewayError;
use crate::shard::{Collaborators, Shard, ShardHandle};
use crate::voice::{MediaClientFactory, NullMediaFactory};

/// Seconds between consecutive shard identifies. The platform allows one
/// identify per bucket per five seconds.
const IDENTIFY_STAGGER_SECS: u64 = 5;

pub struct ClusterBuilder {
    config: GatewayConfig,
    handlers: HandlerRegistry,
    decoders: DecoderRegistry,
    cache: Arc<dyn Cache>,
    clock: Arc<dyn Clock>,
    media: Arc<dyn MediaClientFactory>,
}

impl ClusterBuilder {
    pub fn new(mut config: GatewayConfig) -> Self {
        config.apply_env_overrides();
        Self {
            config,
            handlers: HandlerRegistry::default(),
            decoders: DecoderRegistry::default(),
            cache: Arc::new(NoopCache),
            clock: Arc::new(MonotonicClock::default()),
            media: Arc::new(NullMediaFactory),
        }
    }

    /// Register the handler for one event kind; the last registration for
    /// a kind wins.
    pub fn on<F>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: Fn(&EventContext, &ShardEvent) + Send + Sync + 'static,
    {
        self.handlers.on(kind, handler);
        self
    }

    /// Replace or add the decoder for one event name.
    pub fn decoder(mut self, name: &'static str, decoder: Decoder) -> Self {
        self.decoders.register(name, decoder);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn media_factory(mut self, media: Arc<dyn MediaClientFactory>) -> Self {
        self.media = media;
        self
    }

    pub fn build(self) -> Result<Cluster, GatewayError> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let collab = Collaborators {
            handlers: Arc::new(self.handlers),
            decoders: Arc::new(self.decoders),
            cache: self.cache,
            clock: self.clock,
            media: self.media,
        };

        let shards: Vec<Shard> = (0..config.shard_count)
            .map(|index| Shard::new(Arc::clone(&config), index, collab.clone()))
            .collect();
        let handles = shards.iter().map(Shard::handle).collect();

        Ok(Cluster { shards, handles })
    }
}

pub struct Cluster {
    shards: Vec<Shard>,
    handles: Vec<ShardHandle>,
}

impl Cluster {
    pub fn shard_count(&self) -> u32 {
        self.handles.len() as u32
    }

    pub fn handle(&self, index: u32) -> Option<&ShardHandle> {
        self.handles.get(index as usize)
    }

    pub fn handles(&self) -> &[ShardHandle] {
        &self.handles
    }

    /// The shard responsible for a guild under the partition function.
    pub fn shard_for_guild(&self, guild_id: Snowflake) -> Option<&ShardHandle> {
        self.handles.iter().find(|h| h.id.owns_guild(guild_id))
    }

    /// Direct access to a shard before the cluster runs, e.g. to join
    /// voice channels from startup code.
    pub fn shard(&self, index: u32) -> Option<&Shard> {
        self.shards.get(index as usize)
    }

    /// Ask every shard to close its connection and stop.
    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.request_stop();
        }
    }

    /// Run every shard to completion. Shards reconnect on their own;
    /// only the first fatal error (bad token, disallowed intents) is
    /// surfaced, after stopping the rest of the fleet.
    pub async fn run(mut self) -> Result<(), GatewayError> {
        let mut tasks = JoinSet::new();
        for (index, mut shard) in self.shards.drain(..).enumerate() {
            let delay = Duration::from_secs(IDENTIFY_STAGGER_SECS * index as u64);
            tasks.spawn(async move {
                if !delay.is_zero() {
                    // Spread identifies across the allowed rate.
                    tokio::time::sleep(delay).await;
                }
                shard.run().await
            });
        }

        let mut first_fatal = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_fatal.is_none() {
                        tracing::error!(error = %err, "shard failed fatally; stopping cluster");
                        self.shutdown();
                        first_fatal = Some(err);
                    }
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "shard task aborted");
                }
            }
        }

        match first_fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
