pub mod event;
pub mod gateway;
pub mod intents;
pub mod snowflake;
pub mod voice;

pub use event::{EventKind, ShardEvent};
pub use gateway::GatewayMessage;
pub use intents::Intents;
pub use snowflake::Snowflake;
