mod config;
mod error;
mod group;
mod subscriber;

pub use config::BrokerConfig;
pub use error::BrokerError;
pub use group::GroupBroker;
pub use subscriber::{Subscriber, SubscriberId};
