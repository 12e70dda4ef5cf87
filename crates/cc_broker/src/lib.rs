//! CloakChat routing broker.
//!
//! A single-process TCP server that multiplexes client sessions into a
//! persistent channel graph. It authorizes every control transition, queues
//! traffic for offline recipients, and rate-limits abusive peers — all
//! without the ability to decrypt a single payload: message bodies, file
//! chunks, and rekey material pass through as opaque base64.

pub mod accounts;
pub mod broker;
pub mod config;
pub mod ipfilter;
pub mod join;
pub mod limiter;
pub mod monitor;
pub mod persist;
pub mod presence;
pub mod profiles;
pub mod queue;
pub mod roles;
pub mod routing;
pub mod session;
pub mod state;
pub mod store;

pub use broker::Broker;
pub use config::BrokerConfig;
