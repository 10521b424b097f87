//! Route handlers served by this crate.
//!
//! - `BrokerAdapter`: the adapter front (`kafka.adapter`), an interceptor
//! - `KafkaNotification`: request/reply publisher (`kafka.notification`)
//! - `EventLogger`: logs and acknowledges inbound broker events

pub mod adapter;
pub mod listener;
pub mod notification;

pub use adapter::BrokerAdapter;
pub use listener::EventLogger;
pub use notification::KafkaNotification;
