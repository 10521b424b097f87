//! Kafka bridge
//!
//! Runs a Kafka producer and consumers inside an isolated worker thread and
//! exchanges encoded envelopes with the host's event-routing runtime.
//! Inbound broker messages are routed to a named handler or a workflow;
//! outbound envelopes addressed to the adapter are published and confirmed.
//! An in-process emulator stands in for the broker when `emulate.kafka` is
//! set.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod envelope;
pub mod handlers;
pub mod routing;
pub mod utils;
pub mod worker;
