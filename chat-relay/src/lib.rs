//! Stateless chat relay that fans messages out across instances through an
//! AMQP fan-out exchange.
//!
//! A client message is never broadcast locally. The instance that receives
//! it stamps it and publishes it to the exchange; every instance, the
//! sender's included, gets it back on its private queue and writes it to
//! each socket it holds.
//!
//! - [`cli`] parses flags and environment into a [`cli::Config`].
//! - [`envelope`] defines the JSON envelope carried end to end.
//! - [`registry`] tracks the connections held by this instance.
//! - [`broker`] dials the broker with bounded retry, declares the topology,
//!   and publishes.
//! - [`ingress`] runs the per-connection receive loop.
//! - [`egress`] consumes the private queue and broadcasts to the registry.
//! - [`session`] owns one connection from registration to close.
//! - [`http`] exposes the websocket endpoint and status reports.
//! - [`shutdown`] carries the process-wide stop signal.

pub mod broker;
pub mod cli;
pub mod egress;
pub mod envelope;
pub mod http;
pub mod ingress;
pub mod registry;
pub mod session;
pub mod shutdown;
