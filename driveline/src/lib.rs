//! Device-resident telemetry client.
//!
//! Events produced on the device arrive over a framed control socket (or the
//! in-process API), pass through a staging queue and a filter chain, and are
//! persisted in SQLite before an upload engine forwards them to the cloud
//! backend over MQTT with at-least-once delivery. Cloud-originated
//! notifications on subscribed topics are routed back to registered
//! in-process handlers.
//!
//! [`ClientBuilder`] wires the components once at bootstrap; the resulting
//! [`Client`] owns the runtime and every worker.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod ingest;
pub mod lifecycle;
pub mod net;
pub mod notify;
pub mod persistence;
pub mod upload;

mod client;

pub use client::{Client, ClientBuilder};
pub use config::Config;
pub use dispatch::{HandlerMessage, MessageHandler};
pub use event::{AttachError, Event};
pub use ingest::SendOutcome;
pub use net::ConnectionState;
pub use notify::RequestHandler;
