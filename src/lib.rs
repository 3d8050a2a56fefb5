//! Courier - event messaging runtime
//!
//! A lightweight runtime for services that exchange enveloped events over a
//! publish/subscribe broker, with push (HTTP) and pull delivery, idempotent
//! broker provisioning and graceful shutdown.

pub mod auth;
pub mod bus;
pub mod config;
pub mod envelope;
pub mod publisher;
pub mod service;
pub mod subscription;
pub mod utils;

pub use envelope::Envelope;
pub use publisher::Publisher;
pub use service::{Service, ServiceContext};
pub use subscription::{PullSubscription, PushSubscription};
