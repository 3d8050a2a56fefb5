//! courier-relay: Event relay service
//!
//! Subscribes to one event type and republishes each envelope's data under
//! another event type.
//!
//! ## Architecture
//! ```text
//! [broker topic: RELAY_FROM] --(pull or push)--> [courier-relay]
//!                                                      |
//!                                                      v
//!                                       [broker topic: RELAY_TO]
//! ```
//!
//! ## Configuration
//! - RELAY_FROM: Event type to consume (default: courier.relay.in)
//! - RELAY_TO: Event type to emit (default: courier.relay.out)
//! - RELAY_MODE: `pull` or `push` (default: pull)
//! - PORT, PUBSUB_PROJECT_ID, HOST, SERVER_TIMEOUT_SECS, SHUTDOWN_TIMEOUT_SECS
//! - COURIER_LOG: tracing filter (default: info)
//!
//! Built with `--features pubsub` the relay talks to Google Pub/Sub;
//! otherwise it runs against the in-memory broker.

use std::sync::Arc;

use tracing::{info, warn};

use courier::bus::Broker;
use courier::utils::bootstrap::init_tracing;
use courier::{Envelope, PullSubscription, PushSubscription, Service, ServiceContext};

const DEFAULT_FROM: &str = "courier.relay.in";
const DEFAULT_TO: &str = "courier.relay.out";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let from = std::env::var("RELAY_FROM").unwrap_or_else(|_| DEFAULT_FROM.to_string());
    let to = std::env::var("RELAY_TO").unwrap_or_else(|_| DEFAULT_TO.to_string());
    let push = std::env::var("RELAY_MODE").is_ok_and(|m| m.eq_ignore_ascii_case("push"));

    let relay_to = to.clone();
    let relay = move |ctx: Arc<ServiceContext>, envelope: Envelope| {
        let to = relay_to.clone();
        async move {
            match ctx.publish(&to, envelope.data()).await {
                Ok(sent) => {
                    info!(from = %envelope.id(), to = %sent.id(), "Relayed event");
                    true
                }
                Err(e) => {
                    warn!(envelope_id = %envelope.id(), error = %e, "Relay failed");
                    false
                }
            }
        }
    };

    let service = Service::new("courier-relay", env!("CARGO_PKG_VERSION"), broker()).with_output(to);
    let service = if push {
        service.with_subscription(PushSubscription::new(&from, relay))
    } else {
        service.with_subscription(PullSubscription::new(&from, relay))
    };

    info!(from = %from, push, "courier-relay starting");
    service.run().await?;
    Ok(())
}

#[cfg(feature = "pubsub")]
fn broker() -> Arc<dyn Broker> {
    Arc::new(courier::bus::PubSubBroker::new())
}

#[cfg(not(feature = "pubsub"))]
fn broker() -> Arc<dyn Broker> {
    Arc::new(courier::bus::MemoryBroker::new())
}
