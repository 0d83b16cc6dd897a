//! NATS subscription readers feeding the ingest decoder.

use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::checkpoint::StagedSample;
use crate::config::NatsSubscription;
use crate::decoder::LineProtocolDecoder;
use crate::store::MemoryStore;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One long-running reader per configured subscription. Reconnects on
/// failure until shutdown.
pub async fn run_subscription(
    store: Arc<MemoryStore>,
    subscription: NatsSubscription,
    staging: Option<SyncSender<StagedSample>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            connected = async_nats::connect(subscription.address.as_str()) => {
                match connected {
                    Ok(client) => {
                        consume(
                            &store,
                            client,
                            &subscription,
                            staging.clone(),
                            &mut shutdown,
                        )
                        .await;
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    Err(err) => {
                        error!(%err, address = %subscription.address, "NATS connect failed");
                    }
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    debug!(subject = %subscription.subscribe_to, "subscription reader stopped");
}

async fn consume(
    store: &Arc<MemoryStore>,
    client: async_nats::Client,
    subscription: &NatsSubscription,
    staging: Option<SyncSender<StagedSample>>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut subscriber = match client.subscribe(subscription.subscribe_to.clone()).await {
        Ok(sub) => sub,
        Err(err) => {
            error!(%err, subject = %subscription.subscribe_to, "NATS subscribe failed");
            return;
        }
    };
    info!(subject = %subscription.subscribe_to, "subscribed");

    let mut decoder =
        LineProtocolDecoder::new(Arc::clone(store), subscription.cluster_tag.clone());
    if let Some(staging) = staging {
        decoder = decoder.with_staging(staging);
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            message = subscriber.next() => {
                let Some(message) = message else {
                    warn!(subject = %subscription.subscribe_to, "subscription closed");
                    break;
                };
                match std::str::from_utf8(&message.payload) {
                    Ok(body) => {
                        let summary = decoder.decode(body);
                        if summary.dropped > 0 {
                            debug!(
                                accepted = summary.accepted,
                                dropped = summary.dropped,
                                "batch partially dropped"
                            );
                        }
                    }
                    Err(_) => warn!("dropping non-UTF-8 message"),
                }
            }
        }
    }
}
