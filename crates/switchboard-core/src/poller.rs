// ── Gen1 poller ──────────────────────────────────────────────────────
//
// One task per first-generation device: pull `/status` on a fixed
// cadence, skip the pull while multicast broadcasts keep the status
// fresh, and publish debounced reachability transitions. A failed pull
// is an offline signal, not an error.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::bus::EventBus;
use crate::coiot::CoiotTracker;
use crate::model::{Event, StatusSource};
use crate::registry::{ConnectionRegistry, OnlineTransition};
use crate::transport::Gen1StatusFetch;

/// Everything one poll task needs, bundled so the spawn site stays
/// flat.
pub(crate) struct PollContext {
    pub name: String,
    pub address: String,
    pub registry: Arc<ConnectionRegistry>,
    pub tracker: Arc<CoiotTracker>,
    pub bus: Arc<EventBus>,
    pub fetcher: Arc<dyn Gen1StatusFetch>,
    pub interval: Duration,
    pub freshness_window: Duration,
}

/// Poll until cancelled. The first pull happens immediately; later
/// pulls keep the configured cadence, and a slow pull delays the next
/// tick rather than causing a catch-up burst.
pub(crate) async fn poll_device(ctx: PollContext, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(ctx.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => poll_once(&ctx).await,
        }
    }

    debug!(device = %ctx.name, "poller stopped");
}

async fn poll_once(ctx: &PollContext) {
    // A recent broadcast makes the pull redundant.
    if let Some(key) = ctx.registry.coiot_key(&ctx.name) {
        if ctx.tracker.fresh_within(&key, ctx.freshness_window) {
            trace!(device = %ctx.name, "push status fresh, skipping pull");
            return;
        }
    }

    match ctx.fetcher.fetch_status(&ctx.address).await {
        Ok(payload) => {
            if let OnlineTransition::Changed { address } = ctx.registry.set_online(&ctx.name, true)
            {
                ctx.bus.publish(&Event::DeviceOnline {
                    name: ctx.name.clone(),
                    address,
                });
            }
            ctx.bus.publish(&Event::FullStatus {
                name: ctx.name.clone(),
                payload,
                source: StatusSource::Local,
            });
        }
        Err(e) => {
            warn!(device = %ctx.name, error = %e, "status pull failed");
            if let OnlineTransition::Changed { .. } = ctx.registry.set_online(&ctx.name, false) {
                ctx.bus.publish(&Event::DeviceOffline {
                    name: ctx.name.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
}
