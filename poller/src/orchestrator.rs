//! The poll scheduling loop.
//!
//! A single loop drives a bounded worker pool: due servers are taken from
//! the store's poll queue, their next poll time is advanced immediately, and
//! a worker task probes each one. The address map snapshot is refreshed
//! periodically. Store outages are transient; the loop just tries again on
//! its next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::{PollerCtx, job};

pub const WORKERS_MAX: usize = 16;

const TICK: Duration = Duration::from_secs(1);
const ADDRESS_MAP_REFRESH: Duration = Duration::from_secs(300);

pub async fn run(ctx: Arc<PollerCtx>) -> anyhow::Result<()> {
    let mut workers: JoinSet<()> = JoinSet::new();
    let mut next_map_refresh = Instant::now();

    loop {
        while let Some(finished) = workers.try_join_next() {
            if let Err(e) = finished {
                tracing::warn!("Poll worker panicked: {e}");
            }
        }

        if Instant::now() >= next_map_refresh {
            match ctx.db.address_map().await {
                Ok(map) => {
                    tracing::debug!(entries = map.len(), "Refreshed address map");
                    ctx.set_address_map(map);
                    next_map_refresh = Instant::now() + ADDRESS_MAP_REFRESH;
                }
                Err(e) => {
                    tracing::warn!("Address map refresh failed: {e}");
                }
            }
        }

        let free = WORKERS_MAX.saturating_sub(workers.len());
        if free > 0
            && let Err(e) = dispatch_due(&ctx, &mut workers, free).await
        {
            tracing::warn!("Poll dispatch failed: {e}");
        }

        tokio::time::sleep(TICK).await;
    }
}

async fn dispatch_due(
    ctx: &Arc<PollerCtx>,
    workers: &mut JoinSet<()>,
    free: usize,
) -> Result<(), aprs2_store::StoreError> {
    let now = chrono::Utc::now().timestamp();
    let due = ctx.db.poll_queue_due(now, free).await?;

    if !due.is_empty() {
        tracing::info!(servers = ?due, "Scheduled polls");
    }

    for id in due {
        let Some(server) = ctx.db.server(&id).await? else {
            tracing::info!(%id, "Server has been removed, removing from queue");
            ctx.db.poll_queue_remove(&id).await?;
            continue;
        };

        if server.deleted {
            tracing::info!(%id, "Server is deleted, removing from queue");
            ctx.db.poll_queue_remove(&id).await?;
            continue;
        }

        ctx.db
            .poll_queue_set(&id, now + ctx.settings.poll_interval)
            .await?;

        workers.spawn(job::perform_poll(ctx.clone(), server));
    }

    Ok(())
}
