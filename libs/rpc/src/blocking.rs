//! Blocking queries over a store's index watch.
//!
//! A read carrying `min_query_index > 0` is held until the store publishes
//! an index past it, the wait times out, or the caller cancels. The body is
//! always rebuilt from a single snapshot, so a caller never sees a result
//! assembled across two indexes.

use std::future::pending;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, instrument};

use crate::envelope::{QueryMeta, QueryOptions, JITTER_FRACTION, MAX_QUERY_TIME};
use crate::error::RpcError;

/// Configuration for blocking queries.
#[derive(Debug, Clone)]
pub struct BlockingQueryConfig {
    /// Cap on any single wait.
    pub max_query_time: Duration,
    /// Waits are stretched by up to `1/jitter_fraction`; zero disables it.
    pub jitter_fraction: u32,
}

impl Default for BlockingQueryConfig {
    fn default() -> Self {
        Self {
            max_query_time: MAX_QUERY_TIME,
            jitter_fraction: JITTER_FRACTION,
        }
    }
}

impl BlockingQueryConfig {
    fn wait_for(&self, opts: &QueryOptions) -> Duration {
        let base = opts.time_to_block().min(self.max_query_time);
        if self.jitter_fraction == 0 || base.is_zero() {
            return base;
        }
        let max_jitter = base / self.jitter_fraction;
        let jitter_nanos = rand::rng().random_range(0..=max_jitter.as_nanos() as u64);
        base + Duration::from_nanos(jitter_nanos)
    }
}

async fn cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone: nobody can cancel any more.
            pending::<()>().await;
        }
    }
}

/// Runs `run` against the store, re-running it each time `index` moves,
/// until a result built past `opts.min_query_index` differs from the one the
/// caller already holds.
///
/// `run` returns the body together with the index it was built from. A body
/// equal to the first one is treated as unchanged, so writes that do not
/// touch the caller's page keep it waiting. On timeout the latest body is
/// returned; on cancellation the body is the default value and the index is
/// the caller's own cursor.
#[instrument(skip_all, fields(min_query_index = opts.min_query_index))]
pub async fn blocking_query<T, F>(
    config: &BlockingQueryConfig,
    mut index: watch::Receiver<u64>,
    opts: &QueryOptions,
    cancel: watch::Receiver<bool>,
    mut run: F,
) -> Result<(T, QueryMeta), RpcError>
where
    T: Default + PartialEq,
    F: FnMut() -> Result<(T, u64), RpcError>,
{
    let deadline = Instant::now() + config.wait_for(opts);
    let cancelled = cancelled(cancel);
    tokio::pin!(cancelled);

    let _ = index.borrow_and_update();
    let (first, built_at) = run()?;
    // Never report index zero: a client blocking on it would spin.
    let built_at = built_at.max(1);
    if opts.min_query_index == 0 || built_at > opts.min_query_index {
        return Ok((first, meta(built_at)));
    }

    let mut latest = None;
    let mut latest_index = built_at;
    loop {
        tokio::select! {
            changed = index.changed() => {
                if changed.is_err() {
                    debug!("Index watch closed");
                    break;
                }
            }
            _ = sleep_until(deadline) => {
                debug!(index = latest_index, "Blocking query timed out");
                break;
            }
            _ = &mut cancelled => {
                debug!("Blocking query cancelled");
                return Ok((T::default(), meta(opts.min_query_index)));
            }
        }

        let _ = index.borrow_and_update();
        let (body, built_at) = run()?;
        latest_index = built_at.max(1);
        if latest_index > opts.min_query_index && body != first {
            return Ok((body, meta(latest_index)));
        }
        latest = Some(body);
    }
    Ok((latest.unwrap_or(first), meta(latest_index)))
}

fn meta(index: u64) -> QueryMeta {
    QueryMeta {
        index,
        last_contact: Duration::ZERO,
        known_leader: true,
        next_token: String::new(),
    }
}
