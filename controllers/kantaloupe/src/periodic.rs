//! Fixed-period background loops.

use crate::error::ControllerError;
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Runs `tick` every `period` until `shutdown` is cancelled.
///
/// The first run starts immediately. A failed run is logged and the loop
/// carries on at the next tick.
pub async fn run_every<F, Fut>(name: &str, period: Duration, shutdown: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ControllerError>>,
{
    info!("Starting {} loop every {:?}", name, period);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        debug!("Running {} loop", name);
        tokio::select! {
            () = shutdown.cancelled() => break,
            result = tick() => {
                if let Err(e) = result {
                    error!("{} loop failed: {}", name, e);
                }
            }
        }
    }
    info!("Stopped {} loop", name);
}
