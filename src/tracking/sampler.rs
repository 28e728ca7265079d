use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{error, info};
use tokio::sync::Mutex;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::models::Sample;

use super::controller::TrackingController;

/// OS-facing collaborator that observes foreground activity on each tick.
/// The engine never polls the OS itself; the host shell implements this
/// seam with whatever window/idle APIs its platform offers.
pub trait SampleSource: Send + 'static {
    /// Observations for this tick, typically one App and one Status
    /// sample. Returning an empty vec is valid and reduces to a no-op.
    fn sample(&mut self, now: DateTime<Utc>) -> Result<Vec<Sample>>;
}

pub(crate) async fn sampling_loop(
    controller: TrackingController,
    source: Arc<Mutex<Box<dyn SampleSource>>>,
    interval_ms: u64,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                let observed = {
                    let mut guard = source.lock().await;
                    guard.sample(now)
                };

                // One failed tick is logged and must not stop the loop.
                match observed {
                    Ok(samples) => {
                        for sample in samples {
                            if let Err(err) = controller.ingest_sample(sample).await {
                                error!("sample ingest failed: {err}");
                            }
                        }
                    }
                    Err(err) => error!("sample source failed: {err:?}"),
                }
            }
            _ = cancel_token.cancelled() => {
                info!("sampling loop shutting down");
                break;
            }
        }
    }
}
