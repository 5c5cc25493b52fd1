//! Per-protocol polling loop.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::protocols::{ProtocolAdapter, VariableSpec};

/// Drives one protocol adapter: connects (with the adapter's built-in
/// backoff), reads due variables each tick, and honors cancellation at
/// every iteration boundary.
pub struct Poller {
    adapter: Box<dyn ProtocolAdapter>,
    variables: Vec<VariableSpec>,
    default_interval: Duration,
}

impl Poller {
    /// Create a poller over `adapter` for `variables`.
    ///
    /// `default_interval` is the protocol-level `polling_interval_ms`;
    /// individual variables may override it.
    pub fn new(
        adapter: Box<dyn ProtocolAdapter>,
        variables: Vec<VariableSpec>,
        default_interval: Duration,
    ) -> Self {
        Self {
            adapter,
            variables,
            default_interval,
        }
    }

    /// The loop tick: the shortest effective interval across all
    /// variables, so every override is honored.
    fn tick(&self) -> Duration {
        self.variables
            .iter()
            .map(|v| v.interval(self.default_interval))
            .min()
            .unwrap_or(self.default_interval)
            .max(Duration::from_millis(10))
    }

    /// Spawn the polling task. It runs until `shutdown` flips, then
    /// disconnects the adapter.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let tick = self.tick();
        tokio::spawn(async move {
            let Self {
                mut adapter,
                variables,
                default_interval,
            } = self;

            let protocol = adapter.core().name().to_string();
            info!(
                protocol = %protocol,
                variables = variables.len(),
                tick_ms = tick.as_millis() as u64,
                "poller started"
            );

            let mut last_read: Vec<Option<Instant>> = vec![None; variables.len()];

            loop {
                if *shutdown.borrow() {
                    break;
                }

                if !adapter.is_connected() {
                    // connect() self-throttles with exponential backoff;
                    // no extra sleep needed beyond the tick.
                    match adapter.connect().await {
                        Ok(_) => {}
                        Err(e) => {
                            error!(protocol = %protocol, error = %e, "poller stopping");
                            break;
                        }
                    }
                } else {
                    let now = Instant::now();
                    let due: Vec<usize> = variables
                        .iter()
                        .enumerate()
                        .filter(|(i, v)| match last_read[*i] {
                            Some(at) => now.duration_since(at) >= v.interval(default_interval),
                            None => true,
                        })
                        .map(|(i, _)| i)
                        .collect();

                    if !due.is_empty() {
                        let batch: Vec<VariableSpec> =
                            due.iter().map(|&i| variables[i].clone()).collect();
                        adapter.read_batch(&batch).await;
                        for &i in &due {
                            last_read[i] = Some(now);
                        }
                    }
                }

                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(tick) => {}
                }
            }

            adapter.disconnect().await;
            info!(protocol = %protocol, "poller stopped");
        })
    }
}
