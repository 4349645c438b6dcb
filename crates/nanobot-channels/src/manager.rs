use std::collections::HashMap;

use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::{channel::Channel, channel::ChannelStatus, error::ChannelError};

/// Minimum delay between reconnect attempts (seconds).
const BACKOFF_BASE_SECS: u64 = 5;
/// Maximum delay between reconnect attempts (seconds).
const BACKOFF_MAX_SECS: u64 = 300;
/// Attempts before a channel is given up on.
const MAX_ATTEMPTS: u32 = 10;
/// Jitter fraction applied to each delay (±10 %).
const JITTER_FRACTION: f64 = 0.10;

/// Holds every registered channel adapter and drives connect/disconnect as a
/// group, with exponential backoff on connect failures.
pub struct ChannelManager {
    channels: HashMap<String, Box<dyn Channel + Send + Sync>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// Register an adapter; same-name registration replaces the old one.
    pub fn register(&mut self, channel: Box<dyn Channel + Send + Sync>) {
        let name = channel.name().to_string();
        info!(channel = %name, "registering channel adapter");
        self.channels.insert(name, channel);
    }

    pub async fn connect_all(&mut self) {
        for (name, channel) in self.channels.iter_mut() {
            info!(channel = %name, "connecting channel");
            if let Err(e) = connect_with_backoff(name, channel.as_mut()).await {
                error!(channel = %name, error = %e, "failed to connect channel after retries");
            }
        }
    }

    pub async fn disconnect_all(&mut self) {
        for (name, channel) in self.channels.iter_mut() {
            info!(channel = %name, "disconnecting channel");
            if let Err(e) = channel.disconnect().await {
                warn!(channel = %name, error = %e, "error while disconnecting channel");
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&(dyn Channel + Send + Sync)> {
        self.channels.get(name).map(|b| b.as_ref())
    }

    /// `(name, status)` for every channel, name-sorted for stable output.
    pub fn statuses(&self) -> Vec<(String, ChannelStatus)> {
        let mut result: Vec<(String, ChannelStatus)> = self
            .channels
            .iter()
            .map(|(name, ch)| (name.clone(), ch.status()))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Connect one channel with exponential backoff: 5s → 10s → … → 300s cap.
async fn connect_with_backoff(
    name: &str,
    channel: &mut dyn Channel,
) -> Result<(), ChannelError> {
    let mut delay_secs = BACKOFF_BASE_SECS;

    for attempt in 1..=MAX_ATTEMPTS {
        match channel.connect().await {
            Ok(()) => {
                info!(channel = %name, attempt, "channel connected");
                return Ok(());
            }
            Err(e) if attempt == MAX_ATTEMPTS => return Err(e),
            Err(e) => {
                let total = delay_secs + jitter_secs(delay_secs);
                warn!(
                    channel = %name,
                    attempt,
                    max = MAX_ATTEMPTS,
                    error = %e,
                    retry_after_secs = total,
                    "channel connect failed, retrying with backoff"
                );
                sleep(Duration::from_secs(total)).await;
                delay_secs = (delay_secs * 2).min(BACKOFF_MAX_SECS);
            }
        }
    }
    unreachable!("backoff loop exited without returning")
}

/// Deterministic pseudo-random jitter from the clock's subsecond nanos,
/// avoiding a rand dependency.
fn jitter_secs(base_secs: u64) -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let max_jitter = ((base_secs as f64) * JITTER_FRACTION) as u64;
    if max_jitter == 0 {
        return 0;
    }
    (nanos as u64) % max_jitter
}
