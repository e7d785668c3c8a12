//! Periodic polling of the sensor values.

use crate::{
    protocol::SensorValues,
    safe_client::SafeClient,
    session::Result,
    transport::Transport,
};
use std::time::{Duration, Instant};

/// Default time between the start of two polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// An endless iterator over sensor readings.
///
/// Every call to `next` blocks until `interval` has passed since the start of
/// the previous poll and then reads the sensor values once. A failed poll is
/// yielded as an error and does not end the iteration; stop by dropping the
/// iterator.
#[derive(Debug)]
pub struct PollLoop<T: Transport> {
    client: SafeClient<T>,
    interval: Duration,
    last_poll: Option<Instant>,
}

impl<T: Transport> PollLoop<T> {
    pub fn new(client: SafeClient<T>, interval: Duration) -> Self {
        Self {
            client,
            interval,
            last_poll: None,
        }
    }

    /// Time left until the next poll is due.
    pub fn remaining(&self) -> Duration {
        self.last_poll
            .map(|last| self.interval.saturating_sub(last.elapsed()))
            .unwrap_or_default()
    }
}

impl<T: Transport> Iterator for PollLoop<T> {
    type Item = Result<SensorValues>;

    fn next(&mut self) -> Option<Self::Item> {
        let wait = self.remaining();
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        self.last_poll = Some(Instant::now());
        let result = self.client.read_sensor_values();
        match &result {
            Ok(values) => log::debug!("data: {values}"),
            Err(err) => log::error!("Polling sensor values failed: {err}"),
        }
        Some(result)
    }
}
