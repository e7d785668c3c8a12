//! Setting the console clock.
//!
//! The console has a radio controlled clock but often never receives a
//! signal indoors. [`ClockSync`] pushes the host's local time to it
//! periodically instead.

use crate::{safe_client::SafeClient, transport::Transport};
use chrono::{DateTime, Datelike, Local, Offset, TimeZone, Timelike};
use std::{
    fmt,
    sync::mpsc::{self, RecvTimeoutError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Default interval between two clock synchronisations.
pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(12 * 60 * 60);

/// Payload of a [`crate::protocol::Command::SyncTime`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSync {
    pub year: i16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// Offset of the local time zone to UTC in whole hours.
    pub utc_offset_hours: i8,
}

impl TimeSync {
    pub const ENCODED_LEN: usize = 8;

    pub fn now() -> Self {
        Self::from_datetime(&Local::now())
    }

    /// Takes the wall clock time and UTC offset of `time`.
    pub fn from_datetime<Tz: TimeZone>(time: &DateTime<Tz>) -> Self {
        let offset_secs = time.offset().fix().local_minus_utc();
        Self {
            year: time.year() as i16,
            month: time.month() as u8,
            day: time.day() as u8,
            hour: time.hour() as u8,
            minute: time.minute() as u8,
            second: time.second() as u8,
            utc_offset_hours: (offset_secs / 3600) as i8,
        }
    }

    /// `year:i16be, month, day, hour, minute, second, offset:i8`
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let year = self.year.to_be_bytes();
        [
            year[0],
            year[1],
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
            self.utc_offset_hours as u8,
        ]
    }
}

impl fmt::Display for TimeSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC{:+}",
            self.year,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
            self.utc_offset_hours
        )
    }
}

/// Background thread that sets the console clock every `period`.
///
/// Failures are logged and the next attempt happens on schedule. The
/// thread stops when the handle is stopped or dropped.
#[derive(Debug)]
pub struct ClockSync {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ClockSync {
    pub fn spawn<T>(client: SafeClient<T>, period: Duration) -> std::io::Result<Self>
    where
        T: Transport + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("clock-sync".to_string())
            .spawn(move || loop {
                let started = Instant::now();
                match client.sync_time() {
                    Ok(()) => log::info!("Console clock synchronised"),
                    Err(err) => log::warn!("Console clock synchronisation failed: {err}"),
                }
                let wait = period.saturating_sub(started.elapsed());
                match stopped.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for it to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Clock synchronisation thread panicked");
            }
        }
    }
}

impl Drop for ClockSync {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Platform, SessionSettings};
    use crate::transport::mock::MockTransport;
    use chrono::FixedOffset;

    #[test]
    fn encode_fixed_instant() {
        let offset = FixedOffset::east_opt(2 * 3600).expect("valid offset");
        let time = offset
            .with_ymd_and_hms(2024, 3, 11, 9, 5, 12)
            .single()
            .expect("valid time");
        let sync = TimeSync::from_datetime(&time);
        assert_eq!(sync.utc_offset_hours, 2);
        assert_eq!(
            sync.encode(),
            [0x07, 0xe8, 0x03, 0x0b, 0x09, 0x05, 0x0c, 0x02]
        );
        assert_eq!(sync.to_string(), "2024-03-11 09:05:12 UTC+2");
    }

    #[test]
    fn encode_negative_offset() {
        let offset = FixedOffset::west_opt(5 * 3600).expect("valid offset");
        let time = offset
            .with_ymd_and_hms(2023, 12, 31, 23, 59, 59)
            .single()
            .expect("valid time");
        assert_eq!(
            TimeSync::from_datetime(&time).encode(),
            [0x07, 0xe7, 0x0c, 0x1f, 0x17, 0x3b, 0x3b, 0xfb]
        );
    }

    #[test]
    fn clock_sync_issues_and_stops() {
        let transport = MockTransport::new(Vec::new());
        let settings = SessionSettings {
            platform: Platform::Linux,
            ..Default::default()
        };
        let client = SafeClient::new(transport.clone(), settings);
        let sync = ClockSync::spawn(client, DEFAULT_SYNC_PERIOD).expect("spawns");

        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.lock().writes.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        sync.stop();

        let state = transport.lock();
        assert_eq!(state.writes.len(), 1);
        assert_eq!(state.writes[0][1], 0x30);
        assert_eq!(state.writes[0].len(), 4 + TimeSync::ENCODED_LEN);
    }

    #[test]
    fn clock_sync_survives_missing_device() {
        let transport = MockTransport::new(Vec::new());
        transport.lock().present = false;
        let client = SafeClient::new(transport.clone(), SessionSettings::default());
        let sync = ClockSync::spawn(client, Duration::from_millis(1)).expect("spawns");

        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.lock().opens < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        drop(sync);
        assert!(transport.lock().opens >= 3);
    }
}
