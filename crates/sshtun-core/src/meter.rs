//! Throughput meter
//!
//! Forwarders report every copied chunk; once a second the live counter is
//! pushed into two sample rings. The per-10-second average is refreshed every
//! 10 ticks and the per-minute average every 60 ticks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SHORT_WINDOW: usize = 10;
const LONG_WINDOW: usize = 60;

#[derive(Debug, Default)]
struct MeterState {
    live_bytes: u64,
    short_samples: VecDeque<u64>,
    long_samples: VecDeque<u64>,
    ticks: u64,
    bytes_per_10_seconds: u64,
    bytes_per_minute: u64,
}

#[derive(Debug, Default)]
pub struct Meter {
    state: Mutex<MeterState>,
}

impl Meter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MeterState> {
        // A poisoned meter only holds counters, keep counting.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, bytes: u64) {
        self.lock().live_bytes += bytes;
    }

    /// Close the current one-second sample
    pub fn tick(&self) {
        let mut state = self.lock();
        let sample = std::mem::take(&mut state.live_bytes);

        push_sample(&mut state.short_samples, sample, SHORT_WINDOW);
        push_sample(&mut state.long_samples, sample, LONG_WINDOW);
        state.ticks += 1;

        if state.ticks % SHORT_WINDOW as u64 == 0 {
            state.bytes_per_10_seconds =
                state.short_samples.iter().sum::<u64>() / SHORT_WINDOW as u64;
        }
        if state.ticks % LONG_WINDOW as u64 == 0 {
            state.bytes_per_minute = state.long_samples.iter().sum::<u64>() / LONG_WINDOW as u64;
        }
    }

    /// Average bytes per second over the last 10 seconds
    pub fn bytes_per_10_seconds(&self) -> u64 {
        self.lock().bytes_per_10_seconds
    }

    /// Average bytes per second over the last minute
    pub fn bytes_per_minute(&self) -> u64 {
        self.lock().bytes_per_minute
    }

    pub fn human_readable_per_10_seconds(&self) -> String {
        human_readable(self.bytes_per_10_seconds())
    }

    pub fn human_readable_per_minute(&self) -> String {
        human_readable(self.bytes_per_minute())
    }

    /// Drive [`Meter::tick`] once a second until cancelled
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            // The first tick of a tokio interval completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Meter sampler stopped");
                        return;
                    }
                    _ = interval.tick() => self.tick(),
                }
            }
        })
    }
}

fn push_sample(ring: &mut VecDeque<u64>, sample: u64, capacity: usize) {
    ring.push_front(sample);
    ring.truncate(capacity);
}

/// Format a byte count with binary units
pub fn human_readable(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} bytes", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    for unit in &UNITS[..UNITS.len() - 1] {
        if value < 1024.0 {
            return format!("{:.2} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.2} {}", value, UNITS[UNITS.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_readable() {
        assert_eq!(human_readable(0), "0 bytes");
        assert_eq!(human_readable(1023), "1023 bytes");
        assert_eq!(human_readable(1024), "1.00 KiB");
        assert_eq!(human_readable(1536), "1.50 KiB");
        assert_eq!(human_readable(5 * 1024 * 1024), "5.00 MiB");
        assert_eq!(human_readable(3 * 1024 * 1024 * 1024), "3.00 GiB");
        assert_eq!(human_readable(2 * 1024u64.pow(4)), "2.00 TiB");
        assert_eq!(human_readable(4096 * 1024u64.pow(4)), "4096.00 TiB");
    }

    #[test]
    fn test_short_average_refreshes_every_ten_ticks() {
        let meter = Meter::new();

        for _ in 0..9 {
            meter.record(100);
            meter.tick();
        }
        assert_eq!(meter.bytes_per_10_seconds(), 0);

        meter.record(100);
        meter.tick();
        assert_eq!(meter.bytes_per_10_seconds(), 100);
        assert_eq!(meter.bytes_per_minute(), 0);
    }

    #[test]
    fn test_short_window_drops_old_samples() {
        let meter = Meter::new();

        meter.record(10_000);
        meter.tick();
        for _ in 0..19 {
            meter.tick();
        }
        // The 10 KB burst fell out of the 10-sample ring before tick 20.
        assert_eq!(meter.bytes_per_10_seconds(), 0);
    }

    #[test]
    fn test_minute_average() {
        let meter = Meter::new();

        for _ in 0..60 {
            meter.record(600);
            meter.tick();
        }
        assert_eq!(meter.bytes_per_minute(), 600);
        assert_eq!(meter.human_readable_per_minute(), "600 bytes");
    }

    #[test]
    fn test_tick_resets_live_counter() {
        let meter = Meter::new();
        meter.record(50);
        meter.record(50);
        meter.tick();
        for _ in 0..9 {
            meter.tick();
        }
        assert_eq!(meter.bytes_per_10_seconds(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sampler_ticks() {
        let meter = Arc::new(Meter::new());
        let cancel = CancellationToken::new();
        let handle = meter.clone().spawn(cancel.clone());

        for _ in 0..10 {
            meter.record(2048);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(meter.bytes_per_10_seconds(), 2048);
        assert_eq!(meter.human_readable_per_10_seconds(), "2.00 KiB");

        cancel.cancel();
        handle.await.unwrap();
    }
}
