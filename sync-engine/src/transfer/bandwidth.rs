//! Bandwidth limiting for transfers.
//!
//! Four process-wide token buckets (WAN up/down, LAN up/down) measured in
//! bytes per second. A limit of 0 means unlimited. Changing a limit swaps the
//! bucket, so every connection sharing it picks up the new rate on its next
//! acquire.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, RwLock};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::config::TransfersConfig;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sending file content.
    Upload,
    /// Receiving file content.
    Download,
}

/// One token bucket.
pub struct BandwidthLimiter {
    bucket: RwLock<Option<(u64, Arc<DirectLimiter>)>>,
}

impl std::fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthLimiter")
            .field("bytes_per_sec", &self.limit())
            .finish()
    }
}

impl BandwidthLimiter {
    /// Create a limiter; 0 means unlimited.
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bucket: RwLock::new(build_bucket(bytes_per_sec)),
        }
    }

    /// Current limit in bytes per second, 0 when unlimited.
    pub fn limit(&self) -> u64 {
        self.current().map(|(rate, _)| rate).unwrap_or(0)
    }

    /// Replace the limit.
    pub fn set_limit(&self, bytes_per_sec: u64) {
        if self.limit() == bytes_per_sec {
            return;
        }
        *self
            .bucket
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = build_bucket(bytes_per_sec);
    }

    fn current(&self) -> Option<(u64, Arc<DirectLimiter>)> {
        self.bucket
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Wait until `bytes` may pass.
    ///
    /// Requests larger than one second's worth are split so they never
    /// exceed the bucket's burst.
    pub async fn acquire(&self, bytes: usize) {
        let Some((rate, limiter)) = self.current() else {
            return;
        };
        let burst = rate.min(u64::from(u32::MAX)) as usize;
        let mut left = bytes;
        while left > 0 {
            let step = left.min(burst);
            left -= step;
            let Some(n) = NonZeroU32::new(step as u32) else {
                continue;
            };
            if let Err(e) = limiter.until_n_ready(n).await {
                tracing::error!("Bandwidth request exceeds bucket capacity: {}", e);
                return;
            }
        }
    }

    /// Take `bytes` without waiting, if available.
    pub fn try_acquire(&self, bytes: u32) -> bool {
        let Some((_, limiter)) = self.current() else {
            return true;
        };
        match NonZeroU32::new(bytes) {
            Some(n) => matches!(limiter.check_n(n), Ok(Ok(()))),
            None => true,
        }
    }
}

fn build_bucket(bytes_per_sec: u64) -> Option<(u64, Arc<DirectLimiter>)> {
    let rate = NonZeroU32::new(bytes_per_sec.min(u64::from(u32::MAX)) as u32)?;
    Some((bytes_per_sec, Arc::new(RateLimiter::direct(Quota::per_second(rate)))))
}

/// Configured (not effective) limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LimitSettings {
    /// WAN upload, bytes/sec.
    pub wan_upload: u64,
    /// WAN download, bytes/sec.
    pub wan_download: u64,
    /// LAN upload, bytes/sec.
    pub lan_upload: u64,
    /// LAN download, bytes/sec.
    pub lan_download: u64,
}

#[derive(Debug)]
struct SilentMode {
    enabled: bool,
    min_percent: u8,
    fallback: u64,
}

/// The four shared limiters plus silent-mode throttling.
#[derive(Debug)]
pub struct BandwidthLimits {
    wan_upload: BandwidthLimiter,
    wan_download: BandwidthLimiter,
    lan_upload: BandwidthLimiter,
    lan_download: BandwidthLimiter,
    configured: Mutex<LimitSettings>,
    silent: Mutex<SilentMode>,
}

impl BandwidthLimits {
    /// Build limiters from the transfer configuration.
    pub fn from_config(config: &TransfersConfig) -> Self {
        let limits = Self {
            wan_upload: BandwidthLimiter::new(0),
            wan_download: BandwidthLimiter::new(0),
            lan_upload: BandwidthLimiter::new(0),
            lan_download: BandwidthLimiter::new(0),
            configured: Mutex::new(LimitSettings {
                wan_upload: config.wan_upload_bytes_per_sec,
                wan_download: config.wan_download_bytes_per_sec,
                lan_upload: config.lan_upload_bytes_per_sec,
                lan_download: config.lan_download_bytes_per_sec,
            }),
            silent: Mutex::new(SilentMode {
                enabled: config.silent_mode,
                min_percent: config.silent_mode_min_percent.clamp(1, 100),
                fallback: config.silent_mode_fallback_bytes_per_sec,
            }),
        };
        limits.apply();
        limits
    }

    /// Limiter for one link class and direction.
    pub fn limiter(&self, direction: Direction, lan: bool) -> &BandwidthLimiter {
        match (direction, lan) {
            (Direction::Upload, false) => &self.wan_upload,
            (Direction::Download, false) => &self.wan_download,
            (Direction::Upload, true) => &self.lan_upload,
            (Direction::Download, true) => &self.lan_download,
        }
    }

    /// Wait for `bytes` on the matching limiter.
    pub async fn acquire(&self, direction: Direction, lan: bool, bytes: usize) {
        self.limiter(direction, lan).acquire(bytes).await;
    }

    /// Reconfigure all four limits.
    pub fn set_limits(&self, settings: LimitSettings) {
        *lock(&self.configured) = settings;
        self.apply();
    }

    /// Configured limits, before silent mode.
    pub fn settings(&self) -> LimitSettings {
        *lock(&self.configured)
    }

    /// Turn silent mode on or off.
    pub fn set_silent_mode(&self, enabled: bool) {
        lock(&self.silent).enabled = enabled;
        self.apply();
        tracing::info!("Silent mode {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Whether silent mode is on.
    pub fn is_silent(&self) -> bool {
        lock(&self.silent).enabled
    }

    fn apply(&self) {
        let configured = self.settings();
        let (wan_up, lan_up) = {
            let silent = lock(&self.silent);
            if silent.enabled {
                (
                    throttle(configured.wan_upload, &silent),
                    throttle(configured.lan_upload, &silent),
                )
            } else {
                (configured.wan_upload, configured.lan_upload)
            }
        };
        self.wan_upload.set_limit(wan_up);
        self.lan_upload.set_limit(lan_up);
        self.wan_download.set_limit(configured.wan_download);
        self.lan_download.set_limit(configured.lan_download);
    }
}

// Unlimited uploads fall back to a fixed rate; limited ones are scaled down.
fn throttle(limit: u64, silent: &SilentMode) -> u64 {
    if limit == 0 {
        return silent.fallback;
    }
    (limit.saturating_mul(u64::from(silent.min_percent)) / 100).max(1)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn config() -> TransfersConfig {
        TransfersConfig {
            wan_upload_bytes_per_sec: 10_000,
            wan_download_bytes_per_sec: 20_000,
            lan_upload_bytes_per_sec: 0,
            lan_download_bytes_per_sec: 0,
            silent_mode_min_percent: 10,
            silent_mode_fallback_bytes_per_sec: 4_096,
            ..TransfersConfig::default()
        }
    }

    #[test]
    fn limits_follow_config() {
        let limits = BandwidthLimits::from_config(&config());
        assert_eq!(limits.limiter(Direction::Upload, false).limit(), 10_000);
        assert_eq!(limits.limiter(Direction::Download, false).limit(), 20_000);
        assert_eq!(limits.limiter(Direction::Upload, true).limit(), 0);
    }

    #[test]
    fn silent_mode_scales_uploads_only() {
        let limits = BandwidthLimits::from_config(&config());
        limits.set_silent_mode(true);

        assert_eq!(limits.limiter(Direction::Upload, false).limit(), 1_000);
        // Unlimited LAN upload gets the fallback rate
        assert_eq!(limits.limiter(Direction::Upload, true).limit(), 4_096);
        assert_eq!(limits.limiter(Direction::Download, false).limit(), 20_000);

        limits.set_silent_mode(false);
        assert_eq!(limits.limiter(Direction::Upload, false).limit(), 10_000);
        assert_eq!(limits.limiter(Direction::Upload, true).limit(), 0);
    }

    #[test]
    fn runtime_reconfiguration() {
        let limits = BandwidthLimits::from_config(&config());
        limits.set_limits(LimitSettings {
            lan_download: 1_000_000,
            ..LimitSettings::default()
        });
        assert_eq!(limits.limiter(Direction::Download, true).limit(), 1_000_000);
        assert_eq!(limits.limiter(Direction::Upload, false).limit(), 0);
        assert_eq!(limits.settings().lan_download, 1_000_000);
    }

    #[test]
    fn try_acquire_drains_bucket() {
        let limiter = BandwidthLimiter::new(1_000);
        assert!(limiter.try_acquire(1_000));
        assert!(!limiter.try_acquire(500));
        assert!(BandwidthLimiter::new(0).try_acquire(u32::MAX));
    }

    #[tokio::test]
    async fn unlimited_acquire_returns_immediately() {
        let limiter = BandwidthLimiter::new(0);
        let started = Instant::now();
        limiter.acquire(100 * 1024 * 1024).await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn acquire_larger_than_burst_waits() {
        let limiter = BandwidthLimiter::new(10_000);
        let started = Instant::now();
        // One full bucket plus a fifth of a second's worth
        limiter.acquire(12_000).await;
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
}
