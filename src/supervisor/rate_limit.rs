//! Hourly call budget, persisted so restarts preserve quota
//!
//! One bucket per session, stored in the session's `call_count` file as
//! `{window_start, calls_used}`. The bucket resets atomically when the
//! window rolls over, before admission is evaluated.

use autoloop_core::Result;
use autoloop_engine::store::write_atomic;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateBucket {
    pub window_start: DateTime<Utc>,
    pub calls_used: u32,
}

impl RateBucket {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            calls_used: 0,
        }
    }
}

pub struct RateLimiter {
    path: PathBuf,
    max_calls: u32,
    window_secs: i64,
    bucket: RateBucket,
}

impl RateLimiter {
    pub const DEFAULT_MAX_CALLS: u32 = 100;
    pub const DEFAULT_WINDOW_SECS: i64 = 3600;

    /// Load the persisted bucket from `call_count`, or start fresh.
    pub async fn load(path: impl Into<PathBuf>, max_calls: u32, window_secs: i64) -> Self {
        let path = path.into();
        let bucket = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|_| RateBucket::fresh(Utc::now())),
            Err(_) => RateBucket::fresh(Utc::now()),
        };
        Self {
            path,
            max_calls,
            window_secs,
            bucket,
        }
    }

    pub fn max_calls(&self) -> u32 {
        self.max_calls
    }

    pub fn calls_remaining(&self) -> u32 {
        self.calls_remaining_at(Utc::now())
    }

    pub fn calls_remaining_at(&self, now: DateTime<Utc>) -> u32 {
        if self.window_elapsed(now) {
            self.max_calls
        } else {
            self.max_calls.saturating_sub(self.bucket.calls_used)
        }
    }

    pub fn bucket(&self) -> &RateBucket {
        &self.bucket
    }

    /// Admit one call if the current window has capacity. The counter is
    /// persisted on every admit so a restart cannot refund spent quota.
    pub async fn admit(&mut self) -> Result<bool> {
        self.admit_at(Utc::now()).await
    }

    pub async fn admit_at(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if self.window_elapsed(now) {
            self.bucket = RateBucket::fresh(now);
        }
        if self.bucket.calls_used >= self.max_calls {
            return Ok(false);
        }
        self.bucket.calls_used += 1;
        self.persist().await?;
        Ok(true)
    }

    fn window_elapsed(&self, now: DateTime<Utc>) -> bool {
        now - self.bucket.window_start >= ChronoDuration::seconds(self.window_secs)
    }

    async fn persist(&self) -> Result<()> {
        write_atomic(&self.path, serde_json::to_vec_pretty(&self.bucket)?.as_slice()).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
