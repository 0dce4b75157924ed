//! Campaign metrics and timing.
//!
//! Counters are process-wide for one [`crate::engine::DeliveryEngine`] and
//! accumulate across campaigns. Structured logging goes through `tracing`
//! when the `tracing` feature is on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::errors::ErrorCategory;

/// Delivery metrics collector.
#[derive(Debug, Default)]
pub struct CampaignMetrics {
    /// Campaigns started.
    pub campaigns_started: AtomicU64,
    /// Campaigns that processed every recipient.
    pub campaigns_completed: AtomicU64,
    /// Campaigns stopped by a fatal error.
    pub campaigns_aborted: AtomicU64,
    /// Messages accepted by a server.
    pub emails_sent: AtomicU64,
    /// Recipients failed on validation.
    pub validation_failures: AtomicU64,
    /// Recipients failed on rendering.
    pub template_failures: AtomicU64,
    /// Recipients failed on MX resolution.
    pub resolution_failures: AtomicU64,
    /// Recipients failed on SMTP.
    pub transport_failures: AtomicU64,
    /// Sessions opened.
    pub sessions_opened: AtomicU64,
    /// Session open attempts that failed.
    pub sessions_failed: AtomicU64,
    /// DNS MX lookups issued.
    pub mx_lookups: AtomicU64,
}

impl CampaignMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a campaign start.
    pub fn record_campaign_started(&self) {
        self.campaigns_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Records how a campaign ended.
    pub fn record_campaign_finished(&self, completed: bool) {
        if completed {
            self.campaigns_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.campaigns_aborted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records an accepted message.
    pub fn record_sent(&self) {
        self.emails_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed recipient.
    pub fn record_failure(&self, category: ErrorCategory) {
        let counter = match category {
            ErrorCategory::Validation | ErrorCategory::Configuration => &self.validation_failures,
            ErrorCategory::Template => &self.template_failures,
            ErrorCategory::Resolution => &self.resolution_failures,
            ErrorCategory::Transport => &self.transport_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a session open attempt.
    pub fn record_session_open(&self, success: bool) {
        if success {
            self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sessions_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Adds DNS lookups made during a campaign.
    pub fn record_mx_lookups(&self, count: usize) {
        self.mx_lookups.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Returns a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            campaigns_started: self.campaigns_started.load(Ordering::Relaxed),
            campaigns_completed: self.campaigns_completed.load(Ordering::Relaxed),
            campaigns_aborted: self.campaigns_aborted.load(Ordering::Relaxed),
            emails_sent: self.emails_sent.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            template_failures: self.template_failures.load(Ordering::Relaxed),
            resolution_failures: self.resolution_failures.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            mx_lookups: self.mx_lookups.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Campaigns started.
    pub campaigns_started: u64,
    /// Campaigns completed.
    pub campaigns_completed: u64,
    /// Campaigns aborted.
    pub campaigns_aborted: u64,
    /// Messages accepted.
    pub emails_sent: u64,
    /// Validation failures.
    pub validation_failures: u64,
    /// Template failures.
    pub template_failures: u64,
    /// Resolution failures.
    pub resolution_failures: u64,
    /// Transport failures.
    pub transport_failures: u64,
    /// Sessions opened.
    pub sessions_opened: u64,
    /// Failed session opens.
    pub sessions_failed: u64,
    /// DNS lookups.
    pub mx_lookups: u64,
}

impl MetricsSnapshot {
    /// Returns the number of failed recipients across all categories.
    pub fn emails_failed(&self) -> u64 {
        self.validation_failures
            + self.template_failures
            + self.resolution_failures
            + self.transport_failures
    }

    /// Returns the email success rate.
    pub fn success_rate(&self) -> f64 {
        let total = self.emails_sent + self.emails_failed();
        if total == 0 {
            1.0
        } else {
            self.emails_sent as f64 / total as f64
        }
    }
}

/// Timer for measuring operation duration.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    name: String,
}

impl Timer {
    /// Creates and starts a new timer.
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stops the timer and returns the duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            timer = %self.name,
            duration_ms = elapsed.as_millis(),
            "Timer stopped"
        );

        elapsed
    }
}
