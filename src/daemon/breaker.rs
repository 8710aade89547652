//! Failure monitor: the circuit breaker deciding when accumulating plugin
//! errors must terminate the daemon.
//!
//! Three independent triggers cover three failure shapes:
//! identical signatures (a deterministic recurring defect), total errors
//! (generalized instability), and a burst inside a short window (a crash
//! loop). Isolated one-off errors are logged and retried.
//!
//! The burst window is an explicit timestamp deque: every observation
//! evicts entries older than the window from the front, so the window
//! slides instead of hard-resetting and a steady sub-burst trickle is
//! still eventually caught by the other two triggers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::core::config::Snapshot;
use crate::core::errors::{CrawlerError, Result};
use crate::logger::Logger;
use crate::mail::Mailer;

/// Shutdown thresholds, cached at monitor construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerLimits {
    /// Burst window length (`crawler.xlim_time`).
    pub time_window: Duration,
    /// Errors inside one window that count as a burst (`crawler.xlim_count`).
    pub count_in_window: usize,
    /// Identical-signature repetitions (`crawler.xlim_ident`).
    pub identical: usize,
    /// Lifetime error ceiling (`crawler.xlim_total`).
    pub total: usize,
}

impl Default for BreakerLimits {
    fn default() -> Self {
        Self {
            time_window: Duration::from_secs_f64(7.0),
            count_in_window: 3,
            identical: 5,
            total: 10,
        }
    }
}

impl BreakerLimits {
    /// Read limits from the `crawler` section, defaulting per field.
    pub fn from_config(config: &Snapshot) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            time_window: config.get_time("crawler", "xlim_time", defaults.time_window)?,
            count_in_window: config.get_usize("crawler", "xlim_count", defaults.count_in_window)?,
            identical: config.get_usize("crawler", "xlim_ident", defaults.identical)?,
            total: config.get_usize("crawler", "xlim_total", defaults.total)?,
        })
    }
}

/// Why the breaker decided to shut the daemon down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TripReason {
    /// One signature repeated to its limit.
    IdenticalSignature { count: usize },
    /// Lifetime error total reached.
    TotalErrors { total: usize },
    /// Too many errors inside the burst window.
    Burst { count: usize, window: Duration },
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IdenticalSignature { count } => {
                write!(f, "identical failure signature seen {count} times")
            }
            Self::TotalErrors { total } => write!(f, "{total} total plugin failures"),
            Self::Burst { count, window } => {
                write!(f, "{count} failures within {}s", window.as_secs_f64())
            }
        }
    }
}

/// Accumulates plugin failures and decides shutdown.
pub struct FailureMonitor {
    limits: BreakerLimits,
    window: VecDeque<SystemTime>,
    seen_signatures: HashMap<String, usize>,
    total_errors: usize,
    logger: Logger,
    mailer: Arc<dyn Mailer>,
    mailto: Option<String>,
    context: String,
}

impl FailureMonitor {
    /// Monitor with explicit limits (tests, embedders).
    #[must_use]
    pub fn new(
        limits: BreakerLimits,
        logger: Logger,
        mailer: Arc<dyn Mailer>,
        mailto: Option<String>,
        context: &str,
    ) -> Self {
        Self {
            limits,
            window: VecDeque::new(),
            seen_signatures: HashMap::new(),
            total_errors: 0,
            logger,
            mailer,
            mailto,
            context: context.to_string(),
        }
    }

    /// Monitor with limits and mail recipient from the config snapshot.
    pub fn from_config(
        config: &Snapshot,
        logger: Logger,
        mailer: Arc<dyn Mailer>,
        context: &str,
    ) -> Result<Self> {
        let limits = BreakerLimits::from_config(config)?;
        let mailto = config.get_opt("crawler", "mailto").map(str::to_string);
        Ok(Self::new(limits, logger, mailer, mailto, context))
    }

    /// Lifetime error count.
    #[must_use]
    pub fn total_errors(&self) -> usize {
        self.total_errors
    }

    /// Oldest timestamp still inside the burst window, if any.
    #[must_use]
    pub fn window_start(&self) -> Option<SystemTime> {
        self.window.front().copied()
    }

    /// Errors currently inside the burst window.
    #[must_use]
    pub fn errors_in_window(&self) -> usize {
        self.window.len()
    }

    /// Account one failure and decide. Pure decision path, no logging
    /// or mail, used directly by tests.
    pub fn record_at(&mut self, signature: &str, now: SystemTime) -> Option<TripReason> {
        let seen = self
            .seen_signatures
            .entry(signature.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        let seen = *seen;
        self.total_errors += 1;
        self.window.push_back(now);

        // Evict entries that have aged out of the window.
        while let Some(oldest) = self.window.front() {
            let expired = now
                .duration_since(*oldest)
                .map_or(true, |age| age >= self.limits.time_window);
            if expired && self.window.len() > 1 {
                self.window.pop_front();
            } else {
                break;
            }
        }

        if seen >= self.limits.identical {
            return Some(TripReason::IdenticalSignature { count: seen });
        }
        if self.total_errors >= self.limits.total {
            return Some(TripReason::TotalErrors {
                total: self.total_errors,
            });
        }
        if self.window.len() >= self.limits.count_in_window {
            return Some(TripReason::Burst {
                count: self.window.len(),
                window: self.limits.time_window,
            });
        }
        None
    }

    /// Account one caught plugin error; on a shutdown decision, log the
    /// full signature, alert the operator, and return `true` so the loop
    /// exits on its next iteration.
    pub fn observe(&mut self, err: &CrawlerError) -> bool {
        let signature = err.signature();
        let Some(reason) = self.record_at(&signature, SystemTime::now()) else {
            return false;
        };

        for line in signature.lines() {
            self.logger.error(line);
        }
        self.logger
            .error(&format!("circuit breaker tripped: {reason}; shutting down"));

        if let Some(to) = &self.mailto {
            let subject = format!("[crawlerd {}] shutting down: {reason}", self.context);
            let body = format!(
                "The {} crawler is shutting itself down.\n\nReason: {reason}\n\nLast failure:\n{signature}\n",
                self.context
            );
            if let Err(mail_err) = self.mailer.send(to, &subject, &body) {
                self.logger
                    .error(&format!("could not send shutdown alert: {mail_err}"));
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::MemoryMailer;

    fn monitor(limits: BreakerLimits) -> FailureMonitor {
        FailureMonitor::new(
            limits,
            Logger::stderr_only("TEST"),
            Arc::new(MemoryMailer::new()),
            None,
            "TEST",
        )
    }

    fn big_limits() -> BreakerLimits {
        BreakerLimits {
            time_window: Duration::from_secs_f64(7.0),
            count_in_window: 1000,
            identical: 1000,
            total: 1000,
        }
    }

    #[test]
    fn window_slides_instead_of_resetting() {
        let mut m = monitor(big_limits());
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);

        assert!(m.record_at("a", t0).is_none());
        assert!(m.record_at("b", t0 + Duration::from_secs(3)).is_none());
        assert_eq!(m.errors_in_window(), 2);

        // Ten seconds later the first two have aged out; the window keeps
        // the newest entry rather than clearing.
        assert!(m.record_at("c", t0 + Duration::from_secs(13)).is_none());
        assert_eq!(m.errors_in_window(), 1);
        assert_eq!(m.window_start(), Some(t0 + Duration::from_secs(13)));
        assert_eq!(m.total_errors(), 3);
    }

    #[test]
    fn observe_sends_one_alert_per_trip() {
        let mailer = Arc::new(MemoryMailer::new());
        let limits = BreakerLimits {
            identical: 1,
            ..big_limits()
        };
        let mut m = FailureMonitor::new(
            limits,
            Logger::stderr_only("TEST"),
            Arc::clone(&mailer) as Arc<dyn Mailer>,
            Some("ops@example.com".to_string()),
            "TEST",
        );
        let err = CrawlerError::Runtime {
            details: "boom".to_string(),
        };
        assert!(m.observe(&err));
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ops@example.com");
        assert!(sent[0].subject.contains("shutting down"), "{:?}", sent[0]);
        assert!(sent[0].body.contains("boom"), "{:?}", sent[0]);
    }

    #[test]
    fn absent_mailto_trips_without_mailing() {
        let mailer = Arc::new(MemoryMailer::new());
        let limits = BreakerLimits {
            total: 1,
            ..big_limits()
        };
        let mut m = FailureMonitor::new(
            limits,
            Logger::stderr_only("TEST"),
            Arc::clone(&mailer) as Arc<dyn Mailer>,
            None,
            "TEST",
        );
        let err = CrawlerError::Runtime {
            details: "boom".to_string(),
        };
        assert!(m.observe(&err));
        assert!(mailer.sent().is_empty());
    }
}
