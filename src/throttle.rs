//! Per-address login throttling.
//!
//! Each client address moves through `clean` (no record), `counting` and
//! `blocked`. Reaching the attempt limit also adds the address to the
//! durable block list, which outlives the transient block: lifting it is an
//! administrative action.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::PanelConfig;
use crate::error::ConfigError;

/// Persistent set of denied client addresses.
#[async_trait]
pub trait BlockList: Send + Sync {
    /// Whether `ip` is on the list.
    async fn is_blocked(&self, ip: &str) -> bool;

    /// Adds `ip`, returning whether it was not listed before. The address
    /// stays blocked in memory even if persisting fails.
    async fn block(&self, ip: &str) -> Result<bool, ConfigError>;
}

/// Limits applied to failed panel logins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    /// Failures that move an address from counting to blocked.
    pub max_attempts: u32,
    /// Quiet period after the last failure that resets the count.
    pub window: Duration,
    /// How long a transient block lasts.
    pub block_duration: Duration,
}

impl ThrottlePolicy {
    /// Builds the policy from the config. Durations too large for
    /// [`Duration`] saturate instead of failing.
    pub fn from_config(config: &PanelConfig) -> Self {
        Self {
            max_attempts: config.max_login_attempts,
            window: saturating_seconds(config.login_attempt_window),
            block_duration: saturating_seconds(config.block_duration),
        }
    }
}

fn saturating_seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// Throttle record of one client address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginAttempt {
    /// Client address the record belongs to.
    pub ip: String,
    /// Failures counted in the current window.
    pub attempts: u32,
    /// Time of the most recent counted failure.
    pub last_attempt: DateTime<Utc>,
    /// Whether the attempt limit was reached.
    pub blocked: bool,
    /// End of the transient block, set together with `blocked`.
    pub blocked_until: Option<DateTime<Utc>>,
}

impl LoginAttempt {
    fn new(ip: &str, now: DateTime<Utc>) -> Self {
        Self {
            ip: ip.to_string(),
            attempts: 0,
            last_attempt: now,
            blocked: false,
            blocked_until: None,
        }
    }

    /// A block ends at `blocked_until`; a count ends once the window has
    /// passed since the last attempt.
    fn is_expired(&self, now: DateTime<Utc>, policy: &ThrottlePolicy) -> bool {
        if self.blocked {
            self.blocked_until.map_or(true, |until| now >= until)
        } else {
            now - self.last_attempt > policy.window
        }
    }

    fn status(&self) -> ThrottleStatus {
        match (self.blocked, self.blocked_until) {
            (true, Some(until)) => ThrottleStatus::Blocked {
                attempts: self.attempts,
                until,
            },
            _ => ThrottleStatus::Counting {
                attempts: self.attempts,
            },
        }
    }
}

/// State of one address as seen by [`ThrottleStore::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleStatus {
    /// No record, or the record just expired.
    Clear,
    /// Failures counted, limit not reached.
    Counting { attempts: u32 },
    /// Limit reached; logins are refused until `until`.
    Blocked { attempts: u32, until: DateTime<Utc> },
}

impl ThrottleStatus {
    /// Failures on record, zero when clear.
    pub fn attempts(&self) -> u32 {
        match self {
            ThrottleStatus::Clear => 0,
            ThrottleStatus::Counting { attempts } | ThrottleStatus::Blocked { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// What a failed login did to the address's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The failure was counted and the limit is still ahead.
    Counting {
        attempts: u32,
        /// Failures left before the address is blocked.
        remaining_attempts: u32,
    },
    /// The address is blocked until `until`.
    Blocked {
        attempts: u32,
        until: DateTime<Utc>,
        /// False when the address was already blocked and nothing was counted.
        newly_blocked: bool,
    },
}

/// In-memory attempt table plus the durable block list it feeds.
///
/// Reads share the lock; each transition takes it exclusively and releases
/// it before the block list is persisted.
pub struct ThrottleStore {
    attempts: RwLock<HashMap<String, LoginAttempt>>,
    policy: RwLock<ThrottlePolicy>,
    block_list: Arc<dyn BlockList>,
}

impl ThrottleStore {
    /// Empty table; blocks are reported to `block_list`.
    pub fn new(policy: ThrottlePolicy, block_list: Arc<dyn BlockList>) -> Self {
        Self {
            attempts: RwLock::new(HashMap::new()),
            policy: RwLock::new(policy),
            block_list,
        }
    }

    /// Policy currently in force.
    pub async fn policy(&self) -> ThrottlePolicy {
        *self.policy.read().await
    }

    /// Applies to every transition from now on; existing records keep
    /// their `blocked_until`.
    pub async fn set_policy(&self, policy: ThrottlePolicy) {
        *self.policy.write().await = policy;
    }

    /// Whether the address is on the durable list. Such addresses are
    /// rejected before any throttle logic runs.
    pub async fn is_durably_blocked(&self, ip: &str) -> bool {
        self.block_list.is_blocked(ip).await
    }

    /// [`check_at`](Self::check_at) the current time.
    pub async fn check(&self, ip: &str) -> ThrottleStatus {
        self.check_at(ip, Utc::now()).await
    }

    /// Current state of `ip`, discarding the record first if its block or
    /// window has run out.
    pub async fn check_at(&self, ip: &str, now: DateTime<Utc>) -> ThrottleStatus {
        let policy = self.policy().await;

        {
            let table = self.attempts.read().await;
            match table.get(ip) {
                None => return ThrottleStatus::Clear,
                Some(attempt) if !attempt.is_expired(now, &policy) => return attempt.status(),
                Some(_) => {}
            }
        }

        let mut table = self.attempts.write().await;
        if table
            .get(ip)
            .is_some_and(|attempt| attempt.is_expired(now, &policy))
        {
            table.remove(ip);
            tracing::debug!(ip, "Login attempt record expired");
        }
        table.get(ip).map_or(ThrottleStatus::Clear, LoginAttempt::status)
    }

    /// [`record_failure_at`](Self::record_failure_at) the current time.
    pub async fn record_failure(&self, ip: &str) -> FailureOutcome {
        self.record_failure_at(ip, Utc::now()).await
    }

    /// Counts a failed login. An expired record is discarded first; a live
    /// block is reported without counting.
    pub async fn record_failure_at(&self, ip: &str, now: DateTime<Utc>) -> FailureOutcome {
        let policy = self.policy().await;

        let outcome = {
            let mut table = self.attempts.write().await;

            if table
                .get(ip)
                .is_some_and(|attempt| attempt.is_expired(now, &policy))
            {
                table.remove(ip);
            }

            let attempt = table
                .entry(ip.to_string())
                .or_insert_with(|| LoginAttempt::new(ip, now));

            match attempt.blocked_until {
                Some(until) if attempt.blocked => FailureOutcome::Blocked {
                    attempts: attempt.attempts,
                    until,
                    newly_blocked: false,
                },
                _ => {
                    attempt.attempts += 1;
                    attempt.last_attempt = now;

                    if attempt.attempts >= policy.max_attempts {
                        let until = now
                            .checked_add_signed(policy.block_duration)
                            .unwrap_or(DateTime::<Utc>::MAX_UTC);
                        attempt.blocked = true;
                        attempt.blocked_until = Some(until);
                        FailureOutcome::Blocked {
                            attempts: attempt.attempts,
                            until,
                            newly_blocked: true,
                        }
                    } else {
                        FailureOutcome::Counting {
                            attempts: attempt.attempts,
                            remaining_attempts: policy.max_attempts - attempt.attempts,
                        }
                    }
                }
            }
        };

        if let FailureOutcome::Blocked {
            attempts,
            until,
            newly_blocked: true,
        } = outcome
        {
            tracing::warn!(
                ip,
                attempts,
                block_secs = policy.block_duration.num_seconds(),
                %until,
                "Address blocked after failed login attempts"
            );
            match self.block_list.block(ip).await {
                Ok(true) => tracing::info!(ip, "Address added to durable block list"),
                Ok(false) => {}
                Err(e) => tracing::error!(ip, error = %e, "Failed to persist durable block list"),
            }
        }

        outcome
    }

    /// Full reset after a successful login; the durable list is untouched.
    pub async fn clear(&self, ip: &str) {
        if self.attempts.write().await.remove(ip).is_some() {
            tracing::debug!(ip, "Login attempts cleared");
        }
    }

    /// Snapshot of all records, ordered by address.
    pub async fn entries(&self) -> Vec<LoginAttempt> {
        let mut entries: Vec<_> = self.attempts.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.ip.cmp(&b.ip));
        entries
    }
}
