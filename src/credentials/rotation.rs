//! Multi-credential failover with cooldown-aware selection.
//!
//! The manager keeps one active slot. Consecutive failures on it, or a single
//! authentication / rate-limit failure, rotate to the next slot that is not
//! cooling down. When every slot is cooling down the slot whose cooldown
//! expires soonest is chosen, and callers can ask for that instant to report a
//! retry-after instead of failing blindly.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::credentials::{DEFAULT_COOLDOWN, DEFAULT_MAX_FAILURES, DEFAULT_MODEL};
use crate::credentials::slots::{Credential, CredentialSlot, CredentialSource};
use crate::error::{AppError, Result};
use crate::reliability::metrics::record_credential_rotation;

/// Rotation tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Consecutive failures on the active slot before rotating.
    pub max_failures: u32,
    /// How long a failed slot is avoided.
    #[serde(with = "crate::config::duration_secs")]
    pub cooldown: Duration,
    /// Model reported for slots without an assigned model.
    pub default_model: String,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            cooldown: DEFAULT_COOLDOWN,
            default_model: DEFAULT_MODEL.to_string(),
        }
    }
}

/// What went wrong with a credential-scoped call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInfo {
    pub status: Option<u16>,
    pub message: String,
}

impl FailureInfo {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// 401, 403 and 429 rotate immediately.
    pub fn is_auth_or_rate_limit(&self) -> bool {
        matches!(self.status, Some(401 | 403 | 429))
    }
}

impl From<&AppError> for FailureInfo {
    fn from(err: &AppError) -> Self {
        Self::new(err.upstream_status(), err.to_string())
    }
}

#[derive(Debug, Clone)]
struct FailureRecord {
    count: u32,
    last_failure_at: Instant,
    last_failure_wall: DateTime<Utc>,
}

#[derive(Debug)]
struct RotationState {
    current: usize,
    consecutive_failures: u32,
    records: Vec<Option<FailureRecord>>,
}

/// A slot exposed for callers that drive several credentials at once.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyModelPair {
    pub index: usize,
    pub credential: Credential,
    pub model: String,
}

/// Per-slot entry of [`RotationStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub index: usize,
    pub credential: String,
    pub model: String,
    pub source: CredentialSource,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub in_cooldown: bool,
}

/// Observability snapshot of the rotation manager.
#[derive(Debug, Clone, Serialize)]
pub struct RotationStatus {
    pub active_index: usize,
    pub total_slots: usize,
    pub consecutive_failures: u32,
    pub keys_in_cooldown: usize,
    pub all_exhausted: bool,
    pub next_reset_in_ms: Option<u64>,
    pub slots: Vec<SlotStatus>,
}

/// Selects the active (credential, model) slot and rotates away from failing ones.
#[derive(Debug)]
pub struct CredentialRotationManager {
    slots: Vec<CredentialSlot>,
    config: RotationConfig,
    state: Mutex<RotationState>,
}

impl CredentialRotationManager {
    pub fn new(slots: Vec<CredentialSlot>, config: RotationConfig) -> Self {
        info!(
            slots = slots.len(),
            max_failures = config.max_failures,
            cooldown_secs = config.cooldown.as_secs(),
            "Credential rotation manager ready"
        );
        let records = vec![None; slots.len()];
        Self {
            slots,
            config,
            state: Mutex::new(RotationState {
                current: 0,
                consecutive_failures: 0,
                records,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// Index of the active slot.
    pub fn current_index(&self) -> usize {
        self.state.lock().current
    }

    /// The active credential, or `None` when running unauthenticated.
    pub fn get_current(&self) -> Option<Credential> {
        let current = self.state.lock().current;
        self.slots.get(current).map(|slot| slot.credential.clone())
    }

    /// The model paired with the active slot.
    pub fn get_current_model(&self) -> String {
        let current = self.state.lock().current;
        self.model_for(current)
    }

    fn model_for(&self, index: usize) -> String {
        self.slots
            .get(index)
            .and_then(|slot| slot.model.clone())
            .unwrap_or_else(|| self.config.default_model.clone())
    }

    pub fn report_success(&self) {
        let mut state = self.state.lock();
        let current = state.current;
        state.consecutive_failures = 0;
        if let Some(record) = state.records.get_mut(current) {
            *record = None;
        }
    }

    /// Record a failure of the active slot. Returns whether it rotated.
    pub fn report_failure(&self, info: &FailureInfo) -> bool {
        if self.slots.is_empty() {
            return false;
        }

        let mut state = self.state.lock();
        let current = state.current;
        state.consecutive_failures += 1;
        record_failure(&mut state.records[current]);

        let exceeded = state.consecutive_failures >= self.config.max_failures;
        let urgent = info.is_auth_or_rate_limit();
        if !exceeded && !urgent {
            debug!(
                slot = current,
                consecutive_failures = state.consecutive_failures,
                "Credential failure recorded"
            );
            return false;
        }

        if self.slots.len() <= 1 {
            warn!(
                slot = current,
                status = ?info.status,
                error = %info.message,
                "Credential failing but there is no other slot to rotate to"
            );
            return false;
        }

        let next = self.pick_next(&state, Instant::now());
        state.current = next;
        state.consecutive_failures = 0;
        let reason = if urgent { "auth_or_rate_limit" } else { "max_failures" };
        warn!(
            from = current,
            to = next,
            reason,
            status = ?info.status,
            "Rotated credential"
        );
        record_credential_rotation(reason);
        true
    }

    /// Record the outcome of a call made with slot `index` outside the active
    /// pointer (fan-out). Never rotates.
    pub fn report_outcome_for(&self, index: usize, failure: Option<&FailureInfo>) {
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(index) else {
            return;
        };
        match failure {
            Some(_) => record_failure(record),
            None => *record = None,
        }
    }

    /// First slot after the active one that is not cooling down, else the
    /// slot whose cooldown ends soonest.
    fn pick_next(&self, state: &RotationState, now: Instant) -> usize {
        let n = self.slots.len();
        let scan = (1..=n).map(|offset| (state.current + offset) % n);

        if let Some(clear) = scan.clone().find(|&i| !self.is_cooling(&state.records[i], now)) {
            return clear;
        }
        scan.min_by_key(|&i| self.cooldown_ends(&state.records[i]))
            .unwrap_or(state.current)
    }

    fn cooldown_ends(&self, record: &Option<FailureRecord>) -> Option<Instant> {
        record
            .as_ref()
            .map(|record| record.last_failure_at + self.config.cooldown)
    }

    fn is_cooling(&self, record: &Option<FailureRecord>, now: Instant) -> bool {
        self.cooldown_ends(record).is_some_and(|ends| ends > now)
    }

    /// Force-select slot `index`.
    pub fn set_key_index(&self, index: usize) -> Result<()> {
        if index >= self.slots.len() {
            return Err(AppError::InvalidInput(format!(
                "credential index {} out of range (have {})",
                index,
                self.slots.len()
            )));
        }
        let mut state = self.state.lock();
        state.current = index;
        state.consecutive_failures = 0;
        Ok(())
    }

    pub fn get_all_key_model_pairs(&self) -> Vec<KeyModelPair> {
        (0..self.slots.len())
            .filter_map(|i| self.get_key_model_pair(i))
            .collect()
    }

    pub fn get_key_model_pair(&self, index: usize) -> Option<KeyModelPair> {
        let slot = self.slots.get(index)?;
        Some(KeyModelPair {
            index,
            credential: slot.credential.clone(),
            model: self.model_for(index),
        })
    }

    /// True iff there is at least one slot and every slot is cooling down.
    pub fn is_all_keys_exhausted(&self) -> bool {
        let state = self.state.lock();
        self.all_cooling(&state, Instant::now())
    }

    fn all_cooling(&self, state: &RotationState, now: Instant) -> bool {
        !state.records.is_empty()
            && state
                .records
                .iter()
                .all(|record| self.is_cooling(record, now))
    }

    /// Earliest instant at which a slot becomes usable again, when all are cooling down.
    pub fn get_next_reset_time(&self) -> Option<Instant> {
        let state = self.state.lock();
        if !self.all_cooling(&state, Instant::now()) {
            return None;
        }
        state
            .records
            .iter()
            .filter_map(|record| self.cooldown_ends(record))
            .min()
    }

    pub fn get_keys_in_cooldown_count(&self) -> usize {
        let state = self.state.lock();
        let now = Instant::now();
        state
            .records
            .iter()
            .filter(|record| self.is_cooling(record, now))
            .count()
    }

    /// Fail with `AllCredentialsCooling` when no slot is usable right now.
    pub fn ensure_available(&self) -> Result<()> {
        match self.get_next_reset_time() {
            Some(retry_after) => Err(AppError::AllCredentialsCooling { retry_after }),
            None => Ok(()),
        }
    }

    pub fn get_status(&self) -> RotationStatus {
        let state = self.state.lock();
        let now = Instant::now();

        let slots: Vec<SlotStatus> = self
            .slots
            .iter()
            .zip(state.records.iter())
            .enumerate()
            .map(|(index, (slot, record))| SlotStatus {
                index,
                credential: slot.credential.masked(),
                model: self.model_for(index),
                source: slot.source,
                failure_count: record.as_ref().map_or(0, |r| r.count),
                last_failure_at: record.as_ref().map(|r| r.last_failure_wall),
                in_cooldown: self.is_cooling(record, now),
            })
            .collect();

        let all_exhausted = self.all_cooling(&state, now);
        let next_reset_in_ms = all_exhausted
            .then(|| {
                state
                    .records
                    .iter()
                    .filter_map(|record| self.cooldown_ends(record))
                    .min()
            })
            .flatten()
            .map(|at| at.saturating_duration_since(now).as_millis() as u64);

        RotationStatus {
            active_index: state.current,
            total_slots: self.slots.len(),
            consecutive_failures: state.consecutive_failures,
            keys_in_cooldown: slots.iter().filter(|slot| slot.in_cooldown).count(),
            all_exhausted,
            next_reset_in_ms,
            slots,
        }
    }
}

fn record_failure(record: &mut Option<FailureRecord>) {
    let count = record.as_ref().map_or(0, |r| r.count) + 1;
    *record = Some(FailureRecord {
        count,
        last_failure_at: Instant::now(),
        last_failure_wall: Utc::now(),
    });
}
