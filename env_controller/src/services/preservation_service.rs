//! Quota & preservation manager.
//!
//! Owns the only cross-key shared state: the ledger of environments holding
//! a preservation slot. Every read-modify-write happens under one lock, so
//! concurrent requests are linearized and the slot count never exceeds the
//! configured maximum.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::ControllerConfig;
use crate::models::environment::{EnvId, Preservation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted(Preservation),
    Denied(String),
}

/// Result of one expiry tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Environments whose preservation has lapsed (`expires_at <= now`).
    pub expired: Vec<EnvId>,
    /// Environments entering the warning window, each reported once per
    /// preservation period.
    pub warnings: Vec<(EnvId, DateTime<Utc>)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotView {
    pub env_id: EnvId,
    pub preservation: Preservation,
}

#[derive(Debug, Clone)]
struct Slot {
    preservation: Preservation,
    warned: bool,
    expiry_reported: bool,
}

pub struct PreservationManager {
    ledger: Mutex<BTreeMap<EnvId, Slot>>,
    max_preserved: usize,
    duration: Duration,
    warning_lead: Duration,
}

impl PreservationManager {
    pub fn new(max_preserved: usize, duration: Duration, warning_lead: Duration) -> Self {
        Self {
            ledger: Mutex::new(BTreeMap::new()),
            max_preserved,
            duration,
            warning_lead,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(
            config.max_preserved_environments,
            config.preserve_duration(),
            config.preserve_warning_lead(),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<EnvId, Slot>> {
        // Every mutation is a single map operation, so a poisoned ledger is still consistent.
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit a new preservation, or extend an existing one.
    ///
    /// An extension resets `requested_at`/`expires_at` on the existing slot
    /// and never consumes a second one.
    pub fn request_preserve(&self, env_id: &EnvId, now: DateTime<Utc>) -> Admission {
        let mut ledger = self.lock();

        if let Some(slot) = ledger.get_mut(env_id) {
            slot.preservation = Preservation {
                requested_at: now,
                expires_at: now + self.duration,
                extension_count: slot.preservation.extension_count + 1,
            };
            slot.warned = false;
            slot.expiry_reported = false;
            tracing::info!(
                env = %env_id,
                expires_at = %slot.preservation.expires_at,
                extensions = slot.preservation.extension_count,
                "Preservation extended"
            );
            return Admission::Admitted(slot.preservation.clone());
        }

        if ledger.len() >= self.max_preserved {
            tracing::info!(
                env = %env_id,
                held = ledger.len(),
                max = self.max_preserved,
                "Preservation denied"
            );
            crate::metrics::preserve_decision("denied");
            return Admission::Denied("quota exceeded".to_string());
        }

        let preservation = Preservation {
            requested_at: now,
            expires_at: now + self.duration,
            extension_count: 0,
        };
        ledger.insert(
            env_id.clone(),
            Slot {
                preservation: preservation.clone(),
                warned: false,
                expiry_reported: false,
            },
        );
        crate::metrics::preserve_decision("admitted");
        crate::metrics::preserved_environments(ledger.len());
        tracing::info!(env = %env_id, expires_at = %preservation.expires_at, "Preservation admitted");
        Admission::Admitted(preservation)
    }

    /// Scan held slots for expiry and for the one-shot warning.
    pub fn tick(&self, now: DateTime<Utc>) -> TickOutcome {
        let mut ledger = self.lock();
        let mut outcome = TickOutcome::default();

        for (env_id, slot) in ledger.iter_mut() {
            let expires_at = slot.preservation.expires_at;
            if expires_at <= now {
                if !slot.expiry_reported {
                    slot.expiry_reported = true;
                    outcome.expired.push(env_id.clone());
                }
            } else if !slot.warned && expires_at - self.warning_lead <= now {
                slot.warned = true;
                outcome.warnings.push((env_id.clone(), expires_at));
            }
        }
        outcome
    }

    /// Free a slot. Idempotent.
    pub fn release(&self, env_id: &EnvId) {
        let mut ledger = self.lock();
        if ledger.remove(env_id).is_some() {
            tracing::info!(env = %env_id, "Preservation released");
        }
        crate::metrics::preserved_environments(ledger.len());
    }

    /// Re-register a preservation found in the cluster at startup.
    ///
    /// Returns the preservation as held by the ledger, clamped to the
    /// maximum duration; callers record this value, not the annotation.
    pub fn restore(&self, env_id: &EnvId, preservation: Preservation, now: DateTime<Utc>) -> Preservation {
        let mut ledger = self.lock();
        if ledger.len() >= self.max_preserved && !ledger.contains_key(env_id) {
            tracing::warn!(
                env = %env_id,
                max = self.max_preserved,
                "Restoring preservation beyond the configured maximum"
            );
        }
        // Clamp manually edited annotations to the maximum duration.
        let mut preservation = preservation;
        if preservation.requested_at > now {
            preservation.requested_at = now;
        }
        let latest = preservation.requested_at + self.duration;
        if preservation.expires_at > latest {
            tracing::warn!(
                env = %env_id,
                annotated = %preservation.expires_at,
                clamped = %latest,
                "Preservation expiry beyond the maximum duration"
            );
            preservation.expires_at = latest;
        }
        let warned = preservation.expires_at - self.warning_lead <= now;
        ledger.insert(
            env_id.clone(),
            Slot {
                preservation: preservation.clone(),
                warned,
                expiry_reported: false,
            },
        );
        crate::metrics::preserved_environments(ledger.len());
        preservation
    }

    pub fn held(&self) -> usize {
        self.lock().len()
    }

    pub fn snapshot(&self) -> Vec<SlotView> {
        self.lock()
            .iter()
            .map(|(env_id, slot)| SlotView {
                env_id: env_id.clone(),
                preservation: slot.preservation.clone(),
            })
            .collect()
    }
}
