//! Admission control for tool execution.
//!
//! Slots are semaphore permits taken with `try_acquire_owned`; a request
//! over a cap is rejected immediately, never queued. A permit lives on the
//! executing entry and is released when the entry leaves `executing`.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tg_auth::UserId;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::Instant,
};

use crate::{config::ConcurrencyLimits, error::AdmissionError};

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// A sliding one-minute window of submission timestamps.
#[derive(Debug, Default)]
struct SubmissionWindow {
    calls: Vec<Instant>,
}

impl SubmissionWindow {
    fn cleanup(&mut self, now: Instant) {
        self.calls.retain(|&t| now.duration_since(t) < RATE_WINDOW);
    }

    fn len(&self) -> usize {
        self.calls.len()
    }
}

/// Execution slot held while an execution is `executing`.
#[derive(Debug)]
pub struct ExecutionPermit {
    _global: OwnedSemaphorePermit,
    _user: OwnedSemaphorePermit,
}

/// Global and per-user concurrency caps plus an optional submission rate.
#[derive(Debug)]
pub struct AdmissionController {
    limits: ConcurrencyLimits,
    global: Arc<Semaphore>,
    per_user: DashMap<UserId, Arc<Semaphore>>,
    windows: DashMap<UserId, SubmissionWindow>,
}

impl AdmissionController {
    pub fn new(limits: ConcurrencyLimits) -> Self {
        Self {
            global: Arc::new(Semaphore::new(limits.max_global)),
            per_user: DashMap::new(),
            windows: DashMap::new(),
            limits,
        }
    }

    pub fn limits(&self) -> &ConcurrencyLimits {
        &self.limits
    }

    fn user_semaphore(&self, user_id: &UserId) -> Arc<Semaphore> {
        self.per_user
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.limits.max_per_user)))
            .clone()
    }

    /// Takes one global and one per-user slot, or fails without waiting.
    pub fn try_acquire(&self, user_id: &UserId) -> Result<ExecutionPermit, AdmissionError> {
        let user = self
            .user_semaphore(user_id)
            .try_acquire_owned()
            .map_err(|_| AdmissionError::UserLimit {
                user_id: user_id.clone(),
                limit: self.limits.max_per_user,
            })?;
        let global = self
            .global
            .clone()
            .try_acquire_owned()
            .map_err(|_| AdmissionError::GlobalLimit {
                limit: self.limits.max_global,
            })?;
        Ok(ExecutionPermit {
            _global: global,
            _user: user,
        })
    }

    /// Checks that a slot is free right now without taking it.
    pub fn check_capacity(&self, user_id: &UserId) -> Result<(), AdmissionError> {
        if self.user_semaphore(user_id).available_permits() == 0 {
            return Err(AdmissionError::UserLimit {
                user_id: user_id.clone(),
                limit: self.limits.max_per_user,
            });
        }
        if self.global.available_permits() == 0 {
            return Err(AdmissionError::GlobalLimit {
                limit: self.limits.max_global,
            });
        }
        Ok(())
    }

    /// Records a submission against the rate window, if one is configured.
    pub fn record_submission(&self, user_id: &UserId) -> Result<(), AdmissionError> {
        let Some(limit) = self.limits.max_submissions_per_minute else {
            return Ok(());
        };
        let now = Instant::now();
        let mut window = self.windows.entry(user_id.clone()).or_default();
        window.cleanup(now);
        if window.len() >= limit {
            return Err(AdmissionError::RateLimited {
                user_id: user_id.clone(),
                limit,
            });
        }
        window.calls.push(now);
        Ok(())
    }

    pub fn executing_global(&self) -> usize {
        self.limits.max_global - self.global.available_permits()
    }

    pub fn executing_for(&self, user_id: &UserId) -> usize {
        self.per_user
            .get(user_id)
            .map(|s| self.limits.max_per_user - s.available_permits())
            .unwrap_or(0)
    }

    /// Drops idle per-user state.
    pub fn prune_idle(&self) {
        let now = Instant::now();
        self.windows.retain(|_, window| {
            window.cleanup(now);
            window.len() > 0
        });
        self.per_user
            .retain(|_, sem| sem.available_permits() < self.limits.max_per_user);
    }
}
