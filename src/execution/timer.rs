//! Timer support - the suspension primitive available to activities
//!
//! Each stage of each partition owns a [`TimerSlots`] with room for one
//! one-shot and one repeating timer. An armed timer is a tokio task that
//! sleeps for its interval and then notifies the owning instance through a
//! weak [`TimerTarget`] handle. Every arm or update hands out a fresh
//! generation number; a firing carrying an outdated generation is ignored
//! by the instance.

use crate::core::context::ActivityContext;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Callback invoked when a timer fires. Returns `true` to resume the pipeline.
pub type TimerCallback = Arc<dyn Fn(&mut ActivityContext) -> bool + Send + Sync>;

/// Wrap a closure as a [`TimerCallback`]
pub fn timer_callback<F>(f: F) -> TimerCallback
where
    F: Fn(&mut ActivityContext) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

static NEXT_TIMER_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_seq() -> u64 {
    NEXT_TIMER_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Error types for timer operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("A {kind} timer is already armed for stage '{stage}'")]
    Conflict { stage: String, kind: TimerKind },

    #[error("Timer interval must be greater than zero")]
    InvalidInterval,

    #[error("Timers require a running tokio runtime")]
    NoRuntime,
}

/// The two kinds of timer an activity may hold at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    OneShot,
    Repeating,
}

impl TimerKind {
    pub fn from_repeating(repeating: bool) -> Self {
        if repeating {
            TimerKind::Repeating
        } else {
            TimerKind::OneShot
        }
    }

    pub fn is_repeating(self) -> bool {
        self == TimerKind::Repeating
    }
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerKind::OneShot => write!(f, "one-shot"),
            TimerKind::Repeating => write!(f, "repeating"),
        }
    }
}

/// Timer operations exposed to an activity through its context
///
/// At most one timer of each kind may be armed per activity and partition.
pub trait TimerSupport {
    /// Whether a timer of this kind is currently armed
    fn has_timer(&self, repeating: bool) -> bool;

    /// Arm a timer. Fails with [`TimerError::Conflict`] if one of the same kind is armed.
    fn create_timer(
        &mut self,
        interval: Duration,
        callback: TimerCallback,
        repeating: bool,
    ) -> Result<(), TimerError>;

    /// Restart the countdown of an armed timer, keeping its identity and interval
    fn update_timer(&mut self, repeating: bool);

    /// Disarm the timer, discarding any pending firing
    fn cancel_timer(&mut self, repeating: bool);
}

/// Addresses the stage a timer belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TimerKey {
    pub partition: String,
    pub stage: usize,
    pub kind: TimerKind,
}

/// Receiver of timer firings (implemented by the instance)
#[async_trait]
pub(crate) trait TimerTarget: Send + Sync {
    async fn timer_fired(&self, key: TimerKey, generation: u64);
}

struct ArmedTimer {
    id: u64,
    generation: u64,
    interval: Duration,
    callback: TimerCallback,
    cancel: CancellationToken,
}

impl Drop for ArmedTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Timer bookkeeping for one stage of one partition
pub(crate) struct TimerSlots {
    target: Weak<dyn TimerTarget>,
    partition: String,
    stage: usize,
    stage_name: String,
    one_shot: Option<ArmedTimer>,
    repeating: Option<ArmedTimer>,
}

impl TimerSlots {
    pub fn new(
        target: Weak<dyn TimerTarget>,
        partition: impl Into<String>,
        stage: usize,
        stage_name: impl Into<String>,
    ) -> Self {
        Self {
            target,
            partition: partition.into(),
            stage,
            stage_name: stage_name.into(),
            one_shot: None,
            repeating: None,
        }
    }

    fn slot(&self, kind: TimerKind) -> &Option<ArmedTimer> {
        match kind {
            TimerKind::OneShot => &self.one_shot,
            TimerKind::Repeating => &self.repeating,
        }
    }

    fn slot_mut(&mut self, kind: TimerKind) -> &mut Option<ArmedTimer> {
        match kind {
            TimerKind::OneShot => &mut self.one_shot,
            TimerKind::Repeating => &mut self.repeating,
        }
    }

    pub fn any_armed(&self) -> bool {
        self.one_shot.is_some() || self.repeating.is_some()
    }

    pub fn armed_count(&self) -> usize {
        usize::from(self.one_shot.is_some()) + usize::from(self.repeating.is_some())
    }

    #[cfg(test)]
    pub fn timer_id(&self, kind: TimerKind) -> Option<u64> {
        self.slot(kind).as_ref().map(|t| t.id)
    }

    /// Callback of the armed timer, if `generation` is still current
    pub fn current_callback(&self, kind: TimerKind, generation: u64) -> Option<TimerCallback> {
        self.slot(kind)
            .as_ref()
            .filter(|t| t.generation == generation)
            .map(|t| t.callback.clone())
    }

    pub fn disarm(&mut self, kind: TimerKind) {
        self.slot_mut(kind).take();
    }

    pub fn cancel_all(&mut self) {
        if self.any_armed() {
            debug!(
                "Cancelling timers of stage '{}' in partition '{}'",
                self.stage_name, self.partition
            );
        }
        self.one_shot.take();
        self.repeating.take();
    }

    fn spawn(&self, kind: TimerKind, interval: Duration, generation: u64) -> Result<CancellationToken, TimerError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| TimerError::NoRuntime)?;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let target = self.target.clone();
        let key = TimerKey {
            partition: self.partition.clone(),
            stage: self.stage,
            kind,
        };

        handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(target) = target.upgrade() else {
                    return;
                };
                target.timer_fired(key.clone(), generation).await;
                if !kind.is_repeating() || token.is_cancelled() {
                    return;
                }
            }
        });

        Ok(cancel)
    }
}

impl TimerSupport for TimerSlots {
    fn has_timer(&self, repeating: bool) -> bool {
        self.slot(TimerKind::from_repeating(repeating)).is_some()
    }

    fn create_timer(
        &mut self,
        interval: Duration,
        callback: TimerCallback,
        repeating: bool,
    ) -> Result<(), TimerError> {
        let kind = TimerKind::from_repeating(repeating);
        if interval.is_zero() {
            return Err(TimerError::InvalidInterval);
        }
        if self.slot(kind).is_some() {
            return Err(TimerError::Conflict {
                stage: self.stage_name.clone(),
                kind,
            });
        }

        let id = next_seq();
        let cancel = self.spawn(kind, interval, id)?;
        debug!(
            "Armed {} timer {} ({:?}) for stage '{}' in partition '{}'",
            kind, id, interval, self.stage_name, self.partition
        );
        *self.slot_mut(kind) = Some(ArmedTimer {
            id,
            generation: id,
            interval,
            callback,
            cancel,
        });
        Ok(())
    }

    fn update_timer(&mut self, repeating: bool) {
        let kind = TimerKind::from_repeating(repeating);
        let Some((id, interval, callback)) = self
            .slot(kind)
            .as_ref()
            .map(|t| (t.id, t.interval, t.callback.clone()))
        else {
            return;
        };

        let generation = next_seq();
        if let Ok(cancel) = self.spawn(kind, interval, generation) {
            debug!("Restarted {} timer {} for stage '{}'", kind, id, self.stage_name);
            // Replacing the slot drops the previous task's token.
            *self.slot_mut(kind) = Some(ArmedTimer {
                id,
                generation,
                interval,
                callback,
                cancel,
            });
        }
    }

    fn cancel_timer(&mut self, repeating: bool) {
        let kind = TimerKind::from_repeating(repeating);
        if let Some(timer) = self.slot_mut(kind).take() {
            debug!("Cancelled {} timer {} for stage '{}'", kind, timer.id, self.stage_name);
        }
    }
}
