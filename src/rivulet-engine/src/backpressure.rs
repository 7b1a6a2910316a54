//! Watermark-based flow control between a producer and a buffering consumer.
//!
//! A consumer that queues data (a sink waiting on its reader, a hash join
//! holding probe batches during build) records what it buffers in a
//! [`BackpressureController`]. Crossing the high watermark pauses the
//! producer; draining to the low watermark resumes it. Each pause and resume
//! carries a counter, and receivers track the last counter per requester in
//! a [`PauseSet`], so a late resume never cancels a newer pause.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use common_config::{BackpressureConfig, BackpressureUnit};
use common_error::{RivuletError, RivuletResult};

use crate::batch::ExecBatch;
use crate::node::NodeId;
use crate::plan::PlanShared;

/// Watermarks and the unit they are measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureOptions {
    pub low_watermark: u64,
    pub high_watermark: u64,
    pub unit: BackpressureUnit,
}

impl BackpressureOptions {
    pub fn new(low_watermark: u64, high_watermark: u64, unit: BackpressureUnit) -> RivuletResult<Self> {
        if low_watermark >= high_watermark {
            return Err(RivuletError::invalid_options(format!(
                "low watermark ({low_watermark}) must be below high watermark ({high_watermark})"
            )));
        }
        Ok(Self {
            low_watermark,
            high_watermark,
            unit,
        })
    }

    pub fn from_config(config: &BackpressureConfig) -> RivuletResult<Self> {
        Self::new(config.low_watermark, config.high_watermark, config.unit)
    }

    /// Size of `batch` in this options' unit.
    pub fn measure(&self, batch: &ExecBatch) -> u64 {
        match self.unit {
            BackpressureUnit::Bytes => batch.memory_size() as u64,
            BackpressureUnit::Rows => batch.num_rows() as u64,
            BackpressureUnit::Batches => 1,
        }
    }
}

/// Receives pause and resume signals from a controller.
pub trait BackpressureTarget: Send + Sync {
    fn pause(&self, counter: u64);
    fn resume(&self, counter: u64);
}

#[derive(Debug, Default)]
struct ControllerState {
    buffered: u64,
    paused: bool,
    counter: u64,
    pauses: u64,
}

/// Tracks buffered data and pauses or resumes its target.
///
/// The target is called while the controller lock is held, so two signals
/// from one controller never reach the target out of order.
pub struct BackpressureController {
    options: BackpressureOptions,
    target: Arc<dyn BackpressureTarget>,
    state: Mutex<ControllerState>,
}

impl fmt::Debug for BackpressureController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BackpressureController")
            .field("options", &self.options)
            .field("buffered", &state.buffered)
            .field("paused", &state.paused)
            .finish()
    }
}

impl BackpressureController {
    pub fn new(options: BackpressureOptions, target: Arc<dyn BackpressureTarget>) -> Self {
        Self {
            options,
            target,
            state: Mutex::new(ControllerState::default()),
        }
    }

    pub fn options(&self) -> &BackpressureOptions {
        &self.options
    }

    /// Record newly buffered data; pauses above the high watermark.
    pub fn record_added(&self, amount: u64) {
        let mut state = self.state.lock();
        state.buffered += amount;
        if !state.paused && state.buffered > self.options.high_watermark {
            state.paused = true;
            state.counter += 1;
            state.pauses += 1;
            log::debug!(
                "pausing producer: {} buffered > {}",
                state.buffered,
                self.options.high_watermark
            );
            self.target.pause(state.counter);
        }
    }

    /// Record released data; resumes at or below the low watermark.
    pub fn record_removed(&self, amount: u64) {
        let mut state = self.state.lock();
        state.buffered = state.buffered.saturating_sub(amount);
        if state.paused && state.buffered <= self.options.low_watermark {
            state.paused = false;
            state.counter += 1;
            log::debug!("resuming producer: {} buffered", state.buffered);
            self.target.resume(state.counter);
        }
    }

    pub fn buffered(&self) -> u64 {
        self.state.lock().buffered
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Pauses issued so far.
    pub fn pause_count(&self) -> u64 {
        self.state.lock().pauses
    }
}

/// Pause state per requesting node, with stale-counter rejection.
#[derive(Debug, Default)]
pub struct PauseSet {
    requesters: HashMap<NodeId, (u64, bool)>,
}

impl PauseSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a pause. Returns false if `counter` is stale.
    pub fn pause(&mut self, requester: NodeId, counter: u64) -> bool {
        self.apply(requester, counter, true)
    }

    /// Apply a resume. Returns false if `counter` is stale.
    pub fn resume(&mut self, requester: NodeId, counter: u64) -> bool {
        self.apply(requester, counter, false)
    }

    fn apply(&mut self, requester: NodeId, counter: u64, paused: bool) -> bool {
        let entry = self.requesters.entry(requester).or_insert((0, false));
        if counter <= entry.0 {
            log::trace!("ignoring stale signal {counter} from {requester}");
            return false;
        }
        *entry = (counter, paused);
        true
    }

    /// Whether any requester currently holds a pause.
    pub fn is_paused(&self) -> bool {
        self.requesters.values().any(|(_, paused)| *paused)
    }
}

/// Signals `producer` on behalf of `consumer` through the plan.
#[derive(Debug, Clone)]
pub struct NodeEdge {
    plan: Weak<PlanShared>,
    producer: NodeId,
    consumer: NodeId,
}

impl NodeEdge {
    pub fn new(plan: Weak<PlanShared>, producer: NodeId, consumer: NodeId) -> Self {
        Self {
            plan,
            producer,
            consumer,
        }
    }
}

impl BackpressureTarget for NodeEdge {
    fn pause(&self, counter: u64) {
        let Some(plan) = self.plan.upgrade() else {
            return;
        };
        if let Some(consumer) = plan.node(self.consumer) {
            consumer.core().record_pause();
        }
        if let Some(producer) = plan.node(self.producer) {
            producer.pause_producing(self.consumer, counter);
        }
    }

    fn resume(&self, counter: u64) {
        if let Some(producer) = self.plan.upgrade().and_then(|p| p.node(self.producer)) {
            producer.resume_producing(self.consumer, counter);
        }
    }
}

/// Manual flow control handed to push-style sink consumers.
#[derive(Clone)]
pub struct BackpressureControl {
    target: Arc<dyn BackpressureTarget>,
    counter: Arc<AtomicU64>,
}

impl fmt::Debug for BackpressureControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackpressureControl")
            .field("counter", &self.counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl BackpressureControl {
    pub fn new(target: Arc<dyn BackpressureTarget>) -> Self {
        Self {
            target,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn pause(&self) {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.target.pause(counter);
    }

    pub fn resume(&self) {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.target.resume(counter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingTarget {
        signals: Mutex<Vec<(bool, u64)>>,
    }

    impl BackpressureTarget for RecordingTarget {
        fn pause(&self, counter: u64) {
            self.signals.lock().push((true, counter));
        }

        fn resume(&self, counter: u64) {
            self.signals.lock().push((false, counter));
        }
    }

    #[test]
    fn test_options_validation() {
        assert!(BackpressureOptions::new(10, 10, BackpressureUnit::Rows).is_err());
        assert!(BackpressureOptions::new(20, 10, BackpressureUnit::Rows).is_err());
        let config = BackpressureConfig::default();
        assert!(BackpressureOptions::from_config(&config).is_ok());
    }

    #[test]
    fn test_pause_and_resume_thresholds() {
        let target = Arc::new(RecordingTarget::default());
        let options = BackpressureOptions::new(2, 4, BackpressureUnit::Batches).unwrap();
        let controller = BackpressureController::new(options, target.clone());

        for _ in 0..4 {
            controller.record_added(1);
        }
        // exactly at high is not above it
        assert!(!controller.is_paused());
        controller.record_added(1);
        assert!(controller.is_paused());
        controller.record_added(1);

        controller.record_removed(3);
        assert!(controller.is_paused());
        controller.record_removed(1);
        assert!(!controller.is_paused());
        assert_eq!(controller.buffered(), 2);

        controller.record_added(3);
        assert_eq!(
            *target.signals.lock(),
            vec![(true, 1), (false, 2), (true, 3)]
        );
        assert_eq!(controller.pause_count(), 2);
    }

    #[test]
    fn test_pause_set_rejects_stale() {
        let mut set = PauseSet::new();
        let a = NodeId::new(1);
        let b = NodeId::new(2);

        assert!(set.pause(a, 1));
        assert!(set.pause(b, 1));
        assert!(set.resume(a, 2));
        assert!(set.is_paused());

        // a resume older than b's pause
        assert!(!set.resume(b, 1));
        assert!(set.is_paused());
        assert!(set.resume(b, 2));
        assert!(!set.is_paused());

        assert!(!set.pause(a, 2));
        assert!(!set.is_paused());
    }

    #[test]
    fn test_manual_control_counters_increase() {
        let target = Arc::new(RecordingTarget::default());
        let control = BackpressureControl::new(target.clone());
        control.pause();
        control.clone().resume();
        assert_eq!(*target.signals.lock(), vec![(true, 1), (false, 2)]);
    }
}
