use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use super::NodeEvent;

/// Single-shot, restartable election timer.
///
/// Every `reset` bumps a generation counter and schedules one
/// `NodeEvent::ElectionTimeout` carrying it. Resetting or stopping aborts the
/// pending task, and `fire` refuses any generation other than the latest, so a
/// firing that raced with a reset is discarded instead of delivered twice.
///
/// Without an attached event queue the timer only tracks its deadline; the
/// owner decides when to call `fire`.
pub struct ElectionTimer {
    min_ms: u64,
    max_ms: u64,
    generation: u64,
    deadline: Option<Instant>,
    events: Option<UnboundedSender<NodeEvent>>,
    task: Option<JoinHandle<()>>,
}

impl ElectionTimer {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms,
            max_ms: max_ms.max(min_ms),
            generation: 0,
            deadline: None,
            events: None,
            task: None,
        }
    }

    pub fn attach(&mut self, events: UnboundedSender<NodeEvent>) {
        self.events = Some(events);
    }

    pub fn random_timeout(&self) -> Duration {
        let mut rng = rand::rng();
        Duration::from_millis(rng.random_range(self.min_ms..=self.max_ms))
    }

    /// Cancels any pending firing and schedules a new one at a fresh random
    /// duration from now. Returns the chosen duration.
    pub fn reset(&mut self) -> Duration {
        self.abort_task();
        self.generation += 1;

        let timeout = self.random_timeout();
        self.deadline = Some(Instant::now() + timeout);

        if let Some(events) = &self.events {
            let events = events.clone();
            let generation = self.generation;
            self.task = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                // The receiver is gone once the node shuts down.
                let _ = events.send(NodeEvent::ElectionTimeout { generation });
            }));
        }

        timeout
    }

    /// Cancels any pending firing without rescheduling.
    pub fn stop(&mut self) {
        self.abort_task();
        self.generation += 1;
        self.deadline = None;
    }

    /// Consumes a firing. Returns false for superseded generations and for a
    /// stopped or already-fired timer.
    pub fn fire(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.deadline = None;
        self.task = None;
        true
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.deadline.is_some() && generation == self.generation
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ElectionTimer {
    fn drop(&mut self) {
        self.abort_task();
    }
}
