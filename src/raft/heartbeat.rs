use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::NodeEvent;

/// Periodic leadership re-assertion, active only while the node leads.
///
/// The broadcaster never sends anything itself: it posts
/// `NodeEvent::HeartbeatTick { term }` and the node emits the heartbeats from
/// its own mutation path, after checking it still leads that term.
pub struct HeartbeatBroadcaster {
    interval: Duration,
    active_term: Option<u64>,
    events: Option<UnboundedSender<NodeEvent>>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatBroadcaster {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            active_term: None,
            events: None,
            task: None,
        }
    }

    pub fn attach(&mut self, events: UnboundedSender<NodeEvent>) {
        self.events = Some(events);
    }

    /// Starts ticking for `term`. The first tick comes one interval from now;
    /// the caller sends the initial heartbeat round itself.
    pub fn start(&mut self, term: u64) {
        if self.active_term == Some(term) {
            return;
        }
        self.stop();
        self.active_term = Some(term);

        if let Some(events) = &self.events {
            let events = events.clone();
            let period = self.interval;
            self.task = Some(tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if events.send(NodeEvent::HeartbeatTick { term }).is_err() {
                        break;
                    }
                }
            }));
        }
    }

    /// Stops ticking. Returns true only for the call that actually stopped an
    /// active broadcaster.
    pub fn stop(&mut self) -> bool {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.active_term.take().is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active_term.is_some()
    }

    pub fn active_term(&self) -> Option<u64> {
        self.active_term
    }
}

impl Drop for HeartbeatBroadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}
