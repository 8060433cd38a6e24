use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::GlobalExecutor;

/// Something that wants to be woken up periodically.
pub trait HeartbeatHandler: Send + Sync {
    fn on_heartbeat(&self, now: Instant);
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HeartbeatToken(u64);

/// The node's periodic tick.
///
/// Subscribers are invoked outside the registry lock, so a handler may
/// unsubscribe itself (or anybody else) from within `on_heartbeat`.
#[derive(Default)]
pub struct Heartbeat {
    subscribers: Mutex<Vec<(HeartbeatToken, Arc<dyn HeartbeatHandler>)>>,
    next_token: AtomicU64,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Arc<dyn HeartbeatHandler>) -> HeartbeatToken {
        let token = HeartbeatToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((token, handler));
        token
    }

    pub fn unsubscribe(&self, token: HeartbeatToken) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(t, _)| *t != token);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn tick(&self, now: Instant) {
        let snapshot: Vec<_> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in snapshot {
            handler.on_heartbeat(now);
        }
    }

    /// Ticks every `period` until the heartbeat is dropped or the task aborted.
    pub fn spawn(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let heartbeat: Weak<Self> = Arc::downgrade(self);
        GlobalExecutor::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(heartbeat) = heartbeat.upgrade() else {
                    tracing::debug!("Heartbeat dropped, stopping ticks");
                    break;
                };
                heartbeat.tick(Instant::now());
            }
        })
    }
}
