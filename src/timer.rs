//! Cancellable timers backed by tokio tasks.
//!
//! A slot holds at most one pending task. Arming aborts whatever the slot
//! held before, so a timer of one kind can never fire twice.

use log::trace;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Single-slot timer: one-shot or periodic, never both at once.
#[derive(Debug)]
pub struct OneShotTimer {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
    deadline: Option<Instant>,
}

impl OneShotTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handle: None,
            deadline: None,
        }
    }

    /// Run `task` once after `delay`, replacing any pending task.
    pub fn arm<F>(&mut self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let deadline = Instant::now() + delay;
        trace!("timer {} armed for {:?}", self.name, delay);
        self.deadline = Some(deadline);
        self.handle = Some(tokio::spawn(async move {
            time::sleep_until(deadline).await;
            task.await;
        }));
    }

    /// Run `tick` every `period`, first tick one period from now.
    pub fn arm_every<F, Fut>(&mut self, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let first = Instant::now() + period;
        trace!("timer {} armed every {:?}", self.name, period);
        self.deadline = Some(first);
        self.handle = Some(tokio::spawn(async move {
            let mut interval = time::interval_at(first, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        }));
    }

    /// Abort the pending task. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        self.deadline = None;
        match self.handle.take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                if pending {
                    trace!("timer {} cancelled", self.name);
                }
                pending
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// When the pending task (next tick, for periodic timers) is due.
    pub fn deadline(&self) -> Option<Instant> {
        if self.is_pending() {
            self.deadline
        } else {
            None
        }
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
