//! Cancellable timers owned by the connection task.
//!
//! Both timers are polled from `tokio::select!` loops. When nothing is
//! scheduled their futures stay pending forever, so an idle branch never
//! fires. Scheduling a [`ReconnectTimer`] replaces the previous deadline,
//! which makes two concurrent reconnect timers impossible.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

/// One-shot reconnect timer.
#[derive(Debug, Default)]
pub struct ReconnectTimer {
    deadline: Option<Pin<Box<Sleep>>>,
}

impl ReconnectTimer {
    /// An unscheduled timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire after `delay`, cancelling any earlier schedule.
    pub fn schedule(&mut self, delay: Duration) {
        self.deadline = Some(Box::pin(tokio::time::sleep(delay)));
    }

    /// Cancel the pending schedule. Returns whether one existed.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    /// Whether a schedule is pending.
    pub fn is_scheduled(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolve when the scheduled deadline passes, then unschedule.
    ///
    /// Cancel-safe: dropping the future keeps the schedule in place.
    pub async fn fired(&mut self) {
        match &mut self.deadline {
            Some(sleep) => {
                sleep.as_mut().await;
                self.deadline = None;
            }
            None => pending().await,
        }
    }
}

/// Keepalive ticker, running only while the connection is open.
#[derive(Debug, Default)]
pub struct PingTimer {
    interval: Option<Interval>,
}

impl PingTimer {
    /// A stopped ticker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start ticking every `period`, first tick one period from now.
    pub fn start(&mut self, period: Duration) {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
    }

    /// Stop ticking.
    pub fn stop(&mut self) {
        self.interval = None;
    }

    /// Whether the ticker is running.
    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Resolve on the next tick. Pending forever while stopped.
    pub async fn tick(&mut self) {
        match &mut self.interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => pending().await,
        }
    }
}
