//! Notification channel between the background workers and whoever presents
//! their state (the console binary, a GUI, a test).
//!
//! Workers hold a cloned [`Notifier`] and never block on it: sends go through
//! `try_send` on a bounded channel, and a full buffer drops the notification
//! with a warning. A single [`NotificationReceiver`] drains the channel in
//! emission order.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, warn};
use uuid::Uuid;

use crate::errors::RoarmError;
use crate::executor::RunState;
use crate::pose::Pose;
use crate::scheduler::TaskStatus;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Status { source: String, message: String },
    /// Percentage of executed steps over the whole run, 0..=100.
    Progress { robot: String, percent: f64 },
    PoseChanged { robot: String, pose: Pose },
    RunFinished { robot: String, state: RunState },
    ConnectionLost { robot: String, reason: String },
    TaskStatus { task_id: Uuid, robot: String, status: TaskStatus },
    Failure { source: String, error: RoarmError },
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Status { source, message } => write!(f, "[{}] {}", source, message),
            Notification::Progress { robot, percent } => write!(f, "[{}] progress {:.0}%", robot, percent),
            Notification::PoseChanged { robot, pose } => write!(f, "[{}] {}", robot, pose),
            Notification::RunFinished { robot, state } => write!(f, "[{}] run {}", robot, state),
            Notification::ConnectionLost { robot, reason } => {
                write!(f, "[{}] connection lost: {}", robot, reason)
            }
            Notification::TaskStatus { task_id, robot, status } => {
                write!(f, "[scheduler] task {} ({}): {}", task_id, robot, status)
            }
            Notification::Failure { source, error } => write!(f, "[{}] {}", source, error),
        }
    }
}

/// Producer half. Cheap to clone, one per worker.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Sender<Notification>,
}

/// Create a channel holding at most `capacity` undelivered notifications.
pub fn channel(capacity: usize) -> (Notifier, NotificationReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    (Notifier { tx }, NotificationReceiver { rx })
}

impl Notifier {
    pub fn send(&self, notification: Notification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                warn!(target: "notifications", "Notification buffer full (consumer falling behind) - dropping: {}", n);
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(target: "notifications", "No consumer attached, notification discarded");
            }
        }
    }

    pub fn status(&self, source: &str, message: impl Into<String>) {
        self.send(Notification::Status {
            source: source.to_string(),
            message: message.into(),
        });
    }

    pub fn failure(&self, source: &str, error: RoarmError) {
        self.send(Notification::Failure {
            source: source.to_string(),
            error,
        });
    }
}

/// Consumer half. Not cloneable: there is exactly one consumer.
#[derive(Debug)]
pub struct NotificationReceiver {
    rx: Receiver<Notification>,
}

impl NotificationReceiver {
    /// Everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<Notification> {
        self.rx.try_iter().collect()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Notification> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Deliver notifications to `handler` until `running` is cleared or every
    /// notifier has been dropped. Waits at most `poll_interval` between checks.
    pub fn run<F>(&self, poll_interval: Duration, running: &AtomicBool, mut handler: F)
    where
        F: FnMut(Notification),
    {
        while running.load(Ordering::Relaxed) {
            match self.rx.recv_timeout(poll_interval) {
                Ok(n) => {
                    handler(n);
                    for n in self.rx.try_iter() {
                        handler(n);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivered_in_emission_order() {
        let (notifier, receiver) = channel(16);
        for i in 0..5 {
            notifier.status("test", format!("msg {}", i));
        }
        let got: Vec<String> = receiver.drain().into_iter().map(|n| n.to_string()).collect();
        assert_eq!(got, (0..5).map(|i| format!("[test] msg {}", i)).collect::<Vec<_>>());
        assert!(receiver.drain().is_empty());
    }

    #[test]
    fn full_buffer_drops_instead_of_blocking() {
        let (notifier, receiver) = channel(2);
        for i in 0..10 {
            notifier.status("test", i.to_string());
        }
        assert_eq!(receiver.drain().len(), 2);
    }

    #[test]
    fn run_stops_when_producers_gone() {
        let (notifier, receiver) = channel(8);
        let running = AtomicBool::new(true);
        let worker = std::thread::spawn(move || {
            notifier.status("w", "one");
            notifier.status("w", "two");
        });
        worker.join().unwrap();
        let mut seen = Vec::new();
        receiver.run(Duration::from_millis(10), &running, |n| seen.push(n));
        assert_eq!(seen.len(), 2);
    }
}
