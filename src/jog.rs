//! Manual single-axis jogging.
//!
//! While a jog is active a worker nudges one axis by a fixed delta every tick
//! and sends a full-pose move. Each tick reads, modifies and commits the pose
//! in one pose-store update, so a jog never tears a pose written by a mission
//! run or by telemetry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info};

use crate::device_link::{join_bounded, CommandSink};
use crate::errors::{Result, RoarmError};
use crate::notifications::{Notification, Notifier};
use crate::pose::{Axis, PoseStore};
use crate::step::{MissionStep, DEFAULT_ACC, DEFAULT_SPD};

#[derive(Debug, Clone, Copy)]
pub struct JogSettings {
    pub spd: f64,
    pub acc: f64,
    pub interval: Duration,
    pub join_timeout: Duration,
}

impl Default for JogSettings {
    fn default() -> Self {
        Self {
            spd: DEFAULT_SPD,
            acc: DEFAULT_ACC,
            interval: Duration::from_millis(50),
            join_timeout: Duration::from_secs(2),
        }
    }
}

struct ActiveJog {
    axis: Axis,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct JogController {
    robot: String,
    sink: Arc<dyn CommandSink>,
    pose: PoseStore,
    notifier: Notifier,
    settings: Mutex<JogSettings>,
    active: Mutex<Option<ActiveJog>>,
}

impl JogController {
    pub fn new(robot: &str, sink: Arc<dyn CommandSink>, pose: PoseStore, notifier: Notifier, settings: JogSettings) -> Self {
        Self {
            robot: robot.to_string(),
            sink,
            pose,
            notifier,
            settings: Mutex::new(settings),
            active: Mutex::new(None),
        }
    }

    /// Speed and acceleration used by subsequent jogs.
    pub fn set_motion(&self, spd: f64, acc: f64) {
        let mut settings = self.settings.lock().unwrap_or_else(|p| p.into_inner());
        settings.spd = spd;
        settings.acc = acc;
    }

    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|jog| !jog.handle.is_finished())
            .unwrap_or(false)
    }

    /// Replace any running jog with one moving `axis` by `delta` per tick.
    ///
    /// The slot stays locked from stopping the old worker until the new one
    /// is stored, so concurrent callers are serialised and every worker ever
    /// spawned is reachable by `stop`.
    pub fn start(&self, axis: Axis, delta: f64) -> Result<()> {
        if !delta.is_finite() {
            return Err(RoarmError::Validation(format!("jog delta must be finite, got {}", delta)));
        }
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        self.stop_worker(active.take());

        let settings = *self.settings.lock().unwrap_or_else(|p| p.into_inner());
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let robot = self.robot.clone();
            let sink = Arc::clone(&self.sink);
            let pose = self.pose.clone();
            let notifier = self.notifier.clone();
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("jog-{}", self.robot))
                .spawn(move || jog_loop(&robot, axis, delta, settings, sink.as_ref(), &pose, &notifier, &stop))
                .map_err(|e| RoarmError::Validation(format!("could not start jog worker: {}", e)))?
        };
        info!(target: "jog", "[{}] Jogging {:?} by {} every {:?}", self.robot, axis, delta, settings.interval);
        *active = Some(ActiveJog { axis, stop, handle: worker });
        Ok(())
    }

    /// Stop the active jog and wait for its worker. No-op when idle.
    pub fn stop(&self) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        self.stop_worker(active.take());
    }

    fn stop_worker(&self, jog: Option<ActiveJog>) {
        let Some(jog) = jog else { return };
        jog.stop.store(true, Ordering::Relaxed);
        let timeout = self.settings.lock().unwrap_or_else(|p| p.into_inner()).join_timeout;
        join_bounded("jog", &self.robot, "jog worker", Some(jog.handle), timeout);
        info!(target: "jog", "[{}] Stopped jogging {:?}", self.robot, jog.axis);
    }
}

impl Drop for JogController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn jog_loop(
    robot: &str,
    axis: Axis,
    delta: f64,
    settings: JogSettings,
    sink: &dyn CommandSink,
    pose: &PoseStore,
    notifier: &Notifier,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Relaxed) {
        // The move is only committed if it was handed to the link.
        let (current, sent) = pose.update_with(|p| {
            let mut next = *p;
            next.set(axis, next.get(axis) + delta);
            let step = MissionStep::movement(next.x, next.y, next.z, next.t, settings.spd, settings.acc);
            let sent = sink.send_async(&step.to_frame());
            if sent.is_ok() {
                *p = next;
            }
            sent
        });
        if let Err(e) = sent {
            error!(target: "jog", "[{}] Jog stopped: {}", robot, e);
            notifier.failure(robot, e);
            return;
        }
        notifier.send(Notification::PoseChanged {
            robot: robot.to_string(),
            pose: current,
        });
        thread::sleep(settings.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_link::RecordingSink;
    use crate::frame::{codes, Frame};
    use crate::notifications;
    use crate::pose::Pose;
    use serde_json::Value;

    fn controller(sink: Arc<dyn CommandSink>, pose: PoseStore) -> (JogController, notifications::NotificationReceiver) {
        let (notifier, rx) = notifications::channel(1024);
        let settings = JogSettings {
            interval: Duration::from_millis(5),
            ..JogSettings::default()
        };
        (JogController::new("arm", sink, pose, notifier, settings), rx)
    }

    #[test]
    fn jog_moves_one_axis_and_sends_full_pose() {
        let sink = RecordingSink::new();
        let pose = PoseStore::new(Pose::new(0.0, 0.0, 0.0, 0.0));
        let (jog, _rx) = controller(Arc::new(sink.clone()), pose.clone());
        jog.start(Axis::Z, 3.0).unwrap();
        thread::sleep(Duration::from_millis(50));
        jog.stop();
        assert!(!jog.is_active());

        let frames = sink.frames();
        assert!(!frames.is_empty());
        let p = pose.read();
        assert_eq!(p.z, 3.0 * frames.len() as f64);
        assert_eq!((p.x, p.y, p.t), (0.0, 0.0, 0.0));
        let last = frames.last().unwrap();
        assert_eq!(last.code(), codes::MOVE);
        assert_eq!(last.get("z").and_then(Value::as_f64), Some(p.z));
        assert_eq!(last.get("spd").and_then(Value::as_f64), Some(DEFAULT_SPD));

        // Nothing more is sent once stopped.
        let count = sink.frames().len();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sink.frames().len(), count);
    }

    #[test]
    fn start_replaces_running_jog_and_stop_is_idempotent() {
        let sink = RecordingSink::new();
        let pose = PoseStore::new(Pose::new(0.0, 0.0, 0.0, 0.0));
        let (jog, _rx) = controller(Arc::new(sink.clone()), pose.clone());
        jog.stop();
        jog.start(Axis::X, 1.0).unwrap();
        thread::sleep(Duration::from_millis(20));
        jog.start(Axis::Y, -1.0).unwrap();
        thread::sleep(Duration::from_millis(20));
        jog.stop();
        jog.stop();
        let p = pose.read();
        assert!(p.x > 0.0);
        assert!(p.y < 0.0);
        assert!(jog.start(Axis::T, f64::NAN).is_err());
    }

    #[test]
    fn concurrent_starts_leave_one_stoppable_worker() {
        for _ in 0..20 {
            let sink = RecordingSink::new();
            let pose = PoseStore::new(Pose::new(0.0, 0.0, 0.0, 0.0));
            let (jog, _rx) = controller(Arc::new(sink.clone()), pose.clone());
            let jog = Arc::new(jog);

            let starters: Vec<_> = (0..4)
                .map(|_| {
                    let jog = Arc::clone(&jog);
                    thread::spawn(move || jog.start(Axis::X, 1.0).unwrap())
                })
                .collect();
            for starter in starters {
                starter.join().unwrap();
            }
            thread::sleep(Duration::from_millis(10));
            jog.stop();
            assert!(!jog.is_active());

            let sent = sink.frames().len();
            let x = pose.read().x;
            thread::sleep(Duration::from_millis(20));
            assert_eq!(sink.frames().len(), sent);
            assert_eq!(pose.read().x, x);
        }
    }

    struct BrokenSink;

    impl CommandSink for BrokenSink {
        fn send_async(&self, _frame: &Frame) -> Result<()> {
            Err(RoarmError::Connection("gone".to_string()))
        }
    }

    #[test]
    fn send_failure_ends_jog_without_moving() {
        let pose = PoseStore::new(Pose::new(1.0, 1.0, 1.0, 1.0));
        let (jog, rx) = controller(Arc::new(BrokenSink), pose.clone());
        jog.start(Axis::X, 5.0).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(!jog.is_active());
        jog.stop();
        assert_eq!(pose.read(), Pose::new(1.0, 1.0, 1.0, 1.0));
        assert!(rx.drain().iter().any(|n| matches!(n, Notification::Failure { .. })));
    }
}
