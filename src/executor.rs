//! Mission execution engine.
//!
//! A run walks the steps in order, `repetitions` times, on its own worker
//! thread. Movement completion is estimated, not awaited: the controller has
//! no "motion finished" reply, so after sending a move the run sleeps for a
//! settle time derived from the distance and speed, then commits the target
//! pose.
//!
//! Cancellation is cooperative and takes effect at step boundaries. A movement
//! always waits out its full settle time and commits its pose, so cancelling
//! never leaves the stored pose behind the arm. The one exception is a `Delay`
//! step: it sends nothing and moves nothing, so a cancel wakes it early
//! instead of holding the run for an operator-chosen number of milliseconds.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::device_link::CommandSink;
use crate::errors::{Result, RoarmError};
use crate::notifications::{Notification, Notifier};
use crate::pose::{Pose, PoseStore};
use crate::step::{MissionStep, MoveTarget, StepCommand};

/// Settle-time tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub distance_scale: f64,
    pub speed_scale: f64,
    /// Seconds.
    pub base_delay_s: f64,
    /// Seconds.
    pub max_delay_s: f64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            distance_scale: 100.0,
            speed_scale: 1.0,
            base_delay_s: 0.5,
            max_delay_s: 2.0,
        }
    }
}

impl Timing {
    pub fn validate(&self) -> Result<()> {
        if !(self.distance_scale > 0.0) {
            return Err(RoarmError::Validation("distance_scale must be > 0".to_string()));
        }
        if !(self.speed_scale >= 0.0) {
            return Err(RoarmError::Validation("speed_scale must be >= 0".to_string()));
        }
        if !(self.base_delay_s >= 0.0) || !(self.max_delay_s >= self.base_delay_s) || !self.max_delay_s.is_finite() {
            return Err(RoarmError::Validation(
                "delays must satisfy 0 <= base_delay_s <= max_delay_s".to_string(),
            ));
        }
        Ok(())
    }

    /// `min(maxAxisDelta / distance_scale * (speed_scale / spd) + base_delay, max_delay)`
    pub fn settle_time(&self, from: &Pose, target: &MoveTarget) -> Duration {
        let to = Pose::new(target.x, target.y, target.z, target.t);
        let delta = from.max_axis_delta(&to);
        let secs = (delta / self.distance_scale) * (self.speed_scale / target.spd) + self.base_delay_s;
        let secs = if secs.is_finite() { secs.min(self.max_delay_s) } else { self.max_delay_s };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed(String),
}

impl RunState {
    pub fn is_finished(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Cancelled | RunState::Failed(_))
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Running => write!(f, "running"),
            RunState::Completed => write!(f, "completed"),
            RunState::Cancelled => write!(f, "cancelled"),
            RunState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub state: RunState,
    pub executed_steps: usize,
    pub total_steps: usize,
}

/// State shared between a run's worker, its handle and the engine.
#[derive(Debug)]
struct RunControl {
    cancel: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    state: Mutex<RunState>,
}

impl RunControl {
    fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            cancel: AtomicBool::new(false),
            wake_tx,
            wake_rx,
            state: Mutex::new(RunState::Running),
        }
    }

    fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        let _ = self.wake_tx.try_send(());
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Sleep for `duration` unless cancelled first. Only used for delays.
    fn wait_interruptible(&self, duration: Duration) {
        if self.is_cancelled() {
            return;
        }
        let _ = self.wake_rx.recv_timeout(duration);
    }

    fn state(&self) -> RunState {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }
}

/// Handle to one run. Dropping it does not stop the run.
#[derive(Debug)]
pub struct RunHandle {
    control: Arc<RunControl>,
    worker: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn state(&self) -> RunState {
        self.control.state()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Block until the run ends.
    pub fn wait(self) -> RunReport {
        match self.worker.join() {
            Ok(report) => report,
            Err(_) => {
                let state = RunState::Failed("run worker panicked".to_string());
                self.control.set_state(state.clone());
                RunReport {
                    state,
                    executed_steps: 0,
                    total_steps: 0,
                }
            }
        }
    }
}

/// Runs missions for one robot, at most one at a time.
pub struct ExecutionEngine {
    robot: String,
    sink: Arc<dyn CommandSink>,
    pose: PoseStore,
    notifier: Notifier,
    timing: Timing,
    current: Mutex<Option<Arc<RunControl>>>,
}

impl ExecutionEngine {
    pub fn new(robot: &str, sink: Arc<dyn CommandSink>, pose: PoseStore, notifier: Notifier, timing: Timing) -> Self {
        Self {
            robot: robot.to_string(),
            sink,
            pose,
            notifier,
            timing,
            current: Mutex::new(None),
        }
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    /// Last run's state, `Idle` if nothing has run yet.
    pub fn state(&self) -> RunState {
        match self.current.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            Some(control) => control.state(),
            None => RunState::Idle,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// Cancel the active run, if any. Idempotent.
    pub fn cancel(&self) {
        if let Some(control) = self.current.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            if control.state() == RunState::Running {
                info!(target: "executor", "[{}] Cancelling run", self.robot);
                control.cancel();
            }
        }
    }

    /// Start running `steps` `repetitions` times on a new worker.
    pub fn run(&self, steps: Vec<MissionStep>, repetitions: usize) -> Result<RunHandle> {
        if repetitions == 0 {
            return Err(RoarmError::Validation("repetitions must be >= 1".to_string()));
        }
        for step in &steps {
            step.validate()?;
        }
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(active) = current.as_ref() {
            if active.state() == RunState::Running {
                return Err(RoarmError::RunAlreadyActive);
            }
        }
        let control = Arc::new(RunControl::new());
        *current = Some(Arc::clone(&control));
        drop(current);

        info!(
            target: "executor",
            "[{}] Starting run: {} steps x {} repetitions",
            self.robot,
            steps.len(),
            repetitions
        );
        self.notifier.send(Notification::Progress {
            robot: self.robot.clone(),
            percent: 0.0,
        });

        let worker = Worker {
            robot: self.robot.clone(),
            sink: Arc::clone(&self.sink),
            pose: self.pose.clone(),
            notifier: self.notifier.clone(),
            timing: self.timing,
            control: Arc::clone(&control),
        };
        let handle = thread::Builder::new()
            .name(format!("run-{}", self.robot))
            .spawn(move || worker.execute(&steps, repetitions))
            .map_err(|e| {
                control.set_state(RunState::Failed(e.to_string()));
                RoarmError::Validation(format!("could not start run worker: {}", e))
            })?;
        Ok(RunHandle { control, worker: handle })
    }

    pub fn run_blocking(&self, steps: Vec<MissionStep>, repetitions: usize) -> Result<RunReport> {
        Ok(self.run(steps, repetitions)?.wait())
    }

    /// Execute one step as its own run.
    pub fn play_step(&self, step: MissionStep) -> Result<RunHandle> {
        self.run(vec![step], 1)
    }
}

struct Worker {
    robot: String,
    sink: Arc<dyn CommandSink>,
    pose: PoseStore,
    notifier: Notifier,
    timing: Timing,
    control: Arc<RunControl>,
}

impl Worker {
    fn execute(&self, steps: &[MissionStep], repetitions: usize) -> RunReport {
        let total_steps = steps.len() * repetitions;
        let mut executed_steps = 0usize;
        let outcome = self.execute_all(steps, repetitions, total_steps, &mut executed_steps);
        let state = match outcome {
            Ok(true) => {
                self.progress(100.0);
                info!(target: "executor", "[{}] Run completed ({} steps)", self.robot, executed_steps);
                RunState::Completed
            }
            Ok(false) => {
                info!(target: "executor", "[{}] Run cancelled after {} of {} steps", self.robot, executed_steps, total_steps);
                RunState::Cancelled
            }
            Err(e) => {
                error!(target: "executor", "[{}] Run failed after {} steps: {}", self.robot, executed_steps, e);
                self.notifier.failure(&self.robot, e.clone());
                RunState::Failed(e.to_string())
            }
        };
        self.control.set_state(state.clone());
        self.notifier.send(Notification::RunFinished {
            robot: self.robot.clone(),
            state: state.clone(),
        });
        RunReport {
            state,
            executed_steps,
            total_steps,
        }
    }

    /// `Ok(true)` when every step ran, `Ok(false)` when cancelled.
    fn execute_all(
        &self,
        steps: &[MissionStep],
        repetitions: usize,
        total_steps: usize,
        executed_steps: &mut usize,
    ) -> Result<bool> {
        for _ in 0..repetitions {
            for step in steps {
                if self.control.is_cancelled() {
                    return Ok(false);
                }
                self.execute_step(step)?;
                *executed_steps += 1;
                self.progress(*executed_steps as f64 / total_steps as f64 * 100.0);
            }
        }
        Ok(true)
    }

    fn execute_step(&self, step: &MissionStep) -> Result<()> {
        match &step.command {
            StepCommand::Movement(target) => {
                let settle = self.timing.settle_time(&self.pose.read(), target);
                self.sink.send_async(&step.to_frame())?;
                thread::sleep(settle);
                let pose = self.pose.update(|p| {
                    p.x = target.x;
                    p.y = target.y;
                    p.z = target.z;
                    p.t = target.t;
                });
                self.notifier.send(Notification::PoseChanged {
                    robot: self.robot.clone(),
                    pose,
                });
            }
            StepCommand::Delay { ms } => {
                self.control.wait_interruptible(Duration::from_millis((*ms).max(0) as u64));
            }
            StepCommand::Other(frame) => {
                warn!(target: "executor", "[{}] Sending unrecognized step T={}", self.robot, frame.code());
                self.sink.send_async(frame)?;
            }
            _ => {
                self.sink.send_async(&step.to_frame())?;
            }
        }
        Ok(())
    }

    fn progress(&self, percent: f64) {
        self.notifier.send(Notification::Progress {
            robot: self.robot.clone(),
            percent,
        });
    }
}
