//! Time-of-day mission scheduler.
//!
//! Each task gets its own monitor thread that waits for the task's next
//! trigger, runs the mission file once on the task's robot and, for `Daily`
//! and `Weekly` tasks, goes back to waiting. Waiting goes through a [`Clock`]
//! so it can be interrupted (task deleted, schedule reloaded) and replaced in
//! tests.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device_link::join_bounded;
use crate::errors::{Result, RoarmError};
use crate::executor::{RunReport, RunState};
use crate::mission::Mission;
use crate::notifications::{Notification, Notifier};

/// 12-hour wall clock, e.g. `09:30:00 PM`.
pub const TIME_FORMAT: &str = "%I:%M:%S %p";

pub fn parse_time_of_day(text: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(text.trim(), TIME_FORMAT).map_err(|_| RoarmError::InvalidTimeFormat(text.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Recurrence {
    #[default]
    Once,
    Daily,
    Weekly,
}

impl Recurrence {
    fn period(&self) -> Option<TimeDelta> {
        match self {
            Recurrence::Once => None,
            Recurrence::Daily => Some(TimeDelta::days(1)),
            Recurrence::Weekly => Some(TimeDelta::weeks(1)),
        }
    }
}

impl std::str::FromStr for Recurrence {
    type Err = RoarmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(Recurrence::Once),
            "daily" => Ok(Recurrence::Daily),
            "weekly" => Ok(Recurrence::Weekly),
            other => Err(RoarmError::Validation(format!("unknown recurrence '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    #[serde(rename = "Time Passed")]
    TimePassed,
    #[serde(rename = "Invalid Time Format")]
    InvalidTimeFormat,
    #[serde(rename = "Unknown Robot")]
    UnknownRobot,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Running => "Running",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
            TaskStatus::TimePassed => "Time Passed",
            TaskStatus::InvalidTimeFormat => "Invalid Time Format",
            TaskStatus::UnknownRobot => "Unknown Robot",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub robot: String,
    pub mission_file: PathBuf,
    #[serde(default = "midnight")]
    pub scheduled_time: String,
    #[serde(default)]
    pub recurrence: Recurrence,
    #[serde(default)]
    pub status: TaskStatus,
}

fn midnight() -> String {
    "12:00:00 AM".to_string()
}

/// Next moment `time` should fire, or `None` for a `Once` task whose time has
/// already passed today.
///
/// A recurring task fires today if the time is still ahead, otherwise one
/// period later. `last` is the previous trigger; the result is always strictly
/// after it, so a daily task fires exactly every 24 hours.
pub fn next_trigger(
    now: NaiveDateTime,
    time: NaiveTime,
    recurrence: Recurrence,
    last: Option<NaiveDateTime>,
) -> Option<NaiveDateTime> {
    let mut candidate = now.date().and_time(time);
    let Some(period) = recurrence.period() else {
        return if candidate < now { None } else { Some(candidate) };
    };
    if candidate < now {
        candidate += period;
    }
    if let Some(last) = last {
        while candidate <= last {
            candidate += period;
        }
    }
    Some(candidate)
}

/// Wall clock used by the monitors.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    /// Block until `deadline`. Returns `false` if `cancel` fired (or its
    /// sender was dropped) first.
    fn sleep_until(&self, deadline: NaiveDateTime, cancel: &Receiver<()>) -> bool;
}

/// Local time of the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn sleep_until(&self, deadline: NaiveDateTime, cancel: &Receiver<()>) -> bool {
        loop {
            let remaining = deadline - self.now();
            let Ok(remaining) = remaining.to_std() else {
                return true;
            };
            if remaining.is_zero() {
                return true;
            }
            // Re-check the wall clock at least once a minute in case it jumps.
            match cancel.recv_timeout(remaining.min(Duration::from_secs(60))) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }
}

/// Where scheduled missions are sent.
pub trait MissionRunner: Send + Sync {
    fn has_robot(&self, robot: &str) -> bool;

    /// Run `mission` to completion on `robot`.
    fn run_mission(&self, robot: &str, mission: Mission, repetitions: usize) -> Result<RunReport>;
}

struct Monitor {
    // Dropping the sender cancels the monitor's wait.
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

/// Tasks plus the token of the monitor that currently owns each one.
///
/// A monitor may only write to a task while its token is registered. Load and
/// delete drop the tokens under the same lock, so a monitor that outlived its
/// cancellation (for example one stuck in a long run) can no longer touch the
/// collection.
#[derive(Default)]
struct Registry {
    tasks: Vec<ScheduledTask>,
    owners: HashMap<Uuid, u64>,
    next_token: u64,
}

impl Registry {
    fn owns(&self, id: Uuid, token: u64) -> bool {
        self.owners.get(&id) == Some(&token)
    }
}

#[derive(Clone)]
struct Shared {
    runner: Arc<dyn MissionRunner>,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    registry: Arc<Mutex<Registry>>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn task(&self, id: Uuid) -> Option<ScheduledTask> {
        self.registry().tasks.iter().find(|t| t.id == id).cloned()
    }

    fn owned_task(&self, id: Uuid, token: u64) -> Option<ScheduledTask> {
        let registry = self.registry();
        if !registry.owns(id, token) {
            return None;
        }
        registry.tasks.iter().find(|t| t.id == id).cloned()
    }

    /// Store and publish `status`. With a token the write only happens while
    /// that monitor still owns the task; returns whether it was written.
    fn set_status(&self, id: Uuid, token: Option<u64>, status: TaskStatus) -> bool {
        let robot = {
            let mut registry = self.registry();
            if let Some(token) = token {
                if !registry.owns(id, token) {
                    return false;
                }
            }
            let Some(task) = registry.tasks.iter_mut().find(|t| t.id == id) else {
                return false;
            };
            task.status = status;
            task.robot.clone()
        };
        info!(target: "scheduler", "Task {} ({}): {}", id, robot, status);
        self.notifier.send(Notification::TaskStatus {
            task_id: id,
            robot,
            status,
        });
        true
    }
}

pub struct Scheduler {
    shared: Shared,
    monitors: Mutex<HashMap<Uuid, Monitor>>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn MissionRunner>, clock: Arc<dyn Clock>, notifier: Notifier) -> Self {
        Self {
            shared: Shared {
                runner,
                clock,
                notifier,
                registry: Arc::new(Mutex::new(Registry::default())),
            },
            monitors: Mutex::new(HashMap::new()),
        }
    }

    pub fn tasks(&self) -> Vec<ScheduledTask> {
        self.shared.registry().tasks.clone()
    }

    pub fn task(&self, id: Uuid) -> Option<ScheduledTask> {
        self.shared.task(id)
    }

    /// Number of monitors still waiting or running.
    pub fn active_monitors(&self) -> usize {
        let monitors = self.monitors.lock().unwrap_or_else(|p| p.into_inner());
        monitors.values().filter(|m| !m.handle.is_finished()).count()
    }

    /// Validate and schedule a new task. Returns its id.
    pub fn add_task(&self, robot: &str, mission_file: &Path, time: &str, recurrence: Recurrence) -> Result<Uuid> {
        let parsed = parse_time_of_day(time)?;
        if !mission_file.is_file() {
            return Err(RoarmError::File(format!("{} is not a mission file", mission_file.display())));
        }
        let task = ScheduledTask {
            id: Uuid::new_v4(),
            robot: robot.to_string(),
            mission_file: mission_file.to_path_buf(),
            scheduled_time: parsed.format(TIME_FORMAT).to_string(),
            recurrence,
            status: TaskStatus::Pending,
        };
        let id = task.id;
        info!(
            target: "scheduler",
            "Scheduled {} for {} at {} ({:?})",
            task.mission_file.display(),
            task.robot,
            task.scheduled_time,
            task.recurrence
        );
        self.shared.registry().tasks.push(task);
        self.start_monitor(id);
        Ok(id)
    }

    /// Remove a task that is not currently running, cancelling its monitor.
    pub fn delete_task(&self, id: Uuid) -> Result<ScheduledTask> {
        let removed = {
            let mut registry = self.shared.registry();
            let pos = registry
                .tasks
                .iter()
                .position(|t| t.id == id)
                .ok_or_else(|| RoarmError::Validation(format!("no scheduled task {}", id)))?;
            if registry.tasks[pos].status == TaskStatus::Running {
                return Err(RoarmError::Validation("cannot delete a running task".to_string()));
            }
            registry.owners.remove(&id);
            registry.tasks.remove(pos)
        };
        // Detached: the monitor exits as soon as its wait is interrupted, and
        // without its token it can no longer start a run.
        if let Some(monitor) = self.monitors.lock().unwrap_or_else(|p| p.into_inner()).remove(&id) {
            drop(monitor.cancel);
        }
        info!(target: "scheduler", "Deleted task {} ({} at {})", id, removed.robot, removed.scheduled_time);
        Ok(removed)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tasks = self.tasks();
        let text = serde_json::to_string_pretty(&tasks)?;
        fs::write(path, text).map_err(|e| RoarmError::File(format!("{}: {}", path.display(), e)))?;
        info!(target: "scheduler", "Saved {} tasks to {}", tasks.len(), path.display());
        Ok(())
    }

    /// Replace the whole collection with the file's. On failure nothing changes.
    pub fn load(&self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path).map_err(|e| RoarmError::File(format!("{}: {}", path.display(), e)))?;
        let mut loaded: Vec<ScheduledTask> =
            serde_json::from_str(&text).map_err(|e| RoarmError::File(format!("{}: {}", path.display(), e)))?;
        for task in loaded.iter_mut() {
            // Nothing is running any more; the run it refers to was interrupted.
            if task.status == TaskStatus::Running {
                warn!(target: "scheduler", "Task {} was saved while running, marking it failed", task.id);
                task.status = TaskStatus::Failed;
            }
        }

        // Revoke ownership first: a monitor that does not stop in time must
        // not write into the collection that replaces its own.
        self.shared.registry().owners.clear();
        self.stop_monitors();
        let pending: Vec<Uuid> = loaded
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.id)
            .collect();
        {
            let mut registry = self.shared.registry();
            registry.tasks = loaded;
        }
        for id in &pending {
            self.start_monitor(*id);
        }
        info!(target: "scheduler", "Loaded schedule from {} ({} pending)", path.display(), pending.len());
        Ok(())
    }

    /// Cancel every monitor and wait briefly for them.
    pub fn shutdown(&self) {
        self.shared.registry().owners.clear();
        self.stop_monitors();
    }

    fn stop_monitors(&self) {
        let monitors: Vec<(Uuid, Monitor)> = self
            .monitors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .collect();
        for (id, monitor) in monitors {
            drop(monitor.cancel);
            join_bounded("scheduler", &id.to_string(), "monitor", Some(monitor.handle), Duration::from_secs(2));
        }
    }

    fn start_monitor(&self, id: Uuid) {
        let token = {
            let mut registry = self.shared.registry();
            registry.next_token += 1;
            let token = registry.next_token;
            registry.owners.insert(id, token);
            token
        };
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("schedule-{}", id))
            .spawn(move || monitor(&shared, id, token, &cancel_rx));
        match spawned {
            Ok(handle) => {
                let mut monitors = self.monitors.lock().unwrap_or_else(|p| p.into_inner());
                monitors.retain(|_, m| !m.handle.is_finished());
                monitors.insert(id, Monitor { cancel: cancel_tx, handle });
            }
            Err(e) => {
                error!(target: "scheduler", "Could not start monitor for task {}: {}", id, e);
                self.shared.registry().owners.remove(&id);
                self.shared.set_status(id, None, TaskStatus::Failed);
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn monitor(shared: &Shared, id: Uuid, token: u64, cancel: &Receiver<()>) {
    let mut last_trigger: Option<NaiveDateTime> = None;
    // Every write below is refused once the task is deleted or reloaded.
    let set = |status| shared.set_status(id, Some(token), status);
    loop {
        let Some(task) = shared.owned_task(id, token) else { return };
        let time = match parse_time_of_day(&task.scheduled_time) {
            Ok(time) => time,
            Err(e) => {
                warn!(target: "scheduler", "Task {}: {}", id, e);
                set(TaskStatus::InvalidTimeFormat);
                return;
            }
        };
        let now = shared.clock.now();
        let Some(target) = next_trigger(now, time, task.recurrence, last_trigger) else {
            set(TaskStatus::TimePassed);
            return;
        };
        info!(target: "scheduler", "Task {} for {} fires at {}", id, task.robot, target);
        if !shared.clock.sleep_until(target, cancel) {
            info!(target: "scheduler", "Task {} monitor cancelled", id);
            return;
        }
        last_trigger = Some(target);
        // Claiming Running is atomic with the ownership check, so a task
        // deleted during the wait never runs.
        if !set(TaskStatus::Running) {
            info!(target: "scheduler", "Task {} was removed before it fired", id);
            return;
        }

        if !shared.runner.has_robot(&task.robot) {
            shared.notifier.failure("scheduler", RoarmError::UnknownRobot(task.robot.clone()));
            set(TaskStatus::UnknownRobot);
            return;
        }
        let mission = match Mission::load(&task.mission_file) {
            Ok(mission) => mission,
            Err(e) => {
                error!(target: "scheduler", "Task {}: {}", id, e);
                shared.notifier.failure("scheduler", e);
                set(TaskStatus::Failed);
                return;
            }
        };
        info!(target: "scheduler", "Task {}: running '{}' on {}", id, mission.name, task.robot);
        let finished = match shared.runner.run_mission(&task.robot, mission, 1) {
            Ok(report) if report.state == RunState::Completed => TaskStatus::Completed,
            Ok(report) => {
                warn!(target: "scheduler", "Task {}: run ended {}", id, report.state);
                TaskStatus::Failed
            }
            Err(e) => {
                error!(target: "scheduler", "Task {}: {}", id, e);
                shared.notifier.failure("scheduler", e);
                TaskStatus::Failed
            }
        };
        if !set(finished) {
            warn!(target: "scheduler", "Task {} was replaced while its run was in progress; result {} discarded", id, finished);
            return;
        }
        if finished != TaskStatus::Completed || task.recurrence == Recurrence::Once {
            return;
        }
        if !set(TaskStatus::Pending) {
            return;
        }
    }
}
