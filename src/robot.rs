//! Per-robot controller and the fleet of robots.
//!
//! [`Robot`] is what an operator surface talks to. Command actions (suction,
//! torque, dynamic adaptation, ...) are sent live and, when a mission is
//! selected, also recorded into it as steps.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{error, info, warn};

use crate::config_loader::Config;
use crate::device_link::{CommandSink, DeviceLink, LinkSettings};
use crate::errors::{Result, RoarmError};
use crate::executor::{ExecutionEngine, RunHandle, RunReport, RunState, Timing};
use crate::frame::Frame;
use crate::jog::{JogController, JogSettings};
use crate::mission::{Mission, MissionModel};
use crate::notifications::Notifier;
use crate::pose::{Axis, Pose, PoseStore};
use crate::scheduler::MissionRunner;
use crate::step::{AdaptationParams, MissionStep};

#[derive(Debug, Clone, Copy)]
pub struct RobotSettings {
    pub startup_pose: Pose,
    pub default_spd: f64,
    pub default_acc: f64,
    pub timing: Timing,
    pub jog: JogSettings,
}

impl Default for RobotSettings {
    fn default() -> Self {
        let jog = JogSettings::default();
        Self {
            startup_pose: Pose::STARTUP,
            default_spd: jog.spd,
            default_acc: jog.acc,
            timing: Timing::default(),
            jog,
        }
    }
}

impl From<&Config> for RobotSettings {
    fn from(config: &Config) -> Self {
        Self {
            startup_pose: config.motion.startup_pose,
            default_spd: config.motion.default_spd,
            default_acc: config.motion.default_acc,
            timing: config.timing,
            jog: config.jog_settings(),
        }
    }
}

/// Stand-in sink for a robot whose port could not be opened.
struct Offline {
    reason: String,
}

impl CommandSink for Offline {
    fn send_async(&self, _frame: &Frame) -> Result<()> {
        Err(RoarmError::Connection(self.reason.clone()))
    }
}

#[derive(Debug, Clone, Copy)]
struct Motion {
    spd: f64,
    acc: f64,
}

pub struct Robot {
    name: String,
    sink: Arc<dyn CommandSink>,
    pose: PoseStore,
    missions: Mutex<MissionModel>,
    engine: ExecutionEngine,
    jog: JogController,
    notifier: Notifier,
    motion: Mutex<Motion>,
    startup_pose: Pose,
}

impl Robot {
    pub fn new(name: &str, sink: Arc<dyn CommandSink>, pose: PoseStore, settings: RobotSettings, notifier: Notifier) -> Self {
        let engine = ExecutionEngine::new(name, Arc::clone(&sink), pose.clone(), notifier.clone(), settings.timing);
        let jog_settings = JogSettings {
            spd: settings.default_spd,
            acc: settings.default_acc,
            ..settings.jog
        };
        let jog = JogController::new(name, Arc::clone(&sink), pose.clone(), notifier.clone(), jog_settings);
        Self {
            name: name.to_string(),
            sink,
            pose,
            missions: Mutex::new(MissionModel::new()),
            engine,
            jog,
            notifier,
            motion: Mutex::new(Motion {
                spd: settings.default_spd,
                acc: settings.default_acc,
            }),
            startup_pose: settings.startup_pose,
        }
    }

    /// Open the robot's serial port and move it to its startup pose.
    pub fn connect(name: &str, link: &LinkSettings, settings: RobotSettings, notifier: Notifier) -> Result<Self> {
        let pose = PoseStore::new(settings.startup_pose);
        let device = DeviceLink::connect(name, link, pose.clone(), notifier.clone())?;
        let robot = Self::new(name, Arc::new(device), pose, settings, notifier);
        robot.notifier.status(name, format!("Connected on {}", link.port));
        if let Err(e) = robot.move_to_current_pose() {
            warn!(target: "robot", "[{}] Initial move failed: {}", name, e);
        }
        Ok(robot)
    }

    /// A robot whose commands all fail with `Connection`. Missions can still
    /// be edited, saved and loaded.
    pub fn offline(name: &str, reason: &str, settings: RobotSettings, notifier: Notifier) -> Self {
        let sink = Arc::new(Offline {
            reason: format!("{}: {}", name, reason),
        });
        Self::new(name, sink, PoseStore::new(settings.startup_pose), settings, notifier)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pose(&self) -> Pose {
        self.pose.read()
    }

    pub fn pose_store(&self) -> &PoseStore {
        &self.pose
    }

    pub fn missions(&self) -> MutexGuard<'_, MissionModel> {
        self.missions.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn default_speed(&self) -> f64 {
        self.motion().spd
    }

    fn motion(&self) -> Motion {
        *self.motion.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn send(&self, frame: &Frame) -> Result<()> {
        self.sink.send_async(frame).map_err(|e| {
            error!(target: "robot", "[{}] Failed to send T={}: {}", self.name, frame.code(), e);
            self.notifier.failure(&self.name, e.clone());
            e
        })
    }

    /// Append to the selected mission if there is one.
    fn record(&self, step: MissionStep) -> Result<Option<usize>> {
        let mut missions = self.missions();
        if missions.selected_name().is_none() {
            return Ok(None);
        }
        missions.append(step).map(Some)
    }

    fn send_and_record(&self, step: MissionStep, what: &str) -> Result<()> {
        step.validate()?;
        self.send(&step.to_frame())?;
        if let Some(index) = self.record(step)? {
            info!(target: "robot", "[{}] {} recorded as step {}", self.name, what, index + 1);
        }
        self.notifier.status(&self.name, what.to_string());
        Ok(())
    }

    fn current_pose_step(&self) -> MissionStep {
        let p = self.pose.read();
        let motion = self.motion();
        MissionStep::movement(p.x, p.y, p.z, p.t, motion.spd, motion.acc)
    }

    pub fn request_pose(&self) -> Result<()> {
        self.send(&Frame::request_pose())
    }

    pub fn suction_on(&self) -> Result<()> {
        self.send_and_record(MissionStep::pwm(0, 255), "Suction on")
    }

    pub fn suction_off(&self) -> Result<()> {
        self.send_and_record(MissionStep::pwm(255, 0), "Suction off")
    }

    pub fn relay_off(&self) -> Result<()> {
        self.send_and_record(MissionStep::pwm(0, 0), "Relay off")
    }

    pub fn enable_torque(&self) -> Result<()> {
        self.send_and_record(MissionStep::torque(true), "Torque enabled")
    }

    pub fn disable_torque(&self) -> Result<()> {
        self.send_and_record(MissionStep::torque(false), "Torque disabled")
    }

    pub fn enable_dynamic_adaptation(&self) -> Result<()> {
        self.send_and_record(MissionStep::dynamic_adaptation(AdaptationParams::enabled()), "Dynamic adaptation enabled")
    }

    pub fn disable_dynamic_adaptation(&self) -> Result<()> {
        self.send_and_record(MissionStep::dynamic_adaptation(AdaptationParams::disabled()), "Dynamic adaptation disabled")
    }

    /// LED steps are recorded only.
    pub fn add_led_on_step(&self) -> Result<usize> {
        self.missions().append(MissionStep::led(255))
    }

    pub fn add_led_off_step(&self) -> Result<usize> {
        self.missions().append(MissionStep::led(0))
    }

    pub fn add_delay(&self, ms: i64) -> Result<usize> {
        self.missions().append(MissionStep::delay(ms))
    }

    /// Record a move to the current pose at the default speed.
    pub fn add_current_pose_step(&self) -> Result<usize> {
        let step = self.current_pose_step();
        self.missions().append(step)
    }

    /// Record a move to the current pose right after step `after`.
    pub fn insert_current_pose_step(&self, after: usize) -> Result<usize> {
        let step = self.current_pose_step();
        let mut missions = self.missions();
        let len = missions.selected()?.len();
        if after >= len {
            return Err(RoarmError::IndexOutOfRange { index: after, len });
        }
        missions.insert(after + 1, step)?;
        Ok(after + 1)
    }

    /// Replace step `index` with a move to the current pose.
    pub fn update_step_to_current_pose(&self, index: usize) -> Result<()> {
        let step = self.current_pose_step();
        self.update_step(index, step)
    }

    pub fn update_step(&self, index: usize, step: MissionStep) -> Result<()> {
        self.missions().replace(index, step).map(|_| ())
    }

    pub fn set_default_speed(&self, spd: f64) -> Result<()> {
        if !(spd > 0.0) || !spd.is_finite() {
            return Err(RoarmError::Validation(format!("speed must be > 0, got {}", spd)));
        }
        let motion = {
            let mut motion = self.motion.lock().unwrap_or_else(|p| p.into_inner());
            motion.spd = spd;
            *motion
        };
        self.jog.set_motion(motion.spd, motion.acc);
        self.notifier.status(&self.name, format!("Default speed set to {}", spd));
        Ok(())
    }

    pub fn move_to_current_pose(&self) -> Result<()> {
        let step = self.current_pose_step();
        self.send(&step.to_frame())?;
        self.notifier.status(&self.name, format!("Moving to {}", self.pose.read()));
        Ok(())
    }

    /// Reset to the startup pose, send the move and record it.
    pub fn init_robot(&self) -> Result<()> {
        self.pose.reset(self.startup_pose);
        let step = self.current_pose_step();
        self.send_and_record(step, "Robot initialized to startup position")
    }

    pub fn start_jog(&self, axis: Axis, delta: f64) -> Result<()> {
        self.jog.start(axis, delta)
    }

    pub fn stop_jog(&self) {
        self.jog.stop();
    }

    pub fn is_jogging(&self) -> bool {
        self.jog.is_active()
    }

    fn stop_jog_for_run(&self) {
        if self.jog.is_active() {
            info!(target: "robot", "[{}] Stopping jog before run", self.name);
            self.jog.stop();
        }
    }

    pub fn play_step(&self, index: usize) -> Result<RunHandle> {
        let step = self.missions().step(index)?.clone();
        self.stop_jog_for_run();
        self.engine.play_step(step)
    }

    pub fn play_mission(&self, times: usize) -> Result<RunHandle> {
        let (name, steps) = {
            let missions = self.missions();
            let mission = missions.selected()?;
            (mission.name.clone(), mission.steps.clone())
        };
        self.stop_jog_for_run();
        let handle = self.engine.run(steps, times)?;
        self.notifier.status(&self.name, format!("Playing mission '{}' {} times", name, times));
        Ok(handle)
    }

    /// Run arbitrary steps to completion, outside the mission model.
    pub fn run_steps_blocking(&self, steps: Vec<MissionStep>, times: usize) -> Result<RunReport> {
        self.stop_jog_for_run();
        self.engine.run_blocking(steps, times)
    }

    pub fn cancel_run(&self) {
        self.engine.cancel();
    }

    pub fn run_state(&self) -> RunState {
        self.engine.state()
    }

    pub fn create_mission(&self, name: &str) -> Result<()> {
        self.missions().create(name)
    }

    /// Write the selected mission to `path` and tell the controller its name.
    pub fn save_mission(&self, path: &Path) -> Result<()> {
        let mission = self.missions().selected()?.clone();
        mission.save(path)?;
        if let Err(e) = self.send(&Frame::mission_saved(&mission.name)) {
            warn!(target: "robot", "[{}] Saved '{}' but could not notify controller: {}", self.name, mission.name, e);
        }
        self.notifier
            .status(&self.name, format!("Mission '{}' saved to {}", mission.name, path.display()));
        Ok(())
    }

    /// Read a mission file and select it. Returns the mission's name.
    pub fn load_mission(&self, path: &Path, overwrite: bool) -> Result<String> {
        let mission = Mission::load(path)?;
        let name = mission.name.clone();
        self.missions().insert_mission(mission, overwrite)?;
        self.notifier
            .status(&self.name, format!("Mission '{}' loaded from {}", name, path.display()));
        Ok(name)
    }

    /// Stop the jog, cancel any run and close the link. Idempotent.
    pub fn close(&self) {
        self.jog.stop();
        self.engine.cancel();
        self.sink.close();
        info!(target: "robot", "[{}] Closed", self.name);
    }
}

/// All robots driven by this process.
#[derive(Default)]
pub struct Fleet {
    robots: Vec<Arc<Robot>>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every configured robot. A robot whose port cannot be opened is
    /// kept offline instead of failing the whole fleet.
    pub fn connect(config: &Config, notifier: &Notifier) -> Self {
        let settings = RobotSettings::from(config);
        let mut fleet = Fleet::new();
        for robot in &config.robots {
            let link = config.link_settings(robot);
            let connected = match Robot::connect(&robot.name, &link, settings, notifier.clone()) {
                Ok(r) => r,
                Err(e) => {
                    error!(target: "robot", "[{}] {}", robot.name, e);
                    notifier.failure(&robot.name, e.clone());
                    Robot::offline(&robot.name, &e.to_string(), settings, notifier.clone())
                }
            };
            fleet.add(connected);
        }
        fleet
    }

    pub fn add(&mut self, robot: Robot) -> Arc<Robot> {
        let robot = Arc::new(robot);
        self.robots.push(Arc::clone(&robot));
        robot
    }

    pub fn get(&self, name: &str) -> Option<Arc<Robot>> {
        self.robots.iter().find(|r| r.name() == name).cloned()
    }

    pub fn robot(&self, name: &str) -> Result<Arc<Robot>> {
        self.get(name).ok_or_else(|| RoarmError::UnknownRobot(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.robots.iter().map(|r| r.name().to_string()).collect()
    }

    pub fn robots(&self) -> &[Arc<Robot>] {
        &self.robots
    }

    /// Start every robot's selected mission at once. Nothing starts unless
    /// every robot has a mission selected.
    pub fn play_all(&self, times: usize) -> Result<Vec<RunHandle>> {
        for robot in &self.robots {
            robot.missions().selected()?;
        }
        let mut handles = Vec::with_capacity(self.robots.len());
        for robot in &self.robots {
            match robot.play_mission(times) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in &handles {
                        handle.cancel();
                    }
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    pub fn close_all(&self) {
        for robot in &self.robots {
            robot.close();
        }
    }
}

impl MissionRunner for Fleet {
    fn has_robot(&self, robot: &str) -> bool {
        self.get(robot).is_some()
    }

    fn run_mission(&self, robot: &str, mission: Mission, repetitions: usize) -> Result<RunReport> {
        let robot = self.robot(robot)?;
        info!(target: "robot", "[{}] Running scheduled mission '{}'", robot.name(), mission.name);
        robot.run_steps_blocking(mission.steps, repetitions)
    }
}
