//! Headless operator console: run a mission, serve a schedule, or check a
//! mission file.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use roarm_driver::config_loader::{self, Config};
use roarm_driver::device_link::RecordingSink;
use roarm_driver::executor::RunState;
use roarm_driver::mission::Mission;
use roarm_driver::notifications::{self, Notification};
use roarm_driver::pose::PoseStore;
use roarm_driver::robot::{Fleet, Robot, RobotSettings};
use roarm_driver::scheduler::{Scheduler, SystemClock};
use roarm_driver::step::StepCommand;

/// RoArm operator console
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to one robot and run a mission file
    Run {
        /// Robot name as configured in roarm.yaml
        #[arg(long)]
        robot: String,
        #[arg(long)]
        mission: PathBuf,
        #[arg(long, default_value_t = 1)]
        times: usize,
        /// Record frames instead of opening the serial port
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Connect every robot and run a saved schedule until Ctrl-C
    Schedule {
        #[arg(long)]
        file: PathBuf,
    },
    /// Load a mission file and list its steps
    Check {
        #[arg(long)]
        mission: PathBuf,
    },
}

fn install_ctrlc() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .ok();
    running
}

fn run(config: &Config, robot_name: &str, mission_path: &Path, times: usize, dry_run: bool) -> Result<()> {
    let (notifier, receiver) = notifications::channel(config.console.notification_capacity);
    let settings = RobotSettings::from(config);
    let sink = RecordingSink::new();
    let robot = if dry_run {
        Robot::new(robot_name, Arc::new(sink.clone()), PoseStore::new(settings.startup_pose), settings, notifier)
    } else {
        let robot_cfg = config
            .robot(robot_name)
            .ok_or_else(|| anyhow!("Robot '{}' is not configured (known: {:?})", robot_name, config.robots))?;
        Robot::connect(robot_name, &config.link_settings(robot_cfg), settings, notifier)?
    };

    robot
        .load_mission(mission_path, true)
        .with_context(|| format!("Failed to load {}", mission_path.display()))?;
    let running = install_ctrlc();
    let handle = robot.play_mission(times)?;

    let mut cancelled = false;
    while !handle.is_finished() {
        if !running.load(Ordering::SeqCst) && !cancelled {
            println!("Cancelling...");
            robot.cancel_run();
            cancelled = true;
        }
        if let Some(n) = receiver.recv_timeout(config.poll_interval()) {
            print_notification(&n);
        }
    }
    let report = handle.wait();
    for n in receiver.drain() {
        print_notification(&n);
    }
    robot.close();

    if dry_run {
        println!("{} frames would have been sent", sink.frames().len());
    }
    println!(
        "Run {} ({} of {} steps)",
        report.state, report.executed_steps, report.total_steps
    );
    match report.state {
        RunState::Completed => Ok(()),
        state => Err(anyhow!("Run did not complete: {}", state)),
    }
}

fn schedule(config: &Config, file: &Path) -> Result<()> {
    let (notifier, receiver) = notifications::channel(config.console.notification_capacity);
    let fleet = Arc::new(Fleet::connect(config, &notifier));
    let scheduler = Scheduler::new(fleet.clone(), Arc::new(SystemClock), notifier);
    scheduler
        .load(file)
        .with_context(|| format!("Failed to load schedule {}", file.display()))?;
    for task in scheduler.tasks() {
        println!(
            "{}  {:<10} {:<12} {:<8} {:<20} {}",
            task.id,
            task.robot,
            task.scheduled_time,
            format!("{:?}", task.recurrence),
            task.status.to_string(),
            task.mission_file.display()
        );
    }

    let running = install_ctrlc();
    println!("Waiting for scheduled tasks, Ctrl-C to stop");
    receiver.run(config.poll_interval(), &running, |n| print_notification(&n));

    scheduler.shutdown();
    fleet.close_all();
    println!("Scheduler stopped.");
    Ok(())
}

fn check(config: &Config, path: &Path) -> Result<()> {
    let mission = Mission::load(path)?;
    println!("{} ({}) - {} steps", mission.name, mission.intro, mission.len());

    // Rough duration from the startup pose, same heuristic as a real run.
    let timing = config.timing;
    let mut pose = config.motion.startup_pose;
    let mut total = Duration::ZERO;
    for (i, step) in mission.steps.iter().enumerate() {
        println!("{:>4}. {:<20} {}", i + 1, step.kind().as_str(), step);
        match &step.command {
            StepCommand::Movement(target) => {
                total += timing.settle_time(&pose, target);
                pose = roarm_driver::pose::Pose::new(target.x, target.y, target.z, target.t);
            }
            StepCommand::Delay { ms } => total += Duration::from_millis((*ms).max(0) as u64),
            _ => {}
        }
    }
    println!("Estimated run time: {:.1} s", total.as_secs_f64());
    Ok(())
}

fn print_notification(n: &Notification) {
    match n {
        Notification::Progress { percent, .. } if *percent > 0.0 && *percent < 100.0 => {
            log::debug!(target: "roarm_console", "{}", n);
        }
        _ => println!("{}", n),
    }
}

/// Filter taken from `var` when set, `info` otherwise.
fn log_env(var: &'static str) -> env_logger::Env<'static> {
    env_logger::Env::new().filter_or(var, "info")
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(log_env("RUST_LOG")).init();

    let args = Args::parse();
    let config = config_loader::load_config()?;

    match args.command {
        Command::Run { robot, mission, times, dry_run } => run(&config, &robot, &mission, times, dry_run),
        Command::Schedule { file } => schedule(&config, &file),
        Command::Check { mission } => check(&config, &mission),
    }
}
