use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;

use crate::device_link::LinkSettings;
use crate::executor::Timing;
use crate::jog::JogSettings;
use crate::pose::Pose;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RobotConfig {
    pub name: String,
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

fn default_baud() -> u32 {
    115200
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct MotionConfig {
    pub startup_pose: Pose,
    pub default_spd: f64,
    pub default_acc: f64,
    // Jog step sizes used by the console (per tick)
    pub xyz_increment: f64,
    pub t_increment: f64,
    pub jog_interval_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            startup_pose: Pose::STARTUP,
            default_spd: 2.5,
            default_acc: 10.0,
            xyz_increment: 3.0,
            t_increment: 0.02,
            jog_interval_ms: 50,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SerialConfig {
    pub read_timeout_ms: u64,
    // Controller resets when the port is opened
    pub settle_ms: u64,
    pub close_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 100,
            settle_ms: 2000,
            close_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConsoleConfig {
    pub poll_interval_ms: u64,
    pub notification_capacity: usize,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            notification_capacity: 1024,
        }
    }
}

/// Per-host section; replaces the robot list on the matching machine.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HostConfig {
    pub robots: Vec<RobotConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub robots: Vec<RobotConfig>,
    pub motion: MotionConfig,
    pub timing: Timing,
    pub serial: SerialConfig,
    pub console: ConsoleConfig,
    pub hosts: HashMap<String, HostConfig>, // hostname -> HostConfig
}

impl Default for Config {
    fn default() -> Self {
        Self {
            robots: vec![
                RobotConfig {
                    name: "Robot 1".to_string(),
                    port: "/dev/ttyUSB0".to_string(),
                    baud: default_baud(),
                },
                RobotConfig {
                    name: "Robot 2".to_string(),
                    port: "/dev/ttyUSB1".to_string(),
                    baud: default_baud(),
                },
            ],
            motion: MotionConfig::default(),
            timing: Timing::default(),
            serial: SerialConfig::default(),
            console: ConsoleConfig::default(),
            hosts: HashMap::new(),
        }
    }
}

impl Config {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        Ok(config)
    }

    /// Swap in the robot list of `hostname`'s section, if there is one.
    pub fn apply_host(&mut self, hostname: &str) {
        if let Some(host) = self.hosts.get(hostname) {
            log::info!(target: "config_loader", "Using robot list for host '{}'", hostname);
            self.robots = host.robots.clone();
        }
    }

    /// `ROARM_PORT_<N>` (1-based) replaces the port of the N-th robot.
    pub fn apply_port_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (idx, robot) in self.robots.iter_mut().enumerate() {
            let key = format!("ROARM_PORT_{}", idx + 1);
            if let Some(port) = lookup(&key) {
                log::info!(target: "config_loader", "{}: port {} -> {} ({})", robot.name, robot.port, port, key);
                robot.port = port;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.robots.is_empty() {
            return Err(anyhow!("No robots configured"));
        }
        let mut seen = std::collections::HashSet::new();
        for robot in &self.robots {
            if !seen.insert(robot.name.as_str()) {
                return Err(anyhow!("Robot '{}' is configured twice", robot.name));
            }
        }
        if !(self.motion.default_spd > 0.0) || !(self.motion.default_acc > 0.0) {
            return Err(anyhow!("motion.default_spd and motion.default_acc must be > 0"));
        }
        self.timing.validate().map_err(|e| anyhow!("timing: {}", e))?;
        Ok(())
    }

    pub fn robot(&self, name: &str) -> Option<&RobotConfig> {
        self.robots.iter().find(|r| r.name == name)
    }

    pub fn link_settings(&self, robot: &RobotConfig) -> LinkSettings {
        LinkSettings {
            port: robot.port.clone(),
            baud: robot.baud,
            read_timeout: Duration::from_millis(self.serial.read_timeout_ms),
            settle: Duration::from_millis(self.serial.settle_ms),
            close_timeout: Duration::from_millis(self.serial.close_timeout_ms),
        }
    }

    pub fn jog_settings(&self) -> JogSettings {
        JogSettings {
            spd: self.motion.default_spd,
            acc: self.motion.default_acc,
            interval: Duration::from_millis(self.motion.jog_interval_ms),
            join_timeout: Duration::from_millis(self.serial.close_timeout_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.console.poll_interval_ms)
    }
}

/// `ROARM_CONFIG` if set, otherwise `roarm.yaml` next to Cargo.toml.
pub fn config_path() -> PathBuf {
    match env::var("ROARM_CONFIG") {
        Ok(path) => PathBuf::from(path),
        Err(_) => PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("roarm.yaml"),
    }
}

/// Load roarm.yaml, then apply the host section and environment overrides.
pub fn load_config() -> Result<Config> {
    use gethostname::gethostname;
    // Ensure .env is loaded once here so all env-based config is centralized
    let _ = dotenv();

    let path = config_path();
    let text = fs::read_to_string(&path)
        .map_err(|e| anyhow!("Missing required roarm.yaml at {:?}: {}", path, e))?;
    let mut config = Config::from_yaml_str(&text).with_context(|| format!("Failed to parse {:?}", path))?;

    let hostname = gethostname().to_string_lossy().to_string();
    config.apply_host(&hostname);
    config.apply_port_overrides(|key| env::var(key).ok());
    config.validate()?;

    log::info!(
        target: "config_loader",
        "Loaded {:?}: {} robots (hostname={})",
        path,
        config.robots.len(),
        hostname
    );
    Ok(config)
}
