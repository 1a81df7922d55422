//! Mission steps: typed view over the frames recorded into a mission.
//!
//! Classification is a total match over the frame's type code (plus the
//! pwm field set for code 113). Codes the driver does not know are kept as
//! `StepCommand::Other` with the raw frame so they are written back verbatim.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::errors::{Result, RoarmError};
use crate::frame::{codes, Frame};

/// Used when a stored movement has no `spd`/`acc`.
pub const DEFAULT_SPD: f64 = 2.5;
pub const DEFAULT_ACC: f64 = 10.0;
/// Used when a stored delay has no `cmd`.
pub const DEFAULT_DELAY_MS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Movement,
    Suction,
    Relay,
    Delay,
    Led,
    Torque,
    DynamicAdaptation,
    Other,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Movement => "movement",
            StepKind::Suction => "suction",
            StepKind::Relay => "relay",
            StepKind::Delay => "delay",
            StepKind::Led => "led",
            StepKind::Torque => "torque",
            StepKind::DynamicAdaptation => "dynamic_adaptation",
            StepKind::Other => "other",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Absolute target pose plus motion parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveTarget {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub t: f64,
    pub spd: f64,
    pub acc: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptationParams {
    pub mode: i64,
    pub b: i64,
    pub s: i64,
    pub e: i64,
    pub h: i64,
}

impl AdaptationParams {
    pub fn enabled() -> Self {
        Self { mode: 1, b: 60, s: 110, e: 50, h: 50 }
    }

    pub fn disabled() -> Self {
        Self { mode: 0, b: 1000, s: 1000, e: 1000, h: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepCommand {
    Movement(MoveTarget),
    Suction { pwm_a: i64, pwm_b: i64 },
    /// Code 113 without both pwm fields.
    Relay { pwm_a: Option<i64>, pwm_b: Option<i64> },
    /// Client-side pause, never transmitted.
    Delay { ms: i64 },
    Led { level: i64 },
    Torque { enabled: bool },
    DynamicAdaptation(AdaptationParams),
    Other(Frame),
}

impl StepCommand {
    pub fn kind(&self) -> StepKind {
        match self {
            StepCommand::Movement(_) => StepKind::Movement,
            StepCommand::Suction { .. } => StepKind::Suction,
            StepCommand::Relay { .. } => StepKind::Relay,
            StepCommand::Delay { .. } => StepKind::Delay,
            StepCommand::Led { .. } => StepKind::Led,
            StepCommand::Torque { .. } => StepKind::Torque,
            StepCommand::DynamicAdaptation(_) => StepKind::DynamicAdaptation,
            StepCommand::Other(_) => StepKind::Other,
        }
    }
}

/// One recorded command. `extra` holds fields a known frame type carried
/// beyond the ones the driver interprets, so they survive save/load.
#[derive(Debug, Clone, PartialEq)]
pub struct MissionStep {
    pub command: StepCommand,
    pub extra: Map<String, Value>,
}

impl From<StepCommand> for MissionStep {
    fn from(command: StepCommand) -> Self {
        Self { command, extra: Map::new() }
    }
}

/// Classify a raw frame without decoding it.
pub fn classify_frame(frame: &Frame) -> StepKind {
    match frame.code() {
        codes::MOVE => StepKind::Movement,
        codes::PWM if frame.contains("pwm_a") && frame.contains("pwm_b") => StepKind::Suction,
        codes::PWM => StepKind::Relay,
        codes::DELAY => StepKind::Delay,
        codes::LED => StepKind::Led,
        codes::TORQUE => StepKind::Torque,
        codes::DYNAMIC_ADAPTATION => StepKind::DynamicAdaptation,
        _ => StepKind::Other,
    }
}

pub fn classify(step: &MissionStep) -> StepKind {
    step.command.kind()
}

fn take_f64(fields: &mut Map<String, Value>, key: &str, code: i64) -> Result<f64> {
    match fields.remove(key) {
        Some(v) => v
            .as_f64()
            .ok_or_else(|| RoarmError::ProtocolDecode(format!("T={} field '{}' is not a number: {}", code, key, v))),
        None => Err(RoarmError::ProtocolDecode(format!("T={} missing field '{}'", code, key))),
    }
}

fn take_opt_f64(fields: &mut Map<String, Value>, key: &str, code: i64) -> Result<Option<f64>> {
    if fields.contains_key(key) {
        take_f64(fields, key, code).map(Some)
    } else {
        Ok(None)
    }
}

fn take_i64(fields: &mut Map<String, Value>, key: &str, code: i64) -> Result<i64> {
    match fields.remove(key) {
        Some(v) => v
            .as_i64()
            .ok_or_else(|| RoarmError::ProtocolDecode(format!("T={} field '{}' is not an integer: {}", code, key, v))),
        None => Err(RoarmError::ProtocolDecode(format!("T={} missing field '{}'", code, key))),
    }
}

fn take_opt_i64(fields: &mut Map<String, Value>, key: &str, code: i64) -> Result<Option<i64>> {
    if fields.contains_key(key) {
        take_i64(fields, key, code).map(Some)
    } else {
        Ok(None)
    }
}

impl MissionStep {
    pub fn movement(x: f64, y: f64, z: f64, t: f64, spd: f64, acc: f64) -> Self {
        StepCommand::Movement(MoveTarget { x, y, z, t, spd, acc }).into()
    }

    /// Code 113 with both channels set. Classifies as suction.
    pub fn pwm(pwm_a: i64, pwm_b: i64) -> Self {
        StepCommand::Suction { pwm_a, pwm_b }.into()
    }

    pub fn delay(ms: i64) -> Self {
        StepCommand::Delay { ms }.into()
    }

    pub fn led(level: i64) -> Self {
        StepCommand::Led { level }.into()
    }

    pub fn torque(enabled: bool) -> Self {
        StepCommand::Torque { enabled }.into()
    }

    pub fn dynamic_adaptation(params: AdaptationParams) -> Self {
        StepCommand::DynamicAdaptation(params).into()
    }

    pub fn kind(&self) -> StepKind {
        self.command.kind()
    }

    /// Steps that are sent to the controller. Delays are not.
    pub fn is_transmitted(&self) -> bool {
        !matches!(self.command, StepCommand::Delay { .. })
    }

    /// Reject non-positive speed/acceleration, non-finite coordinates and
    /// negative delays.
    pub fn validate(&self) -> Result<()> {
        match &self.command {
            StepCommand::Movement(m) => {
                if ![m.x, m.y, m.z, m.t].iter().all(|v| v.is_finite()) {
                    return Err(RoarmError::Validation("movement target must be finite".to_string()));
                }
                if !(m.spd > 0.0) || !m.spd.is_finite() {
                    return Err(RoarmError::Validation(format!("speed must be > 0, got {}", m.spd)));
                }
                if !(m.acc > 0.0) || !m.acc.is_finite() {
                    return Err(RoarmError::Validation(format!("acceleration must be > 0, got {}", m.acc)));
                }
                Ok(())
            }
            StepCommand::Delay { ms } if *ms < 0 => {
                Err(RoarmError::Validation(format!("delay must be >= 0 ms, got {}", ms)))
            }
            _ => Ok(()),
        }
    }

    pub fn from_frame(frame: Frame) -> Result<Self> {
        let kind = classify_frame(&frame);
        let code = frame.code();
        if kind == StepKind::Other {
            return Ok(StepCommand::Other(frame).into());
        }
        let mut fields = frame.into_fields();
        let command = match kind {
            StepKind::Movement => StepCommand::Movement(MoveTarget {
                x: take_f64(&mut fields, "x", code)?,
                y: take_f64(&mut fields, "y", code)?,
                z: take_f64(&mut fields, "z", code)?,
                t: take_f64(&mut fields, "t", code)?,
                spd: take_opt_f64(&mut fields, "spd", code)?.unwrap_or(DEFAULT_SPD),
                acc: take_opt_f64(&mut fields, "acc", code)?.unwrap_or(DEFAULT_ACC),
            }),
            StepKind::Suction => StepCommand::Suction {
                pwm_a: take_i64(&mut fields, "pwm_a", code)?,
                pwm_b: take_i64(&mut fields, "pwm_b", code)?,
            },
            StepKind::Relay => StepCommand::Relay {
                pwm_a: take_opt_i64(&mut fields, "pwm_a", code)?,
                pwm_b: take_opt_i64(&mut fields, "pwm_b", code)?,
            },
            StepKind::Delay => StepCommand::Delay {
                ms: take_opt_i64(&mut fields, "cmd", code)?.unwrap_or(DEFAULT_DELAY_MS),
            },
            StepKind::Led => StepCommand::Led {
                level: take_i64(&mut fields, "led", code)?,
            },
            StepKind::Torque => StepCommand::Torque {
                enabled: take_i64(&mut fields, "cmd", code)? != 0,
            },
            StepKind::DynamicAdaptation => StepCommand::DynamicAdaptation(AdaptationParams {
                mode: take_i64(&mut fields, "mode", code)?,
                b: take_i64(&mut fields, "b", code)?,
                s: take_i64(&mut fields, "s", code)?,
                e: take_i64(&mut fields, "e", code)?,
                h: take_i64(&mut fields, "h", code)?,
            }),
            StepKind::Other => unreachable!("handled above"),
        };
        Ok(Self { command, extra: fields })
    }

    pub fn to_frame(&self) -> Frame {
        let code = match &self.command {
            StepCommand::Movement(_) => codes::MOVE,
            StepCommand::Suction { .. } | StepCommand::Relay { .. } => codes::PWM,
            StepCommand::Delay { .. } => codes::DELAY,
            StepCommand::Led { .. } => codes::LED,
            StepCommand::Torque { .. } => codes::TORQUE,
            StepCommand::DynamicAdaptation(_) => codes::DYNAMIC_ADAPTATION,
            StepCommand::Other(raw) => return raw.clone(),
        };
        let frame = Frame::from_parts(code, self.extra.clone());
        match &self.command {
            StepCommand::Movement(m) => frame
                .with("x", m.x)
                .with("y", m.y)
                .with("z", m.z)
                .with("t", m.t)
                .with("spd", m.spd)
                .with("acc", m.acc),
            StepCommand::Suction { pwm_a, pwm_b } => frame.with("pwm_a", *pwm_a).with("pwm_b", *pwm_b),
            StepCommand::Relay { pwm_a, pwm_b } => {
                let mut frame = frame;
                if let Some(a) = pwm_a {
                    frame = frame.with("pwm_a", *a);
                }
                if let Some(b) = pwm_b {
                    frame = frame.with("pwm_b", *b);
                }
                frame
            }
            StepCommand::Delay { ms } => frame.with("cmd", *ms),
            StepCommand::Led { level } => frame.with("led", *level),
            StepCommand::Torque { enabled } => frame.with("cmd", if *enabled { 1 } else { 0 }),
            StepCommand::DynamicAdaptation(p) => frame
                .with("mode", p.mode)
                .with("b", p.b)
                .with("s", p.s)
                .with("e", p.e)
                .with("h", p.h),
            StepCommand::Other(_) => unreachable!("returned above"),
        }
    }
}

impl Serialize for MissionStep {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_frame().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MissionStep {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let frame = Frame::deserialize(deserializer)?;
        MissionStep::from_frame(frame).map_err(D::Error::custom)
    }
}

impl fmt::Display for MissionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.command {
            StepCommand::Movement(m) => write!(
                f,
                "move x={:.2} y={:.2} z={:.2} t={:.2} spd={} acc={}",
                m.x, m.y, m.z, m.t, m.spd, m.acc
            ),
            StepCommand::Suction { pwm_a, pwm_b } => {
                let state = if *pwm_b > 0 { "on" } else { "off" };
                write!(f, "suction {} (pwm_a={} pwm_b={})", state, pwm_a, pwm_b)
            }
            StepCommand::Relay { .. } => write!(f, "relay off"),
            StepCommand::Delay { ms } => write!(f, "delay {} ms", ms),
            StepCommand::Led { level } => write!(f, "led {}", level),
            StepCommand::Torque { enabled } => {
                write!(f, "torque {}", if *enabled { "enabled" } else { "disabled" })
            }
            StepCommand::DynamicAdaptation(p) => write!(
                f,
                "dynamic adaptation mode={} b={} s={} e={} h={}",
                p.mode, p.b, p.s, p.e, p.h
            ),
            StepCommand::Other(raw) => write!(f, "other {}", raw.to_value()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Frame {
        Frame::decode(text).unwrap()
    }

    #[test]
    fn classify_by_code() {
        let cases = [
            (r#"{"T":104,"x":1,"y":2,"z":3,"t":0}"#, StepKind::Movement),
            (r#"{"T":113,"pwm_a":0,"pwm_b":255}"#, StepKind::Suction),
            (r#"{"T":113,"pwm_a":0}"#, StepKind::Relay),
            (r#"{"T":113,"pwm_b":0}"#, StepKind::Relay),
            (r#"{"T":113}"#, StepKind::Relay),
            (r#"{"T":111,"cmd":500}"#, StepKind::Delay),
            (r#"{"T":114,"led":255}"#, StepKind::Led),
            (r#"{"T":210,"cmd":1}"#, StepKind::Torque),
            (r#"{"T":112,"mode":1,"b":60,"s":110,"e":50,"h":50}"#, StepKind::DynamicAdaptation),
            (r#"{"T":221,"name":"x"}"#, StepKind::Other),
            (r#"{"T":7}"#, StepKind::Other),
        ];
        for (text, expected) in cases {
            let f = frame(text);
            assert_eq!(classify_frame(&f), expected, "{}", text);
            let step = MissionStep::from_frame(f).unwrap();
            assert_eq!(classify(&step), expected, "{}", text);
            // Same input, same answer.
            assert_eq!(classify(&step), classify(&step.clone()));
        }
    }

    #[test]
    fn movement_defaults_and_extras_survive() {
        let step = MissionStep::from_frame(frame(r#"{"T":104,"x":1,"y":2,"z":3,"t":0.5,"tag":"a"}"#)).unwrap();
        match step.command {
            StepCommand::Movement(m) => {
                assert_eq!(m.spd, DEFAULT_SPD);
                assert_eq!(m.acc, DEFAULT_ACC);
            }
            ref other => panic!("expected movement, got {:?}", other),
        }
        let back = step.to_frame();
        assert_eq!(back.get("tag"), Some(&Value::from("a")));
        assert_eq!(MissionStep::from_frame(back).unwrap(), step);
    }

    #[test]
    fn other_is_verbatim() {
        let raw = frame(r#"{"T":300,"anything":{"nested":true}}"#);
        let step = MissionStep::from_frame(raw.clone()).unwrap();
        assert_eq!(step.to_frame(), raw);
    }

    #[test]
    fn missing_required_field_is_decode_error() {
        let err = MissionStep::from_frame(frame(r#"{"T":104,"x":1,"y":2,"t":0}"#)).unwrap_err();
        assert!(matches!(err, RoarmError::ProtocolDecode(_)));
        let err = MissionStep::from_frame(frame(r#"{"T":114}"#)).unwrap_err();
        assert!(matches!(err, RoarmError::ProtocolDecode(_)));
    }

    #[test]
    fn torque_and_delay_wire_fields() {
        let f = MissionStep::torque(true).to_frame();
        assert_eq!(f.get("cmd"), Some(&Value::from(1)));
        let f = MissionStep::delay(250).to_frame();
        assert_eq!(f.code(), codes::DELAY);
        assert_eq!(f.get("cmd"), Some(&Value::from(250)));
        assert!(!MissionStep::delay(250).is_transmitted());
    }

    #[test]
    fn validation() {
        assert!(MissionStep::movement(0.0, 0.0, 0.0, 0.0, 2.5, 10.0).validate().is_ok());
        assert!(matches!(
            MissionStep::movement(0.0, 0.0, 0.0, 0.0, 0.0, 10.0).validate(),
            Err(RoarmError::Validation(_))
        ));
        assert!(matches!(
            MissionStep::movement(0.0, 0.0, 0.0, 0.0, 1.0, -1.0).validate(),
            Err(RoarmError::Validation(_))
        ));
        assert!(matches!(
            MissionStep::movement(f64::NAN, 0.0, 0.0, 0.0, 1.0, 1.0).validate(),
            Err(RoarmError::Validation(_))
        ));
        assert!(MissionStep::delay(0).validate().is_ok());
        assert!(matches!(MissionStep::delay(-1).validate(), Err(RoarmError::Validation(_))));
        assert!(MissionStep::led(17).validate().is_ok());
    }
}
