//! Wire frames exchanged with the arm controller.
//!
//! One frame per line, each line a JSON object tagged by its integer
//! message-type code under the key `"T"`:
//!
//! | Code | Direction | Fields |
//! |------|-----------|--------|
//! | 104  | out | x, y, z, t, spd, acc |
//! | 105  | out | (none) |
//! | 1051 | in  | x, y, z, t |
//! | 113  | out | pwm_a, pwm_b |
//! | 114  | out | led |
//! | 210  | out | cmd |
//! | 112  | out | mode, b, s, e, h |
//! | 221  | out | name |
//!
//! A `Frame` keeps every field it was decoded with, so frames of unknown type
//! survive a decode/encode cycle untouched.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::errors::{Result, RoarmError};

/// Key carrying the message-type code.
pub const TYPE_KEY: &str = "T";

pub mod codes {
    pub const MOVE: i64 = 104;
    pub const REQUEST_POSE: i64 = 105;
    pub const POSE_TELEMETRY: i64 = 1051;
    pub const DELAY: i64 = 111;
    pub const DYNAMIC_ADAPTATION: i64 = 112;
    pub const PWM: i64 = 113;
    pub const LED: i64 = 114;
    pub const TORQUE: i64 = 210;
    pub const MISSION_SAVED: i64 = 221;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    code: i64,
    fields: Map<String, Value>,
}

impl Frame {
    pub fn new(code: i64) -> Self {
        Self {
            code,
            fields: Map::new(),
        }
    }

    /// Builder-style field insert.
    pub fn with<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Reassemble a frame from a code and the remaining (non-`T`) fields.
    pub fn from_parts(code: i64, mut fields: Map<String, Value>) -> Self {
        fields.remove(TYPE_KEY);
        Self { code, fields }
    }

    pub fn code(&self) -> i64 {
        self.code
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    /// Pose request, answered by the controller with 1051 telemetry.
    pub fn request_pose() -> Self {
        Self::new(codes::REQUEST_POSE)
    }

    /// Tells the controller the name a mission was saved under.
    pub fn mission_saved(name: &str) -> Self {
        Self::new(codes::MISSION_SAVED).with("name", name)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(RoarmError::ProtocolDecode("frame is not a JSON object".to_string()));
        };
        let code = fields
            .remove(TYPE_KEY)
            .ok_or_else(|| RoarmError::ProtocolDecode("frame has no \"T\" field".to_string()))?;
        let code = code
            .as_i64()
            .ok_or_else(|| RoarmError::ProtocolDecode(format!("frame type {} is not an integer", code)))?;
        Ok(Self { code, fields })
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len() + 1);
        map.insert(TYPE_KEY.to_string(), Value::from(self.code));
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }

    /// Decode one line of inbound text. Surrounding whitespace is ignored.
    pub fn decode(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line.trim())
            .map_err(|e| RoarmError::ProtocolDecode(format!("{}: {}", e, line.trim())))?;
        Self::from_value(value)
    }

    /// Compact JSON terminated by `\n`, ready for the serial port.
    pub fn encode(&self) -> String {
        let mut line = self.to_value().to_string();
        line.push('\n');
        line
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Frame::from_value(value).map_err(D::Error::custom)
    }
}

/// What the read loop does with a decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// 1051. Axes missing from the frame keep their current value.
    PoseTelemetry {
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        t: Option<f64>,
    },
    /// 105 echoed back by the controller; nothing to do yet.
    Ack,
    Unrecognized(Frame),
}

impl Inbound {
    pub fn from_frame(frame: Frame) -> Self {
        match frame.code() {
            codes::POSE_TELEMETRY => Inbound::PoseTelemetry {
                x: frame.get("x").and_then(Value::as_f64),
                y: frame.get("y").and_then(Value::as_f64),
                z: frame.get("z").and_then(Value::as_f64),
                t: frame.get("t").and_then(Value::as_f64),
            },
            codes::REQUEST_POSE => Inbound::Ack,
            _ => Inbound::Unrecognized(frame),
        }
    }
}

/// Longest partial line kept while waiting for its `\n`. Frames are a few
/// dozen bytes; anything this long is line noise or a baud mismatch.
pub const MAX_PENDING_BYTES: usize = 4096;

/// Drop the unterminated tail of `buffer` once it exceeds `max` bytes.
pub fn discard_overflow(buffer: &mut Vec<u8>, max: usize) -> Result<()> {
    if buffer.len() <= max {
        return Ok(());
    }
    let len = buffer.len();
    buffer.clear();
    Err(RoarmError::ProtocolDecode(format!(
        "no line break in {} bytes, discarded",
        len
    )))
}

/// Split complete `\n`-terminated lines off the front of `buffer`, leaving any
/// trailing partial line in place. Lines that are not UTF-8 are dropped.
pub fn extract_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let mut chunk = buffer.drain(..=pos).collect::<Vec<_>>();
        chunk.pop();
        if chunk.last() == Some(&b'\r') {
            chunk.pop();
        }
        match String::from_utf8(chunk) {
            Ok(s) => lines.push(s),
            Err(e) => log::warn!(target: "frame", "Dropping non UTF-8 line: {}", e),
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_keeps_unknown_fields() {
        let frame = Frame::decode(r#"{"T":999,"foo":[1,2],"bar":"x"}"#).unwrap();
        assert_eq!(frame.code(), 999);
        assert_eq!(frame.get("foo"), Some(&json!([1, 2])));
        let again = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(frame, again);
    }

    #[test]
    fn encode_is_single_line() {
        let line = Frame::mission_saved("pick").encode();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value, json!({"T": 221, "name": "pick"}));
    }

    #[test]
    fn decode_rejects_malformed() {
        assert!(matches!(Frame::decode("{not json"), Err(RoarmError::ProtocolDecode(_))));
        assert!(matches!(Frame::decode("[1,2,3]"), Err(RoarmError::ProtocolDecode(_))));
        assert!(matches!(Frame::decode(r#"{"x":1}"#), Err(RoarmError::ProtocolDecode(_))));
        assert!(matches!(Frame::decode(r#"{"T":"104"}"#), Err(RoarmError::ProtocolDecode(_))));
    }

    #[test]
    fn inbound_classification() {
        let telemetry = Frame::decode(r#"{"T":1051,"x":1.5,"z":-2}"#).unwrap();
        assert_eq!(
            Inbound::from_frame(telemetry),
            Inbound::PoseTelemetry { x: Some(1.5), y: None, z: Some(-2.0), t: None }
        );
        assert_eq!(Inbound::from_frame(Frame::request_pose()), Inbound::Ack);
        let other = Frame::new(42);
        assert_eq!(Inbound::from_frame(other.clone()), Inbound::Unrecognized(other));
    }

    #[test]
    fn extract_lines_keeps_partial_tail() {
        let mut buf = b"{\"T\":105}\r\n{\"T\":1051}\n{\"T\":10".to_vec();
        let lines = extract_lines(&mut buf);
        assert_eq!(lines, vec!["{\"T\":105}".to_string(), "{\"T\":1051}".to_string()]);
        assert_eq!(buf, b"{\"T\":10".to_vec());
    }

    #[test]
    fn unterminated_noise_is_discarded_past_the_cap() {
        let mut buf = vec![b'x'; 16];
        assert!(discard_overflow(&mut buf, 16).is_ok());
        assert_eq!(buf.len(), 16);
        buf.push(b'x');
        assert!(matches!(discard_overflow(&mut buf, 16), Err(RoarmError::ProtocolDecode(_))));
        assert!(buf.is_empty());
    }
}
