use super::types::{AckKind, Frame, Message, Mode, StatusKind};
use super::{ProtocolError, Result};

/// Parse one frame. Format: `HEADER:payload[:payload...]`.
pub fn decode_frame(frame: &Frame) -> Result<Message> {
    let parts: Vec<&str> = frame.as_str().split(':').map(str::trim).collect();
    if parts.len() < 2 {
        return Err(ProtocolError::TooFewFields);
    }
    let payload = &parts[1..];

    match parts[0] {
        "VOL" => Ok(Message::Volume(single_float("VOL", payload)?)),
        "PARAM" => Ok(Message::Parameter(single_float("PARAM", payload)?)),
        "PRESET" => Ok(Message::Preset(single_float("PRESET", payload)?)),
        "CUSTOM" => Ok(Message::ManualFlow(single_float("CUSTOM", payload)?)),
        "TIME" => Ok(Message::Duration(single_float("TIME", payload)?)),
        "LOOP" => Ok(Message::Repetitions(single_float("LOOP", payload)?)),
        "INC" => Ok(Message::Step(single_float("INC", payload)?)),
        "ACK" => {
            let token = single("ACK", payload)?;
            AckKind::from_token(token)
                .map(Message::Ack)
                .ok_or_else(|| ProtocolError::UnknownToken { header: "ACK", token: token.to_string() })
        }
        "STATUS" => {
            let token = single("STATUS", payload)?;
            StatusKind::from_token(token)
                .map(Message::Status)
                .ok_or_else(|| ProtocolError::UnknownToken { header: "STATUS", token: token.to_string() })
        }
        "INFO" => {
            expect_arity("INFO", payload, 3)?;
            let total_volume = parse_float("INFO", payload[0])?;
            let estimate_param = parse_float("INFO", payload[1])?;
            let mode = Mode::from_token(payload[2])
                .ok_or_else(|| ProtocolError::UnknownToken { header: "INFO", token: payload[2].to_string() })?;
            Ok(Message::Info { total_volume, estimate_param, mode })
        }
        "PROG" => Ok(Message::Progress(parse_percent(single("PROG", payload)?)?)),
        other => Err(ProtocolError::UnknownHeader(other.to_string())),
    }
}

fn expect_arity(header: &'static str, payload: &[&str], expected: usize) -> Result<()> {
    if payload.len() != expected {
        return Err(ProtocolError::WrongArity { header, expected, got: payload.len() });
    }
    Ok(())
}

fn single<'a>(header: &'static str, payload: &[&'a str]) -> Result<&'a str> {
    expect_arity(header, payload, 1)?;
    Ok(payload[0])
}

fn single_float(header: &'static str, payload: &[&str]) -> Result<f64> {
    parse_float(header, single(header, payload)?)
}

fn parse_float(header: &'static str, value: &str) -> Result<f64> {
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ProtocolError::InvalidNumber { header, value: value.to_string() }),
    }
}

/// Integer percentage clamped to 0..=100, including literals too large
/// for any machine integer.
fn parse_percent(value: &str) -> Result<u8> {
    let invalid = || ProtocolError::InvalidNumber { header: "PROG", value: value.to_string() };
    let (negative, digits) = match value.as_bytes().first() {
        Some(b'-') => (true, &value[1..]),
        Some(b'+') => (false, &value[1..]),
        _ => (false, value),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if negative {
        return Ok(0);
    }
    Ok(digits.parse::<u64>().map_or(100, |n| n.min(100) as u8))
}

/// Decoder stage of the reader pipeline. Malformed frames are logged and
/// dropped; they never reach the state machine.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    discarded: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, frame: &Frame) -> Option<Message> {
        match decode_frame(frame) {
            Ok(message) => Some(message),
            Err(e) => {
                self.discarded += 1;
                if !frame.is_empty() {
                    log::debug!("Discarding frame {:?}: {}", frame.as_str(), e);
                }
                None
            }
        }
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}
