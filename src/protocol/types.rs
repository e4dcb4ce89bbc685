use serde::{Deserialize, Serialize};

/// One received line: lossy UTF-8, carriage returns removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame(String);

impl Frame {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        Frame(text.chars().filter(|c| *c != '\r').collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&str> for Frame {
    fn from(s: &str) -> Self {
        Frame::from_bytes(s.as_bytes())
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckKind {
    ZeroSet,
    LoadComplete,
    CaudalSubmenu,
    ExpulsionComplete,
    ReturnedToZero,
    StayingPosition,
    Reset,
}

impl AckKind {
    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "ZERO_SET" => AckKind::ZeroSet,
            "LOAD_COMPLETE" => AckKind::LoadComplete,
            "CAUDAL_SUBMENU" => AckKind::CaudalSubmenu,
            "EXPULSION_COMPLETE" => AckKind::ExpulsionComplete,
            "RETURNED_TO_ZERO" => AckKind::ReturnedToZero,
            "STAYING_POSITION" => AckKind::StayingPosition,
            "RESET" => AckKind::Reset,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusKind {
    Expelling,
    Refilling,
}

impl StatusKind {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "EXPULSION" => Some(StatusKind::Expelling),
            "RECARGA" => Some(StatusKind::Refilling),
            _ => None,
        }
    }
}

/// Dosing mode: by flow rate (caudal) or by total time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Mode {
    #[default]
    Caudal,
    Time,
}

impl Mode {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "FLOW" | "CAUDAL" => Some(Mode::Caudal),
            "TIME" => Some(Mode::Time),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Volume(f64),
    Parameter(f64),
    Ack(AckKind),
    Status(StatusKind),
    Info { total_volume: f64, estimate_param: f64, mode: Mode },
    Progress(u8),
    Preset(f64),
    ManualFlow(f64),
    Duration(f64),
    Repetitions(f64),
    Step(f64),
}

/// Single-byte command understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    Plus,
    Minus,
    SelectOne,
    SelectTwo,
    Confirm,
    Reset,
    Stop,
    CycleRepetitions,
    ChangeScale,
}

impl Command {
    pub fn as_byte(self) -> u8 {
        match self {
            Command::Plus => b'+',
            Command::Minus => b'-',
            Command::SelectOne => b'1',
            Command::SelectTwo => b'2',
            Command::Confirm => b's',
            Command::Reset => b'r',
            Command::Stop => b'p',
            Command::CycleRepetitions => b'b',
            Command::ChangeScale => b'm',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'+' => Command::Plus,
            b'-' => Command::Minus,
            b'1' => Command::SelectOne,
            b'2' => Command::SelectTwo,
            b's' => Command::Confirm,
            b'r' => Command::Reset,
            b'p' => Command::Stop,
            b'b' => Command::CycleRepetitions,
            b'm' => Command::ChangeScale,
            _ => return None,
        })
    }
}
