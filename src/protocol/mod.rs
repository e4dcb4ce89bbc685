pub mod decoder;
pub mod framer;
pub mod types;

pub use decoder::{decode_frame, FrameDecoder};
pub use framer::LineFramer;
pub use types::*;

/// Why a frame was dropped. Never surfaced past the decoder.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame has fewer than two fields")]
    TooFewFields,

    #[error("unknown header: {0}")]
    UnknownHeader(String),

    #[error("unknown {header} token: {token}")]
    UnknownToken { header: &'static str, token: String },

    #[error("invalid number in {header}: {value:?}")]
    InvalidNumber { header: &'static str, value: String },

    #[error("{header} expects {expected} payload field(s), got {got}")]
    WrongArity { header: &'static str, expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
