use crate::protocol::Command;
use std::fmt;

/// Why a raw response buffer was rejected before decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    Empty,
    TooShort { expected: usize, actual: usize },
    BadLeadByte(u8),
    MissingTerminator,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FrameError::Empty => write!(f, "empty buffer"),
            FrameError::TooShort { expected, actual } => {
                write!(f, "buffer too short: {actual} < {expected} bytes")
            }
            FrameError::BadLeadByte(byte) => write!(f, "bad first byte: {byte:#04x} != 0x7b"),
            FrameError::MissingTerminator => write!(f, "no terminating bytes in buffer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Malformed frame: {0}")]
    MalformedFrame(FrameError),
    #[error("Malformed {command} payload: expected {expected} bytes, got {actual}")]
    MalformedPayload {
        command: Command,
        expected: usize,
        actual: usize,
    },
    #[error("Unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("Channel {0} out of range (1..=8)")]
    ChannelOutOfRange(u8),
    #[error("Unknown platform '{0}', expected linux, macos or windows")]
    InvalidPlatform(String),
    #[error("Unknown frame layout '{0}', expected stripped or enclosed")]
    InvalidLayout(String),
}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Error {
        Error::MalformedFrame(err)
    }
}
