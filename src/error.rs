use thiserror::Error;

/// Errors arising from PCI wire framing, packet, and payload (de)coding.
///
/// Errors carry positions and sizes only; the dispatcher logs the offending
/// frame bytes alongside when it drops a packet.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid hex digit 0x{byte:02X} at offset {offset}")]
    InvalidHex { byte: u8, offset: usize },

    #[error("bad checksum (body sum 0x{sum:02X}, expected 0x00)")]
    BadChecksum { sum: u8 },

    #[error("frame too short ({len} bytes)")]
    ShortFrame { len: usize },

    #[error("unknown envelope (first body byte 0x{first:02X})")]
    UnknownEnvelope { first: u8 },

    #[error("truncated {what}: need {need} bytes, got {got}")]
    TruncatedPayload {
        what: &'static str,
        need: usize,
        got: usize,
    },

    #[error("unknown SAL opcode 0x{opcode:02X} for application 0x{application:02X}")]
    UnknownOpcode { application: u8, opcode: u8 },

    #[error("unknown CAL kind nibble 0x{kind:X}")]
    UnknownCalKind { kind: u8 },
}

impl WireError {
    pub(crate) fn truncated(what: &'static str, need: usize, got: usize) -> Self {
        Self::TruncatedPayload { what, need, got }
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
