//! Point-to-point (CAL) payloads.
//!
//! The first byte carries the kind in its upper nibble and, for the
//! self-delimiting kinds, the count of following bytes in its lower nibble.
//! Report kinds run to the end of the packet body:
//!
//! ```text
//! 23 LV AA BB          status request (LV 01=level 00=binary, app AA, block BB)
//! 3n ..                acknowledge (n bytes ignored)
//! 8n PP V..            reply: parameter PP, n-1 value bytes
//! En AA C..            identify reply: attribute AA, n-1 ASCII bytes
//! C0 BB D..            binary status report from block BB
//! F0 BB P..            level status report from block BB, 16 groups,
//!                      two bytes per group (low-nibble byte first, each
//!                      byte replicating its nibble: 00 00=off, FF FF=on)
//! ```

use crate::error::{Result, WireError};

pub const CAL_STATUS_REQUEST: u8 = 0x2;
pub const CAL_ACKNOWLEDGE: u8 = 0x3;
pub const CAL_REPLY: u8 = 0x8;
pub const CAL_BINARY_REPORT: u8 = 0xC;
pub const CAL_IDENTIFY_REPLY: u8 = 0xE;
pub const CAL_LEVEL_REPORT: u8 = 0xF;

/// Groups covered by one status report packet.
pub const REPORT_GROUPS: usize = 16;

/// Status report flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Binary,
    Level,
}

/// A point-to-point application payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cal {
    Reply {
        parameter: u8,
        value: Vec<u8>,
    },
    Acknowledge,
    /// For `Level` kind, `data` holds the 16 group levels expanded to 0..255;
    /// for `Binary` it holds the raw report bytes.
    StatusReport {
        kind: StatusKind,
        block_start: u8,
        data: Vec<u8>,
    },
    IdentifyReply {
        attribute: u8,
        value: String,
    },
    /// Outbound request for a status report block.
    StatusRequest {
        level: bool,
        application: u8,
        block_start: u8,
    },
}

impl Cal {
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Err(WireError::truncated("CAL", 1, 0));
        }
        let kind = body[0] >> 4;
        let n = (body[0] & 0x0F) as usize;
        let rest = &body[1..];
        match kind {
            CAL_STATUS_REQUEST => {
                if n != 3 || rest.len() < 3 {
                    return Err(WireError::truncated("status request CAL", 4, body.len()));
                }
                Ok(Self::StatusRequest {
                    level: rest[0] != 0,
                    application: rest[1],
                    block_start: rest[2],
                })
            }
            CAL_ACKNOWLEDGE => {
                if rest.len() < n {
                    return Err(WireError::truncated("acknowledge CAL", 1 + n, body.len()));
                }
                Ok(Self::Acknowledge)
            }
            CAL_REPLY => {
                if n == 0 || rest.len() < n {
                    return Err(WireError::truncated("reply CAL", 1 + n.max(1), body.len()));
                }
                Ok(Self::Reply {
                    parameter: rest[0],
                    value: rest[1..n].to_vec(),
                })
            }
            CAL_IDENTIFY_REPLY => {
                if n == 0 || rest.len() < n {
                    return Err(WireError::truncated("identify CAL", 1 + n.max(1), body.len()));
                }
                Ok(Self::IdentifyReply {
                    attribute: rest[0],
                    value: String::from_utf8_lossy(&rest[1..n]).into_owned(),
                })
            }
            CAL_BINARY_REPORT => {
                if rest.is_empty() {
                    return Err(WireError::truncated("binary report CAL", 2, body.len()));
                }
                Ok(Self::StatusReport {
                    kind: StatusKind::Binary,
                    block_start: rest[0],
                    data: rest[1..].to_vec(),
                })
            }
            CAL_LEVEL_REPORT => {
                let need = 1 + 2 * REPORT_GROUPS;
                if rest.len() < need {
                    return Err(WireError::truncated("level report CAL", 1 + need, body.len()));
                }
                let levels = rest[1..need]
                    .chunks_exact(2)
                    .map(|pair| decode_level_pair(pair[0], pair[1]))
                    .collect();
                Ok(Self::StatusReport {
                    kind: StatusKind::Level,
                    block_start: rest[0],
                    data: levels,
                })
            }
            other => Err(WireError::UnknownCalKind { kind: other }),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::StatusRequest {
                level,
                application,
                block_start,
            } => out.extend_from_slice(&[
                CAL_STATUS_REQUEST << 4 | 3,
                u8::from(*level),
                *application,
                *block_start,
            ]),
            Self::Acknowledge => out.push(CAL_ACKNOWLEDGE << 4),
            Self::Reply { parameter, value } => {
                out.push(CAL_REPLY << 4 | (1 + value.len() as u8));
                out.push(*parameter);
                out.extend_from_slice(value);
            }
            Self::IdentifyReply { attribute, value } => {
                out.push(CAL_IDENTIFY_REPLY << 4 | (1 + value.len() as u8));
                out.push(*attribute);
                out.extend_from_slice(value.as_bytes());
            }
            Self::StatusReport {
                kind: StatusKind::Binary,
                block_start,
                data,
            } => {
                out.push(CAL_BINARY_REPORT << 4);
                out.push(*block_start);
                out.extend_from_slice(data);
            }
            Self::StatusReport {
                kind: StatusKind::Level,
                block_start,
                data,
            } => {
                out.push(CAL_LEVEL_REPORT << 4);
                out.push(*block_start);
                for &level in data {
                    let (lo, hi) = encode_level_pair(level);
                    out.push(lo);
                    out.push(hi);
                }
            }
        }
    }
}

/// Expand a two-byte group level. Each byte replicates one nibble of the
/// level; the low-nibble byte comes first.
fn decode_level_pair(lo: u8, hi: u8) -> u8 {
    (lo & 0x0F) | ((hi & 0x0F) << 4)
}

fn encode_level_pair(level: u8) -> (u8, u8) {
    let lo = level & 0x0F;
    let hi = level >> 4;
    (lo << 4 | lo, hi << 4 | hi)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
