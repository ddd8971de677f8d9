//! Lighting application SALs.
//!
//! Self-delimiting items, opcode first:
//! ```text
//! 79 GG       on
//! 01 GG       off
//! 09 GG       terminate ramp
//! rr GG LL    ramp to level LL, rr in 02..=7A step 08
//! ```

use crate::error::{Result, WireError};

pub const SAL_ON: u8 = 0x79;
pub const SAL_OFF: u8 = 0x01;
pub const SAL_TERMINATE_RAMP: u8 = 0x09;

/// Ramp durations in seconds, indexed by duration code. The ramp opcode for
/// code `c` is `0x02 + 8 * c`.
pub const RAMP_DURATIONS: [u16; 16] = [
    0, 4, 8, 12, 20, 30, 40, 60, 90, 120, 180, 300, 420, 600, 900, 1020,
];

/// A lighting point-to-multipoint payload item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LightingSal {
    On { group: u8 },
    Off { group: u8 },
    Ramp { group: u8, level: u8, duration_code: u8 },
    TerminateRamp { group: u8 },
}

impl LightingSal {
    /// Decode one item from the front of `body`. Returns the item and the
    /// number of bytes it consumed.
    pub fn decode_one(application: u8, body: &[u8]) -> Result<(Self, usize)> {
        if body.is_empty() {
            return Err(WireError::truncated("lighting SAL", 1, 0));
        }
        let opcode = body[0];
        match opcode {
            SAL_ON | SAL_OFF | SAL_TERMINATE_RAMP => {
                if body.len() < 2 {
                    return Err(WireError::truncated("lighting SAL", 2, body.len()));
                }
                let group = body[1];
                let sal = match opcode {
                    SAL_ON => Self::On { group },
                    SAL_OFF => Self::Off { group },
                    _ => Self::TerminateRamp { group },
                };
                Ok((sal, 2))
            }
            _ if is_ramp_opcode(opcode) => {
                if body.len() < 3 {
                    return Err(WireError::truncated("ramp SAL", 3, body.len()));
                }
                Ok((
                    Self::Ramp {
                        group: body[1],
                        level: body[2],
                        duration_code: (opcode - 0x02) >> 3,
                    },
                    3,
                ))
            }
            _ => Err(WireError::UnknownOpcode {
                application,
                opcode,
            }),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Self::On { group } => out.extend_from_slice(&[SAL_ON, group]),
            Self::Off { group } => out.extend_from_slice(&[SAL_OFF, group]),
            Self::TerminateRamp { group } => {
                out.extend_from_slice(&[SAL_TERMINATE_RAMP, group])
            }
            Self::Ramp {
                group,
                level,
                duration_code,
            } => {
                let code = duration_code.min(15);
                out.extend_from_slice(&[0x02 + 8 * code, group, level]);
            }
        }
    }

    /// The group this item addresses.
    pub fn group(&self) -> u8 {
        match *self {
            Self::On { group }
            | Self::Off { group }
            | Self::Ramp { group, .. }
            | Self::TerminateRamp { group } => group,
        }
    }
}

fn is_ramp_opcode(opcode: u8) -> bool {
    (0x02..=0x7A).contains(&opcode) && opcode & 0x07 == 0x02
}

/// The smallest duration code whose ramp time covers `seconds`. Requests
/// beyond the table saturate at the longest ramp.
pub fn duration_code_for(seconds: u16) -> u8 {
    RAMP_DURATIONS
        .iter()
        .position(|&d| d >= seconds)
        .unwrap_or(RAMP_DURATIONS.len() - 1) as u8
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_on() {
        let (sal, used) = LightingSal::decode_one(0x38, &[0x79, 100]).unwrap();
        assert_eq!(sal, LightingSal::On { group: 100 });
        assert_eq!(used, 2);
    }

    #[test]
    fn decode_ramp_codes() {
        // 0x02 = instant, 0x7A = code 15 (1020s).
        let (sal, used) = LightingSal::decode_one(0x38, &[0x7A, 5, 0x80]).unwrap();
        assert_eq!(
            sal,
            LightingSal::Ramp { group: 5, level: 0x80, duration_code: 15 }
        );
        assert_eq!(used, 3);

        let (sal, _) = LightingSal::decode_one(0x38, &[0x12, 1, 0xFF]).unwrap();
        assert_eq!(
            sal,
            LightingSal::Ramp { group: 1, level: 0xFF, duration_code: 2 }
        );
    }

    #[test]
    fn round_trip_all_variants() {
        let sals = [
            LightingSal::On { group: 0 },
            LightingSal::Off { group: 255 },
            LightingSal::TerminateRamp { group: 7 },
            LightingSal::Ramp { group: 100, level: 128, duration_code: 9 },
        ];
        for sal in sals {
            let mut buf = Vec::new();
            sal.encode(&mut buf);
            let (decoded, used) = LightingSal::decode_one(0x38, &buf).unwrap();
            assert_eq!(decoded, sal);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn unknown_opcode() {
        assert!(matches!(
            LightingSal::decode_one(0x38, &[0xAB, 0]),
            Err(WireError::UnknownOpcode { opcode: 0xAB, .. })
        ));
    }

    #[test]
    fn truncated_ramp() {
        assert!(matches!(
            LightingSal::decode_one(0x38, &[0x0A, 1]),
            Err(WireError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn duration_code_picks_smallest_covering() {
        assert_eq!(duration_code_for(0), 0);
        assert_eq!(duration_code_for(1), 1); // 4s is the smallest ≥ 1s
        assert_eq!(duration_code_for(12), 3);
        assert_eq!(duration_code_for(13), 4); // 20s
        assert_eq!(duration_code_for(1020), 15);
        assert_eq!(duration_code_for(5000), 15); // saturates
    }
}
