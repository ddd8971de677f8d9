//! Temperature broadcast application SAL.
//!
//! ```text
//! 02 GG TT    broadcast: group GG reads TT whole degrees
//! ```

use crate::error::{Result, WireError};

pub const SAL_BROADCAST: u8 = 0x02;

/// A temperature application payload item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemperatureSal {
    Broadcast { group: u8, degrees: u8 },
}

impl TemperatureSal {
    /// Decode one item from the front of `body`. Returns the item and the
    /// number of bytes it consumed.
    pub fn decode_one(application: u8, body: &[u8]) -> Result<(Self, usize)> {
        if body.is_empty() {
            return Err(WireError::truncated("temperature SAL", 1, 0));
        }
        match body[0] {
            SAL_BROADCAST => {
                if body.len() < 3 {
                    return Err(WireError::truncated("temperature broadcast", 3, body.len()));
                }
                Ok((
                    Self::Broadcast {
                        group: body[1],
                        degrees: body[2],
                    },
                    3,
                ))
            }
            other => Err(WireError::UnknownOpcode {
                application,
                opcode: other,
            }),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Self::Broadcast { group, degrees } => {
                out.extend_from_slice(&[SAL_BROADCAST, group, degrees])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let sal = TemperatureSal::Broadcast { group: 4, degrees: 21 };
        let mut buf = Vec::new();
        sal.encode(&mut buf);
        assert_eq!(buf, [0x02, 4, 21]);
        let (decoded, used) = TemperatureSal::decode_one(0x19, &buf).unwrap();
        assert_eq!(decoded, sal);
        assert_eq!(used, 3);
    }

    #[test]
    fn truncated() {
        assert!(TemperatureSal::decode_one(0x19, &[0x02, 4]).is_err());
    }
}
