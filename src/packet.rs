//! The five PCI packet envelopes.
//!
//! The first body byte selects the envelope:
//!
//! ```text
//! 05 SRC APP 00 SAL..     point-to-multipoint
//! 06 UNIT APP CAL..       point-to-point
//! ~                       reset echo
//! #                       PCI error
//! <tag> .|!               confirmation
//! ```
//!
//! Hex envelopes travel as `\` + hex-ASCII(body + checksum) + CR; the short
//! envelopes travel as their raw ASCII. [`RxBuffer`](crate::frame::RxBuffer)
//! has already validated and stripped the checksum by the time a body
//! reaches [`Packet::decode`].

use log::warn;

use crate::codec;
use crate::error::{Result, WireError};
use crate::frame::{CR, FRAME_START, PCI_ERROR, RESET};
use crate::protocol::{self, Cal, Sal};
use crate::tags::is_tag;

pub const ENV_POINT_TO_MULTIPOINT: u8 = 0x05;
pub const ENV_POINT_TO_POINT: u8 = 0x06;

/// A decoded packet envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Reset,
    Confirmation { tag: u8, success: bool },
    PciError,
    PointToMultipoint {
        source: u8,
        application: u8,
        sals: Vec<Sal>,
    },
    PointToPoint {
        unit: u8,
        application: u8,
        cal: Cal,
    },
}

impl Packet {
    /// Decode a checksum-stripped frame body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        match body {
            [] => Err(WireError::ShortFrame { len: 0 }),
            [RESET] => Ok(Packet::Reset),
            [PCI_ERROR] => Ok(Packet::PciError),
            [tag, mark @ (b'.' | b'!')] if is_tag(*tag) => Ok(Packet::Confirmation {
                tag: *tag,
                success: *mark == b'.',
            }),
            [ENV_POINT_TO_MULTIPOINT, rest @ ..] => {
                if rest.len() < 4 {
                    return Err(WireError::truncated("point-to-multipoint", 5, body.len()));
                }
                // A bad item abandons the rest of the stream but not the
                // items already decoded; the packet is consumed either way.
                let (sals, trailing) = protocol::decode_sals(rest[1], &rest[3..]);
                match trailing {
                    Some(e) if sals.is_empty() => return Err(e),
                    Some(e) => warn!("abandoning SAL stream after {} item(s): {e}", sals.len()),
                    None => {}
                }
                Ok(Packet::PointToMultipoint {
                    source: rest[0],
                    application: rest[1],
                    sals,
                })
            }
            [ENV_POINT_TO_POINT, rest @ ..] => {
                if rest.len() < 3 {
                    return Err(WireError::truncated("point-to-point", 4, body.len()));
                }
                let cal = Cal::decode(&rest[2..])?;
                Ok(Packet::PointToPoint {
                    unit: rest[0],
                    application: rest[1],
                    cal,
                })
            }
            [first, ..] => Err(WireError::UnknownEnvelope { first: *first }),
        }
    }

    /// Encode the body bytes (checksum not yet appended).
    pub fn encode_body(&self) -> Vec<u8> {
        match self {
            Packet::Reset => vec![RESET],
            Packet::PciError => vec![PCI_ERROR],
            Packet::Confirmation { tag, success } => {
                vec![*tag, if *success { b'.' } else { b'!' }]
            }
            Packet::PointToMultipoint {
                source,
                application,
                sals,
            } => {
                let mut body = vec![ENV_POINT_TO_MULTIPOINT, *source, *application, 0x00];
                protocol::encode_sals(sals, &mut body);
                body
            }
            Packet::PointToPoint {
                unit,
                application,
                cal,
            } => {
                let mut body = vec![ENV_POINT_TO_POINT, *unit, *application];
                cal.encode(&mut body);
                body
            }
        }
    }

    /// Encode the complete wire frame.
    pub fn encode_frame(&self) -> Vec<u8> {
        match self {
            Packet::Reset => vec![RESET],
            Packet::PciError => vec![PCI_ERROR, CR],
            Packet::Confirmation { .. } => {
                let mut wire = self.encode_body();
                wire.push(CR);
                wire
            }
            _ => wrap_body(&self.encode_body()),
        }
    }

    /// Encode the complete wire frame with a confirmation tag spliced in as
    /// the final body byte before the checksum.
    pub fn encode_frame_tagged(&self, tag: u8) -> Vec<u8> {
        let mut body = self.encode_body();
        body.push(tag);
        wrap_body(&body)
    }
}

/// `\` + hex-ASCII(body + checksum) + CR.
pub(crate) fn wrap_body(body: &[u8]) -> Vec<u8> {
    let mut full = body.to_vec();
    full.push(codec::checksum(body));
    let mut wire = Vec::with_capacity(2 + full.len() * 2);
    wire.push(FRAME_START);
    codec::encode_hex(&full, &mut wire);
    wire.push(CR);
    wire
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RxBuffer;
    use crate::protocol::{ClockSal, LightingSal, StatusKind, TemperatureSal};

    #[test]
    fn lighting_on_frame_bytes() {
        // Worked example: app 0x38, group 100, source 0xFF, tag 'h'.
        let packet = Packet::PointToMultipoint {
            source: 0xFF,
            application: 0x38,
            sals: vec![Sal::Lighting(LightingSal::On { group: 100 })],
        };
        let wire = packet.encode_frame_tagged(b'h');
        assert_eq!(wire, b"\\05FF38007964687F\r");
    }

    #[test]
    fn frame_decodes_through_rx_buffer() {
        let packet = Packet::PointToMultipoint {
            source: 0xFF,
            application: 0x38,
            sals: vec![
                Sal::Lighting(LightingSal::On { group: 1 }),
                Sal::Lighting(LightingSal::Off { group: 2 }),
            ],
        };
        let mut rx = RxBuffer::new();
        let frames = rx.feed(&packet.encode_frame());
        assert_eq!(frames.len(), 1);
        let body = frames[0].as_ref().unwrap();
        assert_eq!(Packet::decode(body).unwrap(), packet);
    }

    #[test]
    fn confirmation_forms() {
        assert_eq!(
            Packet::decode(b"h.").unwrap(),
            Packet::Confirmation { tag: b'h', success: true }
        );
        assert_eq!(
            Packet::decode(b"z!").unwrap(),
            Packet::Confirmation { tag: b'z', success: false }
        );
    }

    #[test]
    fn reset_and_error() {
        assert_eq!(Packet::decode(b"~").unwrap(), Packet::Reset);
        assert_eq!(Packet::decode(b"#").unwrap(), Packet::PciError);
    }

    #[test]
    fn round_trip_every_envelope() {
        let levels: Vec<u8> = (0..16).map(|i| (i * 16) as u8).collect();
        let packets = [
            Packet::Reset,
            Packet::PciError,
            Packet::Confirmation { tag: b'k', success: true },
            Packet::PointToMultipoint {
                source: 0x0C,
                application: 0x38,
                sals: vec![Sal::Lighting(LightingSal::Ramp {
                    group: 3,
                    level: 200,
                    duration_code: 5,
                })],
            },
            Packet::PointToMultipoint {
                source: 0xFF,
                application: 0xDF,
                sals: vec![Sal::Clock(ClockSal::Request { attribute: 1 })],
            },
            Packet::PointToMultipoint {
                source: 0x20,
                application: 0x19,
                sals: vec![Sal::Temperature(TemperatureSal::Broadcast {
                    group: 2,
                    degrees: 24,
                })],
            },
            Packet::PointToPoint {
                unit: 0xFF,
                application: 0x38,
                cal: Cal::StatusReport {
                    kind: StatusKind::Level,
                    block_start: 0x40,
                    data: levels,
                },
            },
        ];
        for packet in packets {
            let body = packet.encode_body();
            assert_eq!(Packet::decode(&body).unwrap(), packet, "{body:02X?}");
        }
    }

    #[test]
    fn unknown_envelope() {
        assert!(matches!(
            Packet::decode(&[0x07, 0x00]),
            Err(WireError::UnknownEnvelope { first: 0x07 })
        ));
    }

    #[test]
    fn truncated_pm() {
        assert!(matches!(
            Packet::decode(&[0x05, 0xFF, 0x38]),
            Err(WireError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn empty_sal_stream_rejected() {
        // A PM body with routing byte but no SAL items.
        assert!(Packet::decode(&[0x05, 0xFF, 0x38, 0x00]).is_err());
    }

    #[test]
    fn sal_prefix_survives_bad_tail() {
        // On(100), then a ramp item cut short: the packet still carries the
        // one good item.
        let body = [0x05, 0xFF, 0x38, 0x00, 0x79, 0x64, 0x22, 0x05];
        match Packet::decode(&body).unwrap() {
            Packet::PointToMultipoint { sals, .. } => {
                assert_eq!(sals, vec![Sal::Lighting(LightingSal::On { group: 100 })]);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn bad_leading_sal_drops_packet() {
        assert!(matches!(
            Packet::decode(&[0x05, 0xFF, 0x38, 0x00, 0xAB, 0x01]),
            Err(WireError::UnknownOpcode { opcode: 0xAB, .. })
        ));
    }
}
