//! Application payloads and decode/encode dispatch.
//!
//! - [`Sal`] — point-to-multipoint items (lighting, clock, temperature)
//! - [`cal::Cal`] — point-to-point payloads (status, identify, replies)
//!
//! A point-to-multipoint packet carries one application byte and a non-empty
//! stream of self-delimiting SAL items for that application. The application
//! byte selects the item grammar; anything outside the clock and temperature
//! applications decodes with the lighting grammar, which is how C-Bus treats
//! its block of lighting-compatible application numbers.

pub mod cal;
pub mod clock;
pub mod lighting;
pub mod temperature;

use crate::error::WireError;

pub use cal::{Cal, StatusKind};
pub use clock::{ClockSal, WallTime};
pub use lighting::LightingSal;
pub use temperature::TemperatureSal;

// ---------------------------------------------------------------------------
// Application numbers
// ---------------------------------------------------------------------------

/// Default lighting application.
pub const APP_LIGHTING: u8 = 0x38;
/// Clock and timekeeping application.
pub const APP_CLOCK: u8 = 0xDF;
/// Temperature broadcast application.
pub const APP_TEMPERATURE: u8 = 0x19;
/// Status request pseudo-application (point-to-point requests).
pub const APP_STATUS_REQUEST: u8 = 0xFF;

// ---------------------------------------------------------------------------
// SAL — point-to-multipoint items
// ---------------------------------------------------------------------------

/// One point-to-multipoint application payload item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sal {
    Lighting(LightingSal),
    Clock(ClockSal),
    Temperature(TemperatureSal),
}

impl Sal {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Sal::Lighting(s) => s.encode(out),
            Sal::Clock(s) => s.encode(out),
            Sal::Temperature(s) => s.encode(out),
        }
    }
}

/// Decode a SAL stream for one application.
///
/// Stops at end of body, or at the first item whose declared length overruns
/// the body. Items decoded before a bad one are kept and returned together
/// with the error; the rest of the stream is abandoned.
pub fn decode_sals(application: u8, mut body: &[u8]) -> (Vec<Sal>, Option<WireError>) {
    let mut sals = Vec::new();
    while !body.is_empty() {
        let item = match application {
            APP_CLOCK => {
                ClockSal::decode_one(application, body).map(|(s, n)| (Sal::Clock(s), n))
            }
            APP_TEMPERATURE => TemperatureSal::decode_one(application, body)
                .map(|(s, n)| (Sal::Temperature(s), n)),
            _ => LightingSal::decode_one(application, body)
                .map(|(s, n)| (Sal::Lighting(s), n)),
        };
        match item {
            Ok((sal, used)) => {
                sals.push(sal);
                body = &body[used..];
            }
            Err(e) => return (sals, Some(e)),
        }
    }
    (sals, None)
}

/// Encode a SAL stream.
pub fn encode_sals(sals: &[Sal], out: &mut Vec<u8>) {
    for sal in sals {
        sal.encode(out);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
