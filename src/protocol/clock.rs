//! Clock-and-timekeeping application SALs.
//!
//! ```text
//! 08 01 HH MM SS FF          time update (FF = 1/100ths of a second)
//! 08 02 YH YL MO DD DW       date update (year big-endian, DW 1=Mon..7=Sun)
//! 11 AA                      request (AA = attribute being asked for)
//! ```

use chrono::{Datelike, Local, Timelike};

use crate::error::{Result, WireError};

pub const SAL_CLOCK_UPDATE: u8 = 0x08;
pub const SAL_CLOCK_REQUEST: u8 = 0x11;

/// Attribute code for time-of-day.
pub const ATTR_TIME: u8 = 0x01;
/// Attribute code for calendar date.
pub const ATTR_DATE: u8 = 0x02;

/// A clock application payload item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockSal {
    TimeUpdate {
        hour: u8,
        minute: u8,
        second: u8,
        /// Hundredths of a second.
        fractional: u8,
    },
    DateUpdate {
        year: u16,
        month: u8,
        day: u8,
        weekday: u8,
    },
    Request {
        attribute: u8,
    },
}

impl ClockSal {
    /// Decode one item from the front of `body`. Returns the item and the
    /// number of bytes it consumed.
    pub fn decode_one(application: u8, body: &[u8]) -> Result<(Self, usize)> {
        if body.is_empty() {
            return Err(WireError::truncated("clock SAL", 1, 0));
        }
        match body[0] {
            SAL_CLOCK_UPDATE => {
                if body.len() < 2 {
                    return Err(WireError::truncated("clock update", 2, body.len()));
                }
                match body[1] {
                    ATTR_TIME => {
                        if body.len() < 6 {
                            return Err(WireError::truncated("time update", 6, body.len()));
                        }
                        Ok((
                            Self::TimeUpdate {
                                hour: body[2],
                                minute: body[3],
                                second: body[4],
                                fractional: body[5],
                            },
                            6,
                        ))
                    }
                    ATTR_DATE => {
                        if body.len() < 7 {
                            return Err(WireError::truncated("date update", 7, body.len()));
                        }
                        Ok((
                            Self::DateUpdate {
                                year: u16::from_be_bytes([body[2], body[3]]),
                                month: body[4],
                                day: body[5],
                                weekday: body[6],
                            },
                            7,
                        ))
                    }
                    other => Err(WireError::UnknownOpcode {
                        application,
                        opcode: other,
                    }),
                }
            }
            SAL_CLOCK_REQUEST => {
                if body.len() < 2 {
                    return Err(WireError::truncated("clock request", 2, body.len()));
                }
                Ok((Self::Request { attribute: body[1] }, 2))
            }
            other => Err(WireError::UnknownOpcode {
                application,
                opcode: other,
            }),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Self::TimeUpdate {
                hour,
                minute,
                second,
                fractional,
            } => out.extend_from_slice(&[
                SAL_CLOCK_UPDATE,
                ATTR_TIME,
                hour,
                minute,
                second,
                fractional,
            ]),
            Self::DateUpdate {
                year,
                month,
                day,
                weekday,
            } => {
                let [yh, yl] = year.to_be_bytes();
                out.extend_from_slice(&[SAL_CLOCK_UPDATE, ATTR_DATE, yh, yl, month, day, weekday]);
            }
            Self::Request { attribute } => out.extend_from_slice(&[SAL_CLOCK_REQUEST, attribute]),
        }
    }
}

/// A wall-clock reading ready for SAL encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    /// ISO weekday, 1 = Monday.
    pub weekday: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// Hundredths of a second.
    pub fractional: u8,
}

impl WallTime {
    /// Read the local wall clock.
    pub fn now() -> Self {
        let now = Local::now();
        Self {
            year: now.year() as u16,
            month: now.month() as u8,
            day: now.day() as u8,
            weekday: now.weekday().number_from_monday() as u8,
            hour: now.hour() as u8,
            minute: now.minute() as u8,
            second: now.second() as u8,
            fractional: (now.timestamp_subsec_millis() / 10) as u8,
        }
    }

    pub fn time_sal(&self) -> ClockSal {
        ClockSal::TimeUpdate {
            hour: self.hour,
            minute: self.minute,
            second: self.second,
            fractional: self.fractional,
        }
    }

    pub fn date_sal(&self) -> ClockSal {
        ClockSal::DateUpdate {
            year: self.year,
            month: self.month,
            day: self.day,
            weekday: self.weekday,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
