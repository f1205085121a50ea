// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Current Time characteristic value encoding.
//!
//! The wire value is 10 bytes: year (u16 LE), month, day, hour, minute,
//! second, day of week, fractions of a second in 1/256 units, and an
//! adjust-reason byte that this protocol always leaves at zero.

use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use std::fmt;

use crate::error::CtsError;

/// Length of an encoded time value.
pub const TIME_VALUE_LEN: usize = 10;

/// Shortest value `decode` accepts. The trailing adjust-reason byte may be omitted.
pub const MIN_DECODE_LEN: usize = 9;

/// A wall-clock reading exchanged over the Current Time characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSample {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// Day of week, Monday = 1 .. Sunday = 7.
    pub weekday: u8,
    /// Sub-second part in 1/256 s ticks.
    pub fraction256: u8,
}

impl TimeSample {
    /// Build a sample from a single clock reading.
    ///
    /// Every field, including the fraction, comes from `now`, so the
    /// integer seconds and the fraction can never straddle a second boundary.
    pub fn from_datetime(now: NaiveDateTime) -> Self {
        // Leap seconds are reported as nanosecond() >= 1_000_000_000.
        let millis = (now.nanosecond() / 1_000_000).min(999);

        Self {
            year: now.year().clamp(0, u16::MAX as i32) as u16,
            month: now.month() as u8,
            day: now.day() as u8,
            hour: now.hour() as u8,
            minute: now.minute() as u8,
            second: now.second() as u8,
            weekday: now.weekday().number_from_monday() as u8,
            fraction256: (millis * 256 / 1000) as u8,
        }
    }

    /// Encode into the 10-byte wire layout.
    pub fn encode(&self) -> [u8; TIME_VALUE_LEN] {
        let year = self.year.to_le_bytes();
        [
            year[0],
            year[1],
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
            self.weekday,
            self.fraction256,
            0x00, // Adjust reason
        ]
    }

    /// Decode a characteristic value.
    ///
    /// The adjust-reason byte is ignored and may be missing entirely.
    pub fn decode(data: &[u8]) -> Result<Self, CtsError> {
        if data.len() < MIN_DECODE_LEN {
            return Err(CtsError::MalformedPayload { len: data.len() });
        }

        Ok(Self {
            year: u16::from_le_bytes([data[0], data[1]]),
            month: data[2],
            day: data[3],
            hour: data[4],
            minute: data[5],
            second: data[6],
            weekday: data[7],
            fraction256: data[8],
        })
    }

    /// Sub-second part rounded down to milliseconds.
    pub fn millis(&self) -> u32 {
        self.fraction256 as u32 * 1000 / 256
    }
}

impl fmt::Display for TimeSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}/{:02}/{:02}-{:02}:{:02}:{:02}.{:03}",
            self.year,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
            self.millis()
        )
    }
}

/// Source of wall-clock time for the server.
pub trait Clock: Send + Sync {
    /// Read the clock once.
    fn now(&self) -> NaiveDateTime;

    /// Take a sample from one clock reading.
    fn sample(&self) -> TimeSample {
        TimeSample::from_datetime(self.now())
    }
}

/// Local system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that can be set and advanced by hand.
#[derive(Debug)]
pub struct FixedClock {
    now: parking_lot::Mutex<NaiveDateTime>,
}

impl FixedClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: parking_lot::Mutex::new(now),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32, ms: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_milli_opt(h, mi, s, ms)
            .unwrap()
    }

    fn sample() -> TimeSample {
        TimeSample {
            year: 2024,
            month: 6,
            day: 15,
            hour: 13,
            minute: 45,
            second: 30,
            weekday: 6,
            fraction256: 128,
        }
    }

    #[test]
    fn test_year_little_endian() {
        let bytes = sample().encode();
        assert_eq!(bytes[0], 0xE8);
        assert_eq!(bytes[1], 0x07);
    }

    #[test]
    fn test_encode_layout() {
        let bytes = sample().encode();
        assert_eq!(bytes, [0xE8, 0x07, 6, 15, 13, 45, 30, 6, 128, 0]);
    }

    #[test]
    fn test_roundtrip_field_sweep() {
        let years = [0u16, 1, 0x00FF, 0x0100, 0x01FF, 1582, 2024, 9999, u16::MAX];
        let fractions = [0u8, 1, 127, 128, 255];
        for year in years {
            for month in 0..=13u8 {
                for day in [0u8, 1, 15, 28, 29, 30, 31] {
                    for hour in [0u8, 12, 23] {
                        for minute in [0u8, 59] {
                            for second in [0u8, 59] {
                                for weekday in 0..=7u8 {
                                    for fraction256 in fractions {
                                        let case = TimeSample {
                                            year,
                                            month,
                                            day,
                                            hour,
                                            minute,
                                            second,
                                            weekday,
                                            fraction256,
                                        };
                                        let decoded = TimeSample::decode(&case.encode()).unwrap();
                                        assert_eq!(decoded, case);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_roundtrip_calendar_sweep() {
        // Odd step so hours, minutes, seconds and millis all drift.
        let step = chrono::Duration::milliseconds(((7 * 60 + 13) * 60 + 17) * 1000 + 321);
        let mut now = at(1999, 12, 31, 23, 59, 59, 999);
        for _ in 0..20_000 {
            let decoded = TimeSample::decode(&TimeSample::from_datetime(now).encode()).unwrap();
            assert_eq!(decoded.year as i32, now.year());
            assert_eq!(decoded.month as u32, now.month());
            assert_eq!(decoded.day as u32, now.day());
            assert_eq!(decoded.hour as u32, now.hour());
            assert_eq!(decoded.minute as u32, now.minute());
            assert_eq!(decoded.second as u32, now.second());
            assert_eq!(decoded.weekday as u32, now.weekday().number_from_monday());
            let millis = now.nanosecond() / 1_000_000;
            assert!(millis - decoded.millis() < 4, "{} vs {}", now, decoded);
            now += step;
        }
    }

    #[test]
    fn test_reserved_byte_ignored() {
        let mut bytes = sample().encode();
        assert_eq!(bytes[9], 0);
        bytes[9] = 0xA5;
        assert_eq!(TimeSample::decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_reserved_byte_may_be_omitted() {
        let bytes = sample().encode();
        assert_eq!(TimeSample::decode(&bytes[..9]).unwrap(), sample());
    }

    #[test]
    fn test_short_payload_rejected() {
        let bytes = sample().encode();
        match TimeSample::decode(&bytes[..8]) {
            Err(CtsError::MalformedPayload { len }) => assert_eq!(len, 8),
            other => panic!("expected MalformedPayload, got {:?}", other),
        }
        assert!(TimeSample::decode(&[]).is_err());
    }

    #[test]
    fn test_from_datetime_single_snapshot() {
        // 2024-06-15 is a Saturday
        let s = TimeSample::from_datetime(at(2024, 6, 15, 13, 45, 30, 500));
        assert_eq!(s, sample());
    }

    #[test]
    fn test_fraction_scaling() {
        assert_eq!(TimeSample::from_datetime(at(2024, 1, 1, 0, 0, 0, 0)).fraction256, 0);
        assert_eq!(TimeSample::from_datetime(at(2024, 1, 1, 0, 0, 0, 250)).fraction256, 64);
        assert_eq!(TimeSample::from_datetime(at(2024, 1, 1, 0, 0, 0, 999)).fraction256, 255);
    }

    #[test]
    fn test_leap_second_fraction_clamped() {
        let leap = NaiveDate::from_ymd_opt(2016, 12, 31)
            .unwrap()
            .and_hms_milli_opt(23, 59, 59, 1_500)
            .unwrap();
        let s = TimeSample::from_datetime(leap);
        assert_eq!(s.second, 59);
        assert_eq!(s.fraction256, 255);
    }

    #[test]
    fn test_weekday_monday_is_one() {
        // 2024-06-17 is a Monday
        assert_eq!(TimeSample::from_datetime(at(2024, 6, 17, 0, 0, 0, 0)).weekday, 1);
        assert_eq!(TimeSample::from_datetime(at(2024, 6, 16, 0, 0, 0, 0)).weekday, 7);
    }

    #[test]
    fn test_display() {
        assert_eq!(sample().to_string(), "2024/06/15-13:45:30.500");
    }

    #[test]
    fn test_fixed_clock_advance() {
        let clock = FixedClock::new(at(2024, 6, 15, 13, 45, 30, 500));
        let first = clock.sample();
        clock.advance(chrono::Duration::seconds(1));
        let second = clock.sample();
        assert_ne!(first.second, second.second);
        assert_eq!(second.second, 31);
    }
}
