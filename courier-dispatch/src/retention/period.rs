//! ISO-8601 durations (`P1Y2M3W4DT5H6M7S`) with calendar-aware subtraction

use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl Period {
    #[must_use]
    pub const fn days(days: u32) -> Self {
        Self {
            years: 0,
            months: 0,
            weeks: 0,
            days,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }

    #[must_use]
    pub const fn months(months: u32) -> Self {
        Self {
            years: 0,
            months,
            weeks: 0,
            days: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }

    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.years == 0
            && self.months == 0
            && self.weeks == 0
            && self.days == 0
            && self.hours == 0
            && self.minutes == 0
            && self.seconds == 0
    }

    /// The instant `self` before `instant`.
    ///
    /// Years and months are calendar months (clamping to the end of shorter
    /// months); the rest is a fixed duration. Saturates at the earliest
    /// representable instant.
    #[must_use]
    pub fn before(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let months = self.years.saturating_mul(12).saturating_add(self.months);
        let fixed = Duration::weeks(i64::from(self.weeks))
            + Duration::days(i64::from(self.days))
            + Duration::hours(i64::from(self.hours))
            + Duration::minutes(i64::from(self.minutes))
            + Duration::seconds(i64::from(self.seconds));

        instant
            .checked_sub_months(Months::new(months))
            .and_then(|shifted| shifted.checked_sub_signed(fixed))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("PT0S");
        }

        f.write_str("P")?;
        for (value, unit) in [
            (self.years, 'Y'),
            (self.months, 'M'),
            (self.weeks, 'W'),
            (self.days, 'D'),
        ] {
            if value > 0 {
                write!(f, "{value}{unit}")?;
            }
        }

        if self.hours > 0 || self.minutes > 0 || self.seconds > 0 {
            f.write_str("T")?;
            for (value, unit) in [(self.hours, 'H'), (self.minutes, 'M'), (self.seconds, 'S')] {
                if value > 0 {
                    write!(f, "{value}{unit}")?;
                }
            }
        }

        Ok(())
    }
}

impl FromStr for Period {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PolicyError::InvalidPeriod(s.to_string());

        let upper = s.trim().to_ascii_uppercase();
        let body = upper.strip_prefix('P').ok_or_else(invalid)?;
        if body.is_empty() {
            return Err(invalid());
        }

        let (date, time) = match body.split_once('T') {
            Some((date, time)) if !time.is_empty() => (date, Some(time)),
            Some(_) => return Err(invalid()),
            None => (body, None),
        };

        let mut period = Self::default();
        let mut seen_any = false;

        // Units must appear in this order, each at most once
        let mut units = ['Y', 'M', 'W', 'D'].into_iter();
        for (value, unit) in components(date).map_err(|()| invalid())? {
            let slot = match units.find(|&u| u == unit) {
                Some('Y') => &mut period.years,
                Some('M') => &mut period.months,
                Some('W') => &mut period.weeks,
                Some('D') => &mut period.days,
                _ => return Err(invalid()),
            };
            *slot = value;
            seen_any = true;
        }

        if let Some(time) = time {
            let mut units = ['H', 'M', 'S'].into_iter();
            for (value, unit) in components(time).map_err(|()| invalid())? {
                let slot = match units.find(|&u| u == unit) {
                    Some('H') => &mut period.hours,
                    Some('M') => &mut period.minutes,
                    Some('S') => &mut period.seconds,
                    _ => return Err(invalid()),
                };
                *slot = value;
                seen_any = true;
            }
        }

        if seen_any { Ok(period) } else { Err(invalid()) }
    }
}

/// Split `1Y2M` into `[(1, 'Y'), (2, 'M')]`.
fn components(s: &str) -> Result<Vec<(u32, char)>, ()> {
    let mut out = Vec::new();
    let mut digits = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else if digits.is_empty() {
            return Err(());
        } else {
            let value = digits.parse().map_err(|_| ())?;
            out.push((value, c));
            digits.clear();
        }
    }

    if digits.is_empty() { Ok(out) } else { Err(()) }
}

impl TryFrom<String> for Period {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_parse_full_period() {
        let period: Period = "P1Y2M3W4DT5H6M7S".parse().unwrap();
        assert_eq!(
            period,
            Period {
                years: 1,
                months: 2,
                weeks: 3,
                days: 4,
                hours: 5,
                minutes: 6,
                seconds: 7,
            }
        );
        assert_eq!(period.to_string(), "P1Y2M3W4DT5H6M7S");
    }

    #[test]
    fn test_minutes_versus_months() {
        let period: Period = "PT30M".parse().unwrap();
        assert_eq!(period.minutes, 30);
        assert_eq!(period.months, 0);

        let period: Period = "p6m".parse().unwrap();
        assert_eq!(period, Period::months(6));
    }

    #[test]
    fn test_rejects_malformed_periods() {
        for input in ["", "P", "PT", "1D", "PD", "P1", "P1D1Y", "P1X", "P1DT", "P-1D", "P1Y1Y"] {
            assert!(
                matches!(input.parse::<Period>(), Err(PolicyError::InvalidPeriod(_))),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_zero_period_display() {
        assert_eq!(Period::default().to_string(), "PT0S");
        assert_eq!("P0D".parse::<Period>().unwrap().to_string(), "PT0S");
    }

    #[test]
    fn test_before_uses_calendar_months() {
        let instant = Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap();
        assert_eq!(
            Period::months(1).before(instant),
            Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap()
        );
        assert_eq!(
            Period::days(31).before(instant),
            Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap()
        );
        assert_eq!(
            "P1YT1H".parse::<Period>().unwrap().before(instant),
            Utc.with_ymd_and_hms(2023, 3, 31, 11, 0, 0).unwrap()
        );
    }
}
