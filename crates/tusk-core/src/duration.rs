use std::fmt;
use std::str::FromStr;

use crate::error::Error;

const SECOND: i64 = 1;
const MINUTE: i64 = 60;
const HOUR: i64 = 3600;
const DAY: i64 = 86400;

/// Unit table. `standalone` marks units that form a duration with no leading
/// quantity ("weekly", "daily", ...).
const UNITS: &[(&str, i64, bool)] = &[
    ("annual", 365 * DAY, true),
    ("biannual", 730 * DAY, true),
    ("bimonthly", 61 * DAY, true),
    ("biweekly", 14 * DAY, true),
    ("biyearly", 730 * DAY, true),
    ("daily", DAY, true),
    ("days", DAY, false),
    ("day", DAY, true),
    ("d", DAY, false),
    ("fortnight", 14 * DAY, true),
    ("hours", HOUR, false),
    ("hour", HOUR, true),
    ("hrs", HOUR, false),
    ("hr", HOUR, true),
    ("h", HOUR, false),
    ("minutes", MINUTE, false),
    ("minute", MINUTE, true),
    ("mins", MINUTE, false),
    ("min", MINUTE, true),
    ("monthly", 30 * DAY, true),
    ("months", 30 * DAY, false),
    ("month", 30 * DAY, true),
    ("mnths", 30 * DAY, false),
    ("mths", 30 * DAY, false),
    ("mth", 30 * DAY, true),
    ("mos", 30 * DAY, false),
    ("mo", 30 * DAY, true),
    ("quarterly", 91 * DAY, true),
    ("quarters", 91 * DAY, false),
    ("quarter", 91 * DAY, true),
    ("qtrs", 91 * DAY, false),
    ("qtr", 91 * DAY, true),
    ("q", 91 * DAY, false),
    ("semiannual", 183 * DAY, true),
    ("sennight", 7 * DAY, true),
    ("seconds", SECOND, false),
    ("second", SECOND, true),
    ("secs", SECOND, false),
    ("sec", SECOND, true),
    ("s", SECOND, false),
    ("weekdays", DAY, true),
    ("weekly", 7 * DAY, true),
    ("weeks", 7 * DAY, false),
    ("week", 7 * DAY, true),
    ("wks", 7 * DAY, false),
    ("wk", 7 * DAY, true),
    ("w", 7 * DAY, false),
    ("yearly", 365 * DAY, true),
    ("years", 365 * DAY, false),
    ("year", 365 * DAY, true),
    ("yrs", 365 * DAY, false),
    ("yr", 365 * DAY, true),
    ("y", 365 * DAY, false),
];

/// Units used when rendering, largest first.
const RENDER_UNITS: &[(&str, i64)] = &[
    ("y", 365 * DAY),
    ("mo", 30 * DAY),
    ("w", 7 * DAY),
    ("d", DAY),
    ("h", HOUR),
    ("min", MINUTE),
    ("s", SECOND),
];

/// A span of time, stored as whole seconds. Parsed from `<n><unit>` forms,
/// standalone period words, and ISO-8601 `PnDTnHnMnS` periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration {
    seconds: i64,
}

impl Duration {
    pub fn from_seconds(seconds: i64) -> Self {
        Self { seconds }
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn to_chrono(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.seconds)
    }

    /// Recognizer used by the lexer. Unlike `from_str`, a bare-`d` duration
    /// whose quantity exceeds 10000 is refused so that an eight-hex-digit
    /// run such as `1234567d` stays available as a uuid prefix.
    pub fn parse_token(input: &str) -> Option<Self> {
        let parsed = parse_duration(input)?;
        if parsed.unit == "d" && parsed.quantity > 10_000.0 {
            return None;
        }
        Some(Duration {
            seconds: parsed.seconds,
        })
    }
}

struct ParsedDuration {
    quantity: f64,
    unit: &'static str,
    seconds: i64,
}

fn parse_duration(input: &str) -> Option<ParsedDuration> {
    let text = input.trim();
    if text.is_empty() {
        return None;
    }

    if let Some(seconds) = parse_iso_period(text) {
        return Some(ParsedDuration {
            quantity: 1.0,
            unit: "s",
            seconds,
        });
    }

    let split = text
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let (number_part, unit_part) = text.split_at(split);

    let unit_lower = unit_part.to_ascii_lowercase();
    let entry = UNITS.iter().find(|(unit, _, _)| *unit == unit_lower)?;
    let (unit, unit_seconds, standalone) = (entry.0, entry.1, entry.2);

    if number_part.is_empty() {
        if !standalone {
            return None;
        }
        return Some(ParsedDuration {
            quantity: 1.0,
            unit,
            seconds: unit_seconds,
        });
    }

    let quantity: f64 = number_part.parse().ok()?;
    Some(ParsedDuration {
        quantity,
        unit,
        seconds: (quantity * unit_seconds as f64) as i64,
    })
}

/// `PnYnMnDTnHnMnS` and the `P<date>T<time>` designator forms.
fn parse_iso_period(text: &str) -> Option<i64> {
    let rest = text.strip_prefix('P').or_else(|| text.strip_prefix('p'))?;
    let (date_part, time_part) = match rest.split_once(['T', 't']) {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };

    let mut seconds = 0_i64;
    let mut any = false;

    for (part, units) in [
        (date_part, &[('Y', 365 * DAY), ('M', 30 * DAY), ('W', 7 * DAY), ('D', DAY)][..]),
        (time_part, &[('H', HOUR), ('M', MINUTE), ('S', SECOND)][..]),
    ] {
        let mut number = String::new();
        for c in part.chars() {
            if c.is_ascii_digit() {
                number.push(c);
                continue;
            }
            let unit = c.to_ascii_uppercase();
            let scale = units.iter().find(|(u, _)| *u == unit)?.1;
            let n: i64 = number.parse().ok()?;
            seconds += n * scale;
            number.clear();
            any = true;
        }
        if !number.is_empty() {
            return None;
        }
    }

    if any { Some(seconds) } else { None }
}

impl FromStr for Duration {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s)
            .map(|p| Duration { seconds: p.seconds })
            .ok_or_else(|| Error::Parse(format!("not a duration: '{s}'")))
    }
}

impl fmt::Display for Duration {
    /// Canonical representative: the largest unit that divides the span
    /// evenly, so `parse(render(d)) == d` for every table entry.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seconds == 0 {
            return write!(f, "0s");
        }

        let magnitude = self.seconds.abs();
        for (unit, scale) in RENDER_UNITS {
            if magnitude % scale == 0 {
                return write!(f, "{}{}", self.seconds / scale, unit);
            }
        }
        write!(f, "{}s", self.seconds)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{DAY, Duration, HOUR, MINUTE};

    #[test]
    fn counted_units() {
        assert_eq!(Duration::from_str("5s").expect("5s").seconds(), 5);
        assert_eq!(Duration::from_str("10min").expect("10min").seconds(), 10 * MINUTE);
        assert_eq!(Duration::from_str("3h").expect("3h").seconds(), 3 * HOUR);
        assert_eq!(Duration::from_str("2d").expect("2d").seconds(), 2 * DAY);
        assert_eq!(Duration::from_str("1w").expect("1w").seconds(), 7 * DAY);
        assert_eq!(Duration::from_str("4mo").expect("4mo").seconds(), 120 * DAY);
        assert_eq!(Duration::from_str("2q").expect("2q").seconds(), 182 * DAY);
        assert_eq!(Duration::from_str("1y").expect("1y").seconds(), 365 * DAY);
    }

    #[test]
    fn standalone_words() {
        assert_eq!(Duration::from_str("daily").expect("daily").seconds(), DAY);
        assert_eq!(Duration::from_str("weekly").expect("weekly").seconds(), 7 * DAY);
        assert_eq!(Duration::from_str("biweekly").expect("biweekly").seconds(), 14 * DAY);
        assert_eq!(Duration::from_str("fortnight").expect("fortnight").seconds(), 14 * DAY);
        assert_eq!(Duration::from_str("sennight").expect("sennight").seconds(), 7 * DAY);
        assert_eq!(Duration::from_str("monthly").expect("monthly").seconds(), 30 * DAY);
        assert_eq!(Duration::from_str("quarterly").expect("quarterly").seconds(), 91 * DAY);
        assert_eq!(Duration::from_str("annual").expect("annual").seconds(), 365 * DAY);
        assert_eq!(Duration::from_str("biannual").expect("biannual").seconds(), 730 * DAY);
        assert_eq!(Duration::from_str("weekdays").expect("weekdays").seconds(), DAY);
    }

    #[test]
    fn abbreviations_are_not_standalone() {
        assert!(Duration::from_str("d").is_err());
        assert!(Duration::from_str("w").is_err());
        assert!(Duration::from_str("day").is_ok());
        assert!(Duration::from_str("week").is_ok());
    }

    #[test]
    fn iso_periods() {
        assert_eq!(Duration::from_str("P1D").expect("P1D").seconds(), DAY);
        assert_eq!(
            Duration::from_str("P1DT12H").expect("P1DT12H").seconds(),
            DAY + 12 * HOUR
        );
        assert_eq!(Duration::from_str("PT30M").expect("PT30M").seconds(), 30 * MINUTE);
        assert_eq!(
            Duration::from_str("P1Y1M1DT1H1M1S").expect("full period").seconds(),
            365 * DAY + 30 * DAY + DAY + HOUR + MINUTE + 1
        );
    }

    #[test]
    fn lexer_token_rejects_uuid_lookalike_days() {
        assert!(Duration::parse_token("1234567d").is_none());
        assert!(Duration::parse_token("10000d").is_some());
        assert!(Duration::parse_token("9999d").is_some());
    }

    #[test]
    fn render_round_trip_per_unit() {
        for seconds in [5, 90, 3600, 2 * DAY, 7 * DAY, 30 * DAY, 365 * DAY] {
            let d = Duration::from_seconds(seconds);
            let rendered = d.to_string();
            let reparsed = Duration::from_str(&rendered).expect("reparse rendered duration");
            assert_eq!(reparsed, d, "round-trip failed for {rendered}");
        }
    }

    #[test]
    fn fractional_quantities() {
        assert_eq!(Duration::from_str("1.5h").expect("1.5h").seconds(), 5400);
        assert_eq!(Duration::from_str("0.5d").expect("0.5d").seconds(), DAY / 2);
    }
}
