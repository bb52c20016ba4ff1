use chrono::{
    DateTime, Datelike, Days, Duration, Local, Months, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Timelike, Utc, Weekday,
};
use tracing::trace;

/// Wire format for dates in the backlog / export JSON and the undo log
/// rendering.
pub const WIRE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

const WEEKDAYS: &[(&str, Weekday)] = &[
    ("monday", Weekday::Mon),
    ("tuesday", Weekday::Tue),
    ("wednesday", Weekday::Wed),
    ("thursday", Weekday::Thu),
    ("friday", Weekday::Fri),
    ("saturday", Weekday::Sat),
    ("sunday", Weekday::Sun),
];

const MONTHS: &[&str] = &[
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december",
];

/// Settings the date recognizer needs from configuration: the display
/// template and the first day of the week.
#[derive(Debug, Clone)]
pub struct DateSettings {
    pub dateformat: String,
    pub weekstart: Weekday,
}

impl Default for DateSettings {
    fn default() -> Self {
        Self {
            dateformat: "Y-M-D".to_string(),
            weekstart: Weekday::Sun,
        }
    }
}

pub fn render_wire(dt: DateTime<Utc>) -> String {
    dt.format(WIRE_FORMAT).to_string()
}

pub fn parse_wire(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, WIRE_FORMAT)
        .ok()
        .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
}

/// Parse any supported date form: named dates, ISO-8601 extended and basic,
/// and the configured `dateformat` template. Named forms are resolved to
/// absolute instants immediately; nothing is deferred to render time.
pub fn parse_date(input: &str, now: DateTime<Utc>, settings: &DateSettings) -> Option<DateTime<Utc>> {
    let token = input.trim();
    if token.is_empty() {
        return None;
    }

    if let Some(dt) = parse_named(token, now, settings) {
        trace!(input = token, resolved = %render_wire(dt), "named date");
        return Some(dt);
    }

    if let Some(dt) = parse_iso(token) {
        return Some(dt);
    }

    parse_template(token, &settings.dateformat)
}

fn local_midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    let midnight = date.and_hms_opt(0, 0, 0)?;
    Local
        .from_local_datetime(&midnight)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

fn end_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    let last = date.and_hms_opt(23, 59, 59)?;
    Local
        .from_local_datetime(&last)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_named(token: &str, now: DateTime<Utc>, settings: &DateSettings) -> Option<DateTime<Utc>> {
    let lower = token.to_ascii_lowercase();
    let local_today = now.with_timezone(&Local).date_naive();

    match lower.as_str() {
        "now" => return Some(now),
        "today" | "sod" => return local_midnight(local_today),
        "eod" => return end_of_day(local_today),
        "yesterday" => return local_midnight(local_today.pred_opt()?),
        "tomorrow" => return local_midnight(local_today.succ_opt()?),
        "socw" => return local_midnight(week_start(local_today, settings.weekstart)),
        "sow" => {
            let start = week_start(local_today, settings.weekstart);
            return local_midnight(start.checked_add_days(Days::new(7))?);
        }
        "eow" | "eocw" => {
            let start = week_start(local_today, settings.weekstart);
            return end_of_day(start.checked_add_days(Days::new(6))?);
        }
        "soww" => return local_midnight(week_start(local_today, Weekday::Mon)),
        "eoww" => {
            let monday = week_start(local_today, Weekday::Mon);
            return end_of_day(monday.checked_add_days(Days::new(4))?);
        }
        "socm" => return local_midnight(local_today.with_day(1)?),
        "som" => {
            let first = local_today.with_day(1)?;
            return local_midnight(first.checked_add_months(Months::new(1))?);
        }
        "eom" | "eocm" => {
            let first = local_today.with_day(1)?;
            let next = first.checked_add_months(Months::new(1))?;
            return end_of_day(next.pred_opt()?);
        }
        "soq" => {
            let quarter_month = ((local_today.month0() / 3) * 3) + 1;
            let start = NaiveDate::from_ymd_opt(local_today.year(), quarter_month, 1)?;
            return local_midnight(start.checked_add_months(Months::new(3))?);
        }
        "eoq" => {
            let quarter_month = ((local_today.month0() / 3) * 3) + 1;
            let start = NaiveDate::from_ymd_opt(local_today.year(), quarter_month, 1)?;
            let next = start.checked_add_months(Months::new(3))?;
            return end_of_day(next.pred_opt()?);
        }
        "soy" => return local_midnight(NaiveDate::from_ymd_opt(local_today.year() + 1, 1, 1)?),
        "eoy" => return end_of_day(NaiveDate::from_ymd_opt(local_today.year(), 12, 31)?),
        "someday" | "later" => {
            return local_midnight(NaiveDate::from_ymd_opt(2038, 1, 18)?);
        }
        _ => {}
    }

    // Weekday names resolve to the next future occurrence.
    for (name, weekday) in WEEKDAYS {
        if lower == *name || lower == name[..3] {
            let mut date = local_today.succ_opt()?;
            while date.weekday() != *weekday {
                date = date.succ_opt()?;
            }
            return local_midnight(date);
        }
    }

    // Month names resolve to the 1st of the next occurrence.
    for (idx, name) in MONTHS.iter().enumerate() {
        if lower == *name || lower == name[..3] {
            let month = idx as u32 + 1;
            let year = if month > local_today.month() {
                local_today.year()
            } else {
                local_today.year() + 1
            };
            return local_midnight(NaiveDate::from_ymd_opt(year, month, 1)?);
        }
    }

    None
}

fn week_start(today: NaiveDate, weekstart: Weekday) -> NaiveDate {
    let mut date = today;
    while date.weekday() != weekstart {
        date = match date.pred_opt() {
            Some(d) => d,
            None => return date,
        };
    }
    date
}

fn parse_iso(token: &str) -> Option<DateTime<Utc>> {
    // Wire / basic datetime forms first; they are unambiguous.
    if let Some(dt) = parse_wire(token) {
        return Some(dt);
    }
    for fmt in ["%Y%m%dT%H%M%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(token, fmt) {
            return Local
                .from_local_datetime(&ndt)
                .single()
                .map(|dt| dt.with_timezone(&Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(token) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%d", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(token, fmt) {
            return local_midnight(date);
        }
    }

    // Time-only forms apply to today.
    for fmt in ["%H:%M:%S", "%H:%M"] {
        if let Ok(time) = NaiveTime::parse_from_str(token, fmt) {
            let today = Local::now().date_naive();
            let ndt = today.and_time(time);
            return Local
                .from_local_datetime(&ndt)
                .single()
                .map(|dt| dt.with_timezone(&Utc));
        }
    }

    None
}

/// Parse against the configured `dateformat` template. Recognized template
/// characters: `Y` (4-digit year), `y` (2-digit), `M`/`m` (month), `D`/`d`
/// (day), `H`/`h` (hour), `N`/`n` (minute), `S`/`s` (second), `A`/`a`
/// (weekday name), `B`/`b` (month name). Anything else must match literally.
pub fn parse_template(token: &str, template: &str) -> Option<DateTime<Utc>> {
    let mut chars = token.chars().peekable();
    let mut year: Option<i32> = None;
    let mut month: Option<u32> = None;
    let mut day: Option<u32> = None;
    let mut hour = 0_u32;
    let mut minute = 0_u32;
    let mut second = 0_u32;

    fn take_number(
        chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
        max_digits: usize,
        fixed: bool,
    ) -> Option<u32> {
        let mut text = String::new();
        while text.len() < max_digits {
            match chars.peek() {
                Some(c) if c.is_ascii_digit() => {
                    text.push(*c);
                    chars.next();
                }
                _ => break,
            }
        }
        if text.is_empty() || (fixed && text.len() < max_digits) {
            return None;
        }
        text.parse().ok()
    }

    fn take_name(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
        let mut text = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                text.push(c.to_ascii_lowercase());
                chars.next();
            } else {
                break;
            }
        }
        text
    }

    for t in template.chars() {
        match t {
            'Y' => year = Some(take_number(&mut chars, 4, true)? as i32),
            'y' => year = Some(take_number(&mut chars, 2, true)? as i32 + 2000),
            'M' => month = Some(take_number(&mut chars, 2, true)?),
            'm' => month = Some(take_number(&mut chars, 2, false)?),
            'D' => day = Some(take_number(&mut chars, 2, true)?),
            'd' => day = Some(take_number(&mut chars, 2, false)?),
            'H' => hour = take_number(&mut chars, 2, true)?,
            'h' => hour = take_number(&mut chars, 2, false)?,
            'N' => minute = take_number(&mut chars, 2, true)?,
            'n' => minute = take_number(&mut chars, 2, false)?,
            'S' => second = take_number(&mut chars, 2, true)?,
            's' => second = take_number(&mut chars, 2, false)?,
            'A' | 'a' => {
                // Weekday names carry no positional information; consume and
                // discard.
                let name = take_name(&mut chars);
                if !WEEKDAYS
                    .iter()
                    .any(|(full, _)| *full == name || full[..3] == name)
                {
                    return None;
                }
            }
            'B' | 'b' => {
                let name = take_name(&mut chars);
                let idx = MONTHS
                    .iter()
                    .position(|full| *full == name || full[..3] == name)?;
                month = Some(idx as u32 + 1);
            }
            literal => {
                if chars.next() != Some(literal) {
                    return None;
                }
            }
        }
    }

    if chars.next().is_some() {
        return None;
    }

    let date = NaiveDate::from_ymd_opt(year?, month?, day?)?;
    let ndt = date.and_hms_opt(hour, minute, second)?;
    Local
        .from_local_datetime(&ndt)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Render an instant through a `dateformat` template, the inverse of
/// `parse_template` for numeric fields.
pub fn render_template(dt: DateTime<Utc>, template: &str) -> String {
    let local = dt.with_timezone(&Local);
    let mut out = String::with_capacity(template.len() + 8);

    for t in template.chars() {
        match t {
            'Y' => out.push_str(&format!("{:04}", local.year())),
            'y' => out.push_str(&format!("{:02}", local.year() % 100)),
            'M' => out.push_str(&format!("{:02}", local.month())),
            'm' => out.push_str(&local.month().to_string()),
            'D' => out.push_str(&format!("{:02}", local.day())),
            'd' => out.push_str(&local.day().to_string()),
            'H' => out.push_str(&format!("{:02}", local.hour())),
            'h' => out.push_str(&local.hour().to_string()),
            'N' => out.push_str(&format!("{:02}", local.minute())),
            'n' => out.push_str(&local.minute().to_string()),
            'S' => out.push_str(&format!("{:02}", local.second())),
            's' => out.push_str(&local.second().to_string()),
            'A' => out.push_str(capitalized(weekday_name(local.weekday()))),
            'a' => out.push_str(&capitalized(weekday_name(local.weekday()))[..3]),
            'B' => out.push_str(capitalized(MONTHS[local.month0() as usize])),
            'b' => out.push_str(&capitalized(MONTHS[local.month0() as usize])[..3]),
            literal => out.push(literal),
        }
    }

    out
}

fn weekday_name(weekday: Weekday) -> &'static str {
    WEEKDAYS
        .iter()
        .find(|(_, w)| *w == weekday)
        .map(|(name, _)| *name)
        .unwrap_or("monday")
}

fn capitalized(name: &str) -> &'static str {
    match name {
        "monday" => "Monday",
        "tuesday" => "Tuesday",
        "wednesday" => "Wednesday",
        "thursday" => "Thursday",
        "friday" => "Friday",
        "saturday" => "Saturday",
        "sunday" => "Sunday",
        "january" => "January",
        "february" => "February",
        "march" => "March",
        "april" => "April",
        "may" => "May",
        "june" => "June",
        "july" => "July",
        "august" => "August",
        "september" => "September",
        "october" => "October",
        "november" => "November",
        "december" => "December",
        _ => "",
    }
}

/// True when two instants fall on the same local calendar day; `=` uses this
/// when comparing against a date literal with no time component.
pub fn same_day(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.with_timezone(&Local).date_naive() == b.with_timezone(&Local).date_naive()
}

pub fn add_duration(dt: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    dt + Duration::seconds(seconds)
}
