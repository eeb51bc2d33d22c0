//! Cron expression handling.
//!
//! Accepts classic 5-field expressions (minute hour day-of-month month
//! day-of-week) and the 6-field variant with a leading seconds field.
//! Evaluation runs at minute resolution, matching the scheduler tick;
//! a seconds field is validated but rounds down to the full minute.

use anyhow::{bail, format_err, Error};

use nom::bytes::complete::tag;
use nom::combinator::opt;

use tvs_tools::nom::{parse_complete_line, parse_error, parse_u32, IResult};

/// One entry of a cron field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateTimeValue {
    Single(u32),
    Range(u32, u32),
    /// start, inclusive end, step
    Repeated(u32, u32, u32),
}

impl DateTimeValue {
    // Test if the entry contains the value
    pub fn contains(&self, value: u32) -> bool {
        match self {
            DateTimeValue::Single(v) => *v == value,
            DateTimeValue::Range(start, end) => value >= *start && value <= *end,
            DateTimeValue::Repeated(start, end, step) => {
                value >= *start && value <= *end && ((value - start) % step) == 0
            }
        }
    }

    // Find and return an entry greater than value
    pub fn find_next(list: &[DateTimeValue], value: u32) -> Option<u32> {
        let mut next: Option<u32> = None;
        let mut set_next = |v: u32| {
            if let Some(n) = next {
                if v < n {
                    next = Some(v);
                }
            } else {
                next = Some(v);
            }
        };
        for spec in list {
            match spec {
                DateTimeValue::Single(v) => {
                    if *v > value {
                        set_next(*v);
                    }
                }
                DateTimeValue::Range(start, end) => {
                    if value < *start {
                        set_next(*start);
                    } else {
                        let n = value + 1;
                        if n >= *start && n <= *end {
                            set_next(n);
                        }
                    }
                }
                DateTimeValue::Repeated(start, end, step) => {
                    if value < *start {
                        set_next(*start);
                    } else {
                        let n = start + ((value - start) / step + 1) * step;
                        if n <= *end {
                            set_next(n);
                        }
                    }
                }
            }
        }

        next
    }
}

/// A parsed cron expression.
///
/// Empty field lists mean "any value" (`*`).
#[derive(Debug, Default, Clone)]
pub struct CronExpression {
    pub minute: Vec<DateTimeValue>,
    pub hour: Vec<DateTimeValue>,
    pub day: Vec<DateTimeValue>,
    pub month: Vec<DateTimeValue>,
    pub weekday: Vec<DateTimeValue>,
}

fn check_bounds(list: &[DateTimeValue], min: u32, max: u32, what: &str) -> Result<(), Error> {
    let check_value = |value: u32| -> Result<(), Error> {
        if value < min || value > max {
            bail!("{} value {} out of range ({}..{})", what, value, min, max);
        }
        Ok(())
    };

    for spec in list {
        match spec {
            DateTimeValue::Single(v) => check_value(*v)?,
            DateTimeValue::Range(start, end) | DateTimeValue::Repeated(start, end, _) => {
                check_value(*start)?;
                check_value(*end)?;
                if end < start {
                    bail!("{}: range end {} before start {}", what, end, start);
                }
            }
        }
    }
    Ok(())
}

// Recognizes one item: N | N-M | N-M/S | */S | *
fn parse_field_item(min: u32, max: u32) -> impl Fn(&str) -> IResult<&str, Option<DateTimeValue>> {
    move |i: &str| {
        if let Some(rest) = i.strip_prefix('*') {
            if let Some(rest) = rest.strip_prefix('/') {
                let (rest, step) = parse_u32(rest)?;
                if step == 0 {
                    return Err(parse_error(i, "step must not be zero"));
                }
                return Ok((rest, Some(DateTimeValue::Repeated(min, max, step))));
            }
            return Ok((rest, None)); // wildcard
        }

        let (i, start) = parse_u32(i)?;
        let (i, end) = opt(|i| {
            let (i, _) = tag("-")(i)?;
            parse_u32(i)
        })(i)?;
        let (i, step) = opt(|i| {
            let (i, _) = tag("/")(i)?;
            parse_u32(i)
        })(i)?;

        let value = match (end, step) {
            (None, None) => DateTimeValue::Single(start),
            (Some(end), None) => DateTimeValue::Range(start, end),
            (Some(end), Some(step)) => {
                if step == 0 {
                    return Err(parse_error(i, "step must not be zero"));
                }
                DateTimeValue::Repeated(start, end, step)
            }
            (None, Some(step)) => {
                if step == 0 {
                    return Err(parse_error(i, "step must not be zero"));
                }
                // "N/S" extends to the field maximum
                DateTimeValue::Repeated(start, max, step)
            }
        };

        Ok((i, Some(value)))
    }
}

// Parses one whole field (comma separated items). Returns an empty
// list for a plain wildcard.
fn parse_field(field: &str, min: u32, max: u32, what: &str) -> Result<Vec<DateTimeValue>, Error> {
    let item_parser = parse_field_item(min, max);

    let parser = |mut i: &str| -> IResult<&str, Vec<DateTimeValue>> {
        let mut list = Vec::new();
        loop {
            let (rest, item) = item_parser(i)?;
            if let Some(item) = item {
                list.push(item);
            }
            match rest.strip_prefix(',') {
                Some(rest) => i = rest,
                None => return Ok((rest, list)),
            }
        }
    };

    let list = parse_complete_line(what, field, parser)
        .map_err(|err| format_err!("bad {} field '{}' - {}", what, field, err))?;

    check_bounds(&list, min, max, what)?;

    Ok(list)
}

impl std::str::FromStr for CronExpression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();

        let fields = match fields.len() {
            5 => &fields[..],
            6 => {
                // leading seconds field: validated, evaluation rounds
                // down to the minute
                parse_field(fields[0], 0, 59, "second")?;
                &fields[1..]
            }
            n => bail!("cron expression has {} fields, expected 5 or 6", n),
        };

        let mut expression = CronExpression {
            minute: parse_field(fields[0], 0, 59, "minute")?,
            hour: parse_field(fields[1], 0, 23, "hour")?,
            day: parse_field(fields[2], 1, 31, "day-of-month")?,
            month: parse_field(fields[3], 1, 12, "month")?,
            weekday: parse_field(fields[4], 0, 7, "day-of-week")?,
        };

        // both 0 and 7 mean Sunday
        for spec in expression.weekday.iter_mut() {
            if let DateTimeValue::Single(7) = spec {
                *spec = DateTimeValue::Single(0);
            }
        }

        Ok(expression)
    }
}

// tm wrapper keeping all fields (including tm_wday) consistent by
// round-tripping through the epoch after every mutation
struct TmEditor {
    t: libc::tm,
    utc: bool,
}

impl TmEditor {
    fn with_epoch(epoch: i64, utc: bool) -> Result<Self, Error> {
        let t = if utc {
            proxmox_time::gmtime(epoch)?
        } else {
            proxmox_time::localtime(epoch)?
        };
        Ok(Self { t, utc })
    }

    fn into_epoch(mut self) -> i64 {
        self.encode()
    }

    fn encode(&mut self) -> i64 {
        if self.utc {
            unsafe { libc::timegm(&mut self.t) }
        } else {
            self.t.tm_isdst = -1;
            unsafe { libc::mktime(&mut self.t) }
        }
    }

    fn normalize(&mut self) -> Result<(), Error> {
        let epoch = self.encode();
        self.t = if self.utc {
            proxmox_time::gmtime(epoch)?
        } else {
            proxmox_time::localtime(epoch)?
        };
        Ok(())
    }

    fn minute(&self) -> u32 {
        self.t.tm_min as u32
    }
    fn hour(&self) -> u32 {
        self.t.tm_hour as u32
    }
    fn day(&self) -> u32 {
        self.t.tm_mday as u32
    }
    fn month(&self) -> u32 {
        (self.t.tm_mon + 1) as u32
    }
    fn weekday(&self) -> u32 {
        self.t.tm_wday as u32
    }

    fn zero_time(&mut self) {
        self.t.tm_sec = 0;
        self.t.tm_min = 0;
        self.t.tm_hour = 0;
    }

    fn next_day(&mut self) -> Result<(), Error> {
        self.zero_time();
        self.t.tm_mday += 1;
        self.normalize()
    }

    fn next_month(&mut self) -> Result<(), Error> {
        self.zero_time();
        self.t.tm_mday = 1;
        self.t.tm_mon += 1;
        self.normalize()
    }

    fn set_hour(&mut self, hour: u32) -> Result<(), Error> {
        self.t.tm_sec = 0;
        self.t.tm_min = 0;
        self.t.tm_hour = hour as libc::c_int;
        self.normalize()
    }

    fn set_minute(&mut self, minute: u32) -> Result<(), Error> {
        self.t.tm_sec = 0;
        self.t.tm_min = minute as libc::c_int;
        self.normalize()
    }
}

impl CronExpression {
    fn day_matches(&self, t: &TmEditor) -> bool {
        let dom_match = self.day.iter().any(|spec| spec.contains(t.day()));
        let dow_match = self.weekday.iter().any(|spec| spec.contains(t.weekday()));

        match (self.day.is_empty(), self.weekday.is_empty()) {
            (true, true) => true,
            (false, true) => dom_match,
            (true, false) => dow_match,
            // classic cron: restricted dom AND dow match either
            (false, false) => dom_match || dow_match,
        }
    }

    /// Compute the next fire time strictly after `last`.
    pub fn compute_next_event(&self, last: i64, utc: bool) -> Result<i64, Error> {
        let last = last + 60; // at least one minute later

        let mut t = TmEditor::with_epoch(last, utc)?;
        t.t.tm_sec = 0;

        let mut count = 0;

        loop {
            // stop searching after ten years of days
            if count > 3660 {
                bail!("unable to compute next cron event");
            }
            count += 1;

            if !self.month.is_empty() && !self.month.iter().any(|spec| spec.contains(t.month())) {
                t.next_month()?;
                continue;
            }

            if !self.day_matches(&t) {
                t.next_day()?;
                continue;
            }

            // this day
            if !self.hour.is_empty() {
                let hour = t.hour();
                if !self.hour.iter().any(|spec| spec.contains(hour)) {
                    match DateTimeValue::find_next(&self.hour, hour) {
                        Some(next) => t.set_hour(next)?,
                        None => t.next_day()?,
                    }
                    continue;
                }
            }

            // this hour
            if !self.minute.is_empty() {
                let minute = t.minute();
                if !self.minute.iter().any(|spec| spec.contains(minute)) {
                    match DateTimeValue::find_next(&self.minute, minute) {
                        Some(next) => t.set_minute(next)?,
                        None => {
                            let hour = t.hour();
                            match DateTimeValue::find_next(&self.hour, hour) {
                                Some(next) if !self.hour.is_empty() => t.set_hour(next)?,
                                _ if self.hour.is_empty() => t.set_hour(hour + 1)?,
                                _ => t.next_day()?,
                            }
                        }
                    }
                    continue;
                }
            }

            return Ok(t.into_epoch());
        }
    }
}

/// Parse and validate a cron expression.
pub fn parse_cron_expression(text: &str) -> Result<CronExpression, Error> {
    text.parse()
}

#[cfg(test)]
mod test {
    use super::*;

    const MIN: i64 = 60;
    const HOUR: i64 = 3600;
    const DAY: i64 = 3600 * 24;

    // 1970-01-01 was a Thursday
    const THURSDAY_00_00: i64 = 0;

    fn test_value(expression: &str, last: i64, expect: i64) -> Result<i64, Error> {
        let parsed: CronExpression = expression
            .parse()
            .map_err(|err| format_err!("parsing '{}' failed - {}", expression, err))?;

        match parsed.compute_next_event(last, true) {
            Ok(next) => {
                if next == expect {
                    Ok(expect)
                } else {
                    bail!(
                        "next failed for '{}'\nnext:   {}\nexpect: {}",
                        expression,
                        next,
                        expect
                    );
                }
            }
            Err(err) => bail!("compute next for '{}' failed - {}", expression, err),
        }
    }

    #[test]
    fn test_every_minute() -> Result<(), Error> {
        let mut n = test_value("* * * * *", THURSDAY_00_00, THURSDAY_00_00 + MIN)?;
        for i in 2..100 {
            n = test_value("* * * * *", n, THURSDAY_00_00 + i * MIN)?;
        }
        Ok(())
    }

    #[test]
    fn test_hourly_and_daily() -> Result<(), Error> {
        let mut n = test_value("0 * * * *", THURSDAY_00_00, THURSDAY_00_00 + HOUR)?;
        for i in 2..50 {
            n = test_value("0 * * * *", n, THURSDAY_00_00 + i * HOUR)?;
        }

        // 02:30 every day
        let n = test_value(
            "30 2 * * *",
            THURSDAY_00_00,
            THURSDAY_00_00 + 2 * HOUR + 30 * MIN,
        )?;
        test_value("30 2 * * *", n, THURSDAY_00_00 + DAY + 2 * HOUR + 30 * MIN)?;

        Ok(())
    }

    #[test]
    fn test_step_values() -> Result<(), Error> {
        let n = test_value("*/15 * * * *", THURSDAY_00_00, THURSDAY_00_00 + 15 * MIN)?;
        let n = test_value("*/15 * * * *", n, THURSDAY_00_00 + 30 * MIN)?;
        let n = test_value("*/15 * * * *", n, THURSDAY_00_00 + 45 * MIN)?;
        test_value("*/15 * * * *", n, THURSDAY_00_00 + HOUR)?;

        // every second hour at minute zero
        let n = test_value("0 */2 * * *", THURSDAY_00_00, THURSDAY_00_00 + 2 * HOUR)?;
        test_value("0 */2 * * *", n, THURSDAY_00_00 + 4 * HOUR)?;

        Ok(())
    }

    #[test]
    fn test_weekday() -> Result<(), Error> {
        // monday is 4 days after thursday epoch start
        test_value("0 0 * * 1", THURSDAY_00_00, THURSDAY_00_00 + 4 * DAY)?;
        // sunday as 0 and as 7
        test_value("0 0 * * 0", THURSDAY_00_00, THURSDAY_00_00 + 3 * DAY)?;
        test_value("0 0 * * 7", THURSDAY_00_00, THURSDAY_00_00 + 3 * DAY)?;
        // friday range
        test_value("0 12 * * 5-6", THURSDAY_00_00, THURSDAY_00_00 + DAY + 12 * HOUR)?;
        Ok(())
    }

    #[test]
    fn test_day_of_month_and_month() -> Result<(), Error> {
        // Jan 15 1970
        test_value("0 0 15 * *", THURSDAY_00_00, THURSDAY_00_00 + 14 * DAY)?;
        // Feb 1 1970 (Jan has 31 days)
        test_value("0 0 1 2 *", THURSDAY_00_00, THURSDAY_00_00 + 31 * DAY)?;
        // monthly on the 1st at 03:00
        test_value("0 3 1 * *", THURSDAY_00_00, THURSDAY_00_00 + 3 * HOUR)?;
        Ok(())
    }

    #[test]
    fn test_dom_dow_either_matches() -> Result<(), Error> {
        // classic cron: "0 0 13 * 5" fires on the 13th AND on fridays;
        // the first friday after epoch start is Jan 2
        test_value("0 0 13 * 5", THURSDAY_00_00, THURSDAY_00_00 + DAY)?;
        Ok(())
    }

    #[test]
    fn test_six_field_form() -> Result<(), Error> {
        // leading seconds field is accepted, evaluation stays at
        // minute resolution
        test_value("30 */5 * * * *", THURSDAY_00_00, THURSDAY_00_00 + 5 * MIN)?;
        Ok(())
    }

    #[test]
    fn test_parse_errors() {
        for text in [
            "",
            "* * * *",
            "* * * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * 32 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5-1 * * * *",
            "a * * * *",
        ] {
            assert!(
                text.parse::<CronExpression>().is_err(),
                "accepted '{}'",
                text
            );
        }
    }

    #[test]
    fn test_no_event_for_impossible_schedule() {
        // Feb 30 never exists
        let expression: CronExpression = "0 0 30 2 *".parse().unwrap();
        assert!(expression.compute_next_event(THURSDAY_00_00, true).is_err());
    }
}
