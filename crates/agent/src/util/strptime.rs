use chrono::{NaiveDate, Timelike};

/// Seconds + nanos pair produced by time parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParsedTime {
    pub secs: i64,
    pub nanos: u32,
}

impl ParsedTime {
    pub fn micros(&self) -> i64 {
        self.secs * 1_000_000 + (self.nanos / 1000) as i64
    }
}

/// Parse `input` against a strptime-style format.
///
/// Supported conversions: `%Y %m %d %H %M %S %s %f %%`; any other byte in
/// the format must match the input literally. `%s` is a seconds-since-epoch
/// integer, `%f` a 1-9 digit fraction scaled to nanoseconds. Calendar fields
/// missing from the format fall back to `default_year` / Jan 1 / 00:00:00.
/// The assembled time is interpreted as UTC; timezone adjustment is the
/// caller's business.
///
/// Returns the parsed time and the number of input bytes consumed.
pub fn strptime(input: &[u8], format: &str, default_year: Option<i32>) -> Option<(ParsedTime, usize)> {
    let mut pos = 0usize;
    let mut year: Option<i32> = None;
    let mut month: u32 = 1;
    let mut day: u32 = 1;
    let mut hour: u32 = 0;
    let mut minute: u32 = 0;
    let mut second: u32 = 0;
    let mut nanos: u32 = 0;
    let mut epoch: Option<i64> = None;

    let fmt = format.as_bytes();
    let mut f = 0usize;
    while f < fmt.len() {
        if fmt[f] != b'%' {
            if pos >= input.len() || input[pos] != fmt[f] {
                return None;
            }
            pos += 1;
            f += 1;
            continue;
        }
        if f + 1 >= fmt.len() {
            return None;
        }
        let conv = fmt[f + 1];
        f += 2;
        match conv {
            b'%' => {
                if pos >= input.len() || input[pos] != b'%' {
                    return None;
                }
                pos += 1;
            }
            b'Y' => year = Some(parse_digits(input, &mut pos, 4)? as i32),
            b'm' => month = parse_digits(input, &mut pos, 2)? as u32,
            b'd' => day = parse_digits(input, &mut pos, 2)? as u32,
            b'H' => hour = parse_digits(input, &mut pos, 2)? as u32,
            b'M' => minute = parse_digits(input, &mut pos, 2)? as u32,
            b'S' => second = parse_digits(input, &mut pos, 2)? as u32,
            b's' => epoch = Some(parse_digits(input, &mut pos, 19)?),
            b'f' => nanos = parse_fraction(input, &mut pos)?,
            _ => return None,
        }
    }

    if let Some(secs) = epoch {
        return Some((ParsedTime { secs, nanos }, pos));
    }

    let year = year.or(default_year)?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let dt = date.and_hms_opt(hour, minute, second)?;
    debug_assert!(dt.nanosecond() == 0);
    Some((
        ParsedTime {
            secs: dt.and_utc().timestamp(),
            nanos,
        },
        pos,
    ))
}

/// Up to `max` consecutive ASCII digits, at least one.
fn parse_digits(input: &[u8], pos: &mut usize, max: usize) -> Option<i64> {
    let start = *pos;
    let mut value: i64 = 0;
    while *pos < input.len() && *pos - start < max && input[*pos].is_ascii_digit() {
        value = value * 10 + (input[*pos] - b'0') as i64;
        *pos += 1;
    }
    if *pos == start {
        return None;
    }
    Some(value)
}

/// 1-9 fractional digits, scaled to nanoseconds.
fn parse_fraction(input: &[u8], pos: &mut usize) -> Option<u32> {
    let start = *pos;
    let mut value: u64 = 0;
    while *pos < input.len() && *pos - start < 9 && input[*pos].is_ascii_digit() {
        value = value * 10 + (input[*pos] - b'0') as u64;
        *pos += 1;
    }
    let digits = *pos - start;
    if digits == 0 {
        return None;
    }
    for _ in digits..9 {
        value *= 10;
    }
    Some(value as u32)
}

/// Parse a `GMT+HH:MM` / `GMT-HH:MM` timezone spec into an offset in
/// seconds east of UTC.
pub fn parse_timezone_offset(spec: &str) -> Option<i32> {
    let rest = spec.strip_prefix("GMT")?;
    let bytes = rest.as_bytes();
    if bytes.len() != 6 || bytes[3] != b':' {
        return None;
    }
    let sign = match bytes[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let hours: i32 = rest[1..3].parse().ok()?;
    let minutes: i32 = rest[4..6].parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    Some(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_format() {
        let (t, used) = strptime(b"1693833304]", "%s", None).unwrap();
        assert_eq!(t.secs, 1693833304);
        assert_eq!(t.nanos, 0);
        assert_eq!(used, 10);
    }

    #[test]
    fn test_calendar_with_fraction() {
        let (t, used) = strptime(b"2023-09-04 13:15:04.862181]", "%Y-%m-%d %H:%M:%S.%f", None).unwrap();
        assert_eq!(t.secs, 1693833304);
        assert_eq!(t.nanos, 862_181_000);
        assert_eq!(t.micros(), 1693833304862181);
        assert_eq!(used, 26);
    }

    #[test]
    fn test_default_year() {
        let (t, _) = strptime(b"09/04 13:15:04", "%m/%d %H:%M:%S", Some(2023)).unwrap();
        assert_eq!(t.secs, 1693833304);
        assert!(strptime(b"09/04 13:15:04", "%m/%d %H:%M:%S", None).is_none());
    }

    #[test]
    fn test_literal_mismatch() {
        assert!(strptime(b"2023_09_04", "%Y-%m-%d", None).is_none());
        assert!(strptime(b"", "%Y", None).is_none());
    }

    #[test]
    fn test_timezone_offset() {
        assert_eq!(parse_timezone_offset("GMT+08:00"), Some(8 * 3600));
        assert_eq!(parse_timezone_offset("GMT-05:30"), Some(-(5 * 3600 + 30 * 60)));
        assert_eq!(parse_timezone_offset("UTC+08:00"), None);
        assert_eq!(parse_timezone_offset("GMT+8:00"), None);
    }
}
