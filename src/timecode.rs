//! Timecode formatting and parsing.
//!
//! Timecodes are stored internally as non-negative seconds (`f64`, millisecond
//! precision) and displayed as `MM:SS` below one hour or `HH:MM:SS` at or above
//! it. A single session that crosses the one-hour mark mixes both forms, so the
//! parser must accept either shape anywhere.

/// Format seconds for display: `MM:SS` below one hour, `HH:MM:SS` otherwise.
///
/// Sub-second precision is dropped on display; the stored value keeps it.
pub fn format_timecode(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

/// Parse `MM:SS`, `HH:MM:SS`, or either with a fractional-seconds tail
/// (`.` or `,` separator, as VTT and SRT respectively use).
///
/// Returns `None` for anything that does not look like a timecode. Minutes
/// and seconds above 59 are rejected in the three-part form, but a two-part
/// `90:00` is accepted as ninety minutes — several subtitle writers emit
/// that shape instead of rolling over to hours.
pub fn parse_timecode(s: &str) -> Option<f64> {
    let s = s.trim();
    let (clock, frac) = match s.find(['.', ',']) {
        Some(i) => {
            let frac_str = &s[i + 1..];
            if frac_str.is_empty() || !frac_str.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let frac = frac_str.parse::<f64>().ok()? / 10f64.powi(frac_str.len() as i32);
            (&s[..i], frac)
        }
        None => (s, 0.0),
    };

    let parts: Vec<&str> = clock.split(':').collect();
    let nums: Vec<u64> = parts
        .iter()
        .map(|p| {
            if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                None
            } else {
                p.parse().ok()
            }
        })
        .collect::<Option<Vec<_>>>()?;

    let secs = match nums.as_slice() {
        [m, s] => {
            if *s > 59 {
                return None;
            }
            (m * 60 + s) as f64
        }
        [h, m, s] => {
            if *m > 59 || *s > 59 {
                return None;
            }
            (h * 3600 + m * 60 + s) as f64
        }
        _ => return None,
    };

    Some(secs + frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_under_one_minute() {
        assert_eq!(format_timecode(16.0), "00:16");
        assert_eq!(format_timecode(0.0), "00:00");
    }

    #[test]
    fn test_format_under_one_hour() {
        assert_eq!(format_timecode(754.9), "12:34");
        assert_eq!(format_timecode(3599.0), "59:59");
    }

    #[test]
    fn test_format_at_and_above_one_hour() {
        assert_eq!(format_timecode(3600.0), "01:00:00");
        assert_eq!(format_timecode(3725.0), "01:02:05");
    }

    #[test]
    fn test_parse_mm_ss() {
        assert_eq!(parse_timecode("00:16"), Some(16.0));
        assert_eq!(parse_timecode("12:34"), Some(754.0));
    }

    #[test]
    fn test_parse_hh_mm_ss() {
        assert_eq!(parse_timecode("01:02:05"), Some(3725.0));
    }

    #[test]
    fn test_parse_fractional() {
        assert_eq!(parse_timecode("00:05.500"), Some(5.5));
        // SRT uses a comma separator
        assert_eq!(parse_timecode("00:00:01,250"), Some(1.25));
    }

    #[test]
    fn test_parse_two_part_minutes_above_59() {
        // Some subtitle writers never roll over to hours
        assert_eq!(parse_timecode("90:00"), Some(5400.0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_timecode(""), None);
        assert_eq!(parse_timecode("abc"), None);
        assert_eq!(parse_timecode("1:2:3:4"), None);
        assert_eq!(parse_timecode("00:61"), None);
        assert_eq!(parse_timecode("01:60:00"), None);
        assert_eq!(parse_timecode("00:05."), None);
    }

    #[test]
    fn test_parse_tolerates_whitespace() {
        assert_eq!(parse_timecode("  00:16 "), Some(16.0));
    }

    #[test]
    fn test_roundtrip_across_hour_boundary() {
        for &t in &[0.0, 59.0, 3599.0, 3600.0, 7322.0] {
            let formatted = format_timecode(t);
            assert_eq!(parse_timecode(&formatted), Some(t));
        }
    }
}
