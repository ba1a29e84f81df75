//! IMF-fixdate formatting and parsing (RFC 7231 §7.1.1.1).

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::time::SystemTime;

const IMF_FIXDATE: &str = "%a, %d %b %Y %H:%M:%S GMT";
const RFC850: &str = "%A, %d-%b-%y %H:%M:%S GMT";
const ASCTIME: &str = "%a %b %e %H:%M:%S %Y";

/// Format a timestamp as an IMF-fixdate string.
pub fn format_http_date(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format(IMF_FIXDATE).to_string()
}

/// Parse an HTTP date in any of the three formats RFC 7231 obliges
/// recipients to accept.
pub fn parse_http_date(s: &str) -> Option<SystemTime> {
    for fmt in [IMF_FIXDATE, RFC850, ASCTIME] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive).into());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn format_known_timestamp() {
        // 1994-11-06 08:49:37 UTC, the RFC example
        let t = UNIX_EPOCH + Duration::from_secs(784111777);
        assert_eq!(format_http_date(t), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn parse_imf_fixdate() {
        let t = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(t, UNIX_EPOCH + Duration::from_secs(784111777));
    }

    #[test]
    fn parse_rfc850() {
        let t = parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT").unwrap();
        assert_eq!(t, UNIX_EPOCH + Duration::from_secs(784111777));
    }

    #[test]
    fn parse_asctime() {
        let t = parse_http_date("Sun Nov  6 08:49:37 1994").unwrap();
        assert_eq!(t, UNIX_EPOCH + Duration::from_secs(784111777));
    }

    #[test]
    fn parse_garbage_fails() {
        assert!(parse_http_date("yesterday").is_none());
        assert!(parse_http_date("").is_none());
    }

    #[test]
    fn round_trip() {
        let t = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        assert_eq!(parse_http_date(&format_http_date(t)), Some(t));
    }
}
