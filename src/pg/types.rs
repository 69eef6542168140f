//! PostgreSQL type identifiers and text-format value decoding.
//!
//! The simple query protocol always returns values in text format, so every
//! decoder here parses the server's textual representation.

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};

use super::error::{PgError, PgResult};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub u32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const JSONB: Oid = Oid(3802);

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::JSON | Oid::JSONB
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }

    pub fn is_time(self) -> bool {
        matches!(self, Oid::DATE | Oid::TIMESTAMP | Oid::TIMESTAMPTZ)
    }
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A decoded column value or a query argument.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    /// `date`, `timestamp` and `timestamptz` values; naive values are UTC.
    Timestamp(DateTime<FixedOffset>),
    /// Values of types this driver has no decoder for.
    Raw { oid: Oid, data: Bytes },
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PgValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer value widened to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PgValue::Int2(v) => Some(i64::from(*v)),
            PgValue::Int4(v) => Some(i64::from(*v)),
            PgValue::Int8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PgValue::Float4(v) => Some(f64::from(*v)),
            PgValue::Float8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PgValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PgValue::Bytea(v) => Some(v),
            PgValue::Raw { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            PgValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Decode one column of a DataRow from text format.
    ///
    /// `data` is `None` for SQL NULL, which decodes to [`PgValue::Null`]
    /// whatever the declared type.
    pub fn decode_text(oid: Oid, data: Option<Bytes>) -> PgResult<Self> {
        let Some(data) = data else {
            return Ok(PgValue::Null);
        };

        match oid {
            Oid::BOOL => Ok(PgValue::Bool(matches!(&data[..], b"t" | b"1"))),

            Oid::INT2 => parse_ascii::<i16>(&data, "INT2").map(PgValue::Int2),
            Oid::INT4 => parse_ascii::<i32>(&data, "INT4").map(PgValue::Int4),
            Oid::INT8 => parse_ascii::<i64>(&data, "INT8").map(PgValue::Int8),

            Oid::FLOAT4 => parse_ascii::<f32>(&data, "FLOAT4").map(PgValue::Float4),
            Oid::FLOAT8 => parse_ascii::<f64>(&data, "FLOAT8").map(PgValue::Float8),

            _ if oid.is_text_like() => match String::from_utf8(data.to_vec()) {
                Ok(s) => Ok(PgValue::Text(s)),
                Err(e) => Err(PgError::Type(format!("Invalid UTF-8 in TEXT: {}", e))),
            },

            Oid::BYTEA => decode_bytea(&data).map(PgValue::Bytea),

            _ if oid.is_time() => {
                let s = std::str::from_utf8(&data)
                    .map_err(|e| PgError::Type(format!("Invalid UTF-8 in time value: {}", e)))?;
                parse_time(s).map(PgValue::Timestamp)
            }

            _ => Ok(PgValue::Raw { oid, data }),
        }
    }
}

fn parse_ascii<T: std::str::FromStr>(data: &[u8], what: &str) -> PgResult<T>
where
    T::Err: std::fmt::Display,
{
    let s = std::str::from_utf8(data)
        .map_err(|e| PgError::Type(format!("Invalid {}: {}", what, e)))?;
    s.parse::<T>()
        .map_err(|e| PgError::Type(format!("Invalid {} {:?}: {}", what, s, e)))
}

/// Decode bytea in hex output format (`\x68656c6c6f`).
pub fn decode_bytea(data: &[u8]) -> PgResult<Vec<u8>> {
    let hex_part = data
        .strip_prefix(b"\\x")
        .ok_or_else(|| PgError::Type("BYTEA value is not in hex format".to_string()))?;
    hex::decode(hex_part).map_err(|e| PgError::Type(format!("Invalid BYTEA: {}", e)))
}

// ============================================================================
// Time parsing
// ============================================================================

const TIME_FORMAT: &str = "%H:%M:%S%.f";
const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Length of the longest time-only value, `15:04:05.999999999`.
const MAX_TIME_LEN: usize = 18;
/// Length of the shortest time-only value, `15:04:05`.
const MIN_TIME_LEN: usize = 8;

/// Parse the server's textual `date` / `time` / `timestamp[tz]` output.
///
/// The format is chosen by the shape of the string:
/// - `15:04:05[.f]` is a time of day on 0000-01-01 UTC,
/// - `2006-01-02` is a date at midnight UTC,
/// - `2006-01-02T15:04:05Z` is RFC 3339,
/// - `2006-01-02 15:04:05[.f]` followed by `-07:00:00`, `-07:00` or `-07` is
///   a timestamp with that offset (`+00` is UTC),
/// - anything else is a naive timestamp in UTC.
pub fn parse_time(s: &str) -> PgResult<DateTime<FixedOffset>> {
    let b = s.as_bytes();
    let l = b.len();

    if l < MIN_TIME_LEN {
        return Err(time_error(s));
    }

    if l <= MAX_TIME_LEN {
        if b[2] == b':' {
            let t = NaiveTime::parse_from_str(s, TIME_FORMAT).map_err(|_| time_error(s))?;
            let d = NaiveDate::from_ymd_opt(0, 1, 1).ok_or_else(|| time_error(s))?;
            return Ok(utc(d.and_time(t)));
        }
        let d = NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|_| time_error(s))?;
        return Ok(utc(d.and_time(NaiveTime::MIN)));
    }

    if b[10] == b'T' {
        return DateTime::parse_from_rfc3339(s).map_err(|_| time_error(s));
    }

    for offset_len in [9, 6, 3] {
        if l > offset_len && matches!(b[l - offset_len], b'+' | b'-') {
            let (naive, offset) = s.split_at(l - offset_len);
            let offset = parse_offset(offset).ok_or_else(|| time_error(s))?;
            let naive =
                NaiveDateTime::parse_from_str(naive, TIMESTAMP_FORMAT).map_err(|_| time_error(s))?;
            return offset
                .from_local_datetime(&naive)
                .single()
                .ok_or_else(|| time_error(s));
        }
    }

    let naive = NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).map_err(|_| time_error(s))?;
    Ok(utc(naive))
}

/// Parse `+hh`, `+hh:mm` or `+hh:mm:ss`.
fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };

    let mut secs = 0i32;
    let mut unit = 3600;
    for part in rest.split(':') {
        if part.len() != 2 || unit == 0 {
            return None;
        }
        secs += part.parse::<i32>().ok()? * unit;
        unit /= 60;
    }
    FixedOffset::east_opt(sign * secs)
}

fn utc(naive: NaiveDateTime) -> DateTime<FixedOffset> {
    FixedOffset::east_opt(0)
        .unwrap_or_else(|| unreachable!("zero offset is always valid"))
        .from_utc_datetime(&naive)
}

fn time_error(s: &str) -> PgError {
    PgError::Type(format!("can't parse time={:?}", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn text(s: &'static str) -> Option<Bytes> {
        Some(Bytes::from_static(s.as_bytes()))
    }

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());

        assert!(Oid::INT4.is_integer());
        assert!(!Oid::FLOAT8.is_integer());

        assert!(Oid::FLOAT4.is_float());
        assert!(Oid::TIMESTAMPTZ.is_time());
    }

    #[test]
    fn test_null_wins_over_oid() {
        for oid in [Oid::BOOL, Oid::INT8, Oid::BYTEA, Oid::TIMESTAMP, Oid(9999)] {
            assert_eq!(PgValue::decode_text(oid, None).unwrap(), PgValue::Null);
        }
    }

    #[test]
    fn test_bool_decoding() {
        assert_eq!(PgValue::decode_text(Oid::BOOL, text("t")).unwrap(), PgValue::Bool(true));
        assert_eq!(PgValue::decode_text(Oid::BOOL, text("1")).unwrap(), PgValue::Bool(true));
        assert_eq!(PgValue::decode_text(Oid::BOOL, text("f")).unwrap(), PgValue::Bool(false));
    }

    #[test]
    fn test_integer_widths() {
        assert_eq!(PgValue::decode_text(Oid::INT2, text("-7")).unwrap(), PgValue::Int2(-7));
        assert_eq!(
            PgValue::decode_text(Oid::INT8, text("9223372036854775807")).unwrap(),
            PgValue::Int8(i64::MAX)
        );
        assert!(PgValue::decode_text(Oid::INT2, text("70000")).is_err());
    }

    #[test]
    fn test_float8_keeps_precision() {
        let v = PgValue::decode_text(Oid::FLOAT8, text("0.1234567890123")).unwrap();
        assert_eq!(v, PgValue::Float8(0.1234567890123));
        let v = PgValue::decode_text(Oid::FLOAT4, text("1.5")).unwrap();
        assert_eq!(v, PgValue::Float4(1.5));
    }

    #[test]
    fn test_bytea_decoding() {
        let v = PgValue::decode_text(Oid::BYTEA, text("\\x68656c6c6f")).unwrap();
        assert_eq!(v, PgValue::Bytea(b"hello".to_vec()));
        assert!(PgValue::decode_text(Oid::BYTEA, text("68656c6c6f")).is_err());
    }

    #[test]
    fn test_unknown_oid_is_raw() {
        let v = PgValue::decode_text(Oid(2950), text("a0ee-bc99")).unwrap();
        assert_eq!(v.as_bytes(), Some(&b"a0ee-bc99"[..]));
    }

    #[test]
    fn test_date_only() {
        let t = parse_time("2021-01-02").unwrap();
        assert_eq!((t.year(), t.month(), t.day()), (2021, 1, 2));
        assert_eq!(t.hour(), 0);
        assert_eq!(t.offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_time_only() {
        let t = parse_time("15:04:05.123").unwrap();
        assert_eq!((t.hour(), t.minute(), t.second()), (15, 4, 5));
        assert_eq!(t.nanosecond(), 123_000_000);
        assert_eq!(t.year(), 0);
    }

    #[test]
    fn test_three_segment_offset() {
        let t = parse_time("2021-01-02 15:04:05.999999999+00:00:00").unwrap();
        assert_eq!(t.offset().local_minus_utc(), 0);
        assert_eq!(t.nanosecond(), 999_999_999);

        let t = parse_time("2021-01-02 15:04:05-01:30:15").unwrap();
        assert_eq!(t.offset().local_minus_utc(), -(3600 + 30 * 60 + 15));
    }

    #[test]
    fn test_two_and_one_segment_offsets() {
        let t = parse_time("2021-01-02 15:04:05+05:30").unwrap();
        assert_eq!(t.offset().local_minus_utc(), 5 * 3600 + 30 * 60);

        let t = parse_time("2021-01-02 15:04:05.5-07").unwrap();
        assert_eq!(t.offset().local_minus_utc(), -7 * 3600);
        assert_eq!(t.hour(), 15);

        let t = parse_time("2021-01-02 15:04:05+00").unwrap();
        assert_eq!(t.offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_rfc3339() {
        let t = parse_time("2021-01-02T15:04:05Z").unwrap();
        assert_eq!((t.year(), t.hour()), (2021, 15));
        assert_eq!(t.offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_naive_timestamp_is_utc() {
        let t = parse_time("2021-01-02 15:04:05.000001").unwrap();
        assert_eq!(t.nanosecond(), 1_000);
        assert_eq!(t.offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_too_short() {
        assert!(parse_time("15:04").is_err());
        assert!(parse_time("garbage-garbage-garbage").is_err());
    }
}
