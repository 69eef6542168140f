//! Client-side argument substitution for the simple query protocol.
//!
//! The simple query protocol carries no parameters, so arguments are rendered
//! as SQL literals and spliced into the query text. Two placeholder styles are
//! accepted: `$N` (1-based, may repeat) and `?` (sequential). Placeholders
//! inside quoted literals, quoted identifiers and comments are left alone.

use std::fmt::Write as _;

use super::error::{PgError, PgResult};
use super::types::PgValue;

/// Substitute `args` into `query`.
///
/// Every argument must be referenced by at least one placeholder, and every
/// placeholder must resolve to an argument.
pub fn format_query(query: &str, args: &[PgValue]) -> PgResult<String> {
    if args.is_empty() {
        return Ok(query.to_string());
    }

    let mut out = String::with_capacity(query.len() + args.len() * 8);
    let mut used = vec![false; args.len()];
    let mut next_seq = 0;

    let bytes = query.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                let escapes = quote == b'\'' && is_escape_prefix(bytes, i);
                let end = skip_quoted(bytes, i, quote, escapes);
                out.push_str(&query[i..end]);
                i = end;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                let end = bytes[i..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map_or(bytes.len(), |p| i + p);
                out.push_str(&query[i..end]);
                i = end;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = query[i + 2..]
                    .find("*/")
                    .map_or(bytes.len(), |p| i + 2 + p + 2);
                out.push_str(&query[i..end]);
                i = end;
            }
            b'?' => {
                let arg = args.get(next_seq).ok_or_else(|| {
                    PgError::Type(format!(
                        "query has more `?` placeholders than the {} arguments given",
                        args.len()
                    ))
                })?;
                used[next_seq] = true;
                next_seq += 1;
                write_literal(&mut out, arg)?;
                i += 1;
            }
            b'$' if bytes.get(i + 1).is_some_and(u8::is_ascii_digit) => {
                let digits = bytes[i + 1..]
                    .iter()
                    .take_while(|b| b.is_ascii_digit())
                    .count();
                let n: usize = query[i + 1..i + 1 + digits]
                    .parse()
                    .map_err(|_| PgError::Type(format!("bad placeholder in {:?}", query)))?;
                let arg = n
                    .checked_sub(1)
                    .and_then(|idx| args.get(idx).map(|a| (idx, a)))
                    .ok_or_else(|| {
                        PgError::Type(format!(
                            "placeholder ${} has no argument ({} given)",
                            n,
                            args.len()
                        ))
                    })?;
                used[arg.0] = true;
                write_literal(&mut out, arg.1)?;
                i += 1 + digits;
            }
            b'$' => match dollar_tag(bytes, i) {
                Some(tag_len) => {
                    let tag = &query[i..i + tag_len];
                    let end = query[i + tag_len..]
                        .find(tag)
                        .map_or(bytes.len(), |p| i + tag_len + p + tag_len);
                    out.push_str(&query[i..end]);
                    i = end;
                }
                None => {
                    out.push('$');
                    i += 1;
                }
            },
            _ => {
                // Copy the run up to the next byte of interest in one go.
                let end = bytes[i + 1..]
                    .iter()
                    .position(|b| matches!(b, b'\'' | b'"' | b'-' | b'/' | b'?' | b'$'))
                    .map_or(bytes.len(), |p| i + 1 + p);
                out.push_str(&query[i..end]);
                i = end;
            }
        }
    }

    if let Some(unused) = used.iter().position(|u| !u) {
        return Err(PgError::Type(format!(
            "argument {} is not referenced by any placeholder",
            unused + 1
        )));
    }
    Ok(out)
}

/// End (exclusive) of the quoted section opening at `start`. A doubled quote
/// character is an escaped quote, as is a backslash-escaped one in an `E'...'`
/// string. Unterminated sections run to the end.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8, escapes: bool) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if escapes && bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

/// Whether the quote at `i` opens an escape string (`E'...'`).
fn is_escape_prefix(bytes: &[u8], i: usize) -> bool {
    i >= 1
        && matches!(bytes[i - 1], b'E' | b'e')
        && (i < 2 || !is_ident_byte(bytes[i - 2]))
}

/// Length of the dollar-quote tag (`$$` or `$name$`) starting at `i`, if one
/// starts there. A `$` inside an identifier never opens one.
fn dollar_tag(bytes: &[u8], i: usize) -> Option<usize> {
    if i > 0 && is_ident_byte(bytes[i - 1]) {
        return None;
    }
    let rest = &bytes[i + 1..];
    if rest.first().is_some_and(u8::is_ascii_digit) {
        return None;
    }
    let name = rest
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_' || **b >= 0x80)
        .count();
    (rest.get(name) == Some(&b'$')).then_some(name + 2)
}

fn write_literal(out: &mut String, value: &PgValue) -> PgResult<()> {
    match value {
        PgValue::Null => out.push_str("NULL"),
        PgValue::Bool(true) => out.push_str("TRUE"),
        PgValue::Bool(false) => out.push_str("FALSE"),
        PgValue::Int2(v) => write_number(out, v, *v < 0),
        PgValue::Int4(v) => write_number(out, v, *v < 0),
        PgValue::Int8(v) => write_number(out, v, *v < 0),
        PgValue::Float4(v) => write_float(out, f64::from(*v)),
        PgValue::Float8(v) => write_float(out, *v),
        PgValue::Text(s) => {
            if s.contains('\0') {
                return Err(PgError::Type("text argument contains a NUL byte".to_string()));
            }
            out.push_str(&quote_literal(s));
        }
        PgValue::Bytea(b) => {
            out.push_str("'\\x");
            out.push_str(&hex::encode(b));
            out.push_str("'::bytea");
        }
        PgValue::Timestamp(t) => {
            out.push('\'');
            push_display(out, t.format("%Y-%m-%d %H:%M:%S%.f%:z"));
            out.push_str("'::timestamptz");
        }
        PgValue::Raw { data, .. } => {
            let text = String::from_utf8_lossy(data);
            if text.contains('\0') {
                return Err(PgError::Type("raw argument contains a NUL byte".to_string()));
            }
            out.push_str(&quote_literal(&text));
        }
    }
    Ok(())
}

fn write_float(out: &mut String, v: f64) {
    if v.is_nan() {
        out.push_str("'NaN'");
    } else if v.is_infinite() {
        out.push_str(if v > 0.0 { "'Infinity'" } else { "'-Infinity'" });
    } else {
        write_number(out, v, v.is_sign_negative());
    }
}

/// Negative numbers are parenthesized so a preceding `-` cannot turn the
/// sign into a line comment.
fn write_number(out: &mut String, v: impl std::fmt::Display, negative: bool) {
    if negative {
        out.push('(');
        push_display(out, v);
        out.push(')');
    } else {
        push_display(out, v);
    }
}

fn push_display(out: &mut String, v: impl std::fmt::Display) {
    // Writing into a String cannot fail.
    let _ = write!(out, "{}", v);
}

/// Quote `s` as a string literal.
///
/// Single quotes are doubled. A string holding backslashes is written in the
/// escape-string form (`E'...'`) with the backslashes doubled, so the result
/// is correct whatever `standard_conforming_strings` is set to.
pub fn quote_literal(s: &str) -> String {
    let escaped = s.replace('\'', "''");
    if escaped.contains('\\') {
        format!(" E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

/// Quote `name` as an identifier. Embedded double quotes are doubled.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    #[test]
    fn test_no_args_is_identity() {
        let q = "SELECT '?', $1";
        assert_eq!(format_query(q, &[]).unwrap(), q);
    }

    #[test]
    fn test_sequential_placeholders() {
        let q = format_query(
            "INSERT INTO t (a, b, c) VALUES (?, ?, ?)",
            &[PgValue::Int4(1), PgValue::Text("it's".into()), PgValue::Null],
        )
        .unwrap();
        assert_eq!(q, "INSERT INTO t (a, b, c) VALUES (1, 'it''s', NULL)");
    }

    #[test]
    fn test_numbered_placeholders_repeat() {
        let q = format_query(
            "SELECT $1, $2, $1",
            &[PgValue::Bool(true), PgValue::Int8(-7)],
        )
        .unwrap();
        assert_eq!(q, "SELECT TRUE, (-7), TRUE");
    }

    #[test]
    fn test_quoted_sections_untouched() {
        let q = format_query(
            "SELECT '?', \"col?\", $1 -- what $2?\n/* ? */",
            &[PgValue::Int2(3)],
        )
        .unwrap();
        assert_eq!(q, "SELECT '?', \"col?\", 3 -- what $2?\n/* ? */");
    }

    #[test]
    fn test_escaped_quote_inside_literal() {
        let q = format_query("SELECT 'a''?b', ?", &[PgValue::Int4(9)]).unwrap();
        assert_eq!(q, "SELECT 'a''?b', 9");
    }

    #[test]
    fn test_negative_numbers_after_minus() {
        let q = format_query(
            "UPDATE t SET n = n-$1 WHERE id = $2",
            &[PgValue::Int4(-5), PgValue::Int4(7)],
        )
        .unwrap();
        assert_eq!(q, "UPDATE t SET n = n-(-5) WHERE id = 7");

        let q = format_query("SELECT 1-?, 1-?", &[PgValue::Float8(-0.5), PgValue::Int2(-1)]).unwrap();
        assert_eq!(q, "SELECT 1-(-0.5), 1-(-1)");
    }

    #[test]
    fn test_dollar_quoted_sections_untouched() {
        let q = format_query("SELECT $$a?b$$, ?", &[PgValue::Int4(1)]).unwrap();
        assert_eq!(q, "SELECT $$a?b$$, 1");

        let body = "CREATE FUNCTION f() RETURNS int AS $fn$ SELECT $1 + ? $fn$ LANGUAGE sql; SELECT $1";
        let q = format_query(body, &[PgValue::Int4(2)]).unwrap();
        assert_eq!(
            q,
            "CREATE FUNCTION f() RETURNS int AS $fn$ SELECT $1 + ? $fn$ LANGUAGE sql; SELECT 2"
        );

        // `$` inside an identifier is not a quote.
        let q = format_query("SELECT a$b$ FROM t WHERE x = ?", &[PgValue::Int4(3)]).unwrap();
        assert_eq!(q, "SELECT a$b$ FROM t WHERE x = 3");
    }

    #[test]
    fn test_escape_string_backslash_quote() {
        let q = format_query(r"SELECT E'it\'s ?', ?", &[PgValue::Int4(4)]).unwrap();
        assert_eq!(q, r"SELECT E'it\'s ?', 4");

        // Outside an E string a backslash is an ordinary character.
        let q = format_query(r"SELECT 'a\', ?", &[PgValue::Int4(5)]).unwrap();
        assert_eq!(q, r"SELECT 'a\', 5");
    }

    #[test]
    fn test_missing_and_unused_args() {
        let err = format_query("SELECT ?, ?", &[PgValue::Int4(1)]).unwrap_err();
        assert!(matches!(err, PgError::Type(_)));

        let err = format_query("SELECT $2", &[PgValue::Int4(1)]).unwrap_err();
        assert!(matches!(err, PgError::Type(_)));

        let err = format_query("SELECT $0", &[PgValue::Int4(1)]).unwrap_err();
        assert!(matches!(err, PgError::Type(_)));

        let err = format_query("SELECT $1", &[PgValue::Int4(1), PgValue::Int4(2)]).unwrap_err();
        assert!(matches!(err, PgError::Type(_)));
    }

    #[test]
    fn test_literals() {
        let ts = FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 2, 3, 4, 5)
            .unwrap();
        let q = format_query(
            "SELECT ?, ?, ?, ?, ?",
            &[
                PgValue::Bytea(vec![0xde, 0xad]),
                PgValue::Float8(f64::NAN),
                PgValue::Float4(f32::NEG_INFINITY),
                PgValue::Float8(1.5),
                PgValue::Timestamp(ts),
            ],
        )
        .unwrap();
        assert_eq!(
            q,
            "SELECT '\\xdead'::bytea, 'NaN', '-Infinity', 1.5, '2024-01-02 03:04:05+02:00'::timestamptz"
        );
    }

    #[test]
    fn test_nul_rejected() {
        let err = format_query("SELECT ?", &[PgValue::Text("a\0b".into())]).unwrap_err();
        assert!(matches!(err, PgError::Type(_)));
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("o'neil"), "'o''neil'");
        assert_eq!(quote_literal("C:\\dir"), " E'C:\\\\dir'");
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("events"), "\"events\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
