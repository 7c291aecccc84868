//! Comparison of JSON-RPC responses against recorded expectations.

use serde_json::{Map, Number, Value};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

pub const REDACTION_NOTE: &str = "note: error messages removed from comparison";

/// Wraps the digits of integers too wide for 64 bits. The value is kept as
/// a string so that no precision is lost to `f64`.
const BIG_INT: char = '\u{1}';

/// Parses a JSON document. Integers beyond the 64 bit range stay exact.
pub fn parse(text: &str) -> serde_json::Result<Value> {
    serde_json::from_str(&mark_big_ints(text))
}

fn mark_big_ints(text: &str) -> Cow<'_, str> {
    let bytes = text.as_bytes();
    let mut out = String::new();
    let mut copied = 0;
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            match b {
                b'\\' => i += 1,
                b'"' => in_string = false,
                _ => {}
            }
            i += 1;
            continue;
        }
        if b == b'"' {
            in_string = true;
            i += 1;
            continue;
        }
        if b != b'-' && !b.is_ascii_digit() {
            i += 1;
            continue;
        }

        let start = i;
        let mut integral = true;
        i += 1;
        while i < bytes.len() {
            match bytes[i] {
                b'0'..=b'9' => {}
                b'.' | b'e' | b'E' | b'+' | b'-' => integral = false,
                _ => break,
            }
            i += 1;
        }
        let token = &text[start..i];
        let digits = token.strip_prefix('-').unwrap_or(token);
        let fits = token.parse::<i64>().is_ok() || token.parse::<u64>().is_ok();
        if integral && !digits.is_empty() && !fits {
            out.push_str(&text[copied..start]);
            out.push_str("\"\\u0001");
            out.push_str(token);
            out.push_str("\\u0001\"");
            copied = i;
        }
    }
    if copied == 0 {
        return Cow::Borrowed(text);
    }
    out.push_str(&text[copied..]);
    Cow::Owned(out)
}

/// Digits of an integer that `parse` kept as text.
fn big_int(v: &Value) -> Option<&str> {
    v.as_str()?.strip_prefix(BIG_INT)?.strip_suffix(BIG_INT)
}

/// JSON text of `v` with wide integers written as numbers again.
fn render(v: &Value) -> String {
    v.to_string()
        .replace("\"\\u0001", "")
        .replace("\\u0001\"", "")
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MatchMode {
    /// Structural equality.
    #[default]
    Exact,
    /// Like `Exact`, but `{"min", "max"}` objects in the expectation accept
    /// any quantity in that range.
    Ranged,
    /// Same keys and leaf types, values may differ.
    Type,
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "exact" => Ok(MatchMode::Exact),
            "ranged" => Ok(MatchMode::Ranged),
            "type" => Ok(MatchMode::Type),
            other => Err(format!("unknown match mode {other:?}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Mismatch {
    Value {
        path: String,
        got: Value,
        want: Value,
    },
    MissingKey {
        path: String,
        want: Value,
    },
    UnexpectedKey {
        path: String,
        got: Value,
    },
    Type {
        path: String,
        got: &'static str,
        want: &'static str,
    },
    Length {
        path: String,
        got: usize,
        want: usize,
    },
    OutOfRange {
        path: String,
        got: Value,
        min: Value,
        max: Value,
    },
}

impl Mismatch {
    pub fn path(&self) -> &str {
        match self {
            Mismatch::Value { path, .. }
            | Mismatch::MissingKey { path, .. }
            | Mismatch::UnexpectedKey { path, .. }
            | Mismatch::Type { path, .. }
            | Mismatch::Length { path, .. }
            | Mismatch::OutOfRange { path, .. } => path,
        }
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::Value { path, got, want } => {
                write!(f, "{path}\n-- {}\n++ {}", render(got), render(want))
            }
            Mismatch::MissingKey { path, want } => {
                write!(f, "{path}: missing key\n++ {}", render(want))
            }
            Mismatch::UnexpectedKey { path, got } => {
                write!(f, "{path}: unexpected key in response\n-- {}", render(got))
            }
            Mismatch::Type { path, got, want } => {
                write!(f, "{path}: type mismatch (expected {want}, got {got})")
            }
            Mismatch::Length { path, got, want } => {
                write!(f, "{path}: array length\n-- {got}\n++ {want}")
            }
            Mismatch::OutOfRange {
                path,
                got,
                min,
                max,
            } => write!(
                f,
                "{path}: value out of range\n-- {}\n++ [{}, {}]",
                render(got),
                render(min),
                render(max)
            ),
        }
    }
}

/// Result of checking one response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Comparison {
    pub mismatches: Vec<Mismatch>,
    /// Both sides carried `error.message` and it was left out.
    pub redacted: bool,
}

impl Comparison {
    pub fn is_match(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Human readable report of all mismatches.
    pub fn diff(&self) -> String {
        let mut out = String::from("response differs from expected (-- client, ++ test):");
        for m in &self.mismatches {
            out.push('\n');
            out.push_str(&m.to_string());
        }
        out
    }
}

/// Compares the client's response `got` with the recorded `want`.
pub fn compare(mode: MatchMode, want: &Value, got: &Value) -> Comparison {
    let mut want = want.clone();
    let mut got = got.clone();
    let redacted = redact_error_messages(&mut want, &mut got);

    let mut walker = Walker {
        mode,
        out: Vec::new(),
    };
    match mode {
        MatchMode::Type => {
            walker.structure("$", &want, &got);
            walker.out.truncate(1);
        }
        MatchMode::Exact | MatchMode::Ranged => walker.exact("$", &want, &got),
    }
    Comparison {
        mismatches: walker.out,
        redacted,
    }
}

/// Error messages differ between implementations; codes and data don't.
fn redact_error_messages(want: &mut Value, got: &mut Value) -> bool {
    fn message_holder(v: &mut Value) -> Option<&mut Map<String, Value>> {
        let error = v.as_object_mut()?.get_mut("error")?.as_object_mut()?;
        error.contains_key("message").then_some(error)
    }
    match (message_holder(want), message_holder(got)) {
        (Some(w), Some(g)) => {
            w.remove("message");
            g.remove("message");
            true
        }
        _ => false,
    }
}

struct Walker {
    mode: MatchMode,
    out: Vec<Mismatch>,
}

impl Walker {
    fn exact(&mut self, path: &str, want: &Value, got: &Value) {
        if self.mode == MatchMode::Ranged {
            if let Some((min, max)) = range_placeholder(want) {
                self.in_range(path, want, got, min, max);
                return;
            }
        }
        match (want, got) {
            (Value::Object(w), Value::Object(g)) => self.keys(path, w, g, Walker::exact),
            (Value::Array(w), Value::Array(g)) => {
                if w.len() != g.len() {
                    self.out.push(Mismatch::Length {
                        path: path.to_string(),
                        got: g.len(),
                        want: w.len(),
                    });
                }
                for (i, (w, g)) in w.iter().zip(g).enumerate() {
                    self.exact(&format!("{path}[{i}]"), w, g);
                }
            }
            (Value::Number(w), Value::Number(g)) if numbers_equal(w, g) => {}
            (w, g) if big_int(w).is_some() || big_int(g).is_some() => {
                if !big_ints_equal(w, g) {
                    self.out.push(Mismatch::Value {
                        path: path.to_string(),
                        got: g.clone(),
                        want: w.clone(),
                    });
                }
            }
            (w, g) if w == g => {}
            (w, g) => self.out.push(Mismatch::Value {
                path: path.to_string(),
                got: g.clone(),
                want: w.clone(),
            }),
        }
    }

    fn structure(&mut self, path: &str, want: &Value, got: &Value) {
        match (want, got) {
            (Value::Object(w), Value::Object(g)) => self.keys(path, w, g, Walker::structure),
            (w, g) if type_name(w) == type_name(g) => {}
            (w, g) => self.out.push(Mismatch::Type {
                path: path.to_string(),
                got: type_name(g),
                want: type_name(w),
            }),
        }
    }

    fn keys(
        &mut self,
        path: &str,
        want: &Map<String, Value>,
        got: &Map<String, Value>,
        recurse: fn(&mut Walker, &str, &Value, &Value),
    ) {
        for (key, w) in want {
            let sub = format!("{path}.{key}");
            match got.get(key) {
                Some(g) => recurse(self, &sub, w, g),
                None => self.out.push(Mismatch::MissingKey {
                    path: sub,
                    want: w.clone(),
                }),
            }
        }
        for (key, g) in got {
            if !want.contains_key(key) {
                self.out.push(Mismatch::UnexpectedKey {
                    path: format!("{path}.{key}"),
                    got: g.clone(),
                });
            }
        }
    }

    fn in_range(&mut self, path: &str, want: &Value, got: &Value, min: Quantity, max: Quantity) {
        let Some(value) = Quantity::of(got) else {
            self.out.push(Mismatch::Type {
                path: path.to_string(),
                got: type_name(got),
                want: "Number",
            });
            return;
        };
        let above_min = matches!(value.cmp(&min), Some(Ordering::Greater | Ordering::Equal));
        let below_max = matches!(value.cmp(&max), Some(Ordering::Less | Ordering::Equal));
        if !(above_min && below_max) {
            self.out.push(Mismatch::OutOfRange {
                path: path.to_string(),
                got: got.clone(),
                min: want["min"].clone(),
                max: want["max"].clone(),
            });
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    if big_int(v).is_some() {
        return "Number";
    }
    match v {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(_) => "Number",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y || (x.is_nan() && y.is_nan()),
        _ => false,
    }
}

/// Wide integers are equal only digit for digit. Against a float they are
/// compared as `f64`, which is all the float carries.
fn big_ints_equal(a: &Value, b: &Value) -> bool {
    match (big_int(a), big_int(b), a, b) {
        (Some(x), Some(y), _, _) => x == y,
        (Some(digits), None, _, Value::Number(n)) | (None, Some(digits), Value::Number(n), _) => {
            n.as_i64().is_none()
                && n.as_u64().is_none()
                && digits.parse::<f64>().ok() == n.as_f64()
        }
        _ => false,
    }
}

/// A numeric value, either a JSON number or a `0x` quantity string.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Quantity {
    Int(i128),
    Float(f64),
}

impl Quantity {
    fn of(v: &Value) -> Option<Quantity> {
        match v {
            Value::Number(n) => n
                .as_i64()
                .map(|i| Quantity::Int(i128::from(i)))
                .or_else(|| n.as_u64().map(|u| Quantity::Int(i128::from(u))))
                .or_else(|| n.as_f64().map(Quantity::Float)),
            Value::String(_) if big_int(v).is_some() => {
                let digits = big_int(v)?;
                digits
                    .parse::<i128>()
                    .map(Quantity::Int)
                    .or_else(|_| digits.parse::<f64>().map(Quantity::Float))
                    .ok()
            }
            Value::String(s) => {
                let digits = s.strip_prefix("0x")?;
                let n = u128::from_str_radix(digits, 16).ok()?;
                i128::try_from(n).ok().map(Quantity::Int)
            }
            _ => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Quantity::Int(i) => i as f64,
            Quantity::Float(f) => f,
        }
    }

    fn cmp(&self, other: &Quantity) -> Option<Ordering> {
        match (self, other) {
            (Quantity::Int(a), Quantity::Int(b)) => Some(a.cmp(b)),
            _ => self.as_f64().partial_cmp(&other.as_f64()),
        }
    }
}

fn range_placeholder(v: &Value) -> Option<(Quantity, Quantity)> {
    let obj = v.as_object()?;
    if obj.len() != 2 {
        return None;
    }
    let min = Quantity::of(obj.get("min")?)?;
    let max = Quantity::of(obj.get("max")?)?;
    Some((min, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exact_ignores_key_order_and_number_form() {
        let want = json!({"id": 1, "result": {"a": 1, "b": [1.0, 2]}});
        let got: Value = serde_json::from_str(r#"{"result":{"b":[1,2.0],"a":1},"id":1}"#).unwrap();
        assert!(compare(MatchMode::Exact, &want, &got).is_match());
    }

    #[test]
    fn exact_reports_paths() {
        let want = json!({"result": {"logs": [{"address": "0x1"}, {"address": "0x2"}]}});
        let got = json!({"result": {"logs": [{"address": "0x1"}, {"address": "0x3"}]}});
        let cmp = compare(MatchMode::Exact, &want, &got);
        assert_eq!(cmp.mismatches.len(), 1);
        assert_eq!(cmp.mismatches[0].path(), "$.result.logs[1].address");
        let diff = cmp.diff();
        assert!(diff.starts_with("response differs from expected (-- client, ++ test):"));
        assert!(diff.contains("-- \"0x3\"\n++ \"0x2\""), "{diff}");
    }

    #[test]
    fn null_is_not_missing() {
        let cmp = compare(MatchMode::Exact, &json!({"result": null}), &json!({}));
        assert_eq!(
            cmp.mismatches,
            vec![Mismatch::MissingKey {
                path: "$.result".to_string(),
                want: Value::Null
            }]
        );

        let cmp = compare(MatchMode::Exact, &json!({}), &json!({"extra": null}));
        assert!(cmp.diff().contains("$.extra: unexpected key in response"));
    }

    #[test]
    fn array_length_is_fixed() {
        let cmp = compare(MatchMode::Exact, &json!([1, 2, 3]), &json!([1, 2]));
        assert_eq!(
            cmp.mismatches,
            vec![Mismatch::Length {
                path: "$".to_string(),
                got: 2,
                want: 3
            }]
        );
    }

    #[test]
    fn error_messages_are_redacted() {
        let want = json!({"error": {"code": -32000, "message": "some"}});
        let got = json!({"error": {"code": -32000, "message": "other"}});
        let cmp = compare(MatchMode::Exact, &want, &got);
        assert!(cmp.is_match());
        assert!(cmp.redacted);

        let got = json!({"error": {"code": -32602, "message": "other"}});
        let cmp = compare(MatchMode::Exact, &want, &got);
        assert!(!cmp.is_match(), "codes still compared");
        assert_eq!(cmp.mismatches[0].path(), "$.error.code");
    }

    #[test]
    fn one_sided_error_message_is_kept() {
        let want = json!({"error": {"code": 1, "message": "x"}});
        let got = json!({"error": {"code": 1}});
        let cmp = compare(MatchMode::Exact, &want, &got);
        assert!(!cmp.redacted);
        assert_eq!(cmp.mismatches[0].path(), "$.error.message");
    }

    #[test]
    fn ranged_accepts_numbers_and_quantities() {
        let want = json!({"result": {"gasUsed": {"min": "0x5208", "max": 30000}, "to": "0xaa"}});
        let ok = json!({"result": {"gasUsed": "0x5300", "to": "0xaa"}});
        assert!(compare(MatchMode::Ranged, &want, &ok).is_match());
        let ok = json!({"result": {"gasUsed": 30000, "to": "0xaa"}});
        assert!(compare(MatchMode::Ranged, &want, &ok).is_match());

        let low = json!({"result": {"gasUsed": "0x1", "to": "0xaa"}});
        let cmp = compare(MatchMode::Ranged, &want, &low);
        assert!(matches!(&cmp.mismatches[..], [Mismatch::OutOfRange { path, .. }] if path == "$.result.gasUsed"));

        let bad = json!({"result": {"gasUsed": "lots", "to": "0xbb"}});
        assert_eq!(compare(MatchMode::Ranged, &want, &bad).mismatches.len(), 2);
    }

    #[test]
    fn exact_treats_placeholders_literally() {
        let want = json!({"min": 1, "max": 3});
        assert!(!compare(MatchMode::Exact, &want, &json!(2)).is_match());
    }

    #[test]
    fn type_match_ignores_values() {
        let want = json!({"result": {"hash": "0xdeadbeef", "number": "0x1"}});
        let got = json!({"result": {"hash": "0xabc123", "number": "0x2"}});
        assert!(compare(MatchMode::Type, &want, &got).is_match());

        let want = json!({"result": [1, 2, 3]});
        let got = json!({"result": ["a"]});
        assert!(compare(MatchMode::Type, &want, &got).is_match(), "arrays only need to be arrays");
    }

    #[test]
    fn type_match_reports_first_offence() {
        let want = json!({"result": "0x1", "z": 1});
        let got = json!({"result": null, "extra": true});
        let cmp = compare(MatchMode::Type, &want, &got);
        assert_eq!(cmp.mismatches.len(), 1);
        assert_eq!(
            cmp.mismatches[0].to_string(),
            "$.result: type mismatch (expected String, got Null)"
        );
    }

    #[test]
    fn wide_integers_keep_their_digits() {
        let want = parse(r#"{"result": 18446744073709551616}"#).unwrap();
        let got = parse(r#"{"result": 18446744073709551617}"#).unwrap();
        let cmp = compare(MatchMode::Exact, &want, &got);
        assert!(!cmp.is_match());
        assert!(
            cmp.diff().contains("-- 18446744073709551617\n++ 18446744073709551616"),
            "{}",
            cmp.diff()
        );

        let same = parse(r#"{"result": 18446744073709551616}"#).unwrap();
        assert!(compare(MatchMode::Exact, &want, &same).is_match());

        let negative = parse("[-9223372036854775809, 1, -2]").unwrap();
        let narrow = json!([i64::MIN, 1, -2]);
        assert!(!compare(MatchMode::Exact, &negative, &narrow).is_match());
        assert!(compare(MatchMode::Type, &want, &json!({"result": 7})).is_match());
    }

    #[test]
    fn wide_integers_in_ranges_and_strings() {
        let want = json!({"min": 1, "max": "0xffffffffffffffffff"});
        let got = parse("18446744073709551616").unwrap();
        assert!(compare(MatchMode::Ranged, &want, &got).is_match());

        // digits inside strings are left alone
        let text = r#"{"data": "99999999999999999999", "n": 1.5e300}"#;
        assert_eq!(
            parse(text).unwrap(),
            json!({"data": "99999999999999999999", "n": 1.5e300})
        );
        assert!(parse(r#"{"a": "\"", "b": 2}"#).is_ok());
    }

    #[test]
    fn match_mode_names() {
        assert_eq!("ranged".parse::<MatchMode>().unwrap(), MatchMode::Ranged);
        assert!("fuzzy".parse::<MatchMode>().is_err());
    }
}
