//! Lenient field extraction and encoding.
//!
//! Documents are schemaless, so every read goes through these helpers: each
//! returns `None` when the field is absent or has the wrong JSON type and
//! never panics. Entity decoders decide which `None`s are fatal and which get
//! a default.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Number, Value};

use super::Document;

/// A string field. Empty strings are returned as-is.
#[must_use]
pub fn string(doc: &Document, key: &str) -> Option<String> {
    doc.get(key).and_then(Value::as_str).map(str::to_owned)
}

/// A string field, or `""` when absent or mistyped.
#[must_use]
pub fn string_or_default(doc: &Document, key: &str) -> String {
    string(doc, key).unwrap_or_default()
}

/// A string field that must be non-empty after trimming.
#[must_use]
pub fn non_empty_string(doc: &Document, key: &str) -> Option<String> {
    string(doc, key).filter(|s| !s.trim().is_empty())
}

/// A string field parsed with `FromStr`.
#[must_use]
pub fn parsed<T: FromStr>(doc: &Document, key: &str) -> Option<T> {
    doc.get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

/// A boolean field.
#[must_use]
pub fn boolean(doc: &Document, key: &str) -> Option<bool> {
    doc.get(key).and_then(Value::as_bool)
}

/// An integer field. Whole floating point numbers are accepted because the
/// hosted store does not distinguish integer and double on some clients.
#[must_use]
pub fn integer(doc: &Document, key: &str) -> Option<i64> {
    let value = doc.get(key)?;
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.is_finite())
            .and_then(|f| f.to_i64())
    })
}

/// A decimal field stored as a number or a numeric string.
///
/// Numbers are converted through their shortest decimal text so that `0.1`
/// reads back as exactly `0.1`.
#[must_use]
pub fn decimal(doc: &Document, key: &str) -> Option<Decimal> {
    decimal_from_value(doc.get(key)?)
}

/// Convert a JSON value to a decimal, if it holds one.
#[must_use]
pub fn decimal_from_value(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// A timestamp stored as RFC 3339 text or epoch milliseconds.
#[must_use]
pub fn timestamp(doc: &Document, key: &str) -> Option<DateTime<Utc>> {
    timestamp_from_value(doc.get(key)?)
}

/// Convert a JSON value to a timestamp, if it holds one.
#[must_use]
pub fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

/// An array field.
#[must_use]
pub fn array<'a>(doc: &'a Document, key: &str) -> Option<&'a Vec<Value>> {
    doc.get(key).and_then(Value::as_array)
}

/// An array of strings. Non-string elements are skipped.
#[must_use]
pub fn string_list(doc: &Document, key: &str) -> Option<Vec<String>> {
    array(doc, key).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect()
    })
}

/// A nested object field.
#[must_use]
pub fn object<'a>(doc: &'a Document, key: &str) -> Option<&'a Document> {
    doc.get(key).and_then(Value::as_object)
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode a decimal as a JSON number when the number reads back as the same
/// decimal, and as text otherwise (more digits than a double keeps).
#[must_use]
pub fn decimal_value(amount: Decimal) -> Value {
    amount
        .to_f64()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .filter(|number| decimal_from_value(number) == Some(amount))
        .unwrap_or_else(|| Value::String(amount.to_string()))
}

/// Encode a timestamp as RFC 3339 text (UTC, millisecond precision).
///
/// Fixed-width output keeps lexicographic order equal to time order, which
/// the store relies on for `order_by`.
#[must_use]
pub fn timestamp_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// The current time at the precision the store keeps.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
