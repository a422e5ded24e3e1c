// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The canonical JSON form used as the input of every signature.
//!
//! The canonical form of a JSON value is:
//!
//! * free of insignificant whitespace,
//! * object keys sorted by the UTF-16 code units of the key,
//! * strings escaped minimally, only `"`, `\` and control characters below
//!   U+0020 are escaped, everything else, including code points above U+FFFF,
//!   is emitted as literal UTF-8,
//! * numbers that are mathematically integers are emitted without a fraction
//!   or exponent.
//!
//! Canonicalization is idempotent, canonicalizing the canonical form of a
//! value returns the same bytes.

use std::{cmp::Ordering, fmt::Write};

use serde::Serialize;
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::error::ErrorKind;

/// Fields that never take part in a signature.
const UNSIGNED_FIELDS: [&str; 2] = ["signatures", "unsigned"];

/// Error type for the canonicalization of JSON values.
#[derive(Debug, Error)]
pub enum CanonicalJsonError {
    /// The value couldn't be converted into JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A signable value needs to be a JSON object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,
}

impl CanonicalJsonError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}

/// Get the canonical form of the given JSON value.
pub fn to_canonical_string(value: &Value) -> String {
    let mut output = String::new();
    write_value(&mut output, value);
    output
}

/// Serialize the given value and return its canonical form.
pub fn to_canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonicalJsonError> {
    Ok(to_canonical_string(&serde_json::to_value(value)?))
}

/// Parse the given JSON string and return its canonical form.
pub fn canonicalize_str(json: &str) -> Result<String, CanonicalJsonError> {
    let value: Value = serde_json::from_str(json)?;
    Ok(to_canonical_string(&value))
}

/// Get the canonical form of a JSON object as it is signed: without its
/// `signatures` and `unsigned` fields.
pub fn to_signable_json(value: &Value) -> Result<String, CanonicalJsonError> {
    let object = value.as_object().ok_or(CanonicalJsonError::NotAnObject)?;

    let signable: Map<String, Value> = object
        .iter()
        .filter(|(key, _)| !UNSIGNED_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Ok(to_canonical_string(&Value::Object(signable)))
}

fn compare_keys(a: &str, b: &str) -> Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

fn write_value(output: &mut String, value: &Value) {
    match value {
        Value::Null => output.push_str("null"),
        Value::Bool(true) => output.push_str("true"),
        Value::Bool(false) => output.push_str("false"),
        Value::Number(number) => write_number(output, number),
        Value::String(string) => write_string(output, string),
        Value::Array(values) => {
            output.push('[');

            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    output.push(',');
                }
                write_value(output, value);
            }

            output.push(']');
        }
        Value::Object(object) => {
            let mut entries: Vec<_> = object.iter().collect();
            entries.sort_by(|(a, _), (b, _)| compare_keys(a, b));

            output.push('{');

            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    output.push(',');
                }
                write_string(output, key);
                output.push(':');
                write_value(output, value);
            }

            output.push('}');
        }
    }
}

fn write_number(output: &mut String, number: &Number) {
    if number.is_i64() || number.is_u64() {
        output.push_str(&number.to_string());
        return;
    }

    match number.as_f64() {
        Some(float) if float.is_finite() && float.fract() == 0.0 => {
            if float == 0.0 {
                // Covers negative zero as well.
                output.push('0');
            } else if float.abs() < i64::MAX as f64 {
                let _ = write!(output, "{}", float as i64);
            } else {
                let _ = write!(output, "{float:.0}");
            }
        }
        _ => output.push_str(&number.to_string()),
    }
}

fn write_string(output: &mut String, string: &str) {
    output.push('"');

    for c in string.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\u{0008}' => output.push_str("\\b"),
            '\u{000C}' => output.push_str("\\f"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(output, "\\u{:04x}", c as u32);
            }
            c => output.push(c),
        }
    }

    output.push('"');
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;
    use serde_json::{json, Value};
    use similar_asserts::assert_eq;

    use super::{canonicalize_str, to_canonical_json, to_canonical_string, to_signable_json};

    #[test]
    fn keys_are_sorted() {
        assert_eq!(canonicalize_str(r#"{"b":false,"a":true}"#).unwrap(), r#"{"a":true,"b":false}"#);
    }

    #[test]
    fn serializable_values_are_canonicalized() {
        let map = HashMap::from([("b", 1.0), ("a", 2.5), ("c", -0.0)]);
        assert_eq!(to_canonical_json(&map).unwrap(), r#"{"a":2.5,"b":1,"c":0}"#);
    }

    #[test]
    fn whitespace_is_removed() {
        let json = r#"{
            "one": 1,
            "two": [ "Two", { "b": null, "a": 2.0 } ]
        }"#;

        assert_eq!(canonicalize_str(json).unwrap(), r#"{"one":1,"two":["Two",{"a":2,"b":null}]}"#);
    }

    #[test]
    fn integers_lose_fraction_and_exponent() {
        assert_eq!(
            canonicalize_str("[1.0, -3.0, 1e3, 0.0, -0.0, 2.5]").unwrap(),
            "[1,-3,1000,0,0,2.5]"
        );
    }

    #[test]
    fn strings_are_minimally_escaped() {
        let value = json!({
            "a": "\u{0000}\u{001F}\n\t\"\\/",
            "b": "日本語",
            "c": "\u{1F600}",
            "d": "\u{2028}\u{007F}",
        });

        assert_eq!(
            to_canonical_string(&value),
            "{\"a\":\"\\u0000\\u001f\\n\\t\\\"\\\\/\",\"b\":\"日本語\",\"c\":\"\u{1F600}\",\"d\":\"\u{2028}\u{007F}\"}"
        );
    }

    #[test]
    fn keys_sort_by_utf16_code_units() {
        // U+FF61 is a single code unit bigger than the leading surrogate of
        // U+1F600, code point order would put it first.
        let value = json!({ "\u{FF61}": 1, "\u{1F600}": 2 });

        assert_eq!(to_canonical_string(&value), "{\"\u{1F600}\":2,\"\u{FF61}\":1}");
    }

    #[test]
    fn signable_json_strips_signatures_and_unsigned() {
        let value = json!({
            "user_id": "@alice:example.org",
            "signatures": { "@alice:example.org": { "ed25519:DEVICE": "sig" } },
            "unsigned": { "device_display_name": "Alice's phone" },
        });

        assert_eq!(to_signable_json(&value).unwrap(), r#"{"user_id":"@alice:example.org"}"#);
        assert!(to_signable_json(&json!([1, 2])).is_err());
    }

    fn arbitrary_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            any::<u64>().prop_map(Value::from),
            (-1_000_000i64..1_000_000, 0i32..6)
                .prop_map(|(mantissa, exponent)| {
                    Value::from(mantissa as f64 / 2f64.powi(exponent))
                }),
            ".*".prop_map(Value::String),
        ];

        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
                prop::collection::btree_map(".*", inner, 0..8)
                    .prop_map(|map| Value::Object(map.into_iter().collect())),
            ]
        })
    }

    /// Serialize a value with pretty whitespace and every object's keys in
    /// descending order, the opposite of the canonical order.
    fn write_shuffled(value: &Value) -> String {
        match value {
            Value::Array(values) => {
                let values: Vec<_> = values.iter().map(write_shuffled).collect();
                format!("[ {} ]", values.join(" , "))
            }
            Value::Object(object) => {
                let mut entries: Vec<_> = object.iter().collect();
                entries.sort_by(|(a, _), (b, _)| b.cmp(a));

                let entries: Vec<_> = entries
                    .into_iter()
                    .map(|(key, value)| {
                        format!("{} :\n {}", Value::String(key.clone()), write_shuffled(value))
                    })
                    .collect();

                format!("{{\n {} \n}}", entries.join(",\n "))
            }
            other => other.to_string(),
        }
    }

    proptest! {
        #[test]
        fn canonicalization_is_idempotent(value in arbitrary_json()) {
            let canonical = to_canonical_string(&value);
            let again = canonicalize_str(&canonical).unwrap();

            prop_assert_eq!(again, canonical);
        }

        #[test]
        fn key_order_and_whitespace_dont_matter(value in arbitrary_json()) {
            let shuffled = write_shuffled(&value);

            prop_assert_eq!(canonicalize_str(&shuffled).unwrap(), to_canonical_string(&value));
        }
    }
}
