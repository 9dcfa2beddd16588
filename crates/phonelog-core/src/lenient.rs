//! Lenient parsing of stringified pseudo-JSON objects.
//!
//! Some phone clients send the `geometry` and `properties` sub-objects as a
//! string produced by a language whose literal syntax differs from JSON:
//! single-quoted strings, `True` / `False` / `None` tokens, and trailing
//! commas. [`parse_lenient_object`] rewrites such text with a fixed
//! substitution table and then parses it as strict JSON.
//!
//! # Substitution Table
//!
//! Applied in order, each to every occurrence:
//!
//! | # | from       | to         |
//! |---|------------|------------|
//! | 1 | `'`        | `"`        |
//! | 2 | ` True`    | ` true`    |
//! | 3 | ` False`   | ` false`   |
//! | 4 | ` None`    | ` null`    |
//! | 5 | `: True`   | `: true`   |
//! | 6 | `: False`  | `: false`  |
//! | 7 | `: None`   | `: null`   |
//! | 8 | `,\s*}`    | `}`        |
//! | 9 | `,\s*]`    | `]`        |
//!
//! Rows 8 and 9 are regular expressions. Tokens that are not preceded by a
//! space (for example `[True]`) are left alone, and apostrophes inside string
//! values are rewritten like any other quote; such inputs fail to parse and
//! the sub-object is treated as absent.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Literal substitutions, applied in order before the trailing-comma pass.
pub const LITERAL_SUBSTITUTIONS: [(&str, &str); 7] = [
    ("'", "\""),
    (" True", " true"),
    (" False", " false"),
    (" None", " null"),
    (": True", ": true"),
    (": False", ": false"),
    (": None", ": null"),
];

static TRAILING_COMMA_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*\}").expect("trailing comma regex should compile"));

static TRAILING_COMMA_ARRAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*\]").expect("trailing comma regex should compile"));

/// Rewrite pseudo-JSON text into (hopefully) strict JSON.
///
/// This never fails; whether the result parses is up to the caller.
pub fn rewrite_pseudo_json(text: &str) -> String {
    let mut out = text.to_string();
    for (from, to) in LITERAL_SUBSTITUTIONS {
        out = out.replace(from, to);
    }
    let out = TRAILING_COMMA_OBJECT.replace_all(&out, "}");
    TRAILING_COMMA_ARRAY.replace_all(&out, "]").into_owned()
}

/// Parse a stringified pseudo-JSON object.
///
/// Returns `None` if the rewritten text is not valid JSON, or if it is valid
/// JSON but not an object.
pub fn parse_lenient_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(&rewrite_pseudo_json(text)) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) | Err(_) => None,
    }
}
