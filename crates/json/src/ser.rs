//! Compact and pretty serialization.

use crate::value::Value;

/// Serializes `value` without any whitespace.
pub fn to_string(value: &Value<'_>) -> String {
    let mut out = String::new();
    write_value(&mut out, value, None, 0);
    out
}

/// Serializes `value` with two-space indentation.
pub fn to_string_pretty(value: &Value<'_>) -> String {
    let mut out = String::new();
    write_value(&mut out, value, Some(2), 0);
    out
}

fn write_value(out: &mut String, value: &Value<'_>, indent: Option<usize>, depth: usize) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Int(n) => out.push_str(&n.to_string()),
        Value::Float(f) => write_float(out, *f),
        Value::Str(s) => write_string(out, s),
        Value::Array(items) => {
            if items.is_empty() {
                out.push_str("[]");
                return;
            }
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                newline_indent(out, indent, depth + 1);
                write_value(out, item, indent, depth + 1);
            }
            newline_indent(out, indent, depth);
            out.push(']');
        }
        Value::Object(obj) => {
            if obj.is_empty() {
                out.push_str("{}");
                return;
            }
            out.push('{');
            for (i, (key, item)) in obj.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                newline_indent(out, indent, depth + 1);
                write_string(out, key);
                out.push(':');
                if indent.is_some() {
                    out.push(' ');
                }
                write_value(out, item, indent, depth + 1);
            }
            newline_indent(out, indent, depth);
            out.push('}');
        }
    }
}

fn newline_indent(out: &mut String, indent: Option<usize>, depth: usize) {
    if let Some(width) = indent {
        out.push('\n');
        for _ in 0..depth * width {
            out.push(' ');
        }
    }
}

/// NaN and the infinities have no JSON form and serialize as `null`.
/// Whole-number doubles print without a decimal point, which `{}` formatting
/// of `f64` already does.
fn write_float(out: &mut String, f: f64) {
    if f.is_finite() {
        out.push_str(&f.to_string());
    } else {
        out.push_str("null");
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_str;
    use elio_arena::Arena;

    #[test]
    fn pretty_uses_two_space_indent() {
        let arena = Arena::new();
        let value = parse_str(&arena, r#"{"a":[1],"b":"x"}"#).unwrap();
        let pretty = to_string_pretty(&value);
        assert_eq!(
            pretty,
            "{\n  \"a\": [\n    1\n  ],\n  \"b\": \"x\"\n}"
        );
    }

    #[test]
    fn non_finite_floats_become_null() {
        assert_eq!(to_string(&Value::Float(f64::NAN)), "null");
        assert_eq!(to_string(&Value::Float(f64::INFINITY)), "null");
    }

    #[test]
    fn whole_doubles_have_no_decimal_point() {
        assert_eq!(to_string(&Value::Float(3.0)), "3");
        assert_eq!(to_string(&Value::Float(3.5)), "3.5");
    }

    #[test]
    fn strings_are_escaped() {
        assert_eq!(
            to_string(&Value::Str("a\"b\\c\nd\u{0001}")),
            "\"a\\\"b\\\\c\\nd\\u0001\""
        );
    }

    #[test]
    fn empty_containers_stay_compact_when_pretty() {
        let arena = Arena::new();
        let value = parse_str(&arena, r#"{"a":[],"b":{}}"#).unwrap();
        assert_eq!(to_string_pretty(&value), "{\n  \"a\": [],\n  \"b\": {}\n}");
    }
}
