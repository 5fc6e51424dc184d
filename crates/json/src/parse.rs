//! Recursive-descent parser for the RFC-8259 grammar.

use elio_arena::{Arena, ArenaError};

use crate::value::{Object, Value};

/// Parse failure with the byte offset where it happened.
#[derive(Debug, thiserror::Error)]
pub enum JsonError {
    #[error("parse error at byte {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error(transparent)]
    Arena(#[from] ArenaError),
}

/// Parses a complete JSON document from `input`.  Trailing non-whitespace
/// after the root value is an error.
pub fn parse<'a>(arena: &'a Arena, input: &[u8]) -> Result<Value<'a>, JsonError> {
    let mut parser = Parser {
        arena,
        bytes: input,
        pos: 0,
    };
    parser.skip_ws();
    let value = parser.parse_value()?;
    parser.skip_ws();
    if parser.pos != parser.bytes.len() {
        return Err(parser.fail("trailing content after JSON value"));
    }
    Ok(value)
}

/// [`parse`] over a `&str`.
pub fn parse_str<'a>(arena: &'a Arena, input: &str) -> Result<Value<'a>, JsonError> {
    parse(arena, input.as_bytes())
}

struct Parser<'a, 'b> {
    arena: &'a Arena,
    bytes: &'b [u8],
    pos: usize,
}

impl<'a> Parser<'a, '_> {
    fn fail(&self, message: impl Into<String>) -> JsonError {
        JsonError::Parse {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), JsonError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.fail(format!("expected '{}'", byte as char)))
        }
    }

    fn parse_value(&mut self) -> Result<Value<'a>, JsonError> {
        match self.peek() {
            Some(b'{') => self.parse_object(),
            Some(b'[') => self.parse_array(),
            Some(b'"') => Ok(Value::Str(self.parse_string()?)),
            Some(b't') => self.parse_keyword("true", Value::Bool(true)),
            Some(b'f') => self.parse_keyword("false", Value::Bool(false)),
            Some(b'n') => self.parse_keyword("null", Value::Null),
            Some(b'-') | Some(b'0'..=b'9') => self.parse_number(),
            Some(other) => Err(self.fail(format!("unexpected byte 0x{other:02x}"))),
            None => Err(self.fail("unexpected end of input")),
        }
    }

    fn parse_keyword(&mut self, word: &str, value: Value<'a>) -> Result<Value<'a>, JsonError> {
        if self.bytes[self.pos..].starts_with(word.as_bytes()) {
            self.pos += word.len();
            Ok(value)
        } else {
            Err(self.fail(format!("expected '{word}'")))
        }
    }

    fn parse_object(&mut self) -> Result<Value<'a>, JsonError> {
        self.expect(b'{')?;
        let mut object = Object::new();
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(Value::Object(object));
        }
        loop {
            self.skip_ws();
            let key = self.parse_string()?;
            self.skip_ws();
            self.expect(b':')?;
            self.skip_ws();
            let value = self.parse_value()?;
            object.insert(key, value);
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Value::Object(object));
                }
                _ => return Err(self.fail("expected ',' or '}'")),
            }
        }
    }

    fn parse_array(&mut self) -> Result<Value<'a>, JsonError> {
        self.expect(b'[')?;
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(Value::Array(items));
        }
        loop {
            self.skip_ws();
            items.push(self.parse_value()?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    return Ok(Value::Array(items));
                }
                _ => return Err(self.fail("expected ',' or ']'")),
            }
        }
    }

    /// Parses a string literal into the arena.  The scan pass records whether
    /// any escape was seen; escape-free strings are copied in one pass.
    fn parse_string(&mut self) -> Result<&'a str, JsonError> {
        self.expect(b'"')?;
        let start = self.pos;
        let mut has_escape = false;
        loop {
            match self.peek() {
                None => return Err(self.fail("unterminated string")),
                Some(b'"') => break,
                Some(b'\\') => {
                    has_escape = true;
                    self.pos += 1;
                    if self.peek().is_none() {
                        return Err(self.fail("unterminated escape"));
                    }
                    self.pos += 1;
                }
                Some(byte) if byte < 0x20 => {
                    return Err(self.fail("unescaped control character in string"));
                }
                Some(_) => self.pos += 1,
            }
        }
        let end = self.pos;
        self.pos += 1; // closing quote

        let raw = &self.bytes[start..end];
        if !has_escape {
            let text = std::str::from_utf8(raw).map_err(|e| JsonError::Parse {
                offset: start + e.valid_up_to(),
                message: "invalid UTF-8 in string".to_string(),
            })?;
            return Ok(self.arena.alloc_str(text)?);
        }
        let decoded = decode_escapes(raw, start)?;
        Ok(self.arena.alloc_str(&decoded)?)
    }

    fn parse_number(&mut self) -> Result<Value<'a>, JsonError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        // Integer part: "0" alone or a nonzero-led digit run.
        match self.peek() {
            Some(b'0') => {
                self.pos += 1;
                if matches!(self.peek(), Some(b'0'..=b'9')) {
                    return Err(self.fail("leading zero in number"));
                }
            }
            Some(b'1'..=b'9') => {
                while matches!(self.peek(), Some(b'0'..=b'9')) {
                    self.pos += 1;
                }
            }
            _ => return Err(self.fail("invalid number")),
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') {
            is_float = true;
            self.pos += 1;
            if !matches!(self.peek(), Some(b'0'..=b'9')) {
                return Err(self.fail("expected digit after decimal point"));
            }
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            is_float = true;
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            if !matches!(self.peek(), Some(b'0'..=b'9')) {
                return Err(self.fail("expected digit in exponent"));
            }
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }

        // The scanned range is ASCII by construction.
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap();
        if !is_float {
            // i64 when it fits; numbers beyond the i64 range degrade to f64.
            if let Ok(n) = text.parse::<i64>() {
                return Ok(Value::Int(n));
            }
        }
        text.parse::<f64>()
            .map(Value::Float)
            .map_err(|_| JsonError::Parse {
                offset: start,
                message: "invalid number".to_string(),
            })
    }
}

/// Decodes the escape sequences of a scanned string body.
///
/// `\uXXXX` surrogate pairs are combined into the supplementary code point;
/// an unpaired surrogate is kept as the literal source text so no bytes are
/// corrupted.
fn decode_escapes(raw: &[u8], base_offset: usize) -> Result<String, JsonError> {
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let byte = raw[i];
        if byte != b'\\' {
            // Copy a run of plain bytes, validating them as UTF-8.
            let run_start = i;
            while i < raw.len() && raw[i] != b'\\' {
                i += 1;
            }
            let run = std::str::from_utf8(&raw[run_start..i]).map_err(|e| JsonError::Parse {
                offset: base_offset + run_start + e.valid_up_to(),
                message: "invalid UTF-8 in string".to_string(),
            })?;
            out.push_str(run);
            continue;
        }
        let esc = raw.get(i + 1).copied().ok_or(JsonError::Parse {
            offset: base_offset + i,
            message: "unterminated escape".to_string(),
        })?;
        match esc {
            b'"' => out.push('"'),
            b'\\' => out.push('\\'),
            b'/' => out.push('/'),
            b'b' => out.push('\u{0008}'),
            b'f' => out.push('\u{000C}'),
            b'n' => out.push('\n'),
            b'r' => out.push('\r'),
            b't' => out.push('\t'),
            b'u' => {
                let first = read_hex4(raw, i + 2, base_offset)?;
                if (0xD800..=0xDBFF).contains(&first) {
                    // High surrogate: combine with a following \uXXXX low half.
                    let next = i + 6;
                    if raw.get(next) == Some(&b'\\') && raw.get(next + 1) == Some(&b'u') {
                        let second = read_hex4(raw, next + 2, base_offset)?;
                        if (0xDC00..=0xDFFF).contains(&second) {
                            let combined =
                                0x10000 + ((first - 0xD800) << 10) + (second - 0xDC00);
                            // In range by construction.
                            out.push(char::from_u32(combined).unwrap());
                            i = next + 6;
                            continue;
                        }
                    }
                    push_literal_escape(&mut out, raw, i);
                } else if (0xDC00..=0xDFFF).contains(&first) {
                    push_literal_escape(&mut out, raw, i);
                } else {
                    out.push(char::from_u32(first).unwrap());
                }
                i += 6;
                continue;
            }
            other => {
                return Err(JsonError::Parse {
                    offset: base_offset + i,
                    message: format!("invalid escape '\\{}'", other as char),
                });
            }
        }
        i += 2;
    }
    Ok(out)
}

fn read_hex4(raw: &[u8], at: usize, base_offset: usize) -> Result<u32, JsonError> {
    let slice = raw.get(at..at + 4).ok_or(JsonError::Parse {
        offset: base_offset + at,
        message: "truncated \\u escape".to_string(),
    })?;
    if !slice.iter().all(u8::is_ascii_hexdigit) {
        return Err(JsonError::Parse {
            offset: base_offset + at,
            message: "invalid \\u escape".to_string(),
        });
    }
    // Hex digits only, so this is ASCII.
    let text = std::str::from_utf8(slice).unwrap();
    u32::from_str_radix(text, 16).map_err(|_| JsonError::Parse {
        offset: base_offset + at,
        message: "invalid \\u escape".to_string(),
    })
}

/// Emits the six source bytes of a `\uXXXX` escape verbatim.
fn push_literal_escape(out: &mut String, raw: &[u8], at: usize) {
    // Hex digits and the prefix are ASCII, so this slice is valid UTF-8.
    out.push_str(std::str::from_utf8(&raw[at..at + 6]).unwrap());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Arena {
        Arena::new()
    }

    #[test]
    fn simple_escapes() {
        let a = arena();
        let v = parse_str(&a, r#""line\nbreak \"quoted\" \t tab""#).unwrap();
        assert_eq!(v.as_str(), Some("line\nbreak \"quoted\" \t tab"));
    }

    #[test]
    fn unicode_escape_bmp() {
        let a = arena();
        let v = parse_str(&a, "\"\\u3053\\u3093\"").unwrap();
        assert_eq!(v.as_str(), Some("こん"));
    }

    #[test]
    fn surrogate_pair_combines() {
        let a = arena();
        let v = parse_str(&a, "\"\\uD834\\uDD1E\"").unwrap();
        assert_eq!(v.as_str(), Some("𝄞"));
    }

    #[test]
    fn lone_surrogate_stays_literal() {
        let a = arena();
        let v = parse_str(&a, r#""x\uD834y""#).unwrap();
        assert_eq!(v.as_str(), Some("x\\uD834y"));

        let v = parse_str(&a, r#""\uDD1E""#).unwrap();
        assert_eq!(v.as_str(), Some("\\uDD1E"));
    }

    #[test]
    fn trailing_content_is_rejected() {
        let a = arena();
        let err = parse_str(&a, "1 2").unwrap_err();
        match err {
            JsonError::Parse { offset, .. } => assert_eq!(offset, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn leading_zero_is_rejected() {
        let a = arena();
        assert!(parse_str(&a, "01").is_err());
    }

    #[test]
    fn control_character_is_rejected() {
        let a = arena();
        assert!(parse(&a, b"\"a\x01b\"").is_err());
    }

    #[test]
    fn i64_boundaries() {
        let a = arena();
        assert_eq!(
            parse_str(&a, "9223372036854775807").unwrap(),
            Value::Int(i64::MAX)
        );
        assert_eq!(
            parse_str(&a, "-9223372036854775808").unwrap(),
            Value::Int(i64::MIN)
        );
        // One past the boundary degrades to f64.
        assert!(matches!(
            parse_str(&a, "9223372036854775808").unwrap(),
            Value::Float(_)
        ));
    }

    #[test]
    fn exponent_forms_are_floats() {
        let a = arena();
        assert_eq!(parse_str(&a, "1e3").unwrap(), Value::Float(1000.0));
        assert_eq!(parse_str(&a, "2E-2").unwrap(), Value::Float(0.02));
    }

    #[test]
    fn nested_structures() {
        let a = arena();
        let v = parse_str(&a, r#"{"outer":{"inner":[1,{"deep":true}]}}"#).unwrap();
        let deep = v
            .get("outer")
            .and_then(|o| o.get("inner"))
            .and_then(|arr| arr.as_array())
            .and_then(|items| items.get(1))
            .and_then(|item| item.get("deep"));
        assert_eq!(deep, Some(&Value::Bool(true)));
    }

    #[test]
    fn error_offsets_point_at_the_problem() {
        let a = arena();
        let err = parse_str(&a, r#"{"a": tru}"#).unwrap_err();
        match err {
            JsonError::Parse { offset, .. } => assert_eq!(offset, 6),
            other => panic!("unexpected error: {other}"),
        }
    }
}
