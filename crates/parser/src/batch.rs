//! Whole-response segmentation.

use elio_arena::Arena;
use elio_json::{Object, Value};
use tracing::debug;

use crate::{
    PYTHON_TAG_CLOSE, PYTHON_TAG_OPEN, THINK_CLOSE, THINK_OPEN, THINKING_CLOSE, THINKING_OPEN,
    TOOL_CALL_CLOSE, TOOL_CALL_OPEN,
};

/// One piece of a segmented model response, in input order.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment<'a> {
    Text(&'a str),
    Thinking(&'a str),
    ToolCall(ParsedToolCall<'a>),
}

/// A tool invocation extracted from the response text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall<'a> {
    pub name: &'a str,
    /// Always an object, possibly empty.
    pub arguments: Value<'a>,
}

/// Segments `input` into text, thinking and tool-call pieces.
///
/// Never fails: tool-call bodies that do not parse (or lack a string
/// `"name"`) stay in the output as text.  Every input byte is covered by
/// exactly one segment's source range, in order: text segments are verbatim
/// subslices of `input` (whitespace included), and thinking/tool-call
/// segments own the full construct including its tags.  Callers that want
/// tidy display text trim at the point of use.  String payloads of parsed
/// tool-call arguments live in `arena`.
pub fn parse_response<'a>(arena: &'a Arena, input: &'a str) -> Vec<Segment<'a>> {
    parse_spanned(arena, input)
        .into_iter()
        .map(|s| s.segment)
        .collect()
}

/// A segment plus the byte range of `input` it covers.  Kept internal; the
/// coverage invariant is asserted over these in the tests below.
struct SpannedSegment<'a> {
    span: std::ops::Range<usize>,
    segment: Segment<'a>,
}

fn parse_spanned<'a>(arena: &'a Arena, input: &'a str) -> Vec<SpannedSegment<'a>> {
    let mut segments = Vec::new();
    let mut pos = 0;

    // Closing think tag before any opening one: the prompt preloaded the
    // opener, so everything up to the close is reasoning.  Emitted even
    // when the preceding text is empty so the tag bytes stay covered.
    if let Some((close_at, close_len)) = earliest(&[
        find_tag(input, THINK_CLOSE),
        find_tag(input, THINKING_CLOSE),
    ]) && earliest(&[find_tag(input, THINK_OPEN), find_tag(input, THINKING_OPEN)])
        .is_none_or(|(open_at, _)| close_at < open_at)
    {
        let end = close_at + close_len;
        segments.push(SpannedSegment {
            span: 0..end,
            segment: Segment::Thinking(input[..close_at].trim()),
        });
        pos = end;
    }

    while pos < input.len() {
        match find_construct(arena, input, pos) {
            None => {
                push_text(&mut segments, input, pos, input.len());
                break;
            }
            Some(found) => {
                push_text(&mut segments, input, pos, found.start);
                segments.push(SpannedSegment {
                    span: found.start..found.end,
                    segment: found.segment,
                });
                pos = found.end;
            }
        }
    }
    segments
}

struct FoundConstruct<'a> {
    start: usize,
    end: usize,
    segment: Segment<'a>,
}

/// Emits the verbatim slice `input[start..end]` as a text segment.  No
/// trimming: dropping bytes here would leave them covered by no segment.
fn push_text<'a>(segments: &mut Vec<SpannedSegment<'a>>, input: &'a str, start: usize, end: usize) {
    if start < end {
        segments.push(SpannedSegment {
            span: start..end,
            segment: Segment::Text(&input[start..end]),
        });
    }
}

fn find_tag(haystack: &str, tag: &str) -> Option<(usize, usize)> {
    haystack.find(tag).map(|at| (at, tag.len()))
}

fn earliest(candidates: &[Option<(usize, usize)>]) -> Option<(usize, usize)> {
    candidates
        .iter()
        .flatten()
        .copied()
        .min_by_key(|(at, _)| *at)
}

/// Finds the next recognized construct at or after `pos`, preferring the one
/// that starts earliest.
fn find_construct<'a>(arena: &'a Arena, input: &'a str, pos: usize) -> Option<FoundConstruct<'a>> {
    let mut best: Option<FoundConstruct<'a>> = None;
    let mut consider = |candidate: Option<FoundConstruct<'a>>| {
        if let Some(c) = candidate
            && best.as_ref().is_none_or(|b| c.start < b.start)
        {
            best = Some(c);
        }
    };

    consider(tagged_tool_call(
        arena,
        input,
        pos,
        TOOL_CALL_OPEN,
        TOOL_CALL_CLOSE,
    ));
    consider(tagged_tool_call(
        arena,
        input,
        pos,
        PYTHON_TAG_OPEN,
        PYTHON_TAG_CLOSE,
    ));
    consider(think_span(input, pos, THINK_OPEN, THINK_CLOSE));
    consider(think_span(input, pos, THINKING_OPEN, THINKING_CLOSE));
    consider(bare_tool_call(arena, input, pos));

    best
}

/// `<open>{json}<close>`.  A malformed body keeps that occurrence out of the
/// candidates (its bytes fall through as text) and the scan moves on to the
/// next occurrence.
fn tagged_tool_call<'a>(
    arena: &'a Arena,
    input: &'a str,
    pos: usize,
    open: &str,
    close: &str,
) -> Option<FoundConstruct<'a>> {
    let mut from = pos;
    while let Some(rel) = input[from..].find(open) {
        let start = from + rel;
        let body_start = start + open.len();
        let close_at = input[body_start..].find(close)? + body_start;
        let body = input[body_start..close_at].trim();
        let end = close_at + close.len();

        match parse_tool_call_body(arena, body) {
            Some(call) => {
                return Some(FoundConstruct {
                    start,
                    end,
                    segment: Segment::ToolCall(call),
                });
            }
            None => {
                debug!(body_len = body.len(), "dropping malformed tool call body");
                from = end;
            }
        }
    }
    None
}

fn think_span<'a>(
    input: &'a str,
    pos: usize,
    open: &str,
    close: &str,
) -> Option<FoundConstruct<'a>> {
    let start = input[pos..].find(open)? + pos;
    let body_start = start + open.len();
    let (body, end) = match input[body_start..].find(close) {
        Some(close_at) => (
            &input[body_start..body_start + close_at],
            body_start + close_at + close.len(),
        ),
        // Unterminated reasoning runs to the end of the response.
        None => (&input[body_start..], input.len()),
    };
    Some(FoundConstruct {
        start,
        end,
        segment: Segment::Thinking(body.trim()),
    })
}

/// Scans for a bare JSON object with a string `"name"` and an object
/// `"arguments"`: find `"name"`, walk back to the nearest `{`, then match
/// braces while honouring JSON string quoting.  When nested candidates
/// overlap, the leftmost `"name"` occurrence wins.
fn bare_tool_call<'a>(arena: &'a Arena, input: &'a str, pos: usize) -> Option<FoundConstruct<'a>> {
    let bytes = input.as_bytes();
    let mut search = pos;
    while let Some(found) = input[search..].find("\"name\"") {
        let name_at = search + found;
        if let Some(obj_start) = input[pos..name_at].rfind('{').map(|i| i + pos)
            && let Some(obj_end) = match_braces(bytes, obj_start)
        {
            let candidate = &input[obj_start..obj_end];
            if let Some(call) = parse_tool_call_body_strict(arena, candidate) {
                return Some(FoundConstruct {
                    start: obj_start,
                    end: obj_end,
                    segment: Segment::ToolCall(call),
                });
            }
        }
        search = name_at + "\"name\"".len();
    }
    None
}

/// Brace matcher that ignores braces inside string literals.  Returns the
/// offset one past the matching `}`.
fn match_braces(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Tag bodies: `"name"` is required, `"arguments"` defaults to `{}` when
/// absent but must be an object when present.
pub(crate) fn parse_tool_call_body<'a>(arena: &'a Arena, body: &str) -> Option<ParsedToolCall<'a>> {
    let value = elio_json::parse_str(arena, body).ok()?;
    let name = value.get("name")?.as_str()?;
    let arguments = match value.get("arguments") {
        None => Value::Object(Object::new()),
        Some(args) if args.as_object().is_some() => args.clone(),
        Some(_) => return None,
    };
    Some(ParsedToolCall { name, arguments })
}

/// Bare objects additionally require `"arguments"` to be present, otherwise
/// ordinary JSON in prose would be misread as a tool call.
fn parse_tool_call_body_strict<'a>(arena: &'a Arena, body: &str) -> Option<ParsedToolCall<'a>> {
    let value = elio_json::parse_str(arena, body).ok()?;
    let name = value.get("name")?.as_str()?;
    let arguments = value.get("arguments")?;
    arguments.as_object()?;
    Some(ParsedToolCall {
        name,
        arguments: arguments.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(segments: &[Segment<'_>]) -> Vec<String> {
        segments
            .iter()
            .filter_map(|s| match s {
                Segment::ToolCall(c) => Some(c.name.to_string()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn plain_text_is_one_segment() {
        let arena = Arena::new();
        let segs = parse_response(&arena, "Hello! How can I help you?");
        assert_eq!(segs, vec![Segment::Text("Hello! How can I help you?")]);
    }

    #[test]
    fn canonical_tool_call() {
        let arena = Arena::new();
        let segs = parse_response(
            &arena,
            "<tool_call>{\"name\":\"test_tool\",\"arguments\":{}}</tool_call>",
        );
        assert_eq!(segs.len(), 1);
        assert_eq!(names(&segs), ["test_tool"]);
    }

    #[test]
    fn python_tag_form() {
        let arena = Arena::new();
        let segs = parse_response(
            &arena,
            "<|python_tag|>{\"name\":\"run\",\"arguments\":{\"code\":\"1+1\"}}<|eom_id|>",
        );
        assert_eq!(names(&segs), ["run"]);
    }

    #[test]
    fn thinking_then_answer() {
        let arena = Arena::new();
        let segs = parse_response(&arena, "<think>Let me reason</think>Answer");
        assert_eq!(
            segs,
            vec![Segment::Thinking("Let me reason"), Segment::Text("Answer")]
        );
    }

    #[test]
    fn preloaded_opening_tag() {
        let arena = Arena::new();
        let segs = parse_response(&arena, "step one, step two</think>Done.");
        assert_eq!(
            segs,
            vec![
                Segment::Thinking("step one, step two"),
                Segment::Text("Done.")
            ]
        );
    }

    #[test]
    fn bare_json_between_text() {
        let arena = Arena::new();
        let segs = parse_response(
            &arena,
            "Sure: {\"name\":\"lookup\",\"arguments\":{\"q\":\"x\"}} done.",
        );
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0], Segment::Text("Sure: "));
        assert_eq!(names(&segs), ["lookup"]);
        assert_eq!(segs[2], Segment::Text(" done."));
    }

    #[test]
    fn bare_json_without_arguments_is_text() {
        let arena = Arena::new();
        let input = "The record {\"name\":\"Alice\"} was created.";
        let segs = parse_response(&arena, input);
        assert_eq!(segs, vec![Segment::Text(input)]);
    }

    #[test]
    fn malformed_tag_body_falls_through_as_text() {
        let arena = Arena::new();
        let input = "<tool_call>{not json}</tool_call> after";
        let segs = parse_response(&arena, input);
        assert!(names(&segs).is_empty());
        assert!(matches!(segs[0], Segment::Text(_)));
    }

    #[test]
    fn missing_name_is_dropped() {
        let arena = Arena::new();
        let input = "<tool_call>{\"arguments\":{}}</tool_call>";
        let segs = parse_response(&arena, input);
        assert!(names(&segs).is_empty());
    }

    #[test]
    fn ordering_is_preserved_across_multiple_constructs() {
        let arena = Arena::new();
        let input = "<think>plan</think>first <tool_call>{\"name\":\"a\",\"arguments\":{}}</tool_call> mid <tool_call>{\"name\":\"b\",\"arguments\":{}}</tool_call> last";
        let segs = parse_response(&arena, input);
        assert_eq!(
            segs.iter()
                .map(|s| match s {
                    Segment::Thinking(_) => "think",
                    Segment::Text(_) => "text",
                    Segment::ToolCall(_) => "call",
                })
                .collect::<Vec<_>>(),
            ["think", "text", "call", "text", "call", "text"]
        );
        assert_eq!(names(&segs), ["a", "b"]);
    }

    #[test]
    fn nested_tool_call_shaped_objects_leftmost_name_wins() {
        // Behaviour pin: the leftmost "name" occurrence selects the nearest
        // enclosing '{', which here is the inner object.
        let arena = Arena::new();
        let input = "{\"wrapper\":{\"name\":\"inner\",\"arguments\":{}},\"name\":\"outer\",\"arguments\":{}}";
        let segs = parse_response(&arena, input);
        assert_eq!(names(&segs), ["inner"]);
    }

    #[test]
    fn arguments_strings_survive_brace_matching() {
        let arena = Arena::new();
        let input = "{\"name\":\"echo\",\"arguments\":{\"text\":\"braces } in { strings\"}}";
        let segs = parse_response(&arena, input);
        assert_eq!(names(&segs), ["echo"]);
        let Segment::ToolCall(call) = &segs[0] else {
            panic!("expected tool call");
        };
        assert_eq!(
            call.arguments.get("text").and_then(|v| v.as_str()),
            Some("braces } in { strings")
        );
    }

    #[test]
    fn malformed_call_does_not_shadow_a_later_good_one() {
        let arena = Arena::new();
        let input = "<tool_call>{oops}</tool_call> then <tool_call>{\"name\":\"good\",\"arguments\":{}}</tool_call>";
        let segs = parse_response(&arena, input);
        assert_eq!(names(&segs), ["good"]);
        assert!(matches!(segs[0], Segment::Text(_)));
    }

    #[test]
    fn unterminated_think_runs_to_end() {
        let arena = Arena::new();
        let segs = parse_response(&arena, "before<thinking>never closed");
        assert_eq!(
            segs,
            vec![Segment::Text("before"), Segment::Thinking("never closed")]
        );
    }

    #[test]
    fn whitespace_around_text_is_preserved() {
        let arena = Arena::new();
        assert_eq!(parse_response(&arena, "  hi  "), vec![Segment::Text("  hi  ")]);
        assert_eq!(parse_response(&arena, "   "), vec![Segment::Text("   ")]);
        assert_eq!(parse_response(&arena, ""), vec![]);
    }

    #[test]
    fn spans_cover_the_input_exactly_once_in_order() {
        let arena = Arena::new();
        for input in [
            "  hi  ",
            "   ",
            "",
            "a  b   c",
            "lead <tool_call>{\"name\":\"t\",\"arguments\":{}}</tool_call> tail",
            "<think> deep </think>",
            "  pre</think>  post  ",
            "</think>tail",
            " x {\"name\":\"t\",\"arguments\":{\"q\":\" } \"}} y ",
            "<tool_call>{bad}</tool_call> then <tool_call>{\"name\":\"ok\",\"arguments\":{}}</tool_call>",
            "before<thinking>never closed",
        ] {
            let spanned = parse_spanned(&arena, input);
            let mut pos = 0;
            for s in &spanned {
                assert_eq!(s.span.start, pos, "gap before a segment in {input:?}");
                assert!(s.span.end > s.span.start, "empty span in {input:?}");
                pos = s.span.end;
            }
            assert_eq!(pos, input.len(), "tail of {input:?} is uncovered");

            // Text spans carry their bytes verbatim.
            for s in &spanned {
                if let Segment::Text(t) = &s.segment {
                    assert_eq!(*t, &input[s.span.clone()]);
                }
            }
        }
    }
}
