//! Incremental response parsing.
//!
//! The streaming parser consumes token chunks as they arrive from a
//! generator and emits events at construct boundaries.  Text is buffered and
//! released only when a recognized tag begins (or at [`StreamingParser::finish`]),
//! so the event sequence is identical no matter how the input was chunked.

use std::collections::VecDeque;

use elio_arena::Arena;
use tracing::warn;

use crate::batch::parse_tool_call_body;
use crate::{
    PYTHON_TAG_CLOSE, PYTHON_TAG_OPEN, THINK_CLOSE, THINK_OPEN, THINKING_CLOSE, THINKING_OPEN,
    TOOL_CALL_CLOSE, TOOL_CALL_OPEN,
};

/// Event emitted by [`StreamingParser::feed`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text(String),
    Thinking(String),
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
}

/// Longest recognized tag is `<|python_tag|>` (14 bytes); anything still
/// unresolved at this length is not a tag.
const MAX_TAG_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Text,
    TagOpen,
    ToolCall,
    Think,
}

/// Incremental tag/state machine over streamed model output.
pub struct StreamingParser {
    state: State,
    /// Plain text awaiting a construct boundary or `finish`.
    text_buf: String,
    /// Partial tag, including the leading `<`.
    tag_buf: String,
    /// Tool-call or thinking body, including any partial closing tag.
    body_buf: String,
    /// Closing tag the current body is waiting for.
    body_close: &'static str,
    /// Whether an opening think tag was seen; gates the preloaded-opener
    /// rule so a stray closing tag later in the stream stays text.
    seen_think_open: bool,
}

impl StreamingParser {
    pub fn new() -> Self {
        Self {
            state: State::Text,
            text_buf: String::new(),
            tag_buf: String::new(),
            body_buf: String::new(),
            body_close: "",
            seen_think_open: false,
        }
    }

    /// True while a tool call is being accumulated (open tag seen, close not
    /// yet).  The orchestrator uses this to suppress user-visible token
    /// callbacks.
    pub fn in_tool_call(&self) -> bool {
        self.state == State::ToolCall
    }

    /// Feeds one chunk of model output, returning any completed events.
    pub fn feed(&mut self, chunk: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let mut queue: VecDeque<char> = chunk.chars().collect();
        while let Some(c) = queue.pop_front() {
            self.step(c, &mut queue, &mut events);
        }
        events
    }

    /// Flushes whatever the end of the stream allows: a pending tag and
    /// buffered text are emitted as text, an unterminated thinking body as
    /// thinking, and an unterminated tool-call body is dropped.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        match self.state {
            State::Text => {}
            State::TagOpen => {
                self.text_buf.push_str(&self.tag_buf);
                self.tag_buf.clear();
            }
            State::ToolCall => {
                warn!(
                    buffered = self.body_buf.len(),
                    "stream ended inside a tool call; dropping partial body"
                );
                self.body_buf.clear();
            }
            State::Think => {
                let body = std::mem::take(&mut self.body_buf);
                let trimmed = body.trim();
                if !trimmed.is_empty() {
                    events.push(StreamEvent::Thinking(trimmed.to_string()));
                }
            }
        }
        self.state = State::Text;
        if !self.text_buf.is_empty() {
            events.push(StreamEvent::Text(std::mem::take(&mut self.text_buf)));
        }
        events
    }

    fn step(&mut self, c: char, queue: &mut VecDeque<char>, events: &mut Vec<StreamEvent>) {
        match self.state {
            State::Text => {
                if c == '<' {
                    self.state = State::TagOpen;
                    self.tag_buf.push(c);
                } else {
                    self.text_buf.push(c);
                }
            }
            State::TagOpen => {
                self.tag_buf.push(c);
                if c == '>' {
                    self.resolve_tag(events, queue);
                } else if self.tag_buf.len() >= MAX_TAG_LEN {
                    let buf = std::mem::take(&mut self.tag_buf);
                    self.bail_tag(&buf, queue);
                }
            }
            State::ToolCall | State::Think => {
                self.body_buf.push(c);
                if self.body_buf.ends_with(self.body_close) {
                    self.finalize_body(events);
                }
            }
        }
    }

    /// A complete `<...>` sequence is in `tag_buf`; either switch state or
    /// hand the bytes back as text.
    fn resolve_tag(&mut self, events: &mut Vec<StreamEvent>, queue: &mut VecDeque<char>) {
        let tag = std::mem::take(&mut self.tag_buf);
        if tag == TOOL_CALL_OPEN || tag == PYTHON_TAG_OPEN {
            self.flush_text(events);
            self.body_close = if tag == TOOL_CALL_OPEN {
                TOOL_CALL_CLOSE
            } else {
                PYTHON_TAG_CLOSE
            };
            self.state = State::ToolCall;
        } else if tag == THINK_OPEN || tag == THINKING_OPEN {
            self.flush_text(events);
            self.body_close = if tag == THINK_OPEN {
                THINK_CLOSE
            } else {
                THINKING_CLOSE
            };
            self.state = State::Think;
            self.seen_think_open = true;
        } else if (tag == THINK_CLOSE || tag == THINKING_CLOSE) && !self.seen_think_open {
            // A closing think tag with no opener: everything so far was
            // reasoning emitted after a preloaded opening tag.
            let text = std::mem::take(&mut self.text_buf);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                events.push(StreamEvent::Thinking(trimmed.to_string()));
            }
            self.state = State::Text;
        } else {
            self.bail_tag(&tag, queue);
        }
    }

    /// Not a recognized tag: the leading `<` becomes text and the rest is
    /// reprocessed, so a tag starting inside the bailed bytes is still found.
    fn bail_tag(&mut self, buf: &str, queue: &mut VecDeque<char>) {
        let mut chars = buf.chars();
        if let Some(first) = chars.next() {
            self.text_buf.push(first);
        }
        for c in chars.rev() {
            queue.push_front(c);
        }
        self.state = State::Text;
    }

    fn flush_text(&mut self, events: &mut Vec<StreamEvent>) {
        if !self.text_buf.is_empty() {
            events.push(StreamEvent::Text(std::mem::take(&mut self.text_buf)));
        }
    }

    /// The closing tag arrived; turn the accumulated body into an event.
    fn finalize_body(&mut self, events: &mut Vec<StreamEvent>) {
        let body_len = self.body_buf.len() - self.body_close.len();
        let mut body = std::mem::take(&mut self.body_buf);
        body.truncate(body_len);

        match self.state {
            State::Think => {
                let trimmed = body.trim();
                if !trimmed.is_empty() {
                    events.push(StreamEvent::Thinking(trimmed.to_string()));
                }
            }
            State::ToolCall => {
                let arena = Arena::new();
                match parse_tool_call_body(&arena, body.trim()) {
                    Some(call) => events.push(StreamEvent::ToolCall {
                        name: call.name.to_string(),
                        arguments: call.arguments.to_serde(),
                    }),
                    None => {
                        // Same degradation as the batch parser: the raw
                        // construct stays visible as text.
                        warn!("malformed streamed tool call body; emitting as text");
                        let open = if self.body_close == TOOL_CALL_CLOSE {
                            TOOL_CALL_OPEN
                        } else {
                            PYTHON_TAG_OPEN
                        };
                        self.text_buf.push_str(open);
                        self.text_buf.push_str(&body);
                        self.text_buf.push_str(self.body_close);
                    }
                }
            }
            _ => unreachable!("finalize_body outside a body state"),
        }
        self.state = State::Text;
    }
}

impl Default for StreamingParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut StreamingParser, input: &str) -> Vec<StreamEvent> {
        let mut events = parser.feed(input);
        events.extend(parser.finish());
        events
    }

    fn feed_chunked(input: &str, chunk_size: usize) -> Vec<StreamEvent> {
        let mut parser = StreamingParser::new();
        let mut events = Vec::new();
        let chars: Vec<char> = input.chars().collect();
        for chunk in chars.chunks(chunk_size.max(1)) {
            let piece: String = chunk.iter().collect();
            events.extend(parser.feed(&piece));
        }
        events.extend(parser.finish());
        events
    }

    #[test]
    fn plain_text_is_flushed_at_finish() {
        let mut parser = StreamingParser::new();
        let events = feed_all(&mut parser, "Hello there");
        assert_eq!(events, vec![StreamEvent::Text("Hello there".to_string())]);
    }

    #[test]
    fn tool_call_event_with_arguments() {
        let mut parser = StreamingParser::new();
        let events = feed_all(
            &mut parser,
            "Checking. <tool_call>{\"name\":\"lookup\",\"arguments\":{\"q\":\"x\"}}</tool_call>",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Text("Checking. ".to_string()));
        assert_eq!(
            events[1],
            StreamEvent::ToolCall {
                name: "lookup".to_string(),
                arguments: serde_json::json!({"q": "x"}),
            }
        );
    }

    #[test]
    fn in_tool_call_flag_tracks_body() {
        let mut parser = StreamingParser::new();
        parser.feed("<tool_call>{\"name\"");
        assert!(parser.in_tool_call());
        parser.feed(":\"t\",\"arguments\":{}}</tool_call>");
        assert!(!parser.in_tool_call());
    }

    #[test]
    fn thinking_span() {
        let mut parser = StreamingParser::new();
        let events = feed_all(&mut parser, "<think>Let me reason</think>Answer");
        assert_eq!(
            events,
            vec![
                StreamEvent::Thinking("Let me reason".to_string()),
                StreamEvent::Text("Answer".to_string()),
            ]
        );
    }

    #[test]
    fn closing_tag_without_opener_marks_preceding_text_as_thinking() {
        let mut parser = StreamingParser::new();
        let events = feed_all(&mut parser, "reasoning here</think>visible");
        assert_eq!(
            events,
            vec![
                StreamEvent::Thinking("reasoning here".to_string()),
                StreamEvent::Text("visible".to_string()),
            ]
        );
    }

    #[test]
    fn unrecognized_tag_is_text_and_later_tags_still_parse() {
        let mut parser = StreamingParser::new();
        let events = feed_all(&mut parser, "a < b <think>t</think>");
        assert_eq!(
            events,
            vec![
                StreamEvent::Text("a < b ".to_string()),
                StreamEvent::Thinking("t".to_string()),
            ]
        );
    }

    #[test]
    fn partial_tool_call_is_never_emitted() {
        let mut parser = StreamingParser::new();
        let mut events = parser.feed("<tool_call>{\"name\":\"t\",\"argu");
        events.extend(parser.finish());
        assert!(events.is_empty());
    }

    #[test]
    fn chunking_does_not_change_the_event_sequence() {
        let input = "lead text <think>deep thought</think> middle <tool_call>{\"name\":\"sum\",\"arguments\":{\"a\":1,\"b\":2}}</tool_call> tail";
        let reference = feed_chunked(input, input.len());
        for size in 1..=input.len() {
            assert_eq!(feed_chunked(input, size), reference, "chunk size {size}");
        }
    }

    #[test]
    fn splitting_at_every_byte_offset_gives_the_same_events() {
        // ASCII input so every byte offset is a valid feed boundary.
        let input = "intro <think>plan carefully</think> mid <tool_call>{\"name\":\"sum\",\"arguments\":{\"a\":1}}</tool_call> tail";
        assert!(input.is_ascii());
        let reference = feed_chunked(input, input.len());
        for split in 0..=input.len() {
            let mut parser = StreamingParser::new();
            let mut events = parser.feed(&input[..split]);
            events.extend(parser.feed(&input[split..]));
            events.extend(parser.finish());
            assert_eq!(events, reference, "split at byte {split}");
        }
    }

    #[test]
    fn python_tag_pair() {
        let mut parser = StreamingParser::new();
        let events = feed_all(
            &mut parser,
            "<|python_tag|>{\"name\":\"py\",\"arguments\":{}}<|eom_id|>",
        );
        assert_eq!(
            events,
            vec![StreamEvent::ToolCall {
                name: "py".to_string(),
                arguments: serde_json::json!({}),
            }]
        );
    }

    #[test]
    fn malformed_streamed_body_degrades_to_text() {
        let mut parser = StreamingParser::new();
        let events = feed_all(&mut parser, "<tool_call>nope</tool_call>");
        assert_eq!(
            events,
            vec![StreamEvent::Text(
                "<tool_call>nope</tool_call>".to_string()
            )]
        );
    }
}
