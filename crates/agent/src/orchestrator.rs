//! The multi-iteration agent loop.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use elio_arena::Arena;
use elio_arena::text::truncate_text;
use elio_parser::{Segment, StreamingParser, parse_response};
use elio_tools::{ToolOutput, ToolRegistry};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, GenerationSettings, TokenSink};
use crate::error::AgentError;
use crate::message::{Message, ToolCallRecord, ToolResultRecord};
use crate::prompt::build_system_prompt;

/// What the agent is currently doing, observable via
/// [`AgentConfig::on_step_change`] and [`Agent::current_step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    None,
    Thinking,
    CallingTool(String),
    WaitingForResult,
    Generating,
}

pub type TokenCallback = Box<dyn Fn(&str) + Send + Sync>;
pub type ToolCallCallback = Box<dyn Fn(&ToolCallRecord) + Send + Sync>;
pub type StepCallback = Box<dyn Fn(&Step) + Send + Sync>;
pub type SchemaProvider = Box<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Per-agent configuration.  Observer callbacks replace any framework-level
/// reactivity: callers that want UI updates register closures here and pull
/// current state through the accessors.
pub struct AgentConfig {
    pub max_iterations: usize,
    /// Tool results longer than this are truncated on a code-point boundary.
    pub max_tool_result_len: usize,
    pub use_japanese: bool,
    pub custom_system_prompt: Option<String>,
    /// Overrides the registry-derived tool schema when set.
    pub get_tools_schema: Option<SchemaProvider>,
    pub on_token: Option<TokenCallback>,
    pub on_tool_call: Option<ToolCallCallback>,
    pub on_step_change: Option<StepCallback>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_tool_result_len: 4096,
            use_japanese: false,
            custom_system_prompt: None,
            get_tools_schema: None,
            on_token: None,
            on_tool_call: None,
            on_step_change: None,
        }
    }
}

/// The outcome of one run.
///
/// `error` is set when the run failed; for [`AgentError::MaxIterations`] and
/// [`AgentError::Cancelled`] the text accumulated so far is still present in
/// `response`.
#[derive(Debug)]
pub struct RunResult {
    pub response: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub iterations: usize,
    pub error: Option<AgentError>,
}

/// Cloneable, advisory, idempotent cancellation signal for an in-flight run.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An agent bound to a backend, a tool registry and a persistent message
/// history.
///
/// `run` is not re-entrant: it takes `&mut self`, and `is_processing`
/// additionally guards against a second run being driven through shared
/// wrappers.  Multiple agents run in parallel fine; each run owns its arena.
pub struct Agent {
    backend: Arc<dyn Backend>,
    tools: Arc<ToolRegistry>,
    config: AgentConfig,
    settings: GenerationSettings,
    history: Vec<Message>,
    step: Mutex<Step>,
    is_processing: AtomicBool,
    should_stop: Arc<AtomicBool>,
}

impl Agent {
    pub fn new(backend: Arc<dyn Backend>, tools: Arc<ToolRegistry>, config: AgentConfig) -> Self {
        Self {
            backend,
            tools,
            config,
            settings: GenerationSettings::default(),
            history: Vec::new(),
            step: Mutex::new(Step::None),
            is_processing: AtomicBool::new(false),
            should_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.should_stop))
    }

    /// Advisory cancellation; equivalent to `stop_handle().stop()`.
    pub fn stop(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
    }

    pub fn current_step(&self) -> Step {
        self.step.lock().unwrap().clone()
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::SeqCst)
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Runs the agent loop for one user message.
    pub async fn run(&mut self, user_text: &str) -> RunResult {
        if self.is_processing.swap(true, Ordering::SeqCst) {
            return RunResult {
                response: String::new(),
                thinking: None,
                tool_calls: Vec::new(),
                iterations: 0,
                error: Some(AgentError::InvalidArgument(
                    "a run is already in progress on this agent".to_string(),
                )),
            };
        }
        self.should_stop.store(false, Ordering::SeqCst);

        let result = self.run_inner(user_text).await;

        self.set_step(Step::None);
        self.is_processing.store(false, Ordering::SeqCst);
        result
    }

    fn set_step(&self, step: Step) {
        *self.step.lock().unwrap() = step.clone();
        if let Some(cb) = &self.config.on_step_change {
            cb(&step);
        }
    }

    async fn dispatch(&self, call: &ToolCallRecord) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => tool.run(&call.arguments).await,
            None => {
                warn!(tool = %call.name, "model requested unknown tool");
                ToolOutput::error(format!("Tool '{}' not found", call.name))
            }
        }
    }

    async fn run_inner(&mut self, user_text: &str) -> RunResult {
        let schema = match &self.config.get_tools_schema {
            Some(provider) => provider(),
            None => self.tools.to_openai_schema(),
        };
        let schema_text = serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "[]".into());
        let system_prompt = build_system_prompt(
            &schema_text,
            &self.tools.to_markdown(),
            self.config.custom_system_prompt.as_deref(),
            self.config.use_japanese,
        );

        // Per-run working copy; the persistent history is only replaced on a
        // successful completion.
        let mut working = self.history.clone();
        working.push(Message::user(user_text));

        let mut run_text = String::new();
        let mut thinking_acc = String::new();
        let mut all_calls: Vec<ToolCallRecord> = Vec::new();
        let mut iterations = 0usize;

        loop {
            iterations += 1;
            self.set_step(Step::Generating);
            debug!(iteration = iterations, messages = working.len(), "generating");

            let sink = RunSink {
                should_stop: &self.should_stop,
                parser: Mutex::new(StreamingParser::new()),
                on_token: self.config.on_token.as_ref(),
                step: &self.step,
                on_step_change: self.config.on_step_change.as_ref(),
                announced_thinking: AtomicBool::new(false),
            };
            let generated = self
                .backend
                .generate(&working, &system_prompt, &self.settings, &sink)
                .await;
            let response_text = match generated {
                Ok(text) => text,
                Err(err) => {
                    return RunResult {
                        response: run_text,
                        thinking: non_empty(thinking_acc),
                        tool_calls: all_calls,
                        iterations,
                        error: Some(err),
                    };
                }
            };

            if self.should_stop.load(Ordering::SeqCst) {
                // Salvage whatever text the partial response held, then drop
                // the working history on the floor.
                let arena = Arena::new();
                for segment in parse_response(&arena, &response_text) {
                    match segment {
                        // Text spans are verbatim; trim for presentation.
                        Segment::Text(t) => append_text(&mut run_text, t.trim()),
                        Segment::Thinking(t) => append_text(&mut thinking_acc, t),
                        Segment::ToolCall(_) => {}
                    }
                }
                info!(iterations, "run cancelled");
                return RunResult {
                    response: run_text,
                    thinking: non_empty(thinking_acc),
                    tool_calls: all_calls,
                    iterations,
                    error: Some(AgentError::Cancelled),
                };
            }

            let arena = Arena::new();
            let segments = parse_response(&arena, &response_text);
            let mut iteration_text = String::new();
            let mut saw_tool_call = false;

            for segment in &segments {
                match segment {
                    // Text spans are verbatim; trim for history and display.
                    Segment::Text(t) => append_text(&mut iteration_text, t.trim()),
                    Segment::Thinking(t) => append_text(&mut thinking_acc, t),
                    Segment::ToolCall(call) => {
                        saw_tool_call = true;
                        let record = ToolCallRecord {
                            id: Uuid::new_v4(),
                            name: call.name.to_string(),
                            arguments: call.arguments.to_serde(),
                        };
                        working.push(Message::assistant_with_tool_calls(
                            iteration_text.clone(),
                            vec![record.clone()],
                        ));
                        if let Some(cb) = &self.config.on_tool_call {
                            cb(&record);
                        }
                        info!(tool = %record.name, "dispatching tool call");
                        self.set_step(Step::CallingTool(record.name.clone()));
                        self.set_step(Step::WaitingForResult);
                        let output = self.dispatch(&record).await;

                        let truncated =
                            truncate_text(&output.content, self.config.max_tool_result_len)
                                .into_owned();
                        working.push(Message::tool_result(ToolResultRecord {
                            id: Uuid::new_v4(),
                            tool_call_id: record.id,
                            content: truncated,
                            is_error: output.is_error,
                        }));
                        all_calls.push(record);
                    }
                }
            }

            append_text(&mut run_text, &iteration_text);

            if !saw_tool_call {
                let mut final_msg = Message::assistant(iteration_text);
                if !thinking_acc.is_empty() {
                    final_msg = final_msg.with_thinking(thinking_acc.clone());
                }
                working.push(final_msg);
                self.history = working;
                info!(iterations, tool_calls = all_calls.len(), "run complete");
                return RunResult {
                    response: run_text,
                    thinking: non_empty(thinking_acc),
                    tool_calls: all_calls,
                    iterations,
                    error: None,
                };
            }

            if iterations == self.config.max_iterations {
                warn!(max = self.config.max_iterations, "iteration cap reached");
                return RunResult {
                    response: run_text,
                    thinking: non_empty(thinking_acc),
                    tool_calls: all_calls,
                    iterations,
                    error: Some(AgentError::MaxIterations(iterations)),
                };
            }
        }
    }
}

fn append_text(buf: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    if !buf.is_empty() {
        buf.push('\n');
    }
    buf.push_str(text);
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

/// Token sink wired into one generation call: accumulates into the streaming
/// parser, suppresses user-visible tokens while a tool call is buffering,
/// and relays the cooperative stop flag.
struct RunSink<'a> {
    should_stop: &'a AtomicBool,
    parser: Mutex<StreamingParser>,
    on_token: Option<&'a TokenCallback>,
    step: &'a Mutex<Step>,
    on_step_change: Option<&'a StepCallback>,
    announced_thinking: AtomicBool,
}

impl TokenSink for RunSink<'_> {
    fn on_token(&self, token: &str) -> bool {
        if self.should_stop.load(Ordering::SeqCst) {
            return false;
        }
        let in_tool_call = {
            let mut parser = self.parser.lock().unwrap();
            parser.feed(token);
            parser.in_tool_call()
        };
        if in_tool_call {
            if !self.announced_thinking.swap(true, Ordering::SeqCst) {
                *self.step.lock().unwrap() = Step::Thinking;
                if let Some(cb) = self.on_step_change {
                    cb(&Step::Thinking);
                }
            }
        } else if let Some(cb) = self.on_token {
            cb(token);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;
    use async_trait::async_trait;
    use elio_tools::{FnTool, ParamSchema, ToolDefinition};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Backend that replays a scripted list of responses, streaming each in
    /// small chunks through the sink.
    struct ScriptedBackend {
        responses: Mutex<VecDeque<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(responses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
                calls: AtomicUsize::new(0),
            })
        }

        fn generate_calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        fn backend_id(&self) -> &str {
            "scripted"
        }
        fn display_name(&self) -> &str {
            "scripted"
        }
        fn is_ready(&self) -> bool {
            true
        }
        fn is_generating(&self) -> bool {
            false
        }
        async fn generate(
            &self,
            _messages: &[Message],
            _system_prompt: &str,
            _settings: &GenerationSettings,
            sink: &dyn TokenSink,
        ) -> Result<String, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let response = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            let chars: Vec<char> = response.chars().collect();
            for chunk in chars.chunks(7) {
                let piece: String = chunk.iter().collect();
                if !sink.on_token(&piece) {
                    break;
                }
            }
            Ok(response)
        }
        fn stop(&self) {}
    }

    fn registry_with(name: &str, reply: &str, counter: Arc<AtomicUsize>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        let reply = reply.to_string();
        registry
            .register(Box::new(FnTool::new(
                ToolDefinition {
                    name: name.to_string(),
                    description: "test tool".to_string(),
                    params: vec![ParamSchema::string("q", "query")],
                },
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    elio_tools::ToolOutput::ok(reply.clone())
                },
            )))
            .unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn simple_text_response() {
        let backend = ScriptedBackend::new(&["Hello! How can I help you?"]);
        let mut agent = Agent::new(
            backend.clone(),
            Arc::new(ToolRegistry::new()),
            AgentConfig::default(),
        );

        let result = agent.run("Hi").await;
        assert!(result.error.is_none());
        assert_eq!(result.iterations, 1);
        assert!(result.tool_calls.is_empty());
        assert!(result.response.contains("Hello"));
        // history: user + final assistant
        assert_eq!(agent.history().len(), 2);
    }

    #[tokio::test]
    async fn tool_call_then_completion() {
        let backend = ScriptedBackend::new(&[
            "<tool_call>{\"name\":\"test_tool\",\"arguments\":{}}</tool_call>",
            "Done! The tool worked.",
        ]);
        let dispatched = Arc::new(AtomicUsize::new(0));
        let tools = registry_with("test_tool", "Tool result: success", dispatched.clone());
        let mut agent = Agent::new(backend.clone(), tools, AgentConfig::default());

        let result = agent.run("use the tool").await;
        assert!(result.error.is_none());
        assert_eq!(result.iterations, 2);
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].name, "test_tool");
        assert_eq!(dispatched.load(Ordering::SeqCst), 1);
        assert!(result.response.contains("Done"));

        // Tool result message landed in the persisted history.
        let tool_msg = agent
            .history()
            .iter()
            .find(|m| m.role == Role::Tool)
            .expect("tool message persisted");
        assert_eq!(tool_msg.tool_results[0].content, "Tool result: success");
        assert_eq!(
            tool_msg.tool_results[0].tool_call_id,
            result.tool_calls[0].id
        );
    }

    #[tokio::test]
    async fn max_iterations_is_enforced() {
        let call = "<tool_call>{\"name\":\"test_tool\",\"arguments\":{}}</tool_call>";
        let backend = ScriptedBackend::new(&[call, call, call, call]);
        let dispatched = Arc::new(AtomicUsize::new(0));
        let tools = registry_with("test_tool", "ok", dispatched.clone());
        let mut agent = Agent::new(
            backend.clone(),
            tools,
            AgentConfig {
                max_iterations: 3,
                ..AgentConfig::default()
            },
        );

        let result = agent.run("loop forever").await;
        assert_eq!(result.error, Some(AgentError::MaxIterations(3)));
        assert_eq!(result.iterations, 3);
        assert_eq!(dispatched.load(Ordering::SeqCst), 3);
        assert_eq!(backend.generate_calls(), 3);
        // Failed runs do not touch the persistent history.
        assert!(agent.history().is_empty());
    }

    #[tokio::test]
    async fn thinking_is_extracted() {
        let backend = ScriptedBackend::new(&["<think>Let me reason</think>Answer"]);
        let mut agent = Agent::new(
            backend,
            Arc::new(ToolRegistry::new()),
            AgentConfig::default(),
        );

        let result = agent.run("question").await;
        assert_eq!(result.thinking.as_deref(), Some("Let me reason"));
        assert_eq!(result.response, "Answer");
    }

    #[tokio::test]
    async fn bare_json_tool_call() {
        let backend = ScriptedBackend::new(&[
            "Sure: {\"name\":\"lookup\",\"arguments\":{\"q\":\"x\"}} done.",
            "All wrapped up.",
        ]);
        let dispatched = Arc::new(AtomicUsize::new(0));
        let tools = registry_with("lookup", "found it", dispatched.clone());
        let mut agent = Agent::new(backend, tools, AgentConfig::default());

        let result = agent.run("look something up").await;
        assert!(result.error.is_none());
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].name, "lookup");
        assert_eq!(result.tool_calls[0].arguments["q"], "x");
        assert!(result.response.contains("Sure:"));
        assert!(result.response.contains("done."));

        // The assistant message that carried the call captured the text
        // emitted before it.
        let call_msg = agent
            .history()
            .iter()
            .find(|m| !m.tool_calls.is_empty())
            .unwrap();
        assert_eq!(call_msg.content, "Sure:");
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_result_and_run_continues() {
        let backend = ScriptedBackend::new(&[
            "<tool_call>{\"name\":\"nope\",\"arguments\":{}}</tool_call>",
            "Recovered anyway.",
        ]);
        let mut agent = Agent::new(
            backend,
            Arc::new(ToolRegistry::new()),
            AgentConfig::default(),
        );

        let result = agent.run("go").await;
        assert!(result.error.is_none());
        let tool_msg = agent
            .history()
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.tool_results[0].is_error);
        assert!(tool_msg.tool_results[0].content.contains("not found"));
        assert!(result.response.contains("Recovered"));
    }

    #[tokio::test]
    async fn tool_result_is_truncated_on_code_point_boundary() {
        let long_reply = "あ".repeat(100); // 300 bytes
        let backend = ScriptedBackend::new(&[
            "<tool_call>{\"name\":\"test_tool\",\"arguments\":{}}</tool_call>",
            "done",
        ]);
        let dispatched = Arc::new(AtomicUsize::new(0));
        let tools = registry_with("test_tool", &long_reply, dispatched);
        let mut agent = Agent::new(
            backend,
            tools,
            AgentConfig {
                max_tool_result_len: 32,
                ..AgentConfig::default()
            },
        );

        let result = agent.run("go").await;
        assert!(result.error.is_none());
        let tool_msg = agent
            .history()
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        let content = &tool_msg.tool_results[0].content;
        assert!(content.len() <= 32);
        assert!(content.ends_with("..."));
        assert!(std::str::from_utf8(content.as_bytes()).is_ok());
    }

    #[tokio::test]
    async fn stop_cancels_the_run_without_touching_history() {
        let backend = ScriptedBackend::new(&["a long streaming answer that keeps going"]);
        let slot: Arc<Mutex<Option<StopHandle>>> = Arc::new(Mutex::new(None));
        let slot_for_cb = slot.clone();
        let config = AgentConfig {
            on_token: Some(Box::new(move |_| {
                if let Some(handle) = slot_for_cb.lock().unwrap().as_ref() {
                    handle.stop();
                }
            })),
            ..AgentConfig::default()
        };
        let mut agent = Agent::new(backend, Arc::new(ToolRegistry::new()), config);
        *slot.lock().unwrap() = Some(agent.stop_handle());

        let result = agent.run("stream please").await;
        assert_eq!(result.error, Some(AgentError::Cancelled));
        assert!(agent.history().is_empty());
        assert!(!agent.is_processing());
        assert_eq!(agent.current_step(), Step::None);
    }

    #[tokio::test]
    async fn step_callback_observes_generation() {
        let backend = ScriptedBackend::new(&["plain answer"]);
        let steps: Arc<Mutex<Vec<Step>>> = Arc::new(Mutex::new(Vec::new()));
        let steps_for_cb = steps.clone();
        let config = AgentConfig {
            on_step_change: Some(Box::new(move |step| {
                steps_for_cb.lock().unwrap().push(step.clone());
            })),
            ..AgentConfig::default()
        };
        let mut agent = Agent::new(backend, Arc::new(ToolRegistry::new()), config);

        agent.run("hi").await;
        let seen = steps.lock().unwrap();
        assert_eq!(seen.first(), Some(&Step::Generating));
        assert_eq!(seen.last(), Some(&Step::None));
    }
}
