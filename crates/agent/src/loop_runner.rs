//! The streaming generation loop.
//!
//! One call to [`AgentLoop::process`] runs a whole conversational turn:
//! stream a model response, reassemble or parse any tool calls, execute
//! them in order, feed the results back, and repeat until the model
//! answers in plain text or the iteration limit stops it. Partial text is
//! pushed to a [`DisplaySink`] throughout, throttled, with one forced
//! final update at the end.

use crate::display::DisplayEditor;
use crate::fragments::FragmentBuffer;
use crate::protocol::{self, ToolProtocol};
use crate::textual;
use chrono::Utc;
use ferrule_core::error::{Error, ProviderError};
use ferrule_core::event::{DomainEvent, EventBus};
use ferrule_core::message::{Conversation, Message, MessageToolCall, Role};
use ferrule_core::provider::{Provider, ProviderRequest, ToolDefinition, Usage};
use ferrule_core::tool::ToolBackend;
use ferrule_core::DisplaySink;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Appended to in-progress display text.
pub const IN_PROGRESS_MARKER: &str = " …";

/// Shown while the model reasons before emitting any answer text.
pub const THINKING_MARKER: &str = "(thinking…)";

/// What a completed turn produced.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// The final answer text, as appended to the conversation.
    pub final_text: String,

    /// Token usage summed over every model call in the turn.
    pub usage: Usage,

    /// How many model calls the turn took.
    pub iterations: u32,

    /// How many tool calls were executed.
    pub tool_calls_made: usize,
}

/// The generation loop that orchestrates model calls and tool execution.
pub struct AgentLoop {
    /// The LLM provider to use
    provider: Arc<dyn Provider>,

    /// The model to use
    model: String,

    /// Temperature setting
    temperature: f32,

    /// Default max tokens per response
    max_tokens: Option<u32>,

    /// Tool backend for declared tools and dispatch
    tools: Arc<dyn ToolBackend>,

    /// How tool calls travel between model and loop
    protocol: ToolProtocol,

    /// Maximum model calls per turn
    max_iterations: u32,

    /// Minimum interval between display updates
    display_interval: Duration,

    /// Event bus for domain events
    event_bus: Arc<EventBus>,
}

impl AgentLoop {
    /// Create a new generation loop.
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        temperature: f32,
        tools: Arc<dyn ToolBackend>,
        protocol: ToolProtocol,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature,
            max_tokens: None,
            tools,
            protocol,
            max_iterations: 10,
            display_interval: Duration::from_millis(1500),
            event_bus,
        }
    }

    /// Set the maximum number of model calls per turn (at least one).
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    /// Set the default max tokens per model response.
    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Set the minimum interval between display updates.
    pub fn with_display_interval(mut self, interval: Duration) -> Self {
        self.display_interval = interval;
        self
    }

    /// Run one conversational turn.
    ///
    /// The conversation must end with the user's message. On success the
    /// assistant's answer (and any tool traffic) has been appended and the
    /// final text delivered to the sink.
    pub async fn process(
        &self,
        conversation: &mut Conversation,
        sink: Arc<dyn DisplaySink>,
    ) -> Result<LoopOutcome, Error> {
        info!(
            conversation_id = %conversation.id,
            messages = conversation.messages.len(),
            model = %self.model,
            protocol = ?self.protocol,
            "Processing conversation turn"
        );

        let declared = self.tools.declared_tools();
        let mut editor = DisplayEditor::new(sink, self.display_interval);
        let mut state = GenerationState::default();
        let mut iteration: u32 = 0;

        let final_text = loop {
            iteration += 1;
            debug!(iteration, "Model call");

            let request = self.build_request(conversation, &declared);

            let mut rx = match self.provider.stream(request).await {
                Ok(rx) => rx,
                Err(e) => return self.abort(&mut editor, &state, String::new(), e).await,
            };

            let mut turn = TurnBuffer::default();

            while let Some(item) = rx.recv().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        turn.error = Some(e);
                        break;
                    }
                };

                if let Some(thinking) = chunk.thinking {
                    state.thinking.push_str(&thinking);
                    editor
                        .refresh(state.compose(&turn.preview(self.protocol), true))
                        .await;
                }

                if let Some(content) = chunk.content {
                    turn.text.push_str(&content);
                    editor
                        .refresh(state.compose(&turn.preview(self.protocol), true))
                        .await;

                    // A complete textual block means the rest of the stream
                    // is chatter; stop reading and execute what we have.
                    if self.protocol == ToolProtocol::Textual
                        && textual::has_complete_call(&turn.text)
                    {
                        turn.cancelled = true;
                        break;
                    }
                }

                for fragment in chunk.tool_calls {
                    turn.fragments.absorb(fragment);
                }

                if let Some(usage) = chunk.usage {
                    // Restated cumulative counters: last report wins, merged
                    // into the turn total exactly once below.
                    turn.usage = Some(usage);
                }

                if chunk.done {
                    break;
                }
            }
            drop(rx);

            if let Some(e) = turn.error.take() {
                let partial = turn.display_text(self.protocol);
                return self.abort(&mut editor, &state, partial, e).await;
            }

            if turn.cancelled {
                if let Some(end) = textual::last_complete_block_end(&turn.text) {
                    turn.text.truncate(end);
                }
            }

            if let Some(usage) = turn.usage {
                state.usage.add(&usage);
                self.event_bus.publish(DomainEvent::ResponseGenerated {
                    conversation_id: conversation.id.to_string(),
                    model: self.model.clone(),
                    tokens_used: usage.total_tokens,
                    timestamp: Utc::now(),
                });
            }

            let calls = self.extract_calls(&mut turn);
            let display_text = turn.display_text(self.protocol);

            if calls.is_empty() {
                conversation.push(Message::assistant(&display_text));
                break display_text;
            }

            if iteration >= self.max_iterations {
                // The limit counts model calls, so the calls requested by
                // this last response are not executed.
                warn!(
                    conversation_id = %conversation.id,
                    iterations = iteration,
                    "Tool call limit reached, stopping"
                );
                let placeholder = placeholder_answer(&display_text);
                conversation.push(Message::assistant(&placeholder));
                break placeholder;
            }

            self.append_assistant(conversation, &display_text, &calls);
            self.execute_calls(conversation, &calls, &mut state, &mut editor)
                .await;
        };

        let rendered = state.compose_final(&final_text, iteration);
        editor.finalize(rendered).await;

        info!(
            conversation_id = %conversation.id,
            iterations = iteration,
            tool_calls = state.tool_calls_made,
            tokens = state.usage.total_tokens,
            "Conversation turn complete"
        );

        Ok(LoopOutcome {
            final_text,
            usage: state.usage,
            iterations: iteration,
            tool_calls_made: state.tool_calls_made,
        })
    }

    /// Build the provider request for the next model call.
    ///
    /// Native protocol passes declared tools through the API. Textual
    /// protocol injects the tool instruction as a system message into the
    /// outgoing copy only; the stored conversation stays clean.
    fn build_request(
        &self,
        conversation: &Conversation,
        declared: &[ToolDefinition],
    ) -> ProviderRequest {
        let mut messages = conversation.messages.clone();
        let mut tools = Vec::new();

        match self.protocol {
            ToolProtocol::Native => tools = declared.to_vec(),
            ToolProtocol::Textual => {
                if !declared.is_empty() {
                    let insert_at = messages
                        .iter()
                        .take_while(|m| m.role == Role::System)
                        .count();
                    messages.insert(
                        insert_at,
                        Message::system(protocol::tool_instruction(declared)),
                    );
                }
            }
        }

        ProviderRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools,
            stream: true,
            stop: vec![],
        }
    }

    /// Pull the tool calls out of a finished stream.
    fn extract_calls(&self, turn: &mut TurnBuffer) -> Vec<MessageToolCall> {
        match self.protocol {
            ToolProtocol::Native => std::mem::take(&mut turn.fragments).finish(),
            ToolProtocol::Textual => textual::find_complete_calls(&turn.text)
                .into_iter()
                .map(|call| MessageToolCall {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: call.name,
                    arguments: call.arguments.to_string(),
                })
                .collect(),
        }
    }

    /// Record the assistant's tool-requesting message.
    fn append_assistant(
        &self,
        conversation: &mut Conversation,
        text: &str,
        calls: &[MessageToolCall],
    ) {
        let mut message = Message::assistant(text);
        if self.protocol == ToolProtocol::Native {
            message.tool_calls = calls.to_vec();
        }
        conversation.push(message);
    }

    /// Execute tool calls one at a time, in order, appending one result
    /// message per call. Failures become result text, never errors.
    async fn execute_calls(
        &self,
        conversation: &mut Conversation,
        calls: &[MessageToolCall],
        state: &mut GenerationState,
        editor: &mut DisplayEditor,
    ) {
        for call in calls {
            let arguments: serde_json::Value =
                serde_json::from_str(&call.arguments).unwrap_or_else(|_| serde_json::json!({}));

            debug!(tool = %call.name, "Executing tool call");
            let start = std::time::Instant::now();
            let result = self.tools.call_tool(&call.name, arguments).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            let output = match result {
                Ok(output) => {
                    self.event_bus.publish(DomainEvent::ToolExecuted {
                        tool_name: call.name.clone(),
                        success: true,
                        duration_ms,
                        timestamp: Utc::now(),
                    });
                    output
                }
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "Tool execution failed");
                    self.event_bus.publish(DomainEvent::ToolExecuted {
                        tool_name: call.name.clone(),
                        success: false,
                        duration_ms,
                        timestamp: Utc::now(),
                    });
                    format!("Error: {e}")
                }
            };

            match self.protocol {
                ToolProtocol::Native => {
                    conversation.push(Message::tool_result(&call.id, &output));
                }
                ToolProtocol::Textual => {
                    // Textual providers have no tool role; feed the result
                    // back as user-visible context instead.
                    conversation.push(Message::user(format!(
                        "Tool '{}' returned:\n{}",
                        call.name, output
                    )));
                }
            }

            state.tool_calls_made += 1;
            state.notes.push(format!("Called tool: {}", call.name));
            editor.refresh(state.compose("", true)).await;
        }
    }

    /// A model call failed mid-turn. Show what we have plus a diagnostic,
    /// leave the conversation untouched, and surface the error. No retry.
    async fn abort(
        &self,
        editor: &mut DisplayEditor,
        state: &GenerationState,
        partial: String,
        error: ProviderError,
    ) -> Result<LoopOutcome, Error> {
        warn!(error = %error, "Model call failed, aborting turn");
        self.event_bus.publish(DomainEvent::ErrorOccurred {
            context: "generation".into(),
            error_message: error.to_string(),
            timestamp: Utc::now(),
        });

        let mut text = state.compose(&partial, false);
        text.push_str(&format!("\n\n[generation stopped: {error}]"));
        editor.finalize(text).await;

        Err(Error::Provider(error))
    }
}

/// Display state carried across the iterations of one turn.
#[derive(Default)]
struct GenerationState {
    /// One line per executed tool call, shown above the answer.
    notes: Vec<String>,
    /// Accumulated reasoning text. Displayed only as a marker.
    thinking: String,
    /// Usage summed across model calls.
    usage: Usage,
    tool_calls_made: usize,
}

impl GenerationState {
    /// Render a display frame around the current answer text.
    fn compose(&self, current: &str, in_progress: bool) -> String {
        let mut out = String::new();
        for note in &self.notes {
            out.push_str(note);
            out.push('\n');
        }
        if current.is_empty() && !self.thinking.is_empty() && in_progress {
            out.push_str(THINKING_MARKER);
        } else {
            out.push_str(current);
        }
        if in_progress {
            out.push_str(IN_PROGRESS_MARKER);
        }
        out
    }

    /// Render the final frame: notes, answer, usage line.
    fn compose_final(&self, final_text: &str, iterations: u32) -> String {
        let mut out = String::new();
        for note in &self.notes {
            out.push_str(note);
            out.push('\n');
        }
        out.push_str(final_text);
        let plural = if iterations == 1 { "" } else { "s" };
        out.push_str(&format!(
            "\n\n[{} tokens: {} prompt, {} completion; {} iteration{}]",
            self.usage.total_tokens,
            self.usage.prompt_tokens,
            self.usage.completion_tokens,
            iterations,
            plural,
        ));
        out
    }
}

/// Everything one model call streamed in.
#[derive(Default)]
struct TurnBuffer {
    text: String,
    fragments: FragmentBuffer,
    usage: Option<Usage>,
    cancelled: bool,
    error: Option<ProviderError>,
}

impl TurnBuffer {
    /// Mid-stream display text. Textual protocol strips complete blocks
    /// and holds back a partially streamed delimiter.
    fn preview(&self, protocol: ToolProtocol) -> String {
        match protocol {
            ToolProtocol::Native => self.text.clone(),
            ToolProtocol::Textual => {
                let stripped = textual::strip_tool_markup(&self.text);
                textual::hold_back_partial_opener(&stripped).to_string()
            }
        }
    }

    /// Post-stream display text, fed into the conversation.
    fn display_text(&self, protocol: ToolProtocol) -> String {
        match protocol {
            ToolProtocol::Native => self.text.clone(),
            ToolProtocol::Textual => textual::strip_tool_markup(&self.text),
        }
    }
}

/// The answer recorded when the iteration limit cuts a turn short.
fn placeholder_answer(accumulated: &str) -> String {
    if accumulated.trim().is_empty() {
        "I reached the tool call limit before finishing an answer. \
         Please try again or raise the limit."
            .into()
    } else {
        format!("{accumulated}\n\n(Stopped after reaching the tool call limit.)")
    }
}
