//! The streaming generation loop — the heart of Ferrule.
//!
//! One turn follows a **stream → dispatch → observe** cycle:
//!
//! 1. **Stream** a model response, pushing throttled partial text to the
//!    display sink
//! 2. **Collect tool calls** — native fragments reassembled by slot, or
//!    textual `<<<tool_call>>>` blocks parsed out of the prose
//! 3. **If tool calls**: execute them in order, append results, loop back
//!    to step 1
//! 4. **If text only**: commit the answer and finish
//!
//! The loop continues until the model answers without tool calls or the
//! iteration limit is reached.

pub mod display;
pub mod fragments;
pub mod loop_runner;
pub mod protocol;
pub mod textual;

pub use display::DisplayEditor;
pub use fragments::FragmentBuffer;
pub use loop_runner::{AgentLoop, LoopOutcome, IN_PROGRESS_MARKER, THINKING_MARKER};
pub use protocol::ToolProtocol;
pub use textual::ParsedToolCall;
