//! # Ferrule Core
//!
//! Domain types, traits, and error definitions for the Ferrule agent core.
//! This crate carries no transport or UI dependencies; it defines the domain
//! model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem is defined as a trait here. Implementations live in their
//! respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod display;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use display::{DisplaySink, NullSink};
pub use error::{Error, Result};
pub use event::{DomainEvent, EventBus};
pub use message::{Conversation, ConversationId, Message, MessageToolCall, Role};
pub use provider::{
    Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolCallFragment, ToolDefinition,
    Usage,
};
pub use tool::ToolBackend;
