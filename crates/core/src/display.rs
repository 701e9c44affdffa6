//! DisplaySink trait: the surface that renders one evolving message.
//!
//! While a reply streams, the generation loop pushes progressive snapshots of
//! the text so far; when the reply is committed it pushes exactly one final
//! update. Surfaces rate limit edits, so callers throttle; the sink itself
//! stays dumb.

use crate::error::DisplayError;
use async_trait::async_trait;

/// The core DisplaySink trait.
///
/// Implementations render to a terminal, a chat message being edited in
/// place, or nothing at all.
#[async_trait]
pub trait DisplaySink: Send + Sync {
    /// Replace the evolving message with `text`.
    async fn update(&self, text: &str) -> std::result::Result<(), DisplayError>;

    /// Commit the final text. Defaults to a plain update.
    async fn finalize(&self, text: &str) -> std::result::Result<(), DisplayError> {
        self.update(text).await
    }
}

/// A sink that drops every update. Used when no surface is attached.
pub struct NullSink;

#[async_trait]
impl DisplaySink for NullSink {
    async fn update(&self, _text: &str) -> std::result::Result<(), DisplayError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        updates: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DisplaySink for RecordingSink {
        async fn update(&self, text: &str) -> std::result::Result<(), DisplayError> {
            self.updates.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn null_sink_accepts_everything() {
        let sink = NullSink;
        sink.update("partial").await.unwrap();
        sink.finalize("final").await.unwrap();
    }

    #[tokio::test]
    async fn finalize_defaults_to_update() {
        let sink = RecordingSink { updates: Mutex::new(Vec::new()) };
        sink.update("one").await.unwrap();
        sink.finalize("two").await.unwrap();
        assert_eq!(*sink.updates.lock().unwrap(), vec!["one", "two"]);
    }
}
