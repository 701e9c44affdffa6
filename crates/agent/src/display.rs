//! Throttled streaming display.
//!
//! Streamed deltas arrive far faster than any UI wants repaints. The
//! editor forwards an update only when the text changed and the previous
//! edit is old enough, except for the final text, which always lands.

use ferrule_core::DisplaySink;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Rate-limited writer over a [`DisplaySink`].
pub struct DisplayEditor {
    sink: Arc<dyn DisplaySink>,
    min_interval: Duration,
    last_edit: Option<Instant>,
    last_text: String,
}

impl DisplayEditor {
    pub fn new(sink: Arc<dyn DisplaySink>, min_interval: Duration) -> Self {
        Self {
            sink,
            min_interval,
            last_edit: None,
            last_text: String::new(),
        }
    }

    /// Offer a new rendition of the in-progress text. Skipped when nothing
    /// changed or the previous edit is too recent.
    pub async fn refresh(&mut self, text: String) {
        if text == self.last_text {
            return;
        }
        if let Some(last) = self.last_edit {
            if last.elapsed() < self.min_interval {
                return;
            }
        }
        self.push(text).await;
    }

    /// Deliver the final text unconditionally.
    pub async fn finalize(&mut self, text: String) {
        if let Err(e) = self.sink.finalize(&text).await {
            warn!(error = %e, "Display finalize failed");
        }
        self.last_edit = Some(Instant::now());
        self.last_text = text;
    }

    async fn push(&mut self, text: String) {
        if let Err(e) = self.sink.update(&text).await {
            warn!(error = %e, "Display update failed");
        }
        self.last_edit = Some(Instant::now());
        self.last_text = text;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrule_core::error::DisplayError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        updates: Mutex<Vec<String>>,
        finals: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn updates(&self) -> Vec<String> {
            self.updates.lock().unwrap().clone()
        }

        fn finals(&self) -> Vec<String> {
            self.finals.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl DisplaySink for RecordingSink {
        async fn update(&self, text: &str) -> Result<(), DisplayError> {
            self.updates.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn finalize(&self, text: &str) -> Result<(), DisplayError> {
            self.finals.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct BrokenSink;

    #[async_trait::async_trait]
    impl DisplaySink for BrokenSink {
        async fn update(&self, _text: &str) -> Result<(), DisplayError> {
            Err(DisplayError::UpdateFailed("disconnected".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_update_goes_through_immediately() {
        let sink = Arc::new(RecordingSink::default());
        let mut editor = DisplayEditor::new(sink.clone(), Duration::from_millis(1500));

        editor.refresh("Hello".into()).await;
        assert_eq!(sink.updates(), vec!["Hello"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_updates_are_throttled() {
        let sink = Arc::new(RecordingSink::default());
        let mut editor = DisplayEditor::new(sink.clone(), Duration::from_millis(1500));

        editor.refresh("one".into()).await;
        editor.refresh("one two".into()).await;

        tokio::time::advance(Duration::from_millis(1600)).await;
        editor.refresh("one two three".into()).await;

        assert_eq!(sink.updates(), vec!["one", "one two three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn identical_text_is_skipped() {
        let sink = Arc::new(RecordingSink::default());
        let mut editor = DisplayEditor::new(sink.clone(), Duration::from_millis(100));

        editor.refresh("same".into()).await;
        tokio::time::advance(Duration::from_millis(500)).await;
        editor.refresh("same".into()).await;

        assert_eq!(sink.updates().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_lands_inside_the_throttle_window() {
        let sink = Arc::new(RecordingSink::default());
        let mut editor = DisplayEditor::new(sink.clone(), Duration::from_millis(1500));

        editor.refresh("partial".into()).await;
        editor.finalize("the whole answer".into()).await;

        assert_eq!(sink.updates(), vec!["partial"]);
        assert_eq!(sink.finals(), vec!["the whole answer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_disables_throttling() {
        let sink = Arc::new(RecordingSink::default());
        let mut editor = DisplayEditor::new(sink.clone(), Duration::ZERO);

        editor.refresh("a".into()).await;
        editor.refresh("ab".into()).await;
        editor.refresh("abc".into()).await;

        assert_eq!(sink.updates(), vec!["a", "ab", "abc"]);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_sink_is_not_fatal() {
        let mut editor = DisplayEditor::new(Arc::new(BrokenSink), Duration::ZERO);
        editor.refresh("a".into()).await;
        editor.refresh("ab".into()).await;
        editor.finalize("done".into()).await;
    }
}
