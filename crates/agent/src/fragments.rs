//! Native tool call reassembly.
//!
//! Providers stream each tool call as fragments tagged with a slot index.
//! The id usually arrives once, the name in one piece, and the argument
//! JSON split across many deltas. `FragmentBuffer` absorbs them all and
//! yields complete calls ordered by slot.

use ferrule_core::message::MessageToolCall;
use ferrule_core::provider::ToolCallFragment;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct Slot {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates tool call fragments across a streamed response.
#[derive(Debug, Default)]
pub struct FragmentBuffer {
    slots: BTreeMap<u32, Slot>,
}

impl FragmentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one fragment into its slot. Ids replace, name and argument
    /// pieces concatenate in arrival order.
    pub fn absorb(&mut self, fragment: ToolCallFragment) {
        let slot = self.slots.entry(fragment.index).or_default();
        if let Some(id) = fragment.id {
            slot.id = id;
        }
        if let Some(name) = fragment.name {
            slot.name.push_str(&name);
        }
        if let Some(arguments) = fragment.arguments {
            slot.arguments.push_str(&arguments);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Drain the buffer into complete calls, ordered by slot index.
    /// Slots the provider never gave an id get a synthetic one.
    pub fn finish(self) -> Vec<MessageToolCall> {
        self.slots
            .into_iter()
            .map(|(index, slot)| MessageToolCall {
                id: if slot.id.is_empty() {
                    format!("call_{index}")
                } else {
                    slot.id
                },
                name: slot.name,
                arguments: slot.arguments,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> ToolCallFragment {
        ToolCallFragment {
            index,
            id: id.map(String::from),
            name: name.map(String::from),
            arguments: arguments.map(String::from),
        }
    }

    #[test]
    fn single_call_reassembled_from_pieces() {
        let mut buffer = FragmentBuffer::new();
        buffer.absorb(fragment(0, Some("call_9"), Some("calculator"), Some("")));
        buffer.absorb(fragment(0, None, None, Some("{\"expr\"")));
        buffer.absorb(fragment(0, None, None, Some(": \"2+2\"}")));

        let calls = buffer.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_9");
        assert_eq!(calls[0].name, "calculator");
        assert_eq!(calls[0].arguments, "{\"expr\": \"2+2\"}");
    }

    #[test]
    fn interleaved_slots_finish_in_index_order() {
        let mut buffer = FragmentBuffer::new();
        buffer.absorb(fragment(1, Some("call_b"), Some("beta"), Some("{\"n\"")));
        buffer.absorb(fragment(0, Some("call_a"), Some("alpha"), Some("{}")));
        buffer.absorb(fragment(1, None, None, Some(": 2}")));

        let calls = buffer.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "alpha");
        assert_eq!(calls[1].name, "beta");
        assert_eq!(calls[1].arguments, "{\"n\": 2}");
    }

    #[test]
    fn missing_id_gets_placeholder() {
        let mut buffer = FragmentBuffer::new();
        buffer.absorb(fragment(0, None, Some("probe"), Some("{}")));
        let calls = buffer.finish();
        assert_eq!(calls[0].id, "call_0");
    }

    #[test]
    fn name_pieces_concatenate() {
        let mut buffer = FragmentBuffer::new();
        buffer.absorb(fragment(0, Some("c1"), Some("fs_"), None));
        buffer.absorb(fragment(0, None, Some("read"), Some("{}")));
        let calls = buffer.finish();
        assert_eq!(calls[0].name, "fs_read");
    }

    #[test]
    fn empty_buffer_yields_nothing() {
        let buffer = FragmentBuffer::new();
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
        assert!(buffer.finish().is_empty());
    }
}
