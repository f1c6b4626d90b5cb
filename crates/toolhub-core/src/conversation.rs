use crate::types::{ContentBlock, TurnEntry};

/// Ordered turn history for one conversation.
///
/// Entries are only ever appended; a finished query replaces the whole state
/// with its working copy via [`ConversationState::replace`].
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    entries: Vec<TurnEntry>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TurnEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TurnEntry] {
        &self.entries
    }

    /// A copy to mutate during a query without touching the committed state.
    pub fn working_copy(&self) -> Self {
        self.clone()
    }

    pub fn replace(&mut self, other: ConversationState) {
        self.entries = other.entries;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether every tool use is answered by the entry directly after it.
    pub fn is_well_paired(&self) -> bool {
        self.entries.iter().enumerate().all(|(i, entry)| {
            let TurnEntry::Assistant { blocks } = entry else {
                return true;
            };
            let ids: Vec<&str> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                    ContentBlock::Text { .. } => None,
                })
                .collect();
            if ids.is_empty() {
                return true;
            }
            match self.entries.get(i + 1) {
                Some(TurnEntry::ToolResults { results }) => {
                    results.iter().map(|r| r.id.as_str()).eq(ids.into_iter())
                }
                _ => false,
            }
        })
    }
}
