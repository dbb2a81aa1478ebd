use std::collections::HashSet;

use log::debug;

use crate::models::Message;

/// Canonical ordered view of one conversation, reconciling the backlog fetch
/// with the live stream. The two race: live arrivals are buffered until the
/// backlog lands, then spliced after it in their original arrival order.
/// Append-only; entries already in the view are never reordered.
#[derive(Default)]
pub struct MessageMerger {
    view: Vec<Message>,
    pending: Vec<Message>,
    history_resolved: bool,
    seen_ids: HashSet<String>,
}

impl MessageMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self) -> &[Message] {
        &self.view
    }

    pub fn history_resolved(&self) -> bool {
        self.history_resolved
    }

    /// Seed the view with the backlog, then splice any buffered live arrivals
    /// after it. Live copies of backlog messages are dropped by server id.
    pub fn resolve_history(&mut self, backlog: Vec<Message>) {
        debug_assert!(!self.history_resolved, "history resolves at most once");
        for message in backlog {
            if let Some(id) = &message.id {
                if !self.seen_ids.insert(id.clone()) {
                    continue;
                }
            }
            self.view.push(message);
        }
        self.history_resolved = true;
        let buffered = std::mem::take(&mut self.pending);
        debug!("[MERGE] History resolved; splicing {} buffered live messages", buffered.len());
        for message in buffered {
            self.append(message);
        }
    }

    /// Backlog fetch failed: fall back to live-only. Buffered arrivals become
    /// the view.
    pub fn history_failed(&mut self) {
        debug!("[MERGE] History fetch failed; falling back to live-only view");
        self.resolve_history(Vec::new());
    }

    /// Feed one message from the live stream (or an optimistic local echo).
    /// Buffered until the backlog resolves; appended with dedup afterwards.
    pub fn push_live(&mut self, message: Message) {
        if self.history_resolved {
            self.append(message);
        } else {
            self.pending.push(message);
        }
    }

    fn append(&mut self, message: Message) {
        // Server echo of an optimistic send: replace the local entry in place
        // instead of appending a duplicate.
        if let Some(correlation_id) = &message.correlation_id {
            if let Some(local) = self.view.iter_mut().find(|m| {
                m.id.is_none() && m.correlation_id.as_deref() == Some(correlation_id.as_str())
            }) {
                if let Some(id) = &message.id {
                    self.seen_ids.insert(id.clone());
                }
                *local = message;
                return;
            }
        }

        match &message.id {
            Some(id) => {
                // Same message delivered via both backlog and live stream.
                if !self.seen_ids.insert(id.clone()) {
                    return;
                }
            }
            None => {
                // Id-less entries only collide with other id-less entries:
                // tie-break on (sender, timestamp, content).
                let duplicate = self.view.iter().any(|m| {
                    m.id.is_none()
                        && m.sender_id == message.sender_id
                        && m.created_at == message.created_at
                        && m.content_key() == message.content_key()
                });
                if duplicate {
                    return;
                }
            }
        }
        self.view.push(message);
    }
}
