//! Rolling conversation window for chat-style inference.
//!
//! [`ConversationWindow`] keeps the last *N* messages (participant lines and
//! the bridge's own replies) that are sent with every request.  The window
//! is cleared automatically when nothing was said for longer than
//! `silence_reset`, which signals a new conversation.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowMessage {
    pub role: Role,
    pub content: String,
}

pub struct ConversationWindow {
    messages: VecDeque<WindowMessage>,
    max_messages: usize,
    last_activity: Instant,
    silence_reset: Duration,
}

impl ConversationWindow {
    pub fn new(max_messages: usize, silence_reset: Duration) -> Self {
        Self {
            messages: VecDeque::with_capacity(max_messages + 1),
            max_messages: max_messages.max(1),
            last_activity: Instant::now(),
            silence_reset,
        }
    }

    /// Append a message, clearing the window first after a long silence and
    /// dropping the oldest entries beyond `max_messages`.
    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        if self.last_activity.elapsed() > self.silence_reset {
            self.messages.clear();
        }

        self.messages.push_back(WindowMessage {
            role,
            content: content.into(),
        });

        while self.messages.len() > self.max_messages {
            self.messages.pop_front();
        }

        self.last_activity = Instant::now();
    }

    pub fn reset(&mut self) {
        self.messages.clear();
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<WindowMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&WindowMessage> {
        self.messages.back()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
