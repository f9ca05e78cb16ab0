//! Conversation Buffer
//!
//! Ordered conversation history for one task cycle: system prompt, task input,
//! assistant responses, tool results and guidance messages. Tool results wait
//! in a pending list until the next context preparation, where they are
//! compressed separately from the settled history and then committed.

use sdk::{Message, MessageRole, ModelResponse, ToolOutcome};

use crate::compression::{total_tokens, CompressibleMessage};

#[derive(Debug, Clone, Default)]
pub struct ConversationBuffer {
    messages: Vec<CompressibleMessage>,
    pending: Vec<CompressibleMessage>,
}

impl ConversationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the system prompt; it is never compressed
    pub fn push_system(&mut self, content: &str) -> String {
        self.push(CompressibleMessage::new(MessageRole::System, content).preserved())
    }

    pub fn push_user(&mut self, content: &str) -> String {
        self.push(CompressibleMessage::new(MessageRole::User, content))
    }

    /// Add the task input; it is never compressed
    pub fn push_task(&mut self, content: &str) -> String {
        self.push(CompressibleMessage::new(MessageRole::User, content).preserved())
    }

    /// Add a model response.
    ///
    /// A rejected response is kept and flagged as a failed attempt. An accepted
    /// response without tool calls supersedes earlier final answers.
    pub fn push_assistant(&mut self, response: &ModelResponse, failed_attempt: bool) -> String {
        let mut message = CompressibleMessage::new(MessageRole::Assistant, render_response(response));
        message.metadata.failed_attempt = failed_attempt;
        message.metadata.has_tool_calls = response.has_tool_calls();

        if !failed_attempt && !response.has_tool_calls() {
            for earlier in self.messages.iter_mut().filter(|m| {
                m.role == MessageRole::Assistant
                    && !m.metadata.has_tool_calls
                    && !m.metadata.failed_attempt
            }) {
                earlier.metadata.superseded = true;
            }
        }

        self.push(message)
    }

    /// Queue a tool result until the next context preparation
    pub fn push_tool_result(&mut self, call_id: &str, tool_name: &str, outcome: &ToolOutcome) -> String {
        let status = if outcome.success { "succeeded" } else { "failed" };
        let content = format!("[{} {}]\n{}", tool_name, status, outcome.output);
        let mut message = CompressibleMessage::new(MessageRole::Tool, content);
        message.metadata.tool_call_id = Some(call_id.to_string());
        let id = message.id.clone();
        self.pending.push(message);
        id
    }

    fn push(&mut self, message: CompressibleMessage) -> String {
        let id = message.id.clone();
        self.messages.push(message);
        id
    }

    /// One turn has passed
    pub fn advance_turn(&mut self) {
        for message in self.messages.iter_mut().chain(self.pending.iter_mut()) {
            message.age = message.age.saturating_add(1);
        }
    }

    pub fn messages(&self) -> &[CompressibleMessage] {
        &self.messages
    }

    pub fn pending(&self) -> &[CompressibleMessage] {
        &self.pending
    }

    /// Take the pending tool results out of the buffer
    pub fn take_pending(&mut self) -> Vec<CompressibleMessage> {
        std::mem::take(&mut self.pending)
    }

    /// Replace the settled history and append the (possibly compressed) pending results
    pub fn commit(&mut self, messages: Vec<CompressibleMessage>, pending: Vec<CompressibleMessage>) {
        self.messages = messages;
        self.messages.extend(pending);
    }

    /// Estimated tokens of settled and pending messages
    pub fn token_count(&self) -> usize {
        total_tokens(&self.messages) + total_tokens(&self.pending)
    }

    /// Conversation as sent to the model
    pub fn to_messages(&self) -> Vec<Message> {
        self.messages
            .iter()
            .chain(self.pending.iter())
            .map(CompressibleMessage::to_message)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Text of a response plus one line per requested tool call
fn render_response(response: &ModelResponse) -> String {
    let mut content = response.text.trim().to_string();
    for call in &response.tool_calls {
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(&format!("[tool call {}: {} {}]", call.id, call.name, call.arguments));
    }
    content
}
