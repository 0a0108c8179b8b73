//! Context window assembly.
//!
//! Turns a session's stored history plus the new prompt into the text sent to
//! the backend, keeping the newest messages that fit the token budget.

use serde::{Deserialize, Serialize};
use sluice_abstraction::ChatMessage;
use sluice_models::count_tokens;
use tracing::debug;

/// System prompt used when none is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Think carefully and accurately before responding. Always respond in clear, correct English. Be precise and thoughtful in your answers.";

/// Line that cues the backend to answer.
const ASSISTANT_CUE: &str = "Assistant:";

/// Context builder configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Token budget for the whole rendered context (default: 4096).
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u32,

    /// Most recent history messages considered (default: 50).
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,

    /// Opening system line. Empty disables it.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_max_context_tokens() -> u32 {
    4096
}

fn default_max_history_messages() -> usize {
    50
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            max_history_messages: default_max_history_messages(),
            system_prompt: default_system_prompt(),
        }
    }
}

/// One line of the context window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextMessage {
    /// "system", "user" or "assistant".
    pub role: String,
    /// Message text.
    pub content: String,
    /// Token estimate of the rendered line.
    pub approx_tokens: u32,
}

impl ContextMessage {
    fn new(role: &str, content: &str) -> Self {
        let approx_tokens = count_tokens(&render_line(role, content));
        Self { role: role.to_string(), content: content.to_string(), approx_tokens }
    }

    fn render(&self) -> String {
        render_line(&self.role, &self.content)
    }
}

fn label(role: &str) -> &'static str {
    match role {
        "system" => "System",
        "assistant" => "Assistant",
        _ => "User",
    }
}

fn render_line(role: &str, content: &str) -> String {
    format!("{}: {}", label(role), content)
}

/// The bounded context sent to the backend.
///
/// `messages` holds the kept history in chronological order followed by the
/// current prompt, which is always present. `total_tokens` covers the system
/// line, every message and the answer cue, and stays within the budget
/// whenever the prompt itself fits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextWindow {
    /// Opening system line, if configured.
    pub system: Option<ContextMessage>,
    /// Kept history followed by the current prompt.
    pub messages: Vec<ContextMessage>,
    /// Token estimate of [`render`](Self::render).
    pub total_tokens: u32,
    /// History messages left out.
    pub dropped_messages: usize,
}

impl ContextWindow {
    /// The current prompt.
    pub fn prompt(&self) -> &str {
        self.messages.last().map_or("", |m| m.content.as_str())
    }

    /// Kept history, oldest first.
    pub fn history(&self) -> &[ContextMessage] {
        &self.messages[..self.messages.len().saturating_sub(1)]
    }

    /// Renders the window as `Role: content` lines ending with the answer cue.
    pub fn render(&self) -> String {
        let mut lines: Vec<String> = Vec::with_capacity(self.messages.len() + 2);
        if let Some(system) = &self.system {
            lines.push(system.render());
        }
        lines.extend(self.messages.iter().map(ContextMessage::render));
        lines.push(ASSISTANT_CUE.to_string());
        lines.join("\n")
    }
}

/// Builds context windows under a fixed budget.
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    config: ContextConfig,
}

impl ContextBuilder {
    /// Creates a builder.
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Configuration in use.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Assembles the context for `prompt` given the session `history` (oldest first).
    ///
    /// Only the last `max_history_messages` messages are considered. Walking
    /// from the newest, messages are kept until the next one would push the
    /// total over `max_context_tokens`. System messages in history are
    /// skipped. A prompt that alone exceeds the budget gets no history.
    pub fn build(&self, history: &[ChatMessage], prompt: &str) -> ContextWindow {
        let system = (!self.config.system_prompt.trim().is_empty())
            .then(|| ContextMessage::new("system", &self.config.system_prompt));
        let current = ContextMessage::new("user", prompt);

        let fixed = system.as_ref().map_or(0, |s| s.approx_tokens)
            + current.approx_tokens
            + count_tokens(ASSISTANT_CUE);
        let mut remaining = self.config.max_context_tokens.saturating_sub(fixed);

        let window_start = history.len().saturating_sub(self.config.max_history_messages);
        let candidates: Vec<&ChatMessage> = history[window_start..]
            .iter()
            .filter(|m| m.role == "user" || m.role == "assistant")
            .collect();

        let mut kept = Vec::new();
        if fixed <= self.config.max_context_tokens {
            for message in candidates.iter().rev() {
                let line = ContextMessage::new(&message.role, &message.content);
                if line.approx_tokens > remaining {
                    break;
                }
                remaining -= line.approx_tokens;
                kept.push(line);
            }
        }
        kept.reverse();

        let dropped_messages = history.len() - kept.len();
        let total_tokens = fixed + kept.iter().map(|m| m.approx_tokens).sum::<u32>();
        kept.push(current);

        debug!(
            history_len = history.len(),
            kept = kept.len() - 1,
            dropped_messages,
            total_tokens,
            budget = self.config.max_context_tokens,
            "Built context window"
        );

        ContextWindow { system, messages: kept, total_tokens, dropped_messages }
    }
}
