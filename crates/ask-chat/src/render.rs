//! Markdown rendering of a conversation

use ask_ai::Role;

use crate::conversation::{Conversation, Message};

const EMPTY_RESPONSE: &str = "_(Empty response received)_";
const THINKING_INDICATOR: &str = "*Assistant is thinking...*";
const SEPARATOR: &str = "---";

/// Rendering options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Name shown in assistant headings
    pub model_name: String,
}

impl RenderOptions {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
        }
    }
}

/// Render the conversation as markdown. Never fails, whatever the state.
pub fn render(conversation: &Conversation, options: &RenderOptions) -> String {
    let decorated = conversation.last_completed_assistant();

    conversation
        .messages()
        .iter()
        .enumerate()
        .filter_map(|(index, message)| match message.role {
            Role::System => None,
            Role::User => Some(format!(
                "### User\n\n{}\n\n{}",
                message.content.trim(),
                SEPARATOR
            )),
            Role::Error => Some(format!(
                "### ⚠️ Error\n\n{}\n\n{}",
                message.content.trim(),
                SEPARATOR
            )),
            Role::Assistant => Some(render_assistant(
                conversation,
                options,
                index,
                message,
                decorated == Some(index),
            )),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_assistant(
    conversation: &Conversation,
    options: &RenderOptions,
    index: usize,
    message: &Message,
    with_grounding: bool,
) -> String {
    let in_progress = conversation.in_progress().map(|id| id.index()) == Some(index);

    let mut blocks = vec![format!(
        "### {} (Token Tally: {})",
        options.model_name,
        conversation.token_tally()
    )];

    if let Some(trace) = conversation
        .thinking_trace(index)
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        blocks.push(format!("> {}", trace.replace('\n', "\n> ")));
    }

    if in_progress {
        if !message.content.is_empty() {
            blocks.push(message.content.clone());
        }
        blocks.push(THINKING_INDICATOR.to_string());
    } else {
        let content = message.content.trim();
        blocks.push(if content.is_empty() {
            EMPTY_RESPONSE.to_string()
        } else {
            content.to_string()
        });
    }

    if with_grounding {
        blocks.extend(grounding_lines(conversation));
    }

    blocks.push(SEPARATOR.to_string());
    blocks.join("\n\n")
}

fn grounding_lines(conversation: &Conversation) -> Vec<String> {
    let mut lines = Vec::new();

    let queries = conversation.search_queries();
    if !queries.is_empty() {
        let quoted: Vec<String> = queries.iter().map(|q| format!("\"{}\"", q)).collect();
        lines.push(format!("> **Searched for:** {}", quoted.join(", ")));
    }

    let sources: Vec<String> = conversation
        .grounding_sources()
        .iter()
        .filter_map(|(index, chunk)| {
            let web = chunk.web.as_ref()?;
            let title = match web.title.trim() {
                "" => format!("Source {}", index + 1),
                title => title.to_string(),
            };
            Some(format!("[{}]({})", title, web.uri))
        })
        .collect();
    if !sources.is_empty() {
        lines.push(format!("> **Sources:** {}", sources.join(", ")));
    }

    lines
}
