//! Slash commands for interactive mode

/// Result of executing a slash command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Start a fresh conversation
    NewConversation,
    /// List the provider's models
    ListModels,
    /// List models of every vendor with a configured key
    ListAllModels,
    /// Switch to another model of the same provider
    SwitchModel(String),
    /// Print the latest answer
    LastResponse,
    /// Print the whole conversation as markdown
    Show,
    /// Show a message to the user (not sent to the provider)
    Message(String),
    /// Exit the application
    Exit,
    /// Unknown command
    Unknown(String),
}

/// Parse a slash command; `None` when the input is a message
pub fn execute_command(input: &str) -> Option<CommandResult> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let (command, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();

    Some(match command.to_lowercase().as_str() {
        "help" | "h" | "?" => CommandResult::Message(help_message()),
        "new" | "n" | "clear" => CommandResult::NewConversation,
        "models" if args == "all" => CommandResult::ListAllModels,
        "models" => CommandResult::ListModels,
        "model" | "m" if args.is_empty() => CommandResult::ListModels,
        "model" | "m" => CommandResult::SwitchModel(args.to_string()),
        "last" | "l" => CommandResult::LastResponse,
        "show" => CommandResult::Show,
        "quit" | "exit" | "q" => CommandResult::Exit,
        other => CommandResult::Unknown(other.to_string()),
    })
}

fn help_message() -> String {
    r#"Available commands:
  /help, /h, /?        Show this help message
  /new, /n             Start a new conversation
  /models              List models offered by the provider
  /models all          List models of every vendor with a key
  /model, /m <id>      Switch to another model
  /last, /l            Print the latest answer
  /show                Print the conversation as markdown
  /quit, /exit, /q     Exit ask"#
        .to_string()
}
