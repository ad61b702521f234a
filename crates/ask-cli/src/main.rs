//! ask - chat with Gemini, Portkey and other LLM providers

mod commands;
mod config;

use std::{
    future::Future,
    io::{self, Write},
    sync::Arc,
};

use anyhow::Context;
use ask_ai::{ChatProvider, ModelInfo, ProviderKind, Role, build_provider, http::ReqwestTransport};
use ask_chat::{
    ChatEvent, ChatSession, LOADING_PLACEHOLDER, ModelCache, Notification, NotificationAction,
    NotificationStyle,
};
use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// ask - chat with LLM providers from the terminal
#[derive(Parser, Debug)]
#[command(name = "ask")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Provider (gemini, gemini-sdk, portkey, multi:openai, multi:anthropic, multi:google)
    #[arg(short, long)]
    provider: Option<String>,

    /// Model to use (default: gemini-2.0-flash)
    #[arg(short, long)]
    model: Option<String>,

    /// System prompt
    #[arg(short, long)]
    system: Option<String>,

    /// Ask a single question and exit
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// List the provider's models and exit
    #[arg(long)]
    list_models: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    let filter = if args.verbose {
        Some(EnvFilter::new("ask=debug,ask_ai=debug,ask_chat=debug"))
    } else {
        EnvFilter::try_from_default_env().ok()
    };
    if let Some(filter) = filter {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }

    // Initialize config and exit
    if args.init_config {
        let path = config::Config::init().context("creating config file")?;
        println!("Config file at: {}", path.display());
        println!("\nExample config:\n{}", config::example_config());
        return Ok(());
    }

    let cfg = config::Config::load();
    let kind = cfg.provider_kind(args.provider.as_deref())?;
    let http = Arc::new(ReqwestTransport::new());
    let provider = build_provider(
        &cfg.provider_settings(kind, args.model.as_deref()),
        http.clone(),
    )?;

    if args.list_models {
        let models = ModelCache::global().models_for(provider.as_ref()).await;
        print_models(provider.as_ref(), &models);
        return Ok(());
    }

    let mut session = ChatSession::new(cfg.session_config(args.system.clone()), provider);
    let mut events = session.subscribe();
    let mut printer = Printer::default();

    // Non-interactive mode
    if let Some(command) = args.command {
        drive(session.submit(&command), &mut events, &mut printer).await?;
        return Ok(());
    }

    if io::IsTerminal::is_terminal(&io::stderr()) {
        eprintln!("ask ({} / {})", kind.name(), session.provider().model());
        eprintln!("Type /help for commands.");
        eprintln!();
    }

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            // EOF
            break;
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(result) = commands::execute_command(input) {
            match result {
                commands::CommandResult::NewConversation => {
                    session.new_conversation();
                    println!("Started a new conversation.");
                }
                commands::CommandResult::ListModels => {
                    let models = session.list_models().await;
                    print_models(session.provider().as_ref(), &models);
                }
                commands::CommandResult::ListAllModels => list_all_models(&cfg, http.clone()).await,
                commands::CommandResult::SwitchModel(model) => {
                    match switch_model(&cfg, kind, &model, http.clone()) {
                        Ok(provider) => {
                            session.set_provider(provider);
                            println!("Switched to: {} ({})", model, kind.name());
                        }
                        Err(e) => eprintln!("Error: {}", e),
                    }
                }
                commands::CommandResult::LastResponse => match session.last_response() {
                    Some(text) => println!("{}", text),
                    None => println!("No response yet."),
                },
                commands::CommandResult::Show => println!("{}", session.render()),
                commands::CommandResult::Message(msg) => println!("{}", msg),
                commands::CommandResult::Exit => break,
                commands::CommandResult::Unknown(cmd) => {
                    println!("Unknown command: /{}", cmd);
                    println!("Type /help for available commands.");
                }
            }
            continue;
        }

        let result = if session.conversation().is_some() {
            drive(session.add_message(input), &mut events, &mut printer).await
        } else {
            drive(session.submit(input), &mut events, &mut printer).await
        };
        // Failures were already reported through notifications
        if let Err(e) = result {
            tracing::debug!("Turn failed: {}", e);
        }
    }

    Ok(())
}

fn switch_model(
    cfg: &config::Config,
    kind: ProviderKind,
    model: &str,
    http: Arc<ReqwestTransport>,
) -> ask_ai::Result<Arc<dyn ChatProvider>> {
    build_provider(&cfg.provider_settings(kind, Some(model)), http)
}

/// Models of every vendor with a configured key, through the shared cache
async fn list_all_models(cfg: &config::Config, http: Arc<ReqwestTransport>) {
    let mut providers = Vec::new();
    for settings in cfg.listing_settings() {
        match build_provider(&settings, http.clone()) {
            Ok(provider) => providers.push(provider),
            Err(e) => tracing::debug!("Skipping {}: {}", settings.kind.name(), e),
        }
    }
    if providers.is_empty() {
        println!("No vendor keys configured.");
        return;
    }
    for model in ModelCache::global().models_for_all(&providers).await {
        println!("  {} ({}) [{}]", model.id, model.name, model.provider);
    }
}

fn print_models(provider: &dyn ChatProvider, models: &[ModelInfo]) {
    if models.is_empty() {
        println!("No models available from {}.", provider.kind().name());
        return;
    }
    for model in models {
        let marker = if model.id == provider.model() { "*" } else { " " };
        println!("{} {} ({})", marker, model.id, model.name);
    }
}

/// Run a turn while printing its events as they arrive
async fn drive(
    turn: impl Future<Output = ask_chat::Result<()>>,
    events: &mut broadcast::Receiver<ChatEvent>,
    printer: &mut Printer,
) -> ask_chat::Result<()> {
    tokio::pin!(turn);
    let result = loop {
        tokio::select! {
            result = &mut turn => break result,
            event = events.recv() => {
                if let Ok(event) = event {
                    printer.handle(event);
                }
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        printer.handle(event);
    }
    if let Err(e @ ask_chat::Error::EmptyInput) = &result {
        eprintln!("{}", e);
    }
    result
}

/// Text shown on stderr for a notification; success is silent
fn notification_line(n: &Notification) -> Option<String> {
    match n.style {
        NotificationStyle::Animated => Some(format!("[{}]", n.summary())),
        NotificationStyle::Success => None,
        NotificationStyle::Failure => {
            let mut line = format!("\nError: {}", n.summary());
            if n.action == Some(NotificationAction::OpenSettings) {
                line.push_str(&format!(
                    "\nAdd the key to {} or set it in the environment (ask --init-config).",
                    config::Config::config_path().display()
                ));
            }
            Some(line)
        }
    }
}

/// Prints streamed text incrementally and notifications on stderr
#[derive(Default)]
struct Printer {
    printed: usize,
}

impl Printer {
    fn handle(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::TurnStart { .. } => self.printed = 0,
            ChatEvent::MessageUpdate { content, .. } => self.print_update(&content),
            ChatEvent::Notification(n) => {
                if let Some(line) = notification_line(&n) {
                    eprintln!("{}", line);
                }
            }
            ChatEvent::TurnEnd {
                role: Role::Assistant,
                token_tally,
                ..
            } => {
                println!("\n[Token tally: {}]", token_tally);
            }
            _ => {}
        }
    }

    fn print_update(&mut self, content: &str) {
        if content == LOADING_PLACEHOLDER {
            return;
        }
        match content.get(self.printed..) {
            Some(rest) => print!("{}", rest),
            _ => print!("\n{}", content),
        }
        self.printed = content.len();
        let _ = io::stdout().flush();
    }
}
