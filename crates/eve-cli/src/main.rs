use std::env;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use eve_contracts::chat::{data_uri, decode_data_uri, parse_intent, Intent, CHAT_HELP_COMMANDS};
use eve_contracts::session::{Message, Role};
use eve_contracts::settings::{Language, SETTING_FIELDS};
use eve_engine::{
    BackgroundUpdate, Backends, Companion, CompanionConfig, Confirmation, ConsolidationOutcome,
    KeyTest, LanguageChange, PendingAction,
};
use serde_json::Value;

const DATA_DIR_ENV: &str = "EVE_DATA_DIR";
const LOG_ENV: &str = "EVE_LOG";
const PROMPT: &str = "> ";
const WAIT_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Parser)]
#[command(name = "eve", version, about = "Eve companion chat")]
struct Cli {
    /// Where session, settings and event files live.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    Keys {
        #[command(subcommand)]
        command: KeysCommand,
    },
    Wipe(WipeArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Show,
    Set { field: String, value: String },
    Reset { field: String },
}

#[derive(Debug, Subcommand)]
enum KeysCommand {
    List,
    Add { label: String, key: String },
    Use { id: String },
    Remove { id: String },
    Test { id: String },
}

#[derive(Debug, Parser)]
struct WipeArgs {
    #[arg(long)]
    yes: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("eve error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    init_tracing();
    let cli = Cli::parse();
    let data_dir = resolve_data_dir(cli.data_dir)?;
    tracing::debug!(data_dir = %data_dir.display(), "using data dir");
    match cli.command {
        Command::Chat(args) => {
            let mut config = CompanionConfig::new(&data_dir);
            config.events_path = args.events;
            run_chat(Companion::open(config, Backends::live())?)?;
            Ok(0)
        }
        Command::Settings { command } => {
            let mut companion = open_companion(&data_dir)?;
            run_settings(&mut companion, command)
        }
        Command::Keys { command } => {
            let mut companion = open_companion(&data_dir)?;
            run_keys(&mut companion, command)
        }
        Command::Wipe(args) => {
            if !args.yes {
                bail!("wipe deletes the conversation and all memories; pass --yes to confirm");
            }
            let mut companion = open_companion(&data_dir)?;
            companion.wipe();
            println!("Memory cleared. Fresh start!");
            Ok(0)
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn resolve_data_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir);
    }
    if let Some(dir) = env::var_os(DATA_DIR_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_dir()
        .map(|dir| dir.join("eve"))
        .context("no data directory available; pass --data-dir or set EVE_DATA_DIR")
}

fn open_companion(data_dir: &Path) -> Result<Companion> {
    Companion::open(CompanionConfig::new(data_dir), Backends::live())
}

fn run_chat(mut companion: Companion) -> Result<()> {
    let stdin = io::stdin();
    let mut line = String::new();
    let mut attachment: Option<String> = None;

    for message in companion.messages() {
        print_message(message);
    }
    println!("Eve chat started ({}). Type /help for commands.", companion.language().label());

    loop {
        let updates = companion.poll_background();
        report_updates(&companion, updates);
        print!("{PROMPT}");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => {}
            "send" => {
                let text = intent.prompt.clone().unwrap_or_default();
                let Some(report) = companion.send(&text, attachment.take()) else {
                    continue;
                };
                print_message(&report.reply);
                if let Some(model) = report.suggested_model {
                    println!("Try another chat model: /model {model}");
                }
                if report.visual_pending {
                    println!("(image on the way; /wait to block for it)");
                }
            }
            "quit" => break,
            _ => handle_command(&mut companion, &intent, &mut attachment)?,
        }
    }

    if companion.background_in_flight() {
        println!("Finishing background work...");
        let updates = companion.wait_background(WAIT_TIMEOUT);
        report_updates(&companion, updates);
    }
    Ok(())
}

fn handle_command(
    companion: &mut Companion,
    intent: &Intent,
    attachment: &mut Option<String>,
) -> Result<()> {
    match intent.action.as_str() {
        "help" => print_help(),
        "attach" => match load_attachment(Path::new(intent.arg("path"))) {
            Ok(uri) => {
                *attachment = Some(uri);
                println!("Image attached to your next message.");
            }
            Err(err) => println!("Attach failed: {err:#}"),
        },
        "set_language" => {
            let raw = intent.arg("language");
            let Some(language) = Language::parse(raw) else {
                println!("Unknown language '{raw}'. Use english or manglish.");
                return Ok(());
            };
            match companion.request_language(language)? {
                LanguageChange::Unchanged => println!("Already speaking {}.", language.label()),
                LanguageChange::Applied(language) => {
                    println!("Persona switched to {}.", language.label());
                    companion.messages().iter().for_each(print_message);
                }
                LanguageChange::NeedsConfirmation(language) => println!(
                    "Switch persona to {}? The conversation is kept. /confirm or /cancel.",
                    language.label()
                ),
            }
        }
        "confirm" => match companion.confirm()? {
            Confirmation::Language(language) => {
                println!("Persona switched to {}.", language.label())
            }
            Confirmation::Wiped => {
                println!("Memory cleared. Fresh start!");
                companion.messages().iter().for_each(print_message);
            }
            Confirmation::NothingPending => println!("Nothing to confirm."),
        },
        "cancel" => match companion.cancel() {
            Some(PendingAction::Language(_)) => println!("Language switch cancelled."),
            Some(PendingAction::Wipe) => println!("Wipe cancelled."),
            None => println!("Nothing to cancel."),
        },
        "wipe" => {
            companion.request_wipe();
            println!("This forgets every message and memory. /confirm or /cancel.");
        }
        "set_model" => {
            let model = intent.arg("model");
            if model.is_empty() {
                println!("Chat model: {}", companion.settings().chat_model);
                return Ok(());
            }
            match companion.set_model(model) {
                Ok(warning) => {
                    if let Some(warning) = warning {
                        println!("{warning}");
                    }
                    println!("Chat model set to {}", companion.settings().chat_model);
                }
                Err(err) => println!("Model change failed: {err:#}"),
            }
        }
        "list_models" => {
            let current = companion.settings().chat_model.clone();
            for model in companion.chat_models() {
                let marker = if model.name == current { "*" } else { " " };
                let quota = model.quota.map(|quota| format!(" ({quota})")).unwrap_or_default();
                println!("{marker} {} - {}{quota}", model.name, model.display_name);
            }
        }
        "set_setting" => match companion.set_setting(intent.arg("field"), intent.arg("value")) {
            Ok(field) => println!("{field} = {}", setting_text(companion, field)),
            Err(err) => println!("Setting not changed: {err:#}"),
        },
        "reset_setting" => match companion.reset_setting(intent.arg("field")) {
            Ok(field) => println!("{field} reset to {}", setting_text(companion, field)),
            Err(err) => println!("Setting not reset: {err:#}"),
        },
        "show_settings" => print_settings(companion),
        "set_endpoint" => {
            let raw = intent.arg("endpoint");
            if raw.is_empty() {
                println!("Image endpoint: {}", companion.endpoint().unwrap_or("(none)"));
                return Ok(());
            }
            let raw = if raw.eq_ignore_ascii_case("clear") { "" } else { raw };
            match companion.set_endpoint(raw)? {
                Some(endpoint) => println!("Gradio endpoint updated: {endpoint}"),
                None => println!("Gradio endpoint cleared."),
            }
        }
        "key_add" => match companion.add_key(intent.arg("label"), intent.arg("key")) {
            Ok(entry) => println!("API Key added: {} {} {}", entry.id, entry.label, entry.masked()),
            Err(err) => println!("Key not added: {err:#}"),
        },
        "key_use" => match companion.use_key(intent.arg("id")) {
            Ok(()) => println!("Active key set to {}", intent.arg("id")),
            Err(err) => println!("{err:#}"),
        },
        "key_remove" => match companion.remove_key(intent.arg("id")) {
            Ok(()) => println!("Key {} removed.", intent.arg("id")),
            Err(err) => println!("{err:#}"),
        },
        "key_test" => {
            print_key_test(companion, intent.arg("id"))?;
        }
        "list_keys" => print_keys(companion),
        "show_memories" => print_memories(companion),
        "show_context" => println!(
            "~{} tokens across the last {} messages",
            companion.context_usage(),
            companion.settings().history_depth
        ),
        "wait" => {
            let updates = companion.wait_background(WAIT_TIMEOUT);
            if updates.is_empty() {
                println!("Nothing pending.");
            }
            report_updates(companion, updates);
        }
        "usage" => println!("{} needs an argument; see /help", intent.arg("command")),
        "unknown" => println!("Unknown command /{}; see /help", intent.arg("command")),
        other => println!("Unsupported action {other}"),
    }
    Ok(())
}

fn run_settings(companion: &mut Companion, command: SettingsCommand) -> Result<i32> {
    match command {
        SettingsCommand::Show => {
            print_settings(companion);
            println!(
                "endpoint = {}",
                companion.endpoint().unwrap_or("(none)")
            );
            println!("language = {}", companion.language().as_str());
        }
        SettingsCommand::Set { field, value } => {
            let field = companion.set_setting(&field, &value)?;
            println!("{field} = {}", setting_text(companion, field));
        }
        SettingsCommand::Reset { field } => {
            let field = companion.reset_setting(&field)?;
            println!("{field} reset to {}", setting_text(companion, field));
        }
    }
    Ok(0)
}

fn run_keys(companion: &mut Companion, command: KeysCommand) -> Result<i32> {
    match command {
        KeysCommand::List => print_keys(companion),
        KeysCommand::Add { label, key } => {
            let entry = companion.add_key(&label, &key)?;
            println!("API Key added: {} {} {}", entry.id, entry.label, entry.masked());
        }
        KeysCommand::Use { id } => {
            companion.use_key(&id)?;
            println!("Active key set to {id}");
        }
        KeysCommand::Remove { id } => {
            companion.remove_key(&id)?;
            println!("Key {id} removed.");
        }
        KeysCommand::Test { id } => {
            if !print_key_test(companion, &id)? {
                return Ok(2);
            }
        }
    }
    Ok(0)
}

fn print_key_test(companion: &Companion, id: &str) -> Result<bool> {
    let label = companion
        .key_ring()
        .get(id)
        .map(|entry| entry.label.clone())
        .unwrap_or_else(|| id.to_string());
    match companion.test_key(id) {
        Ok(KeyTest::Valid) => {
            println!("Key \"{label}\" is valid!");
            Ok(true)
        }
        Ok(KeyTest::Invalid(reason)) => {
            println!("Key test failed: {reason}");
            Ok(false)
        }
        Err(err) => {
            println!("{err:#}");
            Ok(false)
        }
    }
}

fn print_help() {
    let width = CHAT_HELP_COMMANDS
        .iter()
        .map(|(usage, _)| usage.len())
        .max()
        .unwrap_or(0);
    for (usage, description) in CHAT_HELP_COMMANDS {
        println!("  {usage:<width$}  {description}");
    }
}

fn print_settings(companion: &Companion) {
    for field in SETTING_FIELDS {
        println!("{field} = {}", setting_text(companion, field));
    }
}

fn setting_text(companion: &Companion, field: &str) -> String {
    match companion.settings().field_value(field) {
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
        None => "?".to_string(),
    }
}

fn print_keys(companion: &Companion) {
    let ring = companion.key_ring();
    if ring.keys.is_empty() {
        println!("No API keys stored. Add one with /key_add <label> <key>.");
        return;
    }
    let active = ring.active().map(|entry| entry.id.as_str());
    for entry in &ring.keys {
        let marker = if Some(entry.id.as_str()) == active { "*" } else { " " };
        println!("{marker} {}  {}  {}", entry.id, entry.label, entry.masked());
    }
}

fn print_memories(companion: &Companion) {
    let memories = companion.memories();
    if memories.is_empty() {
        println!("No long-term memories yet.");
        return;
    }
    for memory in memories {
        println!("• {memory}");
    }
}

fn print_message(message: &Message) {
    let speaker = match message.role {
        Role::User => "you",
        Role::Model => "eve",
    };
    if message.is_error {
        println!("{speaker}! {}", message.text);
        return;
    }
    if !message.text.is_empty() {
        println!("{speaker}> {}", message.text);
    }
    if let Some(image) = message.image.as_deref().filter(|image| !image.starts_with("data:")) {
        println!("{speaker}> [image] {image}");
    }
}

fn report_updates(companion: &Companion, updates: Vec<BackgroundUpdate>) {
    for update in updates {
        match update {
            BackgroundUpdate::ImageReady { message_id, backend } => {
                let image = companion
                    .session()
                    .find(&message_id)
                    .and_then(|message| message.image.clone());
                match image.map(|image| store_image(&companion.config().data_dir, &message_id, &image)) {
                    Some(Ok(location)) => println!("eve> [image via {backend}] {location}"),
                    Some(Err(err)) => println!("Image received but not saved: {err:#}"),
                    None => {}
                }
            }
            BackgroundUpdate::ImageFailed { .. } | BackgroundUpdate::ImageDiscarded { .. } => {}
            BackgroundUpdate::Consolidation(ConsolidationOutcome::Applied { .. }) => {
                println!("Eve updated her core memories.");
            }
            BackgroundUpdate::Consolidation(_) => {}
        }
    }
}

/// Writes inline images under `images/` and returns their path; URLs are
/// returned as-is.
fn store_image(data_dir: &Path, message_id: &str, image: &str) -> Result<String> {
    let Some((mime_type, bytes)) = decode_data_uri(image) else {
        return Ok(image.to_string());
    };
    let dir = data_dir.join("images");
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!("{message_id}.{}", extension_for_mime(&mime_type)));
    fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path.display().to_string())
}

fn load_attachment(path: &Path) -> Result<String> {
    let Some(mime_type) = mime_for_path(path) else {
        bail!("unsupported image type: {}", path.display());
    };
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if bytes.is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(data_uri(mime_type, &bytes))
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}
