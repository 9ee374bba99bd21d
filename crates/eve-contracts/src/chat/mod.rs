mod command_registry;
mod context_formatter;
mod directive_parser;
mod intent_parser;

pub use command_registry::CHAT_HELP_COMMANDS;
pub use context_formatter::{
    data_uri, decode_data_uri, format_history, model_turn, parse_data_uri, user_turn, Part, Turn,
    EMPTY_MODEL_PLACEHOLDER,
};
pub use directive_parser::{parse_reply, scan_directives, Directive, ParsedReply, VisualKind};
pub use intent_parser::{parse_intent, Intent};
