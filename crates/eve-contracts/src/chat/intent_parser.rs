use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, KEY_ADD_COMMAND, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SET_COMMAND,
    SINGLE_TOKEN_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            command_args: BTreeMap::new(),
        }
    }

    fn with_arg(mut self, key: &str, value: impl Into<String>) -> Self {
        self.command_args
            .insert(key.to_string(), Value::String(value.into()));
        self
    }

    /// String argument by name, empty when absent.
    pub fn arg(&self, key: &str) -> &str {
        self.command_args
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
    }
}

fn find_spec(command: &str, specs: &[CommandSpec]) -> Option<CommandSpec> {
    specs.iter().find(|spec| spec.command == command).copied()
}

fn split_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg.split_whitespace().map(str::to_string).collect(),
    }
}

fn single_token(arg: &str) -> String {
    split_args(arg).join(" ")
}

fn usage(command: &str, raw: &str) -> Intent {
    Intent::new("usage", raw).with_arg("command", command)
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(spec) = find_spec(&command, RAW_ARG_COMMANDS) {
                return Intent::new(spec.action, text).with_arg(spec.arg, arg);
            }

            if let Some(spec) = find_spec(&command, SINGLE_TOKEN_COMMANDS) {
                let value = single_token(arg);
                if value.is_empty() {
                    return usage(&command, text);
                }
                return Intent::new(spec.action, text).with_arg(spec.arg, value);
            }

            if let Some(spec) = find_spec(&command, NO_ARG_COMMANDS) {
                return Intent::new(spec.action, text);
            }

            if command == SET_COMMAND.command {
                let Some((field, value)) = arg.split_once(char::is_whitespace) else {
                    return usage(&command, text);
                };
                return Intent::new(SET_COMMAND.action, text)
                    .with_arg(SET_COMMAND.arg, field)
                    .with_arg("value", value.trim());
            }

            if command == KEY_ADD_COMMAND.command {
                let mut parts = split_args(arg);
                if parts.len() < 2 {
                    return usage(&command, text);
                }
                let key = parts.pop().unwrap_or_default();
                return Intent::new(KEY_ADD_COMMAND.action, text)
                    .with_arg(KEY_ADD_COMMAND.arg, parts.join(" "))
                    .with_arg("key", key);
            }

            return Intent::new("unknown", text)
                .with_arg("command", command)
                .with_arg("arg", arg);
        }
    }

    let mut intent = Intent::new("send", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn plain_text_is_a_turn() {
        let intent = parse_intent("  hey Eve, long day  ");
        assert_eq!(intent.action, "send");
        assert_eq!(intent.prompt.as_deref(), Some("hey Eve, long day"));
        assert_eq!(parse_intent("   ").action, "noop");
    }

    #[test]
    fn parse_attach_quoted_path() {
        let intent = parse_intent("/attach \"/tmp/my photo.jpg\"");
        assert_eq!(intent.action, "attach");
        assert_eq!(intent.command_args["path"], json!("/tmp/my photo.jpg"));
        assert_eq!(parse_intent("/attach").action, "usage");
    }

    #[test]
    fn parse_raw_argument_commands() {
        let lang = parse_intent("/lang Manglish");
        assert_eq!(lang.action, "set_language");
        assert_eq!(lang.arg("language"), "Manglish");

        let model = parse_intent("/model gemini-2.5-flash");
        assert_eq!(model.action, "set_model");
        assert_eq!(model.arg("model"), "gemini-2.5-flash");

        let endpoint = parse_intent("/endpoint");
        assert_eq!(endpoint.action, "set_endpoint");
        assert_eq!(endpoint.arg("endpoint"), "");
    }

    #[test]
    fn parse_set_splits_field_from_value() {
        let intent = parse_intent("/set steps   12");
        assert_eq!(intent.action, "set_setting");
        assert_eq!(intent.arg("field"), "steps");
        assert_eq!(intent.arg("value"), "12");
        assert_eq!(parse_intent("/set steps").action, "usage");
    }

    #[test]
    fn parse_key_add_with_quoted_label() {
        let intent = parse_intent("/key_add \"work laptop\" AIzaSy-123");
        assert_eq!(intent.action, "key_add");
        assert_eq!(intent.arg("label"), "work laptop");
        assert_eq!(intent.arg("key"), "AIzaSy-123");

        let bare = parse_intent("/key_add AIzaSy-123");
        assert_eq!(bare.action, "usage");
        assert_eq!(bare.arg("command"), "key_add");
    }

    #[test]
    fn parse_no_arg_commands_case_insensitively() {
        assert_eq!(parse_intent("/HELP").action, "help");
        assert_eq!(parse_intent("/models").action, "list_models");
        assert_eq!(parse_intent("/confirm").action, "confirm");
        assert_eq!(parse_intent("/exit").action, "quit");
        assert_eq!(parse_intent("/key_test 1a2b3c4d").arg("id"), "1a2b3c4d");
    }

    #[test]
    fn parse_unknown_command() {
        let intent = parse_intent("/magic foo bar");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("magic"));
        assert_eq!(intent.command_args["arg"], json!("foo bar"));
    }

    #[test]
    fn slash_without_command_is_sent_verbatim() {
        let intent = parse_intent("/ just a slash");
        assert_eq!(intent.action, "send");
        assert_eq!(intent.prompt.as_deref(), Some("/ just a slash"));
    }
}
