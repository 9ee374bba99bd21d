use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::session::{Message, Role};

/// Stand-in text for a model turn that came back empty.
pub const EMPTY_MODEL_PLACEHOLDER: &str = "...";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    InlineData { mime_type: String, data: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

/// Builds the turn sequence sent as conversation history.
///
/// Only the trailing `depth` messages are considered. Error bubbles never
/// reach the remote side, consecutive turns of one role are merged, and the
/// result never opens with a model turn.
pub fn format_history(history: &[Message], depth: usize) -> Vec<Turn> {
    let start = history.len().saturating_sub(depth);
    let mut turns: Vec<Turn> = Vec::new();

    for message in &history[start..] {
        if message.is_error {
            continue;
        }
        let turn = match message.role {
            Role::User => user_turn(&message.text, message.image.as_deref()),
            Role::Model => Some(model_turn(&message.text)),
        };
        let Some(turn) = turn else {
            continue;
        };
        match turns.last_mut() {
            Some(last) if last.role == turn.role => last.parts.extend(turn.parts),
            _ => turns.push(turn),
        }
    }

    let leading_model = turns
        .iter()
        .take_while(|turn| turn.role == Role::Model)
        .count();
    turns.drain(..leading_model);
    turns
}

/// A user turn: the inline image first (when the payload is a data URI),
/// then the text. `None` when neither is present.
pub fn user_turn(text: &str, image: Option<&str>) -> Option<Turn> {
    let mut parts = Vec::new();
    if let Some((mime_type, data)) = image.and_then(parse_data_uri) {
        parts.push(Part::InlineData { mime_type, data });
    }
    if !text.is_empty() {
        parts.push(Part::Text(text.to_string()));
    }
    if parts.is_empty() {
        return None;
    }
    Some(Turn {
        role: Role::User,
        parts,
    })
}

pub fn model_turn(text: &str) -> Turn {
    let text = if text.is_empty() {
        EMPTY_MODEL_PLACEHOLDER
    } else {
        text
    };
    Turn {
        role: Role::Model,
        parts: vec![Part::Text(text.to_string())],
    }
}

/// Splits `data:<mime>;base64,<payload>` into `(mime, payload)`.
pub fn parse_data_uri(uri: &str) -> Option<(String, String)> {
    let rest = uri.strip_prefix("data:")?;
    let (mime_type, data) = rest.split_once(";base64,")?;
    let mime_type = mime_type.trim();
    let data = data.trim();
    if mime_type.is_empty() || data.is_empty() {
        return None;
    }
    Some((mime_type.to_string(), data.to_string()))
}

pub fn data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", BASE64.encode(bytes))
}

/// Decodes the payload of a data URI.
pub fn decode_data_uri(uri: &str) -> Option<(String, Vec<u8>)> {
    let (mime_type, data) = parse_data_uri(uri)?;
    let bytes = BASE64.decode(data.as_bytes()).ok()?;
    Some((mime_type, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: usize, role: Role, text: &str) -> Message {
        Message::with_id(format!("m{id}"), role, text)
    }

    fn alternating(count: usize) -> Vec<Message> {
        (0..count)
            .map(|idx| {
                let role = if idx % 2 == 0 { Role::User } else { Role::Model };
                msg(idx, role, &format!("line {idx}"))
            })
            .collect()
    }

    fn texts(turns: &[Turn]) -> Vec<String> {
        turns
            .iter()
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| match part {
                Part::Text(text) => Some(text.clone()),
                Part::InlineData { .. } => None,
            })
            .collect()
    }

    #[test]
    fn window_keeps_only_trailing_messages() {
        let history = alternating(30);
        let turns = format_history(&history, 20);
        let seen = texts(&turns);
        assert!(seen.len() <= 20);
        assert_eq!(seen.last().map(String::as_str), Some("line 29"));
        assert!(!seen.contains(&"line 9".to_string()));
        assert_eq!(seen.first().map(String::as_str), Some("line 10"));
    }

    #[test]
    fn never_starts_with_model_turn() {
        let mut history = vec![
            msg(0, Role::Model, "welcome"),
            msg(1, Role::Model, "still me"),
        ];
        assert!(format_history(&history, 20).is_empty());

        history.push(msg(2, Role::User, "hi"));
        history.push(msg(3, Role::Model, "hello"));
        let turns = format_history(&history, 20);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
    }

    #[test]
    fn odd_window_that_lands_on_model_turn_is_trimmed() {
        let history = alternating(25);
        let turns = format_history(&history, 20);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(texts(&turns)[0], "line 6");
    }

    #[test]
    fn adjacent_same_role_turns_merge_in_order() {
        let history = vec![
            msg(0, Role::User, "a"),
            msg(1, Role::User, "b"),
            msg(2, Role::Model, "c"),
            msg(3, Role::Model, "d"),
            msg(4, Role::User, "e"),
        ];
        let turns = format_history(&history, 20);
        assert_eq!(turns.len(), 3);
        assert!(turns.windows(2).all(|pair| pair[0].role != pair[1].role));
        assert_eq!(
            turns[0].parts,
            vec![Part::Text("a".to_string()), Part::Text("b".to_string())]
        );
        assert_eq!(texts(&turns), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn error_messages_are_skipped_and_neighbours_merge() {
        let mut failed = msg(1, Role::Model, "Signal lost.");
        failed.is_error = true;
        let history = vec![msg(0, Role::User, "first"), failed, msg(2, Role::User, "retry")];
        let turns = format_history(&history, 20);
        assert_eq!(turns.len(), 1);
        assert_eq!(texts(&turns), vec!["first", "retry"]);
    }

    #[test]
    fn empty_model_text_gets_placeholder() {
        let history = vec![msg(0, Role::User, "hey"), msg(1, Role::Model, "")];
        let turns = format_history(&history, 20);
        assert_eq!(turns[1].parts, vec![Part::Text("...".to_string())]);
    }

    #[test]
    fn user_image_precedes_text_and_empty_user_turns_drop() {
        let mut with_image = msg(0, Role::User, "look");
        with_image.image = Some("data:image/jpeg;base64,QUJD".to_string());
        let mut bare = msg(1, Role::User, "");
        bare.image = Some("https://example.com/not-inline.png".to_string());
        let history = vec![with_image, bare, msg(2, Role::Model, "nice")];

        let turns = format_history(&history, 20);
        assert_eq!(turns.len(), 2);
        assert_eq!(
            turns[0].parts,
            vec![
                Part::InlineData {
                    mime_type: "image/jpeg".to_string(),
                    data: "QUJD".to_string(),
                },
                Part::Text("look".to_string()),
            ]
        );
    }

    #[test]
    fn data_uri_roundtrip_and_rejects_malformed() {
        let uri = data_uri("image/png", b"png-bytes");
        assert!(uri.starts_with("data:image/png;base64,"));
        assert_eq!(
            decode_data_uri(&uri),
            Some(("image/png".to_string(), b"png-bytes".to_vec()))
        );
        assert_eq!(parse_data_uri("data:;base64,AAAA"), None);
        assert_eq!(parse_data_uri("data:image/png,AAAA"), None);
        assert_eq!(parse_data_uri("image/png;base64,AAAA"), None);
    }
}
