//! Visual directives embedded in model replies.
//!
//! Grammar: `[KIND]` or `[KIND:<ws>description]`, with KIND one of `SCENE`
//! or `SELFIE` (uppercase). The description runs up to the first `]` and may
//! not span lines. Directives can appear anywhere in a reply; all of them are
//! stripped from the displayed text.

use std::ops::Range;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisualKind {
    #[default]
    Scene,
    Selfie,
}

impl VisualKind {
    pub fn tag(self) -> &'static str {
        match self {
            VisualKind::Scene => "SCENE",
            VisualKind::Selfie => "SELFIE",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VisualKind::Scene => "scene",
            VisualKind::Selfie => "selfie",
        }
    }

    /// Prompt used when the directive carries no description.
    pub fn default_prompt(self) -> &'static str {
        match self {
            VisualKind::Scene => "a scenic POV",
            VisualKind::Selfie => "portrait of Eve",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub kind: VisualKind,
    pub description: Option<String>,
    pub span: Range<usize>,
}

impl Directive {
    pub fn prompt(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| self.kind.default_prompt().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub clean_text: String,
    pub visual_prompt: Option<String>,
    pub visual_kind: VisualKind,
}

/// Finds every directive in `text`, in order of appearance.
pub fn scan_directives(text: &str) -> Vec<Directive> {
    let mut found = Vec::new();
    let mut cursor = 0;
    while let Some(offset) = text[cursor..].find('[') {
        let start = cursor + offset;
        match directive_at(text, start) {
            Some(directive) => {
                cursor = directive.span.end;
                found.push(directive);
            }
            None => cursor = start + 1,
        }
    }
    found
}

fn directive_at(text: &str, start: usize) -> Option<Directive> {
    let rest = &text[start + 1..];
    for kind in [VisualKind::Selfie, VisualKind::Scene] {
        let Some(after) = rest.strip_prefix(kind.tag()) else {
            continue;
        };
        let head = start + 1 + kind.tag().len();
        if after.starts_with(']') {
            return Some(Directive {
                kind,
                description: None,
                span: start..head + 1,
            });
        }
        let body = after.strip_prefix(':')?;
        let trimmed = body.trim_start();
        let lead = body.len() - trimmed.len();
        let close = trimmed.find([']', '\n'])?;
        if !trimmed[close..].starts_with(']') {
            return None;
        }
        let description = trimmed[..close].trim();
        return Some(Directive {
            kind,
            description: (!description.is_empty()).then(|| description.to_string()),
            span: start..head + 1 + lead + close + 1,
        });
    }
    None
}

/// Splits a raw reply into display text and at most one visual request.
///
/// A selfie directive wins over a scene directive. With image generation
/// disabled the directives are still removed but no prompt is produced.
pub fn parse_reply(raw: &str, image_generation_enabled: bool) -> ParsedReply {
    let directives = scan_directives(raw);

    let chosen = directives
        .iter()
        .find(|directive| directive.kind == VisualKind::Selfie)
        .or_else(|| {
            directives
                .iter()
                .find(|directive| directive.kind == VisualKind::Scene)
        })
        .filter(|_| image_generation_enabled);

    let mut clean = String::with_capacity(raw.len());
    let mut cursor = 0;
    for directive in &directives {
        clean.push_str(&raw[cursor..directive.span.start]);
        cursor = directive.span.end;
    }
    clean.push_str(&raw[cursor..]);

    ParsedReply {
        clean_text: clean.trim().to_string(),
        visual_prompt: chosen.map(Directive::prompt),
        visual_kind: chosen.map(|directive| directive.kind).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selfie_wins_over_scene_and_both_are_stripped() {
        let parsed = parse_reply(
            "Okay okay. [SCENE: a rainy street] Fine. [SELFIE: smirking close-up]",
            true,
        );
        assert_eq!(parsed.visual_kind, VisualKind::Selfie);
        assert_eq!(parsed.visual_prompt.as_deref(), Some("smirking close-up"));
        assert_eq!(parsed.clean_text, "Okay okay.  Fine.");
    }

    #[test]
    fn no_directive_leaves_text_trimmed_only() {
        let raw = "  Just talking, [no tags] here.\n";
        let parsed = parse_reply(raw, true);
        assert_eq!(parsed.visual_prompt, None);
        assert_eq!(parsed.visual_kind, VisualKind::Scene);
        assert_eq!(parsed.clean_text, raw.trim());
    }

    #[test]
    fn every_occurrence_is_removed_regardless_of_order() {
        let parsed = parse_reply("[SCENE: one]a[SCENE]b[SELFIE]c[SCENE: two]", true);
        assert_eq!(parsed.clean_text, "abc");
        assert_eq!(parsed.visual_kind, VisualKind::Selfie);
        assert_eq!(parsed.visual_prompt.as_deref(), Some("portrait of Eve"));
    }

    #[test]
    fn first_scene_is_used_when_no_selfie() {
        let parsed = parse_reply("Missed you. [SCENE: sofa, blanket] [SCENE: later]", true);
        assert_eq!(parsed.visual_kind, VisualKind::Scene);
        assert_eq!(parsed.visual_prompt.as_deref(), Some("sofa, blanket"));
        assert_eq!(parsed.clean_text, "Missed you.");
    }

    #[test]
    fn missing_description_falls_back_per_kind() {
        assert_eq!(
            parse_reply("hi [SCENE]", true).visual_prompt.as_deref(),
            Some("a scenic POV")
        );
        assert_eq!(
            parse_reply("hi [SELFIE:   ]", true).visual_prompt.as_deref(),
            Some("portrait of Eve")
        );
    }

    #[test]
    fn disabled_generation_strips_without_prompt() {
        let parsed = parse_reply("Here. [SELFIE: waving]", false);
        assert_eq!(parsed.clean_text, "Here.");
        assert_eq!(parsed.visual_prompt, None);
        assert_eq!(parsed.visual_kind, VisualKind::Scene);
    }

    #[test]
    fn near_misses_are_not_directives() {
        let raw = "[SCENERY: x] [scene: lower] [SELFIE: open\nline] [SCENE";
        assert!(scan_directives(raw).is_empty());
        assert_eq!(parse_reply(raw, true).clean_text, raw);
    }

    #[test]
    fn description_tolerates_leading_newline_whitespace() {
        let directives = scan_directives("[SCENE:\n  you see me laughing]");
        assert_eq!(directives.len(), 1);
        assert_eq!(
            directives[0].description.as_deref(),
            Some("you see me laughing")
        );
        assert_eq!(directives[0].span, 0..30);
    }
}
