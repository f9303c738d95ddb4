//! The conversation transcript format shared by workspaces and transports.
//!
//! A context is a sequence of blocks separated by blank lines, each headed by
//! `[role](#kind)`:
//!
//! ```text
//! [system](#additional_instructions)
//! You are a helpful assistant.
//!
//! [user](#message)
//! Hello
//!
//! [assistant](#message)
//! Hi there.
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\[(system|user|assistant)\]\(#([A-Za-z0-9_-]+)\)[ \t]*\r?$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::System,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const KIND_MESSAGE: &str = "message";
pub const KIND_INSTRUCTIONS: &str = "additional_instructions";
pub const KIND_WEBPAGE: &str = "webpage_context";
pub const KIND_DOCUMENT: &str = "document_context";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextBlock {
    pub role: Role,
    pub kind: String,
    pub text: String,
}

pub fn block(role: Role, kind: &str, text: &str) -> String {
    format!("[{}](#{})\n{}", role, kind, text.trim_end())
}

pub fn append_block(context: &mut String, role: Role, kind: &str, text: &str) {
    if !context.trim().is_empty() {
        while context.ends_with('\n') {
            context.pop();
        }
        context.push_str("\n\n");
    }
    context.push_str(&block(role, kind, text));
}

/// Appends one user/assistant exchange.
pub fn append_turn(context: &mut String, prompt: &str, response: &str) {
    append_block(context, Role::User, KIND_MESSAGE, prompt);
    append_block(context, Role::Assistant, KIND_MESSAGE, response);
}

/// Joins two contexts, e.g. a preset in front of a workspace transcript.
pub fn concat(front: &str, back: &str) -> String {
    match (front.trim().is_empty(), back.trim().is_empty()) {
        (true, _) => back.to_string(),
        (false, true) => front.to_string(),
        (false, false) => format!("{}\n\n{}", front.trim_end(), back.trim_start()),
    }
}

/// Splits a transcript into blocks. Text before the first header becomes a
/// system instruction block.
pub fn parse(context: &str) -> Vec<ContextBlock> {
    let mut blocks = Vec::new();
    let mut pending: Option<(Role, String)> = None;
    let mut cursor = 0;

    for caps in HEADER.captures_iter(context) {
        let Some(whole) = caps.get(0) else { continue };
        let text = context[cursor..whole.start()].trim();
        match pending.take() {
            Some((role, kind)) => blocks.push(ContextBlock {
                role,
                kind,
                text: text.to_string(),
            }),
            None if !text.is_empty() => blocks.push(ContextBlock {
                role: Role::System,
                kind: KIND_INSTRUCTIONS.to_string(),
                text: text.to_string(),
            }),
            None => {}
        }
        pending = Some((Role::parse(&caps[1]), caps[2].to_string()));
        cursor = whole.end();
    }

    let tail = context[cursor..].trim();
    match pending {
        Some((role, kind)) => blocks.push(ContextBlock {
            role,
            kind,
            text: tail.to_string(),
        }),
        None if !tail.is_empty() => blocks.push(ContextBlock {
            role: Role::System,
            kind: KIND_INSTRUCTIONS.to_string(),
            text: tail.to_string(),
        }),
        None => {}
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_turn_builds_parseable_transcript() {
        let mut ctx = String::new();
        append_turn(&mut ctx, "Hello", "Hi there.");
        assert_eq!(ctx, "[user](#message)\nHello\n\n[assistant](#message)\nHi there.");

        append_turn(&mut ctx, "Bye", "Bye!\n");
        let blocks = parse(&ctx);
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[2].role, Role::User);
        assert_eq!(blocks[3].text, "Bye!");
    }

    #[test]
    fn parse_keeps_multiline_text_and_kinds() {
        let ctx = "[system](#additional_instructions)\nBe brief.\nReally.\n\n\
                   [user](#webpage_context)\n# Title\nbody\n\n[user](#message)\nq";
        let blocks = parse(ctx);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].text, "Be brief.\nReally.");
        assert_eq!(blocks[1].kind, KIND_WEBPAGE);
        assert_eq!(blocks[1].text, "# Title\nbody");
        assert_eq!(blocks[2].text, "q");
    }

    #[test]
    fn leading_free_text_becomes_instructions() {
        let blocks = parse("You are terse.\n\n[user](#message)\nhi");
        assert_eq!(blocks[0].role, Role::System);
        assert_eq!(blocks[0].text, "You are terse.");
        assert_eq!(blocks[1].role, Role::User);

        let only = parse("just text");
        assert_eq!(only.len(), 1);
        assert!(parse("   ").is_empty());
    }

    #[test]
    fn concat_skips_empty_sides() {
        assert_eq!(concat("", "b"), "b");
        assert_eq!(concat("a\n", "  "), "a\n");
        assert_eq!(concat("a\n", "\nb"), "a\n\nb");
    }
}
