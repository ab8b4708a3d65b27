//! Best-effort conversion of interpreter-style literals (`{'a': None, 'b': (1, 2),}`)
//! into strict JSON for the debug panel.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static BARE_CONSTANT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(None|True|False)\b").expect("valid regex"));

/// Debug payload shown in a collapsible section under an agent response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugBlock {
    pub content: String,
    /// `true` when `content` is pretty-printed JSON, `false` for the loose fallback.
    pub is_json: bool,
}

impl DebugBlock {
    pub fn from_literal(literal: &str) -> Self {
        match python_literal_to_json(literal) {
            Some(content) => Self {
                content,
                is_json: true,
            },
            None => Self {
                content: loose_python_literal(literal),
                is_json: false,
            },
        }
    }

    pub fn to_markdown(&self) -> String {
        let fence = if self.is_json { "```json" } else { "```" };
        format!(
            "<details>\n<summary>Debug Information</summary>\n\n{fence}\n{}\n```\n</details>",
            self.content
        )
    }
}

/// Converts the literal and pretty-prints it, or `None` if the result is not valid JSON.
pub fn python_literal_to_json(literal: &str) -> Option<String> {
    let converted = convert_literal(literal.trim());
    let value: Value = serde_json::from_str(&converted).ok()?;
    serde_json::to_string_pretty(&value).ok()
}

/// Plain token substitution used when the literal cannot be parsed.
pub fn loose_python_literal(literal: &str) -> String {
    let swapped = literal.replace('\'', "\"");
    BARE_CONSTANT
        .replace_all(&swapped, |caps: &regex::Captures<'_>| match &caps[1] {
            "None" => "null",
            "True" => "true",
            _ => "false",
        })
        .into_owned()
}

fn convert_literal(src: &str) -> String {
    let chars: Vec<char> = src.chars().collect();
    let mut out = String::with_capacity(src.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                let (text, next) = read_string(&chars, i);
                out.push_str(&Value::String(text).to_string());
                i = next;
            }
            'b' if matches!(chars.get(i + 1), Some('\'' | '"')) && !is_ident_char_at(&chars, i.wrapping_sub(1)) => {
                // bytes literal: drop the prefix, keep the string
                i += 1;
            }
            ',' => {
                let next = skip_whitespace(&chars, i + 1);
                if !matches!(chars.get(next), Some('}' | ']' | ')')) {
                    out.push(',');
                }
                i += 1;
            }
            '(' => {
                out.push('[');
                i += 1;
            }
            ')' => {
                out.push(']');
                i += 1;
            }
            '<' => {
                let end = find_closing(&chars, i, '<', '>');
                out.push_str("\"<Python object>\"");
                i = end + 1;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (is_ident_char(chars[i]) || chars[i] == '.') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                if chars.get(i) == Some(&'(') {
                    let end = find_closing(&chars, i, '(', ')');
                    if ident.ends_with("datetime") || ident.ends_with("date") {
                        out.push_str("\"<datetime object>\"");
                    } else {
                        out.push_str("\"<Python object>\"");
                    }
                    i = end + 1;
                    continue;
                }
                match ident.as_str() {
                    "None" => out.push_str("null"),
                    "True" => out.push_str("true"),
                    "False" => out.push_str("false"),
                    other => out.push_str(other),
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }

    out
}

fn read_string(chars: &[char], start: usize) -> (String, usize) {
    let quote = chars[start];
    let mut text = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            match chars.get(i + 1) {
                Some('n') => text.push('\n'),
                Some('t') => text.push('\t'),
                Some('r') => text.push('\r'),
                Some('\\') => text.push('\\'),
                Some('\'') => text.push('\''),
                Some('"') => text.push('"'),
                Some(other) => {
                    text.push('\\');
                    text.push(*other);
                }
                None => text.push('\\'),
            }
            i += 2;
            continue;
        }
        if c == quote {
            return (text, i + 1);
        }
        text.push(c);
        i += 1;
    }
    (text, chars.len())
}

/// Index of the delimiter closing the one at `open_at`, or the last index if unbalanced.
fn find_closing(chars: &[char], open_at: usize, open: char, close: char) -> usize {
    let mut depth = 0usize;
    let mut i = open_at;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' || c == '"' {
            let (_, next) = read_string(chars, i);
            i = next;
            continue;
        }
        if c == open {
            depth += 1;
        } else if c == close {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return i;
            }
        }
        i += 1;
    }
    chars.len().saturating_sub(1)
}

fn skip_whitespace(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_ident_char_at(chars: &[char], i: usize) -> bool {
    chars.get(i).copied().is_some_and(is_ident_char)
}
