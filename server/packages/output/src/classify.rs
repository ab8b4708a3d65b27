use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::event::{OutputEvent, OutputKind};
use crate::normalize::{collapse_blank_lines, normalize_response, normalize_scanned};
use crate::pyliteral::DebugBlock;

const REPLY_OPENERS: [&str; 6] = ["I have", "I can", "Here", "Let me", "The ", "This "];
const DEBUG_LABELS: [&str; 4] = ["Result type:", "Result dir:", "Agent result:", "Result dict:"];

static DEBUG_DICT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)Result dict: (\{.*\})").expect("valid regex"));
static LABELED_DATA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)\bdata:\s*['"](.*?)['"]"#).expect("valid regex"));
static RESULT_TYPE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)Result type:.*?Result dir:[^\n]*\n?").expect("valid regex")
});
static DEBUG_LABEL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:Result type|Result dir|Agent result|Result dict):[^\n]*\n?")
        .expect("valid regex")
});

/// A named pattern that pulls the answer out of a debug dump.
pub struct ExtractionRule {
    pub name: &'static str,
    pattern: Regex,
}

impl ExtractionRule {
    fn new(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            pattern: Regex::new(pattern).expect("valid regex"),
        }
    }

    pub fn extract<'a>(&self, text: &'a str) -> Option<&'a str> {
        self.pattern
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .filter(|m| !m.trim().is_empty())
    }
}

/// Most specific first; the first rule that matches wins.
static RULES: LazyLock<Vec<ExtractionRule>> = LazyLock::new(|| {
    vec![
        ExtractionRule::new(
            "agent-run-result",
            r"(?s)Agent result: AgentRunResult\(data='(.*?)'\)",
        ),
        ExtractionRule::new(
            "agent-run-result-loose",
            r#"(?s)AgentRunResult\(data=['"](.*?)['"][),]"#,
        ),
        ExtractionRule::new("data-field", r#"(?s)['"]data['"]:\s*['"](.*?)['"]"#),
        ExtractionRule::new("agent-prefix", r"(?s)Agent:\s*(.*?)(?:\n\n|$)"),
    ]
});

pub fn rules() -> &'static [ExtractionRule] {
    &RULES
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    pub text: String,
    pub debug: Option<DebugBlock>,
    /// Name of the rule or fallback that produced `text`.
    pub rule: &'static str,
}

impl AgentResponse {
    pub fn to_markdown(&self) -> String {
        match &self.debug {
            Some(debug) => format!("{}\n\n{}", self.text, debug.to_markdown()),
            None => self.text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainOutput {
    pub kind: OutputKind,
    pub text: String,
    /// Pretty-printed body when the text is a JSON document.
    pub json: Option<String>,
    pub is_code: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    AgentResponse(AgentResponse),
    Plain(PlainOutput),
    /// Debug dump with nothing worth showing.
    Suppressed,
}

pub fn classify(event: &OutputEvent) -> Classification {
    match event {
        OutputEvent::Exit { code, signal } => plain(OutputKind::Exit, exit_message(*code, signal.as_deref())),
        OutputEvent::Error { error } => plain(OutputKind::Error, format!("Error: {error}")),
        OutputEvent::System { data } => plain(OutputKind::System, data.clone()),
        other => classify_output(other.kind(), other.data().unwrap_or_default()),
    }
}

pub fn classify_output(kind: OutputKind, data: &str) -> Classification {
    if is_debug_output(data) {
        return match extract_from_debug(data) {
            Some(response) => Classification::AgentResponse(response),
            None => Classification::Suppressed,
        };
    }

    if kind == OutputKind::Stdout {
        if has_markdown_hints(data) {
            return Classification::AgentResponse(AgentResponse {
                text: data.to_string(),
                debug: None,
                rule: "markdown-hints",
            });
        }
        if looks_like_agent_response(data) {
            return Classification::AgentResponse(AgentResponse {
                text: data.to_string(),
                debug: None,
                rule: "prose",
            });
        }
    }

    Classification::Plain(PlainOutput {
        kind,
        text: data.to_string(),
        json: pretty_json(data),
        is_code: is_code(kind, data),
    })
}

/// Dumps of a result object or a labelled result dictionary.
pub fn is_debug_output(data: &str) -> bool {
    let run_result = data.contains("AgentRunResult(")
        || (data.contains("Result type:")
            && (data.contains("AgentRunResult") || data.contains("pydantic_ai.agent")));
    let result_dict = data.contains("Result dict:") && data.contains('{') && data.contains('}');
    run_result || result_dict
}

pub fn extract_from_debug(data: &str) -> Option<AgentResponse> {
    for rule in rules() {
        if let Some(found) = rule.extract(data) {
            return Some(AgentResponse {
                text: normalize_response(found),
                debug: debug_block(data),
                rule: rule.name,
            });
        }
    }

    if let Some(found) = LABELED_DATA
        .captures(data)
        .and_then(|caps| caps.get(1))
        .filter(|m| !m.as_str().trim().is_empty())
    {
        return Some(AgentResponse {
            text: normalize_response(found.as_str()),
            debug: None,
            rule: "labeled-data",
        });
    }

    if let Some(tail) = find_reply(data) {
        let text = normalize_scanned(&strip_debug_labels(tail));
        if !text.is_empty() {
            return Some(AgentResponse {
                text,
                debug: None,
                rule: "reply-opener",
            });
        }
    }

    let stripped = strip_debug_labels(data);
    let text = stripped
        .split("\n\n")
        .map(str::trim)
        .filter(|para| !para.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    if text.is_empty() {
        return None;
    }
    Some(AgentResponse {
        text,
        debug: None,
        rule: "strip-debug-labels",
    })
}

pub fn strip_debug_labels(data: &str) -> String {
    let without_block = RESULT_TYPE_BLOCK.replace_all(data, "");
    let without_labels = DEBUG_LABEL_LINE.replace_all(&without_block, "");
    collapse_blank_lines(&without_labels).trim().to_string()
}

pub fn has_markdown_hints(data: &str) -> bool {
    if data.contains("##") || data.contains("```") || data.contains("Agent:") {
        return true;
    }
    data.lines().any(|line| {
        let line = line.trim_start();
        line.starts_with("- ") || line.starts_with("* ") || is_numbered_item(line)
    })
}

pub fn looks_like_agent_response(data: &str) -> bool {
    data.contains("I can help")
        || data.contains("Here's")
        || data.contains("Let me")
        || (data.chars().count() > 100 && data.contains('.'))
}

fn is_numbered_item(line: &str) -> bool {
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    digits > 0 && line[digits..].starts_with(". ")
}

fn is_code(kind: OutputKind, data: &str) -> bool {
    data.contains("```")
        || (kind == OutputKind::Stdout
            && (data.contains("function ") || data.contains("class ") || data.contains("import ")))
}

fn pretty_json(data: &str) -> Option<String> {
    let trimmed = data.trim();
    let framed = (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'));
    if !framed {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    serde_json::to_string_pretty(&value).ok()
}

fn debug_block(data: &str) -> Option<DebugBlock> {
    DEBUG_DICT
        .captures(data)
        .and_then(|caps| caps.get(1))
        .map(|m| DebugBlock::from_literal(m.as_str()))
}

fn find_reply(data: &str) -> Option<&str> {
    let mut offset = 0;
    for line in data.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let is_label = DEBUG_LABELS.iter().any(|label| trimmed.starts_with(label));
        if !is_label && REPLY_OPENERS.iter().any(|opener| trimmed.starts_with(opener)) {
            let start = offset + (line.len() - trimmed.len());
            return Some(&data[start..]);
        }
        offset += line.len();
    }
    None
}

fn exit_message(code: Option<i32>, signal: Option<&str>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("Agent process exited with code {code}"),
        (None, Some(signal)) => format!("Agent process terminated by {signal}"),
        (None, None) => "Agent process exited".to_string(),
    }
}

fn plain(kind: OutputKind, text: String) -> Classification {
    Classification::Plain(PlainOutput {
        kind,
        text,
        json: None,
        is_code: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(data: &str) -> AgentResponse {
        match classify(&OutputEvent::stdout(data)) {
            Classification::AgentResponse(response) => response,
            other => panic!("expected agent response, got {other:?}"),
        }
    }

    #[test]
    fn extracts_data_from_agent_run_result() {
        let found = response("Agent result: AgentRunResult(data='Hello world')");
        assert_eq!(found.text, "Hello world");
        assert_eq!(found.rule, "agent-run-result");
        assert!(found.debug.is_none());
    }

    #[test]
    fn attaches_result_dict_as_json_debug_block() {
        let found = response(
            "Agent result: AgentRunResult(data='Hello world. How can I help?')\nResult dict: {'data': 'Hello world. How can I help?', 'cost': None}",
        );
        assert_eq!(found.text, "Hello world.\n\nHow can I help?");
        let debug = found.debug.as_ref().expect("debug block");
        assert!(debug.is_json);
        let value: Value = serde_json::from_str(&debug.content).expect("json");
        assert_eq!(value["cost"], Value::Null);
        assert!(found.to_markdown().contains("<summary>Debug Information</summary>"));
    }

    #[test]
    fn loose_rule_accepts_double_quotes_and_extra_fields() {
        let found = response(r#"Result: AgentRunResult(data="All done.", cost=None)"#);
        assert_eq!(found.text, "All done.");
        assert_eq!(found.rule, "agent-run-result-loose");
    }

    #[test]
    fn data_field_rule_reads_result_dict() {
        let found = response("Result dict: {'data': 'From dict', 'cost': None}");
        assert_eq!(found.text, "From dict");
        assert_eq!(found.rule, "data-field");
        assert!(found.debug.is_some());
    }

    #[test]
    fn agent_prefix_rule_stops_at_blank_line() {
        let found = response(
            "Result type: <class 'pydantic_ai.agent.AgentRunResult'>\nAgent: Sure thing\n\ntrailing noise",
        );
        assert_eq!(found.text, "Sure thing");
        assert_eq!(found.rule, "agent-prefix");
    }

    #[test]
    fn falls_back_to_reply_opener() {
        let found = response(
            "Result type: <class 'pydantic_ai.agent.AgentRunResult'>\nResult dir: ['data']\nHere is the summary. It works.\n",
        );
        assert_eq!(found.rule, "reply-opener");
        assert_eq!(found.text, "Here is the summary.\n\nIt works.");
    }

    #[test]
    fn falls_back_to_stripping_labels() {
        let found = response(
            "Result type: <class 'pydantic_ai.agent.AgentRunResult'>\nResult dir: ['data']\n42 widgets processed\n",
        );
        assert_eq!(found.rule, "strip-debug-labels");
        assert_eq!(found.text, "42 widgets processed");
    }

    #[test]
    fn empty_debug_dump_is_suppressed() {
        let event = OutputEvent::stdout(
            "Result type: <class 'pydantic_ai.agent.AgentRunResult'>\nResult dir: []\n",
        );
        assert_eq!(classify(&event), Classification::Suppressed);
    }

    #[test]
    fn markdown_stdout_is_an_agent_response() {
        let found = response("## Plan\n- fetch\n- summarize");
        assert_eq!(found.rule, "markdown-hints");
        assert_eq!(found.text, "## Plan\n- fetch\n- summarize");
    }

    #[test]
    fn long_prose_is_an_agent_response() {
        let text = "The weather service returned a forecast for tomorrow with light rain in the morning and clear skies later on.";
        assert_eq!(response(text).rule, "prose");
    }

    #[test]
    fn prose_on_stderr_stays_plain() {
        let event = OutputEvent::from_stderr("Here's a warning from the runtime about retries.");
        match classify(&event) {
            Classification::Plain(plain) => assert_eq!(plain.kind, OutputKind::Stderr),
            other => panic!("expected plain output, got {other:?}"),
        }
    }

    #[test]
    fn short_stdout_is_plain_and_json_is_pretty_printed() {
        match classify(&OutputEvent::stdout("ready\n")) {
            Classification::Plain(plain) => {
                assert_eq!(plain.text, "ready\n");
                assert!(plain.json.is_none());
            }
            other => panic!("expected plain output, got {other:?}"),
        }
        match classify(&OutputEvent::stdout(r#"{"a": 1}"#)) {
            Classification::Plain(plain) => {
                assert_eq!(plain.json.as_deref(), Some("{\n  \"a\": 1\n}"));
            }
            other => panic!("expected plain output, got {other:?}"),
        }
    }

    #[test]
    fn exit_and_error_render_as_messages() {
        let exit = classify(&OutputEvent::Exit {
            code: Some(0),
            signal: None,
        });
        let Classification::Plain(exit) = exit else {
            panic!("expected plain exit");
        };
        assert_eq!(exit.text, "Agent process exited with code 0");

        let killed = classify(&OutputEvent::Exit {
            code: None,
            signal: Some("SIGTERM".to_string()),
        });
        let Classification::Plain(killed) = killed else {
            panic!("expected plain exit");
        };
        assert_eq!(killed.text, "Agent process terminated by SIGTERM");

        let Classification::Plain(error) = classify(&OutputEvent::error("spawn python ENOENT"))
        else {
            panic!("expected plain error");
        };
        assert_eq!(error.text, "Error: spawn python ENOENT");
    }

    #[test]
    fn rules_are_ordered_most_specific_first() {
        let names: Vec<_> = rules().iter().map(|rule| rule.name).collect();
        assert_eq!(
            names,
            ["agent-run-result", "agent-run-result-loose", "data-field", "agent-prefix"]
        );
    }
}
