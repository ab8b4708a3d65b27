//! Cleanup applied to text recovered from an agent's debug dump before it is
//! rendered as markdown.

use std::sync::LazyLock;

use regex::Regex;

static NUMBERED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(\d+)\.[ \t]+").expect("valid regex"));
static BULLET_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^-[ \t]*").expect("valid regex"));
// Sentence end after a word (not a list number), then a capitalized word on the same line.
static SENTENCE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([a-z)\]"'][.!?])[ \t]+([A-Z])"#).expect("valid regex"));
static HEADING_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([A-Z][A-Za-z ]{0,48}):[ \t]*$").expect("valid regex"));
static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Turns literal escape sequences from a repr dump into real characters.
pub fn unescape_repr(text: &str) -> String {
    text.replace("\\n", "\n")
        .replace("\\'", "'")
        .replace("\\\"", "\"")
        .replace("\\t", "  ")
}

pub fn normalize_lists(text: &str) -> String {
    let text = NUMBERED_ITEM.replace_all(text, "${1}. ");
    BULLET_ITEM.replace_all(&text, "- ").into_owned()
}

pub fn insert_paragraph_breaks(text: &str) -> String {
    SENTENCE_BREAK
        .replace_all(text, "${1}\n\n${2}")
        .into_owned()
}

pub fn promote_headings(text: &str) -> String {
    HEADING_LINE.replace_all(text, "## ${1}").into_owned()
}

pub fn collapse_blank_lines(text: &str) -> String {
    BLANK_RUNS.replace_all(text, "\n\n").into_owned()
}

/// Full pipeline for a response pulled out by an extraction rule.
pub fn normalize_response(raw: &str) -> String {
    let text = unescape_repr(raw);
    let text = normalize_lists(text.trim());
    let text = insert_paragraph_breaks(&text);
    promote_headings(&text)
}

/// Pipeline for free text found by scanning, which skips heading promotion.
pub fn normalize_scanned(raw: &str) -> String {
    let text = unescape_repr(raw);
    let text = normalize_lists(text.trim());
    insert_paragraph_breaks(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescapes_repr_sequences() {
        assert_eq!(
            unescape_repr(r#"line one\nit\'s \"quoted\"\tend"#),
            "line one\nit's \"quoted\"  end"
        );
    }

    #[test]
    fn splits_sentences_into_paragraphs() {
        assert_eq!(
            insert_paragraph_breaks("Hello there. This is a test! Next"),
            "Hello there.\n\nThis is a test!\n\nNext"
        );
    }

    #[test]
    fn no_break_after_numbers_or_capitalised_words() {
        let text = "It costs 5. Then it ships. Made in the USA. Next year too.";
        assert_eq!(
            insert_paragraph_breaks(text),
            "It costs 5. Then it ships.\n\nMade in the USA. Next year too."
        );
    }

    #[test]
    fn numbered_items_are_not_split() {
        let text = normalize_response("Steps:\n1.  Open the file\n2. Save it");
        assert_eq!(text, "## Steps\n1. Open the file\n2. Save it");
    }

    #[test]
    fn bullets_get_a_single_space() {
        assert_eq!(normalize_lists("-first\n-   second"), "- first\n- second");
    }

    #[test]
    fn long_label_lines_stay_plain() {
        let line = "This line is far too long to be considered a heading by anyone reading:";
        assert_eq!(promote_headings(line), line);
    }

    #[test]
    fn collapses_three_or_more_newlines() {
        assert_eq!(collapse_blank_lines("a\n\n\n\nb"), "a\n\nb");
    }
}
