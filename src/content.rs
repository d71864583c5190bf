//! Derivation of alternate body parts.
//!
//! Both transforms are heuristic and regex based. They are meant for the
//! simple markup transactional mail usually carries, not arbitrary HTML.

use regex::Regex;
use std::sync::LazyLock;

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid regex")
}

static SCRIPT: LazyLock<Regex> = LazyLock::new(|| re(r"(?is)<script[^>]*>.*?</script>"));
static STYLE: LazyLock<Regex> = LazyLock::new(|| re(r"(?is)<style[^>]*>.*?</style>"));
static COMMENT: LazyLock<Regex> = LazyLock::new(|| re(r"(?s)<!--.*?-->"));
static BREAK: LazyLock<Regex> = LazyLock::new(|| re(r"(?i)<br\s*/?>"));
static BLOCK_END: LazyLock<Regex> = LazyLock::new(|| re(r"(?i)</(?:p|h[1-6])>"));
static ROW_END: LazyLock<Regex> = LazyLock::new(|| re(r"(?i)</(?:li|tr)>"));
static CELL_END: LazyLock<Regex> = LazyLock::new(|| re(r"(?i)</td>"));
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| re(r"<[^>]*>"));
static TAG_LIKE: LazyLock<Regex> = LazyLock::new(|| re(r"<[^>]+>"));
static HSPACE: LazyLock<Regex> = LazyLock::new(|| re(r"[ \t]+"));
static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| re(r"\n{3,}"));
static NEWLINE: LazyLock<Regex> = LazyLock::new(|| re(r"\r\n|\n\r|\n|\r"));

/// Plain-text rendition of an HTML body.
#[must_use]
pub fn html_to_text(html: &str) -> String {
    let text = SCRIPT.replace_all(html, "");
    let text = STYLE.replace_all(&text, "");
    let text = COMMENT.replace_all(&text, "");
    let text = BREAK.replace_all(&text, "\n");
    let text = BLOCK_END.replace_all(&text, "\n\n");
    let text = ROW_END.replace_all(&text, "\n");
    let text = CELL_END.replace_all(&text, "\t");
    let text = ANY_TAG.replace_all(&text, "");
    let text = html_escape::decode_html_entities(&text);
    let text = HSPACE.replace_all(&text, " ");
    let text = BLANK_RUN.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// True when the text contains something shaped like a markup tag.
#[must_use]
pub fn looks_like_html(text: &str) -> bool {
    TAG_LIKE.is_match(text)
}

/// Insert `<br />` before every line break. The text is not escaped.
#[must_use]
pub fn text_to_html(text: &str) -> String {
    NEWLINE.replace_all(text, "<br />$0").into_owned()
}
