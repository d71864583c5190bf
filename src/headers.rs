//! Parsing of legacy `Name: value` header blobs.

use crate::email::HeaderInput;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static NAMED_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?)\s*<(.+?)>$").expect("valid regex"));
static MEDIA_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^;]+)").expect("valid regex"));
static CHARSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)charset=([^\s;]+)").expect("valid regex"));

/// Headers recognised in the caller's input. Anything unrecognised lands in
/// `custom`, keyed by lower-cased name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedHeaders {
    pub from: String,
    pub from_name: String,
    pub reply_to: String,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub content_type: String,
    pub charset: String,
    pub custom: BTreeMap<String, String>,
}

impl ParsedHeaders {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Custom headers with names re-capitalised for transmission.
    #[must_use]
    pub fn transmit_headers(&self) -> BTreeMap<String, String> {
        self.custom
            .iter()
            .map(|(name, value)| (title_case(name), value.clone()))
            .collect()
    }
}

/// Parse a header blob or list. Lines without a colon are skipped.
#[must_use]
pub fn parse_headers(input: &HeaderInput) -> ParsedHeaders {
    let mut parsed = ParsedHeaders::default();

    for line in input.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_lowercase();
        let value = value.trim();
        if name.is_empty() {
            continue;
        }

        match name.as_str() {
            "from" => {
                if let Some(caps) = NAMED_ADDRESS.captures(value) {
                    parsed.from_name = caps[1].trim_matches([' ', '"']).to_string();
                    parsed.from = caps[2].to_string();
                } else {
                    parsed.from = value.to_string();
                    parsed.from_name.clear();
                }
            }
            "reply-to" => parsed.reply_to = value.to_string(),
            "cc" => parsed.cc.extend(split_address_list(value)),
            "bcc" => parsed.bcc.extend(split_address_list(value)),
            "content-type" => {
                if let Some(caps) = MEDIA_TYPE.captures(value) {
                    parsed.content_type = caps[1].trim().to_lowercase();
                }
                if let Some(caps) = CHARSET.captures(value) {
                    parsed.charset = caps[1].trim_matches('"').to_string();
                }
            }
            _ => {
                parsed.custom.insert(name, value.to_string());
            }
        }
    }

    parsed
}

fn split_address_list(list: &str) -> impl Iterator<Item = String> + '_ {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// `x-custom-id` becomes `X-Custom-Id`.
#[must_use]
pub fn title_case(name: &str) -> String {
    name.split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect::<Vec<_>>()
        .join("-")
}
