//! Text cleanup applied right before a unit is sent for synthesis.
//!
//! Units keep the text the user sees in the chat; this filter rewrites it
//! into what should actually be spoken: markdown markers, URLs, filesystem
//! paths and log tags are dropped or replaced with short spoken phrases.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::SpeechConfig;

static MD_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\((https?://[^)]+)\)").unwrap());
static MD_BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").unwrap());
static MD_ITALIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*\s](?:[^*]*[^*\s])?)\*").unwrap());
static MD_UNDERSCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[\s(])_([^_\s](?:[^_]*[^_\s])?)_").unwrap());
static INLINE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]+)`").unwrap());
static URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());
static UI_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(you|doris)\s*:\s*").unwrap());
static BRACKET_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[[A-Z _-]{3,}\]").unwrap());
static FS_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)(?:/[^\s/]+){2,}/?").unwrap());
static HASHTAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#([A-Za-z0-9_]+)").unwrap());
static BULLET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*[-*•]+\s+").unwrap());
static EXCLAIM_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[!?]{3,}").unwrap());
static DOT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.{3,}").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, Clone, Default)]
pub struct SpeechFilter {
    config: SpeechConfig,
}

impl SpeechFilter {
    pub fn new(config: SpeechConfig) -> Self {
        Self { config }
    }

    /// Rewrite `text` for speaking. May return an empty string.
    pub fn apply(&self, text: &str) -> String {
        let mut t = text.to_string();

        if self.config.strip_markdown {
            t = MD_LINK.replace_all(&t, "$1").into_owned();
            t = MD_BOLD.replace_all(&t, "$1").into_owned();
            t = MD_ITALIC.replace_all(&t, "$1").into_owned();
            t = MD_UNDERSCORE.replace_all(&t, "$1$2").into_owned();
        }

        if self.config.strip_inline_code {
            t = INLINE_CODE.replace_all(&t, "$1").into_owned();
        }

        if self.config.strip_urls {
            t = URL.replace_all(&t, " ").into_owned();
        }

        t = UI_LABEL.replace(&t, "").into_owned();
        t = BRACKET_TAG.replace_all(&t, " Notice:").into_owned();
        t = FS_PATH.replace_all(&t, "${1}a file path").into_owned();
        t = HASHTAG.replace_all(&t, "$1").into_owned();
        t = t.replace('#', " ");

        if self.config.speak_lists_as_sentences {
            t = number_bullets(&t);
        }

        t = t.replace('*', " ");

        if self.config.normalize_punctuation {
            t = t.replace('…', ".");
            t = EXCLAIM_RUN.replace_all(&t, "!").into_owned();
            t = DOT_RUN.replace_all(&t, ".").into_owned();
        }

        WHITESPACE.replace_all(&t, " ").trim().to_string()
    }
}

/// "- milk\n- eggs" becomes "1. milk\n2. eggs".
fn number_bullets(text: &str) -> String {
    let mut n = 1;
    text.lines()
        .map(|line| {
            if BULLET.is_match(line) {
                let item = BULLET.replace(line, "");
                let numbered = format!("{n}. {}", item.trim());
                n += 1;
                numbered
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
