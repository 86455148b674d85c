use std::sync::LazyLock;

use regex::Regex;

static URL_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"https?://\S+").ok());

/// Extract every `http://` / `https://` link from a message body.
///
/// A link runs from its scheme up to the first whitespace. Links are
/// returned in order of appearance and duplicates are kept.
pub fn extract_links(text: &str) -> Vec<String> {
    let Some(pattern) = URL_PATTERN.as_ref() else {
        return Vec::new();
    };
    pattern
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Conversation type derived from the channel identifier suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Group,
    Direct,
}

impl ChannelKind {
    const GROUP_SUFFIX: &'static str = "@g.us";

    pub fn of(identifier: &str) -> Self {
        if identifier.ends_with(Self::GROUP_SUFFIX) {
            Self::Group
        } else {
            Self::Direct
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Direct => "direct",
        }
    }
}
