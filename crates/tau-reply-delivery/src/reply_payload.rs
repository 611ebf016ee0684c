//! Reply payload model shared by the dispatcher, the durable store, and senders.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Ordering class of one reply payload inside a dispatcher.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DispatchKind {
    /// Intermediate tool-execution notice.
    Tool,
    /// Incremental progress reply.
    Block,
    /// Terminal reply of the conversation turn.
    Final,
}

impl DispatchKind {
    pub const ALL: [DispatchKind; 3] = [Self::Tool, Self::Block, Self::Final];

    /// Returns the stable wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Block => "block",
            Self::Final => "final",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tool" => Some(Self::Tool),
            "block" => Some(Self::Block),
            "final" => Some(Self::Final),
            _ => None,
        }
    }
}

/// One deliverable unit of agent output.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    /// Send audio media as a voice note where the channel supports it.
    #[serde(default)]
    pub audio_as_voice: bool,
    /// Play video media as a looping clip where the channel supports it.
    #[serde(default)]
    pub gif_playback: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub channel_data: BTreeMap<String, Value>,
}

impl ReplyPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn media(url: impl Into<String>) -> Self {
        Self {
            media_urls: vec![url.into()],
            ..Self::default()
        }
    }

    pub fn with_media(mut self, url: impl Into<String>) -> Self {
        self.media_urls.push(url.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to_id: impl Into<String>) -> Self {
        self.reply_to_id = Some(reply_to_id.into());
        self
    }

    pub fn has_text(&self) -> bool {
        self.text
            .as_deref()
            .map(|text| !text.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn has_media(&self) -> bool {
        self.media_urls.iter().any(|url| !url.trim().is_empty())
    }

    /// Returns true when there is nothing left to deliver.
    pub fn is_empty(&self) -> bool {
        !self.has_text() && !self.has_media()
    }

    /// Computes the deduplication identity over the normalized projection of
    /// text, media list, and reply-to id. Channel hints are excluded.
    pub fn identity_key(&self) -> String {
        let text = self
            .text
            .as_deref()
            .map(collapse_whitespace)
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(b"text:");
        hasher.update(text.as_bytes());
        hasher.update([0_u8]);
        for url in self
            .media_urls
            .iter()
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
        {
            hasher.update(b"media:");
            hasher.update(url.as_bytes());
            hasher.update([0_u8]);
        }
        hasher.update(b"reply_to:");
        hasher.update(self.reply_to_id.as_deref().unwrap_or("").trim().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Short human-readable summary used in log lines and CLI listings.
    pub fn preview(&self, max_chars: usize) -> String {
        let text = self
            .text
            .as_deref()
            .map(collapse_whitespace)
            .unwrap_or_default();
        let mut preview = text.chars().take(max_chars).collect::<String>();
        if text.chars().count() > max_chars {
            preview.push_str("...");
        }
        if !self.media_urls.is_empty() {
            if !preview.is_empty() {
                preview.push(' ');
            }
            preview.push_str(&format!("[media x{}]", self.media_urls.len()));
        }
        preview
    }
}

/// Destination binding for one dispatcher instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DurableRoute {
    pub channel: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Reply-to id applied to payloads that do not carry their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub best_effort: bool,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub gif_playback: bool,
}

impl DurableRoute {
    pub fn new(channel: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            to: to.into(),
            account_id: None,
            thread_id: None,
            reply_to_id: None,
            best_effort: false,
            silent: false,
            gif_playback: false,
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to_id: impl Into<String>) -> Self {
        self.reply_to_id = Some(reply_to_id.into());
        self
    }

    /// Applies route-level defaults to a payload before it is persisted or sent.
    pub fn apply_defaults(&self, payload: &ReplyPayload) -> ReplyPayload {
        let mut resolved = payload.clone();
        if resolved.reply_to_id.is_none() {
            resolved.reply_to_id = self.reply_to_id.clone();
        }
        if self.gif_playback {
            resolved.gif_playback = true;
        }
        resolved
    }

    /// Returns `channel:to` with optional account and thread scoping.
    pub fn describe(&self) -> String {
        let mut label = format!("{}:{}", self.channel, self.to);
        if let Some(account_id) = self.account_id.as_deref() {
            label.push_str(&format!(" account={account_id}"));
        }
        if let Some(thread_id) = self.thread_id.as_deref() {
            label.push_str(&format!(" thread={thread_id}"));
        }
        label
    }
}

pub(crate) fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
