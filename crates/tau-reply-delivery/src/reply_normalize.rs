//! Reply normalization applied before a payload enters the dispatch queue.
//!
//! Strips inline control markers, drops heartbeat/silent-only replies, and
//! applies the configured response prefix template.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::reply_payload::{DispatchKind, ReplyPayload};

pub const DEFAULT_HEARTBEAT_TOKEN: &str = "HEARTBEAT_OK";
pub const DEFAULT_SILENT_TOKEN: &str = "NO_REPLY";

/// Why a payload settled as `skipped` without reaching the sender.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// Neither text nor media to deliver.
    Empty,
    /// Only control markers, heartbeat, or silent tokens were present.
    MarkerOnly,
    /// Same identity key already sent or pending in this dispatcher.
    DuplicateSeen,
    /// Enqueued after `mark_complete()`.
    DispatcherComplete,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::MarkerOnly => "marker-only",
            Self::DuplicateSeen => "duplicate-seen",
            Self::DispatcherComplete => "dispatcher-complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeOutcome {
    Accept(ReplyPayload),
    Skip(SkipReason),
}

/// Pure payload transform consulted for every enqueue.
pub trait ReplyNormalizer: Send + Sync {
    fn normalize(&self, kind: DispatchKind, payload: ReplyPayload) -> NormalizeOutcome;
}

/// Values available to response prefix templates and reply directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyNormalizeContext {
    pub model: Option<String>,
    pub provider: Option<String>,
    pub agent: Option<String>,
    /// Inbound message id targeted by `[[reply_to_current]]`.
    pub current_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultReplyNormalizer {
    pub response_prefix: Option<String>,
    pub heartbeat_token: String,
    pub silent_token: String,
    pub context: ReplyNormalizeContext,
}

impl Default for DefaultReplyNormalizer {
    fn default() -> Self {
        Self {
            response_prefix: None,
            heartbeat_token: DEFAULT_HEARTBEAT_TOKEN.to_string(),
            silent_token: DEFAULT_SILENT_TOKEN.to_string(),
            context: ReplyNormalizeContext::default(),
        }
    }
}

impl DefaultReplyNormalizer {
    pub fn with_response_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.response_prefix = if prefix.trim().is_empty() {
            None
        } else {
            Some(prefix)
        };
        self
    }

    pub fn with_context(mut self, context: ReplyNormalizeContext) -> Self {
        self.context = context;
        self
    }

    fn rendered_prefix(&self) -> Option<String> {
        let template = self.response_prefix.as_deref()?;
        let mut values = BTreeMap::new();
        if let Some(model) = self.context.model.as_deref() {
            values.insert("model", model);
        }
        if let Some(provider) = self.context.provider.as_deref() {
            values.insert("provider", provider);
        }
        if let Some(agent) = self.context.agent.as_deref() {
            values.insert("agent", agent);
        }
        let rendered = template_placeholder_pattern()
            .replace_all(template, |captures: &Captures<'_>| {
                let key = captures.get(1).map(|value| value.as_str()).unwrap_or("");
                match values.get(key) {
                    Some(value) => (*value).to_string(),
                    None => captures
                        .get(0)
                        .map(|value| value.as_str().to_string())
                        .unwrap_or_default(),
                }
            })
            .into_owned();
        if rendered.trim().is_empty() {
            None
        } else {
            Some(rendered)
        }
    }
}

impl ReplyNormalizer for DefaultReplyNormalizer {
    fn normalize(&self, kind: DispatchKind, mut payload: ReplyPayload) -> NormalizeOutcome {
        if payload.is_empty() {
            return NormalizeOutcome::Skip(SkipReason::Empty);
        }
        payload.media_urls = payload
            .media_urls
            .into_iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();

        let mut stripped_marker = false;
        if let Some(text) = payload.text.take() {
            let mut reply_to_current = false;
            let mut reply_to = None;
            let mut audio_as_voice = false;
            let without_directives = reply_directive_pattern()
                .replace_all(&text, |captures: &Captures<'_>| {
                    if let Some(id) = captures.get(2) {
                        reply_to = Some(id.as_str().trim().to_string());
                    } else if captures
                        .get(1)
                        .is_some_and(|value| value.as_str().eq_ignore_ascii_case("audio_as_voice"))
                    {
                        audio_as_voice = true;
                    } else {
                        reply_to_current = true;
                    }
                    ""
                })
                .into_owned();
            if without_directives.len() != text.len() {
                stripped_marker = true;
            }
            if let Some(reply_to) = reply_to.filter(|value| !value.is_empty()) {
                payload.reply_to_id = Some(reply_to);
            } else if reply_to_current && payload.reply_to_id.is_none() {
                payload.reply_to_id = self.context.current_message_id.clone();
            }
            if audio_as_voice {
                payload.audio_as_voice = true;
            }

            let mut remaining = without_directives;
            if !self.heartbeat_token.is_empty() && remaining.contains(&self.heartbeat_token) {
                remaining = remaining.replace(&self.heartbeat_token, "");
                stripped_marker = true;
            }
            let trimmed = remaining.trim();
            if !self.silent_token.is_empty() && trimmed == self.silent_token {
                return NormalizeOutcome::Skip(SkipReason::MarkerOnly);
            }
            payload.text = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }

        if payload.is_empty() {
            return NormalizeOutcome::Skip(if stripped_marker {
                SkipReason::MarkerOnly
            } else {
                SkipReason::Empty
            });
        }

        if kind != DispatchKind::Tool {
            if let (Some(prefix), Some(text)) = (self.rendered_prefix(), payload.text.as_ref()) {
                if !text.starts_with(prefix.as_str()) {
                    payload.text = Some(format!("{prefix} {text}"));
                }
            }
        }
        NormalizeOutcome::Accept(payload)
    }
}

fn reply_directive_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\[\[\s*(reply_to_current|audio_as_voice|reply_to\s*:\s*([^\]]*?))\s*\]\]")
            .expect("reply directive pattern compiles")
    })
}

fn template_placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\s*([a-zA-Z_]+)\s*\}").expect("template placeholder pattern compiles")
    })
}
