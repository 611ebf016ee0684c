//! Failure classification for outbound reply delivery.
//!
//! Every sender failure lands in one of three classes. Permanent failures are
//! surfaced immediately, definitive transient failures are retried inline with
//! backoff, and ambiguous failures (the peer may already have the message) are
//! recorded as `uncertain` and left to the recovery loop.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Code attached to failures produced by our own per-attempt timeout.
pub const LOCAL_TIMEOUT_CODE: &str = "TAU_LOCAL_TIMEOUT";

const AMBIGUOUS_CODES: &[&str] = &[
    "ECONNRESET",
    "EPIPE",
    "ECONNABORTED",
    "ETIMEDOUT",
    "ESOCKETTIMEDOUT",
    "UND_ERR_SOCKET",
    "UND_ERR_HEADERS_TIMEOUT",
    "UND_ERR_BODY_TIMEOUT",
    "ERR_STREAM_PREMATURE_CLOSE",
    "ABORT_ERR",
    LOCAL_TIMEOUT_CODE,
];

const DEFINITIVE_CODES: &[&str] = &[
    "ECONNREFUSED",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EHOSTUNREACH",
    "ENETUNREACH",
    "ENETDOWN",
    "EHOSTDOWN",
    "UND_ERR_CONNECT_TIMEOUT",
];

/// Failure raised by a channel sender.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ChannelDeliveryError {
    pub message: String,
    /// Errno-style code such as `ECONNREFUSED`.
    pub code: Option<String>,
    pub http_status: Option<u16>,
    /// Provider-supplied backoff hint (for example `Retry-After`).
    pub retry_after: Option<Duration>,
    /// Explicit caller-side fault marker set by senders that know better.
    pub permanent: bool,
    pub timed_out_locally: bool,
    #[source]
    pub cause: Option<Box<ChannelDeliveryError>>,
}

impl ChannelDeliveryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            http_status: None,
            retry_after: None,
            permanent: false,
            timed_out_locally: false,
            cause: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            permanent: true,
            ..Self::new(message)
        }
    }

    /// Failure produced when our own attempt budget elapsed.
    pub fn local_timeout(budget: Duration) -> Self {
        Self {
            code: Some(LOCAL_TIMEOUT_CODE.to_string()),
            timed_out_locally: true,
            ..Self::new(format!(
                "delivery attempt timed out after {}ms",
                budget.as_millis()
            ))
        }
    }

    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            http_status: Some(status),
            ..Self::new(format!("provider returned status {status}: {}", body.into()))
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_cause(mut self, cause: ChannelDeliveryError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Iterates over this error and its nested causes.
    pub fn chain(&self) -> impl Iterator<Item = &ChannelDeliveryError> {
        std::iter::successors(Some(self), |error| error.cause.as_deref())
    }

    /// Renders the text stored as `last_error` on delivery records.
    pub fn detail(&self) -> String {
        let mut detail = self.message.clone();
        if let Some(code) = self.code.as_deref() {
            detail.push_str(&format!(" code={code}"));
        }
        if let Some(status) = self.http_status {
            detail.push_str(&format!(" status={status}"));
        }
        if let Some(cause) = self.cause.as_deref() {
            detail.push_str(&format!(" cause=({})", cause.detail()));
        }
        detail
    }

    /// Classifies using the local-timeout flag recorded on the error.
    pub fn classify(&self) -> DeliveryErrorClass {
        classify_delivery_error(self, self.timed_out_locally)
    }
}

/// Failure taxonomy used by the dispatcher and the recovery loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryErrorClass {
    /// Caller-side fault; never retried.
    Permanent,
    /// No bytes reached the peer or the peer explicitly asked us to back off.
    TransientDefinitive,
    /// The peer may have received the request; outcome unknown.
    TransientAmbiguous,
}

impl DeliveryErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::TransientDefinitive => "transient_definitive",
            Self::TransientAmbiguous => "transient_ambiguous",
        }
    }

    /// Only definitive transient failures are safe to retry inside a live dispatcher.
    pub fn should_retry_inline(self) -> bool {
        matches!(self, Self::TransientDefinitive)
    }
}

/// Maps one sender failure to a [`DeliveryErrorClass`].
///
/// `local_timeout_fired` must be true when the failure was produced by our own
/// attempt timeout; such failures are ambiguous regardless of their text.
pub fn classify_delivery_error(
    error: &ChannelDeliveryError,
    local_timeout_fired: bool,
) -> DeliveryErrorClass {
    if is_permanent_failure(error) {
        return DeliveryErrorClass::Permanent;
    }
    if local_timeout_fired
        || error
            .chain()
            .any(|entry| entry.timed_out_locally || code_in(entry, AMBIGUOUS_CODES))
    {
        return DeliveryErrorClass::TransientAmbiguous;
    }
    if error.chain().any(|entry| {
        code_in(entry, DEFINITIVE_CODES) || entry.http_status.is_some_and(is_retryable_status)
    }) {
        return DeliveryErrorClass::TransientDefinitive;
    }
    classify_by_message(error).unwrap_or(DeliveryErrorClass::Permanent)
}

fn is_permanent_failure(error: &ChannelDeliveryError) -> bool {
    if error.permanent {
        return true;
    }
    if error
        .http_status
        .is_some_and(|status| (400..500).contains(&status) && !is_retryable_status(status))
    {
        return true;
    }
    permanent_text_pattern().is_match(&error.message)
}

fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

fn code_in(error: &ChannelDeliveryError, codes: &[&str]) -> bool {
    error
        .code
        .as_deref()
        .map(|code| codes.iter().any(|known| code.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

fn classify_by_message(error: &ChannelDeliveryError) -> Option<DeliveryErrorClass> {
    for entry in error.chain() {
        let message = entry.message.as_str();
        if connect_failure_pattern().is_match(message) {
            return Some(DeliveryErrorClass::TransientDefinitive);
        }
        if ambiguous_failure_pattern().is_match(message) {
            return Some(DeliveryErrorClass::TransientAmbiguous);
        }
        if definitive_failure_pattern().is_match(message) {
            return Some(DeliveryErrorClass::TransientDefinitive);
        }
    }
    None
}

fn permanent_text_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\b(disabled|unauthori[sz]ed|forbidden|chat not found|bot was blocked|user is deactivated|invalid (recipient|token|payload|request|chat))\b",
        )
        .expect("permanent delivery failure pattern compiles")
    })
}

fn connect_failure_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(connection refused|connect(ion)? (error|failed|timed? ?out)|failed to connect|error trying to connect|dns (error|lookup)|getaddrinfo|name resolution|(host|network) (is )?unreachable)",
        )
        .expect("connect failure pattern compiles")
    })
}

fn ambiguous_failure_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(socket hang up|connection reset|reset by peer|\breset\b|\baborted\b|premature close|broken pipe|timed? ?out|timeout)",
        )
        .expect("ambiguous failure pattern compiles")
    })
}

fn definitive_failure_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(rate.?limit|too many requests|\b5\d\d\b|service unavailable|bad gateway|overloaded|temporarily unavailable|network)",
        )
        .expect("definitive failure pattern compiles")
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{classify_delivery_error, ChannelDeliveryError, DeliveryErrorClass};

    fn classify(error: ChannelDeliveryError) -> DeliveryErrorClass {
        error.classify()
    }

    #[test]
    fn unit_connection_refused_code_is_definitive() {
        let error = ChannelDeliveryError::new("connect failed").with_code("ECONNREFUSED");
        assert_eq!(classify(error), DeliveryErrorClass::TransientDefinitive);
    }

    #[test]
    fn unit_reset_code_is_ambiguous() {
        let error = ChannelDeliveryError::new("socket closed").with_code("ECONNRESET");
        assert_eq!(classify(error), DeliveryErrorClass::TransientAmbiguous);
    }

    #[test]
    fn unit_local_timeout_is_ambiguous_even_without_code() {
        let error = ChannelDeliveryError::new("provider stalled");
        assert_eq!(
            classify_delivery_error(&error, true),
            DeliveryErrorClass::TransientAmbiguous
        );
        assert_eq!(
            classify(ChannelDeliveryError::local_timeout(Duration::from_millis(5_000))),
            DeliveryErrorClass::TransientAmbiguous
        );
    }

    #[test]
    fn unit_status_codes_split_permanent_and_definitive() {
        assert_eq!(
            classify(ChannelDeliveryError::from_status(400, "bad request")),
            DeliveryErrorClass::Permanent
        );
        assert_eq!(
            classify(ChannelDeliveryError::from_status(404, "missing")),
            DeliveryErrorClass::Permanent
        );
        for status in [408_u16, 429, 500, 502, 503] {
            assert_eq!(
                classify(ChannelDeliveryError::from_status(status, "retry later")),
                DeliveryErrorClass::TransientDefinitive,
                "status {status}"
            );
        }
    }

    #[test]
    fn functional_permanent_markers_take_precedence_over_transient_codes() {
        let error = ChannelDeliveryError::new("channel disabled for account").with_code("ECONNRESET");
        assert_eq!(classify(error), DeliveryErrorClass::Permanent);

        let explicit = ChannelDeliveryError::permanent("rejected").with_code("ECONNREFUSED");
        assert_eq!(classify(explicit), DeliveryErrorClass::Permanent);
    }

    #[test]
    fn functional_ambiguous_codes_take_precedence_over_definitive_codes() {
        let error = ChannelDeliveryError::new("request failed")
            .with_code("ECONNREFUSED")
            .with_cause(ChannelDeliveryError::new("inner").with_code("EPIPE"));
        assert_eq!(classify(error), DeliveryErrorClass::TransientAmbiguous);
    }

    #[test]
    fn functional_nested_cause_codes_are_inspected() {
        let error = ChannelDeliveryError::new("fetch failed")
            .with_cause(ChannelDeliveryError::new("getaddrinfo").with_code("ENOTFOUND"));
        assert_eq!(classify(error), DeliveryErrorClass::TransientDefinitive);
    }

    #[test]
    fn functional_message_heuristics_distinguish_connect_from_reset() {
        assert_eq!(
            classify(ChannelDeliveryError::new("error trying to connect: tcp refused")),
            DeliveryErrorClass::TransientDefinitive
        );
        assert_eq!(
            classify(ChannelDeliveryError::new("connect timeout after 3s")),
            DeliveryErrorClass::TransientDefinitive
        );
        assert_eq!(
            classify(ChannelDeliveryError::new("socket hang up")),
            DeliveryErrorClass::TransientAmbiguous
        );
        assert_eq!(
            classify(ChannelDeliveryError::new("request timed out")),
            DeliveryErrorClass::TransientAmbiguous
        );
        assert_eq!(
            classify(ChannelDeliveryError::new("Rate limit exceeded")),
            DeliveryErrorClass::TransientDefinitive
        );
        assert_eq!(
            classify(ChannelDeliveryError::new("upstream said 503")),
            DeliveryErrorClass::TransientDefinitive
        );
    }

    #[test]
    fn regression_unknown_failures_default_to_permanent() {
        assert_eq!(
            classify(ChannelDeliveryError::new("unexpected payload shape")),
            DeliveryErrorClass::Permanent
        );
        assert!(!DeliveryErrorClass::Permanent.should_retry_inline());
        assert!(!DeliveryErrorClass::TransientAmbiguous.should_retry_inline());
        assert!(DeliveryErrorClass::TransientDefinitive.should_retry_inline());
    }

    #[test]
    fn unit_detail_includes_code_status_and_cause() {
        let error = ChannelDeliveryError::from_status(502, "gateway")
            .with_code("EPROTO")
            .with_cause(ChannelDeliveryError::new("inner"));
        let detail = error.detail();
        assert!(detail.contains("status=502"));
        assert!(detail.contains("code=EPROTO"));
        assert!(detail.contains("cause=(inner)"));
    }
}
