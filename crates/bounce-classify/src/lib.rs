//! Classifies the error payload an ESP adapter (C7) receives for a failed
//! send into the normalized category set used by the dispatch pipeline
//! (§4.7 step 5): `hard_bounce`, `soft_bounce`, `throttle`, `auth`,
//! `invalid_address`, `network`, `unknown`.
//!
//! Every provider speaks a different dialect of error: SparkPost returns
//! a numeric `error_code` in its JSON body, SES returns an HTTP status and
//! an exception type, other providers just return free text. Rather than
//! hand-coding a `match` per provider, providers are classified with a
//! `RegexSet` over provider-supplied text, the same approach `kumod` uses
//! for SMTP response classification, just pointed at HTTP/JSON bounce
//! payloads instead of SMTP response lines.
use ordermap::OrderMap;
use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(
    Serialize,
    Deserialize,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Copy,
    Clone,
    Ord,
    PartialOrd,
    strum::EnumString,
    strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum SendErrorCategory {
    /// Permanent failure: mailbox does not exist, domain does not exist,
    /// policy rejection. No retry; triggers suppression.
    HardBounce,
    /// Transient failure: mailbox full, greylisting, temporary DNS issue.
    /// Retried with backoff up to `max_attempts`.
    SoftBounce,
    /// Provider-side rate limiting (429, "throttled", "rate exceeded").
    /// Retried with backoff; does not count against `max_attempts` the
    /// same way a content rejection would, but the dispatch worker does
    /// not special-case that here — see .
    Throttle,
    /// Credential/authorization failure with the ESP API itself (expired
    /// API key, revoked domain). Not a property of the recipient.
    Auth,
    /// The recipient address itself is malformed or was rejected by the
    /// provider as syntactically invalid. Terminal; triggers suppression.
    InvalidAddress,
    /// Connection refused, timeout, TLS failure talking to the provider.
    /// Retryable.
    Network,
    Unknown,
}

impl SendErrorCategory {
    /// Terminal categories end the queue item's retry loop immediately
    /// and call `suppress` with a derived suppression category
    /// (step 6).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::HardBounce | Self::InvalidAddress)
    }

    pub fn is_retryable(&self) -> bool {
        !self.is_terminal()
    }
}

/// Defines the content of a classifier rules file: each rule is a regex
/// matched (case-insensitively) against a normalized provider reason
/// string built from status code, provider error code, and message.
#[derive(Deserialize, Serialize, Debug)]
pub struct BounceClassifierFile {
    pub rules: OrderMap<SendErrorCategory, Vec<String>>,
}

/// Holds state for compiling rules files into a classifier.
#[derive(Default)]
pub struct BounceClassifierBuilder {
    rules: Vec<(SendErrorCategory, String)>,
}

impl BounceClassifierBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in rule set covering the handful of ESP dialects
    /// (SparkPost-style, SES-style) the adapter crate talks to. Loaded
    /// first so that a deployment's `merge_json_file` additions take
    /// precedence over (are matched before) these defaults.
    pub fn with_default_rules() -> Self {
        let mut b = Self::new();
        for (class, rule) in default_rules() {
            b.add_rule(class, rule.to_string());
        }
        b
    }

    pub fn add_rule(&mut self, class: SendErrorCategory, rule: String) {
        self.rules.push((class, rule));
    }

    pub fn merge(&mut self, decoded_file: BounceClassifierFile) {
        for (class, rules) in decoded_file.rules {
            for rule in rules {
                self.add_rule(class, rule);
            }
        }
    }

    pub fn merge_json_file(&mut self, file_name: &str) -> Result<(), String> {
        let mut f = std::fs::File::open(file_name)
            .map_err(|err| format!("reading file: {file_name}: {err:#}"))?;
        let decoded: BounceClassifierFile = serde_json::from_reader(&mut f)
            .map_err(|err| format!("decoding {file_name} as BounceClassifierFile: {err:#}"))?;
        self.merge(decoded);
        Ok(())
    }

    pub fn build(self) -> Result<BounceClassifier, String> {
        let mut pattern_to_class = vec![];
        let mut patterns = vec![];
        for (class, rule) in self.rules {
            pattern_to_class.push(class);
            patterns.push(rule);
        }

        pattern_to_class.shrink_to_fit();

        let set = RegexSetBuilder::new(patterns)
            .case_insensitive(true)
            .build()
            .map_err(|err| format!("compiling rules: {err:#}"))?;
        Ok(BounceClassifier {
            set,
            pattern_to_class,
        })
    }
}

pub struct BounceClassifier {
    set: RegexSet,
    pattern_to_class: Vec<SendErrorCategory>,
}

impl BounceClassifier {
    pub fn classify_str(&self, s: &str) -> SendErrorCategory {
        self.set
            .matches(s)
            .into_iter()
            .next()
            .and_then(|idx| self.pattern_to_class.get(idx))
            .copied()
            .unwrap_or(SendErrorCategory::Unknown)
    }

    /// Classify an ESP error response. `status` is the transport-level
    /// HTTP status code (0 if not applicable, e.g. a connection error);
    /// `provider_code` is the provider's own error code if present;
    /// `reason` is the free-text message. Falls back to status-code
    /// bucketing (§4.7) when no rule matches.
    pub fn classify(&self, status: u16, provider_code: Option<&str>, reason: &str) -> SendErrorCategory {
        let normalized = format!("{status} {} {reason}", provider_code.unwrap_or(""));
        let matched = self.classify_str(&normalized);
        if matched != SendErrorCategory::Unknown {
            return matched;
        }
        classify_by_status(status)
    }
}

/// Coarse fallback used when no rule in the configured classifier
/// matches: 4xx → soft_bounce/auth/throttle by code, 5xx → hard_bounce,
/// everything else → unknown (: "4xx codes classify by
/// sub-code into soft_bounce/throttle/auth").
fn classify_by_status(status: u16) -> SendErrorCategory {
    match status {
        401 | 403 => SendErrorCategory::Auth,
        429 => SendErrorCategory::Throttle,
        400 | 422 => SendErrorCategory::InvalidAddress,
        400..=499 => SendErrorCategory::SoftBounce,
        500..=599 => SendErrorCategory::HardBounce,
        _ => SendErrorCategory::Unknown,
    }
}

fn default_rules() -> Vec<(SendErrorCategory, &'static str)> {
    use SendErrorCategory::*;
    vec![
        // SparkPost-style numeric error_code ranges and messages.
        (InvalidAddress, r"\binvalid recipient\b"),
        (InvalidAddress, r"\bno such user\b"),
        (InvalidAddress, r"\bmailbox (unavailable|does not exist)\b"),
        (HardBounce, r"\buser (unknown|not found)\b"),
        (HardBounce, r"\bdomain (not found|does not exist)\b"),
        (HardBounce, r"\b55[0-9]\b"),
        (SoftBounce, r"\bmailbox full\b"),
        (SoftBounce, r"\bover quota\b"),
        (SoftBounce, r"\b4[0-9][0-9]\b"),
        (Throttle, r"\bthrottl"),
        (Throttle, r"\brate limit"),
        (Throttle, r"\b429\b"),
        (Auth, r"\bunauthorized\b"),
        (Auth, r"\binvalid api key\b"),
        (Auth, r"\bforbidden\b"),
        (Auth, r"\b401\b"),
        (Auth, r"\b403\b"),
        (Network, r"\bconnection (refused|reset|timed? ?out)\b"),
        (Network, r"\btls handshake\b"),
    ]
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rule_order() {
        let f1: BounceClassifierFile = serde_json::from_str(
            r#"{"rules": {"hard_bounce": ["woot", "aaa"], "soft_bounce": ["woot", "aaa", "bbb"]}}"#,
        )
        .unwrap();

        let f2: BounceClassifierFile =
            serde_json::from_str(r#"{"rules": {"throttle": ["bbb", "ccc"]}}"#).unwrap();

        let mut builder = BounceClassifierBuilder::new();
        builder.merge(f1);
        builder.merge(f2);

        let classifier = builder.build().unwrap();
        assert_eq!(
            classifier.classify_str("woot"),
            SendErrorCategory::HardBounce,
            "hard_bounce rule was added first so it wins"
        );
        assert_eq!(classifier.classify_str("bbb"), SendErrorCategory::SoftBounce);
        assert_eq!(classifier.classify_str("ccc"), SendErrorCategory::Throttle);
    }

    #[test]
    fn default_rules_classify_common_esp_errors() {
        let classifier = BounceClassifierBuilder::with_default_rules().build().unwrap();

        let corpus = &[
            ("550 5.1.1 user unknown", SendErrorCategory::HardBounce),
            ("450 4.2.2 mailbox full", SendErrorCategory::SoftBounce),
            ("429 too many requests, throttled", SendErrorCategory::Throttle),
            ("401 invalid api key", SendErrorCategory::Auth),
            ("400 invalid recipient address", SendErrorCategory::InvalidAddress),
            ("connection reset by peer", SendErrorCategory::Network),
        ];

        for &(input, expected) in corpus {
            assert_eq!(classifier.classify_str(input), expected, "input: {input}");
        }
    }

    #[test]
    fn status_fallback_used_when_no_rule_matches() {
        let classifier = BounceClassifierBuilder::with_default_rules().build().unwrap();
        assert_eq!(
            classifier.classify(503, None, "upstream unavailable"),
            SendErrorCategory::HardBounce
        );
        assert_eq!(
            classifier.classify(202, None, "accepted"),
            SendErrorCategory::Unknown
        );
    }

    #[test]
    fn terminal_categories() {
        assert!(SendErrorCategory::HardBounce.is_terminal());
        assert!(SendErrorCategory::InvalidAddress.is_terminal());
        assert!(!SendErrorCategory::SoftBounce.is_terminal());
        assert!(!SendErrorCategory::Throttle.is_terminal());
        assert!(SendErrorCategory::Network.is_retryable());
    }
}
