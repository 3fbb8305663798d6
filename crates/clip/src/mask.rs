//! PII masking.
//!
//! The primary pass is pure regex: each configured type is applied in a
//! fixed order and replaced with its redaction token, so the same input and
//! policy always produce byte-identical output. When the policy allows it
//! and the per-type heuristic is not confident the regexes caught
//! everything, a second LLM extraction pass runs; any failure there degrades
//! to the regex-only result with a warning. The regex pass itself cannot
//! fail.

use crate::config::{FallbackThreshold, LlmConfig, PiiType};
use crate::policy::MaskingPolicy;
use crate::summarize::chat_completion;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::time::Duration;

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());
static CREDIT_CARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{3,4}\b").unwrap());
static SSN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\+?\d{0,2}[ .-]?\(?\d{3}\)?[ .-]?\d{3}[ .-]?\d{4}\b").unwrap()
});
static IP_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());

/// Residual digit runs this long after masking suggest the regexes missed an
/// identifier.
static LONG_DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{9,}").unwrap());
static MEDIUM_DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{7,8}").unwrap());

fn pattern(pii: PiiType) -> &'static Regex {
    match pii {
        PiiType::Email => &EMAIL,
        PiiType::CreditCard => &CREDIT_CARD,
        PiiType::Ssn => &SSN,
        PiiType::Phone => &PHONE,
        PiiType::IpAddress => &IP_ADDRESS,
    }
}

fn redaction(pii: PiiType) -> &'static str {
    match pii {
        PiiType::Email => "[REDACTED_EMAIL]",
        PiiType::CreditCard => "[REDACTED_CREDIT_CARD]",
        PiiType::Ssn => "[REDACTED_SSN]",
        PiiType::Phone => "[REDACTED_PHONE]",
        PiiType::IpAddress => "[REDACTED_IP_ADDRESS]",
    }
}

/// Token used when the LLM fallback finds something the regexes have no
/// category for.
const FALLBACK_REDACTION: &str = "[REDACTED_PII]";

/// How sure the regex pass is that nothing sensitive slipped through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    fn below(self, threshold: FallbackThreshold) -> bool {
        let rank = match threshold {
            FallbackThreshold::Low => Confidence::Low,
            FallbackThreshold::Medium => Confidence::Medium,
            FallbackThreshold::High => Confidence::High,
        };
        self < rank
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaskOutcome {
    pub text: String,
    pub replacements: u32,
}

pub struct PiiMasker {
    client: Option<reqwest::Client>,
    timeout: Duration,
}

impl PiiMasker {
    pub fn new(timeout: Duration) -> Self {
        // A failed client build only disables the LLM fallback; the regex
        // pass never needs HTTP.
        let client = reqwest::Client::builder().timeout(timeout).build().ok();
        Self { client, timeout }
    }

    /// The deterministic regex pass.
    pub fn mask_text(&self, text: &str, policy: &MaskingPolicy) -> MaskOutcome {
        let mut out = text.to_string();
        let mut replacements = 0u32;
        for pii in PiiType::ALL {
            if !policy.pii_types.contains(&pii) {
                continue;
            }
            let regex = pattern(pii);
            let count = regex.find_iter(&out).count() as u32;
            if count > 0 {
                out = regex.replace_all(&out, redaction(pii)).into_owned();
                replacements += count;
            }
        }
        MaskOutcome {
            text: out,
            replacements,
        }
    }

    /// Regex pass plus, when permitted and warranted, the LLM fallback.
    pub async fn mask(
        &self,
        text: &str,
        policy: &MaskingPolicy,
        llm: Option<&LlmConfig>,
    ) -> MaskOutcome {
        let outcome = self.mask_text(text, policy);
        if !policy.llm_fallback {
            return outcome;
        }
        let confidence = regex_confidence(&outcome.text, policy);
        if !confidence.below(policy.llm_fallback_threshold) {
            return outcome;
        }
        let (Some(client), Some(llm)) = (self.client.as_ref(), llm) else {
            log::warn!("masking LLM fallback requested but no llmConfig available");
            return outcome;
        };
        match self.llm_pass(client, llm, &outcome.text).await {
            Ok(extra) => MaskOutcome {
                text: extra.text,
                replacements: outcome.replacements + extra.replacements,
            },
            Err(e) => {
                log::warn!("masking LLM fallback failed, serving regex-only output: {e}");
                outcome
            }
        }
    }

    async fn llm_pass(
        &self,
        client: &reqwest::Client,
        llm: &LlmConfig,
        text: &str,
    ) -> Result<MaskOutcome, String> {
        let system = "You are a PII detector. Reply with a JSON array of the exact \
                      substrings in the user message that are personally identifying \
                      information (emails, phone numbers, government or card numbers, \
                      addresses). Reply with [] when there are none. Output only JSON."
            .to_string();
        let reply = chat_completion(client, llm, system, text.to_string(), 512, self.timeout).await?;
        let spans: Vec<String> = serde_json::from_str::<Value>(reply.trim())
            .map_err(|e| format!("unparseable fallback reply: {e}"))?
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .ok_or_else(|| "fallback reply was not a JSON array".to_string())?;

        let mut out = text.to_string();
        let mut replacements = 0u32;
        for span in spans {
            if span.is_empty() || !out.contains(&span) {
                continue;
            }
            let occurrences = out.matches(&span).count() as u32;
            out = out.replace(&span, FALLBACK_REDACTION);
            replacements += occurrences;
        }
        Ok(MaskOutcome {
            text: out,
            replacements,
        })
    }
}

/// Heuristic over the already-masked text: leftover indicators mean the
/// regexes probably missed something of a configured type.
fn regex_confidence(masked: &str, policy: &MaskingPolicy) -> Confidence {
    let watches_digits = policy.pii_types.iter().any(|t| {
        matches!(
            t,
            PiiType::Ssn | PiiType::Phone | PiiType::CreditCard | PiiType::IpAddress
        )
    });
    if policy.pii_types.contains(&PiiType::Email) && masked.contains('@') {
        return Confidence::Low;
    }
    if watches_digits {
        if LONG_DIGIT_RUN.is_match(masked) {
            return Confidence::Low;
        }
        if MEDIUM_DIGIT_RUN.is_match(masked) {
            return Confidence::Medium;
        }
    }
    Confidence::High
}
