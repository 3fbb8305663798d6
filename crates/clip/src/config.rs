//! JSON configuration for the proxy.
//!
//! The file is a three-level tree: global sections, per-upstream `defaults`,
//! and per-tool overrides. Upstream and tool layers are *partial* records
//! (every field optional); the policy resolver collapses them into fully
//! specified policies. Unknown fields are rejected at every level.

use crate::error::ClipError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Separator between upstream id and tool name in a qualified tool name.
/// Reserved: neither side may contain it.
pub const TOOL_NAME_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masking: Option<MaskingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<ScopeDefaults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Local child process, JSON-RPC over stdin/stdout.
    #[default]
    Stdio,
    /// HTTP Server-Sent Events endpoint.
    Sse,
    /// Streamable HTTP endpoint.
    Http,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Upstream identifier used to qualify tool names. Must not contain `__`.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub transport: TransportKind,

    // stdio
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    // sse / http
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<ScopeDefaults>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tools: HashMap<String, ToolConfig>,
}

impl UpstreamConfig {
    fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("upstream id must not be empty".into());
        }
        if self.id.contains(TOOL_NAME_SEPARATOR) {
            return Err(format!(
                "upstream id `{}` contains the reserved separator `{}`",
                self.id, TOOL_NAME_SEPARATOR
            ));
        }
        match self.transport {
            TransportKind::Stdio => {
                if self.command.is_none() {
                    return Err(format!("stdio upstream `{}` requires `command`", self.id));
                }
            }
            TransportKind::Sse | TransportKind::Http => {
                if self.url.is_none() {
                    return Err(format!(
                        "{:?} upstream `{}` requires `url`",
                        self.transport, self.id
                    ));
                }
            }
        }
        for tool_name in self.tools.keys() {
            if tool_name.contains(TOOL_NAME_SEPARATOR) {
                return Err(format!(
                    "tool `{}` on upstream `{}` contains the reserved separator `{}`",
                    tool_name, self.id, TOOL_NAME_SEPARATOR
                ));
            }
        }
        Ok(())
    }
}

/// Per-tool overrides. All fields optional; absent means inherit.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ToolConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hide_parameters: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_overrides: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masking: Option<MaskingOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheOverride>,
}

/// Global compression section. Concrete values; missing fields take the
/// built-in defaults via serde.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub token_threshold: u32,
    pub max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,
    pub goal_aware: bool,
    pub bypass_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_escalation: Option<RetryEscalationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_config: Option<LlmConfig>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token_threshold: 1000,
            max_output_tokens: 500,
            custom_instructions: None,
            goal_aware: false,
            bypass_enabled: false,
            retry_escalation: None,
            llm_config: None,
        }
    }
}

/// Global masking section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct MaskingConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pii_types: Option<Vec<PiiType>>,
    pub llm_fallback: bool,
    pub llm_fallback_threshold: FallbackThreshold,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_config: Option<LlmConfig>,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pii_types: None,
            llm_fallback: false,
            llm_fallback_threshold: FallbackThreshold::Medium,
            llm_config: None,
        }
    }
}

/// The closed set of PII categories the regex masker recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiType {
    Email,
    Ssn,
    Phone,
    CreditCard,
    IpAddress,
}

impl PiiType {
    /// Every recognized type, in the fixed order masking passes run.
    pub const ALL: [PiiType; 5] = [
        PiiType::Email,
        PiiType::CreditCard,
        PiiType::Ssn,
        PiiType::Phone,
        PiiType::IpAddress,
    ];
}

/// Confidence floor below which the LLM fallback pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackThreshold {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RetryEscalationConfig {
    pub enabled: bool,
    pub window_seconds: u64,
    pub token_multiplier: f64,
    /// Cap on the escalation exponent: factor = multiplier^min(k, maxLevels).
    pub max_levels: u32,
}

impl Default for RetryEscalationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_seconds: 60,
            token_multiplier: 2.0,
            max_levels: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Partial compression record for the `defaults` and per-tool layers.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CompressionOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_aware: Option<bool>,
}

/// Partial masking record. `piiTypes` is replaced wholesale by the most
/// specific layer that sets it, never unioned.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MaskingOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pii_types: Option<Vec<PiiType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_fallback: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_fallback_threshold: Option<FallbackThreshold>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScopeDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masking: Option<MaskingOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheOverride>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct TimeoutConfig {
    pub upstream_seconds: u64,
    pub summarizer_seconds: u64,
    pub masker_llm_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            upstream_seconds: 60,
            summarizer_seconds: 30,
            masker_llm_seconds: 15,
        }
    }
}

impl TimeoutConfig {
    pub fn upstream(&self) -> Duration {
        Duration::from_secs(self.upstream_seconds)
    }

    pub fn summarizer(&self) -> Duration {
        Duration::from_secs(self.summarizer_seconds)
    }

    pub fn masker_llm(&self) -> Duration {
        Duration::from_secs(self.masker_llm_seconds)
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ClipError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ClipError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration JSON.
    pub fn from_json(content: &str) -> Result<Self, ClipError> {
        let config: Config =
            serde_json::from_str(content).map_err(|e| ClipError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ClipError> {
        if self.upstreams.is_empty() {
            return Err(ClipError::Config("no upstreams configured".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for upstream in &self.upstreams {
            upstream.validate().map_err(ClipError::Config)?;
            if !seen.insert(upstream.id.as_str()) {
                return Err(ClipError::Config(format!(
                    "duplicate upstream id `{}`",
                    upstream.id
                )));
            }
        }
        if let Some(escalation) = &self.compression.retry_escalation {
            if escalation.token_multiplier < 1.0 {
                return Err(ClipError::Config(
                    "retryEscalation.tokenMultiplier must be >= 1.0".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn upstream(&self, id: &str) -> Option<&UpstreamConfig> {
        self.upstreams.iter().find(|u| u.id == id)
    }

    /// Example configuration written by `clip --init`.
    pub fn example() -> Self {
        let mut tools = HashMap::new();
        tools.insert(
            "fetch".to_string(),
            ToolConfig {
                hide_parameters: Some(vec!["api_key".to_string()]),
                parameter_overrides: Some(
                    [("api_key".to_string(), Value::String("CHANGE_ME".to_string()))]
                        .into_iter()
                        .collect(),
                ),
                compression: Some(CompressionOverride {
                    token_threshold: Some(2000),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        Self {
            upstreams: vec![UpstreamConfig {
                id: "example".to_string(),
                name: Some("Example filesystem server".to_string()),
                transport: TransportKind::Stdio,
                command: Some("npx".to_string()),
                args: vec![
                    "-y".to_string(),
                    "@modelcontextprotocol/server-filesystem".to_string(),
                    "/tmp".to_string(),
                ],
                env: HashMap::new(),
                url: None,
                token: None,
                defaults: None,
                tools,
            }],
            compression: CompressionConfig {
                enabled: true,
                token_threshold: 1000,
                max_output_tokens: 500,
                retry_escalation: Some(RetryEscalationConfig::default()),
                llm_config: Some(LlmConfig {
                    base_url: "http://localhost:11434/v1/chat/completions".to_string(),
                    model: "llama3.2".to_string(),
                    api_key: None,
                }),
                ..Default::default()
            },
            masking: Some(MaskingConfig {
                enabled: true,
                pii_types: Some(vec![PiiType::Email, PiiType::Ssn]),
                ..Default::default()
            }),
            defaults: Some(ScopeDefaults {
                cache: Some(CacheOverride {
                    enabled: Some(true),
                    ttl_seconds: Some(300),
                }),
                ..Default::default()
            }),
            logging: Some(LoggingConfig {
                level: Some("info".to_string()),
            }),
            timeouts: TimeoutConfig::default(),
        }
    }

    pub fn example_json() -> String {
        // Serialization of a constant cannot fail.
        serde_json::to_string_pretty(&Self::example()).unwrap_or_default()
    }
}
