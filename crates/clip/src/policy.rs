//! Policy resolution.
//!
//! For any qualified tool name the resolver collapses the configuration tree
//! into fully specified policies by field-wise override: tool > upstream
//! defaults > global defaults > built-in. The tree is fixed-depth, so
//! resolution is a handful of map lookups; nothing recurses.
//!
//! Queries for a nonexistent qualified name return empty/default values
//! rather than failing: existence is enforced by the catalog, not here.

use crate::config::{
    CacheOverride, CompressionOverride, Config, FallbackThreshold, LlmConfig, MaskingOverride,
    PiiType, ScopeDefaults, ToolConfig, TOOL_NAME_SEPARATOR,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Fully resolved compression policy for one tool.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionPolicy {
    pub enabled: bool,
    /// Estimated-token size above which a response becomes a summarization
    /// candidate.
    pub token_threshold: u32,
    /// Base budget for the summary, before retry escalation.
    pub max_output_tokens: u32,
    pub custom_instructions: Option<String>,
    pub goal_aware: bool,
}

/// Fully resolved masking policy for one tool.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskingPolicy {
    pub enabled: bool,
    pub pii_types: Vec<PiiType>,
    pub llm_fallback: bool,
    pub llm_fallback_threshold: FallbackThreshold,
}

/// Fully resolved cache policy for one tool.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl_seconds: u64,
}

impl CachePolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Resolved global retry-escalation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEscalation {
    pub enabled: bool,
    pub window: Duration,
    pub token_multiplier: f64,
    pub max_levels: u32,
}

/// Split a qualified name into `(upstream_id, tool_name)`.
pub fn split_qualified(qualified: &str) -> Option<(&str, &str)> {
    qualified.split_once(TOOL_NAME_SEPARATOR)
}

/// Join an upstream id and a bare tool name into a qualified name.
pub fn qualify(upstream_id: &str, tool_name: &str) -> String {
    format!("{upstream_id}{TOOL_NAME_SEPARATOR}{tool_name}")
}

pub struct PolicyResolver {
    config: Arc<Config>,
}

/// First present value wins, most specific layer first.
fn pick<T>(layers: [Option<T>; 3]) -> Option<T> {
    layers.into_iter().flatten().next()
}

impl PolicyResolver {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn tool_config(&self, qualified: &str) -> Option<&ToolConfig> {
        let (upstream_id, tool_name) = split_qualified(qualified)?;
        self.config.upstream(upstream_id)?.tools.get(tool_name)
    }

    fn upstream_defaults(&self, qualified: &str) -> Option<&ScopeDefaults> {
        let (upstream_id, _) = split_qualified(qualified)?;
        self.config.upstream(upstream_id)?.defaults.as_ref()
    }

    fn compression_layers(
        &self,
        qualified: &str,
    ) -> [Option<&CompressionOverride>; 3] {
        [
            self.tool_config(qualified).and_then(|t| t.compression.as_ref()),
            self.upstream_defaults(qualified)
                .and_then(|d| d.compression.as_ref()),
            self.config
                .defaults
                .as_ref()
                .and_then(|d| d.compression.as_ref()),
        ]
    }

    pub fn resolve_compression_policy(&self, qualified: &str) -> CompressionPolicy {
        let [tool, upstream, global] = self.compression_layers(qualified);
        let base = &self.config.compression;
        CompressionPolicy {
            enabled: pick([
                tool.and_then(|o| o.enabled),
                upstream.and_then(|o| o.enabled),
                global.and_then(|o| o.enabled),
            ])
            .unwrap_or(base.enabled),
            token_threshold: pick([
                tool.and_then(|o| o.token_threshold),
                upstream.and_then(|o| o.token_threshold),
                global.and_then(|o| o.token_threshold),
            ])
            .unwrap_or(base.token_threshold),
            max_output_tokens: pick([
                tool.and_then(|o| o.max_output_tokens),
                upstream.and_then(|o| o.max_output_tokens),
                global.and_then(|o| o.max_output_tokens),
            ])
            .unwrap_or(base.max_output_tokens),
            custom_instructions: pick([
                tool.and_then(|o| o.custom_instructions.clone()),
                upstream.and_then(|o| o.custom_instructions.clone()),
                global.and_then(|o| o.custom_instructions.clone()),
            ])
            .or_else(|| base.custom_instructions.clone()),
            goal_aware: pick([
                tool.and_then(|o| o.goal_aware),
                upstream.and_then(|o| o.goal_aware),
                global.and_then(|o| o.goal_aware),
            ])
            .unwrap_or(base.goal_aware),
        }
    }

    pub fn resolve_masking_policy(&self, qualified: &str) -> MaskingPolicy {
        let tool = self.tool_config(qualified).and_then(|t| t.masking.as_ref());
        let upstream = self
            .upstream_defaults(qualified)
            .and_then(|d| d.masking.as_ref());
        let global = self
            .config
            .defaults
            .as_ref()
            .and_then(|d| d.masking.as_ref());
        let base = self.config.masking.as_ref();

        let layer = |f: fn(&MaskingOverride) -> Option<bool>| {
            pick([tool.and_then(f), upstream.and_then(f), global.and_then(f)])
        };

        MaskingPolicy {
            enabled: layer(|o| o.enabled).unwrap_or_else(|| base.is_some_and(|m| m.enabled)),
            // Replaced wholesale by the most specific layer, never unioned.
            pii_types: pick([
                tool.and_then(|o| o.pii_types.clone()),
                upstream.and_then(|o| o.pii_types.clone()),
                global.and_then(|o| o.pii_types.clone()),
            ])
            .or_else(|| base.and_then(|m| m.pii_types.clone()))
            .unwrap_or_else(|| PiiType::ALL.to_vec()),
            llm_fallback: layer(|o| o.llm_fallback)
                .unwrap_or_else(|| base.is_some_and(|m| m.llm_fallback)),
            llm_fallback_threshold: pick([
                tool.and_then(|o| o.llm_fallback_threshold),
                upstream.and_then(|o| o.llm_fallback_threshold),
                global.and_then(|o| o.llm_fallback_threshold),
            ])
            .unwrap_or_else(|| {
                base.map(|m| m.llm_fallback_threshold)
                    .unwrap_or(FallbackThreshold::Medium)
            }),
        }
    }

    pub fn resolve_cache_policy(&self, qualified: &str) -> CachePolicy {
        let tool = self.tool_config(qualified).and_then(|t| t.cache.as_ref());
        let upstream = self
            .upstream_defaults(qualified)
            .and_then(|d| d.cache.as_ref());
        let global = self.config.defaults.as_ref().and_then(|d| d.cache.as_ref());

        let layer = |f: fn(&CacheOverride) -> Option<u64>| {
            pick([tool.and_then(f), upstream.and_then(f), global.and_then(f)])
        };

        CachePolicy {
            enabled: pick([
                tool.and_then(|o| o.enabled),
                upstream.and_then(|o| o.enabled),
                global.and_then(|o| o.enabled),
            ])
            .unwrap_or(false),
            ttl_seconds: layer(|o| o.ttl_seconds).unwrap_or(300),
        }
    }

    pub fn is_tool_hidden(&self, qualified: &str) -> bool {
        self.tool_config(qualified)
            .and_then(|t| t.hidden)
            .unwrap_or(false)
    }

    pub fn hidden_parameters(&self, qualified: &str) -> Vec<String> {
        self.tool_config(qualified)
            .and_then(|t| t.hide_parameters.clone())
            .unwrap_or_default()
    }

    pub fn parameter_overrides(&self, qualified: &str) -> Map<String, Value> {
        self.tool_config(qualified)
            .and_then(|t| t.parameter_overrides.clone())
            .unwrap_or_default()
    }

    pub fn description_override(&self, qualified: &str) -> Option<String> {
        self.tool_config(qualified)
            .and_then(|t| t.overwrite_description.clone())
    }

    pub fn is_goal_aware_enabled(&self, qualified: &str) -> bool {
        self.resolve_compression_policy(qualified).goal_aware
    }

    /// Global only; per-tool escalation is not a thing.
    pub fn retry_escalation(&self) -> RetryEscalation {
        match &self.config.compression.retry_escalation {
            Some(cfg) => RetryEscalation {
                enabled: cfg.enabled,
                window: Duration::from_secs(cfg.window_seconds),
                token_multiplier: cfg.token_multiplier,
                max_levels: cfg.max_levels,
            },
            None => RetryEscalation {
                enabled: false,
                window: Duration::from_secs(60),
                token_multiplier: 2.0,
                max_levels: 3,
            },
        }
    }

    /// Global only; whether the per-call cache-bypass flag is honored.
    pub fn is_bypass_enabled(&self) -> bool {
        self.config.compression.bypass_enabled
    }

    pub fn summarizer_llm(&self) -> Option<&LlmConfig> {
        self.config.compression.llm_config.as_ref()
    }

    /// Masking fallback model, defaulting to the summarizer's when the
    /// masking section has none of its own.
    pub fn masking_llm(&self) -> Option<&LlmConfig> {
        self.config
            .masking
            .as_ref()
            .and_then(|m| m.llm_config.as_ref())
            .or_else(|| self.summarizer_llm())
    }
}
