//! The per-call shaping pipeline.
//!
//! Fixed order per call: parameter policy, cache lookup, then inside the
//! single-flight builder: upstream call, masking, escalation bookkeeping,
//! compression decision, summarization. The cached artifact is the already
//! shaped response, so identical calls skip masking and summarization
//! entirely. Per-call failures never take the proxy down: summarizer
//! failures degrade to the masked original with an annotation, masker
//! fallback failures degrade to regex-only output, cache trouble is a miss.

use crate::cache::{cache_key, ResponseCache};
use crate::error::ClipError;
use crate::escalation::RetryEscalationTracker;
use crate::mask::PiiMasker;
use crate::policy::PolicyResolver;
use crate::summarize::Summarize;
use crate::token::estimate_tokens;
use crate::upstream::UpstreamRouter;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Reserved argument key requesting a cache bypass for one call. Always
/// stripped before dispatch; honored only when the config enables bypass.
pub const BYPASS_ARGUMENT: &str = "__clip_bypass_cache";

/// Shaping annotations returned to the client under `_meta.clip`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShapeMeta {
    pub compressed: bool,
    pub original_tokens: u32,
    pub summary_tokens: u32,
    pub masked_count: u32,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_error: Option<String>,
}

/// The envelope handed back to the front-end for a shaped `tools/call`.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapedResponse {
    pub content: Vec<Value>,
    pub is_error: bool,
    pub meta: ShapeMeta,
}

impl ShapedResponse {
    /// Serialize to the MCP `tools/call` result shape.
    pub fn to_result_value(&self) -> Value {
        json!({
            "content": self.content,
            "isError": self.is_error,
            "_meta": {"clip": self.meta},
        })
    }
}

/// Concatenated text content of a response, the unit the masker and
/// summarizer operate on.
fn joined_text(content: &[Value]) -> String {
    content
        .iter()
        .filter_map(|entry| entry.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Clone)]
pub struct CallPipeline {
    resolver: Arc<PolicyResolver>,
    router: Arc<dyn UpstreamRouter>,
    cache: Arc<ResponseCache<ShapedResponse>>,
    masker: Arc<PiiMasker>,
    summarizer: Option<Arc<dyn Summarize>>,
    escalation: Arc<RetryEscalationTracker>,
}

impl CallPipeline {
    pub fn new(
        resolver: Arc<PolicyResolver>,
        router: Arc<dyn UpstreamRouter>,
        cache: Arc<ResponseCache<ShapedResponse>>,
        masker: Arc<PiiMasker>,
        summarizer: Option<Arc<dyn Summarize>>,
        escalation: Arc<RetryEscalationTracker>,
    ) -> Self {
        Self {
            resolver,
            router,
            cache,
            masker,
            summarizer,
            escalation,
        }
    }

    pub fn cache(&self) -> &ResponseCache<ShapedResponse> {
        &self.cache
    }

    pub fn escalation(&self) -> &RetryEscalationTracker {
        &self.escalation
    }

    /// Handle one `tools/call`.
    pub async fn handle_call(
        &self,
        qualified: &str,
        mut args: Map<String, Value>,
        goal: Option<String>,
    ) -> Result<ShapedResponse, ClipError> {
        // Hidden tools answer exactly like unknown ones.
        if self.resolver.is_tool_hidden(qualified) || self.router.lookup(qualified).is_none() {
            return Err(ClipError::ToolNotFound(qualified.to_string()));
        }

        // The bypass flag is ours, never the upstream's.
        let bypass_requested = matches!(args.remove(BYPASS_ARGUMENT), Some(Value::Bool(true)));
        let bypass = bypass_requested && self.resolver.is_bypass_enabled();

        // Parameter policy: hidden parameters are stripped even if the
        // client sent them anyway; overrides replace whatever remains.
        for hidden in self.resolver.hidden_parameters(qualified) {
            args.remove(&hidden);
        }
        for (key, value) in self.resolver.parameter_overrides(qualified) {
            args.insert(key, value);
        }

        let goal = if self.resolver.is_goal_aware_enabled(qualified) {
            goal
        } else {
            None
        };

        let key = cache_key(qualified, &args);
        let cache_policy = self.resolver.resolve_cache_policy(qualified);

        if cache_policy.enabled && !bypass {
            let this = self.clone();
            let qualified = qualified.to_string();
            let builder_key = key.clone();
            let (mut shaped, cached) = self
                .cache
                .get_or_compute(&key, cache_policy.ttl(), move || async move {
                    this.build_response(&qualified, builder_key, args, goal).await
                })
                .await?;
            shaped.meta.cached = cached;
            Ok(shaped)
        } else {
            self.build_response(qualified, key, args, goal).await
        }
    }

    /// Steps 5-10: everything behind the cache. Runs at most once
    /// concurrently per cache key.
    async fn build_response(
        &self,
        qualified: &str,
        args_key: String,
        args: Map<String, Value>,
        goal: Option<String>,
    ) -> Result<ShapedResponse, ClipError> {
        // Upstream errors propagate; nothing negative is cached.
        let raw = self.router.call_tool(qualified, args).await?;

        let masking = self.resolver.resolve_masking_policy(qualified);
        let mut content = raw.content;
        let mut masked_count = 0u32;
        if masking.enabled {
            let llm = self.resolver.masking_llm().cloned();
            for entry in &mut content {
                let Some(text) = entry.get("text").and_then(Value::as_str) else {
                    continue;
                };
                let outcome = self.masker.mask(text, &masking, llm.as_ref()).await;
                masked_count += outcome.replacements;
                entry["text"] = Value::String(outcome.text);
            }
        }

        // The current call counts toward its own streak, so a repeat within
        // the window already summarizes with the enlarged budget.
        let factor = self.escalation.record(qualified, &args_key);

        let compression = self.resolver.resolve_compression_policy(qualified);
        let body = joined_text(&content);
        let original_tokens = estimate_tokens(&body);
        let mut meta = ShapeMeta {
            compressed: false,
            original_tokens,
            summary_tokens: original_tokens,
            masked_count,
            cached: false,
            compression_error: None,
        };

        if compression.enabled && !raw.is_error && original_tokens >= compression.token_threshold {
            let budget = ((compression.max_output_tokens as f64) * factor).round() as u32;
            match &self.summarizer {
                Some(summarizer) => {
                    match summarizer
                        .summarize(&body, &compression, budget, goal.as_deref())
                        .await
                    {
                        Ok(summary) => {
                            meta.compressed = true;
                            meta.summary_tokens = summary.summary_tokens;
                            meta.original_tokens = summary.original_tokens;
                            content = vec![json!({"type": "text", "text": summary.text})];
                        }
                        Err(e) => {
                            log::warn!(
                                "summarizer failed for `{qualified}`, serving uncompressed: {e}"
                            );
                            meta.compression_error = Some(e.to_string());
                        }
                    }
                }
                None => {
                    meta.compression_error =
                        Some("compression enabled but no llmConfig configured".to_string());
                }
            }
        }

        Ok(ShapedResponse {
            content,
            is_error: raw.is_error,
            meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::policy::CompressionPolicy;
    use crate::summarize::{Summarize, Summary};
    use crate::upstream::{RawToolResult, ToolDescriptor, UpstreamRouter};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Upstream double: records calls, replays a canned result.
    struct MockRouter {
        tools: Vec<String>,
        result: RawToolResult,
        calls: AtomicUsize,
        seen_args: Mutex<Vec<Map<String, Value>>>,
        delay: Duration,
        fail: bool,
    }

    impl MockRouter {
        fn new(tools: &[&str], body: &str) -> Self {
            Self {
                tools: tools.iter().map(|t| t.to_string()).collect(),
                result: RawToolResult {
                    content: vec![json!({"type": "text", "text": body})],
                    is_error: false,
                },
                calls: AtomicUsize::new(0),
                seen_args: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
                fail: false,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_args(&self) -> Map<String, Value> {
            self.seen_args.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl UpstreamRouter for MockRouter {
        fn lookup(&self, qualified: &str) -> Option<ToolDescriptor> {
            self.tools.iter().any(|t| t == qualified).then(|| ToolDescriptor {
                name: qualified.to_string(),
                description: None,
                input_schema: json!({"type": "object"}),
            })
        }

        fn list_tools(&self) -> Vec<ToolDescriptor> {
            self.tools
                .iter()
                .filter_map(|t| self.lookup(t))
                .collect()
        }

        async fn call_tool(
            &self,
            qualified: &str,
            args: Map<String, Value>,
        ) -> Result<RawToolResult, ClipError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_args.lock().unwrap().push(args);
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(ClipError::upstream(
                    qualified.split("__").next().unwrap_or_default(),
                    "boom",
                ));
            }
            Ok(self.result.clone())
        }
    }

    /// Summarizer double: canned text or canned failure, records budgets.
    struct MockSummarizer {
        text: String,
        fail: bool,
        budgets: Mutex<Vec<u32>>,
    }

    impl MockSummarizer {
        fn new(text: &str) -> Self {
            Self {
                text: text.to_string(),
                fail: false,
                budgets: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new("")
            }
        }
    }

    #[async_trait]
    impl Summarize for MockSummarizer {
        async fn summarize(
            &self,
            body: &str,
            _policy: &CompressionPolicy,
            max_output_tokens: u32,
            _goal: Option<&str>,
        ) -> Result<Summary, ClipError> {
            self.budgets.lock().unwrap().push(max_output_tokens);
            if self.fail {
                return Err(ClipError::Summarizer("HTTP 500: upstream llm".into()));
            }
            Ok(Summary {
                text: self.text.clone(),
                original_tokens: estimate_tokens(body),
                summary_tokens: estimate_tokens(&self.text),
            })
        }
    }

    const BASE_CONFIG: &str = r#"{
        "upstreams": [{
            "id": "srv", "transport": "stdio", "command": "echo",
            "tools": {
                "dangerous": {"hidden": true},
                "fetch": {
                    "hideParameters": ["api_key"],
                    "parameterOverrides": {"api_key": "SECRET"}
                }
            }
        }],
        "compression": {
            "enabled": true, "tokenThreshold": 10, "maxOutputTokens": 100,
            "bypassEnabled": true,
            "retryEscalation": {"enabled": true, "windowSeconds": 60, "tokenMultiplier": 2.0}
        },
        "masking": {"enabled": true, "piiTypes": ["email"]},
        "defaults": {"cache": {"enabled": true, "ttlSeconds": 60}}
    }"#;

    fn pipeline_with(
        config: &str,
        router: Arc<MockRouter>,
        summarizer: Option<Arc<dyn Summarize>>,
    ) -> CallPipeline {
        let resolver = Arc::new(PolicyResolver::new(Arc::new(
            Config::from_json(config).unwrap(),
        )));
        let escalation = Arc::new(RetryEscalationTracker::new(resolver.retry_escalation()));
        CallPipeline::new(
            resolver,
            router,
            Arc::new(ResponseCache::new()),
            Arc::new(PiiMasker::new(Duration::from_secs(1))),
            summarizer,
            escalation,
        )
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn unknown_and_hidden_tools_are_not_found() {
        let router = Arc::new(MockRouter::new(&["srv__fetch", "srv__dangerous"], "ok"));
        let pipeline = pipeline_with(BASE_CONFIG, Arc::clone(&router), None);

        let missing = pipeline.handle_call("srv__nope", Map::new(), None).await;
        assert!(matches!(missing, Err(ClipError::ToolNotFound(_))));

        // Hidden: exists upstream, must still look unknown.
        let hidden = pipeline.handle_call("srv__dangerous", Map::new(), None).await;
        assert!(matches!(hidden, Err(ClipError::ToolNotFound(_))));
        assert_eq!(router.call_count(), 0);
    }

    #[tokio::test]
    async fn parameter_override_and_hidden_parameter() {
        let router = Arc::new(MockRouter::new(&["srv__fetch"], "short"));
        let pipeline = pipeline_with(BASE_CONFIG, Arc::clone(&router), None);

        // Client sneaks in its own api_key; the override must win and the
        // bypass flag must never reach the upstream.
        pipeline
            .handle_call(
                "srv__fetch",
                args(json!({"url": "u", "api_key": "attacker", "__clip_bypass_cache": true})),
                None,
            )
            .await
            .unwrap();
        let seen = router.last_args();
        assert_eq!(seen["api_key"], json!("SECRET"));
        assert_eq!(seen["url"], json!("u"));
        assert!(!seen.contains_key(BYPASS_ARGUMENT));
    }

    #[tokio::test]
    async fn concurrent_identical_calls_hit_upstream_once() {
        let router = Arc::new(
            MockRouter::new(&["srv__fetch"], "short").with_delay(Duration::from_millis(40)),
        );
        let pipeline = pipeline_with(BASE_CONFIG, Arc::clone(&router), None);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let pipeline = pipeline.clone();
            handles.push(tokio::spawn(async move {
                pipeline
                    .handle_call("srv__fetch", args(json!({"url": "u"})), None)
                    .await
            }));
        }
        let mut bodies = Vec::new();
        for handle in handles {
            bodies.push(handle.await.unwrap().unwrap().content);
        }
        assert_eq!(router.call_count(), 1);
        assert!(bodies.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn cache_hit_marks_metadata_and_skips_upstream() {
        let router = Arc::new(MockRouter::new(&["srv__fetch"], "short"));
        let pipeline = pipeline_with(BASE_CONFIG, Arc::clone(&router), None);
        let call = || pipeline.handle_call("srv__fetch", args(json!({"url": "u"})), None);

        let first = call().await.unwrap();
        assert!(!first.meta.cached);
        let second = call().await.unwrap();
        assert!(second.meta.cached);
        assert_eq!(router.call_count(), 1);
    }

    #[tokio::test]
    async fn bypass_skips_cache_read_and_write() {
        let router = Arc::new(MockRouter::new(&["srv__fetch"], "short"));
        let pipeline = pipeline_with(BASE_CONFIG, Arc::clone(&router), None);

        let bypass_args = || args(json!({"url": "u", "__clip_bypass_cache": true}));
        pipeline.handle_call("srv__fetch", bypass_args(), None).await.unwrap();
        pipeline.handle_call("srv__fetch", bypass_args(), None).await.unwrap();
        // No read, no write: both calls reached the upstream.
        assert_eq!(router.call_count(), 2);
        assert!(pipeline.cache().is_empty());

        // And a cached entry is not consulted by a bypassing call.
        let plain = args(json!({"url": "u"}));
        pipeline.handle_call("srv__fetch", plain.clone(), None).await.unwrap();
        assert_eq!(router.call_count(), 3);
        pipeline.handle_call("srv__fetch", bypass_args(), None).await.unwrap();
        assert_eq!(router.call_count(), 4);
    }

    #[tokio::test]
    async fn masking_applies_before_caching() {
        let router = Arc::new(MockRouter::new(&["srv__fetch"], "contact alice@example.com"));
        let pipeline = pipeline_with(BASE_CONFIG, Arc::clone(&router), None);

        let shaped = pipeline
            .handle_call("srv__fetch", args(json!({"url": "u"})), None)
            .await
            .unwrap();
        assert_eq!(shaped.meta.masked_count, 1);
        assert_eq!(
            shaped.content[0]["text"],
            json!("contact [REDACTED_EMAIL]")
        );

        // The cached artifact is already masked.
        let again = pipeline
            .handle_call("srv__fetch", args(json!({"url": "u"})), None)
            .await
            .unwrap();
        assert!(again.meta.cached);
        assert_eq!(again.content[0]["text"], json!("contact [REDACTED_EMAIL]"));
    }

    #[tokio::test]
    async fn small_responses_are_not_summarized() {
        let router = Arc::new(MockRouter::new(&["srv__fetch"], "tiny"));
        let summarizer = Arc::new(MockSummarizer::new("sum"));
        let pipeline = pipeline_with(BASE_CONFIG, router, Some(summarizer.clone()));

        let shaped = pipeline
            .handle_call("srv__fetch", args(json!({"url": "u"})), None)
            .await
            .unwrap();
        assert!(!shaped.meta.compressed);
        assert!(summarizer.budgets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn large_responses_are_summarized() {
        let body = "long body ".repeat(50);
        let router = Arc::new(MockRouter::new(&["srv__fetch"], &body));
        let summarizer = Arc::new(MockSummarizer::new("the gist"));
        let pipeline = pipeline_with(BASE_CONFIG, router, Some(summarizer.clone()));

        let shaped = pipeline
            .handle_call("srv__fetch", args(json!({"url": "u"})), None)
            .await
            .unwrap();
        assert!(shaped.meta.compressed);
        assert_eq!(shaped.content, vec![json!({"type": "text", "text": "the gist"})]);
        assert!(shaped.meta.summary_tokens < shaped.meta.original_tokens);
        assert_eq!(summarizer.budgets.lock().unwrap().as_slice(), &[100]);
    }

    #[tokio::test]
    async fn summarizer_failure_degrades_to_uncompressed() {
        let body = "long body ".repeat(50);
        let router = Arc::new(MockRouter::new(&["srv__fetch"], &body));
        let summarizer: Arc<dyn Summarize> = Arc::new(MockSummarizer::failing());
        let pipeline = pipeline_with(BASE_CONFIG, router, Some(summarizer));

        let shaped = pipeline
            .handle_call("srv__fetch", args(json!({"url": "u"})), None)
            .await
            .unwrap();
        assert!(!shaped.meta.compressed);
        assert!(shaped
            .meta
            .compression_error
            .as_deref()
            .unwrap()
            .contains("HTTP 500"));
        // Body is served unshaped (but shaped metadata still present).
        assert_eq!(shaped.content[0]["text"], json!(body));
    }

    #[tokio::test]
    async fn repeated_bypass_calls_escalate_the_budget() {
        let body = "long body ".repeat(50);
        let router = Arc::new(MockRouter::new(&["srv__fetch"], &body));
        let summarizer = Arc::new(MockSummarizer::new("gist"));
        let pipeline = pipeline_with(BASE_CONFIG, router, Some(summarizer.clone()));

        let bypass_args = || args(json!({"url": "u", "__clip_bypass_cache": true}));
        for _ in 0..4 {
            pipeline.handle_call("srv__fetch", bypass_args(), None).await.unwrap();
        }
        // multiplier 2.0, cap 3 levels: 100, 200, 400, 800.
        assert_eq!(
            summarizer.budgets.lock().unwrap().as_slice(),
            &[100, 200, 400, 800]
        );
    }

    #[tokio::test]
    async fn upstream_errors_propagate_and_are_not_cached() {
        let router = Arc::new(MockRouter::new(&["srv__fetch"], "x").failing());
        let pipeline = pipeline_with(BASE_CONFIG, Arc::clone(&router), None);

        let call = || pipeline.handle_call("srv__fetch", args(json!({"url": "u"})), None);
        assert!(matches!(call().await, Err(ClipError::Upstream { .. })));
        assert!(pipeline.cache().is_empty());
        // The error was not cached: the upstream is asked again.
        assert!(call().await.is_err());
        assert_eq!(router.call_count(), 2);
    }

    #[tokio::test]
    async fn error_results_are_never_compressed() {
        let body = "long error ".repeat(50);
        let router = Arc::new(MockRouter {
            result: RawToolResult {
                content: vec![json!({"type": "text", "text": body})],
                is_error: true,
            },
            ..MockRouter::new(&["srv__fetch"], "")
        });
        let summarizer = Arc::new(MockSummarizer::new("gist"));
        let pipeline = pipeline_with(BASE_CONFIG, router, Some(summarizer.clone()));

        let shaped = pipeline
            .handle_call("srv__fetch", args(json!({"url": "u"})), None)
            .await
            .unwrap();
        assert!(shaped.is_error);
        assert!(!shaped.meta.compressed);
        assert!(summarizer.budgets.lock().unwrap().is_empty());
    }

    #[test]
    fn result_value_carries_meta() {
        let shaped = ShapedResponse {
            content: vec![json!({"type": "text", "text": "t"})],
            is_error: false,
            meta: ShapeMeta {
                compressed: true,
                original_tokens: 100,
                summary_tokens: 10,
                masked_count: 2,
                cached: false,
                compression_error: None,
            },
        };
        let value = shaped.to_result_value();
        assert_eq!(value["isError"], json!(false));
        assert_eq!(value["_meta"]["clip"]["compressed"], json!(true));
        assert_eq!(value["_meta"]["clip"]["maskedCount"], json!(2));
    }
}
