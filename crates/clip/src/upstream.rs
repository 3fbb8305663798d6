//! Upstream registry.
//!
//! One rmcp client session per configured upstream (child process over
//! stdio, SSE, or streamable HTTP). Tool names are qualified as
//! `<upstream_id>__<tool>` so identically named tools on different upstreams
//! cannot collide. The advertised catalog is synthesized from the cached
//! `tools/list` results with the resolver's filters applied: hidden tools
//! removed, descriptions overridden, hidden parameters stripped from the
//! schema.
//!
//! An upstream that fails to start is logged and skipped; the proxy serves
//! the rest (degraded mode). A session that dies mid-run is marked dead: its
//! tools leave the catalog and calls to it fail with `upstream unavailable`.
//! No automatic reconnection.

use crate::config::{Config, TransportKind, UpstreamConfig};
use crate::error::ClipError;
use crate::policy::{qualify, split_qualified, PolicyResolver};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use rmcp::{
    model::{
        CallToolRequestParam, ClientCapabilities, ClientInfo, GetPromptRequestParam,
        Implementation, ProtocolVersion, ReadResourceRequestParam,
    },
    service::{DynService, RunningService, ServerSink},
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        SseClientTransport, StreamableHttpClientTransport,
    },
    RoleClient, ServiceExt,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use std::sync::Arc;
use which::which;

type UpstreamService = RunningService<RoleClient, Box<dyn DynService<RoleClient>>>;

/// A catalog entry as advertised to the client, post-filter.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDescriptor {
    /// Qualified name.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// An upstream `tools/call` result reduced to the wire fields the pipeline
/// shapes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawToolResult {
    pub content: Vec<Value>,
    pub is_error: bool,
}

impl RawToolResult {
    pub fn from_value(value: &Value) -> Self {
        Self {
            content: value
                .get("content")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            is_error: value
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

/// The pipeline's and front-end's view of the upstream side. The registry is
/// the production implementation; tests substitute mocks.
#[async_trait]
pub trait UpstreamRouter: Send + Sync {
    /// Post-filter catalog entry for a qualified name, if the tool exists
    /// and is visible.
    fn lookup(&self, qualified: &str) -> Option<ToolDescriptor>;

    /// The unioned, post-filter catalog.
    fn list_tools(&self) -> Vec<ToolDescriptor>;

    async fn call_tool(
        &self,
        qualified: &str,
        args: Map<String, Value>,
    ) -> Result<RawToolResult, ClipError>;

    async fn list_resources(&self) -> Vec<Value> {
        Vec::new()
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, ClipError> {
        Err(ClipError::ResourceNotFound(uri.to_string()))
    }

    async fn list_prompts(&self) -> Vec<Value> {
        Vec::new()
    }

    async fn get_prompt(
        &self,
        name: &str,
        _args: Option<Map<String, Value>>,
    ) -> Result<Value, ClipError> {
        Err(ClipError::PromptNotFound(name.to_string()))
    }
}

/// Apply the resolver's catalog filters to one raw upstream tool. Returns
/// `None` for hidden tools, which must look exactly like tools that never
/// existed.
pub(crate) fn shape_descriptor(
    resolver: &PolicyResolver,
    upstream_id: &str,
    raw_tool: &Value,
) -> Option<ToolDescriptor> {
    let bare = raw_tool.get("name")?.as_str()?;
    let qualified = qualify(upstream_id, bare);
    if resolver.is_tool_hidden(&qualified) {
        return None;
    }

    let mut schema = raw_tool
        .get("inputSchema")
        .cloned()
        .unwrap_or_else(|| json!({"type": "object"}));
    let hidden = resolver.hidden_parameters(&qualified);
    if !hidden.is_empty() {
        if let Some(properties) = schema.get_mut("properties").and_then(Value::as_object_mut) {
            for name in &hidden {
                properties.remove(name);
            }
        }
        if let Some(required) = schema.get_mut("required").and_then(Value::as_array_mut) {
            required.retain(|entry| {
                entry
                    .as_str()
                    .map(|name| !hidden.iter().any(|h| h == name))
                    .unwrap_or(true)
            });
        }
    }

    let description = resolver.description_override(&qualified).or_else(|| {
        raw_tool
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string)
    });

    Some(ToolDescriptor {
        name: qualified,
        description,
        input_schema: schema,
    })
}

struct UpstreamSession {
    peer: ServerSink,
    service: tokio::sync::Mutex<Option<UpstreamService>>,
    /// Raw `tools/list` entries as JSON, keyed by bare name order.
    tools: RwLock<Vec<Value>>,
    alive: AtomicBool,
}

impl UpstreamSession {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

pub struct UpstreamRegistry {
    resolver: Arc<PolicyResolver>,
    sessions: HashMap<String, UpstreamSession>,
    call_timeout: Duration,
}

impl UpstreamRegistry {
    /// Start every configured upstream, concurrently. Failures are logged
    /// and skipped so a single broken server does not take the proxy down.
    pub async fn connect(config: &Config, resolver: Arc<PolicyResolver>) -> Self {
        let call_timeout = config.timeouts.upstream();
        let startups = config.upstreams.iter().map(|upstream| async move {
            (
                upstream.id.clone(),
                Self::start_session(upstream, call_timeout).await,
            )
        });
        let mut sessions = HashMap::new();
        for (id, result) in futures::future::join_all(startups).await {
            match result {
                Ok(session) => {
                    log::info!(
                        "upstream `{id}` connected, {} tools advertised",
                        session.tools.read().map(|t| t.len()).unwrap_or(0)
                    );
                    sessions.insert(id, session);
                }
                Err(e) => {
                    log::error!("upstream `{id}` failed to start, continuing without it: {e:#}");
                }
            }
        }
        let registry = Self {
            resolver,
            sessions,
            call_timeout,
        };
        registry.warn_unsupplied_hidden_parameters();
        log::info!(
            "catalog ready: {} tools across {}/{} upstreams",
            registry.list_tools().len(),
            registry.sessions.len(),
            config.upstreams.len()
        );
        registry
    }

    /// A hidden parameter the upstream requires must get its value from
    /// `parameterOverrides`, since the client can no longer supply one. That
    /// can only be checked once the upstream schemas are known.
    fn warn_unsupplied_hidden_parameters(&self) {
        for (id, session) in &self.sessions {
            let Ok(tools) = session.tools.read() else {
                continue;
            };
            for raw in tools.iter() {
                let Some(bare) = raw.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let qualified = qualify(id, bare);
                let overrides = self.resolver.parameter_overrides(&qualified);
                for hidden in self.resolver.hidden_parameters(&qualified) {
                    let required = raw
                        .get("inputSchema")
                        .and_then(|schema| schema.get("required"))
                        .and_then(Value::as_array)
                        .map(|required| {
                            required.iter().any(|v| v.as_str() == Some(hidden.as_str()))
                        })
                        .unwrap_or(false);
                    if required && !overrides.contains_key(&hidden) {
                        log::warn!(
                            "tool `{qualified}` hides required parameter `{hidden}` but \
                             parameterOverrides supplies no value for it"
                        );
                    }
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    async fn start_session(
        config: &UpstreamConfig,
        timeout: Duration,
    ) -> anyhow::Result<UpstreamSession> {
        let service = Self::start_service(config, timeout).await?;
        let peer = service.peer().clone();
        let tools = tokio::time::timeout(timeout, peer.list_all_tools())
            .await
            .map_err(|_| anyhow!("tools/list timed out"))?
            .context("tools/list failed")?;
        let tools = tools
            .iter()
            .filter_map(|tool| serde_json::to_value(tool).ok())
            .collect::<Vec<_>>();
        Ok(UpstreamSession {
            peer,
            service: tokio::sync::Mutex::new(Some(service)),
            tools: RwLock::new(tools),
            alive: AtomicBool::new(true),
        })
    }

    async fn start_service(
        config: &UpstreamConfig,
        timeout: Duration,
    ) -> anyhow::Result<UpstreamService> {
        let client_info = ClientInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation::from_build_env(),
        };
        let service = match config.transport {
            TransportKind::Sse => {
                let url = config.url.as_deref().unwrap_or_default();
                let transport = match &config.token {
                    Some(token) => {
                        SseClientTransport::start_with_client(
                            bearer_client(token)?,
                            SseClientConfig {
                                sse_endpoint: url.to_string().into(),
                                ..Default::default()
                            },
                        )
                        .await?
                    }
                    None => SseClientTransport::start(url).await?,
                };
                tokio::time::timeout(timeout, client_info.clone().into_dyn().serve(transport))
                    .await
                    .map_err(|_| anyhow!("MCP handshake timed out"))??
            }
            TransportKind::Http => {
                let url = config.url.as_deref().unwrap_or_default();
                let transport = match &config.token {
                    Some(token) => StreamableHttpClientTransport::with_client(
                        bearer_client(token)?,
                        StreamableHttpClientTransportConfig {
                            uri: url.to_string().into(),
                            ..Default::default()
                        },
                    ),
                    None => StreamableHttpClientTransport::from_uri(url.to_string()),
                };
                tokio::time::timeout(timeout, client_info.clone().into_dyn().serve(transport))
                    .await
                    .map_err(|_| anyhow!("MCP handshake timed out"))??
            }
            TransportKind::Stdio => {
                let command = config.command.as_deref().unwrap_or_default();
                if which(command).is_err() && !std::path::Path::new(command).exists() {
                    bail!("command not found: {command}");
                }
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(&config.args)
                    .envs(&config.env)
                    .stderr(Stdio::inherit())
                    .stdout(Stdio::piped())
                    .stdin(Stdio::piped());
                let transport = rmcp::transport::child_process::TokioChildProcess::new(cmd)?;
                tokio::time::timeout(timeout, client_info.clone().into_dyn().serve(transport))
                    .await
                    .map_err(|_| anyhow!("MCP handshake timed out"))??
            }
        };
        Ok(service)
    }

    fn session<'a>(&self, qualified: &'a str) -> Option<(&'a str, &'a str, &UpstreamSession)> {
        let (upstream_id, bare) = split_qualified(qualified)?;
        let session = self.sessions.get(upstream_id)?;
        Some((upstream_id, bare, session))
    }

    /// Cancel every live session. Called once on shutdown.
    pub async fn shutdown(&self) {
        for (id, session) in &self.sessions {
            session.alive.store(false, Ordering::SeqCst);
            let service = session.service.lock().await.take();
            if let Some(service) = service {
                log::debug!("cancelling upstream `{id}` session");
                let _ = service.cancel().await;
            }
        }
    }

    fn live_sessions(&self) -> impl Iterator<Item = (&String, &UpstreamSession)> {
        self.sessions.iter().filter(|(_, s)| s.is_alive())
    }

    /// Transport-level failures are terminal for the session; tool-level
    /// errors are per-call.
    fn classify_call_error(
        &self,
        upstream_id: &str,
        session: &UpstreamSession,
        message: String,
    ) -> ClipError {
        let lowered = message.to_lowercase();
        if lowered.contains("transport") || lowered.contains("closed") || lowered.contains("channel")
        {
            session.alive.store(false, Ordering::SeqCst);
            log::warn!("upstream `{upstream_id}` session lost, removing its tools: {message}");
            ClipError::UpstreamUnavailable(upstream_id.to_string())
        } else {
            ClipError::upstream(upstream_id, message)
        }
    }
}

fn bearer_client(token: &str) -> anyhow::Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::AUTHORIZATION,
        reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))?,
    );
    Ok(reqwest::ClientBuilder::new()
        .default_headers(headers)
        .build()?)
}

#[async_trait]
impl UpstreamRouter for UpstreamRegistry {
    fn lookup(&self, qualified: &str) -> Option<ToolDescriptor> {
        let (upstream_id, bare, session) = self.session(qualified)?;
        if !session.is_alive() {
            return None;
        }
        let tools = session.tools.read().ok()?;
        let raw = tools
            .iter()
            .find(|tool| tool.get("name").and_then(Value::as_str) == Some(bare))?;
        shape_descriptor(&self.resolver, upstream_id, raw)
    }

    fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut catalog = Vec::new();
        for (upstream_id, session) in self.live_sessions() {
            let Ok(tools) = session.tools.read() else {
                continue;
            };
            catalog.extend(
                tools
                    .iter()
                    .filter_map(|raw| shape_descriptor(&self.resolver, upstream_id, raw)),
            );
        }
        catalog.sort_by(|a, b| a.name.cmp(&b.name));
        catalog
    }

    async fn call_tool(
        &self,
        qualified: &str,
        args: Map<String, Value>,
    ) -> Result<RawToolResult, ClipError> {
        let (upstream_id, bare, session) = self
            .session(qualified)
            .ok_or_else(|| ClipError::ToolNotFound(qualified.to_string()))?;
        if !session.is_alive() {
            return Err(ClipError::UpstreamUnavailable(upstream_id.to_string()));
        }
        let request = CallToolRequestParam {
            name: bare.to_string().into(),
            arguments: Some(args),
        };
        let result = tokio::time::timeout(self.call_timeout, session.peer.call_tool(request))
            .await
            .map_err(|_| {
                ClipError::upstream(
                    upstream_id,
                    format!("timed out after {}s", self.call_timeout.as_secs()),
                )
            })?
            .map_err(|e| self.classify_call_error(upstream_id, session, e.to_string()))?;
        let raw = serde_json::to_value(&result)
            .map_err(|e| ClipError::upstream(upstream_id, format!("unserializable result: {e}")))?;
        Ok(RawToolResult::from_value(&raw))
    }

    async fn list_resources(&self) -> Vec<Value> {
        let mut out = Vec::new();
        for (id, session) in self.live_sessions() {
            match tokio::time::timeout(self.call_timeout, session.peer.list_all_resources()).await
            {
                Ok(Ok(resources)) => out.extend(
                    resources
                        .iter()
                        .filter_map(|r| serde_json::to_value(r).ok()),
                ),
                Ok(Err(e)) => log::warn!("resources/list on `{id}` failed: {e}"),
                Err(_) => log::warn!("resources/list on `{id}` timed out"),
            }
        }
        out
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, ClipError> {
        // Route to the unique upstream exposing the uri; anything else is
        // indistinguishable from the resource not existing.
        let mut owner = None;
        for (id, session) in self.live_sessions() {
            let listed = tokio::time::timeout(self.call_timeout, session.peer.list_all_resources())
                .await;
            let Ok(Ok(resources)) = listed else { continue };
            let exposes = resources.iter().any(|r| {
                serde_json::to_value(r)
                    .ok()
                    .and_then(|v| v.get("uri").and_then(Value::as_str).map(|u| u == uri))
                    .unwrap_or(false)
            });
            if exposes {
                if owner.is_some() {
                    return Err(ClipError::ResourceNotFound(uri.to_string()));
                }
                owner = Some((id, session));
            }
        }
        let (id, session) = owner.ok_or_else(|| ClipError::ResourceNotFound(uri.to_string()))?;
        let result = tokio::time::timeout(
            self.call_timeout,
            session.peer.read_resource(ReadResourceRequestParam {
                uri: uri.to_string().into(),
            }),
        )
        .await
        .map_err(|_| ClipError::upstream(id.as_str(), "resources/read timed out"))?
        .map_err(|e| ClipError::upstream(id.as_str(), e.to_string()))?;
        serde_json::to_value(&result)
            .map_err(|e| ClipError::upstream(id.as_str(), format!("unserializable result: {e}")))
    }

    async fn list_prompts(&self) -> Vec<Value> {
        let mut out = Vec::new();
        for (id, session) in self.live_sessions() {
            match tokio::time::timeout(self.call_timeout, session.peer.list_all_prompts()).await {
                Ok(Ok(prompts)) => out.extend(
                    prompts
                        .iter()
                        .filter_map(|p| serde_json::to_value(p).ok()),
                ),
                Ok(Err(e)) => log::warn!("prompts/list on `{id}` failed: {e}"),
                Err(_) => log::warn!("prompts/list on `{id}` timed out"),
            }
        }
        out
    }

    async fn get_prompt(
        &self,
        name: &str,
        args: Option<Map<String, Value>>,
    ) -> Result<Value, ClipError> {
        let mut owner = None;
        for (id, session) in self.live_sessions() {
            let listed =
                tokio::time::timeout(self.call_timeout, session.peer.list_all_prompts()).await;
            let Ok(Ok(prompts)) = listed else { continue };
            let exposes = prompts.iter().any(|p| {
                serde_json::to_value(p)
                    .ok()
                    .and_then(|v| v.get("name").and_then(Value::as_str).map(|n| n == name))
                    .unwrap_or(false)
            });
            if exposes {
                if owner.is_some() {
                    return Err(ClipError::PromptNotFound(name.to_string()));
                }
                owner = Some((id, session));
            }
        }
        let (id, session) = owner.ok_or_else(|| ClipError::PromptNotFound(name.to_string()))?;
        let result = tokio::time::timeout(
            self.call_timeout,
            session.peer.get_prompt(GetPromptRequestParam {
                name: name.to_string().into(),
                arguments: args,
            }),
        )
        .await
        .map_err(|_| ClipError::upstream(id.as_str(), "prompts/get timed out"))?
        .map_err(|e| ClipError::upstream(id.as_str(), e.to_string()))?;
        serde_json::to_value(&result)
            .map_err(|e| ClipError::upstream(id.as_str(), format!("unserializable result: {e}")))
    }
}
