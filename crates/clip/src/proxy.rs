//! Client-facing MCP server over stdio.
//!
//! Frames are newline-delimited JSON-RPC 2.0. Requests are handled
//! concurrently, but responses leave in request order: each request enqueues
//! a one-shot receiver into a FIFO the writer task drains, so a slow call
//! holds back later responses on the same session without blocking their
//! processing. Malformed frames are dropped with a log; they never kill the
//! session.

use crate::error::ClipError;
use crate::pipeline::CallPipeline;
use crate::rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::upstream::UpstreamRouter;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

pub const SERVER_NAME: &str = "clip";
const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Clone)]
pub struct ProxyServer {
    pipeline: Arc<CallPipeline>,
    router: Arc<dyn UpstreamRouter>,
}

impl ProxyServer {
    pub fn new(pipeline: Arc<CallPipeline>, router: Arc<dyn UpstreamRouter>) -> Self {
        Self { pipeline, router }
    }

    /// Run the serve loop until the reader reaches EOF.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<oneshot::Receiver<String>>();

        // Writer task: drains the FIFO, awaiting each response slot in turn.
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(slot) = queue_rx.recv().await {
                // A dropped slot means the handler died; skip it.
                let Ok(line) = slot.await else { continue };
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let request: JsonRpcRequest = match serde_json::from_str(line) {
                Ok(request) => request,
                Err(e) => {
                    log::warn!("dropping malformed frame: {e}");
                    continue;
                }
            };
            if request.is_notification() {
                self.handle_notification(&request);
                continue;
            }

            let (tx, rx) = oneshot::channel();
            if queue_tx.send(rx).is_err() {
                break;
            }
            let this = self.clone();
            tokio::spawn(async move {
                let response = this.handle_request(request).await;
                let line = serde_json::to_string(&response).unwrap_or_else(|e| {
                    format!(
                        r#"{{"jsonrpc":"2.0","id":null,"error":{{"code":-32603,"message":"unserializable response: {e}"}}}}"#
                    )
                });
                let _ = tx.send(line);
            });
        }

        drop(queue_tx);
        let _ = writer_task.await;
        log::info!("client session closed");
        Ok(())
    }

    fn handle_notification(&self, request: &JsonRpcRequest) {
        match request.method.as_str() {
            "notifications/initialized" => log::debug!("client initialized"),
            "notifications/cancelled" => log::debug!("client cancelled a request"),
            other => log::trace!("ignoring notification {other}"),
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);
        match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(id, self.initialize_result(&params)),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => {
                JsonRpcResponse::success(id, json!({"tools": self.router.list_tools()}))
            }
            "tools/call" => match self.tools_call(&params).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::failure(id, (&e).into()),
            },
            "resources/list" => JsonRpcResponse::success(
                id,
                json!({"resources": self.router.list_resources().await}),
            ),
            "resources/read" => match self.resources_read(&params).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::failure(id, (&e).into()),
            },
            "prompts/list" => {
                JsonRpcResponse::success(id, json!({"prompts": self.router.list_prompts().await}))
            }
            "prompts/get" => match self.prompts_get(&params).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::failure(id, (&e).into()),
            },
            other => JsonRpcResponse::failure(id, JsonRpcError::method_not_found(other)),
        }
    }

    fn initialize_result(&self, params: &Value) -> Value {
        // Echo the client's protocol version; the verbs CLIP shapes are
        // stable across the versions it accepts.
        let version = params
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PROTOCOL_VERSION);
        json!({
            "protocolVersion": version,
            "capabilities": {
                "tools": {"listChanged": false},
                "resources": {},
                "prompts": {},
            },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    async fn tools_call(&self, params: &Value) -> Result<Value, ClipError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ClipError::Protocol("tools/call requires a tool name".into()))?;
        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        let goal = params
            .get("_meta")
            .and_then(|meta| meta.get("goal"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let shaped = self.pipeline.handle_call(name, args, goal).await?;
        Ok(shaped.to_result_value())
    }

    async fn resources_read(&self, params: &Value) -> Result<Value, ClipError> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| ClipError::Protocol("resources/read requires a uri".into()))?;
        self.router.read_resource(uri).await
    }

    async fn prompts_get(&self, params: &Value) -> Result<Value, ClipError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ClipError::Protocol("prompts/get requires a name".into()))?;
        let args = match params.get("arguments") {
            Some(Value::Object(map)) => Some(map.clone()),
            _ => None,
        };
        self.router.get_prompt(name, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseCache;
    use crate::config::Config;
    use crate::escalation::RetryEscalationTracker;
    use crate::mask::PiiMasker;
    use crate::policy::PolicyResolver;
    use crate::upstream::{RawToolResult, ToolDescriptor};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{ReadHalf, WriteHalf};

    struct StaticRouter;

    #[async_trait]
    impl UpstreamRouter for StaticRouter {
        fn lookup(&self, qualified: &str) -> Option<ToolDescriptor> {
            ["srv__fetch", "srv__slow"]
                .contains(&qualified)
                .then(|| ToolDescriptor {
                    name: qualified.to_string(),
                    description: Some("a tool".to_string()),
                    input_schema: json!({"type": "object"}),
                })
        }

        fn list_tools(&self) -> Vec<ToolDescriptor> {
            ["srv__fetch", "srv__slow"]
                .iter()
                .filter_map(|name| self.lookup(name))
                .collect()
        }

        async fn call_tool(
            &self,
            qualified: &str,
            _args: Map<String, Value>,
        ) -> Result<RawToolResult, ClipError> {
            if qualified == "srv__slow" {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(RawToolResult {
                content: vec![json!({"type": "text", "text": format!("reply from {qualified}")})],
                is_error: false,
            })
        }
    }

    struct TestClient {
        writer: WriteHalf<tokio::io::DuplexStream>,
        lines: tokio::io::Lines<BufReader<ReadHalf<tokio::io::DuplexStream>>>,
    }

    impl TestClient {
        async fn send(&mut self, frame: Value) {
            let mut line = frame.to_string();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    fn start_proxy() -> TestClient {
        let config = Arc::new(
            Config::from_json(
                r#"{"upstreams": [{"id": "srv", "transport": "stdio", "command": "echo"}]}"#,
            )
            .unwrap(),
        );
        let resolver = Arc::new(PolicyResolver::new(config));
        let router: Arc<dyn UpstreamRouter> = Arc::new(StaticRouter);
        let pipeline = Arc::new(CallPipeline::new(
            Arc::clone(&resolver),
            Arc::clone(&router),
            Arc::new(ResponseCache::new()),
            Arc::new(PiiMasker::new(Duration::from_secs(1))),
            None,
            Arc::new(RetryEscalationTracker::new(resolver.retry_escalation())),
        ));
        let proxy = ProxyServer::new(pipeline, router);

        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let (server_read, server_write) = tokio::io::split(server_io);
        tokio::spawn(async move { proxy.serve(server_read, server_write).await });

        let (client_read, writer) = tokio::io::split(client_io);
        TestClient {
            writer,
            lines: BufReader::new(client_read).lines(),
        }
    }

    #[tokio::test]
    async fn initialize_and_list_tools() {
        let mut client = start_proxy();
        client
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
                         "params": {"protocolVersion": "2025-03-26"}}))
            .await;
        let response = client.recv().await;
        assert_eq!(response["id"], json!(1));
        assert_eq!(response["result"]["protocolVersion"], json!("2025-03-26"));
        assert_eq!(response["result"]["serverInfo"]["name"], json!("clip"));

        client
            .send(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .await;
        let response = client.recv().await;
        let tools = response["result"]["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["name"] == json!("srv__fetch")));
    }

    #[tokio::test]
    async fn tools_call_round_trip() {
        let mut client = start_proxy();
        client
            .send(json!({"jsonrpc": "2.0", "id": 5, "method": "tools/call",
                         "params": {"name": "srv__fetch", "arguments": {"url": "u"}}}))
            .await;
        let response = client.recv().await;
        assert_eq!(response["id"], json!(5));
        assert_eq!(
            response["result"]["content"][0]["text"],
            json!("reply from srv__fetch")
        );
        assert_eq!(response["result"]["_meta"]["clip"]["compressed"], json!(false));
    }

    #[tokio::test]
    async fn unknown_tool_and_unknown_method() {
        let mut client = start_proxy();
        client
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                         "params": {"name": "srv__nope"}}))
            .await;
        let response = client.recv().await;
        assert_eq!(response["error"]["code"], json!(-32602));

        client
            .send(json!({"jsonrpc": "2.0", "id": 2, "method": "bogus/verb"}))
            .await;
        let response = client.recv().await;
        assert_eq!(response["error"]["code"], json!(-32601));
    }

    #[tokio::test]
    async fn malformed_frames_and_notifications_do_not_break_the_session() {
        let mut client = start_proxy();
        client.send_raw("this is not json\n").await;
        client
            .send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        client
            .send(json!({"jsonrpc": "2.0", "id": 9, "method": "ping"}))
            .await;
        // The first response on the wire is the pong: the bad frame was
        // dropped and the notification got no reply.
        let response = client.recv().await;
        assert_eq!(response["id"], json!(9));
        assert_eq!(response["result"], json!({}));
    }

    #[tokio::test]
    async fn responses_keep_request_order() {
        let mut client = start_proxy();
        client
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                         "params": {"name": "srv__slow"}}))
            .await;
        client
            .send(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
                         "params": {"name": "srv__fetch"}}))
            .await;
        // The fast call finishes first, but the slow call's response is
        // written first.
        let first = client.recv().await;
        let second = client.recv().await;
        assert_eq!(first["id"], json!(1));
        assert_eq!(second["id"], json!(2));
    }

    #[tokio::test]
    async fn resource_and_prompt_passthrough_defaults() {
        let mut client = start_proxy();
        client
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "resources/list"}))
            .await;
        assert_eq!(client.recv().await["result"]["resources"], json!([]));

        client
            .send(json!({"jsonrpc": "2.0", "id": 2, "method": "resources/read",
                         "params": {"uri": "file:///nope"}}))
            .await;
        assert_eq!(client.recv().await["error"]["code"], json!(-32602));

        client
            .send(json!({"jsonrpc": "2.0", "id": 3, "method": "prompts/get",
                         "params": {"name": "nope"}}))
            .await;
        assert_eq!(client.recv().await["error"]["code"], json!(-32602));
    }
}
