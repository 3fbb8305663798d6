//! CLIP is a transparent, response-shaping proxy for the Model Context
//! Protocol. It presents one MCP server to the client whose catalog is the
//! union of every configured upstream's tools, qualified as
//! `<upstream_id>__<tool>`, and shapes every `tools/call` result on the way
//! back: caching with single-flight deduplication, PII masking, LLM
//! summarization of oversized bodies, parameter hiding/overriding, and
//! retry-driven budget escalation.
//!
//! # Architecture
//! - [`config`]: JSON configuration, partial per-layer records.
//! - [`policy`]: field-wise merge of the config layers into effective
//!   per-tool policies.
//! - [`upstream`]: rmcp client sessions, the qualified catalog, routing.
//! - [`pipeline`]: the per-call shaping order and its failure fallbacks.
//! - [`proxy`]: the client-facing JSON-RPC/stdio server.
//!
//! The cache ([`cache`]), masker ([`mask`]), summarizer ([`summarize`]) and
//! escalation tracker ([`escalation`]) are the pipeline's collaborators;
//! each is usable on its own.

pub mod cache;
pub mod config;
pub mod error;
pub mod escalation;
pub mod mask;
pub mod pipeline;
pub mod policy;
pub mod proxy;
pub mod rpc;
pub mod summarize;
pub mod token;
pub mod upstream;

pub use config::Config;
pub use error::ClipError;
pub use pipeline::{CallPipeline, ShapedResponse};
pub use policy::PolicyResolver;
pub use proxy::ProxyServer;
pub use upstream::{UpstreamRegistry, UpstreamRouter};
