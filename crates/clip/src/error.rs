use thiserror::Error;

/// Errors raised while proxying tool calls.
///
/// Every payload is a plain string so the enum stays `Clone`: a failed
/// single-flight computation is handed to every waiter of the same cache key.
#[derive(Debug, Clone, Error)]
pub enum ClipError {
    /// Invalid or unloadable configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The qualified tool does not exist (or is hidden, which must be
    /// indistinguishable from not existing).
    #[error("unknown tool: {0}")]
    ToolNotFound(String),

    /// No single upstream exposes the requested resource.
    #[error("unknown resource: {0}")]
    ResourceNotFound(String),

    /// No single upstream exposes the requested prompt.
    #[error("unknown prompt: {0}")]
    PromptNotFound(String),

    /// An upstream returned an error for this call.
    #[error("upstream `{upstream}`: {message}")]
    Upstream { upstream: String, message: String },

    /// The upstream session is gone; its tools are no longer served.
    #[error("upstream `{0}` unavailable")]
    UpstreamUnavailable(String),

    /// Summarizer failure. Recovered by the pipeline: the uncompressed
    /// response is served with the failure annotated.
    #[error("summarizer: {0}")]
    Summarizer(String),

    /// LLM-fallback masking failure. Degrades to regex-only masking.
    #[error("masker: {0}")]
    Masker(String),

    /// Cache bookkeeping failure. Treated as a miss, never fails the call.
    #[error("cache: {0}")]
    Cache(String),

    /// Malformed frame from the client or an upstream.
    #[error("protocol: {0}")]
    Protocol(String),
}

impl ClipError {
    pub fn upstream(upstream: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            upstream: upstream.into(),
            message: message.into(),
        }
    }
}
