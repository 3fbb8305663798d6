//! `clip` binary: load the configuration, connect the upstreams, serve MCP
//! on stdio until EOF or a shutdown signal.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 fatal runtime
//! error.

mod args;
mod logging;
mod shutdown;

use anyhow::Context;
use args::CliArgs;
use clap::Parser;
use clip::cache::ResponseCache;
use clip::escalation::RetryEscalationTracker;
use clip::mask::PiiMasker;
use clip::summarize::{LlmSummarizer, Summarize};
use clip::{CallPipeline, Config, PolicyResolver, ProxyServer, UpstreamRegistry, UpstreamRouter};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    if args.init {
        return write_example_config(&args.config);
    }

    let config = match Config::load(&args.config).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("clip: {e}");
            return ExitCode::from(1);
        }
    };
    logging::init(config.logging.as_ref().and_then(|l| l.level.as_deref()));

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn write_example_config(path: &Path) -> ExitCode {
    if path.exists() {
        eprintln!("clip: refusing to overwrite existing {}", path.display());
        return ExitCode::from(1);
    }
    if let Err(e) = std::fs::write(path, Config::example_json()) {
        eprintln!("clip: cannot write {}: {}", path.display(), e);
        return ExitCode::from(1);
    }
    println!("wrote example configuration to {}", path.display());
    ExitCode::SUCCESS
}

async fn run(config: Config) -> anyhow::Result<()> {
    let timeouts = config.timeouts.clone();
    let config = Arc::new(config);
    let resolver = Arc::new(PolicyResolver::new(Arc::clone(&config)));
    let registry = Arc::new(UpstreamRegistry::connect(&config, Arc::clone(&resolver)).await);
    if registry.is_empty() {
        log::warn!("no upstreams available, serving an empty catalog");
    }
    let router: Arc<dyn UpstreamRouter> = registry.clone();

    let summarizer: Option<Arc<dyn Summarize>> = match resolver.summarizer_llm() {
        Some(llm) => Some(Arc::new(
            LlmSummarizer::new(llm.clone(), timeouts.summarizer())
                .context("summarizer setup failed")?,
        )),
        None => None,
    };

    let cache = Arc::new(ResponseCache::new());
    let escalation = Arc::new(RetryEscalationTracker::new(resolver.retry_escalation()));
    let masker = Arc::new(PiiMasker::new(timeouts.masker_llm()));
    let pipeline = Arc::new(CallPipeline::new(
        resolver,
        Arc::clone(&router),
        Arc::clone(&cache),
        masker,
        summarizer,
        Arc::clone(&escalation),
    ));

    // Periodic sweep bounds cache and escalation-tracker memory.
    tokio::spawn({
        let cache = Arc::clone(&cache);
        let escalation = Arc::clone(&escalation);
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let evicted = cache.sweep();
                let pruned = escalation.prune();
                if evicted + pruned > 0 {
                    log::debug!("swept {evicted} cache entries, {pruned} escalation streaks");
                }
            }
        }
    });

    let proxy = ProxyServer::new(pipeline, router);
    log::info!("clip ready, serving MCP on stdio");

    tokio::select! {
        result = proxy.serve(tokio::io::stdin(), tokio::io::stdout()) => {
            result.context("serve loop failed")?;
        }
        _ = shutdown::signal() => {}
    }

    registry.shutdown().await;
    Ok(())
}
