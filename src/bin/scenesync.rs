use anyhow::Result;
use scenesync::backend::HttpBackend;
use scenesync::tools::ToolRegistry;
use scenesync::transport::serve_jsonl;
use scenesync::{logging, Config, Session};
use std::sync::Arc;
use tokio::io::BufReader;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    logging::init(&config)?;

    let mut registry = ToolRegistry::default();
    config.validate(&registry)?;
    config.apply_to_registry(&mut registry);

    let backend = HttpBackend::from_config(&config)?;
    tracing::info!(backend_url = %backend.url(), "generation backend configured");

    let session = Session::open(&config, registry, Arc::new(backend));
    serve_jsonl(
        session,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}
