use std::collections::BTreeMap;
use std::path::PathBuf;

use axum::http::Method;
use clap::Parser;
use futures_util::StreamExt;
use serde::Deserialize;

use llm_relay::request::parse_headers;
use llm_relay::{BackendTarget, RelayConfig, RelayDriver, RequestContext, RequestEnvelope};

/// Runs one attempt of one request against one configured backend and prints the outcome.
#[derive(Parser)]
#[command(name = "relay-probe")]
struct Cli {
    #[arg(long)]
    config: PathBuf,
    /// Backend id from the config's `[[backends]]`.
    #[arg(long)]
    backend: String,
    /// JSON file: `{"method","path","query","headers","body"}`.
    #[arg(long)]
    request: PathBuf,
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Deserialize)]
struct ProbeRequest {
    #[serde(default = "default_method")]
    method: String,
    path: String,
    #[serde(default)]
    query: BTreeMap<String, String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    let config = RelayConfig::load(&cli.config).await?.apply_env();
    let backend = config
        .backend(&cli.backend)
        .ok_or_else(|| format!("unknown backend: {}", cli.backend))?;
    let target = BackendTarget::from_config(backend)?;

    let raw = tokio::fs::read_to_string(&cli.request).await?;
    let probe: ProbeRequest = serde_json::from_str(&raw)?;
    let mut envelope = RequestEnvelope::new(Method::from_bytes(probe.method.as_bytes())?, probe.path);
    for (name, value) in probe.query {
        envelope = envelope.with_query(name, value);
    }
    envelope.headers = parse_headers(&probe.headers)?;
    envelope.body = probe.body;

    let driver = RelayDriver::from_config(&config)?;
    let ctx = RequestContext::new();
    let outcome = driver.attempt(&ctx, &envelope, &target).await;

    let retry = outcome.is_retry();
    let response = outcome.into_response();
    let status = response.status();
    let mut body = response.into_body().into_data_stream();
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        bytes.extend_from_slice(&chunk?);
    }

    let report = serde_json::json!({
        "outcome": if retry { "retry" } else { "relayed" },
        "status": status.as_u16(),
        "body": String::from_utf8_lossy(&bytes),
        "telemetry": ctx.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
