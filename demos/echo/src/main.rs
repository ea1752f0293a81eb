//! gqlx echo demo
//!
//! Runs a server and a client on one in-process broker: a query echoes its
//! variables back, a subscription counts down and completes.
//!
//! # Running
//! ```bash
//! RUST_LOG=gqlx=debug cargo run -p gqlx-echo
//! ```

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use gqlx_broker::MemoryBroker;
use gqlx_client::{BrokerTransport, BrokerTransportConfig, CancellationToken, Client};
use gqlx_core::{Operation, OperationResult, Result};
use gqlx_server::{BrokerServer, Executor, ResultStream, ServerConfig};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Echoes variables and counts down from `from`.
struct Echo;

#[async_trait]
impl Executor for Echo {
    async fn execute(&self, operation: Operation) -> OperationResult {
        OperationResult::data(serde_json::json!({ "echo": operation.variables }))
    }

    async fn subscribe(&self, operation: Operation) -> Result<ResultStream> {
        let from = operation
            .variables
            .get("from")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(3);
        let ticks = stream::iter((0..=from).rev()).then(|n| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            OperationResult::data(serde_json::json!({ "countdown": n }))
        });
        Ok(ticks.boxed())
    }
}

#[derive(Debug, Deserialize)]
struct EchoData {
    echo: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Countdown {
    countdown: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("gqlx=info,echo=info")),
        )
        .with_target(false)
        .compact()
        .init();

    let bus = MemoryBroker::new();
    let shutdown = CancellationToken::new();

    let server = BrokerServer::bind(bus.connect(), Echo, ServerConfig::new("graphql")).await?;
    tokio::spawn(server.serve(shutdown.clone()));
    info!("server listening on subject graphql");

    let client = Client::new(BrokerTransport::new(
        bus.connect(),
        BrokerTransportConfig::new("graphql"),
    ));

    let data: EchoData = client
        .query(
            Operation::new("query Echo($message: String) { echo(message: $message) }")
                .with_variable("message", "hello"),
        )
        .await?;
    info!(echo = %data.echo, "query answered");

    let subscription = client
        .subscription(
            Operation::new("subscription Countdown($from: Int) { countdown(from: $from) }")
                .with_variable("from", 3),
        )
        .await;
    while let Some(tick) = subscription.next_as::<Countdown>().await {
        info!(countdown = tick?.countdown, "tick");
    }
    if let Some(err) = subscription.err() {
        return Err(err);
    }
    info!("subscription completed");

    shutdown.cancel();
    Ok(())
}
