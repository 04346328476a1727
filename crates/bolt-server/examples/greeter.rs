//! Greeter demo: a server and a client in one process, over TCP with the
//! binary wire layout and JSON payloads.
//!
//! Run with:
//!   cargo run -p bolt-server --example greeter

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use bolt_client::Client;
use bolt_core::context::Context;
use bolt_core::transport::TcpTransport;
use bolt_middleware::Logging;
use bolt_server::{Server, Service};

#[derive(Debug, Serialize, Deserialize)]
struct HelloRequest {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloResponse {
    message: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let transport = Arc::new(TcpTransport::new());
    let server = Arc::new(Server::new(transport.clone()));
    server.use_middleware(Logging::new());
    server.register(Service::new("Greeter").method(
        "SayHello",
        |_ctx, req: HelloRequest| async move {
            Ok(HelloResponse {
                message: format!("hi {}", req.name),
            })
        },
    ))?;

    let serving = server.clone();
    tokio::spawn(async move {
        if let Err(e) = serving.serve("127.0.0.1:0").await {
            tracing::info!(error = %e, "server loop ended");
        }
    });
    let addr = loop {
        if let Some(addr) = transport.local_addr() {
            break addr.to_string();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    tracing::info!(%addr, "greeter server up");

    let client = Client::new(&addr, TcpTransport::new());
    let reply: HelloResponse = client
        .call(
            &Context::background(),
            "Greeter.SayHello",
            &HelloRequest {
                name: "Thor".to_string(),
            },
        )
        .await?;
    println!("{}", reply.message);

    client.close().await?;
    server.stop().await?;
    Ok(())
}
