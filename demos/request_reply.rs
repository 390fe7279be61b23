//! Request/reply between two applications of an embedded registry
//!
//! Run with: cargo run --example request_reply [REQUESTS]
//!
//! Starts a registry on 127.0.0.1:7000, attaches a "responder" application
//! serving "echo" and a "requester" application sending REQUESTS messages
//! (default 5) to it.

use std::sync::Arc;

use cameo_rs::client::{ClientConfig, This};
use cameo_rs::coms::basic::Responder;
use cameo_rs::coms::Requester;
use cameo_rs::{RegistryServer, ServerConfig};

async fn serve(this: Arc<This>) -> cameo_rs::Result<()> {
    let responder = Responder::create(&this, "echo").await?;
    println!("Serving {}", responder);

    while let Some(request) = responder.receive().await {
        tracing::info!(from = %request.requester(), "Request received");
        let reply = format!("echo: {}", request.get_string());
        if !request.reply(reply)? {
            tracing::warn!("Requester gone before the reply");
        }
    }

    responder.terminate().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let requests: usize = match std::env::args().nth(1) {
        Some(n) => n.parse()?,
        None => 5,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cameo_rs=debug".parse()?)
                .add_directive("request_reply=debug".parse()?),
        )
        .init();

    let server = Arc::new(RegistryServer::bind(ServerConfig::with_addr("127.0.0.1:7000".parse()?)).await?);
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let config = ClientConfig::new(server.endpoint()).bind_host("127.0.0.1");
    let responder_app = This::init(config.clone(), "responder").await?;
    let requester_app = This::init(config, "requester").await?;

    let responding = tokio::spawn(serve(responder_app.clone()));

    let target = requester_app.server().connect_with_id(responder_app.id()).await?;
    let requester = Requester::create(&requester_app, &target, "echo").await?;
    println!("Connected {}", requester);

    for i in 0..requests {
        requester.send(format!("message {}", i)).await?;
        match requester.receive().await {
            Some(reply) => println!("{}", String::from_utf8_lossy(&reply)),
            None => println!("No reply to message {}", i),
        }
    }

    responder_app.cancel_all();
    responding.await??;

    requester_app.terminate().await?;
    responder_app.terminate().await?;

    let state = target.wait_for().await;
    println!("Responder application finished in state {}", state);

    serving.abort();
    Ok(())
}
