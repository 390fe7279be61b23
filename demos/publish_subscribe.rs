//! Publish/subscribe between applications of an embedded registry
//!
//! Run with: cargo run --example publish_subscribe [SUBSCRIBERS]
//!
//! Starts a registry on 127.0.0.1:7000. A "publisher" application waits for
//! SUBSCRIBERS subscribers (default 2), publishes a few values and ends the
//! stream. Each "subscriber" application prints what it receives.

use std::sync::Arc;
use std::time::Duration;

use cameo_rs::client::{ClientConfig, This};
use cameo_rs::coms::{Publisher, Subscriber};
use cameo_rs::{RegistryServer, ServerConfig};

async fn subscribe(config: ClientConfig, index: usize, publisher_id: i32) -> cameo_rs::Result<()> {
    let this = This::init(config, format!("subscriber-{}", index)).await?;
    let app = this.server().connect_with_id(publisher_id).await?;

    let subscriber = Subscriber::create(&this, &app, "values").await?;
    println!("[{}] {}", index, subscriber);

    while let Some(data) = subscriber.receive().await {
        println!("[{}] received {}", index, String::from_utf8_lossy(&data));
    }

    if subscriber.has_ended() {
        println!("[{}] stream ended", index);
    }

    this.terminate().await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscribers: usize = match std::env::args().nth(1) {
        Some(n) => n.parse()?,
        None => 2,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cameo_rs=debug".parse()?)
                .add_directive("publish_subscribe=debug".parse()?),
        )
        .init();

    let server = Arc::new(RegistryServer::bind(ServerConfig::with_addr("127.0.0.1:7000".parse()?)).await?);
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let config = ClientConfig::new(server.endpoint()).bind_host("127.0.0.1");
    let publisher_app = This::init(config.clone(), "publisher").await?;

    let publisher = Publisher::create(&publisher_app, "values", subscribers as i32).await?;
    println!("Created {}", publisher);

    let mut tasks = Vec::with_capacity(subscribers);
    for index in 0..subscribers {
        tasks.push(tokio::spawn(subscribe(config.clone(), index, publisher_app.id())));
    }

    if !publisher.wait_for_subscribers().await? {
        println!("Wait for subscribers canceled");
        return Ok(());
    }
    println!("{} subscribers synchronized", subscribers);

    for i in 0..10 {
        publisher.send_two_parts(format!("value {}", i), i.to_string())?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    publisher.terminate().await;

    for task in tasks {
        task.await??;
    }

    publisher_app.terminate().await?;
    serving.abort();
    Ok(())
}
