// In-process demo: an observable server resource and a client endpoint on
// the loopback transport. Run with RUST_LOG=trace to watch the message flow.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use coapd::config::EndpointConfig;
use coapd::endpoint::{Endpoint, ObservationHandler};
use coapd::error::CoapError;
use coapd::messages::{Message, Method, Status};
use coapd::observe::{Notification, ObserveOptions};
use coapd::resource::Exchange;
use coapd::transport::LoopbackNetwork;

#[derive(Parser)]
#[command(about = "coapd loopback demo")]
struct Args {
    /// Number of notifications the observable resource emits.
    #[arg(long, default_value_t = 6)]
    notifications: u32,
    /// Delay between notifications in milliseconds.
    #[arg(long, default_value_t = 300)]
    interval_ms: u64,
}

#[derive(Default)]
struct Watcher {
    tokens: Mutex<HashSet<Vec<u8>>>,
}

impl Watcher {
    fn watch(&self, token: Vec<u8>) {
        self.tokens.lock().unwrap().insert(token);
    }
}

impl ObservationHandler for Watcher {
    fn has_observation(&self, token: &[u8]) -> bool {
        self.tokens.lock().unwrap().contains(token)
    }

    fn notify(&self, message: Message) {
        println!(
            "notification seq:{:?} payload:{}",
            message.options.observe,
            String::from_utf8_lossy(&message.payload)
        );
    }

    fn terminated(&self, token: &[u8], reason: CoapError) {
        self.tokens.lock().unwrap().remove(token);
        println!("observation {} ended: {}", hex::encode(token), reason);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let network = LoopbackNetwork::new();
    let server_addr: SocketAddr = "10.0.0.1:5683".parse()?;
    let client_addr: SocketAddr = "10.0.0.2:5683".parse()?;

    let server = Endpoint::new(network.endpoint(server_addr), EndpointConfig::default())?;
    server.register(
        "/echo",
        Arc::new(|exchange: &mut Exchange| {
            let payload = exchange.request().payload.clone();
            exchange.respond(Status::Content, payload);
            Ok(())
        }),
    );
    let temperature = server.observable(
        "/sensors/temp",
        Arc::new(|exchange: &mut Exchange| {
            exchange.respond(Status::Content, "21.0");
            Ok(())
        }),
        ObserveOptions::default(),
    );

    let client = Endpoint::new(network.endpoint(client_addr), EndpointConfig::default())?;
    let watcher = Arc::new(Watcher::default());
    client.set_observation_handler(watcher.clone());

    let echoed = client
        .request(
            Message::request(server_addr, Method::Get, "/echo")
                .with_token(vec![0x01])
                .with_payload("hello"),
        )
        .await?;
    println!(
        "echo -> {} {}",
        match echoed.code {
            coapd::messages::Code::Response(status) => status.to_string(),
            other => format!("{:?}", other),
        },
        String::from_utf8_lossy(&echoed.payload)
    );

    let token = vec![0xaa];
    watcher.watch(token.clone());
    let registered = client
        .request(
            Message::request(server_addr, Method::Get, "/sensors/temp")
                .with_token(token)
                .with_observe(0),
        )
        .await?;
    println!(
        "observing /sensors/temp seq:{:?} payload:{}",
        registered.options.observe,
        String::from_utf8_lossy(&registered.payload)
    );

    for n in 0..args.notifications {
        tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        temperature.notify_change(Notification::new(format!("21.{}", n)));
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.ping(server_addr).await?;
    println!("ping -> pong");

    temperature.notify_termination(None);
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.stop().await;
    server.stop().await;
    Ok(())
}
