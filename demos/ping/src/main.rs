//! Netcode ping demo.
//!
//! ```bash
//! cargo run -p netcode-ping -- keygen
//! cargo run -p netcode-ping -- server --key <private-hex>
//! cargo run -p netcode-ping -- client --server 127.0.0.1:7777 --server-key <public-hex>
//! ```
//!
//! Logging follows `RUST_LOG` (e.g. `RUST_LOG=netcode_transport=debug`).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use netcode_transport::core::{PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};
use netcode_transport::prelude::*;
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "netcode-ping", version, about = "Ping over the netcode transport")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a static keypair.
    Keygen,
    /// Echo everything received back to its sender.
    Server {
        /// Address to listen on.
        #[arg(long, default_value = "0.0.0.0:7777")]
        bind: SocketAddr,
        /// Hex-encoded private key. A fresh one is generated when omitted.
        #[arg(long)]
        key: Option<String>,
    },
    /// Connect, ping and send one fragmented message.
    Client {
        /// Server address.
        #[arg(long)]
        server: SocketAddr,
        /// Hex-encoded server public key.
        #[arg(long)]
        server_key: String,
        /// Number of reliable pings.
        #[arg(long, default_value_t = 5)]
        count: u32,
        /// Size of the fragmented application message.
        #[arg(long, default_value_t = 10_000)]
        size: usize,
        /// Probe the path MTU before sending.
        #[arg(long)]
        pmtu: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    match Cli::parse().command {
        Command::Keygen => keygen(),
        Command::Server { bind, key } => server(bind, key).await,
        Command::Client {
            server,
            server_key,
            count,
            size,
            pmtu,
        } => client(server, &server_key, count, size, pmtu).await,
    }
}

fn keygen() -> Result<()> {
    let keypair = StaticKeypair::generate()?;
    println!("private: {}", hex::encode(keypair.private_key()));
    println!("public:  {}", hex::encode(keypair.public_key()));
    Ok(())
}

fn decode_key<const N: usize>(encoded: &str, what: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(encoded.trim()).with_context(|| format!("{what} is not hex"))?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| anyhow::anyhow!("{what} must be {N} bytes, got {}", bytes.len()))
}

async fn server(bind: SocketAddr, key: Option<String>) -> Result<()> {
    let keypair = match key {
        Some(key) => StaticKeypair::from_private(decode_key::<PRIVATE_KEY_SIZE>(&key, "private key")?),
        None => StaticKeypair::generate()?,
    };

    let config = TransportConfig::builder().bind_addr(bind).build();
    let mut service = TransportService::bind(config, keypair).await?;
    service.on_connection_established(|info| info!(peer = %info.endpoint, id = %info.id, "peer connected"));
    service.on_connection_closed(|info, reason| info!(peer = %info.endpoint, %reason, "peer disconnected"));

    info!(
        addr = %service.local_addr(),
        public_key = %hex::encode(service.public_key()),
        "echo server listening"
    );

    loop {
        tokio::select! {
            inbound = service.recv() => {
                let Some(inbound) = inbound else { break };
                echo(&service, inbound);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    service.shutdown().await;
    Ok(())
}

fn echo(service: &TransportService, inbound: Inbound) {
    let source = inbound.source();
    let reply = match inbound {
        Inbound::Control { message, .. } => match message.body {
            ControlBody::Payload(payload) => Outbound::Control(payload),
            other => {
                warn!(%source, body = ?other, "unexpected control body");
                return;
            }
        },
        Inbound::Application { message, .. } => Outbound::Application(message),
    };

    let token = service.send(reply, source, SendOptions::reliable());
    tokio::spawn(async move {
        if let Err(e) = token.await {
            warn!(%source, error = %e, "echo not delivered");
        }
    });
}

async fn client(server: SocketAddr, server_key: &str, count: u32, size: usize, pmtu: bool) -> Result<()> {
    let server_key = decode_key::<PUBLIC_KEY_SIZE>(server_key, "server key")?;
    let bind = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let config = TransportConfig::builder()
        .bind_addr(bind.parse()?)
        .accept_incoming(false)
        .build();
    let mut service = TransportService::bind(config, StaticKeypair::generate()?).await?;

    if pmtu {
        let mtu = service.discover_pmtu(server).await?;
        info!(%server, mtu, "path MTU discovered");
    }

    let started = Instant::now();
    let info = service.connect(server, server_key).await?;
    info!(%server, id = %info.id, elapsed = ?started.elapsed(), "connected");

    for i in 0..count {
        let payload = Bytes::from(format!("ping {i}"));
        let sent = Instant::now();
        service
            .send(Outbound::Control(payload.clone()), server, SendOptions::reliable())
            .await?;

        match timeout(Duration::from_secs(2), service.recv()).await {
            Ok(Some(Inbound::Control { message, .. })) if message.body == ControlBody::Payload(payload.clone()) => {
                info!(seq = i, rtt = ?sent.elapsed(), "pong");
            }
            Ok(Some(other)) => warn!(?other, "unexpected reply"),
            Ok(None) => bail!("transport stopped"),
            Err(_) => warn!(seq = i, "no pong within 2s"),
        }
    }

    let message: Bytes = (0..size).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
    let sent = Instant::now();
    service
        .send(Outbound::Application(message.clone()), server, SendOptions::reliable())
        .await?;
    match timeout(Duration::from_secs(5), service.recv()).await {
        Ok(Some(Inbound::Application { message: echoed, .. })) => {
            ensure!(echoed == message, "echoed message differs");
            info!(bytes = size, rtt = ?sent.elapsed(), "fragmented echo verified");
        }
        Ok(other) => bail!("unexpected reply: {other:?}"),
        Err(_) => bail!("no echo of the fragmented message"),
    }

    service.close(server).await?;
    service.shutdown().await;
    Ok(())
}
