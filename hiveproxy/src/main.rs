//! hiveproxy carries the hive host API over stdin/stdout.
//!
//! ```bash
//! # inside the simulation container, next to the simulator
//! hiveproxy client --addr 127.0.0.1:8081
//! # on the host side, with the real API behind it
//! hiveproxy frontend --addr :8090 --upstream 127.0.0.1:3000
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hiveproxy::proxy::{listen_addr, run_client, run_frontend, serve_upstream};
use hiveproxy::Session;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "hiveproxy")]
#[command(about = "Multiplexes the hive API over standard input and output")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accepts TCP connections and tunnels them to the other end.
    Frontend(Endpoint),
    /// Serves HTTP and forwards requests to the other end.
    Client(Endpoint),
}

#[derive(Args, Debug)]
struct Endpoint {
    /// Listening address, `:port` listens on all interfaces
    #[arg(long, default_value = ":8081")]
    addr: String,

    /// Where to send sub-streams opened by the other end
    #[arg(long)]
    upstream: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the session, logs go to stderr
    hivesim::init_logging();
    let cli = Cli::parse();

    let (reader, writer) = (tokio::io::stdin(), tokio::io::stdout());
    match cli.command {
        Command::Frontend(endpoint) => {
            let listener = bind(&endpoint.addr).await?;
            let session = Session::server(reader, writer);
            spawn_upstream(&session, endpoint.upstream);
            run_frontend(session, listener).await?;
        }
        Command::Client(endpoint) => {
            let listener = bind(&endpoint.addr).await?;
            let session = Session::client(reader, writer);
            spawn_upstream(&session, endpoint.upstream);
            run_client(session, listener).await?;
        }
    }
    info!("session ended");
    Ok(())
}

async fn bind(addr: &str) -> Result<TcpListener> {
    let addr = listen_addr(addr)?;
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("can't listen on {addr}"))
}

fn spawn_upstream(session: &Session, upstream: Option<String>) {
    if let Some(upstream) = upstream {
        info!(%upstream, "forwarding inbound streams");
        tokio::spawn(serve_upstream(session.clone(), upstream));
    }
}
