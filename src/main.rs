use clap::Parser;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

use chime::config::SchedulerConfig;
use chime::node::{Node, RunOptions};
use chime::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "chime")]
#[command(about = "A horizontally scalable distributed job scheduler")]
struct Args {
    /// Node name, used to derive picker/worker/coordinator ids
    #[arg(long, default_value = "chime-1")]
    name: String,

    /// Port for the submission HTTP API
    #[arg(long, default_value = "8080")]
    http_port: u16,

    /// Port for the Prometheus metrics endpoint (disabled when omitted)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Number of picker loops to run in this process
    #[arg(long, default_value = "1")]
    pickers: usize,

    /// Number of worker loops to run in this process
    #[arg(long, default_value = "2")]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = SchedulerConfig::from_env();

    let http_addr: SocketAddr = format!("0.0.0.0:{}", args.http_port).parse()?;
    let metrics_addr: Option<SocketAddr> = match args.metrics_port {
        Some(p) => Some(format!("0.0.0.0:{p}").parse()?),
        None => None,
    };

    tracing::info!(
        scylla_hosts = ?config.backends.scylla_hosts,
        kafka_brokers = %config.backends.kafka_brokers,
        sqs_endpoint = %config.backends.sqs_endpoint,
        s3_endpoint = %config.backends.s3_endpoint,
        etcd_endpoints = ?config.backends.etcd_endpoints,
        "Configured backends (embedded engines serve this process)"
    );

    let token = install_shutdown_handler();
    let node = Node::new(args.name, config);
    node.run(
        RunOptions {
            http_addr,
            metrics_addr,
            pickers: args.pickers,
            workers: args.workers,
        },
        token,
    )
    .await;

    Ok(())
}
