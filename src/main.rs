use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pingtun::cli::Args;
use pingtun::config::Config;
use pingtun::metrics::Metrics;
use pingtun::server::Server;
use pingtun::transport::{
    IcmpSink, IcmpTransport, RECV_QUEUE_CAPACITY, check_permissions, spawn_receiver,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "pingtun=debug"
    } else {
        "pingtun=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    // Fail fast with guidance rather than erroring on the first send
    if let Err(e) = check_permissions() {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let config = Config::from(&args);
    let transport = IcmpTransport::new()?;
    let metrics = Metrics::new();
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_clone.cancel();
    });

    let (packet_tx, packet_rx) = mpsc::channel(RECV_QUEUE_CAPACITY);
    let receiver =
        spawn_receiver(transport.clone(), packet_tx, cancel.clone(), metrics.clone());

    info!(
        timeout_secs = config.timeout.as_secs(),
        "listening for tunnel traffic"
    );

    let sink: std::sync::Arc<dyn IcmpSink> = transport;
    Server::new(config, sink, metrics, cancel).run(packet_rx).await;

    match receiver.join() {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("icmp receiver thread panicked"),
    }

    Ok(())
}
