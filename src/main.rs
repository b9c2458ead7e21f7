use clap::Parser;
use screenshot_server::{setup_logging, Cli, CliRunner, Commands};
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting screenshot-server v{}", env!("CARGO_PKG_VERSION"));

    let config = args.load_config().await?;
    info!(
        "Configuration loaded: pool size {}, port {}",
        config.pool_size, config.port
    );

    let runner = CliRunner::new(config);
    let command = args.command.unwrap_or(Commands::Serve);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);
    let shutdown = async move {
        let _ = shutdown_rx.await;
        info!("Received shutdown signal");
    };

    if let Err(e) = runner.run(command, shutdown).await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("screenshot-server stopped");
    Ok(())
}

fn setup_shutdown_handler(shutdown_tx: oneshot::Sender<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to create SIGINT handler: {}", e);
                return;
            }
        };
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to create SIGTERM handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
