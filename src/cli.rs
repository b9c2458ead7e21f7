use crate::{
    format_bytes, format_duration, install_prometheus, serve, AppState, CaptureRequest,
    ChromeEngine, Config, Dispatcher, NavigationTimeout,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::info;

#[derive(Parser)]
#[command(name = "screenshot-server")]
#[command(about = "Renders web pages to images on demand from a pool of headless Chrome tabs")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Number of rendering contexts in the pool")]
    pub pool_size: Option<usize>,

    #[arg(long, env = "PORT", help = "HTTP listening port")]
    pub port: Option<u16>,

    #[arg(long, help = "Navigation timeout in milliseconds (0 disables the timeout)")]
    pub nav_timeout_ms: Option<u64>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Capture full-page screenshots")]
    pub full_page: bool,

    #[arg(long, help = "Include raw engine errors in network error artifacts")]
    pub debug_traces: bool,

    #[arg(long, help = "Expose Prometheus metrics on /metrics")]
    pub metrics: bool,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve GET /screenshot?url=... (default)
    Serve,

    /// Capture a single URL and write the artifact to a file
    Capture {
        #[arg(short, long, help = "URL to screenshot")]
        url: String,

        #[arg(short, long, help = "Output file path")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

impl Cli {
    /// Loads the configuration file, if any, and applies flag overrides.
    pub async fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => read_config(path).await?,
            None => Config::default(),
        };
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(pool_size) = self.pool_size {
            config.pool_size = pool_size;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(millis) = self.nav_timeout_ms {
            config.navigation.timeout = NavigationTimeout::from_millis(millis);
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }
        if self.full_page {
            config.full_page = true;
        }
        if self.debug_traces {
            config.debug_traces = true;
        }
        if self.metrics {
            config.enable_metrics = true;
        }
    }
}

async fn read_config(path: &Path) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let config = serde_json::from_str(&content)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run<F>(&self, command: Commands, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match command {
            Commands::Serve => self.run_server(shutdown).await,
            Commands::Capture { url, output } => self.run_capture(url, output).await,
            Commands::Validate { config } => self.validate_config(config).await,
        }
    }

    async fn start_dispatcher(&self) -> anyhow::Result<Dispatcher> {
        let engine = Arc::new(ChromeEngine::launch(&self.config).await?);
        let dispatcher = Dispatcher::start(&self.config, engine).await?;
        Ok(dispatcher)
    }

    pub async fn run_server<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(
            "Starting server with {} rendering contexts, navigation timeout {:?}",
            self.config.pool_size, self.config.navigation.timeout
        );

        let dispatcher = self.start_dispatcher().await?;
        let mut state = AppState::new(dispatcher.clone());
        if self.config.enable_metrics {
            state = state.with_metrics(install_prometheus()?);
        }

        let result = serve(state, self.config.port, shutdown).await;
        dispatcher.shutdown().await;
        result?;
        Ok(())
    }

    pub async fn run_capture(&self, url: String, output: PathBuf) -> anyhow::Result<()> {
        info!("Taking screenshot of: {}", url);

        let dispatcher = self.start_dispatcher().await?;
        let result = dispatcher.handle(CaptureRequest::new(url)).await;
        dispatcher.shutdown().await;
        let artifact = result?;

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&output, &artifact.bytes).await?;

        println!("Screenshot captured:");
        println!("  URL: {}", artifact.url);
        println!("  Outcome: {}", artifact.outcome.label());
        for line in artifact.outcome.signal_lines() {
            println!("    {line}");
        }
        println!("  Output: {}", output.display());
        println!("  Size: {}", format_bytes(artifact.bytes.len()));
        println!("  Duration: {}", format_duration(artifact.duration));

        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = read_config(&config_path).await?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Pool size: {}", config.pool_size);
        println!("  Port: {}", config.port);
        println!("  Navigation timeout: {:?}", config.navigation.timeout);
        println!("  Wait until: {:?}", config.navigation.wait_until);
        println!(
            "  Viewport: {}x{}",
            config.viewport.width, config.viewport.height
        );
        println!(
            "  Replace discarded contexts: {}",
            config.replace_discarded_contexts
        );

        Ok(())
    }
}

pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
