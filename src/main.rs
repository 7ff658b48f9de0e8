use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cdp_client::{CdpConfig, CdpEngine};
use pagesnap_cli::engines::{ShellEngine, UrlFetchEngine};
use pagesnap_core_types::{
    BrowserEngine, CaptureOptions, SnapshotResult, WaitPolicy, WaitStrategy,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum EngineKind {
    /// Remote browser over the DevTools protocol
    Cdp,
    /// Plain HTTP fetch (no scripts, no waits)
    Fetch,
    /// External command, stdout as html
    Shell,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum WaitArg {
    Load,
    Domcontentloaded,
    Networkidle,
}

impl From<WaitArg> for WaitStrategy {
    fn from(arg: WaitArg) -> Self {
        match arg {
            WaitArg::Load => WaitStrategy::Load,
            WaitArg::Domcontentloaded => WaitStrategy::DomContentLoaded,
            WaitArg::Networkidle => WaitStrategy::NetworkIdle,
        }
    }
}

/// Structured snapshots of web pages.
#[derive(Debug, Parser)]
#[command(name = "pagesnap", version, about)]
struct Cli {
    /// Page to snapshot
    url: String,

    /// DevTools websocket url (falls back to PAGESNAP_WS_URL)
    #[arg(long)]
    ws_url: Option<String>,

    #[arg(long, value_enum, default_value_t = EngineKind::Cdp)]
    engine: EngineKind,

    /// Command template for --engine shell; {url} is substituted
    #[arg(long)]
    shell_command: Option<String>,

    #[arg(long, value_enum, default_value_t = WaitArg::Load)]
    wait: WaitArg,

    /// Overall readiness deadline in milliseconds
    #[arg(long)]
    max_wait_ms: Option<u64>,

    /// Quiet period for --wait networkidle, in milliseconds
    #[arg(long)]
    idle_ms: Option<u64>,

    /// Restrict captured response bodies to these MIME types
    #[arg(long, value_delimiter = ',')]
    body_mime: Option<Vec<String>>,

    /// Write the screenshot to this path instead of inlining it
    #[arg(long)]
    screenshot: Option<PathBuf>,

    /// Pretty-print the JSON result
    #[arg(long)]
    pretty: bool,
}

fn setup_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_engine(cli: &Cli) -> Result<Box<dyn BrowserEngine>> {
    match cli.engine {
        EngineKind::Cdp => {
            let mut cfg = CdpConfig::default();
            if let Some(ws_url) = &cli.ws_url {
                cfg.websocket_url = Some(ws_url.clone());
            }
            if cfg.websocket_url.is_none() {
                bail!("no devtools endpoint: pass --ws-url or set PAGESNAP_WS_URL");
            }
            Ok(Box::new(CdpEngine::new(cfg)))
        }
        EngineKind::Fetch => Ok(Box::new(UrlFetchEngine::new())),
        EngineKind::Shell => {
            let template = cli
                .shell_command
                .as_ref()
                .context("--engine shell requires --shell-command")?;
            Ok(Box::new(ShellEngine::new(template.clone())))
        }
    }
}

fn wait_policy(cli: &Cli) -> WaitPolicy {
    WaitPolicy {
        strategy: cli.wait.into(),
        network_idle_ms: cli.idle_ms,
        selector: None,
        max_wait_ms: cli.max_wait_ms,
    }
}

fn capture_options(cli: &Cli) -> Option<CaptureOptions> {
    cli.body_mime.as_ref().map(|mimes| CaptureOptions {
        allowed_mimes: Some(mimes.iter().map(|mime| mime.to_ascii_lowercase()).collect()),
        ..CaptureOptions::default()
    })
}

async fn write_screenshot(result: &mut SnapshotResult, path: &PathBuf) -> Result<()> {
    if let Some(png) = result.screenshot_png.take() {
        tokio::fs::write(path, &png)
            .await
            .with_context(|| format!("writing screenshot to {}", path.display()))?;
        info!(path = %path.display(), bytes = png.len(), "screenshot written");
    } else {
        debug!("no screenshot in result, nothing to write");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let cli = Cli::parse();

    let engine = build_engine(&cli)?;
    let mut result = engine
        .snapshot(&cli.url, Some(wait_policy(&cli)), capture_options(&cli))
        .await
        .with_context(|| format!("snapshot of {} failed", cli.url))?;

    if let Some(path) = &cli.screenshot {
        write_screenshot(&mut result, path).await?;
    }

    let rendered = if cli.pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };
    println!("{rendered}");
    Ok(())
}
