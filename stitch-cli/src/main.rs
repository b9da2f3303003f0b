mod filetype;
mod sink;

use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use stitch_core::*;
use tokio_util::sync::CancellationToken;

use sink::StderrSink;

#[derive(Parser)]
#[command(name = "stitch", version, about = "Resolve AI directive comments with a local opencode backend")]
struct Args {
    /// Config file (default: ~/.stitch/config.json)
    #[arg(long, global = true, env = "STITCH_CONFIG")]
    config: Option<PathBuf>,

    /// Backend host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Backend port; skips process discovery
    #[arg(long, global = true, env = "STITCH_PORT")]
    port: Option<u32>,

    /// Provider override sent when creating a session
    #[arg(long, global = true)]
    provider: Option<String>,

    /// Model override sent when creating a session
    #[arg(long, global = true)]
    model: Option<String>,

    /// Backend agent
    #[arg(long, global = true)]
    agent: Option<String>,

    /// Request timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// HTTP transport
    #[arg(long, global = true, value_enum)]
    transport: Option<TransportArg>,

    /// Show debug notices
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportArg {
    Curl,
    Http,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve the directive at or above a line and write the file back
    Run {
        file: PathBuf,
        /// 1-indexed line to search upward from (default: last line)
        #[arg(long)]
        line: Option<usize>,
        /// Filetype used for comment syntax (default: from the extension)
        #[arg(long)]
        filetype: Option<String>,
    },
    /// Check backend health
    Health,
    /// Print the backend endpoint discovery settles on
    Discover,
    /// Print the effective configuration
    Config {
        /// Write the effective configuration back to the config file
        #[arg(long)]
        save: bool,
    },
    /// Parse a model response (file or stdin) and print the edit
    Parse { file: Option<PathBuf> },
}

impl Args {
    fn load_config(&self) -> StitchConfig {
        let mut config = match &self.config {
            Some(path) => StitchConfig::load_from(path),
            None => StitchConfig::load(),
        }
        .unwrap_or_default();

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = Some(port);
        }
        if let Some(provider) = &self.provider {
            config.provider = Some(provider.clone());
        }
        if let Some(model) = &self.model {
            config.model = Some(model.clone());
        }
        if let Some(agent) = &self.agent {
            config.agent = Some(agent.clone());
        }
        if let Some(timeout) = self.timeout {
            config.request_timeout_secs = timeout;
        }
        if let Some(transport) = self.transport {
            config.transport = match transport {
                TransportArg::Curl => TransportKind::Curl,
                TransportArg::Http => TransportKind::Http,
            };
        }
        config
    }
}

fn init_logging() -> anyhow::Result<()> {
    let log_dir = dirs_home().join(".stitch");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = std::fs::File::create(log_dir.join("stitch.log"))?;

    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("STITCH_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(log_file)
        .with_ansi(false)
        .init();
    Ok(())
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn project_dir() -> anyhow::Result<String> {
    let cwd = std::env::current_dir().context("cannot read current directory")?;
    Ok(cwd.to_string_lossy().into_owned())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    let args = Args::parse();
    let config = args.load_config();
    let sink = Arc::new(StderrSink::new(
        args.verbose,
        std::io::stderr().is_terminal(),
    ));

    match &args.command {
        Command::Run {
            file,
            line,
            filetype,
        } => run(&config, sink, file, *line, filetype.clone()).await,
        Command::Health => health(&config, sink).await,
        Command::Discover => discover(&config, sink).await,
        Command::Config { save } => show_config(&config, &args, *save),
        Command::Parse { file } => parse(file.as_ref()),
    }
}

async fn run(
    config: &StitchConfig,
    sink: Arc<StderrSink>,
    file: &PathBuf,
    line: Option<usize>,
    filetype: Option<String>,
) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("cannot read {}", file.display()))?;
    let filetype = filetype.unwrap_or_else(|| crate::filetype::filetype_for(file));

    let buffers = Arc::new(MemoryBuffers::new());
    let buffer = buffers.open(&file.to_string_lossy(), &filetype, &text);
    let last_line = buffers.lines(buffer).map(|l| l.len()).unwrap_or(1);
    let line = line.unwrap_or(last_line);

    let client = SessionClient::from_config(config, project_dir()?, sink.clone());
    let orchestrator = Orchestrator::new(client, buffers.clone(), sink.clone(), config.clone());

    if let RunOutcome::Rejected(reason) = orchestrator.run(buffer, line) {
        bail!("nothing to do ({reason:?})");
    }

    tokio::select! {
        _ = orchestrator.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel_all();
            orchestrator.wait_idle().await;
        }
    }

    if buffers.change_count(buffer) > 0
        && let Some(mut updated) = buffers.text(buffer)
    {
        if !text.ends_with('\n') {
            updated.pop();
        }
        tokio::fs::write(file, updated)
            .await
            .with_context(|| format!("cannot write {}", file.display()))?;
        tracing::info!("wrote {}", file.display());
    }

    if sink.errors() > 0 {
        bail!("request failed");
    }
    Ok(())
}

async fn health(config: &StitchConfig, sink: Arc<StderrSink>) -> anyhow::Result<()> {
    let client = SessionClient::from_config(config, project_dir()?, sink);
    let status = client.check_health(&CancellationToken::new()).await?;
    if status.healthy {
        println!("healthy ({})", status.detail);
        Ok(())
    } else {
        bail!("unhealthy: {}", status.detail)
    }
}

async fn discover(config: &StitchConfig, sink: Arc<StderrSink>) -> anyhow::Result<()> {
    let client = SessionClient::from_config(config, project_dir()?, sink);
    let endpoint = client.locator().resolve(&CancellationToken::new()).await?;
    println!("{endpoint}");
    Ok(())
}

fn show_config(config: &StitchConfig, args: &Args, save: bool) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);

    let errors = config.validate();
    for err in &errors {
        eprintln!("invalid config: {err}");
    }
    if save {
        if !errors.is_empty() {
            bail!("refusing to save an invalid config");
        }
        let path = args.config.clone().unwrap_or_else(StitchConfig::config_path);
        config
            .save_to(&path)
            .with_context(|| format!("cannot write {}", path.display()))?;
        eprintln!("saved {}", path.display());
    } else if !errors.is_empty() {
        bail!("{} config error(s)", errors.len());
    }
    Ok(())
}

fn parse(file: Option<&PathBuf>) -> anyhow::Result<()> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?,
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            text
        }
    };
    let parsed = parse_response(&text)?;
    if parsed.preamble_lines > 0 {
        eprintln!("skipped {} preamble line(s)", parsed.preamble_lines);
    }
    let edit = parsed.edit;
    println!("REPLACE {} {}", edit.start_line, edit.end_line);
    for line in &edit.replacement_lines {
        println!("{line}");
    }
    Ok(())
}
