use anyhow::Context;
use clap::Parser;
use pulse_client::config::{
    env_true, load_policy_file, parse_url, resolve_api_base, resolve_client_id,
    resolve_config_path, resolve_log_dir, resolve_ws_url,
};
use pulse_client::{ClientConfig, PulseClient};
use pulse_core::EntityKind;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "pulse-monitor")]
struct Args {
    #[arg(long, default_value = "")]
    ws_url: String,
    #[arg(long, default_value = "")]
    api_base: String,
    /// Post to watch; repeatable.
    #[arg(long = "post")]
    posts: Vec<String>,
    /// Campaign to watch; repeatable.
    #[arg(long = "campaign")]
    campaigns: Vec<String>,
    #[arg(long, default_value = "")]
    config: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value = "")]
    client_id: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

struct Runtime {
    client: ClientConfig,
    posts: Vec<String>,
    campaigns: Vec<String>,
    debug: bool,
    log_dir: String,
}

fn load_runtime(args: Args) -> anyhow::Result<Runtime> {
    let ws_url = parse_url(&resolve_ws_url(&args.ws_url))?;
    let api_base = parse_url(&resolve_api_base(&args.api_base))?;
    let policies = load_policy_file(&resolve_config_path(&args.config))?;
    let mut client = ClientConfig::new(ws_url, api_base).with_policies(policies);
    client.client_id = resolve_client_id(&args.client_id);
    Ok(Runtime {
        client,
        posts: args.posts,
        campaigns: args.campaigns,
        debug: args.debug || env_true("PULSE_DEBUG"),
        log_dir: resolve_log_dir(&args.log_dir),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let runtime = load_runtime(Args::parse())?;
    let _log_guard = init_logging(&runtime);
    run(runtime).await
}

async fn run(runtime: Runtime) -> anyhow::Result<()> {
    if runtime.posts.is_empty() && runtime.campaigns.is_empty() {
        anyhow::bail!("nothing to watch: pass --post or --campaign");
    }
    let client = PulseClient::start(runtime.client);

    for campaign_id in &runtime.campaigns {
        if let Err(err) = client.seed_campaign(campaign_id).await {
            warn!(event = "snapshot_error", campaign_id = %campaign_id, error = %err);
        }
    }
    for post_id in &runtime.posts {
        if let Err(err) = client.seed_post(post_id).await {
            warn!(event = "snapshot_error", post_id = %post_id, error = %err);
        }
    }

    let targets = runtime
        .campaigns
        .iter()
        .map(|id| (EntityKind::Campaign, id))
        .chain(runtime.posts.iter().map(|id| (EntityKind::Post, id)));
    for (kind, id) in targets {
        // A failed first handshake keeps retrying in the background.
        if let Err(err) = client.subscribe(kind, id).await {
            warn!(event = "pulse_subscribe_error", kind = kind.as_str(), id = %id, error = %err);
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!(event = "pulse_monitor_interrupt");
    client.shutdown().await;
    Ok(())
}

fn init_logging(runtime: &Runtime) -> Option<LogGuard> {
    let level = if let Ok(level) = std::env::var("PULSE_LOG_LEVEL") {
        level
    } else if runtime.debug {
        "debug".to_string()
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&runtime.log_dir, &runtime.client.client_id) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, client_id: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("pulse-monitor-{client_id}.log"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
