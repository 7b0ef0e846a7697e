use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use clap::Parser;
use rdm_core::manifest::{ManifestClient, ManifestRequest};
use rdm_core::progress::{ProgressEvent, ProgressNotifier, ProgressObserver, ProgressSnapshot};
use rdm_core::resume_store::{resume_key, ResumeStore};
use rdm_core::scheduler::HttpSegmentFetcher;
use rdm_core::sink::FileSink;
use rdm_core::Orchestrator;

mod terminal_observer;
use terminal_observer::TerminalProgressObserver;

#[derive(Parser)]
#[command(name = "rdmv", about = "Resumable encrypted range downloader")]
enum Cli {
    Get(GetArgs),
}

#[derive(clap::Args)]
struct GetArgs {
    /// Path query parameter sent to the manifest endpoint, and the key
    /// under which resume state is persisted.
    #[arg(long)]
    path: String,
    /// Signed-URL `sign` query parameter.
    #[arg(long)]
    sign: String,
    /// Base URL of the manifest endpoint.
    #[arg(long)]
    manifest_url: String,
    /// Destination file path.
    #[arg(short, long, default_value = "downloaded_file")]
    out: PathBuf,
    #[arg(long)]
    connections: Option<usize>,
    #[arg(long)]
    segment_size_mb: Option<u32>,
    /// Reuse any resume-store state already persisted for this path/sign.
    /// Without this flag, prior state for the same key is wiped first.
    #[arg(long)]
    resume: bool,
    /// Wipe resume-store state for this path/sign and exit without downloading.
    #[arg(long)]
    clear: bool,
    /// Emit one JSON progress/status object per line instead of terminal bars.
    #[arg(long)]
    json_status: bool,
}

fn store_root() -> PathBuf {
    dirs::cache_dir().unwrap_or_else(std::env::temp_dir).join("rdm-vault")
}

struct JsonStatusObserver;

#[async_trait]
impl ProgressObserver for JsonStatusObserver {
    async fn on_progress(&self, snapshot: &ProgressSnapshot) {
        if let Ok(line) = serde_json::to_string(snapshot) {
            println!("{line}");
        }
    }
    async fn on_complete(&self, snapshot: &ProgressSnapshot) {
        if let Ok(line) = serde_json::to_string(snapshot) {
            println!("{line}");
        }
    }
    async fn on_error(&self, error: &str) {
        println!("{}", serde_json::json!({ "error": error }));
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let Cli::Get(args) = Cli::parse();

    if let Err(e) = run(args).await {
        eprintln!("下载失败:{e}");
        std::process::exit(1);
    }
}

async fn run(args: GetArgs) -> rdm_core::Result<()> {
    let store = Arc::new(ResumeStore::new(store_root()));
    store.ensure_session().await?;

    let key = resume_key("rdmv", &args.path, &args.sign);
    if args.clear {
        store.clear_key(&key).await?;
        println!("cleared resume state for {}", args.path);
        return Ok(());
    }
    if !args.resume {
        store.clear_key(&key).await?;
    }

    let mut config = store.load_settings().await.unwrap_or_default();
    if let Some(c) = args.connections {
        config.connection_limit = c;
    }
    if let Some(mb) = args.segment_size_mb {
        config.segment_size_mb = mb;
    }
    config.validate()?;

    let http_client = reqwest::Client::new();
    let manifest_client = ManifestClient::new(http_client.clone());
    let request = ManifestRequest {
        url: args.manifest_url.clone(),
        extra_query: [("path".to_string(), args.path.clone()), ("sign".to_string(), args.sign.clone())]
            .into_iter()
            .collect(),
        extra_headers: Default::default(),
    };
    let manifest = manifest_client.fetch(&request).await?;

    let fetcher = Arc::new(HttpSegmentFetcher::new(http_client));
    let mut orchestrator = Orchestrator::new(config, store, fetcher);

    let (progress_tx, progress_rx) = tokio::sync::mpsc::channel::<std::result::Result<ProgressEvent, String>>(256);
    orchestrator.set_progress_sink(progress_tx);
    let mut notifier = ProgressNotifier::new();
    if args.json_status {
        notifier.add_observer(Box::new(JsonStatusObserver));
    } else {
        notifier.add_observer(Box::new(TerminalProgressObserver::new()));
    }
    let progress_task = tokio::spawn(notifier.run(progress_rx));

    let mut status_rx = orchestrator.subscribe_status();
    let status_task = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            println!("{}", status_rx.borrow().status_line());
        }
    });

    let outcome = orchestrator.prepare_from_info(manifest, &args.path, &args.sign).await?;
    if outcome.reused_segments > 0 {
        log::info!("resuming: {}/{} segments already on disk", outcome.reused_segments, outcome.total_segments);
    }

    let mut sink = FileSink::new(args.out.clone());
    let start = Instant::now();
    let result = orchestrator.start(&mut sink, Default::default()).await;

    drop(orchestrator);
    let _ = status_task.await;
    let _ = progress_task.await;

    match result {
        Ok(()) => {
            println!("saved {} in {:.2}s", args.out.display(), start.elapsed().as_secs_f64());
            Ok(())
        }
        Err(e) => Err(e),
    }
}
