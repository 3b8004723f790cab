mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use replicate_integration::{
    ComposeOptions, GarmentCompositor, ReplicateCompositor, ReplicateConfig,
};
use shared::domain::{DressId, Identity, OperatorId};
use shared::protocol::DressSummary;
use supabase_integration::SupabaseConfig;
use tryon_core::{
    ImageSource, SessionEvent, ShareContent, ShareDisposition, ShareOutcome, SharePresenter,
    StaticAuthSession, SupabaseStore, TryOnSession,
};

use config::{load_settings, Settings};

#[derive(Parser, Debug)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run {
        #[arg(long)]
        photo: PathBuf,
        #[arg(long)]
        dress_id: String,
        #[arg(long)]
        dress_name: Option<String>,
        #[arg(long)]
        dress_image_url: String,
        #[arg(long, default_value_t = 0)]
        price_cents: i64,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        share: bool,
    },
    Status,
}

struct FileImageSource {
    file_name: String,
    content_type: String,
    size_bytes: u64,
    path: PathBuf,
}

impl FileImageSource {
    async fn open(path: &Path) -> Result<Self> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to stat photo '{}'", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("photo path '{}' has no file name", path.display()))?
            .to_string();
        let content_type = content_type_for(&file_name).to_string();
        Ok(Self {
            file_name,
            content_type,
            size_bytes: metadata.len(),
            path: path.to_path_buf(),
        })
    }
}

fn content_type_for(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl ImageSource for FileImageSource {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    async fn read_bytes(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read photo '{}'", self.path.display()))
    }
}

struct StdoutSharePresenter;

#[async_trait]
impl SharePresenter for StdoutSharePresenter {
    fn supports_native_share(&self) -> bool {
        false
    }

    async fn share(&self, _content: &ShareContent) -> Result<ShareDisposition> {
        Err(anyhow!("no native share sheet in a terminal"))
    }

    async fn copy_to_clipboard(&self, text: &str) -> Result<()> {
        println!("share link: {text}");
        Ok(())
    }
}

fn supabase_config(settings: &Settings) -> SupabaseConfig {
    SupabaseConfig {
        project_url: settings.supabase_url.clone(),
        api_key: settings.supabase_service_key.clone(),
        storage_bucket: settings.storage_bucket.clone(),
        records_table: settings.records_table.clone(),
    }
}

fn replicate_config(settings: &Settings) -> ReplicateConfig {
    let mut config = ReplicateConfig::with_api_token(settings.replicate_api_token.clone());
    if let Some(model_version) = &settings.replicate_model_version {
        config.model_version = model_version.clone();
    }
    config.poll_interval = Duration::from_millis(settings.poll_interval_ms);
    config
}

async fn run_try_on(
    settings: Settings,
    photo: PathBuf,
    dress: DressSummary,
    out: Option<PathBuf>,
    share: bool,
) -> Result<()> {
    let store = SupabaseStore::new(supabase_config(&settings))?;
    let compositor = Arc::new(ReplicateCompositor::new(replicate_config(&settings)));
    let auth = Arc::new(StaticAuthSession::signed_in(Identity {
        id: OperatorId(settings.operator_id.clone()),
        display_name: settings.operator_name.clone(),
    }));
    let session = TryOnSession::with_collaborators(
        dress,
        ComposeOptions::default(),
        store.clone(),
        compositor,
        store,
        auth,
        Arc::new(StdoutSharePresenter),
    );

    let mut events = session.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SessionEvent::PhaseChanged(phase) = event {
                println!("phase: {phase}");
            }
        }
    });

    let source = FileImageSource::open(&photo).await?;
    session.select_image(&source).await?;
    let completed = session.start_try_on().await?;
    println!("result: {}", completed.result_image_url);

    if let Some(out_path) = out {
        let downloaded = session.download().await?;
        tokio::fs::write(&out_path, &downloaded.bytes)
            .await
            .with_context(|| format!("failed to write result to '{}'", out_path.display()))?;
        println!("saved {} ({} bytes)", out_path.display(), downloaded.bytes.len());
    }

    if share {
        match session.share().await? {
            ShareOutcome::SharedNatively => println!("shared"),
            ShareOutcome::Dismissed => println!("share dismissed"),
            ShareOutcome::CopiedToClipboard => {}
        }
    }

    Ok(())
}

async fn print_status(settings: Settings) -> Result<()> {
    let store = SupabaseStore::new(supabase_config(&settings))?;
    match store.client().health_check().await {
        Ok(()) => println!("supabase: ok ({})", settings.supabase_url),
        Err(err) => println!("supabase: unreachable ({err:#})"),
    }

    let compositor = ReplicateCompositor::new(replicate_config(&settings));
    if compositor.is_available().await {
        println!("replicate: ok");
    } else {
        println!("replicate: not configured or unreachable");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();
    let settings = load_settings();

    match cli.command {
        Command::Run {
            photo,
            dress_id,
            dress_name,
            dress_image_url,
            price_cents,
            out,
            share,
        } => {
            let dress = DressSummary {
                name: dress_name.unwrap_or_else(|| dress_id.clone()),
                dress_id: DressId(dress_id),
                image_urls: vec![dress_image_url],
                price_cents,
            };
            run_try_on(settings, photo, dress, out, share).await
        }
        Command::Status => print_status(settings).await,
    }
}
