//! arcv: archive client CLI
//!
//! Commands:
//!   config show               - display the active configuration
//!   status                    - backend, store/service reachability, cached credentials
//!   init                      - reserve the backup id and register the public key
//!   upload <file>             - upload the main backup (resumable, with progress)
//!   info                      - show the stored backup's metadata
//!   credentials               - fetch / show the credential window
//!   media list|list-all|archive|delete
//!
//! The backup key is read from ARCV_BACKUP_KEY (64 hex chars); the service
//! password from ARCV_SERVICE_PASSWORD.
//!
//! `init` and `credentials` fill the credential window up front. Upload
//! commands keep it topped up in the background while they run; any other
//! command fetches a credential on demand the first time it needs one.
//!
//! An interrupted `upload` leaves `pending-upload.json` next to the config
//! file. Rerunning with the same file continues that session.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use arcv_client::{
    build_api, ArchiveSession, BackupUpload, BackupUploadFailure, CredentialCache,
    FileSource, LocalArchiveApi, UploadControl,
};
use arcv_core::config::{ArchiveConfig, BackendKind};
use arcv_core::types::{ArchiveMediaRequest, ArchivedMediaObject};
use arcv_core::{start_of_day, ArchiveError, Clock, SystemClock, SECONDS_PER_DAY};
use arcv_crypto::{generate_attachment_secret, BackupKey};

const BACKUP_KEY_ENV: &str = "ARCV_BACKUP_KEY";
const PENDING_UPLOAD_FILE: &str = "pending-upload.json";

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "arcv",
    version,
    about = "Archive backup client",
    long_about = "arcv: reserve a backup, upload it resumably, and manage archived media"
)]
struct Cli {
    /// Path to arcv.toml configuration file
    #[arg(long, short = 'c', env = "ARCV_CONFIG", default_value = "~/.config/arcv/arcv.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log] level
    #[arg(long, env = "ARCV_LOG")]
    log: Option<String>,

    /// Log format; overrides [log] format
    #[arg(long, env = "ARCV_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show backend and credential status
    Status,

    /// Reserve the backup id and register the backup public key
    Init,

    /// Upload the main backup file
    Upload {
        /// Backup file to upload
        file: PathBuf,
    },

    /// Show metadata of the stored backup
    Info,

    /// Fetch the credential window and list the cached days
    Credentials,

    /// Archived media management
    Media {
        #[command(subcommand)]
        action: MediaAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Subcommand, Debug)]
enum MediaAction {
    /// List one page of archived media
    List {
        /// Page size
        #[arg(long, default_value_t = 100)]
        limit: u32,
        /// Cursor returned by the previous page
        #[arg(long)]
        cursor: Option<String>,
    },

    /// List every archived media object
    #[command(name = "list-all")]
    ListAll,

    /// Upload a local file as an attachment and copy it into the archive
    Archive {
        /// File to archive
        file: PathBuf,
        /// Media id to archive it under (default: file name)
        #[arg(long)]
        media_id: Option<String>,
    },

    /// Delete archived media by id
    Delete {
        /// Media ids to delete
        #[arg(required = true)]
        media_ids: Vec<String>,
        /// CDN the media lives on (default: the backup's cdn)
        #[arg(long, allow_hyphen_values = true)]
        cdn: Option<i32>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = arcv_storage::operator::expand_tilde(&cli.config);
    let config = ArchiveConfig::load(&config_path)?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| log_format_from_config(&config.log.format));
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.client.backend,
        config = %config_path.display(),
        "arcv starting"
    );

    match cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
        Commands::Status => cmd_status(&config).await,
        Commands::Init => cmd_init(&config).await,
        Commands::Upload { file } => cmd_upload(&config, &config_path, &file).await,
        Commands::Info => cmd_info(&config).await,
        Commands::Credentials => cmd_credentials(&config).await,
        Commands::Media { action } => match action {
            MediaAction::List { limit, cursor } => {
                cmd_media_list(&config, limit, cursor.as_deref()).await
            }
            MediaAction::ListAll => cmd_media_list_all(&config).await,
            MediaAction::Archive { file, media_id } => {
                cmd_media_archive(&config, &file, media_id.as_deref()).await
            }
            MediaAction::Delete { media_ids, cdn } => {
                cmd_media_delete(&config, &media_ids, cdn).await
            }
        },
    }
}

fn log_format_from_config(format: &str) -> LogFormat {
    if format.eq_ignore_ascii_case("json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr; stdout carries command output.
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Session setup ─────────────────────────────────────────────────────────────

fn backup_key_from_env() -> Result<BackupKey> {
    let hex = std::env::var(BACKUP_KEY_ENV).with_context(|| {
        format!(
            "{BACKUP_KEY_ENV} not set\n\
             Set it to the 64-hex-character backup key, e.g.\n\
             \texport {BACKUP_KEY_ENV}=$(cat ~/.config/arcv/backup.key)"
        )
    })?;
    BackupKey::from_hex(hex.trim()).with_context(|| format!("parsing {BACKUP_KEY_ENV}"))
}

fn open_session(config: &ArchiveConfig) -> Result<ArchiveSession> {
    let api = build_api(config)?;
    let key = backup_key_from_env()?;
    let cache = Arc::new(CredentialCache::new(
        api.clone(),
        Arc::new(SystemClock),
        config.credentials.clone(),
    ));
    Ok(ArchiveSession::new(api, key, cache))
}

/// Keep the credential window filled while a long command runs. Cancel the
/// returned token to stop.
fn start_prefetch(session: &ArchiveSession) -> Option<CancellationToken> {
    if !session.api().requires_credentials() {
        return None;
    }
    let stop = CancellationToken::new();
    session.credentials().clone().spawn_prefetch(stop.clone());
    Some(stop)
}

fn stop_prefetch(stop: Option<CancellationToken>) {
    if let Some(stop) = stop {
        stop.cancel();
    }
}

/// Fill the credential window now, when the backend uses one.
async fn prefetch_credentials(session: &ArchiveSession) -> Result<()> {
    if session.api().requires_credentials() {
        let now = SystemClock.now_secs();
        session.credentials().prefetch(now).await.map_err(describe)?;
    }
    Ok(())
}

/// Human-oriented rendering of an archive failure.
fn describe(e: ArchiveError) -> anyhow::Error {
    let hint = match &e {
        ArchiveError::NotFound(_) => Some("nothing stored yet; run `arcv upload <file>` first"),
        ArchiveError::Authorization(_) => Some("credential rejected; has `arcv init` been run?"),
        ArchiveError::QuotaExceeded(_) => Some("archive is full; delete media or raise the quota"),
        ArchiveError::Config(_) => Some("check the config file and ARCV_* environment variables"),
        _ => None,
    };
    let offset = e.resume_offset().filter(|_| e.is_resumable());
    let mut err = anyhow::Error::new(e);
    if let Some(acked) = offset {
        err = err.context(format!("{acked} bytes are stored; rerun to resume"));
    }
    match hint {
        Some(hint) => err.context(hint),
        None => err,
    }
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=>-");
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Upload control wired to a progress bar and Ctrl-C.
fn interactive_control(pb: &ProgressBar) -> UploadControl {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let bar = pb.clone();
    UploadControl::new(cancel).with_progress(Arc::new(move |acked, total| {
        bar.set_length(total);
        bar.set_position(acked);
    }))
}

// ── `arcv config show` ────────────────────────────────────────────────────────

fn cmd_config_show(config: &ArchiveConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `arcv status` ─────────────────────────────────────────────────────────────

async fn cmd_status(config: &ArchiveConfig) -> Result<()> {
    println!("arcv v{}", env!("CARGO_PKG_VERSION"));
    match config.client.backend {
        BackendKind::Local => {
            let local = LocalArchiveApi::from_config(config)?;
            let health = arcv_storage::check_health(local.operator()).await;
            println!("  backend:       local ({:?})", config.local.kind);
            println!("  root:          {}", config.local.root.display());
            println!(
                "  store:         {}",
                match &health {
                    Ok(()) => "ok".to_string(),
                    Err(e) => format!("UNREACHABLE ({e})"),
                }
            );
            match config.local.max_media_bytes {
                Some(max) => println!("  media quota:   {max} bytes"),
                None => println!("  media quota:   unlimited"),
            }
        }
        BackendKind::Network => {
            println!("  backend:       network");
            println!("  service:       {}", config.service.url);
            println!(
                "  username:      {}",
                config.service.username.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  password:      {}",
                if std::env::var(arcv_client::network::PASSWORD_ENV).is_ok() {
                    "set"
                } else {
                    "NOT SET"
                }
            );
        }
    }
    println!(
        "  backup key:    {}",
        match backup_key_from_env() {
            Ok(key) => format!("backup id {}", key.backup_id()),
            Err(_) => format!("NOT SET ({BACKUP_KEY_ENV})"),
        }
    );
    Ok(())
}

// ── `arcv init` ───────────────────────────────────────────────────────────────

async fn cmd_init(config: &ArchiveConfig) -> Result<()> {
    let session = open_session(config)?;
    session.initialize().await.map_err(describe)?;
    prefetch_credentials(&session).await?;
    println!("backup initialized ({} backend)", session.api().name());
    Ok(())
}

// ── `arcv upload` ─────────────────────────────────────────────────────────────

/// A backup upload left unfinished by an earlier run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PendingUpload {
    file: PathBuf,
    length: u64,
    upload: BackupUpload,
}

fn pending_upload_path(config_path: &Path) -> PathBuf {
    config_path.with_file_name(PENDING_UPLOAD_FILE)
}

/// The pending upload for `file`, if one was saved for the same file and length.
fn load_pending(path: &Path, file: &Path, length: u64) -> Option<PendingUpload> {
    let data = std::fs::read(path).ok()?;
    let pending: PendingUpload = match serde_json::from_slice(&data) {
        Ok(pending) => pending,
        Err(e) => {
            warn!(path = %path.display(), "ignoring unreadable pending upload: {e}");
            return None;
        }
    };
    (pending.file == file && pending.length == length).then_some(pending)
}

fn save_pending(path: &Path, pending: &PendingUpload) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(pending)?;
    std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))
}

fn clear_pending(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "failed to remove pending upload: {e}");
        }
    }
}

async fn cmd_upload(config: &ArchiveConfig, config_path: &Path, file: &Path) -> Result<()> {
    let session = open_session(config)?;
    let file = std::fs::canonicalize(file).unwrap_or_else(|_| file.to_path_buf());
    let source = FileSource::new(&file);
    let length = source
        .len()
        .await
        .with_context(|| format!("reading {}", file.display()))?;

    let state = pending_upload_path(config_path);
    let pending = load_pending(&state, &file, length);

    let pb = make_progress_bar(length, "upload");
    pb.set_message(file.display().to_string());
    let control = interactive_control(&pb);
    let prefetch = start_prefetch(&session);

    let result = match pending {
        Some(pending) => {
            info!(url = %pending.upload.resumable_url, "resuming interrupted upload");
            match session
                .continue_backup_upload(&pending.upload, &source, length, &control)
                .await
            {
                Ok(()) => Ok(pending.upload),
                Err(error) => Err(BackupUploadFailure {
                    upload: Some(pending.upload),
                    error,
                }),
            }
        }
        None => session.upload_backup(&source, length, &control).await,
    };
    stop_prefetch(prefetch);

    match result {
        Ok(upload) => {
            clear_pending(&state);
            pb.finish_with_message("done");
            println!(
                "uploaded {} ({length} bytes) to cdn {}",
                file.display(),
                upload.form.cdn
            );
            Ok(())
        }
        Err(failure) => {
            pb.abandon();
            match failure.resumable_upload() {
                Some(upload) => {
                    let pending = PendingUpload {
                        file: file.clone(),
                        length,
                        upload: upload.clone(),
                    };
                    if let Err(e) = save_pending(&state, &pending) {
                        warn!("cannot record the upload for resuming: {e:#}");
                    }
                }
                None => clear_pending(&state),
            }
            Err(describe(failure.error))
        }
    }
}

// ── `arcv info` ───────────────────────────────────────────────────────────────

async fn cmd_info(config: &ArchiveConfig) -> Result<()> {
    let session = open_session(config)?;
    let info = session.backup_info().await.map_err(describe)?;
    println!("backup:     {}/{}", info.backup_dir, info.backup_name);
    println!("cdn:        {}", info.cdn);
    println!("length:     {} bytes", info.object_length);
    println!("media dir:  {}", info.media_dir);
    match info.used_space {
        Some(used) => println!("used space: {used} bytes"),
        None => println!("used space: unknown"),
    }
    Ok(())
}

// ── `arcv credentials` ────────────────────────────────────────────────────────

async fn cmd_credentials(config: &ArchiveConfig) -> Result<()> {
    let session = open_session(config)?;
    if !session.api().requires_credentials() {
        println!("{} backend does not use service credentials", session.api().name());
        return Ok(());
    }
    prefetch_credentials(&session).await?;
    let today = start_of_day(SystemClock.now_secs());
    for day in session.credentials().cached_days().await {
        let offset = (day.saturating_sub(today)) / SECONDS_PER_DAY;
        println!("day {day}  (today + {offset})");
    }
    Ok(())
}

// ── `arcv media ...` ──────────────────────────────────────────────────────────

async fn cmd_media_list(
    config: &ArchiveConfig,
    limit: u32,
    cursor: Option<&str>,
) -> Result<()> {
    let session = open_session(config)?;
    let page = session.media_page(limit, cursor).await.map_err(describe)?;
    for item in &page.stored_media_objects {
        println!("{}  cdn={}  {} bytes", item.media_id, item.cdn, item.object_length);
    }
    match &page.cursor {
        Some(next) => println!("# more: --cursor {next}"),
        None => println!("# end of listing"),
    }
    Ok(())
}

async fn cmd_media_list_all(config: &ArchiveConfig) -> Result<()> {
    let session = open_session(config)?;
    let items = session.all_media().await.map_err(describe)?;
    let total: u64 = items.iter().map(|m| m.object_length).sum();
    for item in &items {
        println!("{}  cdn={}  {} bytes", item.media_id, item.cdn, item.object_length);
    }
    println!("# {} objects, {total} bytes", items.len());
    Ok(())
}

/// Split a fresh attachment secret into (encryption_key, hmac_key).
fn attachment_keys() -> (Vec<u8>, Vec<u8>) {
    let (secret, _iv) = generate_attachment_secret();
    let (encryption, hmac) = secret.split_at(secret.len() / 2);
    (encryption.to_vec(), hmac.to_vec())
}

fn default_media_id(file: &Path) -> Result<String> {
    file.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .with_context(|| format!("cannot derive a media id from {}", file.display()))
}

async fn cmd_media_archive(
    config: &ArchiveConfig,
    file: &Path,
    media_id: Option<&str>,
) -> Result<()> {
    let session = open_session(config)?;
    let media_id = match media_id {
        Some(id) => id.to_string(),
        None => default_media_id(file)?,
    };
    let source = FileSource::new(file);
    let length = source
        .len()
        .await
        .with_context(|| format!("reading {}", file.display()))?;

    let pb = make_progress_bar(length, "attach");
    pb.set_message(media_id.clone());
    let control = interactive_control(&pb);
    let prefetch = start_prefetch(&session);
    let uploaded = session.upload_media(&source, length, &control).await;
    stop_prefetch(prefetch);
    let attachment = match uploaded {
        Ok(attachment) => {
            pb.finish_and_clear();
            attachment
        }
        Err(e) => {
            pb.abandon();
            return Err(describe(e));
        }
    };

    let (encryption_key, hmac_key) = attachment_keys();
    let request = ArchiveMediaRequest {
        source_attachment: attachment,
        object_length: length,
        media_id: media_id.clone(),
        hmac_key,
        encryption_key,
    };
    let response = session.archive_media(&request).await.map_err(describe)?;
    println!("archived {media_id} ({length} bytes) on cdn {}", response.cdn);
    Ok(())
}

async fn cmd_media_delete(
    config: &ArchiveConfig,
    media_ids: &[String],
    cdn: Option<i32>,
) -> Result<()> {
    let session = open_session(config)?;
    let cdn = match cdn {
        Some(cdn) => cdn,
        None => session.backup_info().await.map_err(describe)?.cdn,
    };
    let items: Vec<ArchivedMediaObject> = media_ids
        .iter()
        .map(|id| ArchivedMediaObject {
            cdn,
            media_id: id.clone(),
        })
        .collect();
    session.delete_media(&items).await.map_err(describe)?;
    println!("deleted {} media object(s)", items.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_media_delete() {
        let cli =
            Cli::try_parse_from(["arcv", "media", "delete", "a", "b", "--cdn", "-1"]).unwrap();
        match cli.command {
            Commands::Media {
                action: MediaAction::Delete { media_ids, cdn },
            } => {
                assert_eq!(media_ids, ["a", "b"]);
                assert_eq!(cdn, Some(-1));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_media_delete_needs_ids() {
        assert!(Cli::try_parse_from(["arcv", "media", "delete"]).is_err());
    }

    #[test]
    fn test_log_format_from_config() {
        assert_eq!(log_format_from_config("JSON"), LogFormat::Json);
        assert_eq!(log_format_from_config("text"), LogFormat::Text);
        assert_eq!(log_format_from_config("pretty"), LogFormat::Text);
    }

    #[test]
    fn test_attachment_keys_are_distinct_halves() {
        let (enc, hmac) = attachment_keys();
        assert_eq!(enc.len(), 32);
        assert_eq!(hmac.len(), 32);
        assert_ne!(enc, hmac);
    }

    #[test]
    fn test_default_media_id() {
        assert_eq!(default_media_id(Path::new("/tmp/photo.jpg")).unwrap(), "photo.jpg");
        assert!(default_media_id(Path::new("/")).is_err());
    }

    #[test]
    fn test_describe_adds_resume_hint() {
        let err = describe(ArchiveError::Transfer {
            acknowledged: 4096,
            total: 8192,
            status: None,
            reason: "reset".into(),
        });
        assert!(format!("{err:#}").contains("4096 bytes are stored"));

        let gone = describe(ArchiveError::Transfer {
            acknowledged: 4096,
            total: 8192,
            status: Some(404),
            reason: "session expired".into(),
        });
        assert!(!format!("{gone:#}").contains("rerun"));
    }

    fn sample_upload() -> BackupUpload {
        BackupUpload {
            form: arcv_core::types::UploadForm {
                cdn: 3,
                key: "backups/b/main".into(),
                headers: Default::default(),
                signed_upload_location: "https://cdn.example/upload".into(),
            },
            resumable_url: "https://cdn.example/upload/session-1".into(),
        }
    }

    #[test]
    fn test_pending_upload_is_reused_for_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = pending_upload_path(&dir.path().join("conf").join("arcv.toml"));
        let file = dir.path().join("backup.bin");
        let pending = PendingUpload {
            file: file.clone(),
            length: 8192,
            upload: sample_upload(),
        };
        save_pending(&state, &pending).unwrap();
        assert!(state.ends_with("conf/pending-upload.json"));

        assert_eq!(load_pending(&state, &file, 8192), Some(pending));
        assert_eq!(load_pending(&state, &file, 4096), None);
        assert_eq!(load_pending(&state, &dir.path().join("other.bin"), 8192), None);

        clear_pending(&state);
        assert!(!state.exists());
        assert_eq!(load_pending(&state, &file, 8192), None);
        // Clearing twice is harmless.
        clear_pending(&state);
    }

    #[test]
    fn test_unreadable_pending_upload_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join(PENDING_UPLOAD_FILE);
        std::fs::write(&state, b"{not json").unwrap();
        assert_eq!(load_pending(&state, Path::new("/tmp/a"), 1), None);
    }
}
