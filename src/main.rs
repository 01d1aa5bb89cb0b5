use std::{
    env, fs,
    io::{self, ErrorKind},
    path::PathBuf,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Duration;
use tracing::{info, warn};

const RAPID_API_KEY_ENV: &str = "RAPIDAPI_KEY";
const DEFAULT_ENDPOINT: &str =
    "https://tiktok-download-video-no-watermark.p.rapidapi.com/tiktok/info";
const DEFAULT_API_HOST: &str = "tiktok-download-video-no-watermark.p.rapidapi.com";
const REQUEST_TIMEOUT_SECONDS: u64 = 30;
const HISTORY_MAX_ENTRIES: usize = 15;
const HISTORY_FILE: &str = "history.json";

const SUPPORTED_HOSTS: [&str; 6] = [
    "tiktok.com",
    "www.tiktok.com",
    "vm.tiktok.com",
    "vt.tiktok.com",
    "v.tiktok.com",
    "m.tiktok.com",
];

// Field names observed across upstream API versions, probed in priority order.
const PLAY_URL_FIELDS: [&str; 4] = ["video_link_nwm_hd", "video_link_nwm", "play", "url"];
const WATERMARK_URL_FIELDS: [&str; 2] = ["video_link_wm", "wmplay"];
const DATA_MARKER_FIELDS: [&str; 3] = ["play", "id", "video_link_nwm"];
const ID_FIELDS: [&str; 3] = ["_id", "id", "aweme_id"];
const TITLE_FIELDS: [&str; 2] = ["title", "desc"];
const COVER_FIELDS: [&str; 2] = ["cover", "origin_cover"];

const DEFAULT_TITLE: &str = "TikTok Video";
const DEFAULT_AUTHOR_NAME: &str = "TikTok User";
const DEFAULT_AUTHOR_HANDLE: &str = "tiktok_user";
const DEFAULT_AVATAR_URL: &str = "https://www.tiktok.com/favicon.ico";
const DEFAULT_TRACK_TITLE: &str = "Original Sound";
const DEFAULT_TRACK_AUTHOR: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CanonicalVideoRecord {
    id: String,
    title: String,
    cover_url: String,
    play_url: String,
    watermarked_play_url: String,
    duration_seconds: f64,
    author: AuthorInfo,
    track: TrackInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AuthorInfo {
    display_name: String,
    handle: String,
    avatar_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TrackInfo {
    title: String,
    author: String,
    url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct HistoryEntry {
    id: String,
    source_url: String,
    title: String,
    cover_url: String,
    author_handle: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    captured_at: DateTime<Utc>,
}

impl HistoryEntry {
    fn from_record(record: &CanonicalVideoRecord, source_url: &str) -> Self {
        Self {
            id: record.id.clone(),
            source_url: source_url.to_string(),
            title: record.title.clone(),
            cover_url: record.cover_url.clone(),
            author_handle: record.author.handle.clone(),
            captured_at: Utc::now(),
        }
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
enum NormalizeError {
    #[error(
        "Unable to extract video source. The video might be private or from a restricted region."
    )]
    MissingPlayUrl,

    #[error("{0}")]
    UpstreamReported(String),

    #[error("Could not find video data in the response.")]
    UnrecognizedShape,
}

#[derive(Debug, thiserror::Error)]
enum RetrieveError {
    #[error(
        "Invalid link. Please copy a valid TikTok URL (e.g., https://www.tiktok.com/@user/video/...)."
    )]
    InvalidUrl,

    #[error("API Connection Failed ({status}). The service might be under maintenance.")]
    Transport { status: u16 },

    #[error("The request could not be completed. Check your connection and try again.")]
    Network,

    #[error(transparent)]
    Normalize(#[from] NormalizeError),
}

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Retrieve(#[from] RetrieveError),

    #[error("RAPIDAPI_KEY is not set. Export your RapidAPI key before fetching videos.")]
    MissingApiKey,

    #[error("Could not create the HTTP client: {0}")]
    Client(reqwest::Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "toksave=warn".to_string()))
        .init();

    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        std::process::exit(1);
    };
    if args.next().is_some() {
        print_usage();
        std::process::exit(1);
    }

    let result = match command.as_str() {
        "--help" | "-h" => {
            print_usage();
            return;
        }
        "history" => show_history(),
        "clear-history" => clear_history(),
        _ => fetch(&command).await,
    };

    if let Err(error) = result {
        eprintln!("{error}");
        std::process::exit(1);
    }
}

fn print_usage() {
    eprintln!("Usage: toksave <tiktok-url>");
    eprintln!("       toksave history");
    eprintln!("       toksave clear-history");
    eprintln!();
    eprintln!("Set RAPIDAPI_KEY to your RapidAPI key before fetching videos.");
}

async fn fetch(url: &str) -> Result<(), AppError> {
    let config = UpstreamConfig::from_env()?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS))
        .build()
        .map_err(AppError::Client)?;

    let retriever = Retriever { client, config };
    let record = retriever.retrieve(url).await?;
    render_record(&record);

    let mut history = open_history();
    history.record(HistoryEntry::from_record(&record, url.trim()));
    Ok(())
}

fn show_history() -> Result<(), AppError> {
    let history = open_history();
    render_history(history.entries());
    Ok(())
}

fn clear_history() -> Result<(), AppError> {
    let mut history = open_history();
    history.clear();
    println!("Download history cleared.");
    Ok(())
}

fn open_history() -> HistoryStore<FileStorage> {
    HistoryStore::load(FileStorage {
        path: resolve_data_dir().join(HISTORY_FILE),
    })
}

fn render_record(record: &CanonicalVideoRecord) {
    println!("===================================");
    println!("{}", record.title);
    println!("===================================");
    println!(
        "Author:   {} (@{})",
        record.author.display_name, record.author.handle
    );
    println!("Duration: {}", format_duration(record.duration_seconds));
    println!("Track:    {} - {}", record.track.title, record.track.author);
    println!();
    println!("Download (no watermark): {}", record.play_url);
    println!("Download (watermarked):  {}", record.watermarked_play_url);
    if !record.cover_url.is_empty() {
        println!("Cover image:             {}", record.cover_url);
    }
    if !record.track.url.is_empty() {
        println!("Audio track:             {}", record.track.url);
    }
}

fn render_history(entries: &[HistoryEntry]) {
    if entries.is_empty() {
        println!("No downloads recorded yet.");
        return;
    }

    println!("Recent downloads ({}):", entries.len());
    for entry in entries {
        println!(
            "  {}  @{}  {}",
            entry.captured_at.format("%Y-%m-%d %H:%M"),
            entry.author_handle,
            entry.title
        );
        println!("      {}", entry.source_url);
    }
}

fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

#[derive(Debug, Clone)]
struct UpstreamConfig {
    endpoint: String,
    api_key: String,
    api_host: String,
}

impl UpstreamConfig {
    fn from_env() -> Result<Self, AppError> {
        let api_key = env::var(RAPID_API_KEY_ENV)
            .ok()
            .and_then(normalize_optional_text)
            .ok_or(AppError::MissingApiKey)?;

        Ok(Self {
            endpoint: env_or("TOKSAVE_ENDPOINT", DEFAULT_ENDPOINT),
            api_key,
            api_host: env_or("TOKSAVE_API_HOST", DEFAULT_API_HOST),
        })
    }
}

struct Retriever {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl Retriever {
    async fn retrieve(&self, url: &str) -> Result<CanonicalVideoRecord, RetrieveError> {
        let source_url = url.trim();
        if !is_supported_url(source_url) {
            return Err(RetrieveError::InvalidUrl);
        }

        info!("Fetching video info for {source_url}");

        let request_url = format!(
            "{}?url={}",
            self.config.endpoint,
            urlencoding::encode(source_url)
        );

        let response = self
            .client
            .get(&request_url)
            .header("x-rapidapi-key", &self.config.api_key)
            .header("x-rapidapi-host", &self.config.api_host)
            .send()
            .await
            .map_err(|error| {
                warn!("Upstream request failed for {source_url:?}: {error}");
                RetrieveError::Network
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!("Upstream responded with status {status} for {source_url:?}");
            return Err(RetrieveError::Transport {
                status: status.as_u16(),
            });
        }

        let payload = response.json::<Value>().await.map_err(|error| {
            warn!("Upstream response was not valid JSON for {source_url:?}: {error}");
            RetrieveError::Network
        })?;

        Ok(normalize(&payload)?)
    }
}

fn is_supported_url(input: &str) -> bool {
    let Some(trimmed) = non_empty(input) else {
        return false;
    };

    let lower = trimmed.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);

    // Share links always carry a path component after the host.
    let Some((host, _)) = rest.split_once('/') else {
        return false;
    };

    SUPPORTED_HOSTS.contains(&host)
}

fn normalize(payload: &Value) -> Result<CanonicalVideoRecord, NormalizeError> {
    let Some(data) = locate_data(payload) else {
        if let Some(message) = probe_text(payload, &["msg", "message"]) {
            return Err(NormalizeError::UpstreamReported(message));
        }
        return Err(NormalizeError::UnrecognizedShape);
    };

    let play_url = probe_url(data, &PLAY_URL_FIELDS).ok_or(NormalizeError::MissingPlayUrl)?;
    let watermarked_play_url =
        probe_url(data, &WATERMARK_URL_FIELDS).unwrap_or_else(|| play_url.clone());

    let author = data.get("author");
    let music = data.get("music");
    let music_info = data.get("music_info");

    Ok(CanonicalVideoRecord {
        id: probe_text(data, &ID_FIELDS).unwrap_or_else(generated_id),
        title: probe_text(data, &TITLE_FIELDS).unwrap_or_else(|| DEFAULT_TITLE.to_string()),
        cover_url: probe_url(data, &COVER_FIELDS).unwrap_or_default(),
        play_url,
        watermarked_play_url,
        duration_seconds: data
            .get("duration")
            .and_then(Value::as_f64)
            .unwrap_or_default(),
        author: AuthorInfo {
            display_name: nested_text(author, "nickname")
                .unwrap_or_else(|| DEFAULT_AUTHOR_NAME.to_string()),
            handle: nested_text(author, "unique_id")
                .unwrap_or_else(|| DEFAULT_AUTHOR_HANDLE.to_string()),
            avatar_url: nested_text(author, "avatar")
                .unwrap_or_else(|| DEFAULT_AVATAR_URL.to_string()),
        },
        track: TrackInfo {
            title: nested_text(music_info, "title")
                .or_else(|| nested_text(music, "title"))
                .unwrap_or_else(|| DEFAULT_TRACK_TITLE.to_string()),
            author: nested_text(music_info, "author")
                .or_else(|| nested_text(music, "author"))
                .unwrap_or_else(|| DEFAULT_TRACK_AUTHOR.to_string()),
            url: match music {
                Some(Value::String(value)) => non_empty(value).map(ToString::to_string),
                _ => nested_text(music, "uri"),
            }
            .unwrap_or_default(),
        },
    })
}

// Some API versions wrap the record under `data`, others flatten it at the top
// level. A top-level payload only counts as video data when it carries one of
// the known marker fields.
fn locate_data(payload: &Value) -> Option<&Value> {
    if let Some(data) = payload.get("data")
        && data.is_object()
    {
        return Some(data);
    }

    let has_marker = DATA_MARKER_FIELDS.iter().any(|field| {
        payload
            .get(*field)
            .is_some_and(|value| !value.is_null() && value.as_str() != Some(""))
    });

    if has_marker { Some(payload) } else { None }
}

fn probe_url(data: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| {
        data.get(*field)
            .and_then(Value::as_str)
            .and_then(non_empty)
            .map(ToString::to_string)
    })
}

fn probe_text(data: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| coerce_text(data.get(*field)?))
}

fn nested_text(parent: Option<&Value>, field: &str) -> Option<String> {
    coerce_text(parent?.get(field)?)
}

fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => non_empty(text).map(ToString::to_string),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn generated_id() -> String {
    Utc::now().timestamp_millis().to_string()
}

trait HistoryStorage {
    fn load(&self) -> io::Result<Option<String>>;
    fn save(&self, payload: &str) -> io::Result<()>;
}

struct FileStorage {
    path: PathBuf,
}

impl HistoryStorage for FileStorage {
    fn load(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn save(&self, payload: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, payload)
    }
}

struct HistoryStore<S: HistoryStorage> {
    entries: Vec<HistoryEntry>,
    storage: S,
}

impl<S: HistoryStorage> HistoryStore<S> {
    fn load(storage: S) -> Self {
        let entries = match storage.load() {
            Ok(Some(contents)) => match serde_json::from_str::<Vec<HistoryEntry>>(&contents) {
                Ok(mut entries) => {
                    entries.truncate(HISTORY_MAX_ENTRIES);
                    entries
                }
                Err(error) => {
                    warn!("Stored history is unreadable, starting empty: {error}");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(error) => {
                warn!("Could not open stored history, starting empty: {error}");
                Vec::new()
            }
        };

        Self { entries, storage }
    }

    fn record(&mut self, entry: HistoryEntry) {
        self.entries.retain(|existing| existing.id != entry.id);
        self.entries.insert(0, entry);
        self.entries.truncate(HISTORY_MAX_ENTRIES);
        self.persist();
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.persist();
    }

    fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    fn persist(&self) {
        let payload = match serde_json::to_string_pretty(&self.entries) {
            Ok(payload) => payload,
            Err(error) => {
                warn!("Could not serialize download history: {error}");
                return;
            }
        };

        if let Err(error) = self.storage.save(&payload) {
            warn!("Could not save download history: {error}");
        }
    }
}

fn resolve_data_dir() -> PathBuf {
    env::var("TOKSAVE_DATA_DIR")
        .ok()
        .and_then(normalize_optional_text)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("data"))
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .and_then(normalize_optional_text)
        .unwrap_or_else(|| default.to_string())
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

fn normalize_optional_text(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
