use std::{
    collections::HashMap,
    fmt,
    future::Future,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Path as RoutePath, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, RETRY_AFTER, SET_COOKIE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    process::Command,
    sync::{Mutex, mpsc, oneshot},
    time::{Duration, timeout},
};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_CACHE_TTL_SECONDS: u64 = 300;
const DEFAULT_JOB_WAIT_SECONDS: u64 = 600;
const MAX_NAME_LENGTH: usize = 180;
const SESSION_COOKIE: &str = "session_id";
const REQUEST_LIMIT_PER_WINDOW: usize = 10;
const REQUEST_WINDOW_SECONDS: i64 = 60;

type RateLimitMap = HashMap<String, Vec<DateTime<Utc>>>;
type FilenameMap = HashMap<String, String>;

#[derive(Clone)]
struct AppState {
    sessions: SessionStore,
    cache: ResultCache,
    filename_map: Arc<Mutex<FilenameMap>>,
    rate_limits: Arc<Mutex<RateLimitMap>>,
    dispatcher: Dispatcher,
    trust_proxy_headers: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum MediaFormat {
    #[default]
    Video,
    Audio,
}

impl MediaFormat {
    fn target_extension(self) -> &'static str {
        match self {
            MediaFormat::Video => "mp4",
            MediaFormat::Audio => "mp3",
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaFormat::Video => f.write_str("video"),
            MediaFormat::Audio => f.write_str("audio"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ProcessRequest {
    url: String,
    #[serde(default)]
    format: MediaFormat,
}

#[derive(Debug, Serialize)]
struct ProcessResponse {
    message: String,
    download_url: String,
    filename: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    code: Option<&'static str>,
    retry_after_seconds: Option<u64>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    fn timeout() -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            message: "Processing timed out.".to_string(),
            code: Some("TIMEOUT"),
            retry_after_seconds: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    fn rate_limited(retry_after_seconds: u64) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: format!(
                "Request limit of {REQUEST_LIMIT_PER_WINDOW} per minute exceeded. Try again shortly."
            ),
            code: Some("RATE_LIMITED"),
            retry_after_seconds: Some(retry_after_seconds),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "mediabox=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let download_root = std::env::var("DOWNLOAD_DIR")
        .ok()
        .and_then(|value| non_empty(&value).map(PathBuf::from))
        .unwrap_or_else(|| root.join("downloads"));

    tokio::fs::create_dir_all(&download_root)
        .await
        .map_err(|error| {
            ApiError::internal(format!("could not create the download root: {error}"))
        })?;

    let max_workers = read_usize_env("MAX_WORKERS")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_WORKERS);
    let cache_ttl_seconds = read_u64_env("CACHE_TTL_SECONDS")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_CACHE_TTL_SECONDS);
    let job_wait_seconds = read_u64_env("JOB_WAIT_SECONDS")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_JOB_WAIT_SECONDS);
    let trust_proxy_headers = read_bool_env("TRUST_PROXY_HEADERS").unwrap_or(false);

    if !trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: the socket address will be used for rate limiting.");
    }

    let state = AppState {
        sessions: SessionStore::new(download_root),
        cache: ResultCache::new(cache_ttl_seconds),
        filename_map: Arc::new(Mutex::new(HashMap::new())),
        rate_limits: Arc::new(Mutex::new(HashMap::new())),
        dispatcher: Dispatcher::start(
            max_workers,
            Duration::from_secs(job_wait_seconds),
            Arc::new(YtDlpFetcher),
        ),
        trust_proxy_headers,
    };

    info!(
        max_workers,
        cache_ttl_seconds, job_wait_seconds, "worker pool and cache configured"
    );

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/process", post(process_media))
        .route("/downloads/{filename}", get(download_file))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer());

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("could not bind {addr}: {error}")))?;

    info!("backend listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn process_media(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<ProcessRequest>,
) -> Result<Response, ApiError> {
    let url = payload.url.trim();
    if url.is_empty() || !is_supported_media_url(url) {
        return Err(ApiError::bad_request("Invalid or missing media URL."));
    }

    let client_ip = client_ip_for_request(&state, &headers, addr);
    register_request_attempt(&state, &client_ip).await?;

    let session = state.sessions.resolve(&headers).await?;
    let key = cache_key(url, payload.format);

    // A cache hit only counts when the file is still present in this
    // session's directory; the cache records filenames, not content.
    if let Some(entry) = state.cache.get(&key).await {
        if path_exists(&session.dir.join(&entry.sanitized_filename)).await {
            info!(%key, session = %session.token, "serving cached result");
            return Ok(attach_session_cookie(
                process_response("File ready (cached)", &entry.original_filename),
                &session,
            ));
        }
        debug!(%key, "cached file is gone from the session directory, re-dispatching");
    }

    let spec = JobSpec {
        url: url.to_string(),
        format: payload.format,
        dest_dir: session.dir.clone(),
    };
    let original_filename = state
        .dispatcher
        .dispatch(spec)
        .await
        .map_err(translate_job_error)?;

    let sanitized_filename = sanitize_filename(&original_filename);
    let original_path = session.dir.join(&original_filename);
    let sanitized_path = session.dir.join(&sanitized_filename);

    if sanitized_filename != original_filename && path_exists(&original_path).await {
        tokio::fs::rename(&original_path, &sanitized_path)
            .await
            .map_err(|error| {
                warn!(%error, filename = %original_filename, "could not rename download");
                ApiError::internal("An unexpected server error occurred.")
            })?;
    }

    state
        .filename_map
        .lock()
        .await
        .insert(original_filename.clone(), sanitized_filename.clone());
    state
        .cache
        .set(key, original_filename.clone(), sanitized_filename)
        .await;

    info!(url, format = %payload.format, filename = %original_filename, "processing complete");

    Ok(attach_session_cookie(
        process_response("Processing complete!", &original_filename),
        &session,
    ))
}

async fn download_file(
    State(state): State<AppState>,
    RoutePath(filename): RoutePath<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if filename.contains(['/', '\\']) || filename.contains("..") {
        return Err(ApiError::not_found("File not found"));
    }

    let session = state.sessions.resolve(&headers).await?;
    let sanitized_filename = state
        .filename_map
        .lock()
        .await
        .get(&filename)
        .cloned()
        .unwrap_or_else(|| sanitize_filename(&filename));

    debug!(original = %filename, sanitized = %sanitized_filename, "download requested");

    let mut served_name = sanitized_filename.clone();
    let mut file_path = session.dir.join(&sanitized_filename);

    if !path_exists(&file_path).await {
        let original_path = session.dir.join(&filename);
        if path_exists(&original_path).await {
            info!(filename = %filename, "serving under the original filename");
            served_name = filename.clone();
            file_path = original_path;
        } else {
            warn!(session = %session.token, filename = %filename, "no file to serve");
            return Err(ApiError::not_found("File not found"));
        }
    }

    let file = tokio::fs::File::open(&file_path).await.map_err(|error| {
        if error.kind() == ErrorKind::NotFound {
            ApiError::not_found("File not found")
        } else {
            ApiError::internal(format!("could not open the requested file: {error}"))
        }
    })?;
    let metadata = file
        .metadata()
        .await
        .map_err(|error| ApiError::internal(format!("could not read file metadata: {error}")))?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&served_name)),
    );
    response_headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("could not build the download size header"))?,
    );
    response_headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&served_name))
            .map_err(|_| ApiError::internal("could not build the download header"))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok(attach_session_cookie(
        (response_headers, body).into_response(),
        &session,
    ))
}

fn process_response(message: &str, original_filename: &str) -> Response {
    Json(ProcessResponse {
        message: message.to_string(),
        download_url: format!("/downloads/{}", urlencoding::encode(original_filename)),
        filename: original_filename.to_string(),
    })
    .into_response()
}

fn translate_job_error(error: JobError) -> ApiError {
    match error {
        JobError::Timeout => ApiError::timeout(),
        JobError::Unsupported(detail) => {
            warn!(%detail, "fetch rejected the URL");
            ApiError::bad_request("The media URL is not supported.")
        }
        other => {
            warn!(detail = %other, "fetch job failed");
            ApiError::internal("An unexpected server error occurred.")
        }
    }
}

// ---------------------------------------------------------------------------
// Sessions

#[derive(Clone)]
struct SessionStore {
    root: PathBuf,
}

#[derive(Debug, Clone)]
struct ClientSession {
    token: Uuid,
    dir: PathBuf,
    minted: bool,
}

impl SessionStore {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Token to directory is a stable 1:1 mapping; the directory is created
    /// on first access and creation is idempotent under concurrent calls.
    async fn resolve(&self, headers: &HeaderMap) -> Result<ClientSession, ApiError> {
        let (token, minted) = match session_token_from_headers(headers) {
            Some(token) => (token, false),
            None => {
                let token = Uuid::new_v4();
                info!(%token, "created new session");
                (token, true)
            }
        };

        let dir = self.root.join(token.to_string());
        tokio::fs::create_dir_all(&dir).await.map_err(|error| {
            ApiError::internal(format!("could not create the session directory: {error}"))
        })?;

        Ok(ClientSession { token, dir, minted })
    }
}

fn session_token_from_headers(headers: &HeaderMap) -> Option<Uuid> {
    let cookies = headers.get(COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        if name == SESSION_COOKIE {
            Uuid::parse_str(value.trim()).ok()
        } else {
            None
        }
    })
}

fn attach_session_cookie(mut response: Response, session: &ClientSession) -> Response {
    if session.minted
        && let Ok(value) = HeaderValue::from_str(&format!(
            "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax",
            session.token
        ))
    {
        response.headers_mut().insert(SET_COOKIE, value);
    }
    response
}

// ---------------------------------------------------------------------------
// Result cache

#[derive(Debug, Clone)]
struct CacheEntry {
    original_filename: String,
    sanitized_filename: String,
    created_at: DateTime<Utc>,
}

#[derive(Clone)]
struct ResultCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    ttl: chrono::Duration,
}

impl ResultCache {
    fn new(ttl_seconds: u64) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl: chrono::Duration::seconds(ttl_seconds as i64),
        }
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.get_at(key, Utc::now()).await
    }

    // Expiry is lazy: entries past their TTL are dropped on read.
    async fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if now - entry.created_at <= self.ttl => Some(entry.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: String, original_filename: String, sanitized_filename: String) {
        self.entries.lock().await.insert(
            key,
            CacheEntry {
                original_filename,
                sanitized_filename,
                created_at: Utc::now(),
            },
        );
    }
}

fn cache_key(url: &str, format: MediaFormat) -> String {
    format!("{url}_{format}")
}

// ---------------------------------------------------------------------------
// Job dispatcher

trait Fetch: Send + Sync + 'static {
    fn fetch(
        &self,
        url: &str,
        format: MediaFormat,
        dest_dir: &Path,
    ) -> impl Future<Output = Result<String, JobError>> + Send;
}

#[derive(Debug, Clone)]
struct JobSpec {
    url: String,
    format: MediaFormat,
    dest_dir: PathBuf,
}

#[derive(Debug)]
enum JobError {
    Timeout,
    EmptyResult,
    Unsupported(String),
    Failed(String),
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Timeout => f.write_str("timed out waiting for the job result"),
            JobError::EmptyResult => f.write_str("job completed but produced no filename"),
            JobError::Unsupported(message) | JobError::Failed(message) => f.write_str(message),
        }
    }
}

struct JobRequest {
    spec: JobSpec,
    reply: oneshot::Sender<Result<String, JobError>>,
}

#[derive(Clone)]
struct Dispatcher {
    queue: mpsc::UnboundedSender<JobRequest>,
    wait: Duration,
}

impl Dispatcher {
    /// Spawns exactly `workers` executors pulling from an unbounded queue.
    /// Submissions beyond the pool size wait in the queue.
    fn start<F: Fetch>(workers: usize, wait: Duration, fetcher: Arc<F>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<JobRequest>();
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..workers {
            let queue = Arc::clone(&rx);
            let fetcher = Arc::clone(&fetcher);
            tokio::spawn(async move {
                loop {
                    let request = {
                        let mut queue = queue.lock().await;
                        queue.recv().await
                    };
                    let Some(JobRequest { spec, reply }) = request else {
                        break;
                    };

                    debug!(worker_id, url = %spec.url, format = %spec.format, "job started");
                    let result = run_job(fetcher.as_ref(), &spec).await;
                    match &result {
                        Ok(filename) => debug!(worker_id, %filename, "job finished"),
                        Err(error) => warn!(worker_id, %error, url = %spec.url, "job failed"),
                    }

                    // The caller may have timed out and dropped its receiver.
                    // The work is done either way; only the reply is lost.
                    let _ = reply.send(result);
                }
            });
        }

        Self { queue: tx, wait }
    }

    async fn dispatch(&self, spec: JobSpec) -> Result<String, JobError> {
        let (reply, receiver) = oneshot::channel();
        self.queue
            .send(JobRequest { spec, reply })
            .map_err(|_| JobError::Failed("the worker pool is shut down".to_string()))?;

        match timeout(self.wait, receiver).await {
            Err(_) => Err(JobError::Timeout),
            Ok(Err(_)) => Err(JobError::Failed(
                "the worker dropped the job before replying".to_string(),
            )),
            Ok(Ok(result)) => result,
        }
    }
}

async fn run_job<F: Fetch>(fetcher: &F, spec: &JobSpec) -> Result<String, JobError> {
    let filename = fetcher
        .fetch(&spec.url, spec.format, &spec.dest_dir)
        .await?;
    if filename.trim().is_empty() {
        return Err(JobError::EmptyResult);
    }
    Ok(filename)
}

// ---------------------------------------------------------------------------
// yt-dlp fetcher

struct YtDlpFetcher;

impl Fetch for YtDlpFetcher {
    async fn fetch(
        &self,
        url: &str,
        format: MediaFormat,
        dest_dir: &Path,
    ) -> Result<String, JobError> {
        let title = probe_title(url).await?;
        let safe_title = title.replace(['/', '\\'], "_");
        let extension = format.target_extension();
        let final_name = format!("{safe_title}.{extension}");

        // Reuse a file the sanitizing rename already left in place.
        let expected = sanitize_filename(&final_name);
        if path_exists(&dest_dir.join(&expected)).await {
            debug!(filename = %expected, "reusing file already present in the session directory");
            return Ok(expected);
        }

        let job_id = Uuid::new_v4().simple().to_string();
        let output_template = format!("{}/tmp_{job_id}.%(ext)s", dest_dir.to_string_lossy());

        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--newline".to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "-o".to_string(),
            output_template,
        ];

        match format {
            MediaFormat::Video => {
                args.push("-f".to_string());
                args.push("bv*+ba/best".to_string());
                args.push("--merge-output-format".to_string());
                args.push("mp4".to_string());
            }
            MediaFormat::Audio => {
                args.push("-f".to_string());
                args.push("bestaudio/best".to_string());
                args.push("-x".to_string());
                args.push("--audio-format".to_string());
                args.push("mp3".to_string());
                args.push("--audio-quality".to_string());
                args.push("0".to_string());
            }
        }
        args.push(url.to_string());

        let output = run_yt_dlp(args).await?;
        let printed = last_stdout_line(&output.stdout);
        let downloaded = locate_download(dest_dir, &job_id, printed.as_deref()).await?;

        let final_path = dest_dir.join(&final_name);
        tokio::fs::rename(&downloaded, &final_path)
            .await
            .map_err(|error| {
                JobError::Failed(format!("could not move the download into place: {error}"))
            })?;

        Ok(final_name)
    }
}

async fn probe_title(url: &str) -> Result<String, JobError> {
    let output = run_yt_dlp(vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--skip-download".to_string(),
        "--print".to_string(),
        "title".to_string(),
        url.to_string(),
    ])
    .await?;

    Ok(last_stdout_line(&output.stdout).unwrap_or_else(|| "download".to_string()))
}

async fn run_yt_dlp(args: Vec<String>) -> Result<std::process::Output, JobError> {
    let output = Command::new("yt-dlp")
        .args(args)
        .output()
        .await
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                JobError::Failed("yt-dlp is not installed or not on PATH".to_string())
            } else {
                JobError::Failed(format!("could not run yt-dlp: {error}"))
            }
        })?;

    if !output.status.success() {
        return Err(classify_yt_dlp_error(&output.stderr));
    }

    Ok(output)
}

fn classify_yt_dlp_error(stderr: &[u8]) -> JobError {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp did not report a cause")
        .to_string();
    let lower = message.to_ascii_lowercase();

    if lower.contains("unsupported url") || lower.contains("is not a valid url") {
        JobError::Unsupported(message)
    } else {
        JobError::Failed(message)
    }
}

fn last_stdout_line(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

async fn locate_download(
    dest_dir: &Path,
    job_id: &str,
    printed: Option<&str>,
) -> Result<PathBuf, JobError> {
    if let Some(printed) = printed {
        let candidate = PathBuf::from(printed);
        if path_exists(&candidate).await {
            return Ok(candidate);
        }
        let relative = dest_dir.join(printed);
        if path_exists(&relative).await {
            return Ok(relative);
        }
    }

    let prefix = format!("tmp_{job_id}.");
    let mut entries = tokio::fs::read_dir(dest_dir).await.map_err(|error| {
        JobError::Failed(format!("could not open the session directory: {error}"))
    })?;
    while let Some(entry) = entries.next_entry().await.map_err(|error| {
        JobError::Failed(format!("could not scan the session directory: {error}"))
    })? {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            return Ok(entry.path());
        }
    }

    Err(JobError::Failed(
        "download finished but no output file was found".to_string(),
    ))
}

// ---------------------------------------------------------------------------
// Rate limiting

async fn register_request_attempt(state: &AppState, ip: &str) -> Result<(), ApiError> {
    let now = Utc::now();
    let window_start = now - chrono::Duration::seconds(REQUEST_WINDOW_SECONDS);

    let mut rate_limits = state.rate_limits.lock().await;
    let entries = rate_limits.entry(ip.to_string()).or_default();
    entries.retain(|timestamp| *timestamp > window_start);

    if entries.len() >= REQUEST_LIMIT_PER_WINDOW {
        let reset_at = entries.first().copied().unwrap_or(now)
            + chrono::Duration::seconds(REQUEST_WINDOW_SECONDS);
        let retry_after = (reset_at - now).num_seconds().max(1) as u64;
        return Err(ApiError::rate_limited(retry_after));
    }

    entries.push(now);
    Ok(())
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("x-real-ip")
}

fn client_ip_for_request(state: &AppState, headers: &HeaderMap, addr: SocketAddr) -> String {
    if state.trust_proxy_headers {
        extract_client_ip(headers).unwrap_or_else(|| addr.ip().to_string())
    } else {
        addr.ip().to_string()
    }
}

// ---------------------------------------------------------------------------
// Helpers

fn sanitize_filename(filename: &str) -> String {
    let (name, extension) = match filename.rsplit_once('.') {
        Some((name, extension)) => (name, Some(extension)),
        None => (filename, None),
    };

    let name = name.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    let name = normalize_copy_suffix(name);

    let mut collapsed = String::with_capacity(name.len());
    let mut previous_underscore = true;
    for character in name.chars() {
        let replaced = if character.is_alphanumeric() || matches!(character, '_' | '-') {
            character
        } else {
            '_'
        };
        if replaced == '_' {
            if previous_underscore {
                continue;
            }
            previous_underscore = true;
        } else {
            previous_underscore = false;
        }
        collapsed.push(replaced);
    }

    let name_part: String = collapsed
        .trim_end_matches('_')
        .chars()
        .take(MAX_NAME_LENGTH)
        .collect();
    let name_part = name_part.trim_end_matches('_');

    match extension {
        Some(extension) => format!("{name_part}.{extension}"),
        None => name_part.to_string(),
    }
}

// Turns "title (1)" or "title(1)" into "title1".
fn normalize_copy_suffix(name: &str) -> String {
    let trimmed = name.trim_end();
    let Some(rest) = trimmed.strip_suffix(')') else {
        return name.to_string();
    };
    let Some(open) = rest.rfind('(') else {
        return name.to_string();
    };

    let digits = &rest[open + 1..];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return name.to_string();
    }

    format!("{}{digits}", rest[..open].trim_end())
}

fn is_supported_media_url(input: &str) -> bool {
    let parsed = match Url::parse(input) {
        Ok(url) => url,
        Err(_) => return false,
    };

    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }

    let host = match parsed.host_str() {
        Some(host) => host.to_ascii_lowercase(),
        None => return false,
    };

    const SUPPORTED_DOMAINS: [&str; 4] = [
        "youtube.com",
        "youtu.be",
        "m.youtube.com",
        "music.youtube.com",
    ];

    SUPPORTED_DOMAINS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "opus" => "audio/ogg",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = ascii_fallback_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn ascii_fallback_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

fn build_cors_layer() -> CorsLayer {
    let configured = std::env::var("ALLOWED_ORIGINS")
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .filter_map(|origin| HeaderValue::from_str(origin).ok())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]);

    if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not configured. Any origin will be accepted.");
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(configured)
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:5000".to_string()
}

fn read_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
