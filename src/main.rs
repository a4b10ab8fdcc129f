use axum::{
    extract::{ConnectInfo, Path as AxumPath, Request, State},
    http::{self, header, HeaderMap, HeaderValue, StatusCode, Uri},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use maud::{html, Markup, PreEscaped, DOCTYPE};
use rand::Rng;
use serde::Serialize;
use std::{
    any::Any,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tower_http::{catch_panic::CatchPanicLayer, services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

// --- Configuration ---
#[derive(Parser, Debug)]
#[command(name = "dirshare", version, about = "Share the current directory over HTTP")]
struct Args {
    /// Port to serve HTTP on
    #[arg(short, long, env = "DIRSHARE_PORT", default_value_t = 9099)]
    port: u16,

    /// Add an inline media preview link next to each file
    #[arg(short = 'w', long)]
    preview: bool,
}

// --- State ---
type SharedState = Arc<AppState>;

struct AppState {
    root_dir: PathBuf, // Shared root, fixed at startup
    preview: bool,
}

// --- Main Application ---
#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dirshare=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let root_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            error!("Failed to resolve the working directory: {}", e);
            eprintln!("Error: failed to resolve the working directory: {}", e);
            std::process::exit(1);
        }
    };

    log_local_addrs();
    info!(
        "Sharing {} on http://localhost:{}",
        root_dir.display(),
        args.port
    );

    let state = Arc::new(AppState {
        root_dir,
        preview: args.preview,
    });
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            eprintln!("Error: failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        error!("Server error: {}", e);
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}

/// Logs every assigned local address once at startup, so the URL to hand
/// to another device on the network is easy to find.
fn log_local_addrs() {
    match if_addrs::get_if_addrs() {
        Ok(ifaces) => {
            info!("Local addresses ({} interfaces):", ifaces.len());
            for iface in &ifaces {
                let ip = iface.ip();
                if ip.is_unspecified() {
                    continue;
                }
                info!("  {} ({})", ip, iface.name);
            }
        }
        Err(e) => error!("Failed to list local interfaces: {}", e),
    }
}

// --- Router ---

/// Builds the application router: the listing page at `/`, raw downloads
/// under `/dir`, and the player page under `/preview`.
fn build_router(state: SharedState) -> Router {
    // The nest strips the `/dir` prefix before the file service sees the
    // path. Directory URLs get a plain 404; the listing is its own route.
    let files = ServeDir::new(&state.root_dir).append_index_html_on_directories(false);

    with_request_pipeline(
        Router::new()
            .route("/", get(list_dir))
            .route("/preview/:mediatype/*path", get(play_media))
            .nest_service("/dir", files)
            .with_state(state),
    )
}

/// Wraps a router in the pipeline shared by every route: access logging,
/// then the panic boundary, then HTTP trace spans.
fn with_request_pipeline(router: Router) -> Router {
    // Layers run in reverse registration order. The access logger sits
    // outermost, so a panic converted into a 500 still gets its log line.
    router
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn(access_log))
}

// --- Middleware ---

const X_REAL_IP: &str = "X-Real-IP";
const X_FORWARDED_FOR: &str = "X-Forwarded-For";

/// Logs one line per request once the inner stack finishes: client,
/// method, path, status and elapsed time. Error statuses log at `warn`.
async fn access_log(req: Request, next: Next) -> Response {
    let remote = client_addr(&req);
    let method = req.method().clone();
    let path = match req.uri().path() {
        "" => "/".to_string(),
        p => p.to_string(),
    };

    let start = Instant::now();
    let res = next.run(req).await;
    let elapsed = start.elapsed();

    let status = res.status();
    if status.is_client_error() || status.is_server_error() {
        warn!(
            "{} {} {} {} {:?}",
            remote,
            method,
            path,
            status.as_u16(),
            elapsed
        );
    } else {
        info!(
            "{} {} {} {} {:?}",
            remote,
            method,
            path,
            status.as_u16(),
            elapsed
        );
    }

    res
}

/// Best guess at the client address: proxy headers first, then the peer
/// address of the connection, then `-`.
fn client_addr(req: &Request) -> String {
    header_ip(req.headers(), X_REAL_IP)
        .or_else(|| header_ip(req.headers(), X_FORWARDED_FOR))
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "-".to_string())
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Turns a panicking handler into a plain 500 and keeps the server alive.
/// The payload and a captured backtrace go to the log, never to the client.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> http::Response<Full<Bytes>> {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic payload"
    };
    let backtrace = std::backtrace::Backtrace::force_capture();
    error!("Handler panicked: {}\n{}", detail, backtrace);

    let mut res = http::Response::new(Full::new(Bytes::from_static(b"internal server error")));
    *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}

// --- Handlers using Maud ---

/// Serves the listing page for the shared root.
async fn list_dir(State(state): State<SharedState>) -> Markup {
    let items = file_items(&state.root_dir, &mut rand::thread_rng());
    listing_page(&items, state.preview)
}

/// Serves a single-video player page. The media type arrives
/// percent-decoded from the route; the source is everything after the two
/// leading path segments.
async fn play_media(
    AxumPath((media_type, rest)): AxumPath<(String, String)>,
    uri: Uri,
) -> Markup {
    let media_type = if media_type == MEDIA_NONE {
        // Let the browser sniff the container.
        String::new()
    } else {
        media_type
    };
    player_page(&media_type, &preview_source(&rest, &uri))
}

/// Source URL for the player: the request path minus the two leading
/// `/preview/<mediatype>` segments (re-encoded, since the router decoded
/// it), or the whole raw path when nothing remains.
fn preview_source(rest: &str, uri: &Uri) -> String {
    if rest.is_empty() {
        uri.path().to_string()
    } else {
        format!("/{}", href_path(rest))
    }
}

/// Percent-encodes each path segment for embedding in an href. The file
/// service decodes the request path once, so literal `%` or spaces in file
/// names must be encoded at render time.
fn href_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

// --- File scanning and classification ---

// The five accent classes the listing rotates through.
const PALETTE: [&str; 5] = ["orange", "blue", "green", "purple", "gold"];

// Classifier result for files without a playable media type.
const MEDIA_NONE: &str = "none";

/// One listing row per discovered file, rebuilt on every request.
#[derive(Serialize, Debug)]
struct FileItem {
    path: String, // Relative to the shared root
    name: String,
    class: &'static str, // Accent class from the palette
    ext: String,         // Lowercase, with the leading dot; empty when absent
    src: String,         // Download URL, doubles as the preview source
    media_type: String,  // Playable MIME with `/` encoded, or `none`
}

/// Recursively collects every regular file under `root` in traversal
/// order. Unreadable entries are logged and skipped; the walk continues.
fn scan_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() {
                    files.push(entry.into_path());
                }
            }
            Err(e) => error!("Skipping unreadable entry under {}: {}", root.display(), e),
        }
    }
    files
}

/// Maps a lowercase dotted extension to a playback MIME type, or the
/// `none` sentinel. Slashes are percent-encoded because the value travels
/// inside a single path segment of the preview URL. `.mkv` stays `none`;
/// the player then leaves typing to the browser.
fn media_type(ext: &str) -> String {
    let mime = match ext {
        ".3gpp" => "video/3gpp",
        ".ogv" => "video/ogg",
        ".webm" => "video/webm",
        ".mp4" => "video/mp4",
        _ => MEDIA_NONE,
    };
    mime.replace('/', "%2f")
}

/// Builds the display record for one scanned file.
fn file_item(root: &Path, path: &Path, rng: &mut impl Rng) -> FileItem {
    let relative = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default();
    let src = format!("/dir/{}", relative);
    let media_type = media_type(&ext);

    FileItem {
        path: relative,
        name,
        class: PALETTE[rng.gen_range(0..PALETTE.len())],
        ext,
        src,
        media_type,
    }
}

/// Scans `root` and builds one record per file. Colors are re-rolled on
/// every call.
fn file_items(root: &Path, rng: &mut impl Rng) -> Vec<FileItem> {
    scan_files(root)
        .iter()
        .map(|path| file_item(root, path, rng))
        .collect()
}

// --- Markup ---

const LISTING_CSS: &str = "
    body { font-family: 'Open Sans', sans-serif; background-color: #3F51B5; width: 90%; margin: 0 auto; padding: 2em 0 6em; }
    ul { margin-bottom: 14px; list-style: none; }
    li { margin: 0 0 7px 0; background-color: #eee; }
    .orange { border-left: 5px solid #F5876E; }
    .blue { border-left: 5px solid #61A8DC; }
    .green { border-left: 5px solid #8EBD40; }
    .purple { border-left: 5px solid #988CC3; }
    .gold { border-left: 5px solid #D8C86E; }
    .preview a { transition: 0.5s color ease; text-decoration: none; color: #333; font-size: 1.7em; }
    .preview .right { float: right; }
";

/// The listing document: one entry per file with a download link and,
/// when previews are on, a `+` link to the player page.
fn listing_page(items: &[FileItem], preview: bool) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                title { "Shared Content" }
                style { (PreEscaped(LISTING_CSS)) }
            }
            body {
                ul {
                    @for item in items {
                        li class=(item.class) {
                            p class="preview" {
                                a href=(href_path(&item.src)) download=(item.name) { (item.name) }
                                @if preview {
                                    " "
                                    a class="right" target="_blank"
                                        href=(format!("/preview/{}{}", item.media_type, href_path(&item.src))) {
                                        "+"
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// The player document: a full-size video element pointed at `src`. An
/// empty `media_type` leaves format detection to the browser.
fn player_page(media_type: &str, src: &str) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                title { "Shared Content" }
            }
            body {
                video width="100%" height="100%" controls {
                    source src=(src) type=(media_type);
                    "Your browser does not support the video tag."
                }
            }
        }
    }
}

// --- Tests ---
