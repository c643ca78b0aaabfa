use crate::certs::{provision, Provisioned};
use crate::config::ServerConfig;
use crate::error::{OtaError, Result};
use crate::exec::CommandRunner;
use crate::manifest::{
    generate_install_page, generate_manifest, install_link, write_atomic, InstallPageData,
    ManifestData, INSTALL_PAGE_FILE, MANIFEST_FILE,
};
use crate::scanner::{inspect_archive, scan_dir, ArchiveInfo};
use crate::tls::load_rustls_config;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::Stream;
use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

pub const ARCHIVE_ROUTE: &str = "/latest.ipa";
pub const MANIFEST_ROUTE: &str = "/manifest.plist";
pub const ICON_ROUTE: &str = "/icon.png";
pub const ICON_FILE: &str = "icon.png";

/// Delay between the last archive byte being handed to the connection and
/// the listener closing, so the transfer can flush.
pub const SERVE_ONCE_GRACE: Duration = Duration::from_secs(1);

/// Upper bound on draining in-flight responses after SIGINT/SIGTERM.
pub const SIGNAL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Content type for a file under the static root.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "ipa" => "application/octet-stream",
        "plist" => "application/xml",
        "html" => "text/html; charset=utf-8",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

/// How a serve-once archive transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Failed(String),
}

impl TransferOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            TransferOutcome::Completed => 0,
            TransferOutcome::Failed(_) => 1,
        }
    }
}

/// One-shot signal from the archive route to the run loop. Clones share the
/// same sender; only the first [`ServeOnce::signal`] is delivered.
#[derive(Debug, Clone)]
pub struct ServeOnce {
    sender: Arc<Mutex<Option<oneshot::Sender<TransferOutcome>>>>,
}

impl ServeOnce {
    pub fn channel() -> (Self, oneshot::Receiver<TransferOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Returns true if this call delivered the outcome.
    pub fn signal(&self, outcome: TransferOutcome) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

/// Archive body that reports how the transfer ended. hyper stops polling
/// once `Content-Length` bytes are written, so completion is decided by the
/// byte count rather than by reaching end of stream.
struct TrackedStream<S> {
    inner: S,
    file_name: String,
    serve_once: Option<ServeOnce>,
    expected: u64,
    sent: u64,
    finished: bool,
}

impl<S> TrackedStream<S> {
    fn finish(&mut self, outcome: TransferOutcome) {
        if self.finished {
            return;
        }
        self.finished = true;

        match &outcome {
            TransferOutcome::Completed => {
                tracing::info!(file = %self.file_name, "archive transfer complete")
            }
            TransferOutcome::Failed(reason) => {
                tracing::warn!(file = %self.file_name, %reason, "archive transfer failed")
            }
        }

        if let Some(once) = &self.serve_once {
            once.signal(outcome);
        }
    }

    fn short_transfer(&self) -> TransferOutcome {
        TransferOutcome::Failed(format!(
            "sent {} of {} bytes",
            self.sent, self.expected
        ))
    }
}

impl<S> Stream for TrackedStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_next(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) => {
                this.sent += chunk.len() as u64;
                if this.sent >= this.expected {
                    this.finish(TransferOutcome::Completed);
                }
            }
            Poll::Ready(Some(Err(e))) => this.finish(TransferOutcome::Failed(e.to_string())),
            Poll::Ready(None) => {
                let outcome = if this.sent >= this.expected {
                    TransferOutcome::Completed
                } else {
                    this.short_transfer()
                };
                this.finish(outcome);
            }
            Poll::Pending => {}
        }
        polled
    }
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        let outcome = if self.sent >= self.expected {
            TransferOutcome::Completed
        } else {
            self.short_transfer()
        };
        self.finish(outcome);
    }
}

/// Read-only state shared by all requests.
#[derive(Debug, Clone)]
pub struct AppState {
    pub archive: Arc<ArchiveInfo>,
    pub dist_dir: Arc<PathBuf>,
    pub serve_once: Option<ServeOnce>,
    pub has_icon: bool,
}

impl AppState {
    pub fn new(archive: ArchiveInfo, dist_dir: PathBuf, serve_once: Option<ServeOnce>) -> Self {
        let has_icon = dist_dir.join(ICON_FILE).is_file();
        Self {
            archive: Arc::new(archive),
            dist_dir: Arc::new(dist_dir),
            serve_once,
            has_icon,
        }
    }
}

async fn serve_static(path: PathBuf) -> Response {
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type_for(&path))],
            bytes,
        )
            .into_response(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to read artifact");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn install_page(State(state): State<AppState>) -> Response {
    serve_static(state.dist_dir.join(INSTALL_PAGE_FILE)).await
}

async fn manifest(State(state): State<AppState>) -> Response {
    serve_static(state.dist_dir.join(MANIFEST_FILE)).await
}

async fn icon(State(state): State<AppState>) -> Response {
    serve_static(state.dist_dir.join(ICON_FILE)).await
}

async fn archive(State(state): State<AppState>, method: Method) -> Response {
    let info = &state.archive;
    // HEAD bodies are discarded, so they never count as a download.
    let serve_once = if method == Method::HEAD {
        None
    } else {
        state.serve_once.clone()
    };

    let file = match tokio::fs::File::open(&info.path).await {
        Ok(f) => f,
        Err(e) => {
            tracing::error!(path = %info.path.display(), error = %e, "cannot open archive");
            if let Some(once) = serve_once {
                once.signal(TransferOutcome::Failed(e.to_string()));
            }
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    tracing::info!(
        file = %info.file_name(),
        size = info.size,
        serve_once = serve_once.is_some(),
        "serving archive"
    );

    let stream = TrackedStream {
        inner: ReaderStream::new(file),
        file_name: info.file_name(),
        serve_once,
        expected: info.size,
        sent: 0,
        finished: false,
    };

    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", info.file_name()))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static(content_type_for(&info.path)),
            ),
            (header::CONTENT_LENGTH, HeaderValue::from(info.size)),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(install_page))
        .route(MANIFEST_ROUTE, get(manifest))
        .route(ARCHIVE_ROUTE, get(archive));

    if state.has_icon {
        router = router.route(ICON_ROUTE, get(icon));
    }

    router
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Everything computed before the listener binds.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub config: ServerConfig,
    pub archive: ArchiveInfo,
    pub provisioned: Provisioned,
    pub scheme: Scheme,
    pub base_url: String,
    pub manifest_url: String,
    pub install_url: String,
}

impl Prepared {
    pub fn ipa_url(&self) -> String {
        format!("{}{}", self.base_url, ARCHIVE_ROUTE)
    }
}

fn discover_archive(config: &ServerConfig) -> Result<ArchiveInfo> {
    let archives = match &config.ipa_path {
        Some(path) => vec![inspect_archive(path)?],
        None => scan_dir(&config.work_dir)?,
    };

    tracing::info!(count = archives.len(), dir = %config.work_dir.display(), "scanned for archives");

    archives.into_iter().next().ok_or_else(|| {
        OtaError::Startup(format!(
            "no .ipa files found in {}",
            config.work_dir.display()
        ))
    })
}

/// Runs the startup sequence up to (not including) binding: pick the
/// archive, provision trust, write the manifest and install page.
pub fn prepare(config: ServerConfig, runner: &dyn CommandRunner) -> Result<Prepared> {
    fs::create_dir_all(&config.dist_dir)?;

    let archive = discover_archive(&config)?;
    tracing::info!(
        file = %archive.file_name(),
        bundle_id = %archive.bundle_id,
        version = %archive.version,
        name = %archive.display_name,
        "selected archive"
    );

    let mut provisioned = provision(config.dev, runner, &config.certs_dir())?;
    if config.dev {
        if let Some(host) = &config.hostname {
            provisioned.hostname = host.clone();
        }
    }

    if config.require_https && !provisioned.certs.exists {
        return Err(OtaError::Startup(format!(
            "HTTPS is required but no certificate is available at {}",
            provisioned.certs.cert_path.display()
        )));
    }

    let scheme = if provisioned.certs.exists {
        Scheme::Https
    } else {
        tracing::warn!("no certificate available, serving plain HTTP (iOS will refuse to install)");
        Scheme::Http
    };

    let base_url = format!("{}://{}:{}", scheme, provisioned.hostname, config.port);
    let manifest_url = format!("{}{}", base_url, MANIFEST_ROUTE);
    let install_url = install_link(&manifest_url);

    let icon_url = match &config.icon_path {
        Some(icon) => {
            write_atomic(&config.dist_dir.join(ICON_FILE), &fs::read(icon)?)?;
            Some(format!("{}{}", base_url, ICON_ROUTE))
        }
        None => {
            // Stale icon from an earlier run would otherwise still be served.
            let stale = config.dist_dir.join(ICON_FILE);
            if stale.is_file() {
                fs::remove_file(stale)?;
            }
            None
        }
    };

    let prepared = Prepared {
        config,
        archive,
        provisioned,
        scheme,
        base_url,
        manifest_url,
        install_url,
    };

    let manifest = ManifestData {
        bundle_id: prepared.archive.bundle_id.clone(),
        version: prepared.archive.version.clone(),
        title: prepared.archive.display_name.clone(),
        ipa_url: prepared.ipa_url(),
        icon_small_url: icon_url.clone(),
        icon_large_url: icon_url,
    };
    generate_manifest(
        &prepared.config.templates_dir,
        &prepared.config.dist_dir,
        &manifest,
    )?;

    let page = InstallPageData {
        app_name: prepared.archive.display_name.clone(),
        version: prepared.archive.version.clone(),
        build_number: prepared.archive.build_number.clone(),
        bundle_id: prepared.archive.bundle_id.clone(),
        install_url: prepared.install_url.clone(),
        manifest_url: prepared.manifest_url.clone(),
        file_size: prepared.archive.size,
    };
    generate_install_page(
        &prepared.config.templates_dir,
        &prepared.config.dist_dir,
        &page,
    )?;

    Ok(prepared)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn transfer_finished(rx: Option<oneshot::Receiver<TransferOutcome>>) -> Option<TransferOutcome> {
    match rx {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}

/// Binds the listener and serves until a signal or, in serve-once mode,
/// until the archive transfer ends. Returns the process exit code.
pub async fn serve(prepared: Prepared) -> Result<i32> {
    let once = prepared.config.serve_once.then(ServeOnce::channel);
    serve_with(prepared, axum_server::Handle::new(), once).await
}

/// [`serve`] with a caller-owned listener handle and serve-once channel.
/// `handle` reports the bound address and can stop the listener.
pub async fn serve_with(
    prepared: Prepared,
    handle: axum_server::Handle,
    once: Option<(ServeOnce, oneshot::Receiver<TransferOutcome>)>,
) -> Result<i32> {
    let (serve_once, once_rx) = match once {
        Some((tx, rx)) => (Some(tx), Some(rx)),
        None => (None, None),
    };

    let state = AppState::new(
        prepared.archive.clone(),
        prepared.config.dist_dir.clone(),
        serve_once,
    );
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], prepared.config.port));

    let mut server = match prepared.scheme {
        Scheme::Https => {
            let tls = load_rustls_config(&prepared.provisioned.certs)?;
            tokio::spawn(
                axum_server::bind_rustls(addr, tls)
                    .handle(handle.clone())
                    .serve(app.into_make_service()),
            )
        }
        Scheme::Http => tokio::spawn(
            axum_server::bind(addr)
                .handle(handle.clone())
                .serve(app.into_make_service()),
        ),
    };

    let Some(bound) = handle.listening().await else {
        return match server.await {
            Ok(Err(e)) => Err(OtaError::Startup(format!("cannot bind {}: {}", addr, e))),
            _ => Err(OtaError::Startup(format!("cannot bind {}", addr))),
        };
    };

    tracing::info!(url = %format!("{}/", prepared.base_url), "install page");
    tracing::info!(link = %prepared.install_url, "itms-services link");
    let mode = if prepared.config.dev {
        "development"
    } else {
        "production"
    };
    tracing::info!(
        mode,
        scheme = %prepared.scheme,
        serve_once = once_rx.is_some(),
        addr = %bound,
        "listening"
    );

    let exit_code = tokio::select! {
        res = &mut server => {
            return match res {
                Ok(Ok(())) => Ok(0),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(OtaError::Startup(format!("server task failed: {}", e))),
            };
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, closing listener");
            handle.graceful_shutdown(Some(SIGNAL_DRAIN_TIMEOUT));
            0
        }
        Some(outcome) = transfer_finished(once_rx) => {
            tracing::info!(?outcome, grace = ?SERVE_ONCE_GRACE, "serve-once transfer finished, shutting down");
            tokio::time::sleep(SERVE_ONCE_GRACE).await;
            handle.shutdown();
            outcome.exit_code()
        }
    };

    if let Ok(Err(e)) = server.await {
        tracing::warn!(error = %e, "listener closed with error");
    }
    Ok(exit_code)
}

pub async fn run(config: ServerConfig, runner: &dyn CommandRunner) -> Result<i32> {
    let prepared = prepare(config, runner)?;
    serve(prepared).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};

    fn tracked(
        chunks: Vec<&'static [u8]>,
        expected: u64,
    ) -> (
        TrackedStream<impl Stream<Item = io::Result<Bytes>> + Unpin>,
        oneshot::Receiver<TransferOutcome>,
    ) {
        let (once, rx) = ServeOnce::channel();
        let inner = stream::iter(chunks.into_iter().map(|c| Ok::<_, io::Error>(Bytes::from_static(c))));
        let stream = TrackedStream {
            inner,
            file_name: "App.ipa".to_string(),
            serve_once: Some(once),
            expected,
            sent: 0,
            finished: false,
        };
        (stream, rx)
    }

    #[tokio::test]
    async fn complete_once_declared_length_is_yielded() {
        // hyper stops polling after Content-Length bytes, before end of stream.
        let (mut body, mut rx) = tracked(vec![&b"abc"[..], &b"de"[..]], 5);
        assert!(body.next().await.is_some());
        assert!(rx.try_recv().is_err());
        assert!(body.next().await.is_some());
        assert_eq!(rx.try_recv(), Ok(TransferOutcome::Completed));
        drop(body);
    }

    #[tokio::test]
    async fn short_body_fails() {
        let (mut body, mut rx) = tracked(vec![&b"abc"[..]], 5);
        while body.next().await.is_some() {}
        assert_eq!(
            rx.try_recv(),
            Ok(TransferOutcome::Failed("sent 3 of 5 bytes".to_string()))
        );
    }

    #[tokio::test]
    async fn dropped_midway_fails() {
        let (mut body, mut rx) = tracked(vec![&b"abc"[..], &b"de"[..]], 5);
        assert!(body.next().await.is_some());
        drop(body);
        assert!(matches!(rx.try_recv(), Ok(TransferOutcome::Failed(_))));
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for(Path::new("a.IPA")), "application/octet-stream");
        assert_eq!(content_type_for(Path::new("manifest.plist")), "application/xml");
        assert_eq!(content_type_for(Path::new("install.html")), "text/html; charset=utf-8");
        assert_eq!(content_type_for(Path::new("icon.png")), "image/png");
    }
}
