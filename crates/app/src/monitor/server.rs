//! Actix Web server exposing the live MJPEG feed, the clip archive and
//! playback streams.
//!
//! The server runs on a dedicated thread so the pipeline never shares a
//! runtime with HTTP handling. Handlers only ever read from broadcasters and
//! the status snapshot; the pipeline is never blocked by a slow client.

use std::{
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    pin::pin,
    sync::Arc,
    time::Duration,
};

use actix_web::{
    App, HttpResponse, HttpServer,
    dev::Service,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use futures_util::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use motion_core::{
    ClipEntry, FrameBroadcaster, FrameSubscriber, consume_stream, imaging, naming,
};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, instrument::WithSubscriber, warn};

use crate::{
    html,
    monitor::{
        data::{SharedStatus, read_status},
        playback::{PlaybackError, PlaybackPool},
        telemetry,
    },
};

/// Upper bound on a graceful stop once streams have been told to end.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) live: Arc<FrameBroadcaster>,
    pub(crate) status: SharedStatus,
    pub(crate) output_dir: PathBuf,
    pub(crate) playback: PlaybackPool,
    pub(crate) jpeg_quality: u8,
    pub(crate) prometheus: Option<&'static PrometheusHandle>,
    pub(crate) streams: StreamShutdown,
}

/// Tells open MJPEG responses to end so a graceful stop does not wait on
/// viewers that would otherwise stream forever.
#[derive(Clone)]
pub(crate) struct StreamShutdown(Arc<watch::Sender<bool>>);

impl Default for StreamShutdown {
    fn default() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }
}

impl StreamShutdown {
    pub(crate) fn signal(&self) {
        self.0.send_replace(true);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

/// Handle for the HTTP server thread.
pub(crate) struct MonitorServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl MonitorServer {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// Bind `addr` and serve on a background thread.
///
/// Binding happens on the calling thread so an unavailable port fails
/// startup instead of being logged from the server thread. Actix workers run
/// on threads of their own, so every request is polled under the caller's
/// tracing dispatcher.
pub(crate) fn spawn_http_server(state: ServerState, addr: (&str, u16)) -> Result<MonitorServer> {
    let listener = TcpListener::bind(addr)
        .with_context(|| format!("Failed to bind HTTP server to {}:{}", addr.0, addr.1))?;
    let local_addr = listener
        .local_addr()
        .context("Failed to read HTTP listener address")?;
    let streams = state.streams.clone();
    let state = web::Data::new(state);
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = telemetry::spawn_thread("monitor-http-server", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                let dispatch = dispatch.clone();
                App::new()
                    .app_data(state.clone())
                    .wrap_fn(move |req, srv| srv.call(req).with_subscriber(dispatch.clone()))
                    .configure(configure)
            })
            .disable_signals()
            .shutdown_timeout(SHUTDOWN_TIMEOUT.as_secs())
            .listen(listener)?
            .run();

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                streams.signal();
                srv_handle.stop(true).await;
            });

            server.await
        }) {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn HTTP server thread")?;
    Ok(MonitorServer {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

/// Route table, shared with the handler tests.
pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index_route))
        .route("/video_feed", web::get().to(video_feed_handler))
        .route("/frame.jpg", web::get().to(frame_handler))
        .route("/clips", web::get().to(clips_handler))
        .route("/video_list", web::get().to(video_list_route))
        .route("/video/{name}", web::get().to(video_route))
        .route("/clips/{name}/stream.mjpg", web::get().to(clip_stream_handler))
        .route("/status", web::get().to(status_handler))
        .route("/metrics", web::get().to(metrics_handler));
}

/// Wrap one JPEG as a multipart part.
fn mjpeg_part(jpeg: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(jpeg.len() + 64);
    payload.extend_from_slice(b"--frame\r\n");
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    payload
}

/// Tracks open MJPEG connections in the consumer gauge.
struct ConsumerGauge;

impl ConsumerGauge {
    fn open() -> Self {
        metrics::gauge!("monitor_stream_consumers").increment(1.0);
        Self
    }
}

impl Drop for ConsumerGauge {
    fn drop(&mut self) {
        metrics::gauge!("monitor_stream_consumers").decrement(1.0);
    }
}

/// Serve a subscription as `multipart/x-mixed-replace` until the feed ends
/// or the server begins shutting down.
fn mjpeg_response(
    subscriber: FrameSubscriber,
    quality: u8,
    closing: watch::Receiver<bool>,
) -> HttpResponse {
    let gauge = ConsumerGauge::open();
    let parts = consume_stream(subscriber, move |frame| {
        imaging::encode_jpeg(frame, quality)
            .map(|jpeg| mjpeg_part(&jpeg))
            .inspect_err(|_| metrics::counter!("monitor_encode_errors_total").increment(1))
    });
    let stream = stream! {
        let _gauge = gauge;
        let mut closing = closing;
        let mut parts = pin!(parts);
        loop {
            let part = tokio::select! {
                part = parts.next() => part,
                _ = closing.wait_for(|closed| *closed) => None,
            };
            let Some(part) = part else {
                break;
            };
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(part));
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .insert_header((header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

async fn index_route() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(html::INDEX_HTML)
}

/// Live MJPEG feed.
async fn video_feed_handler(state: web::Data<ServerState>) -> HttpResponse {
    mjpeg_response(
        state.live.subscribe(),
        state.jpeg_quality,
        state.streams.subscribe(),
    )
}

/// Latest live frame as a single JPEG.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    let Some(frame) = state.live.latest() else {
        return HttpResponse::NoContent().finish();
    };
    match imaging::encode_jpeg(&frame, state.jpeg_quality) {
        Ok(jpeg) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .append_header(("Cache-Control", "no-cache"))
            .body(jpeg),
        Err(err) => {
            metrics::counter!("monitor_encode_errors_total").increment(1);
            HttpResponse::InternalServerError().body(err.to_string())
        }
    }
}

fn load_clips(state: &ServerState) -> Result<Vec<ClipEntry>, HttpResponse> {
    naming::list_clips(&state.output_dir).map_err(|err| {
        warn!("Listing {} failed: {err}", state.output_dir.display());
        HttpResponse::InternalServerError().body("cannot list clips")
    })
}

/// Clip listing as JSON, newest first.
async fn clips_handler(state: web::Data<ServerState>) -> HttpResponse {
    match load_clips(&state) {
        Ok(clips) => HttpResponse::Ok().json(clips),
        Err(response) => response,
    }
}

async fn video_list_route(state: web::Data<ServerState>) -> HttpResponse {
    match load_clips(&state) {
        Ok(clips) => HttpResponse::Ok()
            .content_type("text/html; charset=utf-8")
            .body(html::clip_list_page(&clips)),
        Err(response) => response,
    }
}

/// Resolve a clip name in either timestamp format to an existing file.
fn find_clip(state: &ServerState, name: &str) -> Result<ClipEntry, HttpResponse> {
    let stem = naming::resolve_clip_name(name)
        .map_err(|err| HttpResponse::BadRequest().body(err.to_string()))?;
    let path = naming::clip_path(&state.output_dir, &stem);
    if !path.is_file() {
        return Err(HttpResponse::NotFound().body(format!("no clip named {stem}")));
    }
    let display = naming::format_timestamp(&stem)
        .map_err(|err| HttpResponse::BadRequest().body(err.to_string()))?;
    Ok(ClipEntry {
        stem,
        display,
        path,
    })
}

async fn video_route(state: web::Data<ServerState>, name: web::Path<String>) -> HttpResponse {
    match find_clip(&state, &name) {
        Ok(clip) => HttpResponse::Ok()
            .content_type("text/html; charset=utf-8")
            .body(html::clip_player_page(&clip)),
        Err(response) => response,
    }
}

/// Replay a recorded clip as MJPEG.
async fn clip_stream_handler(
    state: web::Data<ServerState>,
    name: web::Path<String>,
) -> HttpResponse {
    let clip = match find_clip(&state, &name) {
        Ok(clip) => clip,
        Err(response) => return response,
    };
    match state.playback.start(&clip.path) {
        Ok(subscriber) => {
            debug!(clip = %clip.stem, "playback session started");
            mjpeg_response(subscriber, state.jpeg_quality, state.streams.subscribe())
        }
        Err(err @ PlaybackError::Busy(_)) => HttpResponse::ServiceUnavailable()
            .append_header((header::RETRY_AFTER, "5"))
            .body(err.to_string()),
        Err(PlaybackError::Missing) => {
            HttpResponse::NotFound().body(format!("no clip named {}", clip.stem))
        }
        Err(err) => {
            warn!(clip = %clip.stem, "playback failed to start: {err}");
            HttpResponse::InternalServerError().body(err.to_string())
        }
    }
}

async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(read_status(&state.status))
}

/// Prometheus text exposition.
async fn metrics_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.prometheus {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::poll_fn,
        io::{Read, Write},
        net::TcpStream,
        path::Path,
        pin::Pin,
        sync::Mutex,
        time::Instant,
    };

    use actix_web::{
        body::{BoxBody, MessageBody},
        http::StatusCode,
        test,
    };
    use motion_core::{ClipWriter, Codec, FrameSink};
    use tracing_subscriber::layer::SubscriberExt;
    use video_ingest::Frame;

    use super::*;

    /// Records the level and thread of every event it sees.
    #[derive(Clone, Default)]
    struct CapturedEvents(Arc<Mutex<Vec<(Option<String>, tracing::Level)>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for CapturedEvents {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            let thread = std::thread::current().name().map(str::to_owned);
            self.0.lock().unwrap().push((thread, *event.metadata().level()));
        }
    }

    fn request(addr: SocketAddr, path: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        write!(
            stream,
            "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .unwrap();
        stream
    }

    fn state(dir: &Path, playback_slots: usize) -> ServerState {
        ServerState {
            live: Arc::new(FrameBroadcaster::new()),
            status: SharedStatus::default(),
            output_dir: dir.to_path_buf(),
            playback: PlaybackPool::new(playback_slots),
            jpeg_quality: 80,
            prometheus: None,
            streams: StreamShutdown::default(),
        }
    }

    fn write_clip(dir: &Path, stem: &str) {
        let mut writer = ClipWriter::create(&dir.join(format!("{stem}.clip")), Codec::Mjpg, 50.0)
            .unwrap();
        for ts in 0..20 {
            writer
                .write_frame(&Frame::filled(16, 8, [200, 10, 10], ts))
                .unwrap();
        }
        writer.close().unwrap();
    }

    async fn first_chunk(body: BoxBody) -> Bytes {
        let mut body = body;
        poll_fn(|cx| Pin::new(&mut body).poll_next(cx))
            .await
            .expect("stream produced a chunk")
            .expect("chunk is not an error")
    }

    #[actix_web::test]
    async fn index_and_status_are_served() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state(dir.path(), 1)))
                .configure(configure),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let status: serde_json::Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/status").to_request(),
        )
        .await;
        assert_eq!(status["frames_processed"], 0);
        assert_eq!(status["recording"], false);
    }

    #[actix_web::test]
    async fn frame_jpg_is_empty_until_a_frame_is_published() {
        let dir = tempfile::tempdir().unwrap();
        let data = web::Data::new(state(dir.path(), 1));
        let app =
            test::init_service(App::new().app_data(data.clone()).configure(configure)).await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/frame.jpg").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        data.live.publish(Frame::filled(16, 16, [9, 9, 9], 1));
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/frame.jpg").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/jpeg"
        );
        let body = test::read_body(resp).await;
        assert_eq!(&body[..2], &[0xFF, 0xD8]);
    }

    #[actix_web::test]
    async fn video_feed_streams_multipart_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let data = web::Data::new(state(dir.path(), 1));
        data.live.publish(Frame::filled(16, 16, [9, 9, 9], 1));
        let app =
            test::init_service(App::new().app_data(data.clone()).configure(configure)).await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/video_feed").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "multipart/x-mixed-replace; boundary=frame"
        );
        let chunk = first_chunk(resp.into_body()).await;
        assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
        assert!(chunk.ends_with(b"\r\n"));
    }

    #[actix_web::test]
    async fn clip_listing_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        write_clip(dir.path(), "20240101-080000");
        write_clip(dir.path(), "20240102-080000");
        std::fs::write(dir.path().join("stray.txt"), b"x").unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state(dir.path(), 1)))
                .configure(configure),
        )
        .await;

        let clips: serde_json::Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/clips").to_request(),
        )
        .await;
        assert_eq!(
            clips,
            serde_json::json!([
                {"stem": "20240102-080000", "display": "02.01.2024 - 08:00:00"},
                {"stem": "20240101-080000", "display": "01.01.2024 - 08:00:00"},
            ])
        );

        let page = test::call_and_read_body(
            &app,
            test::TestRequest::get().uri("/video_list").to_request(),
        )
        .await;
        let page = String::from_utf8(page.to_vec()).unwrap();
        assert!(page.contains("02.01.2024 - 08:00:00"));
    }

    #[actix_web::test]
    async fn clip_routes_validate_names() {
        let dir = tempfile::tempdir().unwrap();
        write_clip(dir.path(), "20240101-080000");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state(dir.path(), 0)))
                .configure(configure),
        )
        .await;

        for (uri, expected) in [
            ("/clips/not-a-clip/stream.mjpg", StatusCode::BAD_REQUEST),
            ("/clips/20231231-235959/stream.mjpg", StatusCode::NOT_FOUND),
            ("/clips/20240101-080000/stream.mjpg", StatusCode::SERVICE_UNAVAILABLE),
            ("/video/01.01.2024%20-%2008:00:00", StatusCode::OK),
            ("/video/20231231-235959", StatusCode::NOT_FOUND),
        ] {
            let resp =
                test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
            assert_eq!(resp.status(), expected, "{uri}");
        }
    }

    #[actix_web::test]
    async fn clip_playback_streams_recorded_frames() {
        let dir = tempfile::tempdir().unwrap();
        write_clip(dir.path(), "20240101-080000");
        let data = web::Data::new(state(dir.path(), 1));
        let app =
            test::init_service(App::new().app_data(data.clone()).configure(configure)).await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/clips/20240101-080000/stream.mjpg")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let chunk = first_chunk(resp.into_body()).await;
        assert!(chunk.starts_with(b"--frame\r\n"));
        assert_eq!(data.playback.active(), 1);
    }

    #[actix_web::test]
    async fn metrics_without_recorder_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state(dir.path(), 1)))
                .configure(configure),
        )
        .await;
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/metrics").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn live_stream_ends_when_streams_are_signalled() {
        let dir = tempfile::tempdir().unwrap();
        let data = web::Data::new(state(dir.path(), 1));
        data.live.publish(Frame::filled(16, 16, [9, 9, 9], 1));
        let app =
            test::init_service(App::new().app_data(data.clone()).configure(configure)).await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/video_feed").to_request(),
        )
        .await;
        let mut body = resp.into_body();
        poll_fn(|cx| Pin::new(&mut body).poll_next(cx))
            .await
            .expect("first part")
            .unwrap();

        data.streams.signal();
        let next = tokio::time::timeout(
            Duration::from_secs(1),
            poll_fn(|cx| Pin::new(&mut body).poll_next(cx)),
        )
        .await
        .expect("stream reacted to the signal");
        assert!(next.is_none());
    }

    #[::core::prelude::v1::test]
    fn stop_returns_promptly_with_a_viewer_attached() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), 1);
        state.live.publish(Frame::filled(16, 16, [9, 9, 9], 1));
        let server = spawn_http_server(state, ("127.0.0.1", 0)).unwrap();

        let mut viewer = request(server.local_addr(), "/video_feed");
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        while !received.windows(7).any(|w| w == b"--frame") {
            let n = viewer.read(&mut buf).unwrap();
            assert!(n > 0, "feed closed before the first part");
            received.extend_from_slice(&buf[..n]);
        }

        let started = Instant::now();
        server.stop();
        assert!(
            started.elapsed() < SHUTDOWN_TIMEOUT,
            "stop took {:?}",
            started.elapsed()
        );
    }

    #[::core::prelude::v1::test]
    fn request_logs_reach_the_callers_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("plain-file");
        std::fs::write(&not_a_dir, b"x").unwrap();

        let events = CapturedEvents::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(events.clone()));
        let server = spawn_http_server(state(&not_a_dir, 1), ("127.0.0.1", 0)).unwrap();

        let mut response = String::new();
        request(server.local_addr(), "/clips")
            .read_to_string(&mut response)
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 500"), "{response}");
        server.stop();

        let here = std::thread::current().name().map(str::to_owned);
        let events = events.0.lock().unwrap();
        assert!(
            events
                .iter()
                .any(|(thread, level)| *level == tracing::Level::WARN && *thread != here),
            "{events:?}"
        );
    }
}
