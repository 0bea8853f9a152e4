// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! The HTTP service: lock lifecycle, caption CRUD, the approve-layout
//! action, the inbound webhook, and the sync websocket.

mod actions;
mod captions;
mod path;
mod sync;
mod websocket;

use std::sync::Arc;

use base::clock::Clocks;
use base::{bail, err, Error, ErrorKind};
use db::auth::{BearerToken, Identity};
use db::registry::{Registry, Video};
use db::workingcopy::WorkingCopies;
use http::{header, header::HeaderValue, Method, Request, Response, StatusCode};
use hyper::Body;
use tracing::{debug, warn};
use url::form_urlencoded;

use self::path::Path;
use crate::flow::{FramesetPublisher, IngestLauncher};
use crate::json;
use crate::lock::LockManager;
use crate::session::{SessionContext, SessionMap};

/// An HTTP error response.
///
/// A thin wrapper over the hyper response type allowing automatic
/// conversion from `base::Error` (the orphan rule prevents converting
/// directly to `hyper::Response`).
pub(crate) struct HttpError(Response<Body>);

impl From<Response<Body>> for HttpError {
    fn from(response: Response<Body>) -> Self {
        HttpError(response)
    }
}

impl From<Error> for HttpError {
    fn from(err: Error) -> Self {
        HttpError(from_base_error(err))
    }
}

fn plain_response<B: Into<Body>>(status: StatusCode, body: B) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .body(body.into())
        .expect("hardcoded head should be valid")
}

fn not_found<B: Into<Body>>(body: B) -> HttpError {
    HttpError(plain_response(StatusCode::NOT_FOUND, body))
}

fn bad_req<B: Into<Body>>(body: B) -> HttpError {
    HttpError(plain_response(StatusCode::BAD_REQUEST, body))
}

fn method_not_allowed(expected: &'static str) -> HttpError {
    HttpError(plain_response(StatusCode::METHOD_NOT_ALLOWED, expected))
}

fn internal_server_err<E: std::fmt::Display>(err: E) -> HttpError {
    HttpError(plain_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        err.to_string(),
    ))
}

fn from_base_error(err: Error) -> Response<Body> {
    use ErrorKind::*;
    let status_code = match err.kind() {
        Unauthenticated => StatusCode::UNAUTHORIZED,
        PermissionDenied => StatusCode::FORBIDDEN,
        InvalidArgument | FailedPrecondition => StatusCode::BAD_REQUEST,
        NotFound => StatusCode::NOT_FOUND,
        Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    plain_response(status_code, err.to_string())
}

type ResponseResult = Result<Response<Body>, HttpError>;

fn serve_json_status<T: serde::Serialize>(status: StatusCode, out: &T) -> ResponseResult {
    let body = serde_json::to_vec(out).map_err(internal_server_err)?;
    Ok(Response::builder()
        .status(status)
        .header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )
        .body(body.into())
        .expect("hardcoded head should be valid"))
}

fn serve_json<T: serde::Serialize>(out: &T) -> ResponseResult {
    serve_json_status(StatusCode::OK, out)
}

/// Extracts an `application/json` request body as bytes.
async fn extract_json_body(req: &mut Request<Body>) -> Result<hyper::body::Bytes, HttpError> {
    let correct_mime_type = match req.headers().get(header::CONTENT_TYPE) {
        Some(t) if t == "application/json" => true,
        Some(t) if t == "application/json; charset=UTF-8" => true,
        _ => false,
    };
    if !correct_mime_type {
        return Err(bad_req("expected application/json request body"));
    }
    let b = std::mem::replace(req.body_mut(), Body::empty());
    hyper::body::to_bytes(b)
        .await
        .map_err(|e| internal_server_err(format!("unable to read request body: {e}")))
}

fn parse_json_body<'a, T: serde::Deserialize<'a>>(body: &'a [u8]) -> Result<T, HttpError> {
    serde_json::from_slice(body).map_err(|e| bad_req(e.to_string()))
}

/// The authenticated requester.
pub(crate) struct Caller {
    pub identity: Identity,
}

pub struct Config<C: Clocks + Clone> {
    pub registry: Arc<Registry<C>>,
    pub copies: Arc<WorkingCopies<C>>,
    pub sessions: Arc<SessionMap>,
    pub locks: Arc<LockManager<C>>,
    pub publisher: Arc<FramesetPublisher<C>>,
    pub ingest: Option<Arc<dyn IngestLauncher>>,
    pub webhook_secret: Option<String>,
}

pub struct Service<C: Clocks + Clone> {
    registry: Arc<Registry<C>>,
    copies: Arc<WorkingCopies<C>>,
    sessions: Arc<SessionMap>,
    locks: Arc<LockManager<C>>,
    publisher: Arc<FramesetPublisher<C>>,
    ingest: Option<Arc<dyn IngestLauncher>>,
    webhook_secret: Option<String>,
}

impl<C: Clocks + Clone> Service<C> {
    pub fn new(config: Config<C>) -> Self {
        Service {
            registry: config.registry,
            copies: config.copies,
            sessions: config.sessions,
            locks: config.locks,
            publisher: config.publisher,
            ingest: config.ingest,
            webhook_secret: config.webhook_secret,
        }
    }

    fn session_context(&self) -> SessionContext<C> {
        SessionContext {
            registry: self.registry.clone(),
            copies: self.copies.clone(),
            sessions: self.sessions.clone(),
        }
    }

    /// Pulls a query parameter out of the request URI.
    fn query_param(req: &Request<Body>, name: &str) -> Option<String> {
        let q = req.uri().query()?;
        form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Authenticates via `Authorization: Bearer` or (for websocket
    /// upgrades, which can't set headers from browsers) a `token` query
    /// parameter.
    fn authenticate(&self, req: &Request<Body>) -> Result<Caller, Error> {
        let header_token = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let query_token = Self::query_param(req, "token");
        let mut l = self.registry.lock();
        let identity = if let Some(h) = header_token.as_deref() {
            let token =
                BearerToken::from_header(h).ok_or_else(|| err!(Unauthenticated, msg("malformed Authorization header")))?;
            l.authenticate_bearer(token)?
        } else if let Some(q) = query_token.as_deref() {
            let token = BearerToken::from_raw(q)
                .ok_or_else(|| err!(Unauthenticated, msg("empty token parameter")))?;
            l.authenticate_bearer(token)?
        } else {
            bail!(Unauthenticated, msg("missing bearer token"));
        };
        Ok(Caller { identity })
    }

    /// Loads the video, hiding other tenants' videos as missing.
    fn video_for_caller(
        &self,
        video_id: &str,
        caller: &Caller,
    ) -> Result<Option<Video>, HttpError> {
        let video = self.registry.lock().get_video(video_id)?;
        match video {
            Some(v) if v.tenant_id != caller.identity.tenant_id => {
                Err(not_found(format!("no such video {video_id}")))
            }
            other => Ok(other),
        }
    }

    fn require_video(&self, video_id: &str, caller: &Caller) -> Result<Video, HttpError> {
        self.video_for_caller(video_id, caller)?
            .ok_or_else(|| not_found(format!("no such video {video_id}")))
    }

    async fn serve_inner(
        self: Arc<Self>,
        req: Request<Body>,
        p: Path,
        caller: Caller,
    ) -> ResponseResult {
        match p {
            Path::TopLevel => serve_json(&serde_json::json!({
                "service": "capsync",
                "version": env!("CARGO_PKG_VERSION"),
            })),
            Path::Video(video_id) => {
                if *req.method() != Method::GET {
                    return Err(method_not_allowed("GET expected"));
                }
                let video = self.require_video(&video_id, &caller)?;
                serve_json(&json::VideoView::from_video(&video))
            }
            Path::DatabaseState(video_id, db) => {
                if *req.method() != Method::GET {
                    return Err(method_not_allowed("GET expected"));
                }
                self.get_database_state(&caller, &video_id, db)
            }
            Path::DatabaseLock(video_id, db) => match *req.method() {
                Method::POST => self.acquire_lock(&caller, &video_id, db),
                Method::DELETE => self.release_lock(&caller, &video_id, db),
                _ => Err(method_not_allowed("POST or DELETE expected")),
            },
            Path::EnsureState(video_id, db) => {
                if *req.method() != Method::POST {
                    return Err(method_not_allowed("POST expected"));
                }
                self.ensure_state(&caller, &video_id, db)
            }
            Path::Captions(video_id) => match *req.method() {
                Method::GET => self.list_captions(&req, &caller, &video_id).await,
                Method::POST => self.create_caption(req, caller, video_id).await,
                _ => Err(method_not_allowed("GET or POST expected")),
            },
            Path::CaptionsBatch(video_id) => {
                if *req.method() != Method::POST {
                    return Err(method_not_allowed("POST expected"));
                }
                self.batch_captions(req, caller, video_id).await
            }
            Path::Caption(video_id, caption_id) => match *req.method() {
                Method::GET => self.get_caption(&caller, &video_id, caption_id).await,
                Method::PUT => {
                    self.update_caption(req, caller, video_id, caption_id)
                        .await
                }
                Method::DELETE => self.delete_caption(&caller, &video_id, caption_id).await,
                _ => Err(method_not_allowed("GET, PUT, or DELETE expected")),
            },
            Path::CaptionText(video_id, caption_id) => {
                if *req.method() != Method::PUT {
                    return Err(method_not_allowed("PUT expected"));
                }
                self.update_caption_text(req, caller, video_id, caption_id)
                    .await
            }
            Path::ApproveLayout(video_id) => {
                if *req.method() != Method::POST {
                    return Err(method_not_allowed("POST expected"));
                }
                self.approve_layout(req, caller, video_id).await
            }
            Path::Sync(video_id, db) => self.sync_socket(req, caller, video_id, db),
            // Handled before authentication.
            Path::Webhook | Path::NotFound => Err(not_found("path not understood")),
        }
    }

    /// Serves an HTTP request.
    ///
    /// An error return from this method would cause hyper to abruptly drop
    /// the connection rather than respond, so it always returns `Ok`; the
    /// `?`-friendly error paths live in `serve_inner`.
    pub async fn serve(
        self: Arc<Self>,
        req: Request<Body>,
    ) -> Result<Response<Body>, std::convert::Infallible> {
        let p = Path::decode(req.uri().path());
        debug!("request on {}: {:?}", req.uri(), p);
        match p {
            Path::NotFound => return Ok(not_found("path not understood").0),
            Path::Webhook => {
                return Ok(self.webhook(req).await.unwrap_or_else(|e| e.0));
            }
            _ => {}
        }
        let caller = match self.authenticate(&req) {
            Ok(c) => c,
            Err(e) => {
                warn!("authentication failed: {e}");
                return Ok(from_base_error(e));
            }
        };
        Ok(self
            .serve_inner(req, p, caller)
            .await
            .unwrap_or_else(|e| e.0))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::flow::{FrameJob, FrameJobInput, FrameJobOutput};
    use async_trait::async_trait;
    use base::clock::RealClocks;
    use db::object::{FsObjectStore, ObjectKey, ObjectStore, UploadBody};
    use db::registry::{DatabaseName, VideoChange};
    use futures::{FutureExt as _, SinkExt as _, StreamExt as _};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite;

    /// Stands in for the GPU pipeline: writes a tiny chunk tree after an
    /// optional delay.
    struct TestFrameJob {
        delay: Duration,
    }

    #[async_trait]
    impl FrameJob for TestFrameJob {
        async fn run(&self, input: &FrameJobInput) -> Result<FrameJobOutput, Error> {
            tokio::time::sleep(self.delay).await;
            let mut chunks = Vec::new();
            for &modulo in &[32u32, 1] {
                let dir = input.out_dir.join(format!("modulo_{modulo}"));
                std::fs::create_dir_all(&dir)?;
                for i in 0..2u32 {
                    let path = dir.join(format!("chunk_{i:04}.webm"));
                    std::fs::write(&path, b"webm")?;
                    chunks.push(crate::flow::ChunkFile {
                        modulo,
                        index: i,
                        path,
                    });
                }
            }
            Ok(FrameJobOutput {
                chunks,
                total_frames: 64,
            })
        }
    }

    pub(crate) struct Server {
        pub base_url: String,
        pub alice_token: String,
        pub bob_token: String,
        handle: Option<std::thread::JoinHandle<()>>,
        shutdown_tx: Option<futures::channel::oneshot::Sender<()>>,
        _flow_shutdown_tx: base::shutdown::Sender,
        _tmpdir: tempfile::TempDir,
    }

    pub(crate) const WEBHOOK_SECRET: &str = "hook-secret";

    impl Server {
        pub(crate) fn new() -> Server {
            db::testutil::init();
            let tmpdir = tempfile::Builder::new()
                .prefix("capsync-web-test")
                .tempdir()
                .unwrap();
            let clocks = RealClocks {};
            let mut conn = rusqlite::Connection::open_in_memory().unwrap();
            db::init(&mut conn).unwrap();
            let registry = Arc::new(Registry::new(clocks, conn).unwrap());
            let store: Arc<dyn ObjectStore> =
                Arc::new(FsObjectStore::new(tmpdir.path().join("store")).unwrap());
            let copies = Arc::new(
                WorkingCopies::new(tmpdir.path().join("working"), registry.clone(), store.clone())
                    .unwrap(),
            );
            let sessions = SessionMap::new();
            let locks = Arc::new(LockManager::new(
                registry.clone(),
                copies.clone(),
                sessions.clone(),
            ));
            let (flow_shutdown_tx, flow_shutdown_rx) = base::shutdown::channel();
            let publisher = FramesetPublisher::new(
                registry.clone(),
                copies.clone(),
                store.clone(),
                locks.clone(),
                Arc::new(TestFrameJob {
                    delay: Duration::from_millis(200),
                }),
                tmpdir.path().join("staging"),
                flow_shutdown_rx,
            );

            let (alice_token, bob_token);
            {
                let mut l = registry.lock();
                l.upsert_video(VideoChange {
                    id: "v1".to_owned(),
                    tenant_id: "t1".to_owned(),
                    title: Some("episode 1".to_owned()),
                    storage_key: "t1/client/videos/v1/video.mp4".to_owned(),
                })
                .unwrap();
                alice_token = db::auth::generate_token();
                l.add_access_token(
                    &alice_token,
                    &Identity {
                        user_id: "alice".to_owned(),
                        tenant_id: "t1".to_owned(),
                    },
                )
                .unwrap();
                bob_token = db::auth::generate_token();
                l.add_access_token(
                    &bob_token,
                    &Identity {
                        user_id: "bob".to_owned(),
                        tenant_id: "t1".to_owned(),
                    },
                )
                .unwrap();
            }

            // Blobs the frameset flow stages. The layout blob is produced by
            // persisting an empty working copy so bind-time downloads see a
            // valid gzip.
            futures::executor::block_on(async {
                store
                    .upload(
                        &ObjectKey::video_media("t1", "v1"),
                        UploadBody::Bytes(b"mp4".to_vec()),
                        "video/mp4",
                    )
                    .await
                    .unwrap();
                let _ = copies
                    .open_for_repo("t1", "v1", DatabaseName::Layout)
                    .await
                    .unwrap();
                copies
                    .upload_to_store("t1", "v1", DatabaseName::Layout)
                    .await
                    .unwrap();
                copies
                    .remove_working_copy("t1", "v1", DatabaseName::Layout)
                    .await
                    .unwrap();
            });

            let service = Arc::new(Service::new(Config {
                registry,
                copies,
                sessions,
                locks,
                publisher,
                ingest: None,
                webhook_secret: Some(WEBHOOK_SECRET.to_owned()),
            }));
            let make_svc = hyper::service::make_service_fn(move |_conn| {
                futures::future::ok::<_, std::convert::Infallible>(hyper::service::service_fn({
                    let s = Arc::clone(&service);
                    move |req| Arc::clone(&s).serve(req)
                }))
            });
            let (shutdown_tx, shutdown_rx) = futures::channel::oneshot::channel::<()>();
            let (tx, rx) = std::sync::mpsc::channel();
            let handle = std::thread::spawn(move || {
                let addr = ([127, 0, 0, 1], 0).into();
                let rt = tokio::runtime::Runtime::new().unwrap();
                let srv = {
                    let _guard = rt.enter();
                    hyper::server::Server::bind(&addr)
                        .tcp_nodelay(true)
                        .serve(make_svc)
                };
                let addr = srv.local_addr(); // resolve port 0 to a real port.
                tx.send(addr).unwrap();
                rt.block_on(srv.with_graceful_shutdown(shutdown_rx.map(|_| ())))
                    .unwrap();
            });
            let addr = rx.recv().unwrap();
            Server {
                base_url: format!("http://{}:{}", addr.ip(), addr.port()),
                alice_token,
                bob_token,
                handle: Some(handle),
                shutdown_tx: Some(shutdown_tx),
                _flow_shutdown_tx: flow_shutdown_tx,
                _tmpdir: tmpdir,
            }
        }

        fn ws_url(&self, websocket_url: &str, token: &str) -> String {
            format!(
                "{}{}&token={}",
                self.base_url.replace("http://", "ws://"),
                websocket_url,
                token
            )
        }
    }

    impl Drop for Server {
        fn drop(&mut self) {
            let _ = self.shutdown_tx.take().unwrap().send(());
            self.handle.take().unwrap().join().unwrap()
        }
    }

    // Layout deltas address a client-defined table; the server logs them
    // without materializing.
    fn delta_json(pk: i64, cid: &str, value: serde_json::Value, version: i64) -> serde_json::Value {
        serde_json::json!({
            "table": "layout_regions",
            "primary_key": pk,
            "column_id": cid,
            "value": value,
            "column_version": version,
            "db_version": version,
            "site_id": "browser-1",
            "causal_length": 1,
            "sequence": 1,
        })
    }

    type ClientWs =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn ws_recv_json(ws: &mut ClientWs) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            match msg {
                tungstenite::Message::Text(t) => return serde_json::from_str(&t).unwrap(),
                tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    async fn acquire_lock(
        s: &Server,
        token: &str,
        db: &str,
    ) -> (reqwest::StatusCode, serde_json::Value) {
        let cli = reqwest::Client::new();
        let resp = cli
            .post(format!("{}/videos/v1/database/{db}/lock", s.base_url))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    #[tokio::test]
    async fn unauthenticated_request_rejected() {
        let s = Server::new();
        let cli = reqwest::Client::new();
        let resp = cli
            .get(format!("{}/videos/v1", s.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
        let resp = cli
            .get(format!("{}/videos/v1", s.base_url))
            .bearer_auth("garbage")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn happy_path_edit() {
        let s = Server::new();
        let (status, lock) = acquire_lock(&s, &s.alice_token, "layout").await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(lock["granted"], true);
        assert_eq!(lock["needsDownload"], true);
        let ws_url = s.ws_url(lock["websocketUrl"].as_str().unwrap(), &s.alice_token);

        let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
        ws.send(tungstenite::Message::Text(
            serde_json::json!({"type": "ping"}).to_string(),
        ))
        .await
        .unwrap();
        assert_eq!(ws_recv_json(&mut ws).await["type"], "pong");

        ws.send(tungstenite::Message::Text(
            serde_json::json!({
                "type": "sync",
                "changes": [delta_json(1, "start_frame_index", 10.into(), 1)],
            })
            .to_string(),
        ))
        .await
        .unwrap();
        let ack = ws_recv_json(&mut ws).await;
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["server_version"], 1);
        assert_eq!(ack["applied_count"], 1);

        let cli = reqwest::Client::new();
        let state: serde_json::Value = cli
            .get(format!("{}/videos/v1/database/layout/state", s.base_url))
            .bearer_auth(&s.alice_token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(state["serverVersion"], 1);
        assert_eq!(state["lockType"], "client");
        assert_eq!(state["lockHolderIsYou"], true);

        // Disconnecting releases the lock.
        ws.close(None).await.unwrap();
        drop(ws);
        for _ in 0..50 {
            let state: serde_json::Value = cli
                .get(format!("{}/videos/v1/database/layout/state", s.base_url))
                .bearer_auth(&s.alice_token)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if state["lockType"] == "none" {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("lock never released after disconnect");
    }

    #[tokio::test]
    async fn same_user_handoff() {
        let s = Server::new();
        let (_, lock1) = acquire_lock(&s, &s.alice_token, "layout").await;
        assert_eq!(lock1["granted"], true);
        let ws_url1 = s.ws_url(lock1["websocketUrl"].as_str().unwrap(), &s.alice_token);
        let (mut ws1, _) = tokio_tungstenite::connect_async(&ws_url1).await.unwrap();
        ws1.send(tungstenite::Message::Text(
            serde_json::json!({"type": "ping"}).to_string(),
        ))
        .await
        .unwrap();
        assert_eq!(ws_recv_json(&mut ws1).await["type"], "pong");

        // Second tab: same user, fresh connection.
        let (_, lock2) = acquire_lock(&s, &s.alice_token, "layout").await;
        assert_eq!(lock2["granted"], true);
        assert_ne!(lock1["websocketUrl"], lock2["websocketUrl"]);

        // Tab 1 is told it has been superseded.
        assert_eq!(ws_recv_json(&mut ws1).await["type"], "session_transferred");

        // Tab 2 can sync.
        let ws_url2 = s.ws_url(lock2["websocketUrl"].as_str().unwrap(), &s.alice_token);
        let (mut ws2, _) = tokio_tungstenite::connect_async(&ws_url2).await.unwrap();
        ws2.send(tungstenite::Message::Text(
            serde_json::json!({
                "type": "sync",
                "changes": [delta_json(1, "end_frame_index", 20.into(), 1)],
            })
            .to_string(),
        ))
        .await
        .unwrap();
        assert_eq!(ws_recv_json(&mut ws2).await["type"], "ack");
    }

    #[tokio::test]
    async fn cross_user_contention() {
        let s = Server::new();
        let (_, lock) = acquire_lock(&s, &s.alice_token, "layout").await;
        assert_eq!(lock["granted"], true);
        let alice_ws_url = lock["websocketUrl"].as_str().unwrap().to_owned();

        let (_, denied) = acquire_lock(&s, &s.bob_token, "layout").await;
        assert_eq!(denied["granted"], false);
        assert_eq!(denied["lockHolderUserId"], "alice");

        // Bob can't bind to alice's connection either.
        let ws_url = s.ws_url(&alice_ws_url, &s.bob_token);
        let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
        let err = ws_recv_json(&mut ws).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn workflow_seizure() {
        let s = Server::new();
        let (_, lock) = acquire_lock(&s, &s.alice_token, "layout").await;
        assert_eq!(lock["granted"], true);
        let ws_url = s.ws_url(lock["websocketUrl"].as_str().unwrap(), &s.alice_token);
        let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();

        // A ping round-trip guarantees the session is registered before the
        // workflow seizes the lock.
        ws.send(tungstenite::Message::Text(
            serde_json::json!({"type": "ping"}).to_string(),
        ))
        .await
        .unwrap();
        assert_eq!(ws_recv_json(&mut ws).await["type"], "pong");

        // Alice approves the layout; her own editing session is displaced.
        let cli = reqwest::Client::new();
        let resp = cli
            .post(format!("{}/videos/v1/actions/approve-layout", s.base_url))
            .bearer_auth(&s.alice_token)
            .json(&serde_json::json!({
                "type": "crop-and-infer-caption-frame-extents",
                "crop_region": {"left": 0, "top": 600, "right": 1920, "bottom": 1080},
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let job: serde_json::Value = resp.json().await.unwrap();
        assert!(job["jobId"].is_string());

        let changed = ws_recv_json(&mut ws).await;
        assert_eq!(changed["type"], "lock_changed");
        assert_eq!(changed["lock_type"], "server");

        // Further syncs are rejected while the workflow runs.
        ws.send(tungstenite::Message::Text(
            serde_json::json!({
                "type": "sync",
                "changes": [delta_json(1, "text", "x".into(), 1)],
            })
            .to_string(),
        ))
        .await
        .unwrap();
        let err = ws_recv_json(&mut ws).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "WORKFLOW_LOCKED");

        // The flow eventually publishes v1 and releases the lock.
        for _ in 0..100 {
            let video: serde_json::Value = cli
                .get(format!("{}/videos/v1", s.base_url))
                .bearer_auth(&s.alice_token)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if video["currentFramesetVersion"] == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("frameset version never activated");
    }

    #[tokio::test]
    async fn caption_crud_with_overlap_resolution() {
        let s = Server::new();
        let cli = reqwest::Client::new();
        let (_, lock) = acquire_lock(&s, &s.alice_token, "captions").await;
        assert_eq!(lock["granted"], true);

        // Captions [0,100], [101,200], [201,300], [301,400].
        let mut ids = Vec::new();
        for (start, end) in [(0, 100), (101, 200), (201, 300), (301, 400)] {
            let resp = cli
                .post(format!("{}/videos/v1/captions", s.base_url))
                .bearer_auth(&s.alice_token)
                .json(&serde_json::json!({
                    "startFrameIndex": start,
                    "endFrameIndex": end,
                    "captionFrameExtentsState": "confirmed",
                }))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
            let body: serde_json::Value = resp.json().await.unwrap();
            ids.push(body["caption"]["id"].as_i64().unwrap());
        }

        // Growing the first caption to [50,350].
        let resp: serde_json::Value = cli
            .put(format!("{}/videos/v1/captions/{}", s.base_url, ids[0]))
            .bearer_auth(&s.alice_token)
            .json(&serde_json::json!({
                "startFrameIndex": 50,
                "endFrameIndex": 350,
                "captionFrameExtentsState": "confirmed",
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["caption"]["startFrameIndex"], 50);
        assert_eq!(resp["caption"]["endFrameIndex"], 350);
        let deleted: Vec<i64> = resp["deletedCaptions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        assert_eq!(deleted.len(), 2);
        assert!(deleted.contains(&ids[1]) && deleted.contains(&ids[2]));
        assert_eq!(resp["modifiedCaptions"][0]["startFrameIndex"], 351);
        assert_eq!(resp["createdGaps"][0]["startFrameIndex"], 0);
        assert_eq!(resp["createdGaps"][0]["endFrameIndex"], 49);

        // Text update.
        let resp: serde_json::Value = cli
            .put(format!("{}/videos/v1/captions/{}/text", s.base_url, ids[0]))
            .bearer_auth(&s.alice_token)
            .json(&serde_json::json!({"text": "hello", "textStatus": "final"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["caption"]["text"], "hello");

        // Workable list: the gap plus the trimmed pending caption.
        let resp: serde_json::Value = cli
            .get(format!(
                "{}/videos/v1/captions?workable=true",
                s.base_url
            ))
            .bearer_auth(&s.alice_token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["captions"].as_array().unwrap().len(), 2);

        // Batch failure reports the failing index and rolls back.
        let resp: serde_json::Value = cli
            .post(format!("{}/videos/v1/captions/batch", s.base_url))
            .bearer_auth(&s.alice_token)
            .json(&serde_json::json!({
                "operations": [
                    {"op": "delete", "id": ids[0]},
                    {"op": "update", "id": 99999, "data": {"text": "x"}},
                ],
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["success"], false);
        assert_eq!(resp["error"]["index"], 1);
        assert_eq!(resp["error"]["op"], "update");
        assert_eq!(resp["error"]["message"], "Caption 99999 not found");
        let resp = cli
            .get(format!("{}/videos/v1/captions/{}", s.base_url, ids[0]))
            .bearer_auth(&s.alice_token)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn caption_write_requires_lock() {
        let s = Server::new();
        let cli = reqwest::Client::new();
        let resp = cli
            .post(format!("{}/videos/v1/captions", s.base_url))
            .bearer_auth(&s.alice_token)
            .json(&serde_json::json!({
                "startFrameIndex": 0,
                "endFrameIndex": 10,
                "captionFrameExtentsState": "confirmed",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook() {
        let s = Server::new();
        let cli = reqwest::Client::new();
        let url = format!("{}/webhooks/object-store/videos", s.base_url);

        // Bad auth.
        let resp = cli
            .post(&url)
            .bearer_auth("wrong")
            .json(&serde_json::json!({"type": "INSERT", "table": "videos"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

        // Wrong table.
        let resp = cli
            .post(&url)
            .bearer_auth(WEBHOOK_SECRET)
            .json(&serde_json::json!({"type": "INSERT", "table": "captions", "record": {}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        // Updates are ignored.
        let resp = cli
            .post(&url)
            .bearer_auth(WEBHOOK_SECRET)
            .json(&serde_json::json!({"type": "UPDATE", "table": "videos", "record": {"id": "v1"}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ignored");

        // Missing record fields.
        let resp = cli
            .post(&url)
            .bearer_auth(WEBHOOK_SECRET)
            .json(&serde_json::json!({"type": "INSERT", "table": "videos", "record": {}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        // A valid insert registers the video.
        let resp = cli
            .post(&url)
            .bearer_auth(WEBHOOK_SECRET)
            .json(&serde_json::json!({
                "type": "INSERT",
                "table": "videos",
                "record": {"id": "v2", "tenant_id": "t1", "title": "episode 2"},
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "accepted");

        let video: serde_json::Value = cli
            .get(format!("{}/videos/v2", s.base_url))
            .bearer_auth(&s.alice_token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(video["status"], "pending");
    }
}
