//! HTTP zone update listener.
//!
//! The reactor owns the listening socket and waits on [`HttpProbe::accept`].
//! Each accepted connection is served with [`serve_one`]: exactly one request,
//! keep-alive off, abandoned after [`REQUEST_TIMEOUT`].
//!
//! Routing:
//!
//! ```text
//! GET /<any path>?device=<id>&zone=<zone>&update=<token>   zone update
//! GET /<any path>?<anything else>                          generic request
//! HEAD /<any path>                                         200, no callback
//! <other method>                                           405
//! ```
//!
//! A zone update needs all three parameters exactly once, a device registered
//! under the configured key attribute and a recognized update token.
//! Otherwise the request is generic.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use crate::config::{HttpSettings, KnownDevices};
use crate::device::Device;
use crate::handler::{Dispatcher, HttpRequest, Reply, ZoneUpdate};
use crate::registry::Registry;

const TARGET: &str = "presence::http";

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Longest time one connection may take.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP probe errors.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The listening socket could not be bound.
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// OS error.
        #[source]
        source: std::io::Error,
    },

    /// Accepting a connection failed.
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// The connection broke while being served.
    #[error("connection failed: {0}")]
    Serve(#[from] hyper::Error),

    /// The client took longer than the request timeout.
    #[error("request timed out after {} seconds", REQUEST_TIMEOUT.as_secs())]
    Timeout,
}

/// Map an `update` token to the enter flag.
///
/// Returns `None` for unknown tokens; the request is then handled as generic.
pub fn parse_update_token(token: &str) -> Option<bool> {
    match token {
        "1" | "enter" | "entered" | "in" | "checkin" => Some(true),
        "0" | "exit" | "leave" | "left" | "out" | "checkout" => Some(false),
        _ => None,
    }
}

/// Identity of a device reachable through zone updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneIdentity {
    /// Display name, falling back to the device key.
    pub display: String,
    /// Value of the lookup attribute.
    pub lookup: String,
    /// Last reported zone.
    pub zone: Option<String>,
    /// Last reported enter flag.
    pub entered: Option<bool>,
}

/// State shared by the request handlers.
#[derive(Clone)]
pub struct HttpState {
    inner: Arc<HttpStateInner>,
}

struct HttpStateInner {
    devices: RwLock<Registry<ZoneIdentity>>,
    dispatcher: Dispatcher,
}

impl HttpState {
    /// Register the devices that carry the `key` attribute.
    ///
    /// Devices named in `settings.devices` are used, or every table entry
    /// when that list is empty.
    pub fn new(settings: &HttpSettings, table: &KnownDevices, dispatcher: Dispatcher) -> Self {
        let mut devices = Registry::new();
        for device in table.iter() {
            if !settings.devices.is_empty() && !settings.devices.contains(&device.key) {
                continue;
            }
            let Some(lookup) = device.attribute(&settings.key) else {
                continue;
            };
            tracing::info!(
                target: TARGET,
                device = %device.key,
                key = %settings.key,
                value = lookup,
                "registered for zone updates"
            );
            let identity = ZoneIdentity {
                display: device.display_name().to_string(),
                lookup: lookup.to_string(),
                zone: device.zone.clone(),
                entered: None,
            };
            devices.insert(lookup, Device::new(device.key.clone(), identity));
        }

        Self {
            inner: Arc::new(HttpStateInner {
                devices: RwLock::new(devices),
                dispatcher,
            }),
        }
    }

    /// Get read access to the zone registry.
    pub async fn devices(&self) -> tokio::sync::RwLockReadGuard<'_, Registry<ZoneIdentity>> {
        self.inner.devices.read().await
    }

    async fn apply_zone_update(&self, lookup: &str, zone: &str, entered: bool) -> Option<ZoneUpdate> {
        let mut devices = self.inner.devices.write().await;
        let device = devices.get_mut(lookup)?;
        device.touch(Utc::now());
        let identity = device.identity_mut();
        identity.zone = Some(zone.to_string());
        identity.entered = Some(entered);
        Some(ZoneUpdate {
            key: device.key().to_string(),
            display: device.identity().display.clone(),
            serial: lookup.to_string(),
            zone: zone.to_string(),
            entered,
        })
    }
}

/// Build the request router.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(handle))
        .route("/{*path}", get(handle))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle(
    State(state): State<HttpState>,
    method: Method,
    uri: Uri,
    Query(pairs): Query<Vec<(String, String)>>,
) -> impl IntoResponse {
    // `get` also routes HEAD; it is answered without touching any device.
    if method == Method::HEAD {
        return (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_PLAIN)], String::new());
    }

    let mut query: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in pairs {
        query.entry(key).or_default().push(value);
    }

    let update = match zone_parameters(&query) {
        Some((device, zone, entered)) => state.apply_zone_update(device, zone, entered).await,
        None => None,
    };
    let reply = match update {
        Some(update) => state.inner.dispatcher.zone_update(&update),
        None => generic(&state, uri.path(), query),
    };

    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, TEXT_PLAIN)],
        format!("{}\n", reply.body),
    )
}

fn generic(state: &HttpState, path: &str, query: BTreeMap<String, Vec<String>>) -> Reply {
    let request = HttpRequest {
        path: path.to_string(),
        query,
    };
    state.inner.dispatcher.http_request(&request)
}

fn single<'a>(query: &'a BTreeMap<String, Vec<String>>, key: &str) -> Option<&'a str> {
    match query.get(key).map(Vec::as_slice) {
        Some([value]) => Some(value.as_str()),
        _ => None,
    }
}

fn zone_parameters(query: &BTreeMap<String, Vec<String>>) -> Option<(&str, &str, bool)> {
    let device = single(query, "device")?;
    let zone = single(query, "zone")?;
    let entered = parse_update_token(single(query, "update")?)?;
    Some((device, zone, entered))
}

/// The HTTP probe: a listening socket plus its router.
pub struct HttpProbe {
    listener: TcpListener,
    router: Router,
    state: HttpState,
}

impl std::fmt::Debug for HttpProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProbe")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish_non_exhaustive()
    }
}

impl HttpProbe {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Bind`] if the address is unavailable.
    pub async fn bind(
        settings: &HttpSettings,
        table: &KnownDevices,
        dispatcher: Dispatcher,
    ) -> Result<Self, HttpError> {
        let addr = format!("{}:{}", settings.host, settings.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| HttpError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let state = HttpState::new(settings, table, dispatcher);
        tracing::info!(target: TARGET, %addr, "listening for zone updates");

        Ok(Self {
            listener,
            router: router(state.clone()),
            state,
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the socket has no local address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared handler state.
    pub const fn state(&self) -> &HttpState {
        &self.state
    }

    /// Wait for the next connection.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Accept`] if the accept call fails.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), HttpError> {
        self.listener.accept().await.map_err(HttpError::Accept)
    }

    /// Serve one accepted connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or times out.
    pub async fn serve(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), HttpError> {
        tracing::debug!(target: TARGET, %peer, "request");
        serve_one(self.router.clone(), stream).await
    }
}

/// Serve exactly one request on `stream`, then close it.
///
/// # Errors
///
/// Returns [`HttpError::Timeout`] after [`REQUEST_TIMEOUT`], or the protocol
/// error from the connection.
pub async fn serve_one(router: Router, stream: TcpStream) -> Result<(), HttpError> {
    let connection = http1::Builder::new()
        .keep_alive(false)
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(router));
    tokio::time::timeout(REQUEST_TIMEOUT, connection)
        .await
        .map_err(|_| HttpError::Timeout)?
        .map_err(HttpError::Serve)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    use super::*;
    use crate::handler::testing::{Recorded, RecordingHandler};

    const TABLE: &str = r#"
        [nexus]
        display = "Google Nexus 10"
        serial = "R32D102JR6N"

        [htc]
        display = "HTC One M7"
        serial = "SH42NW901328"
    "#;

    fn setup() -> (Arc<RecordingHandler>, HttpState) {
        let handler = Arc::new(RecordingHandler::new());
        let settings = HttpSettings {
            devices: vec!["nexus".into()],
            ..HttpSettings::default()
        };
        let table = KnownDevices::from_toml(TABLE).unwrap();
        let state = HttpState::new(&settings, &table, Dispatcher::new(handler.clone()));
        (handler, state)
    }

    async fn get_request(state: &HttpState, uri: &str) -> (StatusCode, String) {
        let response = router(state.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_update_tokens() {
        for token in ["enter", "entered", "in", "checkin", "1"] {
            assert_eq!(parse_update_token(token), Some(true), "{token}");
        }
        for token in ["exit", "leave", "left", "out", "checkout", "0"] {
            assert_eq!(parse_update_token(token), Some(false), "{token}");
        }
        for token in ["", "ENTER", "2", "arrive"] {
            assert_eq!(parse_update_token(token), None, "{token}");
        }
    }

    #[tokio::test]
    async fn test_zone_update_updates_device_and_fires_callback() {
        let (handler, state) = setup();

        let (status, body) =
            get_request(&state, "/?device=R32D102JR6N&zone=office&update=checkin").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "nexus office\n");
        assert_eq!(
            handler.events(),
            vec![Recorded::Zone {
                key: "nexus".into(),
                zone: "office".into(),
                entered: true,
            }]
        );
        let devices = state.devices().await;
        let device = devices.get("R32D102JR6N").unwrap();
        assert_eq!(device.identity().zone.as_deref(), Some("office"));
        assert_eq!(device.identity().entered, Some(true));
    }

    #[tokio::test]
    async fn test_unknown_token_falls_through_to_generic() {
        let (handler, state) = setup();

        let (status, body) =
            get_request(&state, "/zones?device=R32D102JR6N&zone=office&update=maybe").await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, "Path: /zones\n");
        assert_eq!(handler.events(), vec![Recorded::Http("/zones".into())]);
        let devices = state.devices().await;
        assert_eq!(devices.get("R32D102JR6N").unwrap().identity().zone, None);
    }

    #[tokio::test]
    async fn test_unregistered_or_repeated_parameters_are_generic() {
        let (handler, state) = setup();

        // htc is in the table but not in http.devices.
        get_request(&state, "/?device=SH42NW901328&zone=home&update=in").await;
        get_request(&state, "/?device=R32D102JR6N&zone=a&zone=b&update=in").await;

        assert_eq!(handler.count(|e| matches!(e, Recorded::Http(_))), 2);
        assert_eq!(handler.count(|e| matches!(e, Recorded::Zone { .. })), 0);
    }

    #[tokio::test]
    async fn test_only_get_is_routed() {
        let (handler, state) = setup();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(handler.events().is_empty());
    }

    #[tokio::test]
    async fn test_head_fires_no_callback() {
        let (handler, state) = setup();
        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .method(Method::HEAD)
                    .uri("/?device=R32D102JR6N&zone=office&update=in")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(handler.events().is_empty());
        let devices = state.devices().await;
        assert_eq!(devices.get("R32D102JR6N").unwrap().identity().zone, None);
    }

    #[tokio::test]
    async fn test_failing_handler_answers_500() {
        let handler = Arc::new(RecordingHandler::failing());
        let state = HttpState::new(
            &HttpSettings::default(),
            &KnownDevices::default(),
            Dispatcher::new(handler),
        );
        let (status, _) = get_request(&state, "/status").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_serve_one_answers_single_request() {
        let (handler, _) = setup();
        let settings = HttpSettings {
            host: "127.0.0.1".into(),
            port: 0,
            ..HttpSettings::default()
        };
        // Port 0 is only valid here; validation rejects it in configuration.
        let probe = HttpProbe::bind(&settings, &KnownDevices::default(), Dispatcher::new(handler.clone()))
            .await
            .unwrap();
        let addr = probe.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /lights?on=1 HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            response
        });

        let (stream, peer) = probe.accept().await.unwrap();
        probe.serve(stream, peer).await.unwrap();

        let response = client.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 202"));
        assert!(response.contains("text/plain"));
        assert!(response.ends_with("Path: /lights\n"));
        assert_eq!(handler.events(), vec![Recorded::Http("/lights".into())]);
    }
}
