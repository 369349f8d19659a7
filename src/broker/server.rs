use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::{BrokerError, RingBroker};

const READ_CHUNK: usize = 64 * 1024;

/**
    HTTP endpoint exposing a [`RingBroker`] at `/stream<extension>`.

    Serves HEAD and GET with the transcoded content type plus any
    renderer-specific extra headers. At most one GET consumer is active at a
    time; a concurrent second GET gets 503. A reader that falls behind the
    ring is skipped forward to the oldest readable offset and keeps the
    connection, at the cost of a visible discontinuity.
*/
pub struct StreamServer {
    url: Url,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    err_rx: mpsc::Receiver<std::io::Error>,
}

struct ServerState {
    broker: Arc<RingBroker>,
    content_type: String,
    extra_headers: Vec<(HeaderName, HeaderValue)>,
    active: AtomicBool,
    cancel: CancellationToken,
}

impl StreamServer {
    /**
        Bind `local_ip` on an ephemeral port and start serving the broker.
        The server runs until [`StreamServer::stop`] or `cancel`.
    */
    pub async fn start(
        local_ip: IpAddr,
        broker: Arc<RingBroker>,
        content_type: &str,
        extension: &str,
        extra_headers: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::new(local_ip, 0))
            .await
            .with_context(|| format!("binding stream server on {local_ip}"))?;
        let addr = listener.local_addr().context("reading listener address")?;

        let mut headers = Vec::with_capacity(extra_headers.len());
        for (name, value) in extra_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid stream header name {name:?}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid stream header value for {name:?}"))?;
            headers.push((name, value));
        }

        let shutdown = cancel.child_token();
        let state = Arc::new(ServerState {
            broker,
            content_type: content_type.to_string(),
            extra_headers: headers,
            active: AtomicBool::new(false),
            cancel: shutdown.clone(),
        });

        let path = format!("/stream{extension}");
        let router = stream_router(state, &path);

        let url = Url::parse(&format!("http://{addr}{path}")).context("building stream URL")?;

        let (err_tx, err_rx) = mpsc::channel(1);
        let serve_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
                .await;
            if let Err(err) = result {
                let _ = err_tx.send(err).await;
            }
        });

        debug!(url = %url, "stream server listening");

        Ok(Self {
            url,
            shutdown,
            task,
            err_rx,
        })
    }

    /// The full URL renderers should fetch.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Resolves once if the listener fails; never resolves on a clean run.
    pub async fn listen_error(&mut self) -> std::io::Error {
        match self.err_rx.recv().await {
            Some(err) => err,
            None => std::future::pending().await,
        }
    }

    /// Shut the server down and wait for it to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

fn stream_router(state: Arc<ServerState>, path: &str) -> Router {
    Router::new()
        .route(path, get(handle_stream))
        .with_state(state)
}

async fn handle_stream(State(state): State<Arc<ServerState>>, method: Method) -> Response {
    if method == Method::HEAD {
        return response_headers(&state, Body::empty());
    }

    // Single active reader: renderers reconnect rather than multiplex, and
    // the ring only has one sensible live position.
    if state
        .active
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let guard = ReaderGuard(Arc::clone(&state));
    let body = Body::from_stream(read_stream(Arc::clone(&state), guard));
    response_headers(&state, body)
}

fn response_headers(state: &ServerState, body: Body) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&state.content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    for (name, value) in &state.extra_headers {
        headers.insert(name.clone(), value.clone());
    }
    response
}

/// Clears the single-reader claim when the response body is dropped.
struct ReaderGuard(Arc<ServerState>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.active.store(false, Ordering::Release);
    }
}

fn read_stream(
    state: Arc<ServerState>,
    guard: ReaderGuard,
) -> impl futures::Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static {
    struct ReadState {
        state: Arc<ServerState>,
        offset: u64,
        _guard: ReaderGuard,
    }

    futures::stream::unfold(
        ReadState {
            state,
            offset: 0,
            _guard: guard,
        },
        |mut st| async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let read = st
                    .state
                    .broker
                    .read_at(&st.state.cancel, &mut buf, st.offset)
                    .await;

                match read {
                    Ok(0) => return None,
                    Ok(n) => {
                        st.offset += n as u64;
                        buf.truncate(n);
                        return Some((Ok(buf), st));
                    }
                    Err(BrokerError::Overwritten) => {
                        let oldest = st.state.broker.oldest_offset();
                        warn!(
                            from = st.offset,
                            to = oldest,
                            "stream reader fell behind, skipping ahead"
                        );
                        st.offset = oldest;
                    }
                    Err(BrokerError::Source(message)) => {
                        return Some((Err(std::io::Error::other(message)), st));
                    }
                    Err(BrokerError::Cancelled) => return None,
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    fn test_state(broker: Arc<RingBroker>) -> Arc<ServerState> {
        Arc::new(ServerState {
            broker,
            content_type: "video/mp2t".to_string(),
            extra_headers: vec![(
                HeaderName::from_static("transfermode.dlna.org"),
                HeaderValue::from_static("Streaming"),
            )],
            active: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn get_streams_broker_contents() {
        let broker = Arc::new(RingBroker::new(1024));
        broker.write(b"segment-data");
        broker.close(None);

        let router = stream_router(test_state(broker), "/stream.ts");
        let response = router
            .oneshot(Request::get("/stream.ts").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "video/mp2t"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"segment-data");
    }

    #[tokio::test]
    async fn head_returns_headers_only() {
        let broker = Arc::new(RingBroker::new(1024));
        let router = stream_router(test_state(broker), "/stream.ts");

        let response = router
            .oneshot(
                Request::head("/stream.ts")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("transfermode.dlna.org").unwrap(),
            "Streaming"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn second_concurrent_get_is_rejected() {
        let broker = Arc::new(RingBroker::new(1024));
        broker.write(b"x");

        let router = stream_router(test_state(broker), "/stream.ts");

        // First reader holds the claim while its body is alive.
        let first = router
            .clone()
            .oneshot(Request::get("/stream.ts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = router
            .clone()
            .oneshot(Request::get("/stream.ts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Dropping the first body releases the claim.
        drop(first);
        let third = router
            .oneshot(Request::get("/stream.ts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(third.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn overwritten_reader_skips_ahead() {
        let broker = Arc::new(RingBroker::new(4));
        broker.write(b"abcd");
        broker.write(b"efgh"); // offset 0 is gone
        broker.close(None);

        let router = stream_router(test_state(broker), "/stream.ts");
        let response = router
            .oneshot(Request::get("/stream.ts").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"efgh");
    }
}
