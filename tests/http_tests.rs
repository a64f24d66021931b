//! HTTP transport against a local fake remote-write receiver.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use remote_queue::config::{BasicAuth, Config, EndpointConfig, SerializationConfig};
use remote_queue::delivery::{HttpTransport, Transport, TransportError, WriteRequest};
use remote_queue::{Appendable, Engine, Sample, SeriesLabels};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone)]
struct Received {
    content_type: Option<String>,
    user_agent: Option<String>,
    authorization: Option<String>,
    body: Vec<u8>,
}

struct Receiver {
    replies: Mutex<VecDeque<(StatusCode, Option<&'static str>)>>,
    received: Mutex<Vec<Received>>,
}

impl Receiver {
    fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

async fn push(State(receiver): State<Arc<Receiver>>, headers: HeaderMap, body: Bytes) -> Response {
    let get = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    receiver.received.lock().unwrap().push(Received {
        content_type: get(header::CONTENT_TYPE),
        user_agent: get(header::USER_AGENT),
        authorization: get(header::AUTHORIZATION),
        body: body.to_vec(),
    });

    let reply = receiver.replies.lock().unwrap().pop_front();
    match reply {
        Some((status, Some(retry_after))) => {
            (status, [(header::RETRY_AFTER, retry_after)]).into_response()
        }
        Some((status, None)) => status.into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn serve(replies: Vec<(StatusCode, Option<&'static str>)>) -> (SocketAddr, Arc<Receiver>) {
    let receiver = Arc::new(Receiver {
        replies: Mutex::new(replies.into()),
        received: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/api/v1/push", post(push))
        .with_state(receiver.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, receiver)
}

fn endpoint(addr: SocketAddr) -> EndpointConfig {
    let mut endpoint = EndpointConfig::new("primary", format!("http://{}/api/v1/push", addr));
    endpoint.queue_count = 1;
    endpoint.write_timeout = Duration::from_secs(5);
    endpoint
}

fn request() -> WriteRequest {
    WriteRequest {
        body: br#"{"timeseries":[]}"#.to_vec(),
        content_type: "application/json".to_string(),
        samples: 0,
    }
}

#[tokio::test]
async fn test_sends_headers_and_basic_auth() {
    let (addr, receiver) = serve(vec![]).await;
    let mut config = endpoint(addr);
    config.user_agent = "agent/1.0".to_string();
    config.basic_auth = Some(BasicAuth {
        username: "user".to_string(),
        password: "pass".into(),
    });

    let transport = HttpTransport::new(&config).unwrap();
    let response = transport.send(&request()).await.unwrap();

    assert_eq!(response.status, 204);
    assert_eq!(response.retry_after, None);
    let received = receiver.received.lock().unwrap()[0].clone();
    assert_eq!(received.content_type.as_deref(), Some("application/json"));
    assert_eq!(received.user_agent.as_deref(), Some("agent/1.0"));
    assert_eq!(received.authorization.as_deref(), Some("Basic dXNlcjpwYXNz"));
    assert_eq!(received.body, br#"{"timeseries":[]}"#);
}

#[tokio::test]
async fn test_reports_status_and_retry_after() {
    let (addr, _receiver) = serve(vec![
        (StatusCode::TOO_MANY_REQUESTS, Some("7")),
        (StatusCode::BAD_REQUEST, None),
    ])
    .await;
    let transport = HttpTransport::new(&endpoint(addr)).unwrap();

    let throttled = transport.send(&request()).await.unwrap();
    assert_eq!(throttled.status, 429);
    assert_eq!(throttled.retry_after, Some(Duration::from_secs(7)));

    let rejected = transport.send(&request()).await.unwrap();
    assert_eq!(rejected.status, 400);
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = HttpTransport::new(&endpoint(addr)).unwrap();
    let result = transport.send(&request()).await;

    assert!(matches!(result, Err(TransportError::Network(_))));
}

#[tokio::test]
async fn test_engine_delivers_over_http_after_server_error() {
    let (addr, receiver) = serve(vec![(StatusCode::INTERNAL_SERVER_ERROR, None)]).await;
    let dir = TempDir::new().unwrap();
    let mut endpoint = endpoint(addr);
    endpoint.retry_backoff = Duration::from_millis(50);
    endpoint.external_labels.insert("cluster".to_string(), "test".to_string());

    let config = Config {
        data_dir: dir.path().to_path_buf(),
        ttl: Duration::from_secs(3600),
        shutdown_grace: Duration::from_secs(1),
        serialization: SerializationConfig {
            max_signals_to_batch: 1,
            ..SerializationConfig::default()
        },
        endpoints: vec![endpoint],
    };
    let engine = Engine::start(config).await.unwrap();

    let now_ms = chrono::Utc::now().timestamp_millis();
    let sample = Sample::new(SeriesLabels::from_pairs([("__name__", "up")]), now_ms, 1.0);
    assert!(engine.appender().append(sample).await.is_accepted());

    for _ in 0..200 {
        if receiver.count() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let stats = engine.shutdown().await;

    assert_eq!(receiver.count(), 2);
    let body: serde_json::Value =
        serde_json::from_slice(&receiver.received.lock().unwrap()[1].body).unwrap();
    assert_eq!(body["timeseries"][0]["labels"]["cluster"], "test");
    assert_eq!(body["timeseries"][0]["samples"][0]["timestamp"], now_ms);

    let primary = stats.endpoint("primary").unwrap();
    assert_eq!(primary.total(|s| s.retries), 1);
    assert_eq!(primary.total(|s| s.samples_delivered), 1);
}
