use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use procura_storage::{HttpClientConfig, OutboundRequest, PooledTransport, StatusCode, Transport};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Minimal HTTP/1.1 responder: answers each request with the next scripted status
/// (200 once the script runs dry) after holding it for `hold`.
struct LocalServer {
    addr: SocketAddr,
    statuses: Arc<Mutex<VecDeque<u16>>>,
    methods: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    high_water: Arc<AtomicUsize>,
}

impl LocalServer {
    async fn start(statuses: &[u16], hold: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Self {
            addr: listener.local_addr().unwrap(),
            statuses: Arc::new(Mutex::new(statuses.iter().copied().collect())),
            methods: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            high_water: Arc::new(AtomicUsize::new(0)),
        };

        let statuses = server.statuses.clone();
        let methods = server.methods.clone();
        let in_flight = server.in_flight.clone();
        let high_water = server.high_water.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let statuses = statuses.clone();
                let methods = methods.clone();
                let in_flight = in_flight.clone();
                let high_water = high_water.clone();
                tokio::spawn(async move {
                    let gauge = Gauge {
                        in_flight: &in_flight,
                        high_water: &high_water,
                    };
                    serve(stream, hold, &statuses, &methods, gauge).await;
                });
            }
        });
        server
    }

    fn url(&self) -> String {
        format!("http://{}/search", self.addr)
    }

    async fn methods(&self) -> Vec<String> {
        self.methods.lock().await.clone()
    }
}

#[derive(Clone, Copy)]
struct Gauge<'a> {
    in_flight: &'a AtomicUsize,
    high_water: &'a AtomicUsize,
}

async fn serve(
    mut stream: TcpStream,
    hold: Duration,
    statuses: &Mutex<VecDeque<u16>>,
    methods: &Mutex<Vec<String>>,
    gauge: Gauge<'_>,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    let method = head.split_whitespace().next().unwrap_or_default().to_string();
    methods.lock().await.push(method);

    let now = gauge.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    gauge.high_water.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(hold).await;
    gauge.in_flight.fetch_sub(1, Ordering::SeqCst);

    let status = statuses.lock().await.pop_front().unwrap_or(200);
    let body = json!({ "status": status }).to_string();
    let response = format!(
        "HTTP/1.1 {status} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

fn transport(max_total_connections: usize) -> Arc<PooledTransport> {
    Arc::new(PooledTransport::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        max_total_connections,
        transport_retry_backoff: Duration::from_millis(5),
        ..Default::default()
    }))
}

#[tokio::test]
async fn in_flight_sends_never_exceed_the_connection_ceiling() {
    let server = LocalServer::start(&[], Duration::from_millis(80)).await;
    let transport = transport(2);

    let mut handles = Vec::new();
    for _ in 0..7 {
        let transport = transport.clone();
        let url = server.url();
        handles.push(tokio::spawn(async move {
            transport.send(&OutboundRequest::get(url)).await
        }));
    }
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.status, StatusCode::OK);
    }

    assert_eq!(server.methods().await.len(), 7);
    let high_water = server.high_water.load(Ordering::SeqCst);
    assert!(high_water <= 2, "{high_water} requests in flight with a ceiling of 2");
    assert_eq!(transport.available_permits(), 2);
    assert!(transport.is_initialized());
    assert_eq!(transport.stats().requests_sent, 7);
}

#[tokio::test]
async fn gateway_errors_are_retried_for_get_only() {
    let server = LocalServer::start(&[503, 502, 500, 504], Duration::ZERO).await;
    let transport = transport(4);

    let response = transport.send(&OutboundRequest::get(server.url())).await.unwrap();
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(transport.stats().requests_sent, 3);
    assert_eq!(transport.stats().transport_retries, 2);

    let response = transport
        .send(&OutboundRequest::post_json(server.url(), json!({"opportunity_id": "N-1"})))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(transport.stats().requests_sent, 4);
    assert_eq!(transport.stats().transport_retries, 2);

    assert_eq!(server.methods().await, vec!["GET", "GET", "GET", "POST"]);
}

#[tokio::test]
async fn statuses_outside_the_retry_set_come_straight_back() {
    let server = LocalServer::start(&[501, 429, 503], Duration::ZERO).await;
    let transport = transport(4);

    let first = transport.send(&OutboundRequest::get(server.url())).await.unwrap();
    assert_eq!(first.status, StatusCode::NOT_IMPLEMENTED);
    let second = transport.send(&OutboundRequest::get(server.url())).await.unwrap();
    assert_eq!(second.status, StatusCode::TOO_MANY_REQUESTS);
    let third = transport.send(&OutboundRequest::get(server.url())).await.unwrap();
    assert_eq!(third.status, StatusCode::OK);

    assert_eq!(transport.stats().requests_sent, 4);
    assert_eq!(transport.stats().transport_retries, 1);
}
