use axum::http::StatusCode;
use http_test_server::latency::LatencySettings;
use http_test_server::rate_limiter::{BucketSettings, RateLimitBehavior, RateLimitSettings};
use http_test_server::{RunningServer, Server, ServerConfig};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn start(config: ServerConfig) -> RunningServer {
    let config = ServerConfig {
        address: "127.0.0.1:0".parse().unwrap(),
        ..config
    };
    Server::new(config).unwrap().start().await.unwrap()
}

fn url(server: &RunningServer, path: &str) -> String {
    format!("http://{}{}", server.local_addr(), path)
}

fn rate_limited(behavior: RateLimitBehavior, fill_interval: Duration) -> ServerConfig {
    ServerConfig {
        rate_limit: RateLimitSettings {
            behavior,
            bucket: Some(BucketSettings {
                fill_interval,
                capacity: 1,
                quantum: 1,
            }),
            hard_status_code: StatusCode::TOO_MANY_REQUESTS,
        },
        ..ServerConfig::default()
    }
}

/// Sends a request over a bare socket and returns everything the server wrote
/// back before closing it.
async fn raw_post(addr: SocketAddr) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\nConnection: close\r\nContent-Length: 5\r\n\r\nhello")
        .await
        .unwrap();

    let mut response = Vec::new();
    // A reset is as good as a close here.
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("server should close the connection");
    response
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = start(ServerConfig::default()).await;

    let response = reqwest::get(url(&server, "/_health")).await.unwrap();
    assert_eq!(response.status().as_u16(), 204);

    server.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_messages_are_counted() {
    let server = start(ServerConfig::default()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(url(&server, "/"))
        .header("content-type", "application/json")
        .body("a\nb")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 204);

    let response = client
        .post(url(&server, "/logs"))
        .header("content-type", "application/x-ndjson")
        .body("c")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 204);
    drop(client);

    let statistics = server.shutdown(Duration::from_secs(5)).await;
    assert_eq!(statistics.message_count, 3);
    assert_eq!(statistics.request_count, 2);
    assert_eq!(statistics.byte_total, 4);
    assert_eq!(statistics.first_message, "a");
    assert_eq!(statistics.last_message, "c");
    assert!(statistics.requests.iter().all(|r| r.status == 204 && r.start <= r.end));
}

#[tokio::test]
async fn test_request_id_round_trip() {
    let server = start(ServerConfig::default()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(url(&server, "/"))
        .header("x-request-id", "run-7")
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "run-7");

    let response = client.post(url(&server, "/")).body("x").send().await.unwrap();
    assert!(response.headers().contains_key("x-request-id"));

    drop(client);
    server.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_hard_rate_limit() {
    let server = start(rate_limited(RateLimitBehavior::Hard, Duration::from_secs(3600))).await;
    let client = reqwest::Client::new();

    let first = client.post(url(&server, "/")).body("a").send().await.unwrap();
    assert_eq!(first.status().as_u16(), 204);

    let second = client.post(url(&server, "/")).body("b").send().await.unwrap();
    assert_eq!(second.status().as_u16(), 429);
    assert_eq!(second.text().await.unwrap(), "Too Many Requests\n");

    drop(client);
    let statistics = server.shutdown(Duration::from_secs(5)).await;
    assert_eq!(statistics.request_count, 2);
}

#[tokio::test]
async fn test_queue_rate_limit_waits_for_refill() {
    let fill_interval = Duration::from_millis(200);
    let server = start(rate_limited(RateLimitBehavior::Queue, fill_interval)).await;
    let client = reqwest::Client::new();

    let started = Instant::now();
    for _ in 0..3 {
        let response = client.post(url(&server, "/")).body("a").send().await.unwrap();
        assert_eq!(response.status().as_u16(), 204);
    }
    // The third request needs a token from the tick after the one the second used.
    assert!(started.elapsed() >= fill_interval);

    drop(client);
    server.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_close_rate_limit_drops_connection() {
    let server = start(rate_limited(RateLimitBehavior::Close, Duration::from_secs(3600))).await;

    let response = raw_post(server.local_addr()).await;
    assert!(response.starts_with(b"HTTP/1.1 204"));

    let response = raw_post(server.local_addr()).await;
    assert!(response.is_empty(), "expected no response, got {:?}", String::from_utf8_lossy(&response));

    let statistics = server.shutdown(Duration::from_secs(5)).await;
    let mut statuses: Vec<u16> = statistics.requests.iter().map(|r| r.status).collect();
    statuses.sort();
    assert_eq!(statuses, vec![0, 204]);
}

#[tokio::test]
async fn test_error_expression_close() {
    let config = ServerConfig {
        error_expression: Some("\"CLOSE\"".into()),
        ..ServerConfig::default()
    };
    let server = start(config).await;

    let response = raw_post(server.local_addr()).await;
    assert!(response.is_empty());

    let statistics = server.shutdown(Duration::from_secs(5)).await;
    assert_eq!(statistics.request_count, 1);
    assert_eq!(statistics.message_count, 1);
    assert_eq!(statistics.requests[0].status, 0);
}

#[tokio::test]
async fn test_error_expression_status() {
    let config = ServerConfig {
        error_expression: Some("active_requests > 0 ? 503 : false".into()),
        ..ServerConfig::default()
    };
    let server = start(config).await;

    let response = reqwest::Client::new().post(url(&server, "/")).body("a").send().await.unwrap();
    assert_eq!(response.status().as_u16(), 503);
    assert_eq!(response.text().await.unwrap(), "Service Unavailable\n");

    server.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_requests() {
    let config = ServerConfig {
        latency: LatencySettings::Normal {
            mean: Duration::from_millis(300),
            stddev: Duration::ZERO,
        },
        ..ServerConfig::default()
    };
    let server = start(config).await;

    let target = url(&server, "/");
    let in_flight = tokio::spawn(async move { reqwest::Client::new().post(target).body("a").send().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let statistics = server.shutdown(Duration::from_secs(5)).await;
    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.status().as_u16(), 204);
    assert_eq!(statistics.request_count, 1);
    assert_eq!(statistics.requests[0].status, 204);
}

#[tokio::test]
async fn test_large_body_is_ingested() {
    let server = start(ServerConfig::default()).await;

    let body = "line\n".repeat(800 * 1024);
    let response = reqwest::Client::new()
        .post(url(&server, "/"))
        .header("content-type", "text/plain")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 204);

    let statistics = server.shutdown(Duration::from_secs(5)).await;
    assert_eq!(statistics.byte_total, 5 * 800 * 1024);
    assert_eq!(statistics.message_count, 800 * 1024 + 1);
    assert_eq!(statistics.requests[0].status, 204);
}

#[tokio::test]
async fn test_shutdown_gives_up_after_timeout() {
    let config = ServerConfig {
        latency: LatencySettings::Normal {
            mean: Duration::from_secs(30),
            stddev: Duration::ZERO,
        },
        ..ServerConfig::default()
    };
    let server = start(config).await;

    let target = url(&server, "/");
    let in_flight = tokio::spawn(async move { reqwest::Client::new().post(target).body("a").send().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let statistics = server.shutdown(Duration::from_millis(200)).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    // The abandoned request never completed, so it was never recorded.
    assert_eq!(statistics.request_count, 0);
    assert!(statistics.requests.is_empty());

    in_flight.abort();
}
