//! End-to-end wire tests: real sockets against a live in-process worker.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use satie_core::config::Env;
use satie_core::handler::{InputKind, ModelSchema, Reply, Route};
use satie_core::rate::Limit;
use satie_core::{LimiterKind, RateLimitStrategy, Server};

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    message: String,
}

fn test_routes() -> Vec<Route> {
    vec![
        Route::get("/")
            .handler(|_args| async { Ok(Reply::Text("Hello World".to_string())) })
            .unwrap(),
        Route::get("/get/:id")
            .input(InputKind::Path)
            .handler(|args| async move {
                let id = args.path_param("id").unwrap_or("").to_string();
                Ok(Reply::Text(id))
            })
            .unwrap(),
        Route::post("/post")
            .input(InputKind::BodyModel(ModelSchema::of::<Message>("Message")))
            .handler(|mut args| async move {
                let message: Message = args.take_model().expect("model body");
                Reply::model(&message)
            })
            .unwrap(),
        Route::post("/upload")
            .input(InputKind::BodyRaw)
            .handler(|mut args| async move {
                let body = args.take_raw_body().unwrap_or_default();
                Ok(Reply::Text(String::from_utf8_lossy(&body).into_owned()))
            })
            .unwrap(),
    ]
}

async fn start_server(env: Env, routes: Vec<Route>) -> (SocketAddr, oneshot::Sender<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let mut server = Server::new(env);
    for route in routes {
        server.route(route);
    }

    tokio::spawn(async move {
        server
            .serve_until(listener, async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
    });

    // Give the accept loop a beat to come up.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, stop_tx)
}

/// Read exactly one HTTP response (status line + headers + content-length
/// body) off the stream.
async fn read_response(stream: &mut TcpStream) -> Vec<u8> {
    let mut response = Vec::new();
    let mut byte = [0u8; 1];

    while !response.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed before headers completed");
        response.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&response).into_owned();
    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0);

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        stream.read_exact(&mut body).await.unwrap();
    }
    response.extend_from_slice(&body);
    response
}

async fn round_trip(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    read_response(&mut stream).await
}

#[tokio::test]
async fn test_hello_world_exact_wire_bytes() {
    let (addr, _stop) = start_server(Env::default(), test_routes()).await;

    let response = round_trip(addr, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(
        response,
        b"HTTP/1.1 200 OK\r\ncontent-length: 11\r\ncontent-type: text/plain\r\n\r\nHello World"
    );
}

#[tokio::test]
async fn test_path_parameter_echo() {
    let (addr, _stop) = start_server(Env::default(), test_routes()).await;

    let response = round_trip(addr, b"GET /get/42 HTTP/1.1\r\nHost: x\r\n\r\n").await;
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.ends_with("\r\n\r\n42"));
}

#[tokio::test]
async fn test_model_body_round_trip_and_validation() {
    let (addr, _stop) = start_server(Env::default(), test_routes()).await;

    // The declared length overshoots the body by one; the sentinel-byte
    // tolerance still completes the read.
    let valid = round_trip(
        addr,
        b"POST /post HTTP/1.1\r\nHost: x\r\nContent-Length: 17\r\ncontent-type: application/json\r\n\r\n{\"message\":\"hi\"}",
    )
    .await;
    let text = String::from_utf8(valid).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.ends_with(r#"{"message":"hi"}"#));

    let invalid = round_trip(
        addr,
        b"POST /post HTTP/1.1\r\nHost: x\r\nContent-Length: 13\r\ncontent-type: application/json\r\n\r\n{\"message\":1}",
    )
    .await;
    let text = String::from_utf8(invalid).unwrap();
    assert!(text.starts_with("HTTP/1.1 422 Unprocessable Content"));
}

#[tokio::test]
async fn test_chunked_request_body() {
    let (addr, _stop) = start_server(Env::default(), test_routes()).await;

    let response = round_trip(
        addr,
        b"POST /upload HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
    )
    .await;
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.ends_with("\r\n\r\nwikipedia"));
}

#[tokio::test]
async fn test_missing_route_yields_404_array() {
    let (addr, _stop) = start_server(Env::default(), test_routes()).await;

    let response = round_trip(addr, b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n").await;
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 404 Not Found"));
    assert!(text.ends_with(r#"[{"error":"No route matching /missing"}]"#));
}

#[tokio::test]
async fn test_bodyless_post_yields_400() {
    let (addr, _stop) = start_server(Env::default(), test_routes()).await;

    let response = round_trip(addr, b"POST /upload HTTP/1.1\r\nHost: x\r\n\r\n").await;
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 400 Bad Request"));
    assert!(text.contains("No Content-Length or Transfer-Encoding header supplied"));
}

#[tokio::test]
async fn test_sliding_window_ip_limit_round_trip() {
    let env = Env {
        rate_limit_strategy: RateLimitStrategy::Ip,
        rate_limiter_type: LimiterKind::SlidingWindow,
        rate_limit_requests: 1,
        rate_limit_period: Duration::from_secs(1),
        ..Env::default()
    };
    let route = Route::get("/")
        .limit(Limit::default().max_requests(1).period(Duration::from_secs(1)))
        .handler(|_args| async { Ok(Reply::Text("ok".to_string())) })
        .unwrap();
    let (addr, _stop) = start_server(env, vec![route]).await;

    let first = round_trip(addr, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(String::from_utf8(first).unwrap().starts_with("HTTP/1.1 200 OK"));

    let second = round_trip(addr, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(
        String::from_utf8(second)
            .unwrap()
            .starts_with("HTTP/1.1 429 Too Many Requests")
    );

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let third = round_trip(addr, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(String::from_utf8(third).unwrap().starts_with("HTTP/1.1 200 OK"));
}

#[tokio::test]
async fn test_expect_100_continue_flow() {
    let (addr, _stop) = start_server(Env::default(), test_routes()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"POST /upload HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n",
        )
        .await
        .unwrap();

    let mut interim = [0u8; 25];
    stream.read_exact(&mut interim).await.unwrap();
    assert_eq!(&interim, b"HTTP/1.1 100 Continue\r\n\r\n");

    stream.write_all(b"hello").await.unwrap();
    let response = read_response(&mut stream).await;
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.ends_with("\r\n\r\nhello"));
}

#[tokio::test]
async fn test_keep_alive_pipelining_preserves_order() {
    let (addr, _stop) = start_server(Env::default(), test_routes()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /get/first HTTP/1.1\r\nHost: x\r\n\r\nGET /get/second HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await
        .unwrap();

    let first = String::from_utf8(read_response(&mut stream).await).unwrap();
    let second = String::from_utf8(read_response(&mut stream).await).unwrap();
    assert!(first.ends_with("\r\n\r\nfirst"));
    assert!(second.ends_with("\r\n\r\nsecond"));
}

#[tokio::test]
async fn test_content_length_zero() {
    let (addr, _stop) = start_server(Env::default(), test_routes()).await;

    let response = round_trip(
        addr,
        b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("content-length: 0"));
}

#[tokio::test]
async fn test_connection_close_is_honored() {
    let (addr, _stop) = start_server(Env::default(), test_routes()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut everything = Vec::new();
    stream.read_to_end(&mut everything).await.unwrap();
    let text = String::from_utf8(everything).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.ends_with("Hello World"));
}

#[tokio::test]
async fn test_cached_route_replays_identical_bytes() {
    let env = Env {
        request_caching_enabled: true,
        max_request_cache_size: 16,
        ..Env::default()
    };
    let (addr, _stop) = start_server(env, test_routes()).await;

    let request = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
    let first = round_trip(addr, request).await;
    let second = round_trip(addr, request).await;
    assert_eq!(first, second);
}
