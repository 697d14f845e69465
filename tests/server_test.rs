//! End-to-end tests driving the server over real sockets

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use wharf::config::Config;
use wharf::http::{HeadersChecker, HttpError};
use wharf::server::{Cancel, Listener, RequestHandler, ServiceParams, ShutdownHandle};

/// Start a server on an ephemeral port
async fn start_server(
    config: Config,
    handler: Arc<dyn RequestHandler>,
) -> (SocketAddr, ShutdownHandle, tokio::task::JoinHandle<wharf::Result<()>>) {
    let listener = Listener::bind(config, handler).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = listener.shutdown_handle();
    let task = tokio::spawn(listener.run());
    (addr, shutdown, task)
}

fn test_config() -> Config {
    let mut config = Config::for_port(0);
    config.min_connections = 1;
    config.max_connections = 8;
    config
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out reading response")
        .unwrap();
    buf
}

/// Responds to every request with a fixed body in a single write
struct FixedBodyHandler(&'static [u8]);

impl RequestHandler for FixedBodyHandler {
    fn service(&self, params: ServiceParams) {
        let body = self.0;
        tokio::spawn(async move {
            let _ = params.response.write(body, true).await;
            params.finish().await;
        });
    }
}

/// Streams the body in two parts
struct TwoPartHandler {
    first: &'static [u8],
    second: &'static [u8],
}

impl RequestHandler for TwoPartHandler {
    fn service(&self, params: ServiceParams) {
        let (first, second) = (self.first, self.second);
        tokio::spawn(async move {
            let _ = params.response.write(first, false).await;
            let _ = params.response.write(second, true).await;
            params.finish().await;
        });
    }
}

/// Echoes the request path as the response body
struct PathBodyHandler;

impl RequestHandler for PathBodyHandler {
    fn service(&self, params: ServiceParams) {
        tokio::spawn(async move {
            let body = params.request.path().as_bytes().to_vec();
            let _ = params.response.write(&body, true).await;
            params.finish().await;
        });
    }
}

#[tokio::test]
async fn simple_get_keep_alive_fixed_body() {
    let (addr, shutdown, task) =
        start_server(test_config(), Arc::new(FixedBodyHandler(b"hello"))).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /hi HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
    let reply = read_exactly(&mut stream, expected.len()).await;
    assert_eq!(reply, expected);

    // The connection stays open: a second request gets a second response.
    stream
        .write_all(b"GET /again HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let reply = read_exactly(&mut stream, expected.len()).await;
    assert_eq!(reply, expected);

    shutdown.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn http10_close_delimited_streaming() {
    let handler = TwoPartHandler {
        first: b"a",
        second: b"bc",
    };
    let (addr, shutdown, task) = start_server(test_config(), Arc::new(handler)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();

    assert_eq!(
        reply,
        b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nabc"
    );
    let text = String::from_utf8_lossy(&reply);
    assert!(!text.contains("Transfer-Encoding"));

    shutdown.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn chunked_streaming_on_http11() {
    let handler = TwoPartHandler {
        first: b"foo",
        second: b"bar",
    };
    let (addr, shutdown, task) = start_server(test_config(), Arc::new(handler)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let expected = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                     3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n";
    let reply = read_exactly(&mut stream, expected.len()).await;
    assert_eq!(reply, expected);

    // Still open for the next request
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let reply = read_exactly(&mut stream, expected.len()).await;
    assert_eq!(reply, expected);

    shutdown.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn pipelined_pair_answered_in_order() {
    let (addr, shutdown, task) = start_server(test_config(), Arc::new(PathBodyHandler)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await
        .unwrap();

    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n/a\
                     HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n/b";
    let reply = read_exactly(&mut stream, expected.len()).await;
    assert_eq!(reply, expected.as_slice());

    shutdown.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn oversized_request_gets_413_and_close() {
    let mut config = test_config();
    config.max_request_size = 100;
    let (addr, shutdown, task) =
        start_server(config, Arc::new(FixedBodyHandler(b"unreachable"))).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
    request.extend_from_slice(&vec![b'a'; 200]);
    request.extend_from_slice(b"\r\n\r\n");
    stream.write_all(&request).await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(
        reply,
        b"HTTP/1.1 413 entity too large\r\nConnection: close\r\n\r\n413 Entity too large\r\n"
    );

    shutdown.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn failing_header_check_gets_canonical_error() {
    let checker = HeadersChecker::new().with_check(|headers| {
        if headers.contains("host") {
            Ok(())
        } else {
            Err(HttpError::new(400, "Host header required"))
        }
    });

    let listener = Listener::bind(test_config(), Arc::new(FixedBodyHandler(b"ok")))
        .await
        .unwrap();
    listener.set_headers_checker(checker);
    let addr = listener.local_addr().unwrap();
    let shutdown = listener.shutdown_handle();
    let task = tokio::spawn(listener.run());

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(
        reply,
        b"HTTP/1.1 400\r\nConnection: close\r\n\r\nHost header required\r\n"
    );

    shutdown.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn pool_exhaustion_gets_503() {
    let mut config = test_config();
    config.min_connections = 1;
    config.max_connections = 2;
    let (addr, shutdown, task) =
        start_server(config, Arc::new(FixedBodyHandler(b"hello"))).await;

    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();
    // Give the listener time to lend both handlers out
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut third = TcpStream::connect(addr).await.unwrap();
    let mut reply = Vec::new();
    third.read_to_end(&mut reply).await.unwrap();
    assert_eq!(
        reply,
        b"HTTP/1.1 503 too many connections\r\nConnection: close\r\n\r\nToo many connections\r\n"
    );

    // The first two connections proceed normally.
    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
    for stream in [&mut first, &mut second] {
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let reply = read_exactly(stream, expected.len()).await;
        assert_eq!(reply, expected);
    }

    shutdown.shutdown();
    task.await.unwrap().unwrap();
}

struct CancelProbe {
    cancelled: AtomicUsize,
    notify: Notify,
}

struct ProbeCanceller(Arc<CancelProbe>);

impl Cancel for ProbeCanceller {
    fn cancel(&self) {
        self.0.cancelled.fetch_add(1, Ordering::SeqCst);
        self.0.notify.notify_one();
    }
}

/// Registers a canceller and stalls until cancelled (or a long timeout)
struct StallingHandler {
    probe: Arc<CancelProbe>,
}

impl RequestHandler for StallingHandler {
    fn service(&self, params: ServiceParams) {
        params.register_canceller(Arc::new(ProbeCanceller(Arc::clone(&self.probe))));
        let probe = Arc::clone(&self.probe);
        tokio::spawn(async move {
            tokio::select! {
                () = probe.notify.notified() => {
                    // Cancelled: complete promptly without touching the response
                }
                () = tokio::time::sleep(Duration::from_secs(10)) => {
                    let _ = params.response.write(b"late", true).await;
                }
            }
            params.finish().await;
        });
    }
}

#[tokio::test]
async fn disconnect_cancels_inflight_handler_exactly_once() {
    let probe = Arc::new(CancelProbe {
        cancelled: AtomicUsize::new(0),
        notify: Notify::new(),
    });
    let handler = StallingHandler {
        probe: Arc::clone(&probe),
    };
    let (addr, shutdown, task) = start_server(test_config(), Arc::new(handler)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(stream);

    // The connection notices the disconnect and cancels the handler.
    for _ in 0..100 {
        if probe.cancelled.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(probe.cancelled.load(Ordering::SeqCst), 1);

    // Extra time for the late completion to be discarded, then a fresh
    // connection must be unaffected.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /next HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    drop(stream);

    shutdown.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn handler_close_header_closes_keep_alive_connection() {
    struct ClosingHandler;
    impl RequestHandler for ClosingHandler {
        fn service(&self, params: ServiceParams) {
            tokio::spawn(async move {
                params.response.set_header("Connection", "close");
                let _ = params.response.write(b"bye", true).await;
                params.finish().await;
            });
        }
    }

    let (addr, shutdown, task) = start_server(test_config(), Arc::new(ClosingHandler)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    // read_to_end returning proves the server closed despite HTTP/1.1
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Connection: close\r\n"));
    assert!(text.ends_with("bye"));

    shutdown.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn read_timeout_closes_without_a_response() {
    let mut config = test_config();
    config.read_timeout = 100;
    let (addr, shutdown, task) =
        start_server(config, Arc::new(FixedBodyHandler(b"hello"))).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // An incomplete request that never finishes
    stream.write_all(b"GET / HTTP/1.1\r\nHos").await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert!(reply.is_empty(), "no 408 body may be sent on read timeout");

    shutdown.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn post_body_reaches_handler() {
    struct BodyEchoHandler;
    impl RequestHandler for BodyEchoHandler {
        fn service(&self, params: ServiceParams) {
            tokio::spawn(async move {
                let body = params.request.body().to_vec();
                let _ = params.response.write(&body, true).await;
                params.finish().await;
            });
        }
    }

    let (addr, shutdown, task) = start_server(test_config(), Arc::new(BodyEchoHandler)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 7\r\n\r\npayload")
        .await
        .unwrap();

    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\npayload";
    let reply = read_exactly(&mut stream, expected.len()).await;
    assert_eq!(reply, expected);

    shutdown.shutdown();
    task.await.unwrap().unwrap();
}
