//! Client tests: pooling, retries, timeouts, discovery.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gale::client::{Client, ClientOptions, RetryConfig};
use gale::discovery::{
    balancer_factory, service_discovery_middleware, DiscoveryOptions, Instance, StaticResolver,
    WeightedRandomBalancer,
};
use gale::{handler, BoxFuture, Context, Engine, Request, Response};
use http::{Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use support::{start, test_options};

fn pong(cx: &mut Context) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        cx.string(StatusCode::OK, "pong");
    })
}

fn slow(cx: &mut Context) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cx.string(StatusCode::OK, "slow");
    })
}

#[tokio::test]
async fn get_round_trip() {
    let mut engine = Engine::new(test_options());
    engine.get("/ping", handler(pong));
    let (_engine, addr) = start(engine).await;

    let client = Client::default();
    let resp = client
        .get(&format!("http://{}/ping", addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body_bytes().unwrap().as_ref(), b"pong");
}

#[tokio::test]
async fn sequential_requests_reuse_one_connection() {
    let conns = Arc::new(AtomicUsize::new(0));
    let seen = conns.clone();

    let mut engine = Engine::new(test_options());
    engine.set_on_connect(Arc::new(move |_conn| {
        seen.fetch_add(1, Ordering::SeqCst);
        true
    }));
    engine.get("/ping", handler(pong));
    let (_engine, addr) = start(engine).await;

    let client = Client::default();
    let url = format!("http://{}/ping", addr);
    for _ in 0..3 {
        let resp = client.get(&url).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
    assert_eq!(conns.load(Ordering::SeqCst), 1, "expected pooled reuse");
}

#[tokio::test]
async fn pool_exhaustion_without_wait_is_no_free_conns() {
    let mut engine = Engine::new(test_options());
    engine.get("/slow", handler(slow));
    let (_engine, addr) = start(engine).await;

    let mut options = ClientOptions::default();
    options.max_conns_per_host = 1;
    options.max_conn_wait_timeout = None;
    let client = Client::new(options);
    let url = format!("http://{}/slow", addr);

    let first = {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move { client.get(&url).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = client.get(&url).await;
    assert!(second.unwrap_err().is_no_free_conns());
    assert!(first.await.unwrap().is_ok());
}

#[tokio::test]
async fn pool_wait_timeout_eventually_succeeds() {
    let mut engine = Engine::new(test_options());
    engine.get("/slow", handler(slow));
    let (_engine, addr) = start(engine).await;

    let mut options = ClientOptions::default();
    options.max_conns_per_host = 1;
    options.max_conn_wait_timeout = Some(Duration::from_secs(2));
    let client = Client::new(options);
    let url = format!("http://{}/slow", addr);

    let first = {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move { client.get(&url).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = client.get(&url).await;
    assert!(second.is_ok());
    assert!(first.await.unwrap().is_ok());
}

#[tokio::test]
async fn do_timeout_returns_before_slow_response() {
    let mut engine = Engine::new(test_options());
    engine.get("/slow", handler(slow));
    let (_engine, addr) = start(engine).await;

    let client = Client::default();
    let req = Request::new(
        Method::GET,
        format!("http://{}/slow", addr).parse().unwrap(),
    );
    let started = std::time::Instant::now();
    let result = client.do_timeout(req, Duration::from_millis(50)).await;
    assert!(result.unwrap_err().is_timeout());
    assert!(started.elapsed() < Duration::from_millis(250));
}

#[tokio::test]
async fn transient_failure_retries_to_success() {
    // First accept is dropped before a response; the retry lands on a
    // healthy exchange.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (first, _) = listener.accept().await.unwrap();
        drop(first);
        let (mut second, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = second.read(&mut buf).await.unwrap();
        second
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
    });

    let mut options = ClientOptions::default();
    options.retry = RetryConfig {
        max_attempt_times: 3,
        ..RetryConfig::default()
    };
    let client = Client::new(options);
    let resp = client.get(&format!("http://{}/x", addr)).await.unwrap();
    assert_eq!(resp.body_bytes().unwrap().as_ref(), b"ok");
}

#[tokio::test]
async fn unsupported_scheme_is_descriptive() {
    let client = Client::default();
    let mut req = Request::new(Method::GET, "ftp://host/file".parse().unwrap());
    let mut resp = Response::new();
    let err = client.do_request(&mut req, &mut resp).await.unwrap_err();
    assert!(err.is_user());
    assert!(err.to_string().contains("scheme"), "{}", err);
}

#[tokio::test]
async fn missing_host_is_rejected() {
    let client = Client::default();
    let mut req = Request::new(Method::GET, "/relative".parse().unwrap());
    let mut resp = Response::new();
    let err = client.do_request(&mut req, &mut resp).await.unwrap_err();
    assert!(err.is_user(), "{}", err);
}

fn tag_a(cx: &mut Context) -> BoxFuture<'_, ()> {
    Box::pin(async move { cx.string(StatusCode::OK, "A") })
}

fn tag_b(cx: &mut Context) -> BoxFuture<'_, ()> {
    Box::pin(async move { cx.string(StatusCode::OK, "B") })
}

#[tokio::test]
async fn discovery_middleware_balances_between_instances() {
    let mut a = Engine::new(test_options());
    a.get("/who", handler(tag_a));
    let (_a, addr_a) = start(a).await;

    let mut b = Engine::new(test_options());
    b.get("/who", handler(tag_b));
    let (_b, addr_b) = start(b).await;

    let resolver = StaticResolver::new().add(
        "svc1",
        vec![
            Instance::new(addr_a.to_string(), 10),
            Instance::new(addr_b.to_string(), 10),
        ],
    );
    let factory = balancer_factory(
        Arc::new(resolver),
        Arc::new(WeightedRandomBalancer::new()),
        DiscoveryOptions::default(),
    );

    let client = Client::default();
    client.use_middleware(service_discovery_middleware(factory));

    let mut hits_a = 0usize;
    let mut hits_b = 0usize;
    for _ in 0..60 {
        let mut req = Request::new(Method::GET, "/who".parse().unwrap());
        req.set_host("svc1");
        let mut resp = Response::new();
        client.do_request(&mut req, &mut resp).await.unwrap();
        match resp.body_bytes().map(|b| b.as_ref().to_vec()) {
            Some(body) if body == b"A" => hits_a += 1,
            Some(body) if body == b"B" => hits_b += 1,
            other => panic!("unexpected body {:?}", other),
        }
    }
    assert_eq!(hits_a + hits_b, 60);
    assert!(hits_a >= 10 && hits_b >= 10, "lopsided: {}/{}", hits_a, hits_b);
}
