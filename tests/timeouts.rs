mod support;

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use support::server;

use courier::Client;

#[tokio::test]
async fn read_timeout_fails_the_request() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        http::Response::default()
    });

    let client = Client::builder()
        .read_timeout(Duration::from_millis(200))
        .retry_options(None)
        .build()
        .unwrap();

    let url = format!("http://{}/slow", server.addr());
    let err = client.get(&url).send().await.unwrap_err();
    assert!(err.is_read_timeout(), "{err:?}");
    assert!(err.is_timeout());
}

#[tokio::test]
async fn per_request_read_timeout_overrides_client() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        http::Response::new(Full::new(Bytes::from_static(b"late but fine")))
    });

    let client = Client::builder()
        .read_timeout(Duration::from_millis(100))
        .retry_options(None)
        .build()
        .unwrap();

    let url = format!("http://{}/slowish", server.addr());
    let res = client
        .get(&url)
        .read_timeout(Duration::from_secs(5))
        .send()
        .await
        .unwrap();
    assert_eq!(res.text().await.unwrap(), "late but fine");
}

#[tokio::test]
async fn timeout_does_not_fire_on_fast_responses() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move {
        http::Response::new(Full::new(Bytes::from_static(b"quick")))
    });

    let client = Client::builder()
        .read_timeout(Duration::from_millis(250))
        .build()
        .unwrap();

    let url = format!("http://{}/fast", server.addr());
    for _ in 0..3 {
        let res = client.get(&url).send().await.unwrap();
        assert_eq!(res.text().await.unwrap(), "quick");
        // sit past the timeout window; a stale (uncancelled) token would
        // have killed the pooled connection and surfaced nothing here
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

#[tokio::test]
async fn connect_timeout_maps_to_connect_error() {
    let _ = env_logger::try_init();

    let client = Client::builder()
        .connect_timeout(Duration::from_millis(300))
        .retry_options(None)
        .build()
        .unwrap();

    // RFC 5737 TEST-NET-1, guaranteed unroutable
    let err = client
        .get("http://192.0.2.1:81/nope")
        .send()
        .await
        .unwrap_err();
    assert!(err.is_connect(), "{err:?}");
    assert!(err.is_timeout(), "{err:?}");
}
