mod support;

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use support::server;

use courier::Client;

#[tokio::test]
async fn waiter_queue_overflow_is_rejected() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        http::Response::new(Full::new(Bytes::from_static(b"slow")))
    });

    let client = Client::builder()
        .connection_pool_size(1)
        .connection_pool_waiting_queue_length(0)
        .retry_options(None)
        .build()
        .unwrap();

    let url = format!("http://{}/slow", server.addr());
    let first = client.get(&url).send();
    let second = async {
        // let the first land on the only channel
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.get(&url).send().await
    };

    let (first, second) = tokio::join!(first, second);
    assert!(first.is_ok());
    let err = second.unwrap_err();
    assert!(err.is_pool_exhausted(), "{err:?}");
}

#[tokio::test]
async fn queued_waiter_is_served_after_release() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        http::Response::new(Full::new(Bytes::from_static(b"ok")))
    });

    let client = Client::builder()
        .connection_pool_size(1)
        .connection_pool_waiting_queue_length(4)
        .build()
        .unwrap();

    let url = format!("http://{}/q", server.addr());
    let mut handles = Vec::new();
    for _ in 0..3 {
        let client = client.clone();
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            let res = client.get(&url).send().await?;
            res.text().await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "ok");
    }
}

#[tokio::test]
async fn pool_exhaustion_is_retry_eligible() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        http::Response::new(Full::new(Bytes::from_static(b"eventually")))
    });

    // with retries on, the overflow resolves once the pool frees up
    let client = Client::builder()
        .connection_pool_size(1)
        .connection_pool_waiting_queue_length(0)
        .retry_options(Some(
            courier::RetryOptions::new(5).backoff(Duration::from_millis(200)),
        ))
        .build()
        .unwrap();

    let url = format!("http://{}/busy", server.addr());
    let first = client.get(&url).send();
    let second = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.get(&url).send().await
    };

    let (first, second) = tokio::join!(first, second);
    assert!(first.is_ok());
    let second = second.unwrap();
    assert_eq!(second.text().await.unwrap(), "eventually");
}
