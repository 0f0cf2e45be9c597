mod support;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use support::server;

use courier::{Client, Listener, StatusCode};

#[tokio::test]
async fn simple_get() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.method(), "GET");
        assert_eq!(req.uri().path(), "/hello");
        http::Response::new(Full::new(Bytes::from_static(b"world")))
    });

    let url = format!("http://{}/hello", server.addr());
    let res = Client::new().get(&url).send().await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.version(), http::Version::HTTP_11);
    assert_eq!(res.text().await.unwrap(), "world");
}

#[tokio::test]
async fn post_body_sets_content_length() {
    let _ = env_logger::try_init();

    let server = server::http(move |mut req| async move {
        assert_eq!(req.method(), "POST");
        assert_eq!(req.headers()["content-length"], "5");
        let body = req.body_mut().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");
        http::Response::default()
    });

    let url = format!("http://{}/echo", server.addr());
    let res = Client::new().post(&url).body("hello").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn form_urlencoded_body() {
    let _ = env_logger::try_init();

    let server = server::http(move |mut req| async move {
        assert_eq!(
            req.headers()["content-type"],
            "application/x-www-form-urlencoded"
        );
        let body = req.body_mut().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"key1=value1&key2=value2");
        http::Response::default()
    });

    let url = format!("http://{}/form", server.addr());
    let res = Client::new()
        .post(&url)
        .attr("key1", "value1")
        .attr("key2", "value2")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn keep_alive_reuses_the_connection() {
    let _ = env_logger::try_init();

    let mut server = server::http(move |_req| async move { http::Response::default() });

    let client = Client::new();
    let url = format!("http://{}/a", server.addr());
    for _ in 0..3 {
        let res = client.get(&url).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        res.bytes().await.unwrap();
        // let the release land before the next acquire
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    let accepted = server
        .events()
        .into_iter()
        .filter(|e| *e == server::Event::ConnectionAccepted)
        .count();
    assert_eq!(accepted, 1, "three requests should share one connection");
}

#[tokio::test]
async fn completion_callbacks_fire_exactly_once() {
    let _ = env_logger::try_init();

    #[derive(Default)]
    struct Counting {
        completed: AtomicUsize,
        errors: AtomicUsize,
        order: Mutex<Vec<&'static str>>,
    }
    impl Listener for Counting {
        fn on_connection_pool_attempt(&self) {
            self.order.lock().unwrap().push("pool-attempt");
        }
        fn on_connection_pool_acquired(&self) {
            self.order.lock().unwrap().push("pool-acquired");
        }
        fn on_write_done(&self) {
            self.order.lock().unwrap().push("write-done");
        }
        fn on_message_received(&self, _status: StatusCode) {
            self.order.lock().unwrap().push("message");
        }
        fn on_completed(&self) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_error(&self, _err: &courier::Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    let server = server::http(move |_req| async move {
        http::Response::new(Full::new(Bytes::from_static(b"ok")))
    });

    let client = Client::new();
    let listener = Arc::new(Counting::default());
    let url = format!("http://{}/once", server.addr());
    let request = client.get(&url).build().unwrap();
    let res = client
        .execute_with(request, listener.clone())
        .await
        .unwrap();
    assert_eq!(res.text().await.unwrap(), "ok");
    // the terminal callback fires in the reader task right after the last
    // body byte; give it a beat
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(listener.completed.load(Ordering::SeqCst), 1);
    assert_eq!(listener.errors.load(Ordering::SeqCst), 0);
    let order = listener.order.lock().unwrap().clone();
    assert_eq!(
        order,
        vec!["pool-attempt", "pool-acquired", "write-done", "message"]
    );
}

#[tokio::test]
async fn error_callback_fires_exactly_once_on_connect_failure() {
    let _ = env_logger::try_init();

    #[derive(Default)]
    struct Counting {
        completed: AtomicUsize,
        errors: AtomicUsize,
    }
    impl Listener for Counting {
        fn on_completed(&self) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_error(&self, _err: &courier::Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    // a port with nothing listening
    let client = Client::builder().retry_options(None).build().unwrap();
    let listener = Arc::new(Counting::default());
    let request = client
        .get("http://127.0.0.1:2/unreachable")
        .build()
        .unwrap();
    let err = client
        .execute_with(request, listener.clone())
        .await
        .unwrap_err();

    assert!(err.is_connect(), "{err:?}");
    assert_eq!(listener.completed.load(Ordering::SeqCst), 0);
    assert_eq!(listener.errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn gzip_response_is_transparently_decoded() {
    let _ = env_logger::try_init();

    use async_compression::tokio::bufread::GzipEncoder;
    use tokio::io::AsyncReadExt;

    let mut encoder = GzipEncoder::new(&b"a plain text body"[..]);
    let mut compressed = Vec::new();
    encoder.read_to_end(&mut compressed).await.unwrap();
    let compressed = Bytes::from(compressed);

    let server = server::http(move |req| {
        let compressed = compressed.clone();
        async move {
            assert_eq!(req.headers()["accept-encoding"], "gzip, deflate");
            http::Response::builder()
                .header("content-encoding", "gzip")
                .body(Full::new(compressed))
                .unwrap()
        }
    });

    let client = Client::builder().use_decompress(true).build().unwrap();
    let url = format!("http://{}/gz", server.addr());
    let res = client.get(&url).send().await.unwrap();
    assert!(res.headers().get("content-encoding").is_none());
    assert_eq!(res.text().await.unwrap(), "a plain text body");
}

#[tokio::test]
async fn max_content_length_is_enforced() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async move {
        http::Response::new(Full::new(Bytes::from(vec![0u8; 64 * 1024])))
    });

    let client = Client::builder()
        .max_content_length(1024)
        .retry_options(None)
        .build()
        .unwrap();
    let url = format!("http://{}/big", server.addr());
    let err = match client.get(&url).send().await {
        // the cap can trip while the head is in flight or during body
        // aggregation, depending on scheduling
        Ok(res) => res.bytes().await.unwrap_err(),
        Err(err) => err,
    };
    assert!(
        err.is_content_overflow() || err.is_connection_inactive(),
        "{err:?}"
    );
}
