mod support;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use support::server;

use courier::{Client, StatusCode};

#[tokio::test]
async fn post_302_downgrades_to_get() {
    let _ = env_logger::try_init();

    let server = server::http(move |mut req| async move {
        match req.uri().path() {
            "/start" => {
                assert_eq!(req.method(), "POST");
                let body = req.body_mut().collect().await.unwrap().to_bytes();
                assert_eq!(&body[..], b"payload");
                http::Response::builder()
                    .status(StatusCode::FOUND)
                    .header("location", "/landing")
                    .body(Full::new(Bytes::new()))
                    .unwrap()
            }
            "/landing" => {
                assert_eq!(req.method(), "GET");
                assert!(req.headers().get("content-length").is_none());
                http::Response::new(Full::new(Bytes::from_static(b"done")))
            }
            other => panic!("unexpected path {other}"),
        }
    });

    let url = format!("http://{}/start", server.addr());
    let res = Client::new().post(&url).body("payload").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.uri().path(), "/landing");
    assert_eq!(res.text().await.unwrap(), "done");
}

#[tokio::test]
async fn temporary_redirect_replays_the_body() {
    let _ = env_logger::try_init();

    let server = server::http(move |mut req| async move {
        match req.uri().path() {
            "/first" => http::Response::builder()
                .status(StatusCode::TEMPORARY_REDIRECT)
                .header("location", "/second")
                .body(Full::new(Bytes::new()))
                .unwrap(),
            "/second" => {
                assert_eq!(req.method(), "PUT");
                let body = req.body_mut().collect().await.unwrap().to_bytes();
                assert_eq!(&body[..], b"again");
                http::Response::default()
            }
            other => panic!("unexpected path {other}"),
        }
    });

    let url = format!("http://{}/first", server.addr());
    let res = Client::new().put(&url).body("again").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn redirect_loop_is_cut_off() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        let next = match req.uri().path() {
            "/a" => "/b",
            _ => "/a",
        };
        http::Response::builder()
            .status(StatusCode::FOUND)
            .header("location", next)
            .body(Full::new(Bytes::new()))
            .unwrap()
    });

    let url = format!("http://{}/a", server.addr());
    let err = Client::new().get(&url).send().await.unwrap_err();
    assert!(err.is_redirect(), "{err:?}");
}

#[tokio::test]
async fn per_request_cap_wins() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        match req.uri().path() {
            "/hop" => http::Response::builder()
                .status(StatusCode::FOUND)
                .header("location", "/hop2")
                .body(Full::new(Bytes::new()))
                .unwrap(),
            _ => http::Response::default(),
        }
    });

    let url = format!("http://{}/hop", server.addr());
    let err = Client::new()
        .get(&url)
        .max_redirects(0)
        .send()
        .await
        .unwrap_err();
    assert!(err.is_redirect(), "{err:?}");
}
