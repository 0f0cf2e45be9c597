mod support;

use http_body_util::BodyExt;
use support::server;

use courier::{multipart, Client};

#[tokio::test]
async fn text_part() {
    let _ = env_logger::try_init();

    let form = multipart::Form::new().text("foo", "bar");

    let expected_body = format!(
        "\
         --{0}\r\n\
         Content-Disposition: form-data; name=\"foo\"\r\n\r\n\
         bar\r\n\
         --{0}--\r\n\
         ",
        form.boundary()
    );

    let ct = format!("multipart/form-data; boundary={}", form.boundary());

    let server = server::http(move |mut req| {
        let ct = ct.clone();
        let expected_body = expected_body.clone();
        async move {
            assert_eq!(req.method(), "POST");
            assert_eq!(req.headers()["content-type"], ct);
            // multipart bodies are streamed with chunked transfer encoding
            assert!(req.headers().get("content-length").is_none());

            let full = req.body_mut().collect().await.unwrap().to_bytes();
            assert_eq!(full, expected_body.as_bytes());

            http::Response::default()
        }
    });

    let url = format!("http://{}/multipart/1", server.addr());

    let res = Client::new()
        .post(&url)
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(res.uri().to_string(), url);
    assert_eq!(res.status(), courier::StatusCode::OK);
}

#[tokio::test]
async fn file_and_text_parts() {
    let _ = env_logger::try_init();

    let path = std::env::temp_dir().join(format!("courier-mp-{}.txt", std::process::id()));
    std::fs::write(&path, b"file payload bytes").unwrap();

    let form = multipart::Form::new()
        .text("key1", "value1")
        .file("file", path.clone());

    let boundary = form.boundary().to_string();
    let file_name = path.file_name().unwrap().to_string_lossy().into_owned();

    let server = server::http(move |mut req| {
        let boundary = boundary.clone();
        let file_name = file_name.clone();
        async move {
            let ct = req.headers()["content-type"].to_str().unwrap().to_string();
            assert!(ct.contains(&boundary));

            let full = req.body_mut().collect().await.unwrap().to_bytes();
            let body = String::from_utf8_lossy(&full).into_owned();
            assert!(body.contains("name=\"key1\"\r\n\r\nvalue1"));
            assert!(body.contains(&format!(
                "name=\"file\"; filename=\"{file_name}\""
            )));
            assert!(body.contains("file payload bytes"));
            assert!(body.ends_with(&format!("--{boundary}--\r\n")));

            http::Response::default()
        }
    });

    let url = format!("http://{}/multipart/2", server.addr());
    let res = Client::new()
        .post(&url)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), courier::StatusCode::OK);

    std::fs::remove_file(&path).ok();
}
