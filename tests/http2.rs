//! HTTP/2 session behavior, driven through the session API over
//! in-memory duplex transports and loopback sockets.

use std::time::Duration;

use http::Method;

use weft::header::HeaderMap;
use weft::proto::h2::{H2Config, Pseudo, Session, Settings};
use weft::server::{Request, ResponseWriter, Server};
use weft::{Client, Reason, StatusCode, Version};

fn pair() -> (Session, Session) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let client = Session::client(a, H2Config::default());
    let server = Session::server(b, H2Config::default(), bytes::Bytes::new());
    (client, server)
}

fn get_pseudo(path: &str) -> Pseudo {
    Pseudo::request(Method::GET, "http", "test.local", path)
}

async fn respond_ok(mut request: weft::proto::h2::PeerRequest, body: &[u8]) {
    let mut headers = HeaderMap::new();
    headers
        .insert("Content-Length", body.len().to_string())
        .unwrap();
    request
        .stream
        .send_headers(Pseudo::response(StatusCode::OK), headers, body.is_empty())
        .unwrap();
    if !body.is_empty() {
        request.stream.write(body).await.unwrap();
        request.stream.finalize().await.unwrap();
    }
}

#[tokio::test]
async fn client_stream_ids_are_odd_and_increasing() {
    let (client, server) = pair();
    tokio::spawn(async move {
        while let Some(request) = server.accept().await {
            respond_ok(request, b"ok").await;
        }
    });

    for expected in [1u32, 3, 5] {
        let mut stream = client
            .start_request(get_pseudo("/"), HeaderMap::new(), true)
            .unwrap();
        assert_eq!(stream.id(), expected);
        let (pseudo, _) = stream.read_headers().await.unwrap();
        assert_eq!(pseudo.status, Some(StatusCode::OK));
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ok");
    }
}

#[tokio::test]
async fn request_and_response_bodies_roundtrip() {
    let (client, server) = pair();
    tokio::spawn(async move {
        while let Some(mut request) = server.accept().await {
            // echo
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = request.stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            request
                .stream
                .send_headers(Pseudo::response(StatusCode::OK), HeaderMap::new(), false)
                .unwrap();
            request.stream.write(&received).await.unwrap();
            request.stream.finalize().await.unwrap();
        }
    });

    // a payload crossing many DATA frames and the 64 KiB default window
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let mut stream = client
        .start_request(
            Pseudo::request(Method::POST, "http", "test.local", "/echo"),
            HeaderMap::new(),
            false,
        )
        .unwrap();
    let sent = payload.clone();
    let mut writer = stream.clone();
    let push = tokio::spawn(async move {
        writer.write(&sent).await.unwrap();
        writer.finalize().await.unwrap();
    });

    let (pseudo, _) = stream.read_headers().await.unwrap();
    assert_eq!(pseudo.status, Some(StatusCode::OK));
    let mut echoed = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        echoed.extend_from_slice(&buf[..n]);
    }
    push.await.unwrap();
    assert_eq!(echoed.len(), payload.len());
    assert_eq!(echoed, payload, "byte-for-byte across frame boundaries");
}

#[tokio::test]
async fn flow_control_backpressures_small_windows() {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let client = Session::client(a, H2Config::default());
    let server_settings = Settings {
        initial_window_size: Some(1024),
        ..Settings::default()
    };
    let server = Session::server(
        b,
        H2Config {
            settings: server_settings,
            ..H2Config::default()
        },
        bytes::Bytes::new(),
    );

    let served = tokio::spawn(async move {
        let mut request = server.accept().await.expect("one request");
        let mut total = 0usize;
        let mut buf = [0u8; 512];
        loop {
            let n = request.stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        respond_ok(request, b"").await;
        total
    });

    let mut stream = client
        .start_request(
            Pseudo::request(Method::POST, "http", "test.local", "/slow"),
            HeaderMap::new(),
            false,
        )
        .unwrap();
    // let the settings exchange land so the 1024-octet window applies
    tokio::time::sleep(Duration::from_millis(20)).await;
    // four windows' worth: progress requires the peer to keep granting
    // credit as it consumes
    stream.write(&[0x42u8; 4096]).await.unwrap();
    stream.finalize().await.unwrap();

    let total = served.await.unwrap();
    assert_eq!(total, 4096);
    let (pseudo, _) = stream.read_headers().await.unwrap();
    assert_eq!(pseudo.status, Some(StatusCode::OK));
}

#[tokio::test]
async fn ping_measures_round_trip() {
    let (client, server) = pair();
    let server_task = tokio::spawn(async move {
        // sit on the session so PINGs are answered
        server.accept().await
    });

    let rtt = client.ping().await.unwrap();
    assert!(rtt < Duration::from_secs(1));
    // a second ping finds a clean pending table
    let rtt = client.ping().await.unwrap();
    assert!(rtt < Duration::from_secs(1));

    client.stop(Reason::NO_ERROR);
    assert!(server_task.await.unwrap().is_none());
}

#[tokio::test]
async fn goaway_refuses_new_streams_and_drains_old() {
    let (client, server) = pair();

    let server_task = tokio::spawn(async move {
        let first = server.accept().await.expect("in-flight request");
        // shutdown notice goes out while the stream is still open
        server.stop(Reason::NO_ERROR);
        tokio::time::sleep(Duration::from_millis(50)).await;
        respond_ok(first, b"late but fine").await;
    });

    let mut inflight = client
        .start_request(get_pseudo("/inflight"), HeaderMap::new(), true)
        .unwrap();

    // wait for the GOAWAY to land client-side
    tokio::time::sleep(Duration::from_millis(20)).await;
    let refused = client.start_request(get_pseudo("/late"), HeaderMap::new(), true);
    assert!(refused.is_err(), "no new streams after GOAWAY");

    // the in-flight stream still completes
    let (pseudo, _) = inflight.read_headers().await.unwrap();
    assert_eq!(pseudo.status, Some(StatusCode::OK));
    let mut body = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = inflight.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    assert_eq!(body, b"late but fine");
    server_task.await.unwrap();
}

#[tokio::test]
async fn prior_knowledge_client_against_server_engine() {
    let server = Server::builder()
        .port(0)
        .bind_address("127.0.0.1")
        .handler(|mut req: Request, mut res: ResponseWriter| async move {
            assert_eq!(req.version(), Version::HTTP_2);
            let body = req.take_body().bytes().await?;
            res.write(&body).await?;
            res.finalize().await
        })
        .start()
        .await
        .unwrap();
    let url = format!("http://{}/echo", server.local_addr().unwrap());

    let client = Client::builder().http2_prior_knowledge().build();
    let payload = "sent with prior knowledge".repeat(100);
    let response = client.post(&url).body(payload.clone()).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.version(), Version::HTTP_2);
    assert_eq!(response.text().await.unwrap(), payload);

    // the same session carries the next exchange
    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.version(), Version::HTTP_2);
    server.shutdown().await;
}

#[tokio::test]
async fn large_header_blocks_survive_continuation_splits() {
    let server = Server::builder()
        .port(0)
        .bind_address("127.0.0.1")
        .handler(|req: Request, mut res: ResponseWriter| async move {
            let blob = req.headers().get_str("x-blob").map(str::to_owned);
            res.write(blob.unwrap_or_default().as_bytes()).await?;
            res.finalize().await
        })
        .start()
        .await
        .unwrap();
    let url = format!("http://{}/", server.local_addr().unwrap());

    // far larger than one 16 KiB frame once encoded
    let blob = "h".repeat(40_000);
    let client = Client::builder().http2_prior_knowledge().build();
    let response = client
        .get(&url)
        .header("X-Blob", blob.as_str())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), blob);
    server.shutdown().await;
}

#[tokio::test]
async fn zero_length_data_with_end_stream_closes_cleanly() {
    let (client, server) = pair();
    tokio::spawn(async move {
        while let Some(mut request) = server.accept().await {
            // headers only, then an empty finalize: END_STREAM rides an
            // empty DATA frame
            request
                .stream
                .send_headers(Pseudo::response(StatusCode::OK), HeaderMap::new(), false)
                .unwrap();
            request.stream.finalize().await.unwrap();
        }
    });

    let mut stream = client
        .start_request(get_pseudo("/empty"), HeaderMap::new(), true)
        .unwrap();
    let (pseudo, _) = stream.read_headers().await.unwrap();
    assert_eq!(pseudo.status, Some(StatusCode::OK));
    let mut buf = [0u8; 8];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
}
