//! HTTP/1.x end-to-end behavior: framing, keep-alive, limits and error
//! pages, driven over real loopback sockets.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use weft::server::{Request, ResponseWriter, Server};
use weft::{Client, StatusCode, Version};

fn client_h1() -> Client {
    Client::builder().http1_only().build()
}

#[tokio::test]
async fn get_with_connection_close_against_raw_server() {
    // a hand-rolled peer, so the exact wire bytes are ours to assert
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = sock.read(&mut buf).await.unwrap();
        seen2.lock().unwrap().extend_from_slice(&buf[..n]);
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        sock.shutdown().await.unwrap();
    });

    let response = client_h1()
        .get(&format!("http://{addr}/x"))
        .connection_close()
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.version(), Version::HTTP_11);
    assert_eq!(response.content_length(), Some(5));

    let mut body = response.into_body();
    let mut out = [0u8; 16];
    let n = body.read(&mut out).await.unwrap();
    assert_eq!(&out[..n], b"hello");
    assert_eq!(body.read(&mut out).await.unwrap(), 0, "clean end of body");

    let request_bytes = seen.lock().unwrap().clone();
    let request = String::from_utf8(request_bytes).unwrap();
    assert!(request.starts_with("GET /x HTTP/1.1\r\n"), "{request}");
    assert!(request.contains("Connection: close\r\n"), "{request}");
    assert!(request.to_lowercase().contains("host:"), "{request}");
}

#[tokio::test]
async fn chunked_post_then_reuse() {
    let observed = Arc::new(Mutex::new(Vec::new()));
    let peers = observed.clone();
    let server = Server::builder()
        .port(0)
        .bind_address("127.0.0.1")
        .handler(move |mut req: Request, mut res: ResponseWriter| {
            let peers = peers.clone();
            async move {
                peers.lock().unwrap().push(req.peer_addr());
                let body = req.take_body().bytes().await?;
                assert_eq!(&body[..], b"Hello World");
                res.set_status(StatusCode::NO_CONTENT);
                res.finalize().await
            }
        })
        .start()
        .await
        .unwrap();
    let url = format!("http://{}/upload", server.local_addr().unwrap());

    let client = client_h1();
    let (sender, builder) = client.post(&url).body_channel();
    let pending = tokio::spawn(async move { builder.send().await });
    sender.send("Hello").await.unwrap();
    sender.send(" World").await.unwrap();
    sender.finish();
    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    drop(response);

    // a second exchange goes out on the pooled connection
    let second = client.post(&url).body("Hello World").send().await.unwrap();
    assert_eq!(second.status(), StatusCode::NO_CONTENT);

    let peers = observed.lock().unwrap().clone();
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[0], peers[1], "both requests shared one connection");
    server.shutdown().await;
}

#[tokio::test]
async fn keep_alive_runs_many_requests_on_one_connection() {
    // the client's ephemeral port as the server sees it is the telltale:
    // one socket means one peer address across every exchange
    let observed = Arc::new(Mutex::new(Vec::new()));
    let peers = observed.clone();
    let server = Server::builder()
        .port(0)
        .bind_address("127.0.0.1")
        .handler(move |mut req: Request, mut res: ResponseWriter| {
            let peers = peers.clone();
            async move {
                peers.lock().unwrap().push(req.peer_addr());
                let body = req.take_body().bytes().await?;
                res.headers_mut()
                    .insert("Content-Length", body.len().to_string())
                    .unwrap();
                res.write(&body).await?;
                res.finalize().await
            }
        })
        .start()
        .await
        .unwrap();
    let url = format!("http://{}/echo", server.local_addr().unwrap());
    let client = client_h1();

    for i in 0..5 {
        let payload = format!("request number {i}");
        let response = client.post(&url).body(payload.clone()).send().await.unwrap();
        let text = response.text().await.unwrap();
        assert_eq!(text, payload);
    }

    let peers = observed.lock().unwrap().clone();
    assert_eq!(peers.len(), 5);
    assert!(
        peers.windows(2).all(|w| w[0] == w[1]),
        "all five requests rode one transport connection: {peers:?}"
    );
    server.shutdown().await;
}

#[tokio::test]
async fn handler_error_becomes_error_page() {
    let server = Server::builder()
        .port(0)
        .bind_address("127.0.0.1")
        .handler(|_req: Request, _res: ResponseWriter| async move {
            Err(weft::Error::status_code(
                StatusCode::NOT_FOUND,
                "no such route",
            ))
        })
        .start()
        .await
        .unwrap();
    let url = format!("http://{}/missing", server.local_addr().unwrap());

    let response = client_h1().get(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let text = response.text().await.unwrap();
    assert!(text.contains("404 Not Found"), "{text}");
    assert!(text.contains("no such route"), "{text}");
    server.shutdown().await;
}

#[tokio::test]
async fn redirects_follow_same_origin_only() {
    let server = Server::builder()
        .port(0)
        .bind_address("127.0.0.1")
        .handler(|req: Request, mut res: ResponseWriter| async move {
            match req.path() {
                "/a" => res.redirect("/b", StatusCode::FOUND).await,
                "/b" => {
                    res.write(b"made it").await?;
                    res.finalize().await
                }
                "/away" => {
                    res.redirect("http://other.invalid/", StatusCode::MOVED_PERMANENTLY)
                        .await
                }
                _ => {
                    res.set_status(StatusCode::NOT_FOUND);
                    res.finalize().await
                }
            }
        })
        .start()
        .await
        .unwrap();
    let base = format!("http://{}", server.local_addr().unwrap());
    let client = client_h1();

    let response = client.get(&format!("{base}/a")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.url().path(), "/b");
    assert_eq!(response.text().await.unwrap(), "made it");

    // cross-origin: the 3xx surfaces untouched
    let response = client.get(&format!("{base}/away")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        response.headers().get_str("location"),
        Some("http://other.invalid/")
    );
    server.shutdown().await;
}

#[tokio::test]
async fn oversized_body_is_rejected_with_413() {
    let server = Server::builder()
        .port(0)
        .bind_address("127.0.0.1")
        .max_request_size(64)
        .handler(|mut req: Request, mut res: ResponseWriter| async move {
            let _ = req.take_body().bytes().await?;
            res.finalize().await
        })
        .start()
        .await
        .unwrap();
    let url = format!("http://{}/upload", server.local_addr().unwrap());

    let response = client_h1()
        .post(&url)
        .body(vec![0x61u8; 1024])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    server.shutdown().await;
}

#[tokio::test]
async fn head_response_carries_no_body() {
    let server = Server::builder()
        .port(0)
        .bind_address("127.0.0.1")
        .handler(|_req: Request, mut res: ResponseWriter| async move {
            res.headers_mut().insert("Content-Length", "5").unwrap();
            res.write(b"hello").await?;
            res.finalize().await
        })
        .start()
        .await
        .unwrap();
    let url = format!("http://{}/thing", server.local_addr().unwrap());

    let response = client_h1().head(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.content_length(), Some(5));
    let body = response.bytes().await.unwrap();
    assert!(body.is_empty(), "HEAD body must be dropped silently");
    server.shutdown().await;
}

#[tokio::test]
async fn vhosts_dispatch_by_host_header() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let server = Server::builder()
        .port(0)
        .bind_address("127.0.0.1")
        .handler(|_req: Request, mut res: ResponseWriter| async move {
            res.write(b"default").await?;
            res.finalize().await
        })
        .vhost("files.example", move |_req: Request, mut res: ResponseWriter| {
            let hits = hits2.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                res.write(b"files").await?;
                res.finalize().await
            }
        })
        .start()
        .await
        .unwrap();
    let url = format!("http://{}/", server.local_addr().unwrap());
    let client = client_h1();

    let text = client
        .get(&url)
        .header("Host", "files.example")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(text, "files");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let text = client.get(&url).send().await.unwrap().text().await.unwrap();
    assert_eq!(text, "default");
    server.shutdown().await;
}

#[tokio::test]
async fn streamed_chunked_response_arrives_in_order() {
    let server = Server::builder()
        .port(0)
        .bind_address("127.0.0.1")
        .handler(|_req: Request, mut res: ResponseWriter| async move {
            // no content-length: the engine picks chunked and each flush
            // emits one chunk
            res.write_head().await?;
            for part in ["alpha ", "beta ", "gamma"] {
                res.write(part.as_bytes()).await?;
                res.flush().await?;
            }
            res.finalize().await
        })
        .start()
        .await
        .unwrap();
    let url = format!("http://{}/stream", server.local_addr().unwrap());

    let response = client_h1().get(&url).send().await.unwrap();
    assert_eq!(
        response.headers().get_str("transfer-encoding"),
        Some("chunked")
    );
    assert_eq!(response.text().await.unwrap(), "alpha beta gamma");
    server.shutdown().await;
}
