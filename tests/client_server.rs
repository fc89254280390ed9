//! Cross-cutting client/server scenarios: version negotiation via the
//! cleartext upgrade, cookie round-trips and graceful shutdown.

use weft::server::{Request, ResponseWriter, Server};
use weft::{Client, StatusCode, Version};

async fn start_echo() -> Server {
    Server::builder()
        .port(0)
        .bind_address("127.0.0.1")
        .handler(|mut req: Request, mut res: ResponseWriter| async move {
            let body = req.take_body().bytes().await?;
            res.headers_mut()
                .insert("X-Proto", format!("{:?}", req.version()))
                .unwrap();
            res.write(&body).await?;
            res.finalize().await
        })
        .start()
        .await
        .expect("server starts")
}

#[tokio::test]
async fn h2c_upgrade_switches_the_connection() {
    let server = start_echo().await;
    let url = format!("http://{}/one", server.local_addr().unwrap());
    let client = Client::new();

    // the first GET carries `Upgrade: h2c`; the response must come back
    // on stream 1 of the new session
    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.version(), Version::HTTP_2);
    assert_eq!(
        response.headers().get_str("x-proto"),
        Some("HTTP/2.0"),
        "server side served the upgraded request over http2"
    );
    drop(response);

    // subsequent requests multiplex onto the same session
    let response = client.post(&url).body("after upgrade").send().await.unwrap();
    assert_eq!(response.version(), Version::HTTP_2);
    assert_eq!(response.text().await.unwrap(), "after upgrade");
    server.shutdown().await;
}

#[tokio::test]
async fn upgrade_disabled_stays_on_http1() {
    let server = start_echo().await;
    let url = format!("http://{}/plain", server.local_addr().unwrap());

    let client = Client::builder().disable_cleartext_upgrade().build();
    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.version(), Version::HTTP_11);

    let response = client.post(&url).body("still h1").send().await.unwrap();
    assert_eq!(response.version(), Version::HTTP_11);
    assert_eq!(response.text().await.unwrap(), "still h1");
    server.shutdown().await;
}

#[tokio::test]
async fn server_with_http2_disabled_refuses_the_dance() {
    let server = Server::builder()
        .port(0)
        .bind_address("127.0.0.1")
        .disable_http2()
        .handler(|_req: Request, mut res: ResponseWriter| async move {
            res.write(b"h1 only").await?;
            res.finalize().await
        })
        .start()
        .await
        .unwrap();
    let url = format!("http://{}/x", server.local_addr().unwrap());

    let response = Client::new().get(&url).send().await.unwrap();
    assert_eq!(response.version(), Version::HTTP_11);
    assert_eq!(response.text().await.unwrap(), "h1 only");
    server.shutdown().await;
}

#[tokio::test]
async fn cookies_round_trip_through_the_jar() {
    let server = Server::builder()
        .port(0)
        .bind_address("127.0.0.1")
        .handler(|req: Request, mut res: ResponseWriter| async move {
            match req.path() {
                "/login" => {
                    res.set_cookie(&weft::cookie::Cookie::new("sid", "s3cret").with_path("/"));
                    res.finalize().await
                }
                _ => {
                    let sid = req.cookie("sid").unwrap_or("none").to_owned();
                    res.write(sid.as_bytes()).await?;
                    res.finalize().await
                }
            }
        })
        .start()
        .await
        .unwrap();
    let base = format!("http://{}", server.local_addr().unwrap());

    let client = Client::builder().cookie_store(true).build();
    let login = client.get(&format!("{base}/login")).send().await.unwrap();
    assert_eq!(login.cookies().len(), 1);
    assert_eq!(login.cookies()[0].name(), "sid");
    drop(login);

    let text = client
        .get(&format!("{base}/whoami"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(text, "s3cret");
    server.shutdown().await;
}

#[tokio::test]
async fn graceful_shutdown_completes() {
    let server = start_echo().await;
    let url = format!("http://{}/bye", server.local_addr().unwrap());

    let client = Client::new();
    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    drop(response);

    // in-flight work is done; shutdown must resolve promptly
    tokio::time::timeout(std::time::Duration::from_secs(5), server.shutdown())
        .await
        .expect("graceful shutdown finished");
}

#[tokio::test]
async fn default_client_shortcut_works() {
    let server = start_echo().await;
    let url = format!("http://{}/top", server.local_addr().unwrap());
    let response = weft::get(&url).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    server.shutdown().await;
}
