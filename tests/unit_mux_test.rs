use axum::Router;
use axum::extract::ConnectInfo;
use axum::routing::get;
use beskar::mtls;
use beskar::mux::{ClientConn, MuxListener, PeekStream};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::test]
async fn test_peek_stream_replays_first_byte() {
    let (mut client, server) = tokio::io::duplex(64);
    client.write_all(b"ello world").await.unwrap();

    // The multiplexer consumed b'h' while peeking; the wrapper re-delivers
    // it ahead of the stream without loss.
    let mut peeked = PeekStream::new(server, Some(b'h'), None);
    let mut buf = vec![0u8; 11];
    peeked.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello world");
}

#[tokio::test]
async fn test_peek_stream_surfaces_deferred_error() {
    let (_client, server) = tokio::io::duplex(64);
    let mut peeked = PeekStream::new(
        server,
        None,
        Some(std::io::Error::other("peek blew up")),
    );
    let mut buf = [0u8; 4];
    let err = peeked.read(&mut buf).await.unwrap_err();
    assert!(err.to_string().contains("peek blew up"));
}

/// One port serves plaintext HTTP and TLS side by side, with TLS installed
/// only after the cluster CA exists.
#[tokio::test]
async fn test_multiplexed_plaintext_and_tls() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mux = MuxListener::new(listener);
    let tls_slot = mux.tls_slot();

    let app = Router::new().route(
        "/",
        get(|ConnectInfo(conn): ConnectInfo<ClientConn>| async move {
            if conn.is_tls() { "tls" } else { "plain" }
        }),
    );
    tokio::spawn(async move {
        axum::serve(mux, app.into_make_service_with_connect_info::<ClientConn>())
            .await
            .unwrap();
    });

    // Before the CA arrives, the port serves plaintext.
    let body = reqwest::get(format!("http://{addr}/"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "plain");

    // Install the cluster TLS configuration.
    let ca = mtls::generate_ca().unwrap();
    let identity = mtls::issue_identity(
        &ca,
        "localhost",
        vec!["localhost".to_string(), "127.0.0.1".to_string()],
    )
    .unwrap();
    tls_slot.install(Arc::new(mtls::server_config(&ca, &identity).unwrap()));

    // A TLS ClientHello (first byte 0x16) now lands on the TLS stack.
    let client = reqwest::Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .add_root_certificate(reqwest::Certificate::from_pem(ca.cert_pem.as_bytes()).unwrap())
        .build()
        .unwrap();
    let body = client
        .get(format!("https://127.0.0.1:{}/", addr.port()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "tls");

    // Plaintext keeps working on the same port after the switch.
    let body = reqwest::get(format!("http://{addr}/"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "plain");
}
