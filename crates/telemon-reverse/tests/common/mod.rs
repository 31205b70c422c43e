#![allow(dead_code)]

use axum::routing::get;
use axum::Router;
use std::sync::OnceLock;
use std::time::Duration;

pub fn ensure_rustls_provider() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

pub const RUN_BODY: &str = r#"{"x":1}"#;

pub fn big_body() -> Vec<u8> {
    let mut body = Vec::with_capacity(200_000);
    while body.len() < 200_000 {
        body.extend_from_slice(b"0123456789abcdef");
    }
    body.truncate(200_000);
    body
}

/// Local metrics endpoint standing in for the agent's own HTTP server.
pub async fn spawn_metrics_server() -> String {
    let app = Router::new()
        .route("/run", get(|| async { RUN_BODY }))
        .route("/big", get(|| async { big_body() }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                "late"
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}
