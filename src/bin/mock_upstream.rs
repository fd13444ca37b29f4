use axum::{
    Json, Router,
    extract::Path,
    http::StatusCode,
    response::Html,
    routing::{get, post},
};
use rand::RngCore;
use serde_json::json;
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let app = Router::new()
        .route(
            "/api/organizations/{org}/chat_conversations",
            post(create_conversation).get(list_conversations),
        )
        .route("/", get(home_page))
        .route("/build/app.js", get(asset));

    let addr = SocketAddr::from(([127, 0, 0, 1], 8080));
    tracing::info!("Mock chat upstream listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!("Failed to bind to {}: {}", addr, e);
        e
    })?;

    axum::serve(listener, app).await.map_err(|e| {
        tracing::error!("Server error: {}", e);
        e
    })?;

    Ok(())
}

fn random_id() -> String {
    let mut raw = [0u8; 16];
    rand::rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

async fn create_conversation(Path(org): Path<String>) -> (StatusCode, Json<serde_json::Value>) {
    tracing::info!(org, "conversation created");
    (
        StatusCode::CREATED,
        Json(json!({"uuid": random_id(), "name": "New chat"})),
    )
}

async fn list_conversations(Path(org): Path<String>) -> Json<serde_json::Value> {
    tracing::info!(org, "conversations listed");
    Json(json!([
        {"uuid": "11111111-aaaa", "name": "Weekend plans"},
        {"uuid": "22222222-bbbb", "name": "Rust questions"},
    ]))
}

async fn home_page() -> Html<&'static str> {
    Html(
        "<html><head><title>Chat</title></head>\
         <body>Signed in as owner@example.com</body></html>",
    )
}

async fn asset() -> ([(&'static str, &'static str); 1], &'static str) {
    ([("content-type", "application/javascript")], "console.log('app');")
}
