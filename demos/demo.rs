use accesslog::{AccessLogConfig, AccessLogControls, AccessLogLayer};
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use std::{net::SocketAddr, time::Duration};
use tokio::{net::TcpListener, time::sleep};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

// Demo handlers
async fn login_handler(Json(_credentials): Json<Value>) -> impl IntoResponse {
    sleep(Duration::from_millis(20)).await; // Simulate some work
    Json(json!({ "name": "peter", "age": 12 }))
}

async fn echo_handler(body: Bytes) -> impl IntoResponse {
    format!("Echo: {}", String::from_utf8_lossy(&body))
}

async fn streaming_handler() -> impl IntoResponse {
    use futures::stream;
    use tokio::time::interval;

    let stream = stream::unfold(0u32, |count| async move {
        if count >= 5 {
            None
        } else {
            let mut interval = interval(Duration::from_millis(200));
            interval.tick().await;
            Some((
                Ok::<_, std::convert::Infallible>(Bytes::from(format!("chunk-{count}\n"))),
                count + 1,
            ))
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn large_handler() -> impl IntoResponse {
    // bigger than the capture limit, logged as too large
    "x".repeat(8192)
}

async fn health_handler(State(controls): State<AccessLogControls>) -> impl IntoResponse {
    Json(controls.health())
}

async fn toggle_handler(
    State(controls): State<AccessLogControls>,
    Path((side, state)): Path<(String, String)>,
) -> impl IntoResponse {
    let on = state == "on";
    match side.as_str() {
        "request" => controls.set_request_body(on),
        "response" => controls.set_response_body(on),
        _ => return Json(json!({ "error": format!("unknown side {side}") })),
    }
    info!(side = %side, on, "Body capture toggled");
    Json(json!({
        "request_body": controls.request_body(),
        "response_body": controls.response_body(),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    info!("Starting access log demo server");

    let layer = AccessLogLayer::new(AccessLogConfig {
        filename: "./access/demo.log".into(),
        request_body: true,
        response_body: true,
        ..AccessLogConfig::default()
    })?;
    let controls = layer.controls();

    let logged = Router::new()
        .route("/login", post(login_handler))
        .route("/echo", post(echo_handler))
        .route("/streaming", get(streaming_handler))
        .route("/large", get(large_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(layer)
                .into_inner(),
        );

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/capture/{side}/{state}", put(toggle_handler))
        .with_state(controls.clone())
        .merge(logged);

    info!("Demo server endpoints:");
    info!("  POST /login                    - JSON login, body captured");
    info!("  POST /echo                     - Echo request body");
    info!("  GET  /streaming                - Streaming response");
    info!("  GET  /large                    - Response above the capture limit");
    info!("  GET  /health                   - Writer queue depth");
    info!("  PUT  /capture/{{side}}/{{state}}   - Toggle request/response capture");
    info!("");
    info!("Try these commands:");
    info!("  curl -X POST -H 'content-type: application/json' -d '{{\"user\": \"admin\"}}' http://localhost:3000/login");
    info!("  curl -X PUT http://localhost:3000/capture/response/off");
    info!("  curl http://localhost:3000/health");
    info!("  tail -f ./access/demo.log");

    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    info!("Demo server listening on http://localhost:3000");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    info!("Draining access log");
    controls.flush().await?;

    Ok(())
}
