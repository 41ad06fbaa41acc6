//! Auxiliary HTTP server
//!
//! Health and statistics endpoints for monitoring, a player page for shared
//! links, and a range-aware proxy that streams objects out of the bucket.
//! The proxy only serves signed, unexpired links.

use crate::app::AppContext;
use crate::bot::handlers::ACTIVE_USER_WINDOW;
use crate::bot::links::decode_player_target;
use crate::signing::LinkError;
use crate::storage::{ObjectStream, StorageError};
use crate::utils::{format_duration, human_bytes, MediaKind};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

/// Build the router with all routes bound to `ctx`.
pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/player/{kind}/{encoded}", get(player_handler))
        .route("/stream/{*key}", get(stream_handler))
        .with_state(ctx)
}

/// Start the web server on `0.0.0.0:port`.
///
/// # Errors
///
/// Returns an error if the port cannot be bound or the server fails.
pub async fn start_web_server(port: u16, ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(ctx);

    info!("Starting web server on http://{}", addr);
    info!("  /health             - Health check (JSON)");
    info!("  /stats              - Usage statistics (JSON)");
    info!("  /player/:type/:url  - Media player page");
    info!("  /stream/*key        - Streaming proxy");

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index_handler(State(ctx): State<Arc<AppContext>>) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Wasabi file bot</title></head>\
         <body><h1>Wasabi file bot</h1>\
         <p>Uptime: {}</p>\
         <ul><li><a href=\"/health\">/health</a></li><li><a href=\"/stats\">/stats</a></li></ul>\
         </body></html>",
        format_duration(ctx.stats.uptime())
    ))
}

async fn health_handler(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let stats = &ctx.stats;
    let uptime = stats.uptime();
    Json(json!({
        "status": "ok",
        "uptime_seconds": uptime.as_secs(),
        "uptime_human": format_duration(uptime),
        "bucket": ctx.bucket(),
        "total_uploads": stats.uploads(),
        "total_downloads": stats.downloads(),
        "active_transfers": stats.active_transfers(),
        "last_error": stats.last_error(),
    }))
}

async fn stats_handler(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let stats = &ctx.stats;
    Json(json!({
        "tracked_users": ctx.limiter.tracked_users(),
        "active_users": ctx.limiter.active_users(ACTIVE_USER_WINDOW),
        "max_file_size": human_bytes(ctx.settings.max_file_size),
        "rate_limit": format!("{} requests/minute", ctx.limiter.max_requests()),
        "total_operations": stats.uploads() + stats.downloads(),
        "registry_entries": ctx.registry.len(),
        "uptime": format_duration(stats.uptime()),
    }))
}

async fn player_handler(Path((kind, encoded)): Path<(String, String)>) -> Response {
    let Some(target) = decode_player_target(&encoded) else {
        return (StatusCode::BAD_REQUEST, "Invalid media URL").into_response();
    };
    Html(render_player(MediaKind::from_segment(&kind), &target)).into_response()
}

fn render_player(kind: MediaKind, target: &str) -> String {
    let src = html_escape::encode_double_quoted_attribute(target);
    let body = match kind {
        MediaKind::Video => format!(
            "<video controls autoplay playsinline preload=\"metadata\" src=\"{src}\"></video>"
        ),
        MediaKind::Audio => format!("<audio controls autoplay src=\"{src}\"></audio>"),
        MediaKind::File => String::new(),
    };
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>Player</title>\
         <style>body{{margin:0;background:#111;color:#eee;font-family:sans-serif;text-align:center}}\
         video,audio{{width:100%;max-height:90vh;margin-top:2vh}}a{{color:#6cf}}</style></head>\
         <body>{body}<p><a href=\"{src}\" download>Download</a></p></body></html>"
    )
}

/// Query string of a signed stream link
#[derive(Debug, Deserialize)]
struct StreamAuth {
    expires: Option<i64>,
    sig: Option<String>,
}

async fn stream_handler(
    State(ctx): State<Arc<AppContext>>,
    Path(key): Path<String>,
    Query(auth): Query<StreamAuth>,
    headers: HeaderMap,
) -> Response {
    let (Some(expires), Some(sig)) = (auth.expires, auth.sig.as_deref()) else {
        return (StatusCode::FORBIDDEN, "Missing link signature").into_response();
    };
    match ctx
        .signer
        .verify(&key, expires, sig, chrono::Utc::now().timestamp())
    {
        Ok(()) => {}
        Err(LinkError::Expired) => return (StatusCode::GONE, "Link expired").into_response(),
        Err(LinkError::BadSignature) => {
            warn!(key = %key, "Rejected stream request with a bad signature");
            return (StatusCode::FORBIDDEN, "Invalid link signature").into_response();
        }
    }

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match ctx.storage.open_stream(&key, range.clone()).await {
        Ok(object) => proxy_response(object),
        Err(StorageError::NotFound(_)) => {
            warn!(key = %key, "Stream requested for missing object");
            (StatusCode::NOT_FOUND, "File not found").into_response()
        }
        Err(e) => {
            error!(key = %key, range = ?range, "Streaming failed: {e}");
            ctx.stats.set_last_error(format!("stream proxy: {e}"));
            (StatusCode::INTERNAL_SERVER_ERROR, "Storage error").into_response()
        }
    }
}

fn proxy_response(object: ObjectStream) -> Response {
    let status = if object.content_range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut response = Response::builder().status(status);
    if let Some(headers) = response.headers_mut() {
        let content_type = object
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");
        insert_header(headers, header::CONTENT_TYPE, content_type);
        insert_header(
            headers,
            header::ACCEPT_RANGES,
            object.accept_ranges.as_deref().unwrap_or("bytes"),
        );
        if let Some(len) = object.content_length {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }
        if let Some(range) = object.content_range.as_deref() {
            insert_header(headers, header::CONTENT_RANGE, range);
        }
    }

    let body = Body::from_stream(ReaderStream::new(object.body.into_async_read()));
    response.body(body).unwrap_or_else(|e| {
        error!("Failed to build stream response: {e}");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

fn insert_header(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::links::encode_player_target;
    use crate::storage::MockStorageProvider;
    use aws_sdk_s3::primitives::ByteStream;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(storage: MockStorageProvider) -> Router {
        router(Arc::new(AppContext::new(
            Arc::new(crate::config::test_settings()),
            Arc::new(storage),
        )))
    }

    /// Signed with the key `test_settings` yields
    fn signed(key: &str, expires: i64) -> String {
        let sig = crate::signing::StreamSigner::new(b"secret").sign(key, expires);
        format!("/stream/{key}?expires={expires}&sig={sig}")
    }

    fn tomorrow() -> i64 {
        chrono::Utc::now().timestamp() + 86_400
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn health_reports_bucket_and_counters() {
        let response = app(MockStorageProvider::new())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value =
            serde_json::from_str(&body_string(response).await).expect("json");
        assert_eq!(json["status"], "ok");
        assert_eq!(json["bucket"], "test-bucket");
        assert_eq!(json["total_uploads"], 0);
        assert!(json["last_error"].is_null());
    }

    #[tokio::test]
    async fn stats_reports_limits() {
        let response = app(MockStorageProvider::new())
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let json: serde_json::Value =
            serde_json::from_str(&body_string(response).await).expect("json");
        assert_eq!(json["rate_limit"], "30 requests/minute");
        assert_eq!(json["max_file_size"], "10.00 GB");
        assert_eq!(json["tracked_users"], 0);
    }

    #[tokio::test]
    async fn player_page_embeds_decoded_url() {
        let target = "https://s3.wasabisys.com/b/user_1/clip.mp4?a=1&b=2";
        let uri = format!("/player/video/{}", encode_player_target(target));
        let response = app(MockStorageProvider::new())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let html = body_string(response).await;
        assert!(html.contains("<video"));
        assert!(html.contains("clip.mp4?a=1&amp;b=2"));
    }

    #[tokio::test]
    async fn player_rejects_bad_encoding() {
        let response = app(MockStorageProvider::new())
            .oneshot(
                Request::builder()
                    .uri("/player/audio/not-base64!")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stream_forwards_range_and_returns_partial_content() {
        let mut storage = MockStorageProvider::new();
        storage
            .expect_open_stream()
            .withf(|key, range| key == "user_1/clip.mp4" && range.as_deref() == Some("bytes=0-4"))
            .returning(|_, _| {
                Ok(ObjectStream {
                    body: ByteStream::from_static(b"hello"),
                    content_length: Some(5),
                    content_type: Some("video/mp4".to_string()),
                    content_range: Some("bytes 0-4/100".to_string()),
                    accept_ranges: Some("bytes".to_string()),
                })
            });

        let response = app(storage)
            .oneshot(
                Request::builder()
                    .uri(signed("user_1/clip.mp4", tomorrow()))
                    .header(header::RANGE, "bytes=0-4")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).and_then(|v| v.to_str().ok()),
            Some("bytes 0-4/100")
        );
        assert_eq!(body_string(response).await, "hello");
    }

    #[tokio::test]
    async fn stream_missing_object_is_404() {
        let mut storage = MockStorageProvider::new();
        storage
            .expect_open_stream()
            .returning(|key, _| Err(StorageError::NotFound(key.to_string())));

        let response = app(storage)
            .oneshot(
                Request::builder()
                    .uri(signed("user_1/gone.bin", tomorrow()))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stream_rejects_unsigned_forged_and_expired_links() {
        // No storage expectations: a rejected request must not reach the bucket
        let app = app(MockStorageProvider::new());

        let cases = [
            ("/stream/user_1/clip.mp4".to_string(), StatusCode::FORBIDDEN),
            (
                signed("user_1/clip.mp4", tomorrow()).replace("user_1", "user_2"),
                StatusCode::FORBIDDEN,
            ),
            (
                signed("user_1/clip.mp4", chrono::Utc::now().timestamp() - 10),
                StatusCode::GONE,
            ),
        ];
        for (uri, expected) in cases {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(&uri).body(Body::empty()).expect("request"))
                .await
                .expect("response");
            assert_eq!(response.status(), expected, "{uri}");
        }
    }
}
