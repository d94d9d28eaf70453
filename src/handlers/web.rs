use axum::{
    http::{StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
};
use rust_embed::RustEmbed;

#[derive(RustEmbed)]
#[folder = "templates/"]
pub struct Assets;

pub async fn index_handler() -> axum::response::Response {
    match Assets::get("index.html") {
        Some(content) => ([(CONTENT_TYPE, "text/html")], content.data).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            "index.html not found in embedded assets",
        )
            .into_response(),
    }
}
