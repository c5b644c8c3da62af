//! Debug web page: answers every path with a page that prints hub messages

use axum::{extract::State, response::Html, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const INDEX_HTML: &str = include_str!("../assets/index.html");
const WS_PORT_PLACEHOLDER: &str = "__WS_PORT__";

/// The index page pointed at the consumer WebSocket port
pub fn render_index(ws_port: u16) -> String {
    INDEX_HTML.replace(WS_PORT_PLACEHOLDER, &ws_port.to_string())
}

pub fn router(ws_port: u16) -> Router {
    let page: Arc<str> = render_index(ws_port).into();
    Router::new()
        .fallback(index_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(page)
}

async fn index_handler(State(page): State<Arc<str>>) -> Html<String> {
    Html(page.to_string())
}
