use std::path::{Path, PathBuf};

use axum::Router;
use tower_http::services::{ServeDir, ServeFile};

/// Serve a frontend build directory
///
/// Unknown paths fall back to `index.html` so client-side routing works.
pub fn static_file_router<S>(dir: &Path) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let index: PathBuf = dir.join("index.html");
    if !index.exists() {
        tracing::warn!("No index.html in static directory {}", dir.display());
    }

    let service = ServeDir::new(dir)
        .append_index_html_on_directories(true)
        .fallback(ServeFile::new(index));

    Router::new().fallback_service(service)
}
