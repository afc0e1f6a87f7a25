//! The web client's entry page.
//!
//! `index.html` is read on every request so a rebuilt bundle shows up without
//! a restart. The save-slot toggle is baked in from configuration.

use crate::server::state::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use tracing::warn;

const CUSTOM_SAVES_QUERY: &str =
    r#"new URLSearchParams(window.location.search).get("custom_saves") === "1""#;

/// Cross-origin isolation for `SharedArrayBuffer` in the browser.
const CROSS_ORIGIN_HEADERS: [(&str, &str); 2] = [
    ("cross-origin-opener-policy", "same-origin"),
    ("cross-origin-embedder-policy", "require-corp"),
];

/// Replace the client-side `custom_saves` query check with a constant.
pub fn render_shell(content: &str, custom_saves: bool) -> String {
    let flag = if custom_saves { "1" } else { "0" };
    content.replace(CUSTOM_SAVES_QUERY, &format!(r#""{}" === "1""#, flag))
}

pub async fn serve_index(State(state): State<AppState>) -> Response {
    let index = state.config.dist_dir.join("index.html");
    match tokio::fs::read_to_string(&index).await {
        Ok(content) => (
            CROSS_ORIGIN_HEADERS,
            Html(render_shell(&content, state.config.custom_saves)),
        )
            .into_response(),
        Err(e) => {
            warn!("Cannot read {}: {}", index.display(), e);
            (StatusCode::NOT_FOUND, "index.html not found").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<script>const saves = new URLSearchParams(window.location.search).get("custom_saves") === "1";</script>"#;

    #[test]
    fn bakes_in_enabled_flag() {
        let rendered = render_shell(PAGE, true);
        assert!(rendered.contains(r#"const saves = "1" === "1";"#));
        assert!(!rendered.contains("URLSearchParams"));
    }

    #[test]
    fn bakes_in_disabled_flag() {
        let rendered = render_shell(PAGE, false);
        assert!(rendered.contains(r#"const saves = "0" === "1";"#));
    }

    #[test]
    fn leaves_other_content_alone() {
        let page = "<html><body>vice city</body></html>";
        assert_eq!(render_shell(page, true), page);
    }
}
