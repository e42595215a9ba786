use axum::{
    body::Body,
    http::{Request, Uri},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use tracing::Instrument;
use tracing::field::Empty;

/// Run the request inside a span carrying the route and, when the URI names
/// one, the analysis or space it concerns.
pub async fn request_span(req: Request<Body>, next: Next) -> Response {
    let uri = req.uri();
    let span = tracing::info_span!(
        "request",
        method = %req.method(),
        path = %uri.path(),
        analysis_id = Empty,
        space_id = Empty,
    );
    if let Some(id) = analysis_id(uri) {
        span.record("analysis_id", id);
    }
    if let Some(id) = space_id(uri) {
        span.record("space_id", id);
    }

    next.run(req).instrument(span).await
}

fn analysis_id(uri: &Uri) -> Option<&str> {
    uri.query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("id="))
        .filter(|id| !id.is_empty())
}

fn space_id(uri: &Uri) -> Option<&str> {
    uri.path()
        .strip_prefix("/api/get-space/")
        .map(|rest| rest.trim_end_matches('/'))
        .filter(|id| !id.is_empty())
}

/// Redirect `/path/` to `/path`, keeping the query string. The root path
/// is passed through.
pub async fn strip_trailing_slash(req: Request<Body>, next: Next) -> Response {
    let uri = req.uri();

    match trimmed_location(uri) {
        Some(location) => Redirect::permanent(&location).into_response(),
        None => next.run(req).await,
    }
}

fn trimmed_location(uri: &Uri) -> Option<String> {
    let path = uri.path();
    if path == "/" {
        return None;
    }
    let trimmed = path.strip_suffix('/')?;
    Some(match uri.query() {
        Some(query) => format!("{trimmed}?{query}"),
        None => trimmed.to_string(),
    })
}
