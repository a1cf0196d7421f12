/// Captive portal detection routes
///
/// Operating systems probe well-known URLs to detect captivity. Each
/// probe redirects to the authorization form, preserving the probed URL
/// in the `continue` parameter so the guest lands back where the OS
/// expects after authorization.
use crate::context::AppContext;
use axum::{
    extract::OriginalUri,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};

/// Probe paths by platform: Android, Windows, Apple, Firefox
pub const DETECTION_PATHS: [&str; 7] = [
    "/generate_204",
    "/gen_204",
    "/connecttest.txt",
    "/ncsi.txt",
    "/hotspot-detect.html",
    "/library/test/success.html",
    "/success.txt",
];

/// Build detection routes
pub fn routes() -> Router<AppContext> {
    let mut router = Router::new();
    for path in DETECTION_PATHS {
        router = router.route(path, get(redirect_to_portal));
    }
    router
}

async fn redirect_to_portal(OriginalUri(uri): OriginalUri) -> impl IntoResponse {
    let original: String = url::form_urlencoded::byte_serialize(uri.to_string().as_bytes()).collect();
    let target = format!("/guest/authorize?continue={}", original);
    (StatusCode::FOUND, [(header::LOCATION, target)])
}
