use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::info;
use serde_json::json;
use tokio::net::TcpListener;

use crate::config::{AuthConfig, Config};
use crate::error::ScanRelayError;
use crate::triggers::{atrain, lidarr, manual, radarr, sonarr, ProcessorFn};

/// Flipped once startup completes; the health endpoint reports
/// "initializing" until then.
pub type ReadyFlag = Arc<AtomicBool>;

/// Builds the full HTTP surface: health check plus every webhook trigger
/// under `/triggers`, with basic auth on the trigger subtree when
/// configured.
pub fn build_router(
    config: &Config,
    callback: ProcessorFn,
    ready: ReadyFlag,
) -> Result<Router, ScanRelayError> {
    let mut triggers = Router::new();

    let manual_trigger = manual::ManualTrigger::new(&config.triggers.manual, callback.clone())?;
    triggers = triggers.merge(
        Router::new()
            .route("/manual", get(manual::form).post(manual::handle))
            .with_state(manual_trigger),
    );

    let atrain_trigger = atrain::AtrainTrigger::new(&config.triggers.atrain, callback.clone())?;
    triggers = triggers.merge(
        Router::new()
            .route("/atrain/{drive}", post(atrain::handle))
            .with_state(atrain_trigger),
    );

    for trigger_config in &config.triggers.sonarr {
        let trigger = sonarr::SonarrTrigger::new(trigger_config, callback.clone())?;
        triggers = triggers.merge(
            Router::new()
                .route(&format!("/{}", trigger_config.name), post(sonarr::handle))
                .with_state(trigger),
        );
    }

    for trigger_config in &config.triggers.radarr {
        let trigger = radarr::RadarrTrigger::new(trigger_config, callback.clone())?;
        triggers = triggers.merge(
            Router::new()
                .route(&format!("/{}", trigger_config.name), post(radarr::handle))
                .with_state(trigger),
        );
    }

    for trigger_config in &config.triggers.lidarr {
        let trigger = lidarr::LidarrTrigger::new(trigger_config, callback.clone())?;
        triggers = triggers.merge(
            Router::new()
                .route(&format!("/{}", trigger_config.name), post(lidarr::handle))
                .with_state(trigger),
        );
    }

    if config.auth.enabled() {
        let auth = Arc::new(config.auth.clone());
        triggers = triggers.layer(middleware::from_fn_with_state(auth, basic_auth));
    }

    let router = Router::new()
        .route("/health", get(health).with_state(ready))
        .nest("/triggers", triggers);

    Ok(router)
}

/// Binds and serves on one address; runs until the process exits.
pub async fn serve(addr: SocketAddr, router: Router) -> Result<(), ScanRelayError> {
    info!("Server starting on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ScanRelayError::Fatal(format!("binding {addr}: {e}")))?;

    axum::serve(listener, router)
        .await
        .map_err(|e| ScanRelayError::Fatal(format!("server on {addr}: {e}")))
}

async fn health(State(ready): State<ReadyFlag>) -> Response {
    if ready.load(Ordering::Relaxed) {
        (StatusCode::OK, Json(json!({"status": "ready"}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "initializing"})),
        )
            .into_response()
    }
}

async fn basic_auth(
    State(auth): State<Arc<AuthConfig>>,
    request: Request,
    next: Next,
) -> Response {
    if credentials_match(&auth, request.headers().get(header::AUTHORIZATION)) {
        return next.run(request).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"scanrelay\"")],
    )
        .into_response()
}

fn credentials_match(auth: &AuthConfig, header: Option<&axum::http::HeaderValue>) -> bool {
    let value = match header.and_then(|h| h.to_str().ok()) {
        Some(value) => value,
        None => return false,
    };

    let encoded = match value.strip_prefix("Basic ") {
        Some(encoded) => encoded,
        None => return false,
    };

    let decoded = match BASE64.decode(encoded) {
        Ok(decoded) => decoded,
        Err(_) => return false,
    };

    let expected = format!("{}:{}", auth.username, auth.password);
    decoded == expected.as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn auth() -> AuthConfig {
        AuthConfig {
            username: "user".into(),
            password: "pass".into(),
        }
    }

    fn header_for(user: &str, pass: &str) -> HeaderValue {
        let encoded = BASE64.encode(format!("{user}:{pass}"));
        HeaderValue::from_str(&format!("Basic {encoded}")).unwrap()
    }

    #[test]
    fn test_valid_credentials() {
        let header = header_for("user", "pass");
        assert!(credentials_match(&auth(), Some(&header)));
    }

    #[test]
    fn test_wrong_password() {
        let header = header_for("user", "nope");
        assert!(!credentials_match(&auth(), Some(&header)));
    }

    #[test]
    fn test_missing_header() {
        assert!(!credentials_match(&auth(), None));
    }

    #[test]
    fn test_malformed_header() {
        let header = HeaderValue::from_static("Bearer token");
        assert!(!credentials_match(&auth(), Some(&header)));

        let header = HeaderValue::from_static("Basic !!!not-base64!!!");
        assert!(!credentials_match(&auth(), Some(&header)));
    }
}
