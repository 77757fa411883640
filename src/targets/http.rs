use std::time::Duration;

use reqwest::{Client, Response, StatusCode};

use crate::error::ScanRelayError;

/// Request timeout shared by all target adapters.
pub const TARGET_TIMEOUT: Duration = Duration::from_secs(30);

/// Response bodies are read up to this many bytes and then cut off, so a
/// misbehaving server cannot balloon memory.
pub const MAX_RESPONSE_BODY: usize = 10 * 1024 * 1024;

pub fn new_client() -> Result<Client, ScanRelayError> {
    Client::builder()
        .timeout(TARGET_TIMEOUT)
        .build()
        .map_err(|e| ScanRelayError::Fatal(format!("building HTTP client: {e}")))
}

/// Maps a transport-level failure: the target did not answer at all.
pub fn transport_error(context: &str, e: reqwest::Error) -> ScanRelayError {
    ScanRelayError::TargetUnavailable(format!("{context}: {e}"))
}

/// Maps a non-2xx status at the target boundary: 401 means bad credentials
/// (fatal), 404 and server errors mean the target is down or mid-restart
/// (retryable), anything else is a client bug (fatal).
pub fn status_error(context: &str, status: StatusCode) -> ScanRelayError {
    if status == StatusCode::UNAUTHORIZED {
        ScanRelayError::Fatal(format!("{context}: invalid credentials: {status}"))
    } else if status == StatusCode::NOT_FOUND || status.is_server_error() {
        ScanRelayError::TargetUnavailable(format!("{context}: {status}"))
    } else {
        ScanRelayError::Fatal(format!("{context}: {status}"))
    }
}

/// Reads at most `MAX_RESPONSE_BODY` bytes of the response body. Anything
/// beyond the cap is discarded and the connection is closed normally.
pub async fn read_body_limited(mut response: Response) -> Result<Vec<u8>, ScanRelayError> {
    let mut body = Vec::new();

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| transport_error("reading response body", e))?
    {
        let room = MAX_RESPONSE_BODY - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            break;
        }
        body.extend_from_slice(&chunk);
    }

    Ok(body)
}
