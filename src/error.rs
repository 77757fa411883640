use thiserror::Error;

/// Errors produced across the processor, triggers and targets.
///
/// The first four variants are behavioural: the scan loop keys its sleep and
/// retry decisions off them. Everything else carries a source and is treated
/// as fatal by the loop.
#[derive(Error, Debug)]
pub enum ScanRelayError {
    /// Not really an error: the store currently holds no eligible scans.
    #[error("no scans currently available")]
    NoScans,

    /// A target went offline or returned a retryable failure. Processing
    /// halts until the target reports available again.
    #[error("target unavailable: {0}")]
    TargetUnavailable(String),

    /// An anchor path is missing from the filesystem. Dispatch is gated
    /// until all anchors are present.
    #[error("anchor unavailable: {0}")]
    AnchorUnavailable(String),

    /// An unrecoverable problem. The affected subsystem exits.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanRelayError {
    /// True for every error the scan loop cannot recover from.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ScanRelayError::NoScans
                | ScanRelayError::TargetUnavailable(_)
                | ScanRelayError::AnchorUnavailable(_)
        )
    }
}
