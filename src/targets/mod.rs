pub mod emby;
pub mod http;
pub mod plex;
pub mod relay;

use async_trait::async_trait;

use crate::error::ScanRelayError;
use crate::scan::Scan;

/// A media-server adapter the processor dispatches scans to.
///
/// Both operations classify failures into the behavioural error kinds:
/// `TargetUnavailable` for outages the scan loop should wait out, `Fatal`
/// for misconfiguration (bad credentials, unsupported server).
#[async_trait]
pub trait Target: Send + Sync {
    /// Short name for logging, e.g. `plex`.
    fn name(&self) -> &str;

    /// Asks the target to scan the given folder (or file within it).
    async fn scan(&self, scan: &Scan) -> Result<(), ScanRelayError>;

    /// Reports whether the target is currently reachable and healthy.
    async fn available(&self) -> Result<(), ScanRelayError>;
}
