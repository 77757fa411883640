pub mod atrain;
pub mod drive;
pub mod inotify;
pub mod lidarr;
pub mod manual;
pub mod radarr;
pub mod sonarr;

use std::sync::Arc;

use crate::error::ScanRelayError;
use crate::scan::Scan;

/// Callback every trigger hands its scans to — in practice
/// `Processor::add`, kept behind a closure so triggers are testable
/// without a database.
pub type ProcessorFn = Arc<dyn Fn(Vec<Scan>) -> Result<(), ScanRelayError> + Send + Sync>;
