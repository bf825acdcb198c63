use std::io::ErrorKind;
use std::path::Path;

use tokio::fs;
use tracing::{debug, warn};

use crate::error::DownloadError;

/// What to do with a phase given what is already on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResumeDecision {
    AlreadyComplete,
    FetchFrom(u64),
}

/// Compares the on-disk size of `path` with `expected`.
///
/// An `expected` of zero means the length is unknown: an empty file and a partial one are
/// indistinguishable then, so the phase always restarts from the beginning.
pub(crate) async fn decide(path: &Path, expected: u64) -> Result<ResumeDecision, DownloadError> {
    let existing = match fs::metadata(path).await {
        Ok(meta) => Some(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    let Some(size) = existing else {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        return Ok(ResumeDecision::FetchFrom(0));
    };

    if expected == 0 {
        debug!(path = %path.display(), size, "Length unknown, refetching from start");
        return Ok(ResumeDecision::FetchFrom(0));
    }

    if size == expected {
        Ok(ResumeDecision::AlreadyComplete)
    } else if size > expected {
        warn!(
            path = %path.display(),
            size,
            expected,
            "On-disk file larger than expected, discarding"
        );
        fs::remove_file(path).await?;
        Ok(ResumeDecision::FetchFrom(0))
    } else {
        debug!(path = %path.display(), size, expected, "Resuming partial file");
        Ok(ResumeDecision::FetchFrom(size))
    }
}
