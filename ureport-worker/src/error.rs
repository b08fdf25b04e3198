use thiserror::Error;
use ureport_common::matcher::MatchError;
use ureport_common::report::ParseError;
use ureport_common::spool::SpoolError;
use ureport_common::store::StoreError;

/// Enumeration of the ways a single claimed report can fail to reach a cluster. Only a
/// rejection is permanent, everything else is worth another attempt.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("report rejected: {0}")]
    Rejected(#[from] ParseError),
    #[error("{0}")]
    Match(#[from] MatchError),
    #[error("could not read claimed report: {0}")]
    Read(SpoolError),
}

/// Enumeration of errors that abort a whole run before any report is claimed.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("spool unavailable: {0}")]
    SpoolUnavailable(#[from] SpoolError),
    #[error("cluster storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),
}

impl From<MatchError> for PipelineError {
    fn from(error: MatchError) -> Self {
        match error {
            MatchError::StorageUnavailable(error) => PipelineError::StorageUnavailable(error),
        }
    }
}
