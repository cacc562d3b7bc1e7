use thiserror::Error;

/// Why a snapshot was refused before upload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot is not a JSON object")]
    NotAnObject,
    #[error("required field '{0}' is missing or empty")]
    MissingField(&'static str),
    #[error("'performers' is not a list")]
    PerformersNotList,
    #[error("performer_count {declared} does not match {actual} performers")]
    CountMismatch { declared: u64, actual: usize },
    #[error("serialised snapshot too small ({0} chars)")]
    TooSmall(usize),
    #[error("snapshot does not round-trip: {0}")]
    RoundTrip(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// No listing produced a single program; the site layout has likely changed.
    #[error("no programs found in any EPG listing")]
    NoPrograms,
    #[error("no detail page reachable for {event_id} ({attempts} URLs tried)")]
    Fetch { event_id: String, attempts: usize },
}
