/// Shared error type used across all tether crates.
///
/// The first block of variants is the reliability taxonomy: each one has a
/// fixed recovery policy (see the variant docs). The rest are plumbing.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The terminal session could not be started or reached. Fatal for the
    /// current request; the caller gets an apology.
    #[error("session unavailable: {0}")]
    SessionUnavailable(String),

    /// The arbiter could not be acquired within its wait bound.
    #[error("session busy: {0}")]
    SessionBusy(String),

    /// A turn exceeded its hard deadline.
    #[error("response timeout: {0}")]
    ResponseTimeout(String),

    /// The memory service is unreachable or the breaker is open. Always
    /// recovered locally (degraded context, outbox retry).
    #[error("memory worker unreachable: {0}")]
    WorkerUnreachable(String),

    /// The job queue is at capacity; the triggering job is dropped.
    #[error("job queue full: {0}")]
    QueueFull(String),

    /// A capture exhausted its delivery attempts.
    #[error("max retries exceeded for capture {id} after {retries} attempt(s)")]
    MaxRetriesExceeded { id: i64, retries: u32 },

    /// The extracted text looks like leaked tool/shell output rather than a
    /// reply. Suppressed, never sent to a chat surface.
    #[error("garbage response suppressed: {0}")]
    GarbageResponse(String),

    #[error("store: {0}")]
    Store(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the failure is transient from the memory service's point of
    /// view (network, timeout, 5xx). Permanent errors (4xx, auth) are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::Timeout(_) | Error::WorkerUnreachable(_)
        )
    }

    /// Short text shown to an end user when a turn cannot be completed.
    /// `None` means the failure is invisible to the user.
    pub fn user_apology(&self) -> Option<&'static str> {
        match self {
            Error::SessionUnavailable(_) => Some(
                "Sorry, I can't reach my workspace right now. Please try again in a minute.",
            ),
            Error::SessionBusy(_) => {
                Some("Sorry, I'm still busy with something else. Please try again shortly.")
            }
            Error::ResponseTimeout(_) => {
                Some("Sorry, that took too long and I had to stop. Please try again.")
            }
            Error::WorkerUnreachable(_) | Error::GarbageResponse(_) => None,
            _ => Some("Sorry, something went wrong while handling that."),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
