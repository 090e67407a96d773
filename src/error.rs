//! Error types for the extraction pipeline.
//!
//! Errors are classified by recoverability: transport failures, throttling
//! responses, and malformed bodies are retryable inside the client's bounded
//! retry loop; join-key violations and per-account task failures are fatal
//! and carry enough context to name the account or event that caused them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status} for {url}: {message}")]
    Api {
        status: u16,
        url: String,
        message: String,
    },

    #[error("Malformed response from {url}: {detail}")]
    MalformedResponse { url: String, detail: String },

    #[error("Request to {url} exhausted {attempts} attempts: {last_error}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Join key violation: {0}")]
    JoinKeyViolation(String),

    #[error("Enrichment failed for account {account_id}: {source}")]
    AccountTask {
        account_id: i64,
        #[source]
        source: Box<CrmError>,
    },

    #[error("Attendee fetch failed for event {event_id}: {source}")]
    EventTask {
        event_id: i64,
        #[source]
        source: Box<CrmError>,
    },

    #[error("Task aborted: {0}")]
    TaskFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl CrmError {
    /// Whether the client's retry loop may re-issue the request.
    ///
    /// Malformed bodies count as retryable: the upstream API intermittently
    /// returns empty or non-JSON responses under load, and those clear up on
    /// a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            CrmError::Http(err) => err.is_timeout() || err.is_connect(),
            CrmError::Api { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            CrmError::MalformedResponse { .. } => true,
            _ => false,
        }
    }
}
