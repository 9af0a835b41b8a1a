//! Error types for the face swap task pipeline.

/// Failure modes of a swap task, from signed-url acquisition through result
/// delivery. Every variant is fatal to the task that raised it; none is
/// retried automatically. `Cancelled` is the one silent variant: it means the
/// user discarded the conversation while the task was in flight, so no
/// failure message is shown.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SwapError {
    #[error("signed url request failed for .{extension}: {reason}")]
    SignedUrl { extension: String, reason: String },

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("task submission rejected: {0}")]
    Submission(String),

    #[error("remote job ended with status {status}")]
    JobFailed { status: String },

    #[error("polling budget exhausted after {attempts} attempts")]
    PollTimeout { attempts: u32 },

    #[error("result delivery failed: {0}")]
    Delivery(String),

    #[error("task cancelled by user")]
    Cancelled,
}
