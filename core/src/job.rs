use serde::{Deserialize, Serialize};

/// Lifecycle of a scheduled retry job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Registered, waiting for an explicit start.
    Prepare,
    /// Firing on its trigger.
    Running,
    /// Stopped by an operator or by shutdown.
    Stopped,
}

/// Snapshot of a job held by a scheduler backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Backend-internal job name (naming detail, not a key).
    pub job_name: String,
    /// Job group.
    pub group: String,
    /// Handler identity.
    pub identity: String,
    /// Handler display name.
    pub name: String,
    /// Cron expression, or the interval in seconds.
    pub period: String,
    /// Current status.
    pub status: JobStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&JobStatus::Prepare).unwrap(), "\"PREPARE\"");
        let back: JobStatus = serde_json::from_str("\"STOPPED\"").unwrap();
        assert_eq!(back, JobStatus::Stopped);
    }
}
