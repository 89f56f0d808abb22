use super::*;

#[test]
fn job_status_as_str_is_lowercase() {
    assert_eq!(JobStatus::Pending.as_str(), "pending");
    assert_eq!(JobStatus::Processing.as_str(), "processing");
    assert_eq!(JobStatus::Completed.as_str(), "completed");
    assert_eq!(JobStatus::Failed.as_str(), "failed");
    assert_eq!(JobStatus::Skipped.as_str(), "skipped");
}

#[test]
fn job_status_display_matches_as_str() {
    for status in [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Skipped,
    ] {
        assert_eq!(status.to_string(), status.as_str());
    }
}

#[test]
fn terminal_states() {
    assert!(!JobStatus::Pending.is_terminal());
    assert!(!JobStatus::Processing.is_terminal());
    assert!(JobStatus::Completed.is_terminal());
    assert!(JobStatus::Failed.is_terminal());
    assert!(JobStatus::Skipped.is_terminal());
}
