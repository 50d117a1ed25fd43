//! Task-local identity of the caller a workflow runs on behalf of.
//!
//! The HTTP middleware scopes each request with [`scope`]; the
//! [`TaskExecutor`](crate::executor::TaskExecutor) re-scopes background
//! tasks with the subject that was current when they were submitted.

use std::future::Future;

/// User identity plus the credential used to reach the API on their behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
    pub token: Option<String>,
}

impl Subject {
    pub fn new(id: impl Into<String>, token: Option<String>) -> Self {
        Self {
            id: id.into(),
            token,
        }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous", None)
    }
}

tokio::task_local! {
    static CURRENT_SUBJECT: Subject;
}

/// Returns the current subject, or [`Subject::anonymous`] outside any scope.
pub fn current() -> Subject {
    CURRENT_SUBJECT
        .try_with(Subject::clone)
        .unwrap_or_else(|_| Subject::anonymous())
}

/// Runs `fut` with `subject` as the current subject.
pub async fn scope<F: Future>(subject: Subject, fut: F) -> F::Output {
    CURRENT_SUBJECT.scope(subject, fut).await
}
