use std::time::Duration;

use thiserror::Error;

/// Ask the scheduler to re-enqueue the key after `delay`.
///
/// This is control flow, not failure: the framework patches whatever status
/// the pass accumulated, logs the reason at info level, and re-enqueues
/// without counting the pass against error back-off.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RequeueError {
    pub message: String,
    #[source]
    pub wrapped: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub delay: Duration,
}

impl RequeueError {
    pub fn after(delay: Duration, message: impl Into<String>) -> RequeueError {
        RequeueError {
            message: message.into(),
            wrapped: None,
            delay,
        }
    }

    pub fn wrapping(
        delay: Duration,
        message: impl Into<String>,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> RequeueError {
        RequeueError {
            message: message.into(),
            wrapped: Some(Box::new(err)),
            delay,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api request failed: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Definitions(#[from] etcdcat_definitions::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ssh session failed: {0}")]
    Ssh(#[from] async_ssh2_tokio::Error),

    #[error("'{command}' exited with status {status}: {stderr}")]
    RemoteCommand {
        command: String,
        status: u32,
        stderr: String,
    },

    #[error("health probe failed: {0}")]
    Probe(#[from] reqwest::Error),

    #[error("status of {kind} '{owner}' references foreign object '{found}', expected '{expected}'")]
    ForeignReference {
        kind: &'static str,
        owner: String,
        expected: String,
        found: String,
    },

    #[error("'{0}' is not a usable cluster name")]
    InvalidName(String),

    #[error("replicas must be at least 1, got {0}")]
    InvalidReplicas(i32),

    #[error("{kind} '{name}' has not been assigned a uid yet")]
    MissingUid { kind: String, name: String },

    #[error("{kind} '{name}' is not namespaced")]
    MissingNamespace { kind: String, name: String },

    #[error("secret '{secret}' is missing data key '{key}'")]
    MissingSecretKey { secret: String, key: String },

    #[error("secret '{secret}' key '{key}' is not valid utf-8")]
    SecretNotUtf8 { secret: String, key: String },

    #[error("environment variable {var} holds unusable value '{value}'")]
    InvalidConfig { var: String, value: String },

    #[error("rolling update bound '{0}' is neither an integer nor a percentage")]
    InvalidRollingUpdate(String),

    #[error(transparent)]
    Requeue(#[from] RequeueError),
}

impl Error {
    /// Transient-not-found: a dependency exists conceptually but has not
    /// landed in the store yet. Short delay, no back-off.
    pub fn waiting_for(what: &str) -> Error {
        Error::Requeue(RequeueError::after(
            Duration::from_secs(1),
            format!("waiting for {} prepared", what),
        ))
    }

    pub fn requeue(delay: Duration, message: impl Into<String>) -> Error {
        Error::Requeue(RequeueError::after(delay, message))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_errors_carry_their_delay() {
        let err = Error::requeue(Duration::from_secs(5), "waiting for vm running");
        match err {
            Error::Requeue(rq) => {
                assert_eq!(rq.delay, Duration::from_secs(5));
                assert_eq!(rq.message, "waiting for vm running");
            }
            other => panic!("expected requeue, got {}", other),
        }
    }

    #[test]
    fn waiting_for_spells_out_the_dependency() {
        match Error::waiting_for("cluster service") {
            Error::Requeue(rq) => assert_eq!(rq.message, "waiting for cluster service prepared"),
            other => panic!("expected requeue, got {}", other),
        }
    }
}
