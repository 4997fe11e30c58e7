use fluxion_protocol::{WorkerError, WorkerErrorCode};

/// Failures surfaced by the supervisor to its callers.
///
/// `Handler` wraps whatever the worker reported (load failures, handler
/// throws, and the coded protocol errors); the other variants originate on
/// the dispatcher side.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker overloaded: {inflight} requests in flight (limit {limit})")]
    Overloaded { inflight: usize, limit: usize },

    #[error("worker request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("runtime worker closed")]
    Closed,

    #[error("runtime worker restarted: {0}")]
    Restarted(String),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error(transparent)]
    Handler(#[from] WorkerError),
}

impl PoolError {
    /// The wire code for this failure, when it has one.
    pub fn code(&self) -> Option<WorkerErrorCode> {
        match self {
            PoolError::Overloaded { .. } => Some(WorkerErrorCode::Overloaded),
            PoolError::Timeout { .. } => Some(WorkerErrorCode::Timeout),
            PoolError::Handler(err) => err.code,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_side_failures_carry_codes() {
        let err = PoolError::Overloaded {
            inflight: 64,
            limit: 64,
        };
        assert_eq!(err.code(), Some(WorkerErrorCode::Overloaded));
        assert!(err.to_string().contains("64"));

        let err = PoolError::Timeout { timeout_ms: 3000 };
        assert_eq!(err.code(), Some(WorkerErrorCode::Timeout));
    }

    #[test]
    fn handler_failures_pass_their_code_through() {
        let inner = WorkerError::coded(WorkerErrorCode::ResponseTooLarge, "worker response too large");
        let err = PoolError::Handler(inner);
        assert_eq!(err.code(), Some(WorkerErrorCode::ResponseTooLarge));
    }

    #[test]
    fn restart_rejections_name_the_reason() {
        let err = PoolError::Restarted("memory hard limit exceeded".into());
        assert_eq!(
            err.to_string(),
            "runtime worker restarted: memory hard limit exceeded"
        );
        assert_eq!(err.code(), None);
    }
}
