use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("executor error: {0}")]
    Executor(String),

    #[error("executor has been terminated")]
    Terminated,

    #[error("task manager has been finalized")]
    Finalized,

    #[error("task did not stop within {0:?} of cancellation")]
    CancelTimeout(Duration),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn executor<S: Into<String>>(msg: S) -> Self {
        Error::Executor(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::config("num_threads must be > 0").to_string(),
            "config error: num_threads must be > 0"
        );
        assert_eq!(
            Error::executor("spawn failed: out of threads").to_string(),
            "executor error: spawn failed: out of threads"
        );
        assert_eq!(
            Error::CancelTimeout(Duration::from_millis(5)).to_string(),
            "task did not stop within 5ms of cancellation"
        );
    }
}
