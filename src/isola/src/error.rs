/// The error type for isola operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum IsolaError {
    /// The caller supplied bad configuration or a malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A non-blocking push found the stream at capacity.
    #[error("stream is full")]
    StreamFull,

    /// The stream has ended; no further pushes are accepted.
    #[error("stream is closed")]
    StreamClosed,

    /// The per-sandbox timeout elapsed while the guest was running.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The run was terminated by the host (close, drop, or explicit kill).
    #[error("execution canceled by host")]
    Canceled,

    /// The guest raised an exception that terminated the call.
    #[error("guest aborted: {0}")]
    GuestAborted(String),

    /// Any unexpected engine failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// The Result of an isola operation.
pub type Result<T> = std::result::Result<T, IsolaError>;

impl IsolaError {
    /// Shorthand for an [`IsolaError::Internal`] with a formatted message.
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        IsolaError::Internal(message.into())
    }

    /// Shorthand for an [`IsolaError::InvalidArgument`] with a formatted message.
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        IsolaError::InvalidArgument(message.into())
    }
}

impl From<anyhow::Error> for IsolaError {
    fn from(err: anyhow::Error) -> Self {
        // Traps raised by the epoch callback carry their cause through the
        // anyhow chain; recover it so timeouts and kills keep their code.
        for cause in err.chain() {
            if let Some(err) = cause.downcast_ref::<IsolaError>() {
                return match err {
                    IsolaError::DeadlineExceeded => IsolaError::DeadlineExceeded,
                    IsolaError::Canceled => IsolaError::Canceled,
                    other => IsolaError::Internal(other.to_string()),
                };
            }
        }
        IsolaError::Internal(format!("{err:#}"))
    }
}

impl From<wasmtime::Error> for IsolaError {
    fn from(err: wasmtime::Error) -> Self {
        // Traps raised by the epoch callback carry their cause through the
        // wasmtime error chain; recover it so timeouts and kills keep their code.
        for cause in err.chain() {
            if let Some(err) = cause.downcast_ref::<IsolaError>() {
                return match err {
                    IsolaError::DeadlineExceeded => IsolaError::DeadlineExceeded,
                    IsolaError::Canceled => IsolaError::Canceled,
                    other => IsolaError::Internal(other.to_string()),
                };
            }
        }
        IsolaError::Internal(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for IsolaError {
    fn from(err: serde_json::Error) -> Self {
        IsolaError::Internal(format!("json conversion failure: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_cause_survives_anyhow_chain() {
        let trap = anyhow::Error::new(IsolaError::DeadlineExceeded).context("wasm trap");
        assert!(matches!(
            IsolaError::from(trap),
            IsolaError::DeadlineExceeded
        ));

        let kill = anyhow::Error::new(IsolaError::Canceled).context("wasm trap");
        assert!(matches!(IsolaError::from(kill), IsolaError::Canceled));
    }

    #[test]
    fn plain_anyhow_becomes_internal() {
        let err = IsolaError::from(anyhow::anyhow!("boom"));
        assert!(matches!(err, IsolaError::Internal(msg) if msg.contains("boom")));
    }
}
