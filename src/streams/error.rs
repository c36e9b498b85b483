use std::{error::Error, fmt, sync::Arc};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("Stream was aborted{}", reason_suffix(.0))]
    Aborted(Option<String>),
    #[error("Stream is closing")]
    Closing,
    #[error("Stream is closed")]
    Closed,
    #[error("Stream task was dropped")]
    TaskDropped,
    #[error("Stream is locked to a writer")]
    Locked,
    #[error("Writer has been released")]
    Released,
    #[error("Invalid stream state: {0}")]
    InvalidState(&'static str),
    #[error("Invalid high water mark: {0}")]
    InvalidHighWaterMark(f64),
    #[error("Chunk sizing failed: {0}")]
    Sizing(Arc<dyn Error + Send + Sync>),
    #[error("{0}")]
    Other(Arc<dyn Error + Send + Sync>),
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(": {r}"))
        .unwrap_or_default()
}

#[derive(Debug)]
struct SimpleError(String);

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for SimpleError {}

impl StreamError {
    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// Wrap a boxed error
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }

    pub(crate) fn sizing(message: impl Into<String>) -> Self {
        StreamError::Sizing(Arc::new(SimpleError(message.into())))
    }

    /// Turn an error returned by a queuing strategy into a sizing error.
    pub(crate) fn into_sizing(self) -> Self {
        match self {
            StreamError::Sizing(_) => self,
            StreamError::Other(inner) => StreamError::Sizing(inner),
            other => StreamError::Sizing(Arc::new(other)),
        }
    }

    /// Whether two errors carry the same underlying value.
    ///
    /// Wrapped errors compare by identity, so a batch of writes rejected with
    /// the stored error can be told apart from an equal-looking fresh error.
    pub fn same_as(&self, other: &StreamError) -> bool {
        match (self, other) {
            (StreamError::Other(a), StreamError::Other(b))
            | (StreamError::Sizing(a), StreamError::Sizing(b)) => Arc::ptr_eq(a, b),
            (StreamError::Aborted(a), StreamError::Aborted(b)) => a == b,
            (StreamError::InvalidState(a), StreamError::InvalidState(b)) => a == b,
            (StreamError::InvalidHighWaterMark(a), StreamError::InvalidHighWaterMark(b)) => {
                a.to_bits() == b.to_bits()
            }
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(Arc::new(SimpleError(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(Arc::new(SimpleError(s)))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

/// Macro for users to add direct `From` implementations for their error types.
/// This allows sinks to use `?` directly without `.map_err(StreamError::other)`.
///
/// # Example
/// ```rust
/// use writable_streams::{StreamError, impl_stream_error_from};
///
/// #[derive(Debug)]
/// struct DiskFull;
///
/// impl std::fmt::Display for DiskFull {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "disk full")
///     }
/// }
///
/// impl std::error::Error for DiskFull {}
///
/// impl_stream_error_from!(DiskFull);
///
/// fn flush() -> Result<(), StreamError> {
///     Err::<(), _>(DiskFull)?;
///     Ok(())
/// }
///
/// assert!(flush().is_err());
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::streams::error::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::streams::error::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}
