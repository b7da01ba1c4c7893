//! Packet handler contract.
//!
//! A session offers its unread bytes to a [`PacketHandler`] after every
//! receive, and keeps offering them until the handler reports that no complete
//! unit is left. The handler only ever reads the region it is given; it tells
//! the session how much to consume through its return value.

use std::error::Error;
use std::fmt;

/// Delimits and consumes whole messages from a session's receive buffer.
///
/// Implementations are shared by every session of a listener, so they must be
/// `Send + Sync`.
pub trait PacketHandler: Send + Sync {
    /// Handle the bytes in `data` and return how many were processed.
    ///
    /// `data` is the session's readable region. Return `Ok(0)` when no
    /// complete unit is present yet, or `Ok(n)` with `n <= data.len()` after
    /// consuming exactly one unit. Calling again over the same unread bytes
    /// must be safe.
    ///
    /// An `Err` is a handler fault: the session logs it, tears down and
    /// surfaces it to whoever awaits the session task.
    fn handle(&self, data: &[u8]) -> Result<usize, HandlerError>;
}

/// Failure raised by a packet handler.
pub struct HandlerError {
    inner: Box<dyn Error + Send + Sync>,
}

impl HandlerError {
    /// Wrap any error type.
    pub fn new<E>(err: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self { inner: err.into() }
    }

    /// Borrow the underlying error.
    pub fn get_ref(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.inner
    }

    /// Attempt to downcast to a concrete error type.
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl Error for HandlerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source()
    }
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        Self::new(msg)
    }
}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        Self::new(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Fixed(usize);

    impl PacketHandler for Fixed {
        fn handle(&self, data: &[u8]) -> Result<usize, HandlerError> {
            if data.len() < self.0 {
                Ok(0)
            } else {
                Ok(self.0)
            }
        }
    }

    #[derive(Debug)]
    struct Custom;

    impl fmt::Display for Custom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("custom failure")
        }
    }

    impl Error for Custom {}

    #[test]
    fn test_shared_handler_reports_consumption() {
        let handler: Arc<dyn PacketHandler> = Arc::new(Fixed(3));
        assert_eq!(handler.handle(b"ab").unwrap(), 0);
        assert_eq!(handler.handle(b"abcd").unwrap(), 3);
    }

    #[test]
    fn test_handler_error_from_string() {
        let err = HandlerError::from("bad frame");
        assert_eq!(err.to_string(), "bad frame");
    }

    #[test]
    fn test_handler_error_downcast() {
        let err = HandlerError::new(Custom);
        assert!(err.downcast_ref::<Custom>().is_some());
        assert_eq!(err.to_string(), "custom failure");
    }
}
