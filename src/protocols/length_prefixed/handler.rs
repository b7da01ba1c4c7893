//! Length-prefixed packet handler.

use super::parser::{parse, ParseResult};
use crate::runtime::handler::{HandlerError, PacketHandler};
use std::fmt;
use tracing::{info, warn};

type MessageSink = Box<dyn Fn(&str) + Send + Sync>;

/// Decodes one text message per frame and logs it.
///
/// Reports the full frame length once a frame is complete and 0 while it is
/// still partial, so it never consumes part of a frame.
pub struct LengthPrefixedHandler {
    sink: Option<MessageSink>,
}

impl LengthPrefixedHandler {
    /// Log every message and do nothing else.
    pub fn logging() -> Self {
        Self { sink: None }
    }

    /// Log every message and pass it to `sink`.
    pub fn with_sink<F>(sink: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            sink: Some(Box::new(sink)),
        }
    }
}

impl Default for LengthPrefixedHandler {
    fn default() -> Self {
        Self::logging()
    }
}

impl fmt::Debug for LengthPrefixedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LengthPrefixedHandler")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl PacketHandler for LengthPrefixedHandler {
    fn handle(&self, data: &[u8]) -> Result<usize, HandlerError> {
        match parse(data) {
            ParseResult::Incomplete => Ok(0),
            ParseResult::Complete(message, consumed) => {
                info!(msg = message, "got msg");
                if let Some(sink) = &self.sink {
                    sink(message);
                }
                Ok(consumed)
            }
            ParseResult::Error(e) => {
                warn!(error = %e, "Malformed frame");
                Err(HandlerError::new(e))
            }
        }
    }
}
