use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by a turn loop and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// Network failure, non-2xx status or a malformed envelope from the endpoint.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response was well-formed but carried no choices.
    #[error("error {code}: {message}")]
    EmptyResponse { code: u16, message: String },

    /// The model asked for a call type the runtime cannot execute.
    #[error("unsupported tool call type '{0}'")]
    UnsupportedToolCall(String),

    /// The model kept stopping without an answer or a tool call.
    #[error("stopped with empty response")]
    EmptyStop { attempts: u32 },

    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A tool failed while running. Folded into the conversation, never fatal to a turn.
    #[error("tool error: {0}")]
    Tool(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for intentional aborts, which callers usually keep out of error displays.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Build the error for a response that carried zero choices. Falls back to
    /// `500 server error` when the server did not say anything more specific.
    pub fn empty_response(code: Option<u16>, message: Option<String>) -> Self {
        Error::EmptyResponse {
            code: code.unwrap_or(500),
            message: message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "server error".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_response_defaults() {
        let err = Error::empty_response(None, None);
        assert_eq!(err.to_string(), "error 500: server error");

        let err = Error::empty_response(Some(429), Some("rate limited".into()));
        assert_eq!(err.to_string(), "error 429: rate limited");
    }

    #[test]
    fn empty_stop_message() {
        let err = Error::EmptyStop { attempts: 4 };
        assert_eq!(err.to_string(), "stopped with empty response");
        assert!(!err.is_cancelled());
    }

    #[test]
    fn cancelled_is_distinguishable() {
        assert!(Error::Cancelled("user abort".into()).is_cancelled());
        assert!(!Error::Transport("status=500".into()).is_cancelled());
    }
}
