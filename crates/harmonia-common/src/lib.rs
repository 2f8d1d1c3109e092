pub mod conversation;
pub mod error;
pub mod logging;

pub use conversation::{ConversationConfig, ReasoningEffort, ToolConfig};
pub use error::{Error, Result};
pub use logging::{RedactingWriter, init_tracing, redact_secrets};
