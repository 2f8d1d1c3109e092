use std::borrow::Cow;
use std::io::{self, Write};
use std::sync::LazyLock;

use regex::Regex;
use tracing_subscriber::EnvFilter;

static SECRET_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
          sk-or-v1-[A-Za-z0-9]{10,}          # OpenRouter keys
        | sk-[A-Za-z0-9_\-]{20,}             # OpenAI-style keys
        | Bearer\s+[A-Za-z0-9_\-\.]{16,}     # dumped authorization headers
        ",
    )
    .expect("secret pattern is a valid regex")
});

/// Masks API keys and bearer tokens with `[REDACTED]`.
pub fn redact_secrets(input: &str) -> Cow<'_, str> {
    SECRET_PATTERNS.replace_all(input, "[REDACTED]")
}

/// Log sink that masks secrets in every formatted record before it reaches `inner`.
///
/// The fmt layer writes one whole record per `write` call, so a secret is
/// never split across two buffers.
#[derive(Debug)]
pub struct RedactingWriter<W> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let record = String::from_utf8_lossy(buf);
        match redact_secrets(&record) {
            Cow::Borrowed(_) => self.inner.write_all(buf)?,
            Cow::Owned(masked) => self.inner.write_all(masked.as_bytes())?,
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn redacting_stderr() -> RedactingWriter<io::Stderr> {
    RedactingWriter::new(io::stderr())
}

/// Install the global tracing subscriber. `RUST_LOG` wins over `level` when set.
///
/// Returns an error if a subscriber was already installed.
pub fn init_tracing(level: &str, json: bool) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| crate::Error::Config(format!("invalid log level '{level}': {e}")))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(redacting_stderr)
        .with_target(false);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| crate::Error::Config(format!("failed to install tracing subscriber: {e}")))
}
