use std::future::Future;
use std::time::Duration;

use harmonia_common::{Error, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Caller cancellation plus an optional deadline for one turn.
///
/// Every suspension point in a turn (reading the next fragment, running a
/// tool) goes through [`TurnGuard::run`], so either signal unwinds the turn
/// with [`Error::Cancelled`].
#[derive(Debug, Clone)]
pub struct TurnGuard {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl TurnGuard {
    pub fn new(token: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            token,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// A guard that never fires.
    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    /// Fail fast if the turn is already cancelled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(cancelled_by_caller());
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(deadline_exceeded());
        }
        Ok(())
    }

    /// Drive `fut` to completion unless cancellation or the deadline comes first.
    /// The future is dropped on interruption, which aborts any in-flight I/O.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(cancelled_by_caller()),
            _ = deadline => Err(deadline_exceeded()),
            output = fut => Ok(output),
        }
    }
}

fn cancelled_by_caller() -> Error {
    Error::Cancelled("turn cancelled by caller".to_string())
}

fn deadline_exceeded() -> Error {
    Error::Cancelled("turn deadline exceeded".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_through_when_not_cancelled() {
        let guard = TurnGuard::unbounded();
        assert_eq!(guard.run(async { 7 }).await.unwrap(), 7);
        assert!(guard.check().is_ok());
    }

    #[tokio::test]
    async fn token_interrupts_pending_future() {
        let token = CancellationToken::new();
        let guard = TurnGuard::new(token.clone(), None);
        token.cancel();
        let err = guard
            .run(std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(guard.check().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_slow_future() {
        let guard = TurnGuard::new(CancellationToken::new(), Some(Duration::from_secs(5)));
        let err = guard
            .run(tokio::time::sleep(Duration::from_secs(60)))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cancelled: turn deadline exceeded");
    }
}
