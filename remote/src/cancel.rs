/// Stop signal shared by all tasks of one operation, remembering why it was raised.
///
/// The first cause wins; later calls to [`CancelScope::cancel`] only make sure the token is
/// canceled.
#[derive(Clone, Debug, Default)]
pub struct CancelScope {
    token: tokio_util::sync::CancellationToken,
    cause: std::sync::Arc<std::sync::Mutex<Option<String>>>,
}

impl CancelScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, cause: impl std::fmt::Display) {
        {
            let mut current = self
                .cause
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if current.is_none() {
                *current = Some(format!("{cause:#}"));
            }
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn token(&self) -> &tokio_util::sync::CancellationToken {
        &self.token
    }

    pub fn cause_message(&self) -> String {
        self.cause
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "operation canceled".to_string())
    }

    pub fn cause(&self) -> anyhow::Error {
        anyhow::anyhow!(self.cause_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_cause_wins() {
        let scope = CancelScope::new();
        assert!(!scope.is_cancelled());
        let clone = scope.clone();
        clone.cancel(anyhow::anyhow!("disk full").context("writing foo"));
        scope.cancel("second");
        scope.cancelled().await;
        assert!(scope.is_cancelled());
        assert_eq!(scope.cause().to_string(), "writing foo: disk full");
    }

    #[test]
    fn default_cause() {
        let scope = CancelScope::new();
        scope.token().cancel();
        assert_eq!(scope.cause_message(), "operation canceled");
    }
}
