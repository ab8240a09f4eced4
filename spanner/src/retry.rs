use std::iter::Take;

use cloud_gax::grpc::{Code, Status};
use cloud_gax::retry::{CodePredicate, ExponentialBackoff, Predicate, Retry, RetrySetting, TryAs};

pub(crate) fn is_session_not_found(status: &Status) -> bool {
    status.code() == Code::NotFound && status.message().contains("Session not found")
}

/// Decides which transaction failures are worth running the unit of work again.
pub struct TransactionPredicate {
    inner: CodePredicate,
}

impl<E> Predicate<E> for TransactionPredicate
where
    E: TryAs<Status>,
{
    fn should_retry(&mut self, error: &E) -> bool {
        let status = match error.try_as() {
            Some(s) => s,
            None => return false,
        };
        let code = status.code();
        if code == Code::Internal
            && !status.message().contains("stream terminated by RST_STREAM")
            && !status.message().contains("HTTP/2 error code: INTERNAL_ERROR")
            && !status.message().contains("Connection closed with unknown cause")
            && !status
                .message()
                .contains("Received unexpected EOS on DATA frame from server")
        {
            return false;
        }
        // the unit of work runs again on a new session
        if is_session_not_found(status) {
            return true;
        }
        self.inner.should_retry(error)
    }
}

#[derive(Clone, Debug)]
pub struct TransactionRetrySetting {
    pub inner: RetrySetting,
}

impl<E> Retry<E, TransactionPredicate> for TransactionRetrySetting
where
    E: TryAs<Status>,
{
    fn strategy(&self) -> Take<ExponentialBackoff> {
        self.inner.backoff()
    }

    fn predicate(&self) -> TransactionPredicate {
        TransactionPredicate {
            inner: CodePredicate::new(self.inner.codes.clone()),
        }
    }
}

impl TransactionRetrySetting {
    pub fn new(codes: Vec<Code>) -> Self {
        let inner = RetrySetting {
            codes,
            ..Default::default()
        };
        Self { inner }
    }

    /// Caps the number of retries; the first attempt is not counted.
    pub fn with_max_retries(mut self, take: usize) -> Self {
        self.inner.take = take;
        self
    }
}

impl Default for TransactionRetrySetting {
    fn default() -> Self {
        TransactionRetrySetting::new(vec![Code::Aborted])
    }
}

/// Backoff state for hand written retry loops around a `TransactionManager`.
pub struct TransactionRetry {
    strategy: Take<ExponentialBackoff>,
    predicate: TransactionPredicate,
}

impl TransactionRetry {
    pub fn new() -> Self {
        Self::with_setting(TransactionRetrySetting::default())
    }

    pub fn with_setting(setting: TransactionRetrySetting) -> Self {
        Self {
            strategy: setting.inner.backoff(),
            predicate: TransactionPredicate {
                inner: CodePredicate::new(setting.inner.codes),
            },
        }
    }

    /// Sleeps before the next attempt, or gives the error back when it is not
    /// retryable or the retries are exhausted.
    pub async fn next<E>(&mut self, err: E) -> Result<(), E>
    where
        E: TryAs<Status>,
    {
        if !self.predicate.should_retry(&err) {
            return Err(err);
        }
        match self.strategy.next() {
            Some(duration) => {
                tracing::debug!("retrying transaction after {:?}", duration);
                tokio::time::sleep(duration).await;
                Ok(())
            }
            None => Err(err),
        }
    }
}

impl Default for TransactionRetry {
    fn default() -> Self {
        Self::new()
    }
}
