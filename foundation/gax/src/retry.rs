use std::future::Future;
use std::iter::Take;
use std::time::Duration;

use rand::Rng;
use tokio::select;

use crate::cancel::CancellationToken;
use crate::grpc::{Code, Status};

/// Exponential backoff: each delay is `current * factor`, and `current` is multiplied by
/// `base` after every step. Delays are capped at `max_delay` when set.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: u64,
    base: u64,
    factor: u64,
    max_delay: Option<Duration>,
    jitter: bool,
}

impl ExponentialBackoff {
    pub fn from_millis(base: u64) -> ExponentialBackoff {
        ExponentialBackoff {
            current: base,
            base,
            factor: 1u64,
            max_delay: None,
            jitter: false,
        }
    }

    pub fn factor(mut self, factor: u64) -> ExponentialBackoff {
        self.factor = factor;
        self
    }

    pub fn max_delay(mut self, duration: Duration) -> ExponentialBackoff {
        self.max_delay = Some(duration);
        self
    }

    /// Scales every delay by a random ratio in `[0.5, 1.0)`.
    pub fn jitter(mut self, jitter: bool) -> ExponentialBackoff {
        self.jitter = jitter;
        self
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        // set delay duration by applying factor
        let mut duration = match self.current.checked_mul(self.factor) {
            Some(millis) => Duration::from_millis(millis),
            None => Duration::from_millis(u64::MAX),
        };

        // check if we reached max delay
        if let Some(max_delay) = self.max_delay {
            if duration > max_delay {
                duration = max_delay;
            }
        }

        self.current = self.current.checked_mul(self.base).unwrap_or(u64::MAX);

        if self.jitter {
            let ratio: f64 = rand::thread_rng().gen_range(0.5..1.0);
            duration = duration.mul_f64(ratio);
        }
        Some(duration)
    }
}

pub trait TryAs<T> {
    fn try_as(&self) -> Option<&T>;
}

impl TryAs<Status> for Status {
    fn try_as(&self) -> Option<&Status> {
        Some(self)
    }
}

pub trait Predicate<E> {
    fn should_retry(&mut self, error: &E) -> bool;
}

pub trait Retry<E: TryAs<Status>, T: Predicate<E>> {
    fn strategy(&self) -> Take<ExponentialBackoff>;
    fn predicate(&self) -> T;
}

pub struct CodePredicate {
    codes: Vec<Code>,
}

impl CodePredicate {
    pub fn new(codes: Vec<Code>) -> Self {
        Self { codes }
    }
}

impl<E> Predicate<E> for CodePredicate
where
    E: TryAs<Status>,
{
    fn should_retry(&mut self, error: &E) -> bool {
        match error.try_as() {
            Some(status) => self.codes.contains(&status.code()),
            None => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetrySetting {
    pub from_millis: u64,
    pub max_delay: Option<Duration>,
    pub factor: u64,
    /// Maximum number of retries. The first attempt is not counted.
    pub take: usize,
    pub jitter: bool,
    pub codes: Vec<Code>,
}

impl RetrySetting {
    pub fn backoff(&self) -> Take<ExponentialBackoff> {
        let mut backoff = ExponentialBackoff::from_millis(self.from_millis)
            .factor(self.factor)
            .jitter(self.jitter);
        if let Some(max_delay) = self.max_delay {
            backoff = backoff.max_delay(max_delay);
        }
        backoff.take(self.take)
    }
}

impl Retry<Status, CodePredicate> for RetrySetting {
    fn strategy(&self) -> Take<ExponentialBackoff> {
        self.backoff()
    }

    fn predicate(&self) -> CodePredicate {
        CodePredicate::new(self.codes.clone())
    }
}

impl Default for RetrySetting {
    fn default() -> Self {
        Self {
            from_millis: 10,
            max_delay: Some(Duration::from_secs(1)),
            factor: 1u64,
            take: 5,
            jitter: false,
            codes: vec![Code::Unavailable, Code::Unknown, Code::Aborted],
        }
    }
}

pub async fn invoke<A, R, RT, C, E>(
    cancel: Option<CancellationToken>,
    retry: Option<RT>,
    mut f: impl FnMut() -> A,
) -> Result<R, E>
where
    E: TryAs<Status> + From<Status>,
    A: Future<Output = Result<R, E>>,
    C: Predicate<E>,
    RT: Retry<E, C> + Default,
{
    let fn_loop = async {
        let retry = retry.unwrap_or_default();
        let mut strategy = retry.strategy();
        let mut predicate = retry.predicate();
        loop {
            let err = match f().await {
                Ok(s) => return Ok(s),
                Err(e) => e,
            };
            if !predicate.should_retry(&err) {
                return Err(err);
            }
            match strategy.next() {
                None => return Err(err),
                Some(duration) => {
                    tracing::trace!("retrying after {:?}", duration);
                    tokio::time::sleep(duration).await
                }
            };
        }
    };

    match cancel {
        Some(cancel) => {
            select! {
                _ = cancel.cancelled() => Err(Status::cancelled("client cancel").into()),
                v = fn_loop => v
            }
        }
        None => fn_loop.await,
    }
}

/// Repeats retries when the specified error is detected.
/// The argument specified by 'v' can be reused for each retry.
pub async fn invoke_fn<R, V, A, RT, C, E>(
    cancel: Option<CancellationToken>,
    retry: Option<RT>,
    mut f: impl FnMut(V) -> A,
    mut v: V,
) -> Result<R, E>
where
    E: TryAs<Status> + From<Status>,
    A: Future<Output = Result<R, (E, V)>>,
    C: Predicate<E>,
    RT: Retry<E, C> + Default,
{
    let fn_loop = async {
        let retry = retry.unwrap_or_default();
        let mut strategy = retry.strategy();
        let mut predicate = retry.predicate();
        loop {
            let err = match f(v).await {
                Ok(s) => return Ok(s),
                Err((e, next)) => {
                    v = next;
                    e
                }
            };
            if !predicate.should_retry(&err) {
                return Err(err);
            }
            match strategy.next() {
                None => return Err(err),
                Some(duration) => {
                    tracing::trace!("retrying after {:?}", duration);
                    tokio::time::sleep(duration).await
                }
            };
        }
    };

    match cancel {
        Some(cancel) => {
            select! {
                _ = cancel.cancelled() => Err(Status::cancelled("client cancel").into()),
                v = fn_loop => v
            }
        }
        None => fn_loop.await,
    }
}
