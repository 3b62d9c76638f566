//! Bounded, retrying store decorator
//!
//! Wraps any backend so every operation has a deadline and transient
//! failures (lock contention, timeouts, I/O) are retried with linear backoff
//! plus jitter. Once the budget is spent the caller sees
//! [`Error::StoreUnavailable`] and can degrade instead of hanging.
//!
//! `insert`, `update` and `append` are not idempotent: a timeout may fire
//! after the backend committed, so they are retried only on errors that
//! prove nothing was written.

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, Instant};

use super::{LogSlice, LogStore, Mutator, StateStore, TailEntry, Versioned};
use crate::config::StoreConfig;
use crate::events::{Event, NewEvent, Topic};
use crate::{Error, Result};

/// Which failures an operation may be re-sent after
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resend {
    /// Reads and idempotent writes
    AnyTransient,
    /// Writes that would apply twice
    OnlyIfUnwritten,
}

/// Deadline and retry budget applied to every store operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Per-attempt deadline
    pub op_timeout: Duration,
    /// Retries after the first attempt
    pub retries: u32,
    /// Backoff unit; attempt `n` waits `n * backoff` plus up to one unit of jitter
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            op_timeout: config.op_timeout(),
            retries: config.retry_attempts,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff.saturating_mul(attempt);
        let unit_ms = u64::try_from(self.backoff.as_millis()).unwrap_or(u64::MAX);
        let jitter = if unit_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=unit_ms)
        };
        base + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

pub struct ResilientStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> ResilientStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn attempt<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.policy.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{operation} exceeded {} ms",
                self.policy.op_timeout.as_millis()
            ))),
        }
    }

    /// Decide whether to retry after `err`; sleeps before returning `Ok(())`
    async fn backoff(
        &self,
        operation: &str,
        resend: Resend,
        attempt: u32,
        started: Instant,
        err: Error,
    ) -> Result<()> {
        if !err.is_transient() {
            return Err(err);
        }
        if resend == Resend::OnlyIfUnwritten && !err.proves_no_write() {
            tracing::warn!(operation, attempt, error = %err, "Write outcome unknown, not retrying");
            return Err(err);
        }
        if attempt > self.policy.retries {
            tracing::error!(
                operation,
                attempt,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %err,
                "Store operation failed: retry budget exhausted"
            );
            return Err(Error::StoreUnavailable(format!(
                "{operation} failed after {attempt} attempts: {err}"
            )));
        }
        let delay = self.policy.delay_for(attempt);
        tracing::warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient store error, retrying"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }

    async fn run<T, F, Fut>(&self, operation: &str, resend: Resend, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(operation, op()).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempt, "Store operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => self.backoff(operation, resend, attempt, started, err).await?,
            }
        }
    }
}

#[async_trait]
impl<S: StateStore> StateStore for ResilientStore<S> {
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<Versioned> {
        self.run("put", Resend::AnyTransient, || self.inner.put(key, value.clone(), ttl)).await
    }

    async fn insert(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<Versioned> {
        self.run("insert", Resend::OnlyIfUnwritten, || self.inner.insert(key, value.clone(), ttl))
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        self.run("get", Resend::AnyTransient, || self.inner.get(key)).await
    }

    async fn update(
        &self,
        key: &str,
        ttl: Option<Duration>,
        mutator: &mut Mutator<'_>,
    ) -> Result<Versioned> {
        // Hand-rolled loop: each attempt reborrows the mutator
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self
                .attempt("update", self.inner.update(key, ttl, &mut *mutator))
                .await;
            match outcome {
                Ok(doc) => return Ok(doc),
                Err(err) => {
                    self.backoff("update", Resend::OnlyIfUnwritten, attempt, started, err)
                        .await?
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.run("delete", Resend::AnyTransient, || self.inner.delete(key)).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        self.run("scan_prefix", Resend::AnyTransient, || self.inner.scan_prefix(prefix))
            .await
    }

    async fn sweep_expired(&self) -> Result<u64> {
        self.run("sweep_expired", Resend::AnyTransient, || self.inner.sweep_expired())
            .await
    }
}

#[async_trait]
impl<S: LogStore> LogStore for ResilientStore<S> {
    async fn append(
        &self,
        topic: &Topic,
        event: NewEvent,
        origin_node: &str,
        capacity: usize,
    ) -> Result<Event> {
        self.run("append", Resend::OnlyIfUnwritten, || {
            self.inner
                .append(topic, event.clone(), origin_node, capacity)
        })
        .await
    }

    async fn read_since(&self, topic: &Topic, cursor: u64, limit: usize) -> Result<LogSlice> {
        self.run("read_since", Resend::AnyTransient, || self.inner.read_since(topic, cursor, limit))
            .await
    }

    async fn tail(&self, after_seq: u64, limit: usize) -> Result<Vec<TailEntry>> {
        self.run("tail", Resend::AnyTransient, || self.inner.tail(after_seq, limit)).await
    }

    async fn tail_head(&self) -> Result<u64> {
        self.run("tail_head", Resend::AnyTransient, || self.inner.tail_head()).await
    }
}
