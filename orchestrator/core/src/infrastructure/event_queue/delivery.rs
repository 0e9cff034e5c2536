// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Subscriber delivery.
//!
//! A [`Subscription`] pairs a handler with the [`LoopContext`] it was
//! registered from. Every delivery goes through [`schedule_on`], which calls
//! the handler inline when the processing loop already runs on that runtime
//! and otherwise hands the call to the subscriber's own runtime.
//!
//! Plain closures registered with [`sync_handler`] run on the blocking pool
//! of whichever runtime performs the call, so a subscriber that blocks can
//! still be timed out and never stalls the lanes.

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{self, Handle};
use uuid::Uuid;

use crate::domain::events::EventType;
use crate::domain::resource_error::ResourceError;

/// Error returned by a subscriber.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Retried with backoff unless the severity is fatal.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Fault(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Resource(e) => e.is_retriable(),
            Self::InvalidPayload(_) | Self::Fault(_) => false,
        }
    }
}

/// Why a single delivery attempt failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("Subscriber panicked: {0}")]
    Panicked(String),

    #[error("Subscriber runtime is closed")]
    LoopClosed,

    #[error("Delivery timed out after {0:?}")]
    TimedOut(Duration),
}

impl DeliveryError {
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Handler(e) => e.is_retriable(),
            // A hung subscriber would hold the lanes for every retry.
            Self::TimedOut(_) | Self::Panicked(_) | Self::LoopClosed => false,
        }
    }
}

/// Subscriber callback. `data` is the event payload, or the batch wrapper
/// when a burst of same-type events was coalesced.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event_type: &str, data: Value) -> Result<(), HandlerError>;
}

struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for AsyncFnHandler<F>
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event_type: &str, data: Value) -> Result<(), HandlerError> {
        (self.0)(event_type.to_string(), data).await
    }
}

struct SyncFnHandler<F>(Arc<F>);

#[async_trait]
impl<F> EventHandler for SyncFnHandler<F>
where
    F: Fn(&str, Value) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, event_type: &str, data: Value) -> Result<(), HandlerError> {
        let f = Arc::clone(&self.0);
        let event_type = event_type.to_string();
        match tokio::task::spawn_blocking(move || (*f)(&event_type, data)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(HandlerError::Fault(anyhow::anyhow!("Blocking subscriber cancelled: {}", e))),
        }
    }
}

/// Wraps an async closure as a subscriber.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(AsyncFnHandler(f))
}

/// Wraps a plain closure as a subscriber. The closure runs on the blocking
/// pool and may block; a call that outlives the delivery timeout is counted
/// as failed but keeps running to completion on its pool thread.
pub fn sync_handler<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&str, Value) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(SyncFnHandler(Arc::new(f)))
}

/// Runtime and thread a subscription was registered from.
#[derive(Clone)]
pub struct LoopContext {
    handle: Option<Handle>,
    runtime: Option<runtime::Id>,
    thread: ThreadId,
}

impl fmt::Debug for LoopContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopContext")
            .field("runtime", &self.runtime)
            .field("thread", &self.thread)
            .finish()
    }
}

impl LoopContext {
    pub fn current() -> Self {
        let handle = Handle::try_current().ok();
        let runtime = handle.as_ref().map(Handle::id);
        Self {
            handle,
            runtime,
            thread: thread::current().id(),
        }
    }

    pub fn has_runtime(&self) -> bool {
        self.handle.is_some()
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    /// Handle to marshal onto, or `None` when calling inline is correct.
    ///
    /// Subscriptions made outside any runtime run on the processing loop, as
    /// do subscriptions made on the runtime the caller is running on.
    fn remote_handle(&self) -> Option<&Handle> {
        let handle = self.handle.as_ref()?;
        let same_runtime = Handle::try_current().is_ok_and(|current| Some(current.id()) == self.runtime);
        if same_runtime {
            None
        } else {
            Some(handle)
        }
    }
}

/// Stable id returned by `EventQueue::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone)]
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) target: LoopContext,
}

impl Subscription {
    pub(crate) fn new(handler: Arc<dyn EventHandler>) -> Self {
        Self {
            id: SubscriptionId::new(),
            handler,
            target: LoopContext::current(),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn target(&self) -> &LoopContext {
        &self.target
    }
}

/// Runs one delivery on the subscriber's own loop.
pub async fn schedule_on(
    target: &LoopContext,
    handler: Arc<dyn EventHandler>,
    event_type: EventType,
    data: Value,
    timeout: Duration,
) -> Result<(), DeliveryError> {
    match target.remote_handle() {
        None => {
            let call = AssertUnwindSafe(async move { handler.handle(event_type.as_str(), data).await })
                .catch_unwind();
            match tokio::time::timeout(timeout, call).await {
                Err(_) => Err(DeliveryError::TimedOut(timeout)),
                Ok(Err(panic)) => Err(DeliveryError::Panicked(panic_message(panic.as_ref()))),
                Ok(Ok(result)) => result.map_err(DeliveryError::from),
            }
        }
        Some(handle) => {
            let task = handle.spawn(async move { handler.handle(event_type.as_str(), data).await });
            let abort = task.abort_handle();
            match tokio::time::timeout(timeout, task).await {
                Err(_) => {
                    abort.abort();
                    Err(DeliveryError::TimedOut(timeout))
                }
                Ok(Err(join_error)) if join_error.is_panic() => {
                    Err(DeliveryError::Panicked(panic_message(join_error.into_panic().as_ref())))
                }
                Ok(Err(_)) => Err(DeliveryError::LoopClosed),
                Ok(Ok(result)) => result.map_err(DeliveryError::from),
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::resource_error::ErrorSeverity;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_retry_classification() {
        let transient = HandlerError::from(ResourceError::timeout("cache", "get", 1.0));
        assert!(transient.is_retriable());

        let fatal = HandlerError::from(ResourceError::operation("gone", "cache", "get", ErrorSeverity::Fatal));
        assert!(!fatal.is_retriable());

        assert!(!HandlerError::InvalidPayload("bad".into()).is_retriable());
        assert!(!DeliveryError::LoopClosed.is_retriable());
        assert!(!DeliveryError::TimedOut(Duration::from_secs(1)).is_retriable());
    }

    #[tokio::test]
    async fn test_inline_delivery_on_same_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = sync_handler(move |event_type, data| {
            assert_eq!(event_type, "evt");
            assert_eq!(data, json!({"x": 1}));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let target = LoopContext::current();
        assert!(target.remote_handle().is_none());

        schedule_on(&target, handler, EventType::new("evt"), json!({"x": 1}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let handler = sync_handler(|_, _| panic!("subscriber bug"));
        let result = schedule_on(
            &LoopContext::current(),
            handler,
            EventType::new("evt"),
            json!({}),
            Duration::from_secs(1),
        )
        .await;
        match result {
            Err(DeliveryError::Panicked(msg)) => assert!(msg.contains("subscriber bug")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_handler_times_out() {
        let handler = handler_fn(|_, _| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        let result = schedule_on(
            &LoopContext::current(),
            handler,
            EventType::new("evt"),
            json!({}),
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(result, Err(DeliveryError::TimedOut(_))));
    }

    #[test]
    fn test_delivery_to_closed_runtime_fails_gracefully() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let target = runtime.block_on(async { LoopContext::current() });
        drop(runtime);

        let driver = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let result = driver.block_on(schedule_on(
            &target,
            sync_handler(|_, _| Ok(())),
            EventType::new("evt"),
            json!({}),
            Duration::from_millis(200),
        ));
        assert!(matches!(result, Err(DeliveryError::LoopClosed)), "unexpected result: {:?}", result);
    }

    #[tokio::test]
    async fn test_blocking_sync_handler_times_out_without_stalling_runtime() {
        let handler = sync_handler(|_, _| {
            thread::sleep(Duration::from_millis(300));
            Ok(())
        });
        let started = std::time::Instant::now();
        let result = schedule_on(
            &LoopContext::current(),
            handler,
            EventType::new("evt"),
            json!({}),
            Duration::from_millis(30),
        )
        .await;
        assert!(matches!(result, Err(DeliveryError::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[test]
    fn test_same_multi_thread_runtime_delivers_inline() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let inline = runtime.block_on(async {
            tokio::spawn(async { LoopContext::current().remote_handle().is_none() })
                .await
                .unwrap()
        });
        assert!(inline);

        let other = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let foreign = other.block_on(async { LoopContext::current() });
        assert!(runtime.block_on(async move { foreign.remote_handle().is_some() }));
    }

    #[test]
    fn test_delivery_crosses_to_subscriber_runtime() {
        let subscriber_rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("subscriber-loop")
            .enable_all()
            .build()
            .unwrap();
        let target = subscriber_rt.block_on(async { LoopContext::current() });

        let seen_on = Arc::new(parking_lot::Mutex::new(None));
        let recorder = seen_on.clone();
        let handler = handler_fn(move |_, _| {
            let recorder = recorder.clone();
            async move {
                *recorder.lock() = thread::current().name().map(str::to_string);
                Ok(())
            }
        });

        let driver = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        driver
            .block_on(schedule_on(&target, handler, EventType::new("evt"), json!({}), Duration::from_secs(1)))
            .unwrap();

        assert_eq!(seen_on.lock().as_deref(), Some("subscriber-loop"));
    }
}
