//! Tracing for agent objects
//!
//! Agent frameworks expose a method-based interface rather than a bare
//! function. The traits here describe that interface; [`wrap`] returns a
//! [`Wrapped`] agent that implements the same traits with every call traced
//! and derefs to the inner agent for everything else.

use crate::capture::{capture_error, capture_value, merge_chunks};
use crate::context;
use crate::trace::TraceContext;
use crate::tracker::{
    panic_message, record_result, short_type_name, traced, traced_async, Monitor, PendingTrace,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::{self, Display};
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};

/// Synchronous request/response agent
pub trait Invoke {
    /// Request type
    type Input: Serialize;
    /// Response type
    type Output: Serialize;
    /// Failure type
    type Error: Display;

    /// Run the agent once
    fn invoke(&self, input: Self::Input) -> Result<Self::Output, Self::Error>;
}

/// Asynchronous request/response agent
#[async_trait]
pub trait AsyncInvoke: Send + Sync {
    /// Request type
    type Input: Serialize + Send;
    /// Response type
    type Output: Serialize + Send;
    /// Failure type
    type Error: Display + Send;

    /// Run the agent once
    async fn ainvoke(&self, input: Self::Input) -> Result<Self::Output, Self::Error>;
}

/// Agent that produces its response as a sequence of chunks
pub trait StreamInvoke {
    /// Request type
    type Input: Serialize;
    /// Chunk type
    type Chunk: Serialize;
    /// Failure type
    type Error: Display;
    /// Chunk iterator
    type Stream: Iterator<Item = Result<Self::Chunk, Self::Error>>;

    /// Start streaming a response
    fn stream(&self, input: Self::Input) -> Self::Stream;
}

/// Wrap an agent so every invocation is traced
///
/// Traces are named after the agent type; use [`Monitor::wrap_agent`] to
/// choose the name, metadata or store.
pub fn wrap<A>(agent: A) -> Wrapped<A> {
    Monitor::new(short_type_name::<A>()).wrap_agent(agent)
}

impl Monitor {
    /// Wrap an agent with this tracker's configuration
    pub fn wrap_agent<A>(&self, agent: A) -> Wrapped<A> {
        Wrapped {
            agent,
            monitor: self.clone(),
        }
    }
}

/// An agent whose calls are traced
pub struct Wrapped<A> {
    agent: A,
    monitor: Monitor,
}

impl<A> Wrapped<A> {
    /// Tracker used for this agent
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Unwrap the agent
    pub fn into_inner(self) -> A {
        self.agent
    }

    fn begin<I: Serialize>(&self, input: &I, method: &str) -> PendingTrace {
        self.monitor.begin(
            capture_value(input),
            [
                ("agent_name", Value::String(self.monitor.name().to_string())),
                ("method", Value::String(method.to_string())),
            ],
        )
    }
}

impl<A: fmt::Debug> fmt::Debug for Wrapped<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wrapped")
            .field("agent", &self.agent)
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl<A> Deref for Wrapped<A> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.agent
    }
}

impl<A> DerefMut for Wrapped<A> {
    fn deref_mut(&mut self) -> &mut A {
        &mut self.agent
    }
}

impl<A: Invoke> Invoke for Wrapped<A> {
    type Input = A::Input;
    type Output = A::Output;
    type Error = A::Error;

    fn invoke(&self, input: Self::Input) -> Result<Self::Output, Self::Error> {
        let pending = self.begin(&input, "invoke");
        traced(
            pending,
            input,
            |input| self.agent.invoke(input),
            record_result::<A::Output, A::Error>,
        )
    }
}

#[async_trait]
impl<A: AsyncInvoke> AsyncInvoke for Wrapped<A> {
    type Input = A::Input;
    type Output = A::Output;
    type Error = A::Error;

    async fn ainvoke(&self, input: Self::Input) -> Result<Self::Output, Self::Error> {
        let pending = self.begin(&input, "ainvoke");
        traced_async(
            pending,
            input,
            |input| self.agent.ainvoke(input),
            record_result::<A::Output, A::Error>,
        )
        .await
    }
}

impl<A: StreamInvoke> StreamInvoke for Wrapped<A> {
    type Input = A::Input;
    type Chunk = A::Chunk;
    type Error = A::Error;
    type Stream = TracedStream<A::Stream>;

    fn stream(&self, input: Self::Input) -> Self::Stream {
        let pending = self.begin(&input, "stream");
        let (started, context) = context::run_scoped(|| {
            panic::catch_unwind(AssertUnwindSafe(|| self.agent.stream(input)))
        });

        match started {
            Ok(inner) => TracedStream {
                inner,
                pending: Some(pending),
                chunks: Vec::new(),
                context,
            },
            Err(payload) => {
                pending.fail(panic_message(payload.as_ref()), Value::Null, context);
                panic::resume_unwind(payload)
            }
        }
    }
}

/// Chunk iterator that records one trace when the stream ends
///
/// Chunks pass through unchanged. Exhaustion records a success whose output
/// is the merged chunks; an `Err` item records a failure whose output holds
/// the chunks seen so far. Dropping the stream early records a cancellation.
pub struct TracedStream<S> {
    inner: S,
    pending: Option<PendingTrace>,
    chunks: Vec<Value>,
    context: Option<TraceContext>,
}

impl<S> TracedStream<S> {
    fn partial_output(&mut self) -> Value {
        if self.chunks.is_empty() {
            Value::Null
        } else {
            json!({ "partial_chunks": std::mem::take(&mut self.chunks) })
        }
    }

    fn fail(&mut self, error: String) {
        let output = self.partial_output();
        if let Some(pending) = self.pending.take() {
            pending.fail(error, output, self.context.take());
        }
    }
}

impl<S, C, E> Iterator for TracedStream<S>
where
    S: Iterator<Item = Result<C, E>>,
    C: Serialize,
    E: Display,
{
    type Item = Result<C, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pending.is_none() {
            return self.inner.next();
        }

        let inner = &mut self.inner;
        let (item, context) =
            context::run_scoped(|| panic::catch_unwind(AssertUnwindSafe(|| inner.next())));
        if context.is_some() {
            self.context = context;
        }

        match item {
            Ok(Some(Ok(chunk))) => {
                self.chunks.push(capture_value(&chunk));
                Some(Ok(chunk))
            }
            Ok(Some(Err(err))) => {
                self.fail(capture_error(&err));
                Some(Err(err))
            }
            Ok(None) => {
                let output = merge_chunks(&self.chunks);
                if let Some(pending) = self.pending.take() {
                    pending.succeed(output, self.context.take());
                }
                None
            }
            Err(payload) => {
                self.fail(panic_message(payload.as_ref()));
                panic::resume_unwind(payload)
            }
        }
    }
}

impl<S> Drop for TracedStream<S> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel(Value::Null);
        }
    }
}
