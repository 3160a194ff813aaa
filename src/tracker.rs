//! Trace capture for function calls
//!
//! A [`Monitor`] surrounds a callable, measures it, and records exactly one
//! trace per call: success with the captured output, or error with the
//! failure message (error values and panics alike). The wrapped callable's
//! result or failure is always handed back unchanged. Persistence is
//! fail-open: a store that cannot save is logged at `warn` and ignored.

use crate::capture::{capture_error, capture_value};
use crate::context;
use crate::error::Error;
use crate::storage::{get_storage, TraceStore};
use crate::trace::{Trace, TraceContext};
use crate::types::TraceStatus;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt::{self, Display};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Error recorded for async calls dropped before completion
pub const CANCELLED_ERROR: &str = "cancelled before completion";

/// Result of handing a trace to a store
///
/// The tracker never surfaces this to callers; it exists so the discard is
/// explicit at every call site.
#[derive(Debug)]
pub enum Persisted {
    /// The store accepted the trace
    Saved,
    /// The store failed; the trace was dropped after logging
    Dropped(Error),
}

impl Persisted {
    /// Whether the trace reached the store
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved)
    }
}

/// Save a trace, converting every failure (including a panicking store)
/// into a logged [`Persisted::Dropped`]
pub fn persist(storage: &dyn TraceStore, trace: &Trace) -> Persisted {
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| storage.save(trace))) {
        Ok(Ok(())) => return Persisted::Saved,
        Ok(Err(err)) => err,
        Err(payload) => Error::storage(format!(
            "trace store panicked: {}",
            panic_message(payload.as_ref())
        )),
    };

    tracing::warn!(trace_id = %trace.id, error = %outcome, "failed to persist trace");
    Persisted::Dropped(outcome)
}

/// Render a panic payload the way the panic hook would
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}

/// How a callable's return value is recorded: captured output or failure message
pub(crate) type Outcome = std::result::Result<Value, String>;

pub(crate) fn record_value<T: Serialize>(value: &T) -> Outcome {
    Ok(capture_value(value))
}

pub(crate) fn record_result<T: Serialize, E: Display>(result: &std::result::Result<T, E>) -> Outcome {
    match result {
        Ok(value) => Ok(capture_value(value)),
        Err(err) => Err(capture_error(err)),
    }
}

/// A call that has started but not yet been recorded
pub(crate) struct PendingTrace {
    input: Value,
    metadata: Map<String, Value>,
    storage: Arc<dyn TraceStore>,
    started: Instant,
}

impl PendingTrace {
    pub(crate) fn complete(self, outcome: Outcome, context: Option<TraceContext>) -> Trace {
        match outcome {
            Ok(output) => self.succeed(output, context),
            Err(error) => self.fail(error, Value::Null, context),
        }
    }

    pub(crate) fn succeed(self, output: Value, context: Option<TraceContext>) -> Trace {
        let trace = Trace::success(self.input.clone(), output).with_context(context);
        self.finish(trace)
    }

    pub(crate) fn fail(self, error: String, output: Value, context: Option<TraceContext>) -> Trace {
        let trace = Trace::failure(self.input.clone(), error)
            .with_output(output)
            .with_context(context);
        self.finish(trace)
    }

    pub(crate) fn cancel(self, output: Value) -> Trace {
        self.fail(CANCELLED_ERROR.to_string(), output, None)
    }

    fn finish(self, trace: Trace) -> Trace {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let trace = trace.with_duration_ms(elapsed_ms).with_metadata(self.metadata);

        tracing::debug!(
            trace_id = %trace.id,
            status = %trace.status,
            duration_ms = elapsed_ms,
            "recorded trace"
        );
        let _ = persist(self.storage.as_ref(), &trace);
        trace
    }
}

/// Records a cancellation trace if dropped before [`CancelGuard::complete`]
struct CancelGuard {
    pending: Option<PendingTrace>,
}

impl CancelGuard {
    fn complete(mut self, outcome: Outcome, context: Option<TraceContext>) {
        if let Some(pending) = self.pending.take() {
            pending.complete(outcome, context);
        }
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel(Value::Null);
        }
    }
}

/// Run a synchronous callable and record it
pub(crate) fn traced<I, R>(
    pending: PendingTrace,
    input: I,
    f: impl FnOnce(I) -> R,
    record: fn(&R) -> Outcome,
) -> R {
    let (result, context) =
        context::run_scoped(|| panic::catch_unwind(AssertUnwindSafe(|| f(input))));

    match result {
        Ok(value) => {
            pending.complete(record(&value), context);
            value
        }
        Err(payload) => {
            pending.fail(panic_message(payload.as_ref()), Value::Null, context);
            panic::resume_unwind(payload)
        }
    }
}

/// Await an asynchronous callable and record it
///
/// The callable runs inside this future; dropping it drops the callable's
/// future too and records a cancellation.
pub(crate) async fn traced_async<I, R, Fut>(
    pending: PendingTrace,
    input: I,
    f: impl FnOnce(I) -> Fut,
    record: fn(&R) -> Outcome,
) -> R
where
    Fut: Future<Output = R>,
{
    let guard = CancelGuard {
        pending: Some(pending),
    };
    let call = AssertUnwindSafe(async move { f(input).await }).catch_unwind();
    let (result, context) = context::run_scoped_async(call).await;

    match result {
        Ok(value) => {
            guard.complete(record(&value), context);
            value
        }
        Err(payload) => {
            guard.complete(Err(panic_message(payload.as_ref())), context);
            panic::resume_unwind(payload)
        }
    }
}

/// Configured tracker
///
/// ```no_run
/// use loopscope::Monitor;
/// use serde_json::json;
///
/// let double = Monitor::new("double")
///     .with_metadata("version", json!("1.0"))
///     .wrap(|x: i64| x * 2);
/// assert_eq!(double(21), 42);
/// ```
#[derive(Clone)]
pub struct Monitor {
    name: String,
    metadata: Map<String, Value>,
    storage: Option<Arc<dyn TraceStore>>,
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .field("explicit_storage", &self.storage.is_some())
            .finish()
    }
}

impl Monitor {
    /// Create a tracker recording under `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: Map::new(),
            storage: None,
        }
    }

    /// Create a tracker named after the callable type `F`
    pub fn for_callable<F>() -> Self {
        Self::new(short_type_name::<F>())
    }

    /// Add static metadata to every trace
    ///
    /// Keys set here win over the automatically added ones.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Record into a specific store instead of the process-wide default
    pub fn with_storage(mut self, storage: Arc<dyn TraceStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Name recorded in trace metadata
    pub fn name(&self) -> &str {
        &self.name
    }

    fn resolve_storage(&self) -> Arc<dyn TraceStore> {
        match &self.storage {
            Some(storage) => Arc::clone(storage),
            None => get_storage(),
        }
    }

    /// Start a trace with the given automatic metadata under the caller's
    pub(crate) fn begin(&self, input: Value, automatic: [(&str, Value); 2]) -> PendingTrace {
        let mut metadata: Map<String, Value> = automatic
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        metadata.extend(self.metadata.clone());

        PendingTrace {
            input,
            metadata,
            storage: self.resolve_storage(),
            started: Instant::now(),
        }
    }

    fn begin_function<I: Serialize>(&self, input: &I, is_async: bool) -> PendingTrace {
        self.begin(
            capture_value(input),
            [
                ("function_name", Value::String(self.name.clone())),
                ("is_async", Value::Bool(is_async)),
            ],
        )
    }

    /// Run one traced call
    pub fn call<I, T>(&self, input: I, f: impl FnOnce(I) -> T) -> T
    where
        I: Serialize,
        T: Serialize,
    {
        traced(self.begin_function(&input, false), input, f, record_value::<T>)
    }

    /// Run one traced call whose `Err` counts as a failure
    pub fn try_call<I, T, E>(
        &self,
        input: I,
        f: impl FnOnce(I) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        I: Serialize,
        T: Serialize,
        E: Display,
    {
        traced(self.begin_function(&input, false), input, f, record_result::<T, E>)
    }

    /// Await one traced asynchronous call
    pub async fn call_async<I, T, Fut>(&self, input: I, f: impl FnOnce(I) -> Fut) -> T
    where
        I: Serialize,
        T: Serialize,
        Fut: Future<Output = T>,
    {
        let pending = self.begin_function(&input, true);
        traced_async(pending, input, f, record_value::<T>).await
    }

    /// Await one traced asynchronous call whose `Err` counts as a failure
    pub async fn try_call_async<I, T, E, Fut>(
        &self,
        input: I,
        f: impl FnOnce(I) -> Fut,
    ) -> std::result::Result<T, E>
    where
        I: Serialize,
        T: Serialize,
        E: Display,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let pending = self.begin_function(&input, true);
        traced_async(pending, input, f, record_result::<T, E>).await
    }

    /// Wrap a function; every call is traced
    pub fn wrap<I, T, F>(&self, f: F) -> impl Fn(I) -> T
    where
        I: Serialize,
        T: Serialize,
        F: Fn(I) -> T,
    {
        let monitor = self.clone();
        move |input| monitor.call(input, &f)
    }

    /// Wrap a fallible function; `Err` results are recorded as failures
    pub fn wrap_fallible<I, T, E, F>(&self, f: F) -> impl Fn(I) -> std::result::Result<T, E>
    where
        I: Serialize,
        T: Serialize,
        E: Display,
        F: Fn(I) -> std::result::Result<T, E>,
    {
        let monitor = self.clone();
        move |input| monitor.try_call(input, &f)
    }

    /// Wrap an async function; every awaited call is traced
    pub fn wrap_async<I, T, F, Fut>(&self, f: F) -> impl Fn(I) -> BoxFuture<'static, T>
    where
        I: Serialize + Send + 'static,
        T: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let monitor = self.clone();
        let f = Arc::new(f);
        move |input| {
            let monitor = monitor.clone();
            let f = Arc::clone(&f);
            async move { monitor.call_async(input, move |input| (*f)(input)).await }.boxed()
        }
    }

    /// Wrap a fallible async function; `Err` results are recorded as failures
    pub fn wrap_async_fallible<I, T, E, F, Fut>(
        &self,
        f: F,
    ) -> impl Fn(I) -> BoxFuture<'static, std::result::Result<T, E>>
    where
        I: Serialize + Send + 'static,
        T: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        let monitor = self.clone();
        let f = Arc::new(f);
        move |input| {
            let monitor = monitor.clone();
            let f = Arc::clone(&f);
            async move { monitor.try_call_async(input, move |input| (*f)(input)).await }.boxed()
        }
    }
}

/// Last path segment of a type name: the function name for fn items, the
/// enclosing function for closures, the bare struct name for agents
pub(crate) fn short_type_name<F: ?Sized>() -> String {
    let full = std::any::type_name::<F>();
    let mut path = full;
    while let Some(stripped) = path.strip_suffix("::{{closure}}") {
        path = stripped;
    }
    // Generic arguments can contain `::`; cut them off before splitting
    let path = path.split('<').next().unwrap_or(path);
    path.rsplit("::").next().unwrap_or(path).to_string()
}

/// Trace every call of `f` with default configuration
///
/// The trace is named after the function.
pub fn monitor<I, T, F>(f: F) -> impl Fn(I) -> T
where
    I: Serialize,
    T: Serialize,
    F: Fn(I) -> T,
{
    Monitor::for_callable::<F>().wrap(f)
}

/// Trace every call of a fallible `f`; `Err` results are recorded as failures
pub fn monitor_fallible<I, T, E, F>(f: F) -> impl Fn(I) -> std::result::Result<T, E>
where
    I: Serialize,
    T: Serialize,
    E: Display,
    F: Fn(I) -> std::result::Result<T, E>,
{
    Monitor::for_callable::<F>().wrap_fallible(f)
}

/// Trace every awaited call of an async `f`
pub fn monitor_async<I, T, F, Fut>(f: F) -> impl Fn(I) -> BoxFuture<'static, T>
where
    I: Serialize + Send + 'static,
    T: Serialize + Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    Monitor::for_callable::<F>().wrap_async(f)
}

/// Options for [`log`]
#[derive(Clone, Default)]
pub struct LogOptions {
    /// Context to attach
    pub context: Option<TraceContext>,
    /// Metadata stored verbatim
    pub metadata: Map<String, Value>,
    /// Outcome to record
    pub status: TraceStatus,
    /// Failure message; ignored for successful traces
    pub error: Option<String>,
    /// Duration to record
    pub duration_ms: Option<f64>,
    /// Store to use instead of the process-wide default
    pub storage: Option<Arc<dyn TraceStore>>,
}

impl LogOptions {
    /// Options for a successful trace
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach context
    pub fn with_context(mut self, context: TraceContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Set the status
    pub fn with_status(mut self, status: TraceStatus) -> Self {
        self.status = status;
        self
    }

    /// Record a failure with this message
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.status = TraceStatus::Error;
        self.error = Some(error.into());
        self
    }

    /// Set the duration
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Record into a specific store
    pub fn with_storage(mut self, storage: Arc<dyn TraceStore>) -> Self {
        self.storage = Some(storage);
        self
    }
}

/// Record a trace by hand
///
/// Returns the trace whether or not the store accepted it.
pub fn log<I, O>(input: &I, output: &O, options: LogOptions) -> Trace
where
    I: Serialize + ?Sized,
    O: Serialize + ?Sized,
{
    let input = capture_value(input);
    let output = capture_value(output);

    let trace = match options.status {
        TraceStatus::Success => {
            if options.error.is_some() {
                tracing::debug!("error message ignored for successful manual trace");
            }
            Trace::success(input, output)
        }
        TraceStatus::Error => {
            Trace::failure(input, options.error.unwrap_or_default()).with_output(output)
        }
    };

    let mut trace = trace
        .with_context(options.context)
        .with_metadata(options.metadata);
    if let Some(duration_ms) = options.duration_ms {
        trace = trace.with_duration_ms(duration_ms);
    }

    let storage = options.storage.unwrap_or_else(get_storage);
    let _ = persist(storage.as_ref(), &trace);
    trace
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::set_context;
    use crate::error::Result;
    use crate::storage::{SqliteStorage, TraceIter, TraceQuery};
    use crate::types::TraceId;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, Arc<SqliteStorage>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(SqliteStorage::open(dir.path().join("tracker.db")).unwrap());
        (dir, storage)
    }

    fn latest(storage: &SqliteStorage) -> Trace {
        storage
            .list_traces(&TraceQuery::new().with_limit(1))
            .unwrap()
            .remove(0)
    }

    struct FailingStore;

    impl TraceStore for FailingStore {
        fn save(&self, _: &Trace) -> Result<()> {
            Err(Error::storage("disk full"))
        }
        fn load(&self, _: &TraceId) -> Result<Option<Trace>> {
            Ok(None)
        }
        fn list_traces(&self, _: &TraceQuery) -> Result<Vec<Trace>> {
            Ok(Vec::new())
        }
        fn count(&self, _: Option<TraceStatus>) -> Result<u64> {
            Ok(0)
        }
        fn iter_traces(&self) -> TraceIter<'_> {
            Box::new(std::iter::empty())
        }
        fn clear(&self) -> Result<u64> {
            Ok(0)
        }
        fn close(&self) {}
    }

    struct PanickingStore;

    impl TraceStore for PanickingStore {
        fn save(&self, _: &Trace) -> Result<()> {
            panic!("store exploded")
        }
        fn load(&self, _: &TraceId) -> Result<Option<Trace>> {
            Ok(None)
        }
        fn list_traces(&self, _: &TraceQuery) -> Result<Vec<Trace>> {
            Ok(Vec::new())
        }
        fn count(&self, _: Option<TraceStatus>) -> Result<u64> {
            Ok(0)
        }
        fn iter_traces(&self) -> TraceIter<'_> {
            Box::new(std::iter::empty())
        }
        fn clear(&self) -> Result<u64> {
            Ok(0)
        }
        fn close(&self) {}
    }

    #[test]
    fn test_wrap_records_success() {
        let (_dir, storage) = store();
        let double = Monitor::new("double")
            .with_storage(storage.clone())
            .wrap(|x: i64| x * 2);

        assert_eq!(double(21), 42);

        let trace = latest(&storage);
        assert_eq!(trace.input, json!(21));
        assert_eq!(trace.output, json!(42));
        assert_eq!(trace.status, TraceStatus::Success);
        assert!(trace.duration_ms.unwrap() >= 0.0);
        assert_eq!(trace.metadata["function_name"], json!("double"));
        assert_eq!(trace.metadata["is_async"], json!(false));
    }

    #[test]
    fn test_err_result_recorded_and_returned() {
        let (_dir, storage) = store();
        let parse = Monitor::new("parse")
            .with_storage(storage.clone())
            .wrap_fallible(|s: &str| s.parse::<i32>().map_err(|_| format!("bad input {}", s)));

        assert_eq!(parse("7"), Ok(7));
        assert_eq!(parse("x"), Err("bad input x".to_string()));

        let trace = latest(&storage);
        assert_eq!(trace.status, TraceStatus::Error);
        assert_eq!(trace.output, Value::Null);
        assert!(trace.error.unwrap().contains("bad"));
        assert_eq!(storage.count(None).unwrap(), 2);
    }

    #[test]
    fn test_panic_recorded_and_resumed() {
        let (_dir, storage) = store();
        let monitor = Monitor::new("explode").with_storage(storage.clone());

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            monitor.call((), |_| -> i32 { panic!("kaboom") })
        }));

        let payload = result.unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "kaboom");
        let trace = latest(&storage);
        assert_eq!(trace.status, TraceStatus::Error);
        assert_eq!(trace.error.as_deref(), Some("kaboom"));
    }

    #[test]
    fn test_caller_metadata_wins() {
        let (_dir, storage) = store();
        let monitor = Monitor::new("auto")
            .with_metadata("function_name", json!("custom"))
            .with_metadata("version", json!(3))
            .with_storage(storage.clone());

        monitor.call("q", |q| q.len());

        let trace = latest(&storage);
        assert_eq!(trace.metadata["function_name"], json!("custom"));
        assert_eq!(trace.metadata["version"], json!(3));
        assert_eq!(trace.metadata["is_async"], json!(false));
    }

    #[test]
    fn test_failing_store_is_invisible_to_caller() {
        let failing = Monitor::new("f").with_storage(Arc::new(FailingStore));
        assert_eq!(failing.call(2, |x: i32| x + 1), 3);
        assert_eq!(
            failing.try_call(2, |_: i32| -> std::result::Result<i32, String> { Err("bad".into()) }),
            Err("bad".to_string())
        );

        let panicking = Monitor::new("p").with_storage(Arc::new(PanickingStore));
        assert_eq!(panicking.call(2, |x: i32| x * 10), 20);
    }

    #[derive(Debug, PartialEq)]
    struct Unrenderable;

    impl Display for Unrenderable {
        fn fmt(&self, _: &mut fmt::Formatter<'_>) -> fmt::Result {
            Err(fmt::Error)
        }
    }

    #[test]
    fn test_unrenderable_error_is_returned_unchanged() {
        let (_dir, storage) = store();
        let monitor = Monitor::new("opaque").with_storage(storage.clone());

        let result = monitor.try_call(1, |_: i32| -> std::result::Result<i32, Unrenderable> {
            Err(Unrenderable)
        });
        assert_eq!(result, Err(Unrenderable));

        let trace = latest(&storage);
        assert_eq!(trace.status, TraceStatus::Error);
        assert!(trace.error.unwrap().starts_with("<unrenderable error:"));
    }

    #[tokio::test]
    async fn test_failing_store_is_invisible_to_async_caller() {
        let failing = Monitor::new("f").with_storage(Arc::new(FailingStore));
        assert_eq!(failing.call_async(2, |x: i32| async move { x + 1 }).await, 3);
        let result: std::result::Result<i32, String> = failing
            .try_call_async(2, |_: i32| async { Err("bad".to_string()) })
            .await;
        assert_eq!(result, Err("bad".to_string()));

        let panicking = Monitor::new("p").with_storage(Arc::new(PanickingStore));
        assert_eq!(panicking.call_async(2, |x: i32| async move { x * 10 }).await, 20);
        let result: std::result::Result<i32, String> = panicking
            .try_call_async(2, |_: i32| async { Err("worse".to_string()) })
            .await;
        assert_eq!(result, Err("worse".to_string()));

        let wrapped = Monitor::new("w")
            .with_storage(Arc::new(PanickingStore))
            .wrap_async_fallible(|x: i32| async move {
                if x > 0 {
                    Ok(x)
                } else {
                    Err("negative".to_string())
                }
            });
        assert_eq!(wrapped(5).await, Ok(5));
        assert_eq!(wrapped(-1).await, Err("negative".to_string()));
    }

    #[test]
    fn test_persist_reports_outcome() {
        let trace = Trace::success(json!(1), json!(2));
        assert!(!persist(&FailingStore, &trace).is_saved());
        assert!(matches!(
            persist(&PanickingStore, &trace),
            Persisted::Dropped(Error::Storage(_))
        ));
    }

    #[test]
    fn test_context_attached_to_its_own_call_only() {
        let (_dir, storage) = store();
        let monitor = Monitor::new("ctx").with_storage(storage.clone());

        monitor.call("balance?", |q| {
            set_context(
                TraceContext::default()
                    .with_entry("balance", json!(100))
                    .with_source("api"),
            );
            format!("answer to {}", q)
        });
        let with_context = latest(&storage);
        assert_eq!(
            serde_json::to_value(with_context.context.unwrap()).unwrap(),
            json!({"data": {"balance": 100}, "source": "api"})
        );

        monitor.call("again", |q| q.to_string());
        assert!(latest(&storage).context.is_none());
    }

    #[test]
    fn test_nested_calls_record_separately() {
        let (_dir, storage) = store();
        let outer = Monitor::new("outer").with_storage(storage.clone());
        let inner = Monitor::new("inner").with_storage(storage.clone());

        outer.call(1, |x: i32| {
            set_context(TraceContext::default().with_entry("level", json!("outer")));
            inner.call(x, |y: i32| {
                set_context(TraceContext::default().with_entry("level", json!("inner")));
                y + 1
            })
        });

        let traces = storage.list_traces(&TraceQuery::default()).unwrap();
        assert_eq!(traces.len(), 2);
        for trace in traces {
            let level = &trace.context.unwrap().data["level"];
            let name = &trace.metadata["function_name"];
            assert_eq!(level, name);
        }
    }

    #[tokio::test]
    async fn test_async_call_records_success() {
        let (_dir, storage) = store();
        let fetch = Monitor::new("fetch")
            .with_storage(storage.clone())
            .wrap_async(|q: String| async move {
                tokio::task::yield_now().await;
                format!("answer: {}", q)
            });

        assert_eq!(fetch("hi".to_string()).await, "answer: hi");

        let trace = latest(&storage);
        assert_eq!(trace.output, json!("answer: hi"));
        assert_eq!(trace.metadata["is_async"], json!(true));
    }

    #[tokio::test]
    async fn test_async_err_and_context() {
        let (_dir, storage) = store();
        let monitor = Monitor::new("lookup").with_storage(storage.clone());

        let result: std::result::Result<u32, String> = monitor
            .try_call_async("acct-1", |id| async move {
                set_context(TraceContext::default().with_entry("account", json!(id)));
                tokio::task::yield_now().await;
                Err("bad account".to_string())
            })
            .await;

        assert_eq!(result, Err("bad account".to_string()));
        let trace = latest(&storage);
        assert_eq!(trace.error.as_deref(), Some("bad account"));
        assert_eq!(trace.context.unwrap().data["account"], json!("acct-1"));
    }

    #[test]
    fn test_dropped_async_call_records_cancellation() {
        let (_dir, storage) = store();
        let monitor = Monitor::new("slow").with_storage(storage.clone());

        let mut call = tokio_test::task::spawn(monitor.call_async((), |_| async {
            futures::future::pending::<()>().await;
        }));
        assert!(call.poll().is_pending());
        drop(call);

        let trace = latest(&storage);
        assert_eq!(trace.status, TraceStatus::Error);
        assert_eq!(trace.error.as_deref(), Some(CANCELLED_ERROR));
        assert!(trace.context.is_none());
    }

    #[test]
    fn test_log_manual_traces() {
        let (_dir, storage) = store();

        let ok = log(
            "question",
            "answer",
            LogOptions::new()
                .with_metadata("user_id", json!("123"))
                .with_error("ignored")
                .with_status(TraceStatus::Success)
                .with_storage(storage.clone()),
        );
        assert!(ok.error.is_none());
        assert!(ok.duration_ms.is_none());

        let failed = log(
            "question",
            &Value::Null,
            LogOptions::new()
                .with_status(TraceStatus::Error)
                .with_duration_ms(5.0)
                .with_storage(storage.clone()),
        );
        assert_eq!(failed.error.as_deref(), Some("unspecified error"));

        assert_eq!(storage.load(&ok.id).unwrap().unwrap(), ok);
        assert_eq!(storage.load(&failed.id).unwrap().unwrap(), failed);
    }

    #[test]
    fn test_log_with_failing_store_still_returns_trace() {
        let trace = log(&1, &2, LogOptions::new().with_storage(Arc::new(FailingStore)));
        assert_eq!(trace.output, json!(2));
    }

    #[test]
    fn test_short_type_name() {
        fn answer(_: ()) -> u8 {
            42
        }
        fn name_of<F>(_: &F) -> String {
            short_type_name::<F>()
        }
        assert_eq!(name_of(&answer), "answer");
        assert_eq!(name_of(&|| ()), "test_short_type_name");
    }
}
