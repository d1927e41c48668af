//! The operation object: a single schedulable network request with its own
//! lifecycle state machine, ordered observer sets, and response record.
//!
//! Operations are shared as `Arc<Operation>` between the caller, the engine,
//! and in-flight execution tasks. All mutable state sits behind one mutex;
//! terminal transitions go through a single-transition guard so exactly one
//! of {completion, error, cancel} observer sets fires, exactly once, no
//! matter how execution, cancellation, and late observer registration race.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::body::{
    self, BodyEncoder, FilePart, FORM_URLENCODED, multipart_boundary, multipart_content_type,
};
use crate::response::{Response, ResponseBody, detect_logical_error};
use crate::store::{ContentStore, PlainStore};
use crate::{CourierError, Method, OperationKey, OperationState, Target};

/// Invoked when the operation completes successfully.
pub type CompletionHandler = Arc<dyn Fn(&Operation) + Send + Sync>;
/// Invoked when the operation fails (transport, HTTP, logical, or auth).
pub type ErrorHandler = Arc<dyn Fn(&CourierError) + Send + Sync>;
/// Invoked when the operation is cancelled.
pub type CancelHandler = Arc<dyn Fn(&Operation) + Send + Sync>;
/// Invoked with a completion fraction in `0.0..=1.0`.
pub type ProgressHandler = Arc<dyn Fn(f64) + Send + Sync>;

/// Delegate interface for callers that prefer a single typed observer over
/// individual handler registrations. All methods have empty defaults.
pub trait OperationDelegate: Send + Sync {
    /// The operation reached `Completed`.
    fn on_finish(&self, _operation: &Operation) {}
    /// The operation reached `Failed`.
    fn on_fail(&self, _operation: &Operation, _error: &CourierError) {}
    /// The operation was cancelled.
    fn on_cancel(&self, _operation: &Operation) {}
    /// The operation reached `TimedOut`.
    fn on_timeout(&self, _operation: &Operation) {}
}

/// Admission priority hint. Within a priority class admission is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Lower rank is admitted first.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// Response cache behavior forwarded to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Always reload from origin, ignoring any local cache.
    #[default]
    IgnoreLocalCache,
    /// Let the transport use its local cache.
    UseLocalCache,
}

/// Assembled request data handed to the transport layer.
#[derive(Debug, Clone)]
pub struct RequestParts {
    /// Fully resolved absolute URL (query string included for bodyless
    /// methods).
    pub url: String,
    /// Operation-level headers. Engine defaults are merged underneath these.
    pub headers: HashMap<String, String>,
    /// Content type and encoded body for POST/PUT/PATCH.
    pub body: Option<(String, Vec<u8>)>,
}

/// Observer sets detached from a duplicate operation so they can be adopted
/// by the live operation with the same key.
pub struct ObserverBundle {
    pairs: Vec<(CompletionHandler, ErrorHandler)>,
    cancels: Vec<CancelHandler>,
    uploads: Vec<ProgressHandler>,
    downloads: Vec<ProgressHandler>,
    delegate: Option<Arc<dyn OperationDelegate>>,
}

#[derive(Default)]
struct Observers {
    pairs: Vec<(CompletionHandler, ErrorHandler)>,
    cancels: Vec<CancelHandler>,
    uploads: Vec<ProgressHandler>,
    downloads: Vec<ProgressHandler>,
    delegate: Option<Arc<dyn OperationDelegate>>,
}

struct Inner {
    state: OperationState,
    timeout: Duration,
    retry_on_network_error: bool,
    /// `0` means unbounded.
    max_retries: u32,
    requires_access_token: bool,
    custom_headers: HashMap<String, String>,
    tag: Option<String>,
    priority: Priority,
    depends_on: Vec<OperationKey>,
    destination_path: Option<PathBuf>,
    encrypt_output: bool,
    expected_size: Option<u64>,
    cache_policy: CachePolicy,
    body_encoder: Option<(BodyEncoder, String)>,
    attachments: Vec<FilePart>,
    /// Execution attempts started (incremented on `Queued → Running`).
    attempts: u32,
    observers: Observers,
    store: Option<Arc<dyn ContentStore>>,
    response: Option<Response>,
    error: Option<CourierError>,
}

/// A single schedulable network request.
///
/// Built by the engine (or [`Operation::build`]) from a request shape and a
/// [`Target`], customized through setters, then enqueued. Identity for
/// deduplication is the [`OperationKey`] over method, URL, and ordered
/// parameters, fixed at build time.
pub struct Operation {
    key: OperationKey,
    method: Method,
    url: String,
    params: Vec<(String, String)>,
    use_ssl: bool,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("key", &self.key)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Outcome of a terminal transition, captured under the lock and delivered
/// after it is released.
enum Fire {
    Completion(Vec<(CompletionHandler, ErrorHandler)>, Option<Arc<dyn OperationDelegate>>),
    Error(
        Vec<(CompletionHandler, ErrorHandler)>,
        Option<Arc<dyn OperationDelegate>>,
        CourierError,
        bool, // timed out
    ),
    Cancel(Vec<CancelHandler>, Option<Arc<dyn OperationDelegate>>),
}

impl Operation {
    /// Build an operation from a request shape and the current target.
    ///
    /// Defaults: 180 s timeout, `requires_access_token = target.has_token()`,
    /// `encrypt_output = true`, retry on network error disabled.
    #[must_use]
    pub fn build(
        url: impl Into<String>,
        params: Vec<(String, String)>,
        method: Method,
        use_ssl: bool,
        target: &Target,
    ) -> Arc<Self> {
        Self::build_with_timeout(url, params, method, use_ssl, target, Duration::from_secs(180))
    }

    /// Like [`Operation::build`] with an explicit default timeout (the
    /// engine passes its configured default here).
    #[must_use]
    pub fn build_with_timeout(
        url: impl Into<String>,
        params: Vec<(String, String)>,
        method: Method,
        use_ssl: bool,
        target: &Target,
        timeout: Duration,
    ) -> Arc<Self> {
        let url = url.into();
        let key = OperationKey::compute(method, &url, &params);
        Arc::new(Self {
            key,
            method,
            url,
            params,
            use_ssl,
            inner: Mutex::new(Inner {
                state: OperationState::Created,
                timeout,
                retry_on_network_error: false,
                max_retries: 0,
                requires_access_token: target.has_token(),
                custom_headers: HashMap::new(),
                tag: None,
                priority: Priority::Normal,
                depends_on: Vec::new(),
                destination_path: None,
                encrypt_output: true,
                expected_size: None,
                cache_policy: CachePolicy::default(),
                body_encoder: None,
                attachments: Vec::new(),
                attempts: 0,
                observers: Observers::default(),
                store: None,
                response: None,
                error: None,
            }),
        })
    }

    // -- Identity and request shape ---------------------------------------

    /// Dedup identity key.
    #[must_use]
    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    /// HTTP method.
    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// URL as given at build time (possibly relative).
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Ordered request parameters.
    #[must_use]
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Whether the request uses HTTPS when resolved against a target.
    #[must_use]
    pub fn use_ssl(&self) -> bool {
        self.use_ssl
    }

    // -- Configuration -----------------------------------------------------

    /// Per-attempt timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.lock().timeout = timeout;
    }

    /// Per-attempt timeout currently configured.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.lock().timeout
    }

    /// Enable automatic retry when an attempt fails with a network error.
    pub fn set_retry_on_network_error(&self, retry: bool) {
        self.inner.lock().retry_on_network_error = retry;
    }

    /// Whether network-error retry is enabled.
    #[must_use]
    pub fn retry_on_network_error(&self) -> bool {
        self.inner.lock().retry_on_network_error
    }

    /// Bound the retry count. `0` (the default) means unbounded.
    pub fn set_max_retries(&self, max_retries: u32) {
        self.inner.lock().max_retries = max_retries;
    }

    /// Configured retry bound.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.inner.lock().max_retries
    }

    /// Override whether this operation needs an access token before it may
    /// execute.
    pub fn set_requires_access_token(&self, requires: bool) {
        self.inner.lock().requires_access_token = requires;
    }

    /// Whether execution is gated on a valid access token.
    #[must_use]
    pub fn requires_access_token(&self) -> bool {
        self.inner.lock().requires_access_token
    }

    /// Set an operation-level header, overriding the engine default of the
    /// same name.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.lock().custom_headers.insert(name.into(), value.into());
    }

    /// Remove a previously set operation-level header.
    pub fn remove_header(&self, name: &str) {
        self.inner.lock().custom_headers.remove(name);
    }

    /// Free-form grouping label used by tag-scoped engine operations.
    pub fn set_tag(&self, tag: impl Into<String>) {
        self.inner.lock().tag = Some(tag.into());
    }

    /// Current tag, if any.
    #[must_use]
    pub fn tag(&self) -> Option<String> {
        self.inner.lock().tag.clone()
    }

    /// Admission priority hint.
    pub fn set_priority(&self, priority: Priority) {
        self.inner.lock().priority = priority;
    }

    /// Configured priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.inner.lock().priority
    }

    /// Declare that this operation must not be admitted until the operation
    /// with `key` has reached a terminal state.
    pub fn add_dependency(&self, key: OperationKey) {
        self.inner.lock().depends_on.push(key);
    }

    /// Declared dependencies.
    #[must_use]
    pub fn dependencies(&self) -> Vec<OperationKey> {
        self.inner.lock().depends_on.clone()
    }

    /// Stream the response body to `path` instead of buffering it.
    pub fn set_destination_path(&self, path: impl Into<PathBuf>) {
        self.inner.lock().destination_path = Some(path.into());
    }

    /// Configured destination path.
    #[must_use]
    pub fn destination_path(&self) -> Option<PathBuf> {
        self.inner.lock().destination_path.clone()
    }

    /// Encrypt content written to the destination path. On by default.
    pub fn set_encrypt_output(&self, encrypt: bool) {
        self.inner.lock().encrypt_output = encrypt;
    }

    /// Whether destination output is encrypted.
    #[must_use]
    pub fn encrypt_output(&self) -> bool {
        self.inner.lock().encrypt_output
    }

    /// Expected download size, overriding Content-Length for progress math.
    pub fn set_expected_size(&self, size: u64) {
        self.inner.lock().expected_size = Some(size);
    }

    /// Configured expected size.
    #[must_use]
    pub fn expected_size(&self) -> Option<u64> {
        self.inner.lock().expected_size
    }

    /// Cache policy forwarded to the transport.
    pub fn set_cache_policy(&self, policy: CachePolicy) {
        self.inner.lock().cache_policy = policy;
    }

    /// Configured cache policy.
    #[must_use]
    pub fn cache_policy(&self) -> CachePolicy {
        self.inner.lock().cache_policy
    }

    /// Install a custom param-to-body encoder for POST/PUT/PATCH.
    ///
    /// Mutually exclusive with file attachments; the conflict is surfaced
    /// as a `Configuration` error at enqueue time.
    pub fn set_custom_body_encoder(&self, encoder: BodyEncoder, content_type: impl Into<String>) {
        self.inner.lock().body_encoder = Some((encoder, content_type.into()));
    }

    /// Append a multipart file attachment. Parts keep attachment order in
    /// the encoded body.
    pub fn attach_file(
        &self,
        data: impl Into<Bytes>,
        field_name: Option<String>,
        file_name: impl Into<String>,
        mime_type: Option<String>,
    ) {
        self.inner.lock().attachments.push(FilePart {
            data: data.into(),
            field_name,
            file_name: file_name.into(),
            mime_type,
        });
    }

    /// Install the content store used to persist and read back the
    /// destination file. The engine sets this before execution.
    pub fn set_content_store(&self, store: Arc<dyn ContentStore>) {
        self.inner.lock().store = Some(store);
    }

    /// Set the delegate. Only one delegate is held; a later call replaces
    /// the earlier one.
    pub fn set_delegate(&self, delegate: Arc<dyn OperationDelegate>) {
        self.inner.lock().observers.delegate = Some(delegate);
    }

    /// Check configuration consistency. Called by the engine at enqueue.
    pub fn validate(&self) -> Result<(), CourierError> {
        let inner = self.inner.lock();
        if inner.body_encoder.is_some() && !inner.attachments.is_empty() {
            return Err(CourierError::Configuration(
                "custom body encoder and multipart attachments are mutually exclusive".into(),
            ));
        }
        Ok(())
    }

    // -- Observers ---------------------------------------------------------

    /// Register a completion/error handler pair. The pair is atomic: for a
    /// given outcome exactly one of the two fires.
    ///
    /// If the operation is already terminal the matching handler fires
    /// immediately and synchronously with the cached outcome; a pair added
    /// to an already-cancelled operation receives an `InvalidState` error so
    /// registration is never silently dropped.
    pub fn add_completion_and_error_handlers(
        &self,
        on_complete: CompletionHandler,
        on_error: ErrorHandler,
    ) {
        let outcome = {
            let mut inner = self.inner.lock();
            if !inner.state.is_terminal() {
                inner.observers.pairs.push((on_complete.clone(), on_error.clone()));
                return;
            }
            late_outcome(&inner)
        };
        match outcome {
            Some(err) => on_error(&err),
            None => on_complete(self),
        }
    }

    /// Register a cancel handler. Fires immediately when the operation is
    /// already cancelled; dropped when the operation already finished some
    /// other way (cancellation can no longer occur).
    pub fn add_cancel_handler(&self, on_cancel: CancelHandler) {
        let fire_now = {
            let mut inner = self.inner.lock();
            match inner.state {
                OperationState::Cancelled => true,
                state if state.is_terminal() => return,
                _ => {
                    inner.observers.cancels.push(on_cancel.clone());
                    return;
                }
            }
        };
        if fire_now {
            on_cancel(self);
        }
    }

    /// Register upload and/or download progress handlers. No-ops once the
    /// operation is terminal.
    pub fn add_progress_handlers(
        &self,
        upload: Option<ProgressHandler>,
        download: Option<ProgressHandler>,
    ) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        if let Some(handler) = upload {
            inner.observers.uploads.push(handler);
        }
        if let Some(handler) = download {
            inner.observers.downloads.push(handler);
        }
    }

    /// Detach all observers, leaving this operation without any. Used when
    /// a duplicate enqueue is merged onto the live operation with the same
    /// key.
    #[must_use]
    pub fn take_observers(&self) -> ObserverBundle {
        let mut inner = self.inner.lock();
        let observers = std::mem::take(&mut inner.observers);
        ObserverBundle {
            pairs: observers.pairs,
            cancels: observers.cancels,
            uploads: observers.uploads,
            downloads: observers.downloads,
            delegate: observers.delegate,
        }
    }

    /// Adopt observers detached from a duplicate operation. When this
    /// operation is already terminal the adopted completion/error pairs fire
    /// immediately with the cached outcome (same policy as late
    /// registration).
    pub fn adopt_observers(&self, bundle: ObserverBundle) {
        // Exactly one branch consumes the bundle: a live operation absorbs
        // it under the lock, a terminal one carries it out for delivery.
        let late = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                Some((inner.state, late_outcome(&inner), bundle))
            } else {
                inner.observers.pairs.extend(bundle.pairs);
                inner.observers.cancels.extend(bundle.cancels);
                inner.observers.uploads.extend(bundle.uploads);
                inner.observers.downloads.extend(bundle.downloads);
                if inner.observers.delegate.is_none() {
                    inner.observers.delegate = bundle.delegate;
                }
                None
            }
        };
        let Some((state, outcome, bundle)) = late else {
            return;
        };
        if state == OperationState::Cancelled {
            for cancel in bundle.cancels {
                cancel(self);
            }
        }
        for (on_complete, on_error) in bundle.pairs {
            match &outcome {
                Some(err) => on_error(err),
                None => on_complete(self),
            }
        }
    }

    /// Fan a fraction out to upload progress handlers.
    pub fn notify_upload_progress(&self, fraction: f64) {
        let handlers = self.inner.lock().observers.uploads.clone();
        for handler in handlers {
            handler(fraction);
        }
    }

    /// Fan a fraction out to download progress handlers.
    pub fn notify_download_progress(&self, fraction: f64) {
        let handlers = self.inner.lock().observers.downloads.clone();
        for handler in handlers {
            handler(fraction);
        }
    }

    // -- Lifecycle ---------------------------------------------------------

    /// Current state.
    #[must_use]
    pub fn state(&self) -> OperationState {
        self.inner.lock().state
    }

    /// Whether the operation has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Execution attempts started so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    /// `Created → Queued`. Returns `false` if the operation is not freshly
    /// built (already enqueued or cancelled).
    pub fn mark_queued(&self) -> bool {
        self.transition(OperationState::Queued)
    }

    /// `Queued → Running`, counting one attempt. Returns `false` when the
    /// operation was cancelled while queued.
    pub fn try_start(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.can_transition(OperationState::Running) {
            return false;
        }
        inner.state = OperationState::Running;
        inner.attempts += 1;
        true
    }

    /// `Running → Queued` for a retry or token-refresh requeue.
    ///
    /// `refund_attempt` is set on the token path so waiting for a session
    /// refresh does not consume retry budget.
    pub fn requeue(&self, refund_attempt: bool) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.can_transition(OperationState::Queued) {
            return false;
        }
        inner.state = OperationState::Queued;
        if refund_attempt {
            inner.attempts = inner.attempts.saturating_sub(1);
        }
        true
    }

    /// Whether retry budget remains after the attempt that just failed.
    #[must_use]
    pub fn retry_budget_remains(&self) -> bool {
        let inner = self.inner.lock();
        inner.retry_on_network_error
            && (inner.max_retries == 0 || inner.attempts < inner.max_retries + 1)
    }

    /// Terminal success transition with logical-error promotion.
    ///
    /// A 2xx in-memory body matching the single-error-object convention is
    /// promoted to a `LogicalPayload` failure: the error pair handlers fire
    /// and completion handlers do not, despite transport success. Returns
    /// `false` when the result arrives after cancellation and is discarded.
    pub fn complete_with(&self, response: Response) -> bool {
        let fire = {
            let mut inner = self.inner.lock();
            if !inner.state.can_transition(OperationState::Completed) {
                debug!(key = %self.key, state = %inner.state, "discarding late result");
                return false;
            }
            let logical = match response.body() {
                ResponseBody::Memory(bytes) => detect_logical_error(bytes),
                ResponseBody::File(_) => None,
            };
            inner.response = Some(response);
            match logical {
                Some(message) => {
                    let error = CourierError::LogicalPayload(message);
                    inner.state = OperationState::Failed;
                    inner.error = Some(error.clone());
                    Fire::Error(
                        std::mem::take(&mut inner.observers.pairs),
                        inner.observers.delegate.clone(),
                        error,
                        false,
                    )
                }
                None => {
                    inner.state = OperationState::Completed;
                    Fire::Completion(
                        std::mem::take(&mut inner.observers.pairs),
                        inner.observers.delegate.clone(),
                    )
                }
            }
        };
        self.deliver(fire);
        true
    }

    /// Terminal failure transition. `Timeout` errors land in `TimedOut`,
    /// everything else in `Failed`. An optional response carries the status
    /// code and headers of an HTTP-level failure. Returns `false` when the
    /// operation already reached a terminal state (e.g. cancelled).
    pub fn fail_with(&self, error: CourierError, response: Option<Response>) -> bool {
        let timed_out = matches!(error, CourierError::Timeout(_));
        let next = if timed_out {
            OperationState::TimedOut
        } else {
            OperationState::Failed
        };
        let fire = {
            let mut inner = self.inner.lock();
            if !inner.state.can_transition(next) {
                debug!(key = %self.key, state = %inner.state, "discarding late failure");
                return false;
            }
            inner.state = next;
            inner.error = Some(error.clone());
            if response.is_some() {
                inner.response = response;
            }
            Fire::Error(
                std::mem::take(&mut inner.observers.pairs),
                inner.observers.delegate.clone(),
                error,
                timed_out,
            )
        };
        self.deliver(fire);
        true
    }

    /// Cancel the operation. Valid from any non-terminal state; idempotent.
    ///
    /// Cancel handlers fire exactly once, synchronously on the calling
    /// thread. Any in-flight transport result that arrives afterwards is
    /// discarded by the transition guard.
    pub fn cancel(&self) -> bool {
        let fire = {
            let mut inner = self.inner.lock();
            if !inner.state.can_transition(OperationState::Cancelled) {
                return false;
            }
            inner.state = OperationState::Cancelled;
            // Completion/error pairs can never fire now; drop them.
            inner.observers.pairs.clear();
            Fire::Cancel(
                std::mem::take(&mut inner.observers.cancels),
                inner.observers.delegate.clone(),
            )
        };
        self.deliver(fire);
        true
    }

    fn transition(&self, next: OperationState) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.can_transition(next) {
            return false;
        }
        inner.state = next;
        true
    }

    fn deliver(&self, fire: Fire) {
        match fire {
            Fire::Completion(pairs, delegate) => {
                for (on_complete, _) in pairs {
                    on_complete(self);
                }
                if let Some(delegate) = delegate {
                    delegate.on_finish(self);
                }
            }
            Fire::Error(pairs, delegate, error, timed_out) => {
                for (_, on_error) in pairs {
                    on_error(&error);
                }
                if let Some(delegate) = delegate {
                    if timed_out {
                        delegate.on_timeout(self);
                    } else {
                        delegate.on_fail(self, &error);
                    }
                }
            }
            Fire::Cancel(cancels, delegate) => {
                for on_cancel in cancels {
                    on_cancel(self);
                }
                if let Some(delegate) = delegate {
                    delegate.on_cancel(self);
                }
            }
        }
    }

    // -- Results -----------------------------------------------------------

    /// Status code of the response, if one was received.
    #[must_use]
    pub fn response_status(&self) -> Option<u16> {
        self.inner.lock().response.as_ref().map(Response::status_code)
    }

    /// Headers of the response, if one was received.
    #[must_use]
    pub fn response_headers(&self) -> Option<HashMap<String, String>> {
        self.inner
            .lock()
            .response
            .as_ref()
            .map(|r| r.headers().clone())
    }

    /// The terminal error, if the operation failed.
    #[must_use]
    pub fn error(&self) -> Option<CourierError> {
        self.inner.lock().error.clone()
    }

    /// Raw response bytes. File-backed bodies are read back through the
    /// content store (decrypting when the output was encrypted). Valid only
    /// in a terminal state with a response.
    pub fn response_as_data(&self) -> Result<Bytes, CourierError> {
        let (response, store) = {
            let inner = self.inner.lock();
            if !inner.state.is_terminal() {
                return Err(CourierError::InvalidState(
                    "response is not available until the operation is terminal".into(),
                ));
            }
            let response = inner.response.clone().ok_or_else(|| {
                CourierError::InvalidState("operation finished without a response body".into())
            })?;
            (response, inner.store.clone())
        };
        let store = store.unwrap_or_else(|| Arc::new(PlainStore));
        response.bytes(store.as_ref())
    }

    /// Response body as text (lossy UTF-8).
    pub fn response_as_string(&self) -> Result<String, CourierError> {
        let bytes = self.response_as_data()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Response body parsed as JSON. Invalid JSON yields a
    /// `Deserialization` error, never a panic.
    pub fn response_as_json(&self) -> Result<serde_json::Value, CourierError> {
        let bytes = self.response_as_data()?;
        serde_json::from_slice(&bytes).map_err(|e| CourierError::Deserialization(e.to_string()))
    }

    // -- Request assembly --------------------------------------------------

    /// Resolve the URL against `target` and encode the request body.
    ///
    /// Resolution happens here, per attempt, so a target swapped between
    /// enqueue and execution (or between retries) is honored. Relative URLs
    /// with no configured target are a configuration error.
    pub fn assemble_request(&self, target: Option<&Target>) -> Result<RequestParts, CourierError> {
        self.validate()?;
        let inner = self.inner.lock();

        let absolute = self.url.starts_with("http://") || self.url.starts_with("https://");
        let resolved = if absolute {
            self.url.clone()
        } else {
            let target = target.ok_or_else(|| {
                CourierError::Configuration("relative URL with no target configured".into())
            })?;
            target.resolve(&self.url, self.use_ssl)
        };

        let headers = inner.custom_headers.clone();

        if !self.method.allows_body() {
            return Ok(RequestParts {
                url: body::append_query(&resolved, &self.params),
                headers,
                body: None,
            });
        }

        let body = if !inner.attachments.is_empty() {
            let boundary = multipart_boundary();
            let encoded = body::encode_multipart(&self.params, &inner.attachments, &boundary);
            (multipart_content_type(&boundary), encoded)
        } else if let Some((encoder, content_type)) = &inner.body_encoder {
            (content_type.clone(), encoder(&self.params).into_bytes())
        } else {
            (FORM_URLENCODED.to_owned(), body::encode_form(&self.params).into_bytes())
        };

        Ok(RequestParts {
            url: resolved,
            headers,
            body: Some(body),
        })
    }
}

/// Cached outcome for late observer registration: `Some(error)` routes to
/// the error handler, `None` to the completion handler. A cancelled
/// operation reports `InvalidState` so late pairs are signaled rather than
/// silently dropped.
fn late_outcome(inner: &Inner) -> Option<CourierError> {
    match inner.state {
        OperationState::Completed => None,
        OperationState::Cancelled => Some(
            inner
                .error
                .clone()
                .unwrap_or_else(|| CourierError::InvalidState("operation was cancelled".into())),
        ),
        _ => Some(
            inner
                .error
                .clone()
                .unwrap_or_else(|| CourierError::InvalidState("operation already finished".into())),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn target() -> Target {
        Target::new("api.example.com")
            .with_api_base_path("/v1")
            .with_access_token("tok")
    }

    fn op(method: Method) -> Arc<Operation> {
        Operation::build("/widgets", vec![("a".into(), "1".into())], method, true, &target())
    }

    fn response(body: &'static [u8]) -> Response {
        Response::in_memory(200, HashMap::new(), Bytes::from_static(body))
    }

    #[test]
    fn build_defaults() {
        let op = op(Method::Get);
        assert_eq!(op.state(), OperationState::Created);
        assert_eq!(op.timeout(), Duration::from_secs(180));
        assert!(op.requires_access_token());
        assert!(op.encrypt_output());
        assert!(!op.retry_on_network_error());
        assert_eq!(op.max_retries(), 0);
    }

    #[test]
    fn build_against_tokenless_target() {
        let op = Operation::build("/x", vec![], Method::Get, true, &Target::remote("h"));
        assert!(!op.requires_access_token());
    }

    #[test]
    fn completion_fires_once() {
        let op = op(Method::Get);
        let completions = Arc::new(AtomicU32::new(0));
        let errors = Arc::new(AtomicU32::new(0));
        let (c, e) = (completions.clone(), errors.clone());
        op.add_completion_and_error_handlers(
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(op.mark_queued());
        assert!(op.try_start());
        assert!(op.complete_with(response(b"{\"data\": 1}")));
        // A second terminal transition must be rejected.
        assert!(!op.complete_with(response(b"{}")));
        assert!(!op.fail_with(CourierError::Network("x".into()), None));

        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert_eq!(op.state(), OperationState::Completed);
    }

    #[test]
    fn logical_error_promotes_to_failure() {
        let op = op(Method::Get);
        let completions = Arc::new(AtomicU32::new(0));
        let errors = Arc::new(AtomicU32::new(0));
        let (c, e) = (completions.clone(), errors.clone());
        op.add_completion_and_error_handlers(
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            }),
        );
        op.mark_queued();
        op.try_start();
        assert!(op.complete_with(response(b"[{\"error\": \"boom\"}]")));

        assert_eq!(op.state(), OperationState::Failed);
        assert_eq!(completions.load(Ordering::SeqCst), 0);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(matches!(op.error(), Some(CourierError::LogicalPayload(_))));
        // Status and body remain available for inspection.
        assert_eq!(op.response_status(), Some(200));
    }

    #[test]
    fn cancel_is_idempotent_and_suppresses_results() {
        let op = op(Method::Get);
        let cancels = Arc::new(AtomicU32::new(0));
        let completions = Arc::new(AtomicU32::new(0));
        let cc = cancels.clone();
        op.add_cancel_handler(Arc::new(move |_| {
            cc.fetch_add(1, Ordering::SeqCst);
        }));
        let comp = completions.clone();
        op.add_completion_and_error_handlers(
            Arc::new(move |_| {
                comp.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|_| {}),
        );

        op.mark_queued();
        op.try_start();
        assert!(op.cancel());
        assert!(!op.cancel());
        // In-flight result arriving after cancellation is discarded.
        assert!(!op.complete_with(response(b"{}")));

        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert_eq!(completions.load(Ordering::SeqCst), 0);
        assert_eq!(op.state(), OperationState::Cancelled);
    }

    #[test]
    fn late_observers_fire_immediately() {
        let op = op(Method::Get);
        op.mark_queued();
        op.try_start();
        op.complete_with(response(b"{\"ok\": true}"));

        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        op.add_completion_and_error_handlers(
            Arc::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|_| panic!("completed operation must not route to error handler")),
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Late cancel handler on a completed operation is dropped.
        op.add_cancel_handler(Arc::new(|_| panic!("must not fire")));
        // Late progress handlers are a no-op.
        op.add_progress_handlers(Some(Arc::new(|_| panic!("must not fire"))), None);
        op.notify_upload_progress(0.5);
    }

    #[test]
    fn late_error_observer_on_failed_operation() {
        let op = op(Method::Get);
        op.mark_queued();
        op.try_start();
        op.fail_with(CourierError::Network("reset".into()), None);

        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        op.add_completion_and_error_handlers(
            Arc::new(|_| panic!("failed operation must not route to completion")),
            Arc::new(move |err| {
                assert!(err.is_network());
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_cancel_handler_on_cancelled_operation_fires() {
        let op = op(Method::Get);
        op.mark_queued();
        op.cancel();

        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        op.add_cancel_handler(Arc::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_lands_in_timed_out_state() {
        struct Watch(Arc<AtomicU32>);
        impl OperationDelegate for Watch {
            fn on_timeout(&self, _op: &Operation) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let op = op(Method::Get);
        let timeouts = Arc::new(AtomicU32::new(0));
        op.set_delegate(Arc::new(Watch(timeouts.clone())));

        op.mark_queued();
        op.try_start();
        op.fail_with(CourierError::Timeout(Duration::from_secs(1)), None);

        assert_eq!(op.state(), OperationState::TimedOut);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn requeue_and_retry_budget() {
        let op = op(Method::Get);
        op.set_retry_on_network_error(true);
        op.set_max_retries(2);

        op.mark_queued();
        assert!(op.try_start());
        assert_eq!(op.attempts(), 1);
        assert!(op.retry_budget_remains());
        assert!(op.requeue(false));

        assert!(op.try_start());
        assert_eq!(op.attempts(), 2);
        assert!(op.retry_budget_remains());
        assert!(op.requeue(false));

        assert!(op.try_start());
        assert_eq!(op.attempts(), 3);
        // 1 initial + 2 retries used up.
        assert!(!op.retry_budget_remains());
    }

    #[test]
    fn token_requeue_refunds_attempt() {
        let op = op(Method::Get);
        op.mark_queued();
        op.try_start();
        assert_eq!(op.attempts(), 1);
        assert!(op.requeue(true));
        assert_eq!(op.attempts(), 0);
    }

    #[test]
    fn observer_adoption_on_live_operation() {
        let winner = op(Method::Get);
        let duplicate = op(Method::Get);
        assert_eq!(winner.key(), duplicate.key());

        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        duplicate.add_completion_and_error_handlers(
            Arc::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|_| {}),
        );

        winner.adopt_observers(duplicate.take_observers());
        winner.mark_queued();
        winner.try_start();
        winner.complete_with(response(b"{}"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observer_adoption_on_terminal_operation_fires_now() {
        let winner = op(Method::Get);
        winner.mark_queued();
        winner.try_start();
        winner.complete_with(response(b"{}"));

        let duplicate = op(Method::Get);
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        duplicate.add_completion_and_error_handlers(
            Arc::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|_| {}),
        );
        winner.adopt_observers(duplicate.take_observers());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observer_adoption_on_cancelled_operation_delivers_full_bundle() {
        let winner = op(Method::Get);
        winner.mark_queued();
        winner.cancel();

        let duplicate = op(Method::Get);
        let cancels = Arc::new(AtomicU32::new(0));
        let errors = Arc::new(AtomicU32::new(0));
        let cc = cancels.clone();
        duplicate.add_cancel_handler(Arc::new(move |_| {
            cc.fetch_add(1, Ordering::SeqCst);
        }));
        let ee = errors.clone();
        duplicate.add_completion_and_error_handlers(
            Arc::new(|_| panic!("cancelled operation must not complete")),
            Arc::new(move |_| {
                ee.fetch_add(1, Ordering::SeqCst);
            }),
        );
        duplicate.add_progress_handlers(Some(Arc::new(|_| {})), None);

        winner.adopt_observers(duplicate.take_observers());
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn encoder_and_attachments_conflict() {
        let op = op(Method::Post);
        op.set_custom_body_encoder(
            Arc::new(|params| serde_json::to_string(&params).unwrap_or_default()),
            "application/json",
        );
        op.attach_file(Bytes::from_static(b"x"), None, "x.bin", None);
        assert!(matches!(
            op.validate(),
            Err(CourierError::Configuration(_))
        ));
        assert!(matches!(
            op.assemble_request(Some(&target())),
            Err(CourierError::Configuration(_))
        ));
    }

    #[test]
    fn assemble_get_appends_query() {
        let op = op(Method::Get);
        let parts = op.assemble_request(Some(&target())).unwrap();
        assert_eq!(parts.url, "https://api.example.com/v1/widgets?a=1");
        assert!(parts.body.is_none());
    }

    #[test]
    fn assemble_post_default_form_encoding() {
        let op = op(Method::Post);
        let parts = op.assemble_request(Some(&target())).unwrap();
        let (content_type, bytes) = parts.body.unwrap();
        assert_eq!(content_type, FORM_URLENCODED);
        assert_eq!(bytes, b"a=1");
        assert_eq!(parts.url, "https://api.example.com/v1/widgets");
    }

    #[test]
    fn assemble_custom_encoder() {
        let op = op(Method::Post);
        op.set_custom_body_encoder(
            Arc::new(|_| "{\"custom\":true}".to_owned()),
            "application/json",
        );
        let (content_type, bytes) = op
            .assemble_request(Some(&target()))
            .unwrap()
            .body
            .unwrap();
        assert_eq!(content_type, "application/json");
        assert_eq!(bytes, b"{\"custom\":true}");
    }

    #[test]
    fn assemble_multipart() {
        let op = op(Method::Post);
        op.attach_file(Bytes::from_static(b"data"), Some("f".into()), "f.txt", None);
        let (content_type, bytes) = op
            .assemble_request(Some(&target()))
            .unwrap()
            .body
            .unwrap();
        assert!(content_type.starts_with("multipart/form-data; boundary="));
        assert!(!bytes.is_empty());
    }

    #[test]
    fn assemble_relative_without_target_fails() {
        let op = op(Method::Get);
        assert!(matches!(
            op.assemble_request(None),
            Err(CourierError::Configuration(_))
        ));
    }

    #[test]
    fn results_unavailable_until_terminal() {
        let op = op(Method::Get);
        assert!(matches!(
            op.response_as_data(),
            Err(CourierError::InvalidState(_))
        ));
        op.mark_queued();
        op.try_start();
        op.complete_with(response(b"{\"n\": 7}"));
        assert_eq!(op.response_as_string().unwrap(), "{\"n\": 7}");
        assert_eq!(op.response_as_json().unwrap()["n"], 7);
    }

    #[test]
    fn invalid_json_is_an_error_not_a_panic() {
        let op = op(Method::Get);
        op.mark_queued();
        op.try_start();
        op.complete_with(response(b"not json"));
        assert!(matches!(
            op.response_as_json(),
            Err(CourierError::Deserialization(_))
        ));
    }
}
