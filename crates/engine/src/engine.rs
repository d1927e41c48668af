//! Operation scheduling and execution.
//!
//! The [`Engine`] owns every in-flight [`Operation`]: it deduplicates
//! equivalent requests by key, admits queued work against a
//! reachability-aware concurrency budget, retries network failures with
//! backoff, parks token-gated operations when the session expires, and
//! persists downloaded content through the configured stores.
//!
//! All contended bookkeeping lives behind a single mutex so dedup
//! check-and-insert, admission, and terminal cleanup each observe one
//! consistent snapshot.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use courier_core::{
    ContentStore, CourierError, Method, Operation, OperationKey, PlainStore, Response, Target,
};
use courier_crypto::{EncryptedStore, MasterKey};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::events::{EngineEvent, Reachability};
use crate::transport::{
    HttpTransport, ProgressHooks, Transport, TransportBody, TransportError, TransportRequest,
    TransportResponse,
};

/// Capacity of the engine event channel. Slow subscribers observe a lag
/// error rather than blocking the engine.
const EVENT_CAPACITY: usize = 64;

/// Notified (at most once per expiry epoch) when a `401` parks operations
/// for a session refresh. The observer is expected to obtain fresh
/// credentials, call [`Engine::configure`] with the new target, and then
/// release the parked work via [`Engine::replay_token_wait_queue`] (or drop
/// it via [`Engine::fail_token_wait_queue`]).
pub trait SessionObserver: Send + Sync {
    /// The current access token was rejected by the backend.
    fn session_expired(&self);
}

/// Contended scheduling state. `active` is the dedup index: every
/// non-terminal operation the engine knows about, whether queued, parked,
/// or running.
struct Scheduler {
    active: HashMap<OperationKey, Arc<Operation>>,
    queue: VecDeque<OperationKey>,
    token_wait: VecDeque<OperationKey>,
    running: usize,
    suspended: bool,
    reachability: Reachability,
    /// Set when a session-expiry signal has been delivered for the current
    /// epoch; cleared on configure/replay/fail so the next expiry signals
    /// again.
    refresh_signaled: bool,
}

impl Scheduler {
    fn new() -> Self {
        Self {
            active: HashMap::new(),
            queue: VecDeque::new(),
            token_wait: VecDeque::new(),
            running: 0,
            suspended: false,
            reachability: Reachability::WifiOrWired,
            refresh_signaled: false,
        }
    }

    fn concurrency_cap(&self, config: &EngineConfig) -> usize {
        match self.reachability {
            Reachability::CellularWan => config.wan_concurrency,
            Reachability::WifiOrWired | Reachability::Unreachable => config.wifi_concurrency,
        }
    }

    /// Drop terminal operations and any queue entries that no longer point
    /// at a live operation.
    fn purge(&mut self) {
        let Self {
            active,
            queue,
            token_wait,
            ..
        } = self;
        active.retain(|_, op| !op.is_terminal());
        queue.retain(|key| active.contains_key(key));
        token_wait.retain(|key| active.contains_key(key));
    }

    /// Index of the next admissible queue entry: highest priority first,
    /// FIFO within a priority class. An operation with live dependencies is
    /// skipped until they finish (a dependency is live while its key is
    /// still in `active`).
    fn pick_next(&self) -> Option<usize> {
        let mut best: Option<(u8, usize)> = None;
        for (idx, key) in self.queue.iter().enumerate() {
            let Some(op) = self.active.get(key) else {
                continue;
            };
            if op
                .dependencies()
                .iter()
                .any(|dep| self.active.contains_key(dep))
            {
                continue;
            }
            let rank = op.priority().rank();
            match best {
                Some((best_rank, _)) if best_rank <= rank => {}
                _ => best = Some((rank, idx)),
            }
        }
        best.map(|(_, idx)| idx)
    }
}

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    transport: Option<Arc<dyn Transport>>,
    target: Option<Target>,
    master_key: Option<MasterKey>,
}

impl EngineBuilder {
    /// Start from the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            transport: None,
            target: None,
            master_key: None,
        }
    }

    /// Replace the engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom transport instead of the default HTTP transport.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Configure the initial target.
    #[must_use]
    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    /// Key for encrypted-at-rest downloads. Without one the engine
    /// generates an ephemeral key, so encrypted files do not survive the
    /// process.
    #[must_use]
    pub fn with_master_key(mut self, key: MasterKey) -> Self {
        self.master_key = Some(key);
        self
    }

    /// Build the engine.
    #[must_use]
    pub fn build(self) -> Arc<Engine> {
        let encrypted: Arc<dyn ContentStore> = Arc::new(
            self.master_key
                .map_or_else(EncryptedStore::ephemeral, EncryptedStore::new),
        );
        let headers = self.config.custom_headers.clone();
        Arc::new(Engine {
            config: self.config,
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(HttpTransport::new())),
            target: RwLock::new(self.target.map(Arc::new)),
            headers: Mutex::new(headers),
            scheduler: Mutex::new(Scheduler::new()),
            events: broadcast::channel(EVENT_CAPACITY).0,
            session_observer: Mutex::new(None),
            encrypted_store: encrypted,
            plain_store: Arc::new(PlainStore),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The operation engine. See the [module docs](self) for an overview.
pub struct Engine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    target: RwLock<Option<Arc<Target>>>,
    headers: Mutex<HashMap<String, String>>,
    scheduler: Mutex<Scheduler>,
    events: broadcast::Sender<EngineEvent>,
    session_observer: Mutex<Option<Arc<dyn SessionObserver>>>,
    encrypted_store: Arc<dyn ContentStore>,
    plain_store: Arc<dyn ContentStore>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sched = self.scheduler.lock();
        f.debug_struct("Engine")
            .field("active", &sched.active.len())
            .field("queued", &sched.queue.len())
            .field("token_wait", &sched.token_wait.len())
            .field("running", &sched.running)
            .field("suspended", &sched.suspended)
            .field("reachability", &sched.reachability)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Start building an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    // -- Target and session ------------------------------------------------

    /// Install a new target, replacing the old one wholesale.
    ///
    /// Clears the session-expiry latch; when the new target carries a
    /// token, operations parked for one are released back into the queue.
    pub fn configure(self: &Arc<Self>, target: Target) {
        let has_token = target.has_token();
        *self.target.write() = Some(Arc::new(target));
        {
            let mut sched = self.scheduler.lock();
            sched.refresh_signaled = false;
            Self::drain_token_wait_into_queue(&mut sched, has_token);
        }
        self.pump();
    }

    /// The currently configured target, if any.
    #[must_use]
    pub fn current_target(&self) -> Option<Arc<Target>> {
        self.target.read().clone()
    }

    /// Register the session-expiry observer, replacing any earlier one.
    pub fn set_session_observer(&self, observer: Arc<dyn SessionObserver>) {
        *self.session_observer.lock() = Some(observer);
    }

    /// Set an engine-level default header, applied to every request unless
    /// an operation sets the same header itself.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.lock().insert(name.into(), value.into());
    }

    /// Remove an engine-level default header.
    pub fn remove_header(&self, name: &str) {
        self.headers.lock().remove(name);
    }

    /// Subscribe to engine lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // -- Building operations -----------------------------------------------

    /// Build an operation against the current target with the configured
    /// default timeout. The operation is not enqueued yet.
    #[must_use]
    pub fn build_operation(
        &self,
        url: impl Into<String>,
        params: Vec<(String, String)>,
        method: Method,
        use_ssl: bool,
    ) -> Arc<Operation> {
        let target = self.current_target();
        // With no target yet the operation defaults to token-less; the URL
        // must then be absolute by the time it executes.
        let placeholder;
        let target = match &target {
            Some(target) => target.as_ref(),
            None => {
                placeholder = Target::new(String::new());
                &placeholder
            }
        };
        Operation::build_with_timeout(
            url,
            params,
            method,
            use_ssl,
            target,
            self.config.default_timeout,
        )
    }

    /// Build a GET operation.
    #[must_use]
    pub fn get(&self, url: impl Into<String>, params: Vec<(String, String)>) -> Arc<Operation> {
        self.build_operation(url, params, Method::Get, true)
    }

    /// Build a POST operation.
    #[must_use]
    pub fn post(&self, url: impl Into<String>, params: Vec<(String, String)>) -> Arc<Operation> {
        self.build_operation(url, params, Method::Post, true)
    }

    /// Build a PUT operation.
    #[must_use]
    pub fn put(&self, url: impl Into<String>, params: Vec<(String, String)>) -> Arc<Operation> {
        self.build_operation(url, params, Method::Put, true)
    }

    /// Build a DELETE operation.
    #[must_use]
    pub fn delete(&self, url: impl Into<String>, params: Vec<(String, String)>) -> Arc<Operation> {
        self.build_operation(url, params, Method::Delete, true)
    }

    /// Build a PATCH operation.
    #[must_use]
    pub fn patch(&self, url: impl Into<String>, params: Vec<(String, String)>) -> Arc<Operation> {
        self.build_operation(url, params, Method::Patch, true)
    }

    /// Build a HEAD operation.
    #[must_use]
    pub fn head(&self, url: impl Into<String>, params: Vec<(String, String)>) -> Arc<Operation> {
        self.build_operation(url, params, Method::Head, true)
    }

    // -- Enqueue -----------------------------------------------------------

    /// Submit an operation for execution.
    ///
    /// When a live operation with the same key already exists, the new
    /// operation's observers are merged onto it and the live operation is
    /// returned; the duplicate never executes. Operations requiring an
    /// access token while none is configured are parked in the token-wait
    /// queue and the session observer is signaled.
    pub fn enqueue(self: &Arc<Self>, op: Arc<Operation>) -> Result<Arc<Operation>, CourierError> {
        op.validate()?;

        let needs_token =
            op.requires_access_token() && !self.current_target().is_some_and(|t| t.has_token());

        let (merged_into, signal) = {
            let mut sched = self.scheduler.lock();
            sched.purge();
            if let Some(existing) = sched.active.get(op.key()) {
                (Some(Arc::clone(existing)), false)
            } else {
                if !op.mark_queued() {
                    return Err(CourierError::InvalidState(
                        "operation was already enqueued or cancelled".into(),
                    ));
                }
                sched.active.insert(op.key().clone(), Arc::clone(&op));
                let signal = if needs_token {
                    sched.token_wait.push_back(op.key().clone());
                    !std::mem::replace(&mut sched.refresh_signaled, true)
                } else {
                    sched.queue.push_back(op.key().clone());
                    false
                };
                (None, signal)
            }
        };

        if let Some(existing) = merged_into {
            debug!(key = %op.key(), "merging duplicate enqueue onto live operation");
            existing.adopt_observers(op.take_observers());
            return Ok(existing);
        }

        if signal {
            self.signal_session_expired();
        } else if !needs_token {
            self.pump();
        }
        Ok(op)
    }

    // -- Queries -----------------------------------------------------------

    /// Look up a live operation by key.
    #[must_use]
    pub fn find_active(&self, key: &OperationKey) -> Option<Arc<Operation>> {
        self.scheduler.lock().active.get(key).cloned()
    }

    /// Look up a live operation by request shape.
    #[must_use]
    pub fn find_active_request(
        &self,
        method: Method,
        url: &str,
        params: &[(String, String)],
    ) -> Option<Arc<Operation>> {
        self.find_active(&OperationKey::compute(method, url, params))
    }

    /// Whether any live operation carries the tag.
    #[must_use]
    pub fn has_pending_with_tag(&self, tag: &str) -> bool {
        self.scheduler
            .lock()
            .active
            .values()
            .any(|op| op.tag().as_deref() == Some(tag))
    }

    /// All live operations carrying the tag.
    #[must_use]
    pub fn operations_with_tag(&self, tag: &str) -> Vec<Arc<Operation>> {
        self.scheduler
            .lock()
            .active
            .values()
            .filter(|op| op.tag().as_deref() == Some(tag))
            .cloned()
            .collect()
    }

    /// Number of live operations (queued, parked, or running).
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.scheduler.lock().active.len()
    }

    /// Number of attempts currently executing.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.scheduler.lock().running
    }

    /// Number of operations parked for a session refresh.
    #[must_use]
    pub fn token_wait_count(&self) -> usize {
        self.scheduler.lock().token_wait.len()
    }

    /// Whether the backend is currently reachable.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.scheduler.lock().reachability.is_reachable()
    }

    // -- Control -----------------------------------------------------------

    /// Cancel every live operation. Cancel handlers fire synchronously;
    /// results of attempts still in flight are discarded on arrival.
    pub fn cancel_all(&self) {
        let ops: Vec<_> = {
            let mut sched = self.scheduler.lock();
            sched.queue.clear();
            sched.token_wait.clear();
            sched.active.drain().map(|(_, op)| op).collect()
        };
        let mut any = false;
        for op in ops {
            any |= op.cancel();
        }
        if any {
            let _ = self.events.send(EngineEvent::OperationsCancelled);
        }
    }

    /// Cancel every live operation carrying the tag.
    pub fn cancel_all_with_tag(&self, tag: &str) {
        let ops: Vec<_> = {
            let mut sched = self.scheduler.lock();
            let tagged: Vec<OperationKey> = sched
                .active
                .iter()
                .filter(|(_, op)| op.tag().as_deref() == Some(tag))
                .map(|(key, _)| key.clone())
                .collect();
            let ops: Vec<_> = tagged
                .iter()
                .filter_map(|key| sched.active.remove(key))
                .collect();
            sched.queue.retain(|key| !tagged.contains(key));
            sched.token_wait.retain(|key| !tagged.contains(key));
            ops
        };
        let mut any = false;
        for op in ops {
            any |= op.cancel();
        }
        if any {
            let _ = self.events.send(EngineEvent::OperationsCancelled);
        }
    }

    /// Halt admission. Running attempts finish; queued operations keep
    /// their order.
    pub fn suspend_all(&self) {
        let changed = {
            let mut sched = self.scheduler.lock();
            !std::mem::replace(&mut sched.suspended, true)
        };
        if changed {
            debug!("admission suspended");
            let _ = self.events.send(EngineEvent::Suspended);
        }
    }

    /// Resume admission in the order operations were queued.
    pub fn resume_all(self: &Arc<Self>) {
        let changed = {
            let mut sched = self.scheduler.lock();
            std::mem::replace(&mut sched.suspended, false)
        };
        if changed {
            debug!("admission resumed");
            let _ = self.events.send(EngineEvent::Resumed);
        }
        self.pump();
    }

    /// Feed a reachability change in from the platform monitor.
    pub fn on_reachability_changed(self: &Arc<Self>, reachability: Reachability) {
        let changed = {
            let mut sched = self.scheduler.lock();
            std::mem::replace(&mut sched.reachability, reachability) != reachability
        };
        if changed {
            debug!(?reachability, "reachability changed");
            let _ = self
                .events
                .send(EngineEvent::ReachabilityChanged(reachability));
        }
        self.pump();
    }

    /// Fail every operation parked for a session refresh with `error`.
    /// Used when the refresh itself fails.
    pub fn fail_token_wait_queue(&self, error: CourierError) {
        let ops: Vec<_> = {
            let mut sched = self.scheduler.lock();
            sched.refresh_signaled = false;
            let keys: Vec<_> = sched.token_wait.drain(..).collect();
            keys.iter()
                .filter_map(|key| sched.active.remove(key))
                .collect()
        };
        for op in ops {
            warn!(key = %op.key(), %error, "failing token-parked operation");
            op.fail_with(error.clone(), None);
        }
    }

    /// Release parked operations back into the queue, preserving their park
    /// order, and resume admission of them. Operations that require an
    /// access token stay parked while the target still has none; they are
    /// never submitted without a credential.
    pub fn replay_token_wait_queue(self: &Arc<Self>) {
        let has_token = self.current_target().is_some_and(|t| t.has_token());
        {
            let mut sched = self.scheduler.lock();
            sched.refresh_signaled = false;
            Self::drain_token_wait_into_queue(&mut sched, has_token);
        }
        self.pump();
    }

    /// Cancel everything and drop the target and session latch. The engine
    /// is reusable after a fresh [`Engine::configure`].
    pub fn cleanup(&self) {
        self.cancel_all();
        *self.target.write() = None;
        let mut sched = self.scheduler.lock();
        sched.suspended = false;
        sched.refresh_signaled = false;
    }

    // -- Scheduling internals ----------------------------------------------

    /// Released operations go to the queue front so they run before work
    /// enqueued while the session was expired. Token-requiring operations
    /// stay parked (in order) when no token is available.
    fn drain_token_wait_into_queue(sched: &mut Scheduler, has_token: bool) {
        let mut still_parked = VecDeque::new();
        while let Some(key) = sched.token_wait.pop_back() {
            let gated = !has_token
                && sched
                    .active
                    .get(&key)
                    .is_some_and(|op| op.requires_access_token());
            if gated {
                still_parked.push_front(key);
            } else {
                sched.queue.push_front(key);
            }
        }
        sched.token_wait = still_parked;
    }

    fn signal_session_expired(&self) {
        debug!("session expired, signaling observer");
        let observer = self.session_observer.lock().clone();
        if let Some(observer) = observer {
            observer.session_expired();
        }
    }

    /// Admit queued operations until the concurrency budget is exhausted or
    /// nothing is admissible. Re-invoked after every state change that can
    /// free budget or unblock a dependency.
    fn pump(self: &Arc<Self>) {
        loop {
            let op = {
                let mut sched = self.scheduler.lock();
                sched.purge();
                if sched.suspended || !sched.reachability.is_reachable() {
                    return;
                }
                if sched.running >= sched.concurrency_cap(&self.config) {
                    return;
                }
                let Some(idx) = sched.pick_next() else {
                    return;
                };
                let Some(key) = sched.queue.remove(idx) else {
                    return;
                };
                let Some(op) = sched.active.get(&key).cloned() else {
                    continue;
                };
                if !op.try_start() {
                    // Cancelled while queued.
                    sched.active.remove(&key);
                    continue;
                }
                sched.running += 1;
                op
            };
            debug!(key = %op.key(), attempt = op.attempts(), "starting attempt");
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.run_attempt(op).await;
            });
        }
    }

    async fn run_attempt(self: Arc<Self>, op: Arc<Operation>) {
        let target = self.current_target();
        let parts = match op.assemble_request(target.as_deref()) {
            Ok(parts) => parts,
            Err(err) => {
                op.fail_with(err, None);
                self.finish_attempt(&op);
                return;
            }
        };

        let mut headers = self.headers.lock().clone();
        for (name, value) in parts.headers {
            headers.insert(name, value);
        }
        if op.requires_access_token()
            && let Some(token) = target.as_deref().and_then(|t| t.access_token.as_deref())
        {
            headers
                .entry("Authorization".to_string())
                .or_insert_with(|| format!("Bearer {token}"));
        }

        let request = TransportRequest {
            method: op.method(),
            url: parts.url,
            headers,
            body: parts.body,
            cache: op.cache_policy(),
            destination: op.destination_path().map(|path| spool_path(&path)),
        };
        let hooks = {
            let upload_op = Arc::clone(&op);
            let download_op = Arc::clone(&op);
            ProgressHooks {
                upload: Some(Arc::new(move |fraction| {
                    upload_op.notify_upload_progress(fraction);
                })),
                download: Some(Arc::new(move |fraction| {
                    download_op.notify_download_progress(fraction);
                })),
                expected_size: op.expected_size(),
            }
        };

        let timeout = op.timeout();
        let outcome = tokio::time::timeout(timeout, self.transport.execute(request, hooks)).await;
        match outcome {
            Err(_) | Ok(Err(TransportError::Timeout)) => {
                self.handle_network_error(op, CourierError::Timeout(timeout));
            }
            Ok(Err(TransportError::Connection(message))) => {
                self.handle_network_error(op, CourierError::Network(message));
            }
            Ok(Err(TransportError::InvalidRequest(message))) => {
                op.fail_with(CourierError::Configuration(message), None);
                self.finish_attempt(&op);
            }
            Ok(Err(TransportError::Sink(message))) => {
                op.fail_with(CourierError::Storage(message), None);
                self.finish_attempt(&op);
            }
            Ok(Ok(response)) => self.handle_response(&op, response),
        }
    }

    /// Retry with backoff when budget remains, otherwise fail. The
    /// operation leaves the queue during the backoff sleep and rejoins at
    /// the front when it elapses.
    fn handle_network_error(self: &Arc<Self>, op: Arc<Operation>, error: CourierError) {
        if op.retry_budget_remains() && op.requeue(false) {
            let failed_attempt = op.attempts().saturating_sub(1);
            let delay = self.config.backoff.delay_for(failed_attempt);
            warn!(
                key = %op.key(),
                attempt = failed_attempt + 1,
                ?delay,
                %error,
                "network error, retrying"
            );
            {
                let mut sched = self.scheduler.lock();
                sched.running = sched.running.saturating_sub(1);
            }
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                {
                    let mut sched = engine.scheduler.lock();
                    if sched.active.contains_key(op.key()) {
                        sched.queue.push_front(op.key().clone());
                    }
                }
                engine.pump();
            });
            self.pump();
        } else {
            op.fail_with(error, None);
            self.finish_attempt(&op);
        }
    }

    fn handle_response(self: &Arc<Self>, op: &Arc<Operation>, response: TransportResponse) {
        if response.status == 401 && op.requires_access_token() {
            self.park_for_token(op);
            return;
        }
        if (200..300).contains(&response.status) {
            match self.materialize(op, response) {
                Ok(response) => {
                    op.complete_with(response);
                }
                Err(err) => {
                    op.fail_with(err, None);
                }
            }
        } else {
            let status = response.status;
            let body = match response.body {
                TransportBody::Memory(bytes) => bytes,
                // Transports spool only success bodies; anything else here
                // is read back so the error message survives.
                TransportBody::File { path, .. } => {
                    let bytes = std::fs::read(&path).map(Bytes::from).unwrap_or_default();
                    let _ = std::fs::remove_file(&path);
                    bytes
                }
            };
            let message = String::from_utf8_lossy(&body).into_owned();
            let cached = Response::in_memory(status, response.headers, body);
            op.fail_with(CourierError::HttpStatus { status, message }, Some(cached));
        }
        self.finish_attempt(op);
    }

    /// Finalize the body for download operations: spooled bytes are sealed
    /// into the destination (encrypted unless the operation opted out),
    /// buffered bytes are written through the content store.
    fn materialize(
        &self,
        op: &Operation,
        response: TransportResponse,
    ) -> Result<Response, CourierError> {
        let TransportResponse {
            status,
            headers,
            body,
        } = response;
        match (op.destination_path(), body) {
            (Some(path), TransportBody::File { path: spool, .. }) => {
                let store = self.store_for(op);
                if op.encrypt_output() {
                    let bytes =
                        std::fs::read(&spool).map_err(|e| CourierError::Storage(e.to_string()))?;
                    store.store(&bytes, &path)?;
                    let _ = std::fs::remove_file(&spool);
                } else {
                    std::fs::rename(&spool, &path)
                        .map_err(|e| CourierError::Storage(e.to_string()))?;
                }
                op.set_content_store(store);
                Ok(Response::in_file(status, headers, path))
            }
            (Some(path), TransportBody::Memory(bytes)) => {
                let store = self.store_for(op);
                store.store(&bytes, &path)?;
                op.set_content_store(store);
                Ok(Response::in_file(status, headers, path))
            }
            (None, TransportBody::Memory(bytes)) => Ok(Response::in_memory(status, headers, bytes)),
            (None, TransportBody::File { path: spool, .. }) => {
                let bytes =
                    std::fs::read(&spool).map_err(|e| CourierError::Storage(e.to_string()))?;
                let _ = std::fs::remove_file(&spool);
                Ok(Response::in_memory(status, headers, Bytes::from(bytes)))
            }
        }
    }

    fn store_for(&self, op: &Operation) -> Arc<dyn ContentStore> {
        if op.encrypt_output() {
            Arc::clone(&self.encrypted_store)
        } else {
            Arc::clone(&self.plain_store)
        }
    }

    /// Park a rejected operation for a session refresh. The attempt is
    /// refunded so waiting never consumes retry budget, and the observer is
    /// signaled once per expiry epoch.
    fn park_for_token(self: &Arc<Self>, op: &Arc<Operation>) {
        if !op.requeue(true) {
            // Cancelled while the 401 was in flight.
            self.finish_attempt(op);
            return;
        }
        let signal = {
            let mut sched = self.scheduler.lock();
            sched.running = sched.running.saturating_sub(1);
            sched.token_wait.push_back(op.key().clone());
            !std::mem::replace(&mut sched.refresh_signaled, true)
        };
        debug!(key = %op.key(), "parked for session refresh");
        if signal {
            self.signal_session_expired();
        }
        self.pump();
    }

    /// Terminal cleanup after an attempt: free budget, drop the dedup
    /// entry, and admit whatever became eligible.
    fn finish_attempt(self: &Arc<Self>, op: &Operation) {
        {
            let mut sched = self.scheduler.lock();
            sched.active.remove(op.key());
            sched.running = sched.running.saturating_sub(1);
        }
        self.pump();
    }
}

/// Sibling spool file for an in-flight download. The destination itself
/// only ever holds a complete, finalized body.
fn spool_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use courier_core::{OperationState, Priority};
    use tokio::sync::Semaphore;

    use super::*;

    fn target() -> Target {
        Target::new("api.example.com")
            .with_api_base_path("/v1")
            .with_access_token("tok-1")
    }

    fn ok_response(body: &str) -> TransportResponse {
        TransportResponse {
            status: 200,
            headers: HashMap::new(),
            body: TransportBody::Memory(Bytes::copy_from_slice(body.as_bytes())),
        }
    }

    /// Scripted transport: pops the next step per call, repeating the last
    /// step when the script runs dry.
    struct MockTransport {
        script: Mutex<Vec<Result<TransportResponse, TransportError>>>,
        calls: AtomicUsize,
        urls: Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn new(script: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
            let mut script = script;
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                urls: Mutex::new(Vec::new()),
            })
        }

        fn always_ok() -> Arc<Self> {
            Self::new(vec![Ok(ok_response("{}"))])
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn execute(
            &self,
            request: TransportRequest,
            _hooks: ProgressHooks,
        ) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().push(request.url);
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop().unwrap()
            } else {
                script.first().cloned().unwrap_or_else(|| Ok(ok_response("{}")))
            }
        }
    }

    /// Blocks every call on a zero-permit semaphore so tests can hold
    /// operations in flight and release them one by one.
    struct GateTransport {
        gate: Semaphore,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl GateTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }

        async fn wait_in_flight(&self, n: usize) {
            for _ in 0..200 {
                if self.in_flight.load(Ordering::SeqCst) >= n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("never saw {n} calls in flight");
        }
    }

    #[async_trait]
    impl Transport for GateTransport {
        async fn execute(
            &self,
            _request: TransportRequest,
            _hooks: ProgressHooks,
        ) -> Result<TransportResponse, TransportError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ok_response("{}"))
        }
    }

    /// Writes the payload to the request's spool destination the way the
    /// HTTP transport does for downloads, never buffering it in the
    /// response.
    struct StreamingTransport {
        payload: &'static [u8],
    }

    #[async_trait]
    impl Transport for StreamingTransport {
        async fn execute(
            &self,
            request: TransportRequest,
            _hooks: ProgressHooks,
        ) -> Result<TransportResponse, TransportError> {
            let path = request
                .destination
                .expect("download request must carry a spool destination");
            tokio::fs::write(&path, self.payload)
                .await
                .map_err(|e| TransportError::Sink(e.to_string()))?;
            Ok(TransportResponse {
                status: 200,
                headers: HashMap::new(),
                body: TransportBody::File {
                    path,
                    len: self.payload.len() as u64,
                },
            })
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn engine_with(transport: Arc<dyn Transport>) -> Arc<Engine> {
        init_tracing();
        Engine::builder()
            .with_target(target())
            .with_transport(transport)
            .build()
    }

    async fn wait_terminal(op: &Arc<Operation>) {
        for _ in 0..200 {
            if op.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("operation never reached a terminal state: {op:?}");
    }

    #[tokio::test]
    async fn executes_and_completes() {
        let transport = MockTransport::always_ok();
        let engine = engine_with(transport.clone());
        let op = engine.get("/widgets", vec![]);
        let op = engine.enqueue(op).unwrap();
        wait_terminal(&op).await;
        assert_eq!(op.state(), OperationState::Completed);
        assert_eq!(op.response_status(), Some(200));
        assert_eq!(transport.calls(), 1);
        assert_eq!(engine.active_count(), 0);
    }

    #[tokio::test]
    async fn resolves_relative_urls_and_sends_bearer_token() {
        let transport = MockTransport::always_ok();
        let engine = engine_with(transport.clone());
        let op = engine.get("/widgets", vec![("q".into(), "x".into())]);
        let op = engine.enqueue(op).unwrap();
        wait_terminal(&op).await;
        let urls = transport.urls.lock();
        assert_eq!(urls[0], "https://api.example.com/v1/widgets?q=x");
    }

    #[tokio::test]
    async fn duplicate_enqueue_merges_and_executes_once() {
        let gate = GateTransport::new();
        let engine = engine_with(gate.clone());

        let first = engine.enqueue(engine.get("/same", vec![])).unwrap();
        gate.wait_in_flight(1).await;

        let completions = Arc::new(AtomicUsize::new(0));
        let dup = engine.get("/same", vec![]);
        let seen = Arc::clone(&completions);
        dup.add_completion_and_error_handlers(
            Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|err| panic!("unexpected error: {err}")),
        );
        let merged = engine.enqueue(dup).unwrap();
        assert!(Arc::ptr_eq(&merged, &first));
        assert_eq!(engine.active_count(), 1);

        gate.release(1);
        wait_terminal(&first).await;
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(gate.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_is_bounded_by_budget() {
        let transport = MockTransport::new(vec![
            Err(TransportError::Connection("reset".into())),
            Err(TransportError::Connection("reset".into())),
            Err(TransportError::Connection("reset".into())),
        ]);
        let config = EngineConfig {
            backoff: crate::retry::RetryBackoff::Fixed {
                delay: Duration::from_millis(1),
            },
            ..EngineConfig::default()
        };
        let engine = Engine::builder()
            .with_target(target())
            .with_transport(transport.clone())
            .with_config(config)
            .build();

        let op = engine.get("/flaky", vec![]);
        op.set_retry_on_network_error(true);
        op.set_max_retries(2);
        let op = engine.enqueue(op).unwrap();
        wait_terminal(&op).await;

        assert_eq!(op.state(), OperationState::Failed);
        assert!(matches!(op.error(), Some(CourierError::Network(_))));
        // Initial attempt plus two retries.
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn retry_recovers_when_a_later_attempt_succeeds() {
        let transport = MockTransport::new(vec![
            Err(TransportError::Connection("reset".into())),
            Ok(ok_response("{\"ok\":true}")),
        ]);
        let config = EngineConfig {
            backoff: crate::retry::RetryBackoff::Fixed {
                delay: Duration::from_millis(1),
            },
            ..EngineConfig::default()
        };
        let engine = Engine::builder()
            .with_target(target())
            .with_transport(transport.clone())
            .with_config(config)
            .build();

        let op = engine.get("/flaky", vec![]);
        op.set_retry_on_network_error(true);
        op.set_max_retries(5);
        let op = engine.enqueue(op).unwrap();
        wait_terminal(&op).await;

        assert_eq!(op.state(), OperationState::Completed);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn no_retry_when_disabled() {
        let transport =
            MockTransport::new(vec![Err(TransportError::Connection("reset".into()))]);
        let engine = engine_with(transport.clone());
        let op = engine.enqueue(engine.get("/down", vec![])).unwrap();
        wait_terminal(&op).await;
        assert_eq!(op.state(), OperationState::Failed);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn http_error_is_terminal_not_retried() {
        let transport = MockTransport::new(vec![Ok(TransportResponse {
            status: 503,
            headers: HashMap::new(),
            body: TransportBody::Memory(Bytes::from_static(b"unavailable")),
        })]);
        let engine = engine_with(transport.clone());
        let op = engine.get("/busy", vec![]);
        op.set_retry_on_network_error(true);
        let op = engine.enqueue(op).unwrap();
        wait_terminal(&op).await;
        assert_eq!(op.state(), OperationState::Failed);
        assert!(matches!(
            op.error(),
            Some(CourierError::HttpStatus { status: 503, .. })
        ));
        assert_eq!(op.response_status(), Some(503));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn logical_error_fails_despite_200() {
        let transport = MockTransport::new(vec![Ok(ok_response(
            "[{\"errorCode\":\"INVALID_FIELD\",\"message\":\"no such column\"}]",
        ))]);
        let engine = engine_with(transport);
        let op = engine.enqueue(engine.get("/query", vec![])).unwrap();
        wait_terminal(&op).await;
        assert_eq!(op.state(), OperationState::Failed);
        assert!(matches!(op.error(), Some(CourierError::LogicalPayload(_))));
    }

    #[tokio::test]
    async fn concurrency_respects_wifi_cap() {
        let gate = GateTransport::new();
        let config = EngineConfig {
            wifi_concurrency: 2,
            ..EngineConfig::default()
        };
        let engine = Engine::builder()
            .with_target(target())
            .with_transport(gate.clone())
            .with_config(config)
            .build();

        let ops: Vec<_> = (0..5)
            .map(|i| {
                engine
                    .enqueue(engine.get(format!("/bulk/{i}"), vec![]))
                    .unwrap()
            })
            .collect();

        gate.wait_in_flight(2).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(engine.running_count(), 2);

        gate.release(5);
        for op in &ops {
            wait_terminal(op).await;
        }
        assert!(gate.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn concurrency_respects_wan_cap() {
        let gate = GateTransport::new();
        let config = EngineConfig {
            wan_concurrency: 1,
            ..EngineConfig::default()
        };
        let engine = Engine::builder()
            .with_target(target())
            .with_transport(gate.clone())
            .with_config(config)
            .build();
        engine.on_reachability_changed(Reachability::CellularWan);

        let ops: Vec<_> = (0..3)
            .map(|i| {
                engine
                    .enqueue(engine.get(format!("/cell/{i}"), vec![]))
                    .unwrap()
            })
            .collect();

        gate.wait_in_flight(1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(engine.running_count(), 1);

        gate.release(3);
        for op in &ops {
            wait_terminal(op).await;
        }
        assert!(gate.peak.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn unreachable_halts_admission_and_recovery_resumes() {
        let transport = MockTransport::always_ok();
        let engine = engine_with(transport.clone());
        engine.on_reachability_changed(Reachability::Unreachable);

        let op = engine.enqueue(engine.get("/later", vec![])).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.calls(), 0);
        assert_eq!(op.state(), OperationState::Queued);

        engine.on_reachability_changed(Reachability::WifiOrWired);
        wait_terminal(&op).await;
        assert_eq!(op.state(), OperationState::Completed);
    }

    #[tokio::test]
    async fn suspend_and_resume_preserve_fifo_order() {
        let transport = MockTransport::always_ok();
        let engine = engine_with(transport.clone());
        engine.suspend_all();

        let a = engine.enqueue(engine.get("/first", vec![])).unwrap();
        let b = engine.enqueue(engine.get("/second", vec![])).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.calls(), 0);

        engine.resume_all();
        wait_terminal(&a).await;
        wait_terminal(&b).await;
        let urls = transport.urls.lock();
        assert!(urls[0].ends_with("/first"));
        assert!(urls[1].ends_with("/second"));
    }

    #[tokio::test]
    async fn high_priority_jumps_the_queue() {
        let transport = MockTransport::always_ok();
        let engine = engine_with(transport.clone());
        engine.suspend_all();

        let low = engine.get("/low", vec![]);
        low.set_priority(Priority::Low);
        let low = engine.enqueue(low).unwrap();
        let high = engine.get("/high", vec![]);
        high.set_priority(Priority::High);
        let high = engine.enqueue(high).unwrap();

        engine.resume_all();
        wait_terminal(&low).await;
        wait_terminal(&high).await;
        let urls = transport.urls.lock();
        assert!(urls[0].ends_with("/high"));
        assert!(urls[1].ends_with("/low"));
    }

    #[tokio::test]
    async fn dependency_defers_admission() {
        let gate = GateTransport::new();
        let engine = engine_with(gate.clone());

        let parent = engine.enqueue(engine.get("/parent", vec![])).unwrap();
        gate.wait_in_flight(1).await;

        let child = engine.get("/child", vec![]);
        child.add_dependency(parent.key().clone());
        let child = engine.enqueue(child).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(child.state(), OperationState::Queued);
        assert_eq!(gate.peak.load(Ordering::SeqCst), 1);

        gate.release(1);
        wait_terminal(&parent).await;
        gate.release(1);
        wait_terminal(&child).await;
        assert_eq!(child.state(), OperationState::Completed);
    }

    struct CountingObserver(AtomicUsize);

    impl SessionObserver for CountingObserver {
        fn session_expired(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn unauthorized_parks_and_signals_once() {
        let transport = MockTransport::new(vec![
            Ok(TransportResponse {
                status: 401,
                headers: HashMap::new(),
                body: TransportBody::Memory(Bytes::new()),
            }),
            Ok(TransportResponse {
                status: 401,
                headers: HashMap::new(),
                body: TransportBody::Memory(Bytes::new()),
            }),
            Ok(ok_response("{}")),
        ]);
        let engine = engine_with(transport.clone());
        let observer = Arc::new(CountingObserver(AtomicUsize::new(0)));
        engine.set_session_observer(observer.clone());

        let a = engine.enqueue(engine.get("/a", vec![])).unwrap();
        let b = engine.enqueue(engine.get("/b", vec![])).unwrap();

        for _ in 0..200 {
            if engine.token_wait_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(engine.token_wait_count(), 2);
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
        assert_eq!(a.state(), OperationState::Queued);
        assert_eq!(b.state(), OperationState::Queued);

        engine.configure(target().with_access_token("tok-2"));
        engine.replay_token_wait_queue();
        wait_terminal(&a).await;
        wait_terminal(&b).await;
        // One 401 each, then one successful replayed attempt each.
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn failed_refresh_drains_token_wait_queue() {
        let transport = MockTransport::new(vec![Ok(TransportResponse {
            status: 401,
            headers: HashMap::new(),
            body: TransportBody::Memory(Bytes::new()),
        })]);
        let engine = engine_with(transport);
        let op = engine.enqueue(engine.get("/secure", vec![])).unwrap();

        for _ in 0..200 {
            if engine.token_wait_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        engine.fail_token_wait_queue(CourierError::AuthExpired);
        wait_terminal(&op).await;
        assert_eq!(op.state(), OperationState::Failed);
        assert_eq!(op.error(), Some(CourierError::AuthExpired));
        assert_eq!(engine.active_count(), 0);
    }

    #[tokio::test]
    async fn enqueue_without_token_parks_immediately() {
        let transport = MockTransport::always_ok();
        let engine = Engine::builder()
            .with_target(Target::new("api.example.com"))
            .with_transport(transport.clone())
            .build();
        let observer = Arc::new(CountingObserver(AtomicUsize::new(0)));
        engine.set_session_observer(observer.clone());

        let op = engine.get("/secure", vec![]);
        op.set_requires_access_token(true);
        let op = engine.enqueue(op).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.calls(), 0);
        assert_eq!(engine.token_wait_count(), 1);
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);

        engine.configure(target());
        wait_terminal(&op).await;
        assert_eq!(op.state(), OperationState::Completed);
    }

    #[tokio::test]
    async fn replay_without_token_keeps_gated_work_parked() {
        let transport = MockTransport::always_ok();
        let engine = Engine::builder()
            .with_target(Target::new("api.example.com"))
            .with_transport(transport.clone())
            .build();

        let op = engine.get("/secure", vec![]);
        op.set_requires_access_token(true);
        let op = engine.enqueue(op).unwrap();
        assert_eq!(engine.token_wait_count(), 1);

        // Replay with no token configured must not submit the operation.
        engine.replay_token_wait_queue();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.calls(), 0);
        assert_eq!(engine.token_wait_count(), 1);
        assert_eq!(op.state(), OperationState::Queued);

        engine.configure(target());
        wait_terminal(&op).await;
        assert_eq!(op.state(), OperationState::Completed);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn cancel_all_is_idempotent_and_broadcasts() {
        let gate = GateTransport::new();
        let engine = engine_with(gate.clone());
        let mut events = engine.subscribe();

        let running = engine.enqueue(engine.get("/running", vec![])).unwrap();
        gate.wait_in_flight(1).await;
        let queued = engine.get("/queued", vec![]);
        queued.set_tag("batch");
        let queued = engine.enqueue(queued).unwrap();

        engine.cancel_all();
        assert_eq!(running.state(), OperationState::Cancelled);
        assert_eq!(queued.state(), OperationState::Cancelled);
        assert_eq!(engine.active_count(), 0);
        assert_eq!(events.recv().await.unwrap(), EngineEvent::OperationsCancelled);

        // Second cancel finds nothing and stays silent.
        engine.cancel_all();
        gate.release(1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        // The in-flight result was discarded.
        assert_eq!(running.state(), OperationState::Cancelled);
    }

    #[tokio::test]
    async fn cancel_by_tag_leaves_other_work_alone() {
        let transport = MockTransport::always_ok();
        let engine = engine_with(transport);
        engine.suspend_all();

        let tagged = engine.get("/tagged", vec![]);
        tagged.set_tag("sync");
        let tagged = engine.enqueue(tagged).unwrap();
        let other = engine.enqueue(engine.get("/other", vec![])).unwrap();

        assert!(engine.has_pending_with_tag("sync"));
        assert_eq!(engine.operations_with_tag("sync").len(), 1);

        engine.cancel_all_with_tag("sync");
        assert_eq!(tagged.state(), OperationState::Cancelled);
        assert!(!engine.has_pending_with_tag("sync"));

        engine.resume_all();
        wait_terminal(&other).await;
        assert_eq!(other.state(), OperationState::Completed);
    }

    #[tokio::test]
    async fn download_is_encrypted_at_rest_and_readable_through_the_operation() {
        let transport = MockTransport::new(vec![Ok(ok_response("secret payload"))]);
        let engine = engine_with(transport);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");

        let op = engine.get("/blob", vec![]);
        op.set_destination_path(&path);
        let op = engine.enqueue(op).unwrap();
        wait_terminal(&op).await;

        assert_eq!(op.state(), OperationState::Completed);
        let on_disk = std::fs::read(&path).unwrap();
        assert_ne!(on_disk, b"secret payload");
        assert_eq!(op.response_as_data().unwrap().as_ref(), b"secret payload");
    }

    #[tokio::test]
    async fn download_without_encryption_writes_plaintext() {
        let transport = MockTransport::new(vec![Ok(ok_response("public payload"))]);
        let engine = engine_with(transport);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.bin");

        let op = engine.get("/blob", vec![]);
        op.set_destination_path(&path);
        op.set_encrypt_output(false);
        let op = engine.enqueue(op).unwrap();
        wait_terminal(&op).await;

        assert_eq!(std::fs::read(&path).unwrap(), b"public payload");
    }

    #[tokio::test]
    async fn spooled_download_is_sealed_encrypted_into_place() {
        let transport = Arc::new(StreamingTransport {
            payload: b"streamed secret",
        });
        let engine = engine_with(transport);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let spool = dir.path().join("blob.bin.part");

        let op = engine.get("/blob", vec![]);
        op.set_destination_path(&path);
        let op = engine.enqueue(op).unwrap();
        wait_terminal(&op).await;

        assert_eq!(op.state(), OperationState::Completed);
        let on_disk = std::fs::read(&path).unwrap();
        assert_ne!(on_disk, b"streamed secret");
        assert_eq!(op.response_as_data().unwrap().as_ref(), b"streamed secret");
        // The spool file is consumed when the body is sealed into place.
        assert!(!spool.exists());
    }

    #[tokio::test]
    async fn spooled_download_without_encryption_renames_into_place() {
        let transport = Arc::new(StreamingTransport {
            payload: b"streamed public",
        });
        let engine = engine_with(transport);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.bin");
        let spool = dir.path().join("plain.bin.part");

        let op = engine.get("/blob", vec![]);
        op.set_destination_path(&path);
        op.set_encrypt_output(false);
        let op = engine.enqueue(op).unwrap();
        wait_terminal(&op).await;

        assert_eq!(std::fs::read(&path).unwrap(), b"streamed public");
        assert!(!spool.exists());
    }

    #[tokio::test]
    async fn timeout_lands_in_timed_out() {
        let gate = GateTransport::new();
        let engine = engine_with(gate);
        let op = engine.get("/slow", vec![]);
        op.set_timeout(Duration::from_millis(20));
        let op = engine.enqueue(op).unwrap();
        wait_terminal(&op).await;
        assert_eq!(op.state(), OperationState::TimedOut);
        assert!(matches!(op.error(), Some(CourierError::Timeout(_))));
    }

    #[tokio::test]
    async fn cleanup_cancels_and_resets() {
        let transport = MockTransport::always_ok();
        let engine = engine_with(transport);
        engine.suspend_all();
        let op = engine.enqueue(engine.get("/pending", vec![])).unwrap();

        engine.cleanup();
        assert_eq!(op.state(), OperationState::Cancelled);
        assert_eq!(engine.active_count(), 0);
        assert!(engine.current_target().is_none());

        // Reusable after a fresh configure.
        engine.configure(target());
        let op = engine.enqueue(engine.get("/again", vec![])).unwrap();
        wait_terminal(&op).await;
        assert_eq!(op.state(), OperationState::Completed);
    }
}
