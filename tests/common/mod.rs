//! Deterministic in-memory transport backend for engine tests.
//!
//! `MockCore` pairs an `ExternalWorkQueue` with a manually advanced clock, so
//! tests drive queue hops and timer fires explicitly instead of sleeping.
//! `MockRequest` records everything the engine writes into a shared
//! `Connection` the test can inspect.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use http::{Method, StatusCode};
use parking_lot::Mutex;
use serde_json::Value;

use tunebridge::response::HeaderVec;
use tunebridge::router::ParamVec;
use tunebridge::server::{
    parse_query_string, RequestCallback, RequestCore, SerializedResponse, ServerCore,
};
use tunebridge::timer::{ManualClock, TimerFactory, TimerQueue};
use tunebridge::work_queue::{ExternalWorkQueue, WorkQueue};

pub struct MockCore {
    pub clock: ManualClock,
    pub timers: TimerQueue,
    pub queue: Arc<ExternalWorkQueue>,
    callback: Mutex<Option<RequestCallback>>,
    pub bound: Mutex<Vec<(u16, bool)>>,
    pub log: Arc<Mutex<Vec<String>>>,
    exit: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

/// Route engine logs through the test writer; `RUST_LOG` filters as usual.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl MockCore {
    pub fn new() -> Arc<Self> {
        Self::with_log(Arc::new(Mutex::new(Vec::new())))
    }

    /// Shared log variant for lifecycle-ordering assertions.
    pub fn with_log(log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        init_tracing();
        let (wake_tx, wake_rx) = unbounded();
        let hook = wake_tx.clone();
        let queue = Arc::new(ExternalWorkQueue::new(move || {
            let _ = hook.send(());
        }));
        let clock = ManualClock::new();
        let timers = TimerQueue::new(Arc::new(clock.clone()));
        Arc::new(MockCore {
            clock,
            timers,
            queue,
            callback: Mutex::new(None),
            bound: Mutex::new(Vec::new()),
            log,
            exit: AtomicBool::new(false),
            wake_tx,
            wake_rx,
        })
    }

    /// Hand one request to the engine, as the transport thread would.
    pub fn deliver(&self, request: MockRequest) {
        let callback = self.callback.lock();
        if let Some(callback) = callback.as_ref() {
            callback(Box::new(request));
        }
    }

    /// One transport-loop turn: run queued tasks, then due timers.
    pub fn turn(&self) {
        self.queue.drain();
        self.timers.execute();
    }

    /// Enough turns to follow any chain of queue hops in one call.
    pub fn settle(&self) {
        for _ in 0..8 {
            self.turn();
        }
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
        self.settle();
    }
}

impl ServerCore for MockCore {
    fn work_queue(&self) -> Arc<dyn WorkQueue> {
        Arc::clone(&self.queue) as Arc<dyn WorkQueue>
    }

    fn timer_factory(&self) -> Arc<dyn TimerFactory> {
        Arc::new(self.timers.clone())
    }

    fn set_request_callback(&self, callback: RequestCallback) {
        *self.callback.lock() = Some(callback);
    }

    fn bind(&self, port: u16, allow_remote: bool) -> io::Result<()> {
        self.log.lock().push(format!("bind:{port}"));
        self.bound.lock().push((port, allow_remote));
        Ok(())
    }

    fn run(&self) {
        self.log.lock().push("run".to_string());
        loop {
            if self.exit.load(Ordering::SeqCst) {
                break;
            }
            self.queue.drain();
            self.timers.execute();
            let _ = self.wake_rx.recv_timeout(Duration::from_millis(1));
        }
        self.queue.drain();
        self.log.lock().push("run-end".to_string());
    }

    fn exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.send(());
    }
}

/// What the engine wrote to one mock connection.
pub struct Connection {
    pub response: Mutex<Option<SerializedResponse>>,
    pub begun: Mutex<Option<SerializedResponse>>,
    pub chunks: Mutex<Vec<Vec<u8>>>,
    pub aborted: AtomicBool,
    pub ended: AtomicBool,
    /// Flip to `false` to simulate a client that went away.
    pub writable: AtomicBool,
}

impl Connection {
    fn new() -> Arc<Self> {
        Arc::new(Connection {
            response: Mutex::new(None),
            begun: Mutex::new(None),
            chunks: Mutex::new(Vec::new()),
            aborted: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            writable: AtomicBool::new(true),
        })
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.response.lock().as_ref().map(|r| r.status)
    }

    pub fn json_body(&self) -> Option<Value> {
        self.response
            .lock()
            .as_ref()
            .and_then(|r| serde_json::from_slice(&r.body).ok())
    }

    pub fn header(&self, name: &str) -> Option<String> {
        let find = |r: &SerializedResponse| {
            r.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };
        self.response
            .lock()
            .as_ref()
            .and_then(&find)
            .or_else(|| self.begun.lock().as_ref().and_then(&find))
    }

    pub fn chunk_strings(&self) -> Vec<String> {
        self.chunks
            .lock()
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

pub struct MockRequest {
    method: Method,
    path: String,
    headers: HeaderVec,
    query: ParamVec,
    body: Option<Vec<u8>>,
    connection: Arc<Connection>,
}

impl MockRequest {
    /// Build a request from a method and a target like `/api/player?fast=1`.
    pub fn new(method: Method, target: &str) -> (Self, Arc<Connection>) {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query_string(query)),
            None => (target, ParamVec::new()),
        };
        let connection = Connection::new();
        (
            MockRequest {
                method,
                path: path.to_string(),
                headers: HeaderVec::new(),
                query,
                body: None,
                connection: Arc::clone(&connection),
            },
            connection,
        )
    }

    pub fn get(target: &str) -> (Self, Arc<Connection>) {
        Self::new(Method::GET, target)
    }

    pub fn post(target: &str, body: &[u8]) -> (Self, Arc<Connection>) {
        let (mut request, connection) = Self::new(Method::POST, target);
        request.body = Some(body.to_vec());
        (request, connection)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((Arc::from(name), value.to_string()));
        self
    }
}

impl RequestCore for MockRequest {
    fn method(&self) -> Method {
        self.method.clone()
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn headers(&self) -> HeaderVec {
        self.headers.clone()
    }

    fn query_params(&self) -> ParamVec {
        self.query.clone()
    }

    fn body(&self) -> Option<Vec<u8>> {
        self.body.clone()
    }

    fn abort(&mut self) {
        self.connection.aborted.store(true, Ordering::SeqCst);
    }

    fn send_response(&mut self, response: SerializedResponse) {
        *self.connection.response.lock() = Some(response);
    }

    fn send_response_begin(&mut self, response: SerializedResponse) {
        *self.connection.begun.lock() = Some(response);
    }

    fn send_response_body(&mut self, data: &[u8]) -> bool {
        if !self.connection.writable.load(Ordering::SeqCst) {
            return false;
        }
        self.connection.chunks.lock().push(data.to_vec());
        true
    }

    fn send_response_end(&mut self) {
        self.connection.ended.store(true, Ordering::SeqCst);
    }
}
