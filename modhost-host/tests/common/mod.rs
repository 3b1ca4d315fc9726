//! Shared fixtures for host integration tests: guest WAT templates, package
//! writers, a recording connection and a scriptable Rust module.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use modhost_host::{HostConfig, HostError, LogCategory, Module, ModuleLogger};
use modhost_package::PackageBuilder;
use modhost_types::{Connection, ConnectionError, ConnectionId, Envelope, ModuleKind, Response};

// =============================================================================
// GUEST UNITS
// =============================================================================

/// Length of the canned `{"status":"OK","payload":{"pong":true}}` reply
/// every guest template stores at offset 0. Returning it as the packed i64
/// means `ptr = 0, len = OK_LEN`.
pub const OK_LEN: i64 = 39;

/// A guest unit with `memory`, a bump `mx_alloc` and the canned OK reply.
/// `imports` must only contain `(import ...)` fields; `body` holds the rest.
pub fn guest_wat(imports: &str, body: &str) -> String {
    format!(
        r#"(module
  {imports}
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 4096))
  (data (i32.const 0) "{{\"status\":\"OK\",\"payload\":{{\"pong\":true}}}}")
  (func (export "mx_alloc") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $len)))
    (local.get $ptr))
  {body}
)"#
    )
}

pub fn wasm(wat: &str) -> Vec<u8> {
    wat::parse_str(wat).expect("fixture WAT must assemble")
}

/// A guest whose `mx_handle` always answers OK.
pub fn echo_ok_guest() -> Vec<u8> {
    wasm(&guest_wat(
        "",
        &format!(r#"(func (export "mx_handle") (param i32 i32) (result i64) (i64.const {OK_LEN}))"#),
    ))
}

// =============================================================================
// PACKAGES AND CONFIG
// =============================================================================

/// Writes `<dir>/<module>.jar` holding a descriptor and the main unit.
/// `extra` is appended verbatim to the descriptor.
pub fn write_plugin(dir: &Path, module: &str, main: &str, main_wasm: Vec<u8>, extra: &str) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    PackageBuilder::new()
        .descriptor(format!("main: {main}\nmodule_name: {module}\n{extra}"))
        .unit(main, main_wasm)
        .write_to(dir.join(format!("{module}.jar")))
        .unwrap()
}

/// Defaults rooted at `root`, with a repository nobody listens on.
pub fn host_config(root: &Path) -> HostConfig {
    let mut config = HostConfig::default().rooted_at(root);
    config.repository_url = "http://127.0.0.1:9".to_string();
    config.connect_timeout_secs = 2;
    config.read_timeout_secs = 2;
    config
}

// =============================================================================
// CONNECTIONS
// =============================================================================

/// Connection that keeps every message sent on it.
#[derive(Default)]
pub struct RecordingConnection {
    id: ConnectionId,
    sent: Mutex<Vec<String>>,
}

impl RecordingConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handle(self: &Arc<Self>) -> Arc<dyn Connection> {
        Arc::clone(self) as Arc<dyn Connection>
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn responses(&self) -> Vec<Response> {
        self.sent()
            .iter()
            .map(|text| Response::from_json(text).expect("reply must be a response envelope"))
            .collect()
    }

    pub fn last_response(&self) -> Response {
        self.responses().pop().expect("no reply was sent")
    }
}

impl Connection for RecordingConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, message: &str) -> Result<(), ConnectionError> {
        self.sent.lock().push(message.to_string());
        Ok(())
    }
}

// =============================================================================
// MOCK MODULES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockReply {
    /// `OK` with the request as payload.
    Echo,
    /// The handler produces no response.
    Nothing,
    /// The handler fails.
    Crash,
}

/// A built-in module whose behaviour is chosen per test.
pub struct MockModule {
    name: String,
    kind: ModuleKind,
    reply: MockReply,
    auto_start: bool,
    fail_init: bool,
    fail_start: bool,
    fail_stop: bool,
    logger: Arc<ModuleLogger>,
    calls: Mutex<Vec<&'static str>>,
}

impl MockModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ModuleKind::RequestResponse,
            reply: MockReply::Echo,
            auto_start: true,
            fail_init: false,
            fail_start: false,
            fail_stop: false,
            logger: ModuleLogger::standalone(name, LogCategory::Module, "mock"),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(mut self, reply: MockReply) -> Self {
        self.reply = reply;
        self
    }

    pub fn transport_owning(mut self) -> Self {
        self.kind = ModuleKind::TransportOwning;
        self
    }

    pub fn manual_start(mut self) -> Self {
        self.auto_start = false;
        self
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().push(call);
    }

    fn failure(&self, what: &str) -> HostError {
        HostError::ModuleCrashed {
            module: self.name.clone(),
            message: format!("{what} blew up"),
        }
    }
}

impl Module for MockModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ModuleKind {
        self.kind
    }

    fn init(&self) -> Result<(), HostError> {
        self.record("init");
        if self.fail_init {
            return Err(self.failure("init"));
        }
        Ok(())
    }

    fn start(&self) -> Result<(), HostError> {
        self.record("start");
        if self.fail_start {
            return Err(self.failure("start"));
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), HostError> {
        self.record("stop");
        if self.fail_stop {
            return Err(self.failure("stop"));
        }
        Ok(())
    }

    fn handle_request(&self, request: &Envelope) -> Result<Option<Response>, HostError> {
        self.record("handle");
        match self.reply {
            MockReply::Echo => Ok(Some(Response::ok(request.value().clone()))),
            MockReply::Nothing => Ok(None),
            MockReply::Crash => Err(self.failure("handler")),
        }
    }

    fn handle_dispatched(&self, connection: Arc<dyn Connection>, raw: &str) -> Result<(), HostError> {
        self.record("dispatched");
        connection
            .send(raw)
            .map_err(|e| self.failure(&e.to_string()))
    }

    fn auto_start(&self) -> bool {
        self.auto_start
    }

    fn logger(&self) -> Arc<ModuleLogger> {
        Arc::clone(&self.logger)
    }
}
