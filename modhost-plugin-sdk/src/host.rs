//! Safe wrappers over the host import ABI. wasm32 only.
//!
//! File handles obtained here are confined to the plugin's sandbox once the
//! host has rewritten the unit; plugin code does not need to care.

mod raw {
    #[link(wasm_import_module = "host")]
    unsafe extern "C" {
        pub fn file_open(ptr: *const u8, len: usize) -> i32;
        pub fn file_open_at(pp: *const u8, pl: usize, cp: *const u8, cl: usize) -> i32;
        pub fn file_write(handle: i32, ptr: *const u8, len: usize) -> i32;
        pub fn file_read(handle: i32, ptr: *mut u8, cap: usize) -> i32;
        pub fn file_mkdirs(handle: i32) -> i32;
        pub fn file_create(handle: i32) -> i32;
        pub fn file_exists(handle: i32) -> i32;
        pub fn file_close(handle: i32);
        pub fn print_trace(ptr: *const u8, len: usize);
        pub fn println(stream: i32, ptr: *const u8, len: usize);
        pub fn logger_new(category: i32, ptr: *const u8, len: usize) -> i32;
        pub fn logger_new_child(parent: i32, category: i32, ptr: *const u8, len: usize) -> i32;
        pub fn logger_log(logger: i32, level: i32, ptr: *const u8, len: usize);
        pub fn conn_send(conn: i32, ptr: *const u8, len: usize) -> i32;
        pub fn db_execute(sql: *const u8, sql_len: usize, params: *const u8, params_len: usize) -> i32;
        pub fn db_query(sql: *const u8, sql_len: usize, params: *const u8, params_len: usize) -> i64;
    }
}

use serde_json::Value;

use crate::memory;
use crate::types::{LogCategory, LogLevel};

const STDOUT: i32 = 1;
const STDERR: i32 = 2;

pub fn println(text: &str) {
    // SAFETY: text is a live slice for the duration of the call.
    unsafe { raw::println(STDOUT, text.as_ptr(), text.len()) }
}

pub fn eprintln(text: &str) {
    // SAFETY: as above.
    unsafe { raw::println(STDERR, text.as_ptr(), text.len()) }
}

/// Reports an error trace; the host tags it with the plugin's name.
pub fn print_trace(trace: &str) {
    // SAFETY: as above.
    unsafe { raw::print_trace(trace.as_ptr(), trace.len()) }
}

// ---- Files ----

/// A file handle. Closed on drop.
#[derive(Debug)]
pub struct File {
    handle: i32,
}

impl File {
    /// `None` when the host refuses the path.
    pub fn open(path: &str) -> Option<Self> {
        // SAFETY: path is a live slice for the duration of the call.
        let handle = unsafe { raw::file_open(path.as_ptr(), path.len()) };
        (handle >= 0).then_some(Self { handle })
    }

    pub fn open_at(parent: &str, child: &str) -> Option<Self> {
        // SAFETY: both slices are live for the duration of the call.
        let handle =
            unsafe { raw::file_open_at(parent.as_ptr(), parent.len(), child.as_ptr(), child.len()) };
        (handle >= 0).then_some(Self { handle })
    }

    /// Appends `bytes`; the number written.
    pub fn write(&self, bytes: &[u8]) -> Option<usize> {
        // SAFETY: bytes is a live slice for the duration of the call.
        let n = unsafe { raw::file_write(self.handle, bytes.as_ptr(), bytes.len()) };
        usize::try_from(n).ok()
    }

    /// Reads at most `cap` bytes from the start of the file.
    pub fn read(&self, cap: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; cap];
        // SAFETY: buf has room for cap bytes.
        let n = unsafe { raw::file_read(self.handle, buf.as_mut_ptr(), cap) };
        let n = usize::try_from(n).ok()?;
        buf.truncate(n);
        Some(buf)
    }

    pub fn mkdirs(&self) -> bool {
        // SAFETY: plain handle call.
        unsafe { raw::file_mkdirs(self.handle) == 1 }
    }

    /// `Some(true)` if created, `Some(false)` if it already existed.
    pub fn create(&self) -> Option<bool> {
        // SAFETY: plain handle call.
        match unsafe { raw::file_create(self.handle) } {
            1 => Some(true),
            0 => Some(false),
            _ => None,
        }
    }

    pub fn exists(&self) -> bool {
        // SAFETY: plain handle call.
        unsafe { raw::file_exists(self.handle) == 1 }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        // SAFETY: the handle is open until here.
        unsafe { raw::file_close(self.handle) }
    }
}

// ---- Loggers ----

#[derive(Debug, Clone, Copy)]
pub struct Logger {
    handle: i32,
}

impl Logger {
    /// A new logger. The host parents it to the plugin's main logger.
    pub fn new(category: LogCategory, name: &str) -> Self {
        // SAFETY: name is a live slice for the duration of the call.
        let handle = unsafe { raw::logger_new(category.abi(), name.as_ptr(), name.len()) };
        Self { handle }
    }

    pub fn child(&self, category: LogCategory, name: &str) -> Self {
        // SAFETY: as above.
        let handle = unsafe {
            raw::logger_new_child(self.handle, category.abi(), name.as_ptr(), name.len())
        };
        Self { handle }
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        // SAFETY: message is a live slice for the duration of the call.
        unsafe { raw::logger_log(self.handle, level.abi(), message.as_ptr(), message.len()) }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }
}

// ---- Persistence ----

/// The plugin's own database. Its tables are the entities the plugin
/// declares; other plugins' databases are out of reach.
#[derive(Debug, Clone, Copy, Default)]
pub struct Database;

impl Database {
    /// Runs one statement with positional parameters (`?1`, `?2`, ...).
    /// The number of rows changed, or `None` when the statement failed or
    /// the plugin is not running.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Option<usize> {
        let params = serde_json::to_vec(params).ok()?;
        // SAFETY: both slices are live for the duration of the call.
        let changed =
            unsafe { raw::db_execute(sql.as_ptr(), sql.len(), params.as_ptr(), params.len()) };
        usize::try_from(changed).ok()
    }

    /// Runs a query; one JSON object per row, keyed by column name.
    pub fn query(&self, sql: &str, params: &[Value]) -> Option<Vec<Value>> {
        let params = serde_json::to_vec(params).ok()?;
        // SAFETY: both slices are live for the duration of the call.
        let packed =
            unsafe { raw::db_query(sql.as_ptr(), sql.len(), params.as_ptr(), params.len()) };
        if packed < 0 {
            return None;
        }
        let (ptr, len) = memory::unpack(packed);
        // SAFETY: the host filled a buffer it obtained from mx_alloc.
        let rows = unsafe { memory::take_input(ptr as usize as *mut u8, len as usize) };
        serde_json::from_slice(&rows).ok()
    }
}

// ---- Connections ----

/// The connection a transport-owning plugin is serving. Only valid during
/// the dispatch call that produced it.
#[derive(Debug)]
pub struct Connection {
    handle: i32,
}

impl Connection {
    #[doc(hidden)]
    pub fn from_raw(handle: i32) -> Self {
        Self { handle }
    }

    /// `false` if the host could not deliver the message.
    pub fn send(&self, text: &str) -> bool {
        // SAFETY: text is a live slice for the duration of the call.
        unsafe { raw::conn_send(self.handle, text.as_ptr(), text.len()) == 0 }
    }
}
