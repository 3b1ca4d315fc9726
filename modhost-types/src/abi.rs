//! Names of the wasm imports and exports shared by host and guests.

/// Import namespace of the host-exposed API.
pub const HOST_NAMESPACE: &str = "host";
/// Import namespace of the mediated API. Only the rewriter emits imports here.
pub const SANDBOX_NAMESPACE: &str = "sandbox";
/// Dotted prefix reserved for the mediation layer; plugin units under it are
/// refused.
pub const SANDBOX_UNIT_PREFIX: &str = "modhost.sandbox.";

pub mod host {
    pub const FILE_OPEN: &str = "file_open";
    pub const FILE_OPEN_AT: &str = "file_open_at";
    pub const PRINT_TRACE: &str = "print_trace";
    pub const PRINT_TRACE_TO: &str = "print_trace_to";
    pub const PRINTLN: &str = "println";
    pub const LOGGER_NEW: &str = "logger_new";
    pub const LOGGER_NEW_CHILD: &str = "logger_new_child";
    pub const LOGGER_LOG: &str = "logger_log";
    pub const FILE_WRITE: &str = "file_write";
    pub const FILE_READ: &str = "file_read";
    pub const FILE_MKDIRS: &str = "file_mkdirs";
    pub const FILE_CREATE: &str = "file_create";
    pub const FILE_EXISTS: &str = "file_exists";
    pub const FILE_CLOSE: &str = "file_close";
    pub const CONN_SEND: &str = "conn_send";
    pub const DB_EXECUTE: &str = "db_execute";
    pub const DB_QUERY: &str = "db_query";
}

pub mod sandbox {
    pub const CREATE_FILE: &str = "create_file";
    pub const CREATE_FILE_AT: &str = "create_file_at";
    pub const LOG_EXCEPTION: &str = "log_exception";
    pub const LOG_MESSAGE: &str = "log_message";
    pub const PLUGIN_LOGGER: &str = "plugin_logger";
}

pub mod exports {
    pub const MEMORY: &str = "memory";
    pub const ALLOC: &str = "mx_alloc";
    pub const INIT: &str = "mx_init";
    pub const START: &str = "mx_start";
    pub const STOP: &str = "mx_stop";
    pub const PAUSE: &str = "mx_pause";
    pub const HANDLE: &str = "mx_handle";
    pub const AUTO_START: &str = "mx_auto_start";
    pub const KIND: &str = "mx_kind";
    pub const DISPATCH: &str = "mx_dispatch";
    pub const ENTITIES: &str = "mx_entities";
}

/// `println` stream selector for standard output.
pub const STREAM_STDOUT: i32 = 1;
/// `println` stream selector for standard error.
pub const STREAM_STDERR: i32 = 2;

/// Logger categories accepted by `logger_new`.
pub const CATEGORY_SYSTEM: i32 = 0;
pub const CATEGORY_SUBSYSTEM: i32 = 1;
pub const CATEGORY_MODULE: i32 = 2;

/// Packs a guest `(ptr, len)` pair into the i64 returned by exports.
#[must_use]
pub const fn pack_ptr_len(ptr: u32, len: u32) -> i64 {
    (((ptr as u64) << 32) | len as u64) as i64
}

/// Inverse of [`pack_ptr_len`].
#[must_use]
pub const fn unpack_ptr_len(packed: i64) -> (u32, u32) {
    let bits = packed as u64;
    ((bits >> 32) as u32, bits as u32)
}
