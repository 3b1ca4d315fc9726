//! Host functions linked into every module store.
//!
//! `host.*` are the primitives plugin code may import directly. The file and
//! console primitives are deliberately unconfined; the rewriter redirects
//! them to the `sandbox.*` functions, which check the injected identity
//! token and go through the [`SandboxMediator`](crate::mediator::SandboxMediator).
//! `host.db_*` reach only the persistence tenant attached to the calling
//! store.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use wasmtime::{Caller, Engine, Extern, Linker, Memory};

use modhost_db::{PersistenceResult, Session};
use modhost_types::abi::{self, host, sandbox, HOST_NAMESPACE, SANDBOX_NAMESPACE};

use super::{FileHandle, UnitState};
use crate::error::{SandboxError, SandboxFault};
use crate::logger::{LogCategory, LogLevel, ModuleLogger};
use crate::mediator::SandboxFile;

type HostResult<T> = wasmtime::Result<T>;

/// Builds the linker with every `host` and `sandbox` function defined.
pub fn host_linker(engine: &Engine) -> HostResult<Linker<UnitState>> {
    let mut linker = Linker::new(engine);
    link_console(&mut linker)?;
    link_loggers(&mut linker)?;
    link_files(&mut linker)?;
    link_connection(&mut linker)?;
    link_persistence(&mut linker)?;
    link_sandbox(&mut linker)?;
    Ok(linker)
}

// ================================================================
// Guest memory helpers
// ================================================================

fn memory(caller: &mut Caller<'_, UnitState>) -> HostResult<Memory> {
    match caller.get_export(abi::exports::MEMORY) {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(wasmtime::Error::msg("calling unit does not export memory")),
    }
}

fn read_bytes(caller: &mut Caller<'_, UnitState>, ptr: i32, len: i32) -> HostResult<Vec<u8>> {
    let memory = memory(caller)?;
    let mut buf = vec![0u8; len.max(0) as usize];
    memory.read(&*caller, ptr as u32 as usize, &mut buf)?;
    Ok(buf)
}

fn read_string(caller: &mut Caller<'_, UnitState>, ptr: i32, len: i32) -> HostResult<String> {
    let bytes = read_bytes(caller, ptr, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn write_bytes(caller: &mut Caller<'_, UnitState>, ptr: i32, bytes: &[u8]) -> HostResult<()> {
    let memory = memory(caller)?;
    memory.write(&mut *caller, ptr as u32 as usize, bytes)?;
    Ok(())
}

fn bad_handle(kind: &'static str, handle: i32) -> wasmtime::Error {
    wasmtime::Error::new(SandboxFault::BadHandle { kind, handle })
}

/// Turns a mediator error into a trap (violation) or `-1` (I/O).
fn mediated<T>(result: Result<T, SandboxError>, on_io: T) -> HostResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(SandboxError::Violation { module, path }) => {
            Err(wasmtime::Error::new(SandboxFault::SandboxViolation { module, path }))
        }
        Err(SandboxError::Io(e)) => {
            debug!(error = %e, "Mediated file operation failed");
            Ok(on_io)
        }
    }
}

/// Traps unless `token` belongs to the calling store's module.
fn verify_token(caller: &Caller<'_, UnitState>, token: i32) -> HostResult<String> {
    let state = caller.data();
    if state.token.value() != token {
        return Err(wasmtime::Error::new(SandboxFault::ForgedIdentity { token }));
    }
    Ok(state.module.clone())
}

// ================================================================
// host: console
// ================================================================

fn write_stream(stream: i32, text: &str) {
    let result = if stream == abi::STREAM_STDERR {
        writeln!(std::io::stderr().lock(), "{text}")
    } else {
        writeln!(std::io::stdout().lock(), "{text}")
    };
    if let Err(e) = result {
        debug!(error = %e, "Console write failed");
    }
}

fn link_console(linker: &mut Linker<UnitState>) -> HostResult<()> {
    linker.func_wrap(
        HOST_NAMESPACE,
        host::PRINT_TRACE,
        |mut caller: Caller<'_, UnitState>, ptr: i32, len: i32| -> HostResult<()> {
            let trace = read_string(&mut caller, ptr, len)?;
            write_stream(abi::STREAM_STDERR, &trace);
            Ok(())
        },
    )?;
    linker.func_wrap(
        HOST_NAMESPACE,
        host::PRINT_TRACE_TO,
        |mut caller: Caller<'_, UnitState>, ptr: i32, len: i32, stream: i32| -> HostResult<()> {
            let trace = read_string(&mut caller, ptr, len)?;
            write_stream(stream, &trace);
            Ok(())
        },
    )?;
    linker.func_wrap(
        HOST_NAMESPACE,
        host::PRINTLN,
        |mut caller: Caller<'_, UnitState>, stream: i32, ptr: i32, len: i32| -> HostResult<()> {
            let text = read_string(&mut caller, ptr, len)?;
            write_stream(stream, &text);
            Ok(())
        },
    )?;
    Ok(())
}

// ================================================================
// host: loggers
// ================================================================

fn link_loggers(linker: &mut Linker<UnitState>) -> HostResult<()> {
    linker.func_wrap(
        HOST_NAMESPACE,
        host::LOGGER_NEW,
        |mut caller: Caller<'_, UnitState>, category: i32, ptr: i32, len: i32| -> HostResult<i32> {
            let name = read_string(&mut caller, ptr, len)?;
            let module = caller.data().module.clone();
            let logger = ModuleLogger::standalone(&module, LogCategory::from_abi(category), &name);
            Ok(caller.data_mut().insert_logger(logger))
        },
    )?;
    linker.func_wrap(
        HOST_NAMESPACE,
        host::LOGGER_NEW_CHILD,
        |mut caller: Caller<'_, UnitState>,
         parent: i32,
         category: i32,
         ptr: i32,
         len: i32|
         -> HostResult<i32> {
            let name = read_string(&mut caller, ptr, len)?;
            let parent = caller
                .data()
                .loggers
                .get(&parent)
                .cloned()
                .ok_or_else(|| bad_handle("logger", parent))?;
            let logger = parent.child(LogCategory::from_abi(category), &name);
            Ok(caller.data_mut().insert_logger(logger))
        },
    )?;
    linker.func_wrap(
        HOST_NAMESPACE,
        host::LOGGER_LOG,
        |mut caller: Caller<'_, UnitState>, logger: i32, level: i32, ptr: i32, len: i32| -> HostResult<()> {
            let message = read_string(&mut caller, ptr, len)?;
            let logger = caller
                .data()
                .loggers
                .get(&logger)
                .cloned()
                .ok_or_else(|| bad_handle("logger", logger))?;
            logger.log(LogLevel::from_abi(level), &message);
            Ok(())
        },
    )?;
    Ok(())
}

// ================================================================
// host: files
// ================================================================

fn file(caller: &Caller<'_, UnitState>, handle: i32) -> HostResult<FileHandle> {
    caller
        .data()
        .files
        .get(&handle)
        .cloned()
        .ok_or_else(|| bad_handle("file", handle))
}

fn plain_append(path: &Path, bytes: &[u8]) -> std::io::Result<usize> {
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(bytes)?;
    Ok(bytes.len())
}

fn plain_create(path: &Path) -> std::io::Result<bool> {
    match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

fn link_files(linker: &mut Linker<UnitState>) -> HostResult<()> {
    linker.func_wrap(
        HOST_NAMESPACE,
        host::FILE_OPEN,
        |mut caller: Caller<'_, UnitState>, ptr: i32, len: i32| -> HostResult<i32> {
            let path = read_string(&mut caller, ptr, len)?;
            Ok(caller.data_mut().insert_file(FileHandle::Plain(PathBuf::from(path))))
        },
    )?;
    linker.func_wrap(
        HOST_NAMESPACE,
        host::FILE_OPEN_AT,
        |mut caller: Caller<'_, UnitState>, pp: i32, pl: i32, cp: i32, cl: i32| -> HostResult<i32> {
            let parent = read_string(&mut caller, pp, pl)?;
            let child = read_string(&mut caller, cp, cl)?;
            let path = Path::new(&parent).join(child);
            Ok(caller.data_mut().insert_file(FileHandle::Plain(path)))
        },
    )?;
    linker.func_wrap(
        HOST_NAMESPACE,
        host::FILE_WRITE,
        |mut caller: Caller<'_, UnitState>, handle: i32, ptr: i32, len: i32| -> HostResult<i32> {
            let target = file(&caller, handle)?;
            let bytes = read_bytes(&mut caller, ptr, len)?;
            let written = match target {
                FileHandle::Plain(path) => plain_append(&path, &bytes).map(|n| n as i32).unwrap_or(-1),
                FileHandle::Confined(file) => {
                    let mediator = Arc::clone(&caller.data().mediator);
                    mediated(file.append(&mediator, &bytes).map(|n| n as i32), -1)?
                }
            };
            Ok(written)
        },
    )?;
    linker.func_wrap(
        HOST_NAMESPACE,
        host::FILE_READ,
        |mut caller: Caller<'_, UnitState>, handle: i32, ptr: i32, cap: i32| -> HostResult<i32> {
            let data = match file(&caller, handle)? {
                FileHandle::Plain(path) => std::fs::read(path).ok(),
                FileHandle::Confined(file) => {
                    let mediator = Arc::clone(&caller.data().mediator);
                    mediated(file.read(&mediator).map(Some), None)?
                }
            };
            let Some(data) = data else {
                return Ok(-1);
            };
            let n = data.len().min(cap.max(0) as usize);
            write_bytes(&mut caller, ptr, &data[..n])?;
            Ok(n as i32)
        },
    )?;
    linker.func_wrap(
        HOST_NAMESPACE,
        host::FILE_MKDIRS,
        |caller: Caller<'_, UnitState>, handle: i32| -> HostResult<i32> {
            match file(&caller, handle)? {
                FileHandle::Plain(path) => Ok(i32::from(std::fs::create_dir_all(path).is_ok())),
                FileHandle::Confined(file) => {
                    mediated(file.mkdirs(&caller.data().mediator).map(i32::from), 0)
                }
            }
        },
    )?;
    linker.func_wrap(
        HOST_NAMESPACE,
        host::FILE_CREATE,
        |caller: Caller<'_, UnitState>, handle: i32| -> HostResult<i32> {
            match file(&caller, handle)? {
                FileHandle::Plain(path) => Ok(plain_create(&path).map(i32::from).unwrap_or(-1)),
                FileHandle::Confined(file) => {
                    mediated(file.create(&caller.data().mediator).map(i32::from), -1)
                }
            }
        },
    )?;
    linker.func_wrap(
        HOST_NAMESPACE,
        host::FILE_EXISTS,
        |caller: Caller<'_, UnitState>, handle: i32| -> HostResult<i32> {
            let exists = match file(&caller, handle)? {
                FileHandle::Plain(path) => path.exists(),
                FileHandle::Confined(file) => file.exists(),
            };
            Ok(i32::from(exists))
        },
    )?;
    linker.func_wrap(
        HOST_NAMESPACE,
        host::FILE_CLOSE,
        |mut caller: Caller<'_, UnitState>, handle: i32| -> HostResult<()> {
            caller
                .data_mut()
                .files
                .remove(&handle)
                .map(|_| ())
                .ok_or_else(|| bad_handle("file", handle))
        },
    )?;
    Ok(())
}

// ================================================================
// host: connection
// ================================================================

fn link_connection(linker: &mut Linker<UnitState>) -> HostResult<()> {
    linker.func_wrap(
        HOST_NAMESPACE,
        host::CONN_SEND,
        |mut caller: Caller<'_, UnitState>, conn: i32, ptr: i32, len: i32| -> HostResult<i32> {
            let connection = match &caller.data().connection {
                Some((handle, connection)) if *handle == conn => Arc::clone(connection),
                _ => return Err(bad_handle("connection", conn)),
            };
            let text = read_string(&mut caller, ptr, len)?;
            match connection.send(&text) {
                Ok(()) => Ok(0),
                Err(e) => {
                    debug!(connection = %connection.id(), error = %e, "Send failed");
                    Ok(-1)
                }
            }
        },
    )?;
    Ok(())
}

// ================================================================
// host: persistence
// ================================================================

/// Runs one statement against the caller's tenant. `None` when no tenant is
/// attached, the parameters are not a JSON array, or the statement fails.
fn run_statement<T>(
    caller: &mut Caller<'_, UnitState>,
    (sql_ptr, sql_len): (i32, i32),
    (params_ptr, params_len): (i32, i32),
    run: impl FnOnce(&Session, &str, &[Value]) -> PersistenceResult<T>,
) -> HostResult<Option<T>> {
    let sql = read_string(caller, sql_ptr, sql_len)?;
    let raw_params = if params_len > 0 {
        read_bytes(caller, params_ptr, params_len)?
    } else {
        Vec::new()
    };

    let state = caller.data();
    let Some(factory) = state.persistence.clone() else {
        debug!(module = %state.module, "Statement without an attached tenant");
        return Ok(None);
    };
    let params: Vec<Value> = if raw_params.is_empty() {
        Vec::new()
    } else {
        match serde_json::from_slice(&raw_params) {
            Ok(params) => params,
            Err(e) => {
                debug!(module = %state.module, error = %e, "Statement parameters are not a JSON array");
                return Ok(None);
            }
        }
    };

    match factory.open_session().and_then(|session| run(&session, &sql, &params)) {
        Ok(out) => Ok(Some(out)),
        Err(e) => {
            debug!(module = %state.module, error = %e, "Statement failed");
            Ok(None)
        }
    }
}

/// Copies `bytes` into a buffer from the calling unit's `mx_alloc`.
fn write_to_guest(caller: &mut Caller<'_, UnitState>, bytes: &[u8]) -> HostResult<i64> {
    let alloc = caller
        .get_export(abi::exports::ALLOC)
        .and_then(Extern::into_func)
        .ok_or_else(|| wasmtime::Error::msg("calling unit does not export mx_alloc"))?;
    let len = i32::try_from(bytes.len()).map_err(|_| wasmtime::Error::msg("result too large for guest memory"))?;
    let ptr: i32 = alloc.typed::<i32, i32>(&*caller)?.call(&mut *caller, len)?;
    write_bytes(caller, ptr, bytes)?;
    Ok(abi::pack_ptr_len(ptr as u32, len as u32))
}

fn link_persistence(linker: &mut Linker<UnitState>) -> HostResult<()> {
    linker.func_wrap(
        HOST_NAMESPACE,
        host::DB_EXECUTE,
        |mut caller: Caller<'_, UnitState>, sp: i32, sl: i32, pp: i32, pl: i32| -> HostResult<i32> {
            let changed = run_statement(&mut caller, (sp, sl), (pp, pl), |session, sql, params| {
                session.execute_json(sql, params)
            })?;
            Ok(changed.map_or(-1, |n| i32::try_from(n).unwrap_or(i32::MAX)))
        },
    )?;
    linker.func_wrap(
        HOST_NAMESPACE,
        host::DB_QUERY,
        |mut caller: Caller<'_, UnitState>, sp: i32, sl: i32, pp: i32, pl: i32| -> HostResult<i64> {
            let rows = run_statement(&mut caller, (sp, sl), (pp, pl), |session, sql, params| {
                session.query_json(sql, params)
            })?;
            match rows {
                Some(rows) => {
                    let bytes = serde_json::to_vec(&rows)?;
                    write_to_guest(&mut caller, &bytes)
                }
                None => Ok(-1),
            }
        },
    )?;
    Ok(())
}

// ================================================================
// sandbox: mediated replacements
// ================================================================

fn confined(file: Result<SandboxFile, SandboxError>) -> HostResult<Option<FileHandle>> {
    mediated(file.map(|f| Some(FileHandle::Confined(f))), None)
}

fn link_sandbox(linker: &mut Linker<UnitState>) -> HostResult<()> {
    linker.func_wrap(
        SANDBOX_NAMESPACE,
        sandbox::CREATE_FILE,
        |mut caller: Caller<'_, UnitState>, token: i32, ptr: i32, len: i32| -> HostResult<i32> {
            let module = verify_token(&caller, token)?;
            let path = read_string(&mut caller, ptr, len)?;
            let handle = confined(caller.data().mediator.create_file(&module, &path))?;
            Ok(handle.map_or(-1, |h| caller.data_mut().insert_file(h)))
        },
    )?;
    linker.func_wrap(
        SANDBOX_NAMESPACE,
        sandbox::CREATE_FILE_AT,
        |mut caller: Caller<'_, UnitState>,
         token: i32,
         pp: i32,
         pl: i32,
         cp: i32,
         cl: i32|
         -> HostResult<i32> {
            let module = verify_token(&caller, token)?;
            let parent = read_string(&mut caller, pp, pl)?;
            let child = read_string(&mut caller, cp, cl)?;
            let handle = confined(caller.data().mediator.create_file_at(&module, &parent, &child))?;
            Ok(handle.map_or(-1, |h| caller.data_mut().insert_file(h)))
        },
    )?;
    linker.func_wrap(
        SANDBOX_NAMESPACE,
        sandbox::LOG_EXCEPTION,
        |mut caller: Caller<'_, UnitState>, ptr: i32, len: i32, token: i32| -> HostResult<()> {
            let module = verify_token(&caller, token)?;
            let trace = read_string(&mut caller, ptr, len)?;
            caller.data().mediator.log_exception(&module, &trace);
            Ok(())
        },
    )?;
    linker.func_wrap(
        SANDBOX_NAMESPACE,
        sandbox::LOG_MESSAGE,
        |mut caller: Caller<'_, UnitState>, ptr: i32, len: i32, token: i32| -> HostResult<()> {
            let module = verify_token(&caller, token)?;
            let message = read_string(&mut caller, ptr, len)?;
            caller.data().mediator.log_message(&module, &message);
            Ok(())
        },
    )?;
    linker.func_wrap(
        SANDBOX_NAMESPACE,
        sandbox::PLUGIN_LOGGER,
        |mut caller: Caller<'_, UnitState>, token: i32| -> HostResult<i32> {
            let module = verify_token(&caller, token)?;
            let logger = caller.data().mediator.plugin_logger(&module);
            Ok(caller.data_mut().insert_logger(logger))
        },
    )?;
    Ok(())
}
