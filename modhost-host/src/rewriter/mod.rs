//! Sandbox rewriting of guest units.
//!
//! A unit that calls the unmediated host primitives for file creation,
//! trace printing, console output or logger construction is rewritten so
//! those calls go through the mediated `sandbox.*` imports instead, with
//! the owning module's identity token baked in as an `i32.const`. Sites
//! whose arguments cannot be isolated by a straight-line stack walk are
//! left alone and reported as skipped.

mod binary;
mod stack;

use std::fmt;

use modhost_types::abi::{self, host, sandbox};
use thiserror::Error;
use wasmparser::{Parser, Payload};

use crate::mediator::ModuleToken;
use binary::{
    FuncImport, FuncType, ModuleLayout, OP_CALL, OP_REF_FUNC, OP_RETURN_CALL, SECTION_CODE,
    SECTION_CUSTOM, SECTION_ELEMENT, SECTION_EXPORT, SECTION_GLOBAL, SECTION_IMPORT,
    SECTION_START, SECTION_TABLE, SECTION_TYPE,
};
use stack::{Instr, Target};

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("malformed module: {0}")]
    Malformed(String),

    #[error("unsupported construct: {0}")]
    Unsupported(String),

    #[error("decode error: {0}")]
    Decode(#[from] wasmparser::BinaryReaderError),

    #[error("rewritten module failed validation: {0}")]
    Invalid(String),
}

/// An unmediated call shape the rewriter recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pattern {
    FileOpen,
    FileOpenAt,
    PrintTrace,
    PrintTraceTo,
    Println,
    LoggerNew,
}

impl Pattern {
    fn from_import(field: &str) -> Option<Self> {
        Some(match field {
            host::FILE_OPEN => Self::FileOpen,
            host::FILE_OPEN_AT => Self::FileOpenAt,
            host::PRINT_TRACE => Self::PrintTrace,
            host::PRINT_TRACE_TO => Self::PrintTraceTo,
            host::PRINTLN => Self::Println,
            host::LOGGER_NEW => Self::LoggerNew,
            _ => return None,
        })
    }

    /// `(params, results)` the host primitive must have to be recognised.
    fn expected_signature(self) -> FuncType {
        match self {
            Self::FileOpen => FuncType::i32s(2, 1),
            Self::FileOpenAt => FuncType::i32s(4, 1),
            Self::PrintTrace => FuncType::i32s(2, 0),
            Self::PrintTraceTo | Self::Println => FuncType::i32s(3, 0),
            Self::LoggerNew => FuncType::i32s(3, 1),
        }
    }

    fn mediated(self) -> Mediated {
        match self {
            Self::FileOpen => Mediated::CreateFile,
            Self::FileOpenAt => Mediated::CreateFileAt,
            Self::PrintTrace | Self::PrintTraceTo => Mediated::LogException,
            Self::Println => Mediated::LogMessage,
            Self::LoggerNew => Mediated::LoggerNewChild,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FileOpen => host::FILE_OPEN,
            Self::FileOpenAt => host::FILE_OPEN_AT,
            Self::PrintTrace => host::PRINT_TRACE,
            Self::PrintTraceTo => host::PRINT_TRACE_TO,
            Self::Println => host::PRINTLN,
            Self::LoggerNew => host::LOGGER_NEW,
        };
        write!(f, "{}.{name}", abi::HOST_NAMESPACE)
    }
}

/// Imports the rewritten code may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Mediated {
    CreateFile,
    CreateFileAt,
    LogException,
    LogMessage,
    PluginLogger,
    LoggerNewChild,
}

impl Mediated {
    const ALL: [Mediated; 6] = [
        Self::CreateFile,
        Self::CreateFileAt,
        Self::LogException,
        Self::LogMessage,
        Self::PluginLogger,
        Self::LoggerNewChild,
    ];

    fn import(self) -> (&'static str, &'static str) {
        match self {
            Self::CreateFile => (abi::SANDBOX_NAMESPACE, sandbox::CREATE_FILE),
            Self::CreateFileAt => (abi::SANDBOX_NAMESPACE, sandbox::CREATE_FILE_AT),
            Self::LogException => (abi::SANDBOX_NAMESPACE, sandbox::LOG_EXCEPTION),
            Self::LogMessage => (abi::SANDBOX_NAMESPACE, sandbox::LOG_MESSAGE),
            Self::PluginLogger => (abi::SANDBOX_NAMESPACE, sandbox::PLUGIN_LOGGER),
            Self::LoggerNewChild => (abi::HOST_NAMESPACE, host::LOGGER_NEW_CHILD),
        }
    }

    fn signature(self) -> FuncType {
        match self {
            Self::CreateFile => FuncType::i32s(3, 1),
            Self::LogException | Self::LogMessage => FuncType::i32s(3, 0),
            Self::CreateFileAt => FuncType::i32s(5, 1),
            Self::PluginLogger => FuncType::i32s(1, 1),
            Self::LoggerNewChild => FuncType::i32s(4, 1),
        }
    }
}

/// A call site that was rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedSite {
    /// Defined-function index in the original module.
    pub function: u32,
    /// Byte offset of the original call instruction.
    pub offset: usize,
    pub pattern: Pattern,
}

/// A call site that matched a pattern but was left as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSite {
    /// Defined-function index of the call site, or the imported function
    /// index for a reference outside code bodies.
    pub function: u32,
    /// Byte offset of the call instruction; 0 outside code bodies.
    pub offset: usize,
    pub pattern: Pattern,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteReport {
    pub patched: Vec<PatchedSite>,
    pub skipped: Vec<SkippedSite>,
}

impl RewriteReport {
    pub fn is_modified(&self) -> bool {
        !self.patched.is_empty()
    }

    /// Every recognised site was rewritten.
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    pub bytes: Vec<u8>,
    pub report: RewriteReport,
}

impl RewriteOutcome {
    fn unchanged(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            report: RewriteReport::default(),
        }
    }
}

/// Byte replacement within one code body: `[at, end)` becomes `bytes`.
#[derive(Debug)]
struct Edit {
    at: usize,
    end: usize,
    bytes: Vec<u8>,
}

/// Function indices of the mediated imports after rewriting, plus the
/// imports and types to append.
struct ImportPlan {
    indices: Vec<(Mediated, u32)>,
    new_imports: Vec<FuncImport>,
    new_types: Vec<FuncType>,
    /// Function imports in the original module.
    base: u32,
}

impl ImportPlan {
    fn build(layout: &ModuleLayout<'_>, needed: &[Mediated]) -> Self {
        let base = layout.func_import_count();
        let mut plan = Self {
            indices: Vec::new(),
            new_imports: Vec::new(),
            new_types: Vec::new(),
            base,
        };
        for &mediated in needed {
            let (module, field) = mediated.import();
            let signature = mediated.signature();
            let existing = layout.func_imports.iter().position(|i| {
                i.module == module
                    && i.field == field
                    && layout.types.get(i.type_index as usize) == Some(&signature)
            });
            if let Some(index) = existing {
                plan.indices.push((mediated, index as u32));
                continue;
            }
            let type_index = match layout.types.iter().position(|t| *t == signature) {
                Some(i) => i as u32,
                None => match plan.new_types.iter().position(|t| *t == signature) {
                    Some(i) => (layout.types.len() + i) as u32,
                    None => {
                        plan.new_types.push(signature);
                        (layout.types.len() + plan.new_types.len() - 1) as u32
                    }
                },
            };
            plan.indices
                .push((mediated, base + plan.new_imports.len() as u32));
            plan.new_imports.push(FuncImport {
                module: module.to_string(),
                field: field.to_string(),
                type_index,
            });
        }
        plan
    }

    fn index_of(&self, mediated: Mediated) -> u32 {
        self.indices
            .iter()
            .find(|(m, _)| *m == mediated)
            .map(|(_, i)| *i)
            .unwrap_or(u32::MAX)
    }

    fn shift(&self) -> u32 {
        self.new_imports.len() as u32
    }

    fn remap(&self, func: u32) -> u32 {
        if func >= self.base { func + self.shift() } else { func }
    }
}

/// Rewrites unmediated host calls in wasm units.
#[derive(Debug, Clone, Copy, Default)]
pub struct SandboxRewriter;

impl SandboxRewriter {
    pub fn new() -> Self {
        Self
    }

    /// Rewrites `bytes` on behalf of the module owning `token`.
    ///
    /// A unit with no recognised host imports is returned byte-identical.
    pub fn rewrite(&self, bytes: &[u8], token: ModuleToken) -> Result<RewriteOutcome, RewriteError> {
        let layout = ModuleLayout::parse(bytes)?;

        let patterns: Vec<(u32, Pattern)> = layout
            .func_imports
            .iter()
            .enumerate()
            .filter(|(_, import)| import.module == abi::HOST_NAMESPACE)
            .filter_map(|(index, import)| {
                let pattern = Pattern::from_import(&import.field)?;
                let ty = layout.types.get(import.type_index as usize)?;
                (*ty == pattern.expected_signature()).then_some((index as u32, pattern))
            })
            .collect();
        if patterns.is_empty() {
            return Ok(RewriteOutcome::unchanged(bytes));
        }

        let needed: Vec<Mediated> = Mediated::ALL
            .into_iter()
            .filter(|m| match m {
                Mediated::PluginLogger => patterns.iter().any(|(_, p)| *p == Pattern::LoggerNew),
                other => patterns.iter().any(|(_, p)| p.mediated() == *other),
            })
            .collect();
        let plan = ImportPlan::build(&layout, &needed);
        if let Some(table) = layout.section(SECTION_TABLE) {
            binary::check_tables(table.body)?;
        }

        // exported, tabled or globally referenced primitives escape the
        // call-site patching below
        let mut report = RewriteReport::default();
        for (section, func) in binary::func_refs_outside_code(&layout)? {
            if let Some(&(_, pattern)) = patterns.iter().find(|(i, _)| *i == func) {
                report.skipped.push(SkippedSite {
                    function: func,
                    offset: 0,
                    pattern,
                    reason: outside_reference_reason(section),
                });
            }
        }
        let mut bodies = Vec::new();
        let mut function = 0u32;
        for payload in Parser::new(0).parse_all(bytes) {
            if let Payload::CodeSectionEntry(body) = payload? {
                let range = body.range();
                let instrs = stack::decode_body(&body, &layout)?;
                let edits = plan_edits(&instrs, &patterns, &plan, token, function, &mut report);
                bodies.push(apply_edits(&bytes[range.start..range.end], range.start, edits));
                function += 1;
            }
        }

        if !report.is_modified() {
            return Ok(RewriteOutcome {
                bytes: bytes.to_vec(),
                report,
            });
        }

        let out = emit(&layout, &plan, &bodies)?;
        wasmparser::validate(&out).map_err(|e| RewriteError::Invalid(e.to_string()))?;
        Ok(RewriteOutcome { bytes: out, report })
    }
}

fn outside_reference_reason(section: u8) -> &'static str {
    match section {
        SECTION_EXPORT => "re-exported from the unit",
        SECTION_ELEMENT => "placed in a table element segment",
        SECTION_GLOBAL => "referenced by a global initialiser",
        SECTION_START => "used as the start function",
        _ => "referenced outside code",
    }
}

fn plan_edits(
    instrs: &[Instr],
    patterns: &[(u32, Pattern)],
    plan: &ImportPlan,
    token: ModuleToken,
    function: u32,
    report: &mut RewriteReport,
) -> Vec<Edit> {
    let pattern_for = |func: u32| patterns.iter().find(|(i, _)| *i == func).map(|(_, p)| *p);
    let mut edits = Vec::new();

    for (index, instr) in instrs.iter().enumerate() {
        let (opcode, func) = match instr.target {
            Target::None => continue,
            Target::Call(f) => (OP_CALL, f),
            Target::ReturnCall(f) => (OP_RETURN_CALL, f),
            Target::RefFunc(f) => (OP_REF_FUNC, f),
        };

        let Some(pattern) = pattern_for(func) else {
            if plan.shift() > 0 && func >= plan.base {
                edits.push(replace(instr, binary::encode_func_op(opcode, plan.remap(func))));
            }
            continue;
        };

        let skip = |reason| SkippedSite {
            function,
            offset: instr.start,
            pattern,
            reason,
        };
        if opcode != OP_CALL {
            report.skipped.push(skip("not a direct call"));
            continue;
        }
        match site_edits(instrs, index, pattern, plan, token) {
            Ok(site) => {
                edits.extend(site);
                report.patched.push(PatchedSite {
                    function,
                    offset: instr.start,
                    pattern,
                });
            }
            Err(reason) => report.skipped.push(skip(reason)),
        }
    }
    edits
}

/// Edits for one recognised call at `instrs[call]`.
fn site_edits(
    instrs: &[Instr],
    call: usize,
    pattern: Pattern,
    plan: &ImportPlan,
    token: ModuleToken,
) -> Result<Vec<Edit>, &'static str> {
    let site = &instrs[call];
    let retarget = replace(
        site,
        binary::encode_func_op(OP_CALL, plan.index_of(pattern.mediated())),
    );
    let token_const = binary::encode_i32_const(token.value());

    let edits = match pattern {
        // token becomes the first argument
        Pattern::FileOpen | Pattern::FileOpenAt => {
            let args = pattern.expected_signature().params.len() as u32;
            let first = stack::arg_push_start(instrs, call, args)
                .ok_or("argument pushes could not be isolated")?;
            vec![insert(&instrs[first], token_const), retarget]
        }
        // token becomes the last argument
        Pattern::PrintTrace => vec![insert(site, token_const), retarget],
        Pattern::PrintTraceTo => {
            let stream = stack::previous_significant(instrs, call)
                .filter(|&i| instrs[i].simple_push)
                .ok_or("stream argument is not a simple push")?;
            vec![
                delete(&instrs[stream]),
                insert(site, token_const),
                retarget,
            ]
        }
        Pattern::Println => {
            let message = stack::arg_push_start(instrs, call, 2)
                .ok_or("message argument could not be isolated")?;
            let stream = stack::previous_significant(instrs, message)
                .filter(|&i| instrs[i].simple_push)
                .ok_or("stream argument is not a simple push")?;
            vec![
                delete(&instrs[stream]),
                insert(site, token_const),
                retarget,
            ]
        }
        // parent logger comes from the mediated plugin logger
        Pattern::LoggerNew => {
            let first = stack::arg_push_start(instrs, call, 3)
                .ok_or("argument pushes could not be isolated")?;
            let mut prologue = token_const;
            prologue.extend(binary::encode_func_op(
                OP_CALL,
                plan.index_of(Mediated::PluginLogger),
            ));
            vec![insert(&instrs[first], prologue), retarget]
        }
    };
    Ok(edits)
}

fn insert(before: &Instr, bytes: Vec<u8>) -> Edit {
    Edit {
        at: before.start,
        end: before.start,
        bytes,
    }
}

fn replace(instr: &Instr, bytes: Vec<u8>) -> Edit {
    Edit {
        at: instr.start,
        end: instr.end,
        bytes,
    }
}

fn delete(instr: &Instr) -> Edit {
    replace(instr, Vec::new())
}

/// Applies edits to a body that starts at absolute offset `base`.
fn apply_edits(body: &[u8], base: usize, mut edits: Vec<Edit>) -> Vec<u8> {
    if edits.is_empty() {
        return body.to_vec();
    }
    // inserts sort ahead of a replacement at the same offset
    edits.sort_by_key(|e| (e.at, e.end));
    let mut out = Vec::with_capacity(body.len() + edits.len() * 6);
    let mut cursor = base;
    for edit in edits {
        out.extend_from_slice(&body[cursor - base..edit.at - base]);
        out.extend_from_slice(&edit.bytes);
        cursor = edit.end;
    }
    out.extend_from_slice(&body[cursor - base..]);
    out
}

fn emit(
    layout: &ModuleLayout<'_>,
    plan: &ImportPlan,
    bodies: &[Vec<u8>],
) -> Result<Vec<u8>, RewriteError> {
    let remap = |f: u32| plan.remap(f);
    let shifted = plan.shift() > 0;
    let mut out = Vec::with_capacity(8 + layout.sections.iter().map(|s| s.body.len() + 6).sum::<usize>());
    out.extend_from_slice(b"\0asm");
    out.extend_from_slice(&[1, 0, 0, 0]);

    for section in &layout.sections {
        let body = match section.id {
            SECTION_TYPE if !plan.new_types.is_empty() => {
                binary::append_types(section.body, &plan.new_types)?
            }
            SECTION_IMPORT if shifted => {
                binary::append_func_imports(section.body, &plan.new_imports)?
            }
            SECTION_EXPORT if shifted => binary::remap_exports(section.body, &remap)?,
            SECTION_START if shifted => binary::remap_start(section.body, &remap)?,
            SECTION_ELEMENT if shifted => binary::remap_elements(section.body, &remap)?,
            SECTION_GLOBAL if shifted => binary::remap_globals(section.body, &remap)?,
            SECTION_CODE => {
                let mut code = Vec::new();
                binary::write_var_u32(&mut code, bodies.len() as u32);
                for body in bodies {
                    binary::write_var_u32(&mut code, body.len() as u32);
                    code.extend_from_slice(body);
                }
                code
            }
            // function names would point at shifted indices
            SECTION_CUSTOM if shifted && binary::custom_section_name(section.body) == Some("name") => {
                continue;
            }
            _ => section.body.to_vec(),
        };
        binary::write_section(&mut out, section.id, &body);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_edits_orders_insert_before_replace() {
        let body = [0xAA, 0x10, 0x01, 0x0B];
        let edits = vec![
            Edit {
                at: 101,
                end: 103,
                bytes: vec![0x10, 0x05],
            },
            Edit {
                at: 101,
                end: 101,
                bytes: vec![0x41, 0x07],
            },
        ];
        assert_eq!(
            apply_edits(&body, 100, edits),
            vec![0xAA, 0x41, 0x07, 0x10, 0x05, 0x0B]
        );
    }

    #[test]
    fn pattern_display_names_host_import() {
        assert_eq!(Pattern::FileOpen.to_string(), "host.file_open");
        assert_eq!(Pattern::LoggerNew.to_string(), "host.logger_new");
    }

    #[test]
    fn mediated_signatures() {
        assert_eq!(Mediated::LogMessage.signature(), FuncType::i32s(3, 0));
        assert_eq!(Mediated::CreateFile.signature(), FuncType::i32s(3, 1));
        assert_eq!(Mediated::CreateFileAt.signature(), FuncType::i32s(5, 1));
    }
}
