//! Byte-level reading and re-emission of wasm module sections.
//!
//! Only what the rewriter needs is decoded: types, imports, the function
//! section, and every place a function index can hide outside code bodies
//! (exports, start, elements, global initialisers). Everything else is
//! copied through untouched.

use std::cell::RefCell;

use super::RewriteError;

const MAGIC: &[u8; 4] = b"\0asm";
const MODULE_VERSION: [u8; 4] = [1, 0, 0, 0];

pub(crate) const SECTION_CUSTOM: u8 = 0;
pub(crate) const SECTION_TYPE: u8 = 1;
pub(crate) const SECTION_IMPORT: u8 = 2;
pub(crate) const SECTION_FUNCTION: u8 = 3;
pub(crate) const SECTION_TABLE: u8 = 4;
pub(crate) const SECTION_GLOBAL: u8 = 6;
pub(crate) const SECTION_EXPORT: u8 = 7;
pub(crate) const SECTION_START: u8 = 8;
pub(crate) const SECTION_ELEMENT: u8 = 9;
pub(crate) const SECTION_CODE: u8 = 10;

pub(crate) const OP_CALL: u8 = 0x10;
pub(crate) const OP_RETURN_CALL: u8 = 0x12;
pub(crate) const OP_I32_CONST: u8 = 0x41;
pub(crate) const OP_REF_FUNC: u8 = 0xD2;

const FUNC_FORM: u8 = 0x60;
const I32: u8 = 0x7F;

fn malformed(what: impl Into<String>) -> RewriteError {
    RewriteError::Malformed(what.into())
}

// ================================================================
// Reader
// ================================================================

/// Cursor over a byte slice that remembers its absolute offset in the module.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn eof(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, RewriteError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| malformed("unexpected end of section"))?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], RewriteError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| malformed("unexpected end of section"))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn read_var_u32(&mut self) -> Result<u32, RewriteError> {
        let value = self.read_var_u64()?;
        u32::try_from(value).map_err(|_| malformed("u32 out of range"))
    }

    pub(crate) fn read_var_u64(&mut self) -> Result<u64, RewriteError> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(malformed("LEB128 too long"));
            }
            result |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Raw bytes of one LEB128 value, signed or unsigned.
    pub(crate) fn read_leb_raw(&mut self) -> Result<&'a [u8], RewriteError> {
        let start = self.pos;
        for _ in 0..10 {
            if self.read_u8()? & 0x80 == 0 {
                return Ok(&self.data[start..self.pos]);
            }
        }
        Err(malformed("LEB128 too long"))
    }

    pub(crate) fn read_name(&mut self) -> Result<&'a str, RewriteError> {
        let len = self.read_var_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| malformed("name is not UTF-8"))
    }
}

// ================================================================
// Writer helpers
// ================================================================

pub(crate) fn write_var_u32(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn write_var_i32(out: &mut Vec<u8>, mut value: i32) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn write_name(out: &mut Vec<u8>, name: &str) {
    write_var_u32(out, name.len() as u32);
    out.extend_from_slice(name.as_bytes());
}

pub(crate) fn write_section(out: &mut Vec<u8>, id: u8, body: &[u8]) {
    out.push(id);
    write_var_u32(out, body.len() as u32);
    out.extend_from_slice(body);
}

/// `i32.const value`
pub(crate) fn encode_i32_const(value: i32) -> Vec<u8> {
    let mut out = vec![OP_I32_CONST];
    write_var_i32(&mut out, value);
    out
}

/// An instruction whose only immediate is a function index.
pub(crate) fn encode_func_op(opcode: u8, func: u32) -> Vec<u8> {
    let mut out = vec![opcode];
    write_var_u32(&mut out, func);
    out
}

// ================================================================
// Types
// ================================================================

/// A value type, kept in its raw encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ValType(Vec<u8>);

impl ValType {
    pub(crate) fn i32() -> Self {
        Self(vec![I32])
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, RewriteError> {
        let lead = r.read_u8()?;
        let mut raw = vec![lead];
        // (ref null? <heaptype>) carries a heap type immediate.
        if lead == 0x63 || lead == 0x64 {
            raw.extend_from_slice(r.read_leb_raw()?);
        }
        Ok(Self(raw))
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncType {
    /// `(i32 x params) -> (i32 x results)`
    pub(crate) fn i32s(params: usize, results: usize) -> Self {
        Self {
            params: vec![ValType::i32(); params],
            results: vec![ValType::i32(); results],
        }
    }

    pub(crate) fn arity(&self) -> (u32, u32) {
        (self.params.len() as u32, self.results.len() as u32)
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.push(FUNC_FORM);
        write_var_u32(out, self.params.len() as u32);
        for p in &self.params {
            p.write(out);
        }
        write_var_u32(out, self.results.len() as u32);
        for r in &self.results {
            r.write(out);
        }
    }
}

// ================================================================
// Module layout
// ================================================================

#[derive(Debug, Clone, Copy)]
pub(crate) struct Section<'a> {
    pub id: u8,
    pub body: &'a [u8],
}

#[derive(Debug, Clone)]
pub(crate) struct FuncImport {
    pub module: String,
    pub field: String,
    pub type_index: u32,
}

/// The parts of a module the rewriter reasons about.
#[derive(Debug)]
pub(crate) struct ModuleLayout<'a> {
    pub sections: Vec<Section<'a>>,
    pub types: Vec<FuncType>,
    /// Function imports in function-index order.
    pub func_imports: Vec<FuncImport>,
    /// Type index of every defined function.
    pub defined: Vec<u32>,
}

impl<'a> ModuleLayout<'a> {
    pub(crate) fn parse(bytes: &'a [u8]) -> Result<Self, RewriteError> {
        if bytes.len() < 8 || &bytes[..4] != MAGIC {
            return Err(malformed("not a wasm binary"));
        }
        if bytes[4..8] != MODULE_VERSION {
            return Err(RewriteError::Unsupported(
                "only core modules can be rewritten".into(),
            ));
        }

        let mut r = Reader::new(&bytes[8..]);
        let mut sections = Vec::new();
        while !r.eof() {
            let id = r.read_u8()?;
            let len = r.read_var_u32()? as usize;
            let body = r.read_bytes(len)?;
            sections.push(Section { id, body });
        }

        let mut layout = Self {
            sections,
            types: Vec::new(),
            func_imports: Vec::new(),
            defined: Vec::new(),
        };
        for section in layout.sections.clone() {
            match section.id {
                SECTION_TYPE => layout.types = parse_types(section.body)?,
                SECTION_IMPORT => layout.func_imports = parse_func_imports(section.body)?,
                SECTION_FUNCTION => layout.defined = parse_function_section(section.body)?,
                _ => {}
            }
        }
        Ok(layout)
    }

    pub(crate) fn func_import_count(&self) -> u32 {
        self.func_imports.len() as u32
    }

    /// Type of any function index (imported or defined).
    pub(crate) fn func_type(&self, func: u32) -> Option<&FuncType> {
        let imports = self.func_import_count();
        let type_index = if func < imports {
            self.func_imports[func as usize].type_index
        } else {
            *self.defined.get((func - imports) as usize)?
        };
        self.types.get(type_index as usize)
    }

    pub(crate) fn section(&self, id: u8) -> Option<&Section<'a>> {
        self.sections.iter().find(|s| s.id == id)
    }
}

fn parse_types(body: &[u8]) -> Result<Vec<FuncType>, RewriteError> {
    let mut r = Reader::new(body);
    let count = r.read_var_u32()?;
    let mut types = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let form = r.read_u8()?;
        if form != FUNC_FORM {
            return Err(RewriteError::Unsupported(format!(
                "type form {form:#04x} (rec groups and gc types are not rewritten)"
            )));
        }
        let params = read_val_types(&mut r)?;
        let results = read_val_types(&mut r)?;
        types.push(FuncType { params, results });
    }
    Ok(types)
}

fn read_val_types(r: &mut Reader<'_>) -> Result<Vec<ValType>, RewriteError> {
    let n = r.read_var_u32()?;
    (0..n).map(|_| ValType::read(r)).collect()
}

fn skip_limits(r: &mut Reader<'_>) -> Result<(), RewriteError> {
    let flags = r.read_u8()?;
    r.read_var_u64()?;
    if flags & 0x01 != 0 {
        r.read_var_u64()?;
    }
    if flags & 0x08 != 0 {
        r.read_var_u32()?;
    }
    Ok(())
}

fn parse_func_imports(body: &[u8]) -> Result<Vec<FuncImport>, RewriteError> {
    let mut r = Reader::new(body);
    let count = r.read_var_u32()?;
    let mut funcs = Vec::new();
    for _ in 0..count {
        let module = r.read_name()?.to_string();
        let field = r.read_name()?.to_string();
        match r.read_u8()? {
            0x00 => funcs.push(FuncImport {
                module,
                field,
                type_index: r.read_var_u32()?,
            }),
            0x01 => {
                ValType::read(&mut r)?;
                skip_limits(&mut r)?;
            }
            0x02 => skip_limits(&mut r)?,
            0x03 => {
                ValType::read(&mut r)?;
                r.read_u8()?;
            }
            0x04 => {
                r.read_u8()?;
                r.read_var_u32()?;
            }
            kind => return Err(malformed(format!("import kind {kind:#04x}"))),
        }
    }
    Ok(funcs)
}

fn parse_function_section(body: &[u8]) -> Result<Vec<u32>, RewriteError> {
    let mut r = Reader::new(body);
    let count = r.read_var_u32()?;
    (0..count).map(|_| r.read_var_u32()).collect()
}

// ================================================================
// Re-emission with appended entries
// ================================================================

/// Type section with `extra` types appended.
pub(crate) fn append_types(body: &[u8], extra: &[FuncType]) -> Result<Vec<u8>, RewriteError> {
    let mut r = Reader::new(body);
    let count = r.read_var_u32()?;
    let mut out = Vec::with_capacity(body.len() + extra.len() * 8);
    write_var_u32(&mut out, count + extra.len() as u32);
    out.extend_from_slice(r.rest());
    for ty in extra {
        ty.encode(&mut out);
    }
    Ok(out)
}

/// Import section with `extra` function imports appended.
pub(crate) fn append_func_imports(
    body: &[u8],
    extra: &[FuncImport],
) -> Result<Vec<u8>, RewriteError> {
    let mut r = Reader::new(body);
    let count = r.read_var_u32()?;
    let mut out = Vec::with_capacity(body.len() + extra.len() * 24);
    write_var_u32(&mut out, count + extra.len() as u32);
    out.extend_from_slice(r.rest());
    for import in extra {
        write_name(&mut out, &import.module);
        write_name(&mut out, &import.field);
        out.push(0x00);
        write_var_u32(&mut out, import.type_index);
    }
    Ok(out)
}

// ================================================================
// Function index remapping outside code bodies
// ================================================================

pub(crate) fn remap_exports(body: &[u8], remap: &dyn Fn(u32) -> u32) -> Result<Vec<u8>, RewriteError> {
    let mut r = Reader::new(body);
    let count = r.read_var_u32()?;
    let mut out = Vec::with_capacity(body.len() + 8);
    write_var_u32(&mut out, count);
    for _ in 0..count {
        write_name(&mut out, r.read_name()?);
        let kind = r.read_u8()?;
        let index = r.read_var_u32()?;
        out.push(kind);
        write_var_u32(&mut out, if kind == 0x00 { remap(index) } else { index });
    }
    Ok(out)
}

pub(crate) fn remap_start(body: &[u8], remap: &dyn Fn(u32) -> u32) -> Result<Vec<u8>, RewriteError> {
    let mut r = Reader::new(body);
    let mut out = Vec::new();
    write_var_u32(&mut out, remap(r.read_var_u32()?));
    Ok(out)
}

pub(crate) fn remap_globals(body: &[u8], remap: &dyn Fn(u32) -> u32) -> Result<Vec<u8>, RewriteError> {
    let mut r = Reader::new(body);
    let count = r.read_var_u32()?;
    let mut out = Vec::with_capacity(body.len() + 8);
    write_var_u32(&mut out, count);
    for _ in 0..count {
        ValType::read(&mut r)?.write(&mut out);
        out.push(r.read_u8()?);
        remap_const_expr(&mut r, &mut out, remap)?;
    }
    Ok(out)
}

pub(crate) fn remap_elements(body: &[u8], remap: &dyn Fn(u32) -> u32) -> Result<Vec<u8>, RewriteError> {
    let mut r = Reader::new(body);
    let count = r.read_var_u32()?;
    let mut out = Vec::with_capacity(body.len() + 8);
    write_var_u32(&mut out, count);
    for _ in 0..count {
        let flags = r.read_var_u32()?;
        write_var_u32(&mut out, flags);
        match flags {
            0 => {
                remap_const_expr(&mut r, &mut out, remap)?;
                remap_func_vec(&mut r, &mut out, remap)?;
            }
            1 | 3 => {
                out.push(r.read_u8()?);
                remap_func_vec(&mut r, &mut out, remap)?;
            }
            2 => {
                write_var_u32(&mut out, r.read_var_u32()?);
                remap_const_expr(&mut r, &mut out, remap)?;
                out.push(r.read_u8()?);
                remap_func_vec(&mut r, &mut out, remap)?;
            }
            4 => {
                remap_const_expr(&mut r, &mut out, remap)?;
                remap_expr_vec(&mut r, &mut out, remap)?;
            }
            5 | 7 => {
                ValType::read(&mut r)?.write(&mut out);
                remap_expr_vec(&mut r, &mut out, remap)?;
            }
            6 => {
                write_var_u32(&mut out, r.read_var_u32()?);
                remap_const_expr(&mut r, &mut out, remap)?;
                ValType::read(&mut r)?.write(&mut out);
                remap_expr_vec(&mut r, &mut out, remap)?;
            }
            other => return Err(malformed(format!("element segment flags {other}"))),
        }
    }
    Ok(out)
}

/// Every function index named outside code bodies, paired with the id of
/// the section naming it.
pub(crate) fn func_refs_outside_code(layout: &ModuleLayout<'_>) -> Result<Vec<(u8, u32)>, RewriteError> {
    let found = RefCell::new(Vec::new());
    for section in &layout.sections {
        let id = section.id;
        let record = |func: u32| {
            found.borrow_mut().push((id, func));
            func
        };
        match id {
            SECTION_EXPORT => {
                remap_exports(section.body, &record)?;
            }
            SECTION_START => {
                remap_start(section.body, &record)?;
            }
            SECTION_ELEMENT => {
                remap_elements(section.body, &record)?;
            }
            SECTION_GLOBAL => {
                remap_globals(section.body, &record)?;
            }
            _ => {}
        }
    }
    Ok(found.into_inner())
}

/// Fails when a table carries an initialiser expression, which could hide a
/// `ref.func` this pass does not track.
pub(crate) fn check_tables(body: &[u8]) -> Result<(), RewriteError> {
    let mut r = Reader::new(body);
    let count = r.read_var_u32()?;
    for _ in 0..count {
        if r.rest().first() == Some(&0x40) {
            return Err(RewriteError::Unsupported(
                "tables with initialiser expressions".into(),
            ));
        }
        ValType::read(&mut r)?;
        skip_limits(&mut r)?;
    }
    Ok(())
}

fn remap_func_vec(
    r: &mut Reader<'_>,
    out: &mut Vec<u8>,
    remap: &dyn Fn(u32) -> u32,
) -> Result<(), RewriteError> {
    let n = r.read_var_u32()?;
    write_var_u32(out, n);
    for _ in 0..n {
        write_var_u32(out, remap(r.read_var_u32()?));
    }
    Ok(())
}

fn remap_expr_vec(
    r: &mut Reader<'_>,
    out: &mut Vec<u8>,
    remap: &dyn Fn(u32) -> u32,
) -> Result<(), RewriteError> {
    let n = r.read_var_u32()?;
    write_var_u32(out, n);
    for _ in 0..n {
        remap_const_expr(r, out, remap)?;
    }
    Ok(())
}

/// Copies one constant expression up to and including `end`, remapping
/// `ref.func` immediates.
fn remap_const_expr(
    r: &mut Reader<'_>,
    out: &mut Vec<u8>,
    remap: &dyn Fn(u32) -> u32,
) -> Result<(), RewriteError> {
    loop {
        let op = r.read_u8()?;
        out.push(op);
        match op {
            0x0B => return Ok(()),
            // i32.const, i64.const, global.get, ref.null
            0x41 | 0x42 | 0x23 | 0xD0 => out.extend_from_slice(r.read_leb_raw()?),
            0x43 => out.extend_from_slice(r.read_bytes(4)?),
            0x44 => out.extend_from_slice(r.read_bytes(8)?),
            OP_REF_FUNC => write_var_u32(out, remap(r.read_var_u32()?)),
            // extended-const arithmetic
            0x6A | 0x6B | 0x6C | 0x7C | 0x7D | 0x7E => {}
            0xFD => {
                let sub = r.read_var_u32()?;
                if sub != 12 {
                    return Err(RewriteError::Unsupported(format!(
                        "simd opcode {sub} in constant expression"
                    )));
                }
                write_var_u32(out, sub);
                out.extend_from_slice(r.read_bytes(16)?);
            }
            other => {
                return Err(RewriteError::Unsupported(format!(
                    "opcode {other:#04x} in constant expression"
                )));
            }
        }
    }
}

/// Name of a custom section.
pub(crate) fn custom_section_name<'a>(body: &'a [u8]) -> Option<&'a str> {
    Reader::new(body).read_name().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leb_u32(v: u32) -> Vec<u8> {
        let mut out = Vec::new();
        write_var_u32(&mut out, v);
        out
    }

    fn leb_i32(v: i32) -> Vec<u8> {
        let mut out = Vec::new();
        write_var_i32(&mut out, v);
        out
    }

    #[test]
    fn unsigned_leb_encoding() {
        assert_eq!(leb_u32(0), vec![0x00]);
        assert_eq!(leb_u32(127), vec![0x7F]);
        assert_eq!(leb_u32(128), vec![0x80, 0x01]);
        assert_eq!(leb_u32(624_485), vec![0xE5, 0x8E, 0x26]);
    }

    #[test]
    fn signed_leb_encoding() {
        assert_eq!(leb_i32(0), vec![0x00]);
        assert_eq!(leb_i32(-1), vec![0x7F]);
        assert_eq!(leb_i32(63), vec![0x3F]);
        assert_eq!(leb_i32(64), vec![0xC0, 0x00]);
        assert_eq!(leb_i32(-123_456), vec![0xC0, 0xBB, 0x78]);
    }

    #[test]
    fn reader_roundtrips_leb() {
        let bytes = leb_u32(300_000);
        assert_eq!(Reader::new(&bytes).read_var_u32().unwrap(), 300_000);
        let raw = leb_i32(-5000);
        assert_eq!(Reader::new(&raw).read_leb_raw().unwrap(), raw.as_slice());
    }

    #[test]
    fn truncated_input_is_malformed() {
        assert!(matches!(
            Reader::new(&[0x80]).read_var_u32(),
            Err(RewriteError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_non_wasm() {
        assert!(ModuleLayout::parse(b"not wasm at all").is_err());
    }

    #[test]
    fn func_type_encoding() {
        let mut out = Vec::new();
        FuncType::i32s(2, 1).encode(&mut out);
        assert_eq!(out, vec![0x60, 2, 0x7F, 0x7F, 1, 0x7F]);
    }

    #[test]
    fn references_outside_code_are_collected() {
        let bytes = wat::parse_str(
            r#"(module
                (func $a)
                (func $b)
                (table 2 funcref)
                (elem (i32.const 0) $b $a)
                (export "a" (func $a)))"#,
        )
        .unwrap();
        let layout = ModuleLayout::parse(&bytes).unwrap();
        let refs = func_refs_outside_code(&layout).unwrap();
        assert!(refs.contains(&(SECTION_ELEMENT, 1)));
        assert!(refs.contains(&(SECTION_ELEMENT, 0)));
        assert!(refs.contains(&(SECTION_EXPORT, 0)));
        assert_eq!(refs.len(), 3);
    }

    #[test]
    fn const_expr_ref_func_is_remapped() {
        let body = [OP_REF_FUNC, 5, 0x0B];
        let mut out = Vec::new();
        remap_const_expr(&mut Reader::new(&body), &mut out, &|i| i + 2).unwrap();
        assert_eq!(out, vec![OP_REF_FUNC, 7, 0x0B]);
    }
}
