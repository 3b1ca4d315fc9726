//! Instruction decoding and backward stack-effect walks over one function body.

use wasmparser::{FunctionBody, Operator};

use super::RewriteError;
use super::binary::ModuleLayout;

/// Net stack effect of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    Stack { pops: u32, pushes: u32 },
    /// No stack effect; skipped by walks.
    Nop,
    /// Control flow or anything the walk does not model.
    Barrier,
}

/// Function-index immediate carried by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    None,
    Call(u32),
    ReturnCall(u32),
    RefFunc(u32),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Instr {
    /// Absolute offset of the opcode.
    pub start: usize,
    /// Absolute offset one past the last immediate.
    pub end: usize,
    pub effect: Effect,
    pub target: Target,
    /// `i32.const`, `local.get` or `global.get`: one value, no inputs, no
    /// side effects. Removable without disturbing the stack.
    pub simple_push: bool,
}

/// Decodes every instruction of a body with its offsets.
pub(crate) fn decode_body(
    body: &FunctionBody<'_>,
    layout: &ModuleLayout<'_>,
) -> Result<Vec<Instr>, RewriteError> {
    let mut reader = body.get_operators_reader()?;
    let mut instrs = Vec::new();
    while !reader.eof() {
        let (op, start) = reader.read_with_offset()?;
        let end = reader.original_position();
        let target = target_of(&op);
        let effect = match target {
            Target::Call(func) => match layout.func_type(func) {
                Some(ty) => {
                    let (pops, pushes) = ty.arity();
                    Effect::Stack { pops, pushes }
                }
                None => Effect::Barrier,
            },
            _ => effect_of(&op),
        };
        instrs.push(Instr {
            start,
            end,
            effect,
            target,
            simple_push: matches!(
                op,
                Operator::I32Const { .. } | Operator::LocalGet { .. } | Operator::GlobalGet { .. }
            ),
        });
    }
    Ok(instrs)
}

/// Index of the instruction that begins pushing the last `args` operands
/// consumed by `instrs[call]`.
///
/// Walks backward keeping a count of values still owed: each instruction
/// pays off what it pushes and adds what it pops. Returns `None` when a
/// barrier is met or the sequence cannot be isolated.
pub(crate) fn arg_push_start(instrs: &[Instr], call: usize, args: u32) -> Option<usize> {
    if args == 0 {
        return Some(call);
    }
    let mut need = i64::from(args);
    let mut i = call;
    while i > 0 {
        i -= 1;
        match instrs[i].effect {
            Effect::Nop => continue,
            Effect::Barrier => return None,
            Effect::Stack { pops, pushes } => {
                need -= i64::from(pushes);
                if need < 0 {
                    return None;
                }
                need += i64::from(pops);
                if need == 0 {
                    return Some(i);
                }
            }
        }
    }
    None
}

/// Closest instruction before `index` that is not a `nop`.
pub(crate) fn previous_significant(instrs: &[Instr], index: usize) -> Option<usize> {
    (0..index).rev().find(|&i| instrs[i].effect != Effect::Nop)
}

fn target_of(op: &Operator<'_>) -> Target {
    match *op {
        Operator::Call { function_index } => Target::Call(function_index),
        Operator::ReturnCall { function_index } => Target::ReturnCall(function_index),
        Operator::RefFunc { function_index } => Target::RefFunc(function_index),
        _ => Target::None,
    }
}

const fn stack(pops: u32, pushes: u32) -> Effect {
    Effect::Stack { pops, pushes }
}

fn effect_of(op: &Operator<'_>) -> Effect {
    use Operator::*;
    match op {
        Nop => Effect::Nop,

        I32Const { .. }
        | I64Const { .. }
        | F32Const { .. }
        | F64Const { .. }
        | V128Const { .. }
        | RefNull { .. }
        | RefFunc { .. }
        | LocalGet { .. }
        | GlobalGet { .. }
        | MemorySize { .. } => stack(0, 1),

        LocalSet { .. } | GlobalSet { .. } | Drop => stack(1, 0),
        LocalTee { .. } | MemoryGrow { .. } | RefIsNull => stack(1, 1),
        Select | TypedSelect { .. } => stack(3, 1),

        I32Load { .. }
        | I64Load { .. }
        | F32Load { .. }
        | F64Load { .. }
        | I32Load8S { .. }
        | I32Load8U { .. }
        | I32Load16S { .. }
        | I32Load16U { .. }
        | I64Load8S { .. }
        | I64Load8U { .. }
        | I64Load16S { .. }
        | I64Load16U { .. }
        | I64Load32S { .. }
        | I64Load32U { .. } => stack(1, 1),

        I32Store { .. }
        | I64Store { .. }
        | F32Store { .. }
        | F64Store { .. }
        | I32Store8 { .. }
        | I32Store16 { .. }
        | I64Store8 { .. }
        | I64Store16 { .. }
        | I64Store32 { .. } => stack(2, 0),

        I32Eqz | I64Eqz | I32Clz | I32Ctz | I32Popcnt | I64Clz | I64Ctz | I64Popcnt
        | F32Abs | F32Neg | F32Ceil | F32Floor | F32Trunc | F32Nearest | F32Sqrt | F64Abs
        | F64Neg | F64Ceil | F64Floor | F64Trunc | F64Nearest | F64Sqrt | I32WrapI64
        | I32TruncF32S | I32TruncF32U | I32TruncF64S | I32TruncF64U | I64ExtendI32S
        | I64ExtendI32U | I64TruncF32S | I64TruncF32U | I64TruncF64S | I64TruncF64U
        | F32ConvertI32S | F32ConvertI32U | F32ConvertI64S | F32ConvertI64U | F32DemoteF64
        | F64ConvertI32S | F64ConvertI32U | F64ConvertI64S | F64ConvertI64U
        | F64PromoteF32 | I32ReinterpretF32 | I64ReinterpretF64 | F32ReinterpretI32
        | F64ReinterpretI64 | I32Extend8S | I32Extend16S | I64Extend8S | I64Extend16S
        | I64Extend32S => stack(1, 1),

        I32Eq | I32Ne | I32LtS | I32LtU | I32GtS | I32GtU | I32LeS | I32LeU | I32GeS
        | I32GeU | I64Eq | I64Ne | I64LtS | I64LtU | I64GtS | I64GtU | I64LeS | I64LeU
        | I64GeS | I64GeU | F32Eq | F32Ne | F32Lt | F32Gt | F32Le | F32Ge | F64Eq | F64Ne
        | F64Lt | F64Gt | F64Le | F64Ge | I32Add | I32Sub | I32Mul | I32DivS | I32DivU
        | I32RemS | I32RemU | I32And | I32Or | I32Xor | I32Shl | I32ShrS | I32ShrU
        | I32Rotl | I32Rotr | I64Add | I64Sub | I64Mul | I64DivS | I64DivU | I64RemS
        | I64RemU | I64And | I64Or | I64Xor | I64Shl | I64ShrS | I64ShrU | I64Rotl
        | I64Rotr | F32Add | F32Sub | F32Mul | F32Div | F32Min | F32Max | F32Copysign
        | F64Add | F64Sub | F64Mul | F64Div | F64Min | F64Max | F64Copysign => stack(2, 1),

        _ => Effect::Barrier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instr(pops: u32, pushes: u32) -> Instr {
        Instr {
            start: 0,
            end: 0,
            effect: stack(pops, pushes),
            target: Target::None,
            simple_push: pops == 0 && pushes == 1,
        }
    }

    fn nop() -> Instr {
        Instr {
            effect: Effect::Nop,
            ..instr(0, 0)
        }
    }

    fn barrier() -> Instr {
        Instr {
            effect: Effect::Barrier,
            ..instr(0, 0)
        }
    }

    #[test]
    fn straight_pushes() {
        // local.get; local.get; call(2)
        let body = [instr(0, 1), instr(0, 1), instr(2, 1)];
        assert_eq!(arg_push_start(&body, 2, 2), Some(0));
        assert_eq!(arg_push_start(&body, 2, 1), Some(1));
    }

    #[test]
    fn computed_argument_is_included() {
        // local.get; i32.const; i32.const; i32.add; call(2)
        let body = [instr(0, 1), instr(0, 1), instr(0, 1), instr(2, 1), instr(2, 0)];
        assert_eq!(arg_push_start(&body, 4, 2), Some(0));
        assert_eq!(arg_push_start(&body, 4, 1), Some(1));
    }

    #[test]
    fn nops_are_skipped() {
        let body = [instr(0, 1), nop(), instr(0, 1), nop(), instr(2, 0)];
        assert_eq!(arg_push_start(&body, 4, 2), Some(0));
        assert_eq!(previous_significant(&body, 4), Some(2));
    }

    #[test]
    fn barrier_aborts() {
        let body = [instr(0, 1), barrier(), instr(0, 1), instr(2, 0)];
        assert_eq!(arg_push_start(&body, 3, 2), None);
        assert_eq!(arg_push_start(&body, 3, 1), Some(2));
    }

    #[test]
    fn overshooting_producer_aborts() {
        // a call pushing two values where only one is owed
        let body = [instr(0, 2), instr(2, 0)];
        assert_eq!(arg_push_start(&body, 1, 1), None);
    }

    #[test]
    fn running_off_the_start_fails() {
        let body = [instr(0, 1), instr(2, 0)];
        assert_eq!(arg_push_start(&body, 1, 2), None);
    }
}
