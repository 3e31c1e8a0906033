//! The compiled form consumed by the interpreter.
//!
//! A tape is a flat instruction vector addressed by index; control flow is
//! relative jumps over that vector. Side tables describe where functions
//! and class bodies start.
use std::fmt;

use crate::{FunctionFlags, InternedId, InternedStrings, Primitive, VmError};

/// Opcodes.
///
/// Unless noted otherwise an instruction reads and writes the task's
/// `resval` register and advances the cursor by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Nop,

    // ── stack / register movement ───────────────────────────────────
    /// Pop into resval, or load the operand into resval.
    Res,
    /// Push resval, or push the operand.
    Push,
    /// Read the stack top (or `stack[top - n]`) into resval.
    Peek,
    Dup,
    Pnil,
    Rnil,

    // ── members and bindings ────────────────────────────────────────
    /// Pop an object and set member `id` on it to resval.
    Fld,
    Let,
    Set,
    Get,
    /// `Get`, then push the result.
    Gtsh,

    // ── calls ───────────────────────────────────────────────────────
    Call,
    Clln,

    // ── control flow ────────────────────────────────────────────────
    Jmp,
    If,
    Ifn,
    Ret,
    Exit,
    Nblk,
    Bblk,

    // ── aggregates ──────────────────────────────────────────────────
    Anew,
    Tupl,
    Aidx,
    Aset,
    Tget,
    Tgte,
    Tlen,

    // ── arithmetic / comparison / logic ─────────────────────────────
    Add,
    Sub,
    Mult,
    Div,
    Mod,
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Neq,
    And,
    Or,
    Band,
    Bxor,
    Bor,
    Not,
    Inc,
    Dec,

    // ── types, modules, errors, async ───────────────────────────────
    Is,
    Lmdl,
    Ctch,
    Rais,
    Wait,
}

/// What an opcode accepts as operand; checked by [`Tape::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    Nothing,
    Identifier,
    Offset,
    OptionalCount,
    OptionalIdentifier,
    OptionalValue,
}

const OPS: &[(Op, &str)] = &[
    (Op::Nop, "nop"),
    (Op::Res, "res"),
    (Op::Push, "push"),
    (Op::Peek, "peek"),
    (Op::Dup, "dup"),
    (Op::Pnil, "pnil"),
    (Op::Rnil, "rnil"),
    (Op::Fld, "fld"),
    (Op::Let, "let"),
    (Op::Set, "set"),
    (Op::Get, "get"),
    (Op::Gtsh, "gtsh"),
    (Op::Call, "call"),
    (Op::Clln, "clln"),
    (Op::Jmp, "jmp"),
    (Op::If, "if"),
    (Op::Ifn, "ifn"),
    (Op::Ret, "ret"),
    (Op::Exit, "exit"),
    (Op::Nblk, "nblk"),
    (Op::Bblk, "bblk"),
    (Op::Anew, "anew"),
    (Op::Tupl, "tupl"),
    (Op::Aidx, "aidx"),
    (Op::Aset, "aset"),
    (Op::Tget, "tget"),
    (Op::Tgte, "tgte"),
    (Op::Tlen, "tlen"),
    (Op::Add, "add"),
    (Op::Sub, "sub"),
    (Op::Mult, "mult"),
    (Op::Div, "div"),
    (Op::Mod, "mod"),
    (Op::Lt, "lt"),
    (Op::Gt, "gt"),
    (Op::Lte, "lte"),
    (Op::Gte, "gte"),
    (Op::Eq, "eq"),
    (Op::Neq, "neq"),
    (Op::And, "and"),
    (Op::Or, "or"),
    (Op::Band, "band"),
    (Op::Bxor, "bxor"),
    (Op::Bor, "bor"),
    (Op::Not, "not"),
    (Op::Inc, "inc"),
    (Op::Dec, "dec"),
    (Op::Is, "is"),
    (Op::Lmdl, "lmdl"),
    (Op::Ctch, "ctch"),
    (Op::Rais, "rais"),
    (Op::Wait, "wait"),
];

impl Op {
    pub fn name(self) -> &'static str {
        OPS.iter()
            .find(|(op, _)| *op == self)
            .map(|(_, name)| *name)
            .unwrap_or("?")
    }

    pub fn from_name(name: &str) -> Option<Op> {
        OPS.iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(op, _)| *op)
    }

    pub fn is_binary(self) -> bool {
        matches!(
            self,
            Op::Add
                | Op::Sub
                | Op::Mult
                | Op::Div
                | Op::Mod
                | Op::Lt
                | Op::Gt
                | Op::Lte
                | Op::Gte
                | Op::Eq
                | Op::Neq
                | Op::And
                | Op::Or
                | Op::Band
                | Op::Bxor
                | Op::Bor
        )
    }

    pub fn is_jump(self) -> bool {
        matches!(self, Op::Jmp | Op::If | Op::Ifn | Op::Ctch)
    }

    pub fn operand_shape(self) -> OperandShape {
        match self {
            Op::Let | Op::Set | Op::Fld | Op::Get | Op::Gtsh | Op::Lmdl => {
                OperandShape::Identifier
            }
            Op::Jmp | Op::If | Op::Ifn | Op::Ctch | Op::Tget | Op::Tgte => {
                OperandShape::Offset
            }
            Op::Peek | Op::Anew | Op::Tupl => OperandShape::OptionalCount,
            Op::Call | Op::Clln | Op::Is | Op::Inc | Op::Dec => {
                OperandShape::OptionalIdentifier
            }
            Op::Res | Op::Push | Op::Ret | Op::Exit => {
                OperandShape::OptionalValue
            }
            op if op.is_binary() => OperandShape::OptionalValue,
            _ => OperandShape::Nothing,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Operand {
    #[default]
    None,
    Primitive(Primitive),
    /// String literal; evaluates to a fresh String object.
    Str(InternedId),
    /// Identifier; evaluates by name resolution.
    Id(InternedId),
}

impl Operand {
    pub fn as_int(self) -> Option<i64> {
        match self {
            Operand::Primitive(p) => p.as_i64(),
            _ => None,
        }
    }

    pub fn as_id(self) -> Option<InternedId> {
        match self {
            Operand::Id(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    pub op: Op,
    pub operand: Operand,
}

impl Instruction {
    pub fn new(op: Op, operand: Operand) -> Self {
        Self { op, operand }
    }

    pub fn bare(op: Op) -> Self {
        Self {
            op,
            operand: Operand::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLoc {
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Tape {
    pub instructions: Vec<Instruction>,
    /// Parallel to `instructions`.
    pub source_map: Vec<Option<SourceLoc>>,
    /// Source text by line (1-based lines index `line - 1`), for traces.
    pub source_lines: Vec<String>,
}

impl Tape {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn get(&self, ins: usize) -> Option<&Instruction> {
        self.instructions.get(ins)
    }

    pub fn source_at(&self, ins: usize) -> Option<SourceLoc> {
        self.source_map.get(ins).copied().flatten()
    }

    pub fn line_text(&self, line: u32) -> Option<&str> {
        let idx = (line as usize).checked_sub(1)?;
        self.source_lines.get(idx).map(|s| s.trim())
    }

    /// Check every instruction's operand against its opcode and every jump
    /// target against the tape bounds.
    pub fn validate(&self) -> Result<(), VmError> {
        let len = self.instructions.len();
        for (ins, instruction) in self.instructions.iter().enumerate() {
            let op = instruction.op;
            let operand = instruction.operand;
            let malformed = |reason: &str| VmError::MalformedTape {
                ins,
                op: op.name(),
                reason: reason.to_string(),
            };
            match (op.operand_shape(), operand) {
                (OperandShape::Nothing, Operand::None) => (),
                (OperandShape::Nothing, _) => {
                    return Err(malformed("takes no operand"));
                }
                (OperandShape::Identifier, Operand::Id(_)) => (),
                (OperandShape::Identifier, _) => {
                    return Err(malformed("expects an identifier"));
                }
                (OperandShape::Offset, operand) => {
                    let Some(k) = operand.as_int() else {
                        return Err(malformed("expects an integer"));
                    };
                    if op.is_jump() {
                        let target = ins as i64 + k;
                        if target < 0 || target > len as i64 {
                            return Err(malformed("jump target out of range"));
                        }
                    } else if k < 0 {
                        return Err(malformed("negative tuple index"));
                    }
                }
                (OperandShape::OptionalCount, Operand::None) => (),
                (OperandShape::OptionalCount, operand) => match operand.as_int()
                {
                    Some(n) if n >= 0 => (),
                    _ => return Err(malformed("expects a non-negative count")),
                },
                (OperandShape::OptionalIdentifier, Operand::None | Operand::Id(_)) => {}
                (OperandShape::OptionalIdentifier, _) => {
                    return Err(malformed("expects an identifier or nothing"));
                }
                (OperandShape::OptionalValue, _) => (),
            }
        }
        if !self.source_map.is_empty() && self.source_map.len() != len {
            return Err(VmError::MalformedTape {
                ins: self.source_map.len(),
                op: "source map",
                reason: "source map length differs from tape length".into(),
            });
        }
        Ok(())
    }

    /// Human-readable listing.
    pub fn dump(&self, strings: &InternedStrings) -> String {
        let mut out = String::new();
        for (ins, instruction) in self.instructions.iter().enumerate() {
            let operand = match instruction.operand {
                Operand::None => String::new(),
                Operand::Primitive(p) => match p {
                    Primitive::Float(x) => format!(" {x:?}"),
                    Primitive::Char(c) => format!(" '{}'", (c as u8) as char),
                    Primitive::Int(i) => format!(" {i}"),
                },
                Operand::Str(id) => format!(" {:?}", &*strings.get(id)),
                Operand::Id(id) => format!(" {}", strings.get(id)),
            };
            out.push_str(&format!("{ins:5}  {}{operand}\n", instruction.op));
        }
        out
    }
}

/// A function entry in a module's side table.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub ins_pos: usize,
    /// Set for methods: the name of a class in the same module.
    pub class: Option<String>,
    pub flags: FunctionFlags,
}

/// A class entry in a module's side table.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    pub super_name: Option<String>,
    pub fields: Vec<String>,
    pub start: usize,
    pub end: usize,
}

/// Output of the compiler pipeline: a tape plus its side tables.
#[derive(Debug, Clone, Default)]
pub struct CompiledModule {
    pub name: String,
    pub tape: Tape,
    pub functions: Vec<FunctionDef>,
    pub classes: Vec<ClassDef>,
}

impl CompiledModule {
    pub fn validate(&self) -> Result<(), VmError> {
        self.tape.validate()?;
        let len = self.tape.len();
        for f in &self.functions {
            if f.ins_pos >= len {
                return Err(VmError::MalformedModule(format!(
                    "function `{}` starts at {} past the end of the tape ({len})",
                    f.name, f.ins_pos
                )));
            }
            if let Some(class) = &f.class {
                if !self.classes.iter().any(|c| &c.name == class) {
                    return Err(VmError::MalformedModule(format!(
                        "method `{}` names unknown class `{class}`",
                        f.name
                    )));
                }
            }
        }
        for c in &self.classes {
            if c.start > c.end || c.end > len {
                return Err(VmError::MalformedModule(format!(
                    "class `{}` spans {}..{} outside the tape ({len})",
                    c.name, c.start, c.end
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tape(instructions: Vec<Instruction>) -> Tape {
        Tape {
            instructions,
            ..Default::default()
        }
    }

    #[test]
    fn op_names_round_trip() {
        for (op, name) in OPS {
            assert_eq!(Op::from_name(name), Some(*op));
            assert_eq!(op.name(), *name);
        }
        assert_eq!(Op::from_name("RES"), Some(Op::Res));
        assert_eq!(Op::from_name("bogus"), None);
    }

    #[test]
    fn jump_past_end_is_rejected() {
        let t = tape(vec![
            Instruction::new(Op::Jmp, Operand::Primitive(Primitive::Int(2))),
            Instruction::bare(Op::Nop),
        ]);
        assert!(t.validate().is_ok());
        let t = tape(vec![Instruction::new(
            Op::If,
            Operand::Primitive(Primitive::Int(5)),
        )]);
        assert!(matches!(t.validate(), Err(VmError::MalformedTape { .. })));
    }

    #[test]
    fn identifier_ops_require_identifiers() {
        let strings = InternedStrings::new();
        let ok = tape(vec![Instruction::new(Op::Let, Operand::Id(strings.add("x")))]);
        assert!(ok.validate().is_ok());
        let bad = tape(vec![Instruction::new(
            Op::Let,
            Operand::Primitive(Primitive::Int(1)),
        )]);
        assert!(bad.validate().is_err());
        let bad = tape(vec![Instruction::new(Op::Call, Operand::Str(strings.add("f")))]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn bare_ops_reject_operands() {
        let bad = tape(vec![Instruction::new(
            Op::Nblk,
            Operand::Primitive(Primitive::Int(1)),
        )]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn side_tables_are_checked() {
        let mut module = CompiledModule {
            name: "m".into(),
            tape: tape(vec![Instruction::bare(Op::Nop)]),
            ..Default::default()
        };
        module.functions.push(FunctionDef {
            name: "f".into(),
            ins_pos: 3,
            class: None,
            flags: FunctionFlags::empty(),
        });
        assert!(matches!(module.validate(), Err(VmError::MalformedModule(_))));
    }
}
