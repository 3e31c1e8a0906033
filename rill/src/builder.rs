//! Programmatic tape construction.
//!
//! Top-level code comes first and should end in `ret`; function and method
//! bodies follow, each registered at the position where it starts.
use crate::{
    ClassDef, CompiledModule, FunctionDef, FunctionFlags, Instruction,
    InternedStrings, Op, Operand, Primitive, SourceLoc, Tape, VmError,
};

/// A jump target that may be bound after the jumps referring to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

pub struct TapeBuilder {
    strings: InternedStrings,
    name: String,
    instructions: Vec<Instruction>,
    source_map: Vec<Option<SourceLoc>>,
    source_lines: Vec<String>,
    loc: Option<SourceLoc>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
    functions: Vec<FunctionDef>,
    classes: Vec<ClassDef>,
    open_class: Option<usize>,
}

impl TapeBuilder {
    pub fn new(strings: &InternedStrings, name: &str) -> Self {
        Self {
            strings: strings.clone(),
            name: name.to_string(),
            instructions: Vec::new(),
            source_map: Vec::new(),
            source_lines: Vec::new(),
            loc: None,
            labels: Vec::new(),
            fixups: Vec::new(),
            functions: Vec::new(),
            classes: Vec::new(),
            open_class: None,
        }
    }

    /// Source text used for stack trace lines.
    pub fn source(&mut self, text: &str) -> &mut Self {
        self.source_lines = text.lines().map(str::to_string).collect();
        self
    }

    /// Attribute the following instructions to `line:col`.
    pub fn at(&mut self, line: u32, col: u32) -> &mut Self {
        self.loc = Some(SourceLoc { line, col });
        self
    }

    pub fn position(&self) -> usize {
        self.instructions.len()
    }

    pub fn emit(&mut self, op: Op, operand: Operand) -> &mut Self {
        self.instructions.push(Instruction::new(op, operand));
        self.source_map.push(self.loc);
        self
    }

    pub fn op(&mut self, op: Op) -> &mut Self {
        self.emit(op, Operand::None)
    }

    pub fn int(&mut self, op: Op, value: i64) -> &mut Self {
        self.emit(op, Operand::Primitive(Primitive::Int(value)))
    }

    pub fn float(&mut self, op: Op, value: f64) -> &mut Self {
        self.emit(op, Operand::Primitive(Primitive::Float(value)))
    }

    pub fn char(&mut self, op: Op, value: u8) -> &mut Self {
        self.emit(op, Operand::Primitive(Primitive::Char(value as i8)))
    }

    /// String literal operand.
    pub fn str(&mut self, op: Op, value: &str) -> &mut Self {
        let id = self.strings.add(value);
        self.emit(op, Operand::Str(id))
    }

    /// Identifier operand.
    pub fn id(&mut self, op: Op, name: &str) -> &mut Self {
        let id = self.strings.add(name);
        self.emit(op, Operand::Id(id))
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Point `label` at the next instruction.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.position());
        self
    }

    /// A relative jump (`jmp`, `if`, `ifn`, `ctch`) to `label`.
    pub fn jump(&mut self, op: Op, label: Label) -> &mut Self {
        self.fixups.push((self.position(), label));
        self.emit(op, Operand::Primitive(Primitive::Int(0)))
    }

    /// Start a free function at the next instruction, or a method when a
    /// class is open.
    pub fn function(&mut self, name: &str, flags: FunctionFlags) -> &mut Self {
        let class = self.open_class.map(|c| self.classes[c].name.clone());
        self.functions.push(FunctionDef {
            name: name.to_string(),
            ins_pos: self.position(),
            class,
            flags,
        });
        self
    }

    /// Open a class; functions declared until [`end_class`](Self::end_class)
    /// become its methods.
    pub fn class(&mut self, name: &str, super_name: Option<&str>, fields: &[&str]) -> &mut Self {
        self.classes.push(ClassDef {
            name: name.to_string(),
            super_name: super_name.map(str::to_string),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            start: self.position(),
            end: self.position(),
        });
        self.open_class = Some(self.classes.len() - 1);
        self
    }

    pub fn end_class(&mut self) -> &mut Self {
        if let Some(c) = self.open_class.take() {
            self.classes[c].end = self.position();
        }
        self
    }

    pub fn has_open_class(&self) -> bool {
        self.open_class.is_some()
    }

    /// Resolve labels and produce a validated module.
    pub fn finish(mut self) -> Result<CompiledModule, VmError> {
        self.end_class();
        for &(ins, label) in &self.fixups {
            let target = self.labels[label.0].ok_or_else(|| {
                VmError::MalformedModule(format!("label {} used at {ins} is never bound", label.0))
            })?;
            self.instructions[ins].operand =
                Operand::Primitive(Primitive::Int(target as i64 - ins as i64));
        }
        let source_map = if self.source_map.iter().all(Option::is_none) {
            Vec::new()
        } else {
            self.source_map
        };
        let compiled = CompiledModule {
            name: self.name,
            tape: Tape {
                instructions: self.instructions,
                source_map,
                source_lines: self.source_lines,
            },
            functions: self.functions,
            classes: self.classes,
        };
        compiled.validate()?;
        Ok(compiled)
    }
}
