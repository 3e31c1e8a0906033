//! Text assembler for tapes.
//!
//! ```text
//! ; comment
//! .class Point : Object x y     ; class with fields, methods follow
//! .func norm                    ; method of Point
//!     get x
//!     ret
//! .end
//! .func main async              ; free function, flags: async anon const background
//! loop:
//!     dec n
//!     if @loop
//!     res "done"
//!     ret
//! ```
//!
//! Top-level code is whatever precedes the first `.func`/`.class`.
use ahash::AHashMap;

use crate::{
    CompiledModule, FunctionFlags, InternedStrings, Label, Op, Operand,
    OperandShape, Primitive, TapeBuilder, VmError,
};

struct Assembler<'a> {
    file: &'a str,
    line: usize,
    builder: TapeBuilder,
    labels: AHashMap<String, Label>,
    bound: AHashMap<String, usize>,
    used: Vec<(String, usize)>,
}

/// Assemble `source` into a module called `name`. `file` only appears in
/// error messages.
pub fn assemble(
    name: &str,
    file: &str,
    source: &str,
    strings: &InternedStrings,
) -> Result<CompiledModule, VmError> {
    let mut builder = TapeBuilder::new(strings, name);
    builder.source(source);
    let mut asm = Assembler {
        file,
        line: 0,
        builder,
        labels: AHashMap::new(),
        bound: AHashMap::new(),
        used: Vec::new(),
    };
    for (idx, raw) in source.lines().enumerate() {
        asm.line = idx + 1;
        asm.line_of(raw)?;
    }
    asm.finish()
}

impl Assembler<'_> {
    fn error(&self, message: impl Into<String>) -> VmError {
        VmError::Assembly {
            file: self.file.to_string(),
            line: self.line,
            message: message.into(),
        }
    }

    fn label(&mut self, name: &str) -> Label {
        if let Some(&label) = self.labels.get(name) {
            return label;
        }
        let label = self.builder.label();
        self.labels.insert(name.to_string(), label);
        label
    }

    fn line_of(&mut self, raw: &str) -> Result<(), VmError> {
        let text = strip_comment(raw).trim_end();
        let trimmed = text.trim_start();
        if trimmed.is_empty() {
            return Ok(());
        }
        let col = (text.len() - trimmed.len() + 1) as u32;

        if let Some(directive) = trimmed.strip_prefix('.') {
            return self.directive(directive);
        }

        if let Some(name) = trimmed.strip_suffix(':') {
            if is_identifier(name) {
                if self.bound.insert(name.to_string(), self.line).is_some() {
                    return Err(self.error(format!("label `{name}` defined twice")));
                }
                let label = self.label(name);
                self.builder.bind(label);
                return Ok(());
            }
        }

        let (mnemonic, rest) = split_word(trimmed);
        let op = Op::from_name(mnemonic)
            .ok_or_else(|| self.error(format!("unknown instruction `{mnemonic}`")))?;
        self.builder.at(self.line as u32, col);
        self.instruction(op, rest.trim())
    }

    fn instruction(&mut self, op: Op, operand: &str) -> Result<(), VmError> {
        if let Some(target) = operand.strip_prefix('@') {
            if !op.is_jump() {
                return Err(self.error(format!("`{op}` does not take a label")));
            }
            if !is_identifier(target) {
                return Err(self.error(format!("bad label `{target}`")));
            }
            self.used.push((target.to_string(), self.line));
            let label = self.label(target);
            self.builder.jump(op, label);
            return Ok(());
        }

        let operand = self.operand(operand)?;
        // shape errors surface with a line number rather than a tape index
        let fits = match (op.operand_shape(), &operand) {
            (OperandShape::Nothing, Parsed::None) => true,
            (OperandShape::Nothing, _) => false,
            (OperandShape::Identifier, Parsed::Id(_)) => true,
            (OperandShape::Identifier, _) => false,
            (OperandShape::Offset, Parsed::Int(_)) => true,
            (OperandShape::Offset, _) => false,
            (OperandShape::OptionalCount, Parsed::None | Parsed::Int(_)) => true,
            (OperandShape::OptionalCount, _) => false,
            (OperandShape::OptionalIdentifier, Parsed::None | Parsed::Id(_)) => true,
            (OperandShape::OptionalIdentifier, _) => false,
            (OperandShape::OptionalValue, _) => true,
        };
        if !fits {
            return Err(self.error(format!("bad operand for `{op}`")));
        }
        match operand {
            Parsed::None => self.builder.op(op),
            Parsed::Int(i) => self.builder.int(op, i),
            Parsed::Float(x) => self.builder.float(op, x),
            Parsed::Char(c) => self.builder.char(op, c),
            Parsed::Str(s) => self.builder.str(op, &s),
            Parsed::Id(id) => self.builder.id(op, id),
        };
        Ok(())
    }

    fn operand<'s>(&self, text: &'s str) -> Result<Parsed<'s>, VmError> {
        if text.is_empty() {
            return Ok(Parsed::None);
        }
        if let Some(body) = text.strip_prefix('"') {
            let body = body
                .strip_suffix('"')
                .ok_or_else(|| self.error("unterminated string"))?;
            return unescape(body)
                .map(Parsed::Str)
                .ok_or_else(|| self.error("bad escape in string"));
        }
        if let Some(body) = text.strip_prefix('\'') {
            let body = body
                .strip_suffix('\'')
                .ok_or_else(|| self.error("unterminated char"))?;
            let value = unescape(body).ok_or_else(|| self.error("bad escape in char"))?;
            return match value.as_bytes() {
                [c] => Ok(Parsed::Char(*c)),
                _ => Err(self.error("char literal must be one byte")),
            };
        }
        let first = text.as_bytes()[0];
        if first.is_ascii_digit() || first == b'-' || first == b'+' {
            if let Ok(i) = text.parse::<i64>() {
                return Ok(Parsed::Int(i));
            }
            if let Ok(x) = text.parse::<f64>() {
                return Ok(Parsed::Float(x));
            }
            return Err(self.error(format!("bad number `{text}`")));
        }
        if is_identifier(text) {
            return Ok(Parsed::Id(text));
        }
        Err(self.error(format!("bad operand `{text}`")))
    }

    fn directive(&mut self, text: &str) -> Result<(), VmError> {
        let (name, rest) = split_word(text);
        let mut words = rest.split_whitespace();
        match name {
            "func" => {
                let fname = words
                    .next()
                    .filter(|w| is_identifier(w))
                    .ok_or_else(|| self.error(".func needs a name"))?;
                let mut flags = FunctionFlags::empty();
                for word in words {
                    flags |= match word {
                        "async" => FunctionFlags::ASYNC,
                        "anon" => FunctionFlags::ANON,
                        "const" => FunctionFlags::CONST,
                        "background" => FunctionFlags::BACKGROUND,
                        other => return Err(self.error(format!("unknown flag `{other}`"))),
                    };
                }
                self.builder.function(fname, flags);
            }
            "class" => {
                if self.builder.has_open_class() {
                    return Err(self.error("classes do not nest"));
                }
                let cname = words
                    .next()
                    .filter(|w| is_identifier(w))
                    .ok_or_else(|| self.error(".class needs a name"))?;
                let mut words = words.peekable();
                let mut super_name = None;
                if words.peek() == Some(&":") {
                    words.next();
                    super_name = Some(
                        words
                            .next()
                            .filter(|w| is_identifier(w))
                            .ok_or_else(|| self.error("missing superclass after `:`"))?,
                    );
                }
                let fields: Vec<&str> = words.collect();
                if let Some(bad) = fields.iter().find(|f| !is_identifier(f)) {
                    return Err(self.error(format!("bad field name `{bad}`")));
                }
                self.builder.class(cname, super_name, &fields);
            }
            "end" => {
                if !self.builder.has_open_class() {
                    return Err(self.error(".end without .class"));
                }
                self.builder.end_class();
            }
            other => return Err(self.error(format!("unknown directive `.{other}`"))),
        }
        Ok(())
    }

    fn finish(self) -> Result<CompiledModule, VmError> {
        for (name, line) in &self.used {
            if !self.bound.contains_key(name) {
                return Err(VmError::Assembly {
                    file: self.file.to_string(),
                    line: *line,
                    message: format!("undefined label `{name}`"),
                });
            }
        }
        self.builder.finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Parsed<'s> {
    None,
    Int(i64),
    Float(f64),
    Char(u8),
    Str(String),
    Id(&'s str),
}

fn split_word(text: &str) -> (&str, &str) {
    match text.find(char::is_whitespace) {
        Some(at) => (&text[..at], &text[at..]),
        None => (text, ""),
    }
}

/// Identifiers may carry a `$` prefix for runtime hooks such as
/// `$__set_super`.
fn is_identifier(text: &str) -> bool {
    let body = text.strip_prefix('$').unwrap_or(text);
    let mut chars = body.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Cut a `;` comment, ignoring semicolons inside quotes.
fn strip_comment(line: &str) -> &str {
    let mut quote = None;
    let mut escaped = false;
    for (at, c) in line.char_indices() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => quote = Some(c),
                ';' => return &line[..at],
                _ => (),
            },
        }
    }
    line
}

fn unescape(body: &str) -> Option<String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        out.push(match chars.next()? {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            '\\' => '\\',
            '"' => '"',
            '\'' => '\'',
            _ => return None,
        });
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asm(source: &str) -> Result<CompiledModule, VmError> {
        assemble("test", "test.rasm", source, &InternedStrings::new())
    }

    #[test]
    fn operands_parse_by_shape() {
        let strings = InternedStrings::new();
        let module = assemble(
            "m",
            "m.rasm",
            "res 42\nres -1.5\nres 'a'\nres \"hi; there\\n\"\nres x ; trailing\nret",
            &strings,
        )
        .unwrap();
        let ins = &module.tape.instructions;
        assert_eq!(ins[0].operand, Operand::Primitive(Primitive::Int(42)));
        assert_eq!(ins[1].operand, Operand::Primitive(Primitive::Float(-1.5)));
        assert_eq!(ins[2].operand, Operand::Primitive(Primitive::Char(b'a' as i8)));
        match ins[3].operand {
            Operand::Str(id) => assert_eq!(&*strings.get(id), "hi; there\n"),
            other => panic!("expected a string, got {other:?}"),
        }
        assert_eq!(ins[4].operand, Operand::Id(strings.add("x")));
        assert_eq!(module.tape.source_at(4).map(|l| l.line), Some(5));
    }

    #[test]
    fn labels_become_relative_offsets() {
        let module = asm("top:\n  dec n\n  if @top\n  jmp @out\n  nop\nout:\n  ret").unwrap();
        let ins = &module.tape.instructions;
        assert_eq!(ins[1].operand.as_int(), Some(-1));
        assert_eq!(ins[2].operand.as_int(), Some(2));
    }

    #[test]
    fn classes_and_functions_fill_side_tables() {
        let module = asm(
            "ret\n.class Point : Base x y\n.func norm const\n  ret\n.end\n.class Base\n.end\n.func run async\n  ret",
        )
        .unwrap();
        assert_eq!(module.classes.len(), 2);
        assert_eq!(module.classes[0].super_name.as_deref(), Some("Base"));
        assert_eq!(module.classes[0].fields, vec!["x", "y"]);
        assert_eq!(module.functions[0].class.as_deref(), Some("Point"));
        assert!(module.functions[0].flags.contains(FunctionFlags::CONST));
        assert!(module.functions[1].flags.contains(FunctionFlags::ASYNC));
        assert_eq!(module.functions[1].class, None);
    }

    #[test]
    fn errors_carry_line_numbers() {
        let err = asm("nop\nfrobnicate 3").unwrap_err();
        assert!(matches!(err, VmError::Assembly { line: 2, .. }));
        let err = asm("jmp @nowhere").unwrap_err();
        assert!(matches!(err, VmError::Assembly { line: 1, .. }));
        let err = asm("let 3").unwrap_err();
        assert!(matches!(err, VmError::Assembly { line: 1, .. }));
        let err = asm("nop\n.end").unwrap_err();
        assert!(matches!(err, VmError::Assembly { line: 2, .. }));
    }

    #[test]
    fn operands_must_fit_the_op() {
        let err = asm("res 1\nnop 3").unwrap_err();
        match err {
            VmError::Assembly { line, message, .. } => {
                assert_eq!(line, 2);
                assert_eq!(message, "bad operand for `nop`");
            }
            other => panic!("expected an assembly error, got {other:?}"),
        }
        let err = asm("call \"f\"").unwrap_err();
        assert!(matches!(err, VmError::Assembly { line: 1, .. }));
        let module = asm("res +inf\nanew 2\ncall\nret").unwrap();
        let ins = &module.tape.instructions;
        assert_eq!(ins[0].operand, Operand::Primitive(Primitive::Float(f64::INFINITY)));
        assert_eq!(ins[1].operand.as_int(), Some(2));
    }

    #[test]
    fn hook_identifiers_are_accepted() {
        assert!(is_identifier("$__set_super"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("$"));
    }
}
