use std::fmt;

use crate::analyzer::Analysis;
use crate::ast::{Ast, Func, NodeId, NodeKind, Span};
use crate::value::Value;

/// One machine instruction. Control flow carries an absolute code index;
/// loads, stores, blocks, and constants carry a table index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    Nop,
    True,
    False,
    Null,
    EmptyList,
    Prompt,
    Random,
    Call,
    Quit,
    Dump,
    Output,
    Length,
    Not,
    Negate,
    Ascii,
    Box,
    Head,
    Tail,
    Add,
    Sub,
    Mult,
    Div,
    Mod,
    Exp,
    Less,
    Greater,
    Equal,
    AndThen,
    OrThen,
    Drop,
    Dupe,
    Get,
    Set,
    Invalid,
    Jump(usize),
    Cond(usize),
    LoadVariable(u32),
    StoreVariable(u32),
    Block(u32),
    Constant(u32),
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Jump(pc) => write!(f, "Jump -> {pc}"),
            Instr::Cond(pc) => write!(f, "Cond -> {pc}"),
            Instr::LoadVariable(slot) => write!(f, "LoadVariable %{slot}"),
            Instr::StoreVariable(slot) => write!(f, "StoreVariable %{slot}"),
            Instr::Block(idx) => write!(f, "Block ${idx}"),
            Instr::Constant(idx) => write!(f, "Constant #{idx}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// An executable program: the main code, every compiled block body, the
/// constant pool, and how many variable slots to allocate.
#[derive(Debug)]
pub struct Program {
    pub code: Vec<Instr>,
    pub blocks: Vec<Vec<Instr>>,
    pub constants: Vec<Value>,
    pub variable_count: usize,
}

impl Program {
    /// Listing of the whole program for `--dump-bytecode`.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (i, constant) in self.constants.iter().enumerate() {
            let mut dumped = Vec::new();
            constant.dump(&mut dumped);
            out.push_str(&format!("const #{i} = {}\n", String::from_utf8_lossy(&dumped)));
        }
        Self::listing(&mut out, "main", &self.code);
        for (i, block) in self.blocks.iter().enumerate() {
            Self::listing(&mut out, &format!("block ${i}"), block);
        }
        out
    }

    fn listing(out: &mut String, label: &str, code: &[Instr]) {
        out.push_str(label);
        out.push_str(":\n");
        for (pc, instr) in code.iter().enumerate() {
            out.push_str(&format!("  {pc:4}  {instr}\n"));
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("`=` expects a variable name as its first argument")]
    InvalidStoreDestination { span: Span },
    #[error("integer literal `{text}` does not fit in 64 bits")]
    IntegerOverflow { text: String, span: Span },
}

type Result<T> = std::result::Result<T, EmitError>;

/// Lower the tree to bytecode.
pub fn emit(ast: &Ast, analysis: &Analysis) -> Result<Program> {
    let mut emitter = Emitter::new(ast, analysis);
    emitter.node(Ast::ROOT)?;
    Ok(Program {
        code: emitter.code,
        blocks: emitter.blocks,
        constants: emitter.constants,
        variable_count: analysis.count,
    })
}

struct Emitter<'a> {
    ast: &'a Ast,
    analysis: &'a Analysis,
    code: Vec<Instr>,
    constants: Vec<Value>,
    blocks: Vec<Vec<Instr>>,
}

impl<'a> Emitter<'a> {
    fn new(ast: &'a Ast, analysis: &'a Analysis) -> Self {
        Emitter {
            ast,
            analysis,
            code: Vec::new(),
            constants: Vec::new(),
            blocks: Vec::new(),
        }
    }

    fn push(&mut self, instr: Instr) -> usize {
        let pos = self.code.len();
        self.code.push(instr);
        pos
    }

    /// Intern a constant: identical literals share a pool entry. The
    /// machine deep-copies on every `Constant` push, so sharing is
    /// unobservable.
    fn constant(&mut self, value: Value) -> u32 {
        for (i, existing) in self.constants.iter().enumerate() {
            if *existing == value {
                return i as u32;
            }
        }
        let idx = self.constants.len() as u32;
        self.constants.push(value);
        idx
    }

    fn node(&mut self, id: NodeId) -> Result<()> {
        match self.ast.kind(id) {
            NodeKind::Integer => {
                let text = self.ast.text(id);
                let n: i64 = text.parse().map_err(|_| EmitError::IntegerOverflow {
                    text: text.to_string(),
                    span: self.ast.span(id),
                })?;
                let idx = self.constant(Value::Number(n));
                self.push(Instr::Constant(idx));
            }
            NodeKind::Text => {
                let idx = self.constant(Value::Text(self.ast.text(id).as_bytes().to_vec()));
                self.push(Instr::Constant(idx));
            }
            NodeKind::Identifier => {
                let slot = self.analysis.slot(self.ast.text(id));
                self.push(Instr::LoadVariable(slot));
            }
            NodeKind::Function(func) => self.function(id, func)?,
        }
        Ok(())
    }

    fn function(&mut self, id: NodeId, func: Func) -> Result<()> {
        let args = self.ast.children(id);
        match func {
            Func::True => {
                self.push(Instr::True);
            }
            Func::False => {
                self.push(Instr::False);
            }
            Func::Null => {
                self.push(Instr::Null);
            }
            Func::EmptyList => {
                self.push(Instr::EmptyList);
            }
            Func::Prompt => {
                self.push(Instr::Prompt);
            }
            Func::Random => {
                self.push(Instr::Random);
            }

            // `:` evaluates to its argument unchanged.
            Func::Noop => self.node(args[0])?,

            Func::Block => self.block(args[0])?,

            // `OUTPUT` applied directly to a bare variable has no defined
            // behaviour; it lowers to the lone `Invalid` instruction, which
            // the machine rejects when sanitizing and skips otherwise.
            Func::Output if self.ast.kind(args[0]) == NodeKind::Identifier => {
                self.push(Instr::Invalid);
            }

            Func::Not
            | Func::Negate
            | Func::Box
            | Func::Head
            | Func::Tail
            | Func::Ascii
            | Func::Call
            | Func::Dump
            | Func::Length
            | Func::Output
            | Func::Quit => {
                self.node(args[0])?;
                self.push(match func {
                    Func::Not => Instr::Not,
                    Func::Negate => Instr::Negate,
                    Func::Box => Instr::Box,
                    Func::Head => Instr::Head,
                    Func::Tail => Instr::Tail,
                    Func::Ascii => Instr::Ascii,
                    Func::Call => Instr::Call,
                    Func::Dump => Instr::Dump,
                    Func::Length => Instr::Length,
                    Func::Output => Instr::Output,
                    _ => Instr::Quit,
                });
            }

            Func::Add
            | Func::Sub
            | Func::Mul
            | Func::Div
            | Func::Mod
            | Func::Exp
            | Func::Less
            | Func::Greater
            | Func::Equal => {
                self.node(args[0])?;
                self.node(args[1])?;
                self.push(match func {
                    Func::Add => Instr::Add,
                    Func::Sub => Instr::Sub,
                    Func::Mul => Instr::Mult,
                    Func::Div => Instr::Div,
                    Func::Mod => Instr::Mod,
                    Func::Exp => Instr::Exp,
                    Func::Less => Instr::Less,
                    Func::Greater => Instr::Greater,
                    _ => Instr::Equal,
                });
            }

            Func::Then => {
                self.node(args[0])?;
                self.push(Instr::Drop);
                self.node(args[1])?;
            }

            Func::Assign => {
                if self.ast.kind(args[0]) != NodeKind::Identifier {
                    return Err(EmitError::InvalidStoreDestination {
                        span: self.ast.span(args[0]),
                    });
                }
                let slot = self.analysis.slot(self.ast.text(args[0]));
                self.node(args[1])?;
                // The stored value stays on the stack: assignment is an
                // expression.
                self.push(Instr::StoreVariable(slot));
            }

            // Short-circuit via dupe/cond/drop: the first operand's copy is
            // still on the stack when the jump skips the second operand.
            Func::And => {
                self.node(args[0])?;
                self.push(Instr::Dupe);
                let jump = self.push(Instr::Cond(0));
                self.push(Instr::Drop);
                self.node(args[1])?;
                self.code[jump] = Instr::Cond(self.code.len());
            }

            // Same pattern with the test inverted, so the jump fires when
            // the first operand is truthy.
            Func::Or => {
                self.node(args[0])?;
                self.push(Instr::Dupe);
                self.push(Instr::Not);
                let jump = self.push(Instr::Cond(0));
                self.push(Instr::Drop);
                self.node(args[1])?;
                self.code[jump] = Instr::Cond(self.code.len());
            }

            Func::While => {
                let top = self.code.len();
                self.node(args[0])?;
                let exit = self.push(Instr::Cond(0));
                self.node(args[1])?;
                self.push(Instr::Drop);
                self.push(Instr::Jump(top));
                self.code[exit] = Instr::Cond(self.code.len());
                // A loop's value is always null.
                self.push(Instr::Null);
            }

            Func::If => {
                self.node(args[0])?;
                let to_alternative = self.push(Instr::Cond(0));
                self.node(args[1])?;
                let to_end = self.push(Instr::Jump(0));
                self.code[to_alternative] = Instr::Cond(self.code.len());
                self.node(args[2])?;
                self.code[to_end] = Instr::Jump(self.code.len());
            }

            Func::Get => {
                self.node(args[0])?;
                self.node(args[1])?;
                self.node(args[2])?;
                self.push(Instr::Get);
            }

            Func::Set => {
                self.node(args[0])?;
                self.node(args[1])?;
                self.node(args[2])?;
                self.node(args[3])?;
                self.push(Instr::Set);
            }
        }
        Ok(())
    }

    /// `BLOCK` compiles its body with a fresh emitter instead of emitting
    /// into the current stream. The sub-program's constant and block
    /// indices are shifted by this emitter's pool sizes, its tables are
    /// appended onto ours, and its code becomes a new blocks entry.
    fn block(&mut self, body: NodeId) -> Result<()> {
        let mut inner = Emitter::new(self.ast, self.analysis);
        inner.node(body)?;

        let constant_base = self.constants.len() as u32;
        let block_base = self.blocks.len() as u32;
        let relocate = |instr: &Instr| match *instr {
            Instr::Constant(i) => Instr::Constant(i + constant_base),
            Instr::Block(i) => Instr::Block(i + block_base),
            other => other,
        };

        self.constants.extend(inner.constants);
        for block in &inner.blocks {
            self.blocks.push(block.iter().map(relocate).collect());
        }
        let idx = self.blocks.len() as u32;
        self.blocks.push(inner.code.iter().map(relocate).collect());
        self.push(Instr::Block(idx));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer;
    use crate::lexer;
    use crate::parser;

    fn emit_str(source: &str) -> Program {
        let tokens = lexer::lex(source).unwrap();
        let ast = parser::parse(source.to_string(), tokens).unwrap();
        let analysis = analyzer::analyze(&ast);
        emit(&ast, &analysis).unwrap()
    }

    fn emit_err(source: &str) -> EmitError {
        let tokens = lexer::lex(source).unwrap();
        let ast = parser::parse(source.to_string(), tokens).unwrap();
        let analysis = analyzer::analyze(&ast);
        emit(&ast, &analysis).unwrap_err()
    }

    #[test]
    fn literals_become_constants() {
        let program = emit_str(r#"+ 1 "hi""#);
        assert_eq!(
            program.code,
            vec![Instr::Constant(0), Instr::Constant(1), Instr::Add]
        );
        assert_eq!(program.constants[0], Value::Number(1));
        assert_eq!(program.constants[1], Value::Text(b"hi".to_vec()));
    }

    #[test]
    fn identical_constants_are_interned() {
        let program = emit_str("+ 7 7");
        assert_eq!(
            program.code,
            vec![Instr::Constant(0), Instr::Constant(0), Instr::Add]
        );
        assert_eq!(program.constants.len(), 1);
    }

    #[test]
    fn nullary_functions_are_single_opcodes() {
        assert_eq!(emit_str("TRUE").code, vec![Instr::True]);
        assert_eq!(emit_str("@").code, vec![Instr::EmptyList]);
        assert_eq!(emit_str("PROMPT").code, vec![Instr::Prompt]);
    }

    #[test]
    fn noop_emits_only_its_argument() {
        assert_eq!(emit_str(": 5").code, vec![Instr::Constant(0)]);
    }

    #[test]
    fn sequence_drops_intermediate_value() {
        let program = emit_str("; 1 2");
        assert_eq!(
            program.code,
            vec![
                Instr::Constant(0),
                Instr::Drop,
                Instr::Constant(1),
            ]
        );
    }

    #[test]
    fn assignment_stores_and_keeps_value() {
        let program = emit_str("= a 3");
        assert_eq!(
            program.code,
            vec![Instr::Constant(0), Instr::StoreVariable(0)]
        );
        assert_eq!(program.variable_count, 1);
    }

    #[test]
    fn assignment_to_non_identifier_is_rejected() {
        assert!(matches!(
            emit_err("= 1 2"),
            EmitError::InvalidStoreDestination { .. }
        ));
    }

    #[test]
    fn integer_literal_overflow_is_rejected() {
        assert!(matches!(
            emit_err("99999999999999999999"),
            EmitError::IntegerOverflow { .. }
        ));
    }

    #[test]
    fn and_uses_dupe_cond_drop() {
        let program = emit_str("& a b");
        assert_eq!(
            program.code,
            vec![
                Instr::LoadVariable(0),
                Instr::Dupe,
                Instr::Cond(5),
                Instr::Drop,
                Instr::LoadVariable(1),
            ]
        );
    }

    #[test]
    fn or_inverts_the_test() {
        let program = emit_str("| a b");
        assert_eq!(
            program.code,
            vec![
                Instr::LoadVariable(0),
                Instr::Dupe,
                Instr::Not,
                Instr::Cond(6),
                Instr::Drop,
                Instr::LoadVariable(1),
            ]
        );
    }

    #[test]
    fn if_branches_around_both_arms() {
        let program = emit_str("IF TRUE 1 2");
        assert_eq!(
            program.code,
            vec![
                Instr::True,
                Instr::Cond(4),
                Instr::Constant(0),
                Instr::Jump(5),
                Instr::Constant(1),
            ]
        );
    }

    #[test]
    fn while_loops_back_to_the_condition() {
        let program = emit_str("WHILE a b");
        assert_eq!(
            program.code,
            vec![
                Instr::LoadVariable(0),
                Instr::Cond(5),
                Instr::LoadVariable(1),
                Instr::Drop,
                Instr::Jump(0),
                Instr::Null,
            ]
        );
    }

    #[test]
    fn output_of_bare_variable_is_invalid() {
        assert_eq!(emit_str("OUTPUT a").code, vec![Instr::Invalid]);
        // Any other argument shape lowers normally.
        assert_eq!(
            emit_str("OUTPUT : a").code,
            vec![Instr::LoadVariable(0), Instr::Output]
        );
    }

    #[test]
    fn block_compiles_into_the_blocks_table() {
        let program = emit_str("BLOCK + 1 2");
        assert_eq!(program.code, vec![Instr::Block(0)]);
        assert_eq!(
            program.blocks[0],
            vec![Instr::Constant(0), Instr::Constant(1), Instr::Add]
        );
    }

    #[test]
    fn block_constants_are_relocated() {
        // Outer constant 9 occupies pool slot 0; the block body's constants
        // land after it and its references shift accordingly.
        let program = emit_str("; 9 BLOCK + 1 2");
        assert_eq!(program.constants[0], Value::Number(9));
        assert_eq!(
            program.blocks[0],
            vec![Instr::Constant(1), Instr::Constant(2), Instr::Add]
        );
    }

    #[test]
    fn nested_blocks_are_relocated() {
        let program = emit_str("BLOCK BLOCK 5");
        // The inner body is compiled first, so it sits at index 0 and the
        // outer body refers to it.
        assert_eq!(program.code, vec![Instr::Block(1)]);
        assert_eq!(program.blocks[1], vec![Instr::Block(0)]);
        assert_eq!(program.blocks[0], vec![Instr::Constant(0)]);
    }

    #[test]
    fn identical_source_emits_identical_bytecode() {
        let source = "; = i 0 WHILE < i 3 = i + i 1";
        let a = emit_str(source);
        let b = emit_str(source);
        assert_eq!(a.code, b.code);
        assert_eq!(a.constants, b.constants);
        assert_eq!(a.blocks, b.blocks);
    }

    #[test]
    fn disassembly_lists_constants_and_code() {
        let listing = emit_str("+ 1 2").disassemble();
        assert!(listing.contains("const #0 = 1"), "got:\n{listing}");
        assert!(listing.contains("main:"), "got:\n{listing}");
        assert!(listing.contains("Add"), "got:\n{listing}");
    }
}
