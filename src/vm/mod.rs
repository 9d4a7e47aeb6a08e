use std::io::{BufRead, Write};

use rand::rngs::ThreadRng;
use rand::Rng;

use crate::emitter::{Instr, Program};
use crate::value::{Mode, RuntimeError, Value};

type Result<T> = std::result::Result<T, RuntimeError>;

/// Run a program against the given sinks. `Ok(None)` means the program ran
/// to completion; `Ok(Some(code))` means `QUIT` fired with that exit code.
pub fn execute<O: Write, I: BufRead>(
    program: &Program,
    mode: Mode,
    output: O,
    input: I,
) -> Result<Option<u8>> {
    Vm::new(program, mode, output, input).execute()
}

/// The stack machine: a value stack, a flat variables array indexed by the
/// analyzer's slots, and the program's constant and block tables.
pub struct Vm<'a, O: Write, I: BufRead> {
    program: &'a Program,
    stack: Vec<Value>,
    variables: Vec<Value>,
    mode: Mode,
    output: O,
    input: I,
    rng: ThreadRng,
}

impl<'a, O: Write, I: BufRead> Vm<'a, O, I> {
    pub fn new(program: &'a Program, mode: Mode, output: O, input: I) -> Self {
        Vm {
            program,
            stack: Vec::with_capacity(64),
            variables: vec![Value::Null; program.variable_count],
            mode,
            output,
            input,
            rng: rand::thread_rng(),
        }
    }

    pub fn execute(&mut self) -> Result<Option<u8>> {
        let program = self.program;
        self.run(&program.code)
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    fn peek(&self) -> Result<&Value> {
        self.stack.last().ok_or(RuntimeError::StackUnderflow)
    }

    fn sanitizing(&self) -> bool {
        self.mode == Mode::Sanitize
    }

    /// The dispatch loop. `CALL` re-enters this on the block's code, so the
    /// host stack mirrors the program's call nesting and a `QUIT` unwinds
    /// through every frame as `Some(code)`.
    fn run(&mut self, code: &[Instr]) -> Result<Option<u8>> {
        let mut pc = 0usize;
        while pc < code.len() {
            match code[pc] {
                Instr::Nop => {}

                Instr::True => self.stack.push(Value::Bool(true)),
                Instr::False => self.stack.push(Value::Bool(false)),
                Instr::Null => self.stack.push(Value::Null),
                Instr::EmptyList => self.stack.push(Value::List(Vec::new())),

                Instr::Constant(idx) => {
                    self.stack.push(self.program.constants[idx as usize].clone());
                }
                Instr::Block(idx) => self.stack.push(Value::Block(idx as usize)),

                Instr::LoadVariable(slot) => {
                    self.stack.push(self.variables[slot as usize].clone());
                }
                Instr::StoreVariable(slot) => {
                    // Peek, not pop: the assigned value is the expression's
                    // value.
                    let top = self.peek()?.clone();
                    self.variables[slot as usize] = top;
                }

                Instr::Drop => {
                    self.pop()?;
                }
                Instr::Dupe => {
                    let top = self.peek()?.clone();
                    self.stack.push(top);
                }

                Instr::Jump(target) => {
                    pc = target;
                    continue;
                }
                Instr::Cond(target) => {
                    if !self.pop()?.to_bool() {
                        pc = target;
                        continue;
                    }
                }

                Instr::Not => {
                    let v = self.pop()?;
                    self.stack.push(Value::Bool(!v.to_bool()));
                }
                Instr::Negate => {
                    let n = self.pop()?.to_number(self.mode)?;
                    self.stack.push(Value::Number(n.wrapping_neg()));
                }
                Instr::Ascii => self.ascii()?,
                Instr::Box => {
                    let v = self.pop()?;
                    self.stack.push(Value::List(vec![v]));
                }
                Instr::Head => self.head()?,
                Instr::Tail => self.tail()?,
                Instr::Length => {
                    let v = self.pop()?;
                    self.stack.push(Value::Number(v.length()));
                }

                Instr::Add => self.add()?,
                Instr::Sub => self.sub()?,
                Instr::Mult => self.mult()?,
                Instr::Div => self.div()?,
                Instr::Mod => self.rem()?,
                Instr::Exp => self.exp()?,

                Instr::Less => {
                    let (a, b) = self.pop_pair()?;
                    let ordering = a.order(&b, self.mode)?;
                    self.stack.push(Value::Bool(ordering == std::cmp::Ordering::Less));
                }
                Instr::Greater => {
                    let (a, b) = self.pop_pair()?;
                    self.stack
                        .push(Value::Bool(a.order(&b, self.mode)? == std::cmp::Ordering::Greater));
                }
                Instr::Equal => {
                    let (a, b) = self.pop_pair()?;
                    self.stack.push(Value::Bool(a == b));
                }

                Instr::AndThen => {
                    let (a, b) = self.pop_pair()?;
                    self.stack.push(if a.to_bool() { b } else { a });
                }
                Instr::OrThen => {
                    let (a, b) = self.pop_pair()?;
                    self.stack.push(if a.to_bool() { a } else { b });
                }

                Instr::Prompt => self.prompt()?,
                Instr::Random => {
                    let n = self.rng.gen_range(0..i64::MAX);
                    self.stack.push(Value::Number(n));
                }
                Instr::Output => self.write_output()?,
                Instr::Dump => {
                    let mut buffer = Vec::new();
                    self.peek()?.dump(&mut buffer);
                    self.output.write_all(&buffer)?;
                    self.output.flush()?;
                }

                Instr::Quit => {
                    let n = self.pop()?.to_number(self.mode)?;
                    return Ok(Some(n.rem_euclid(256) as u8));
                }

                Instr::Call => {
                    if let Some(exit) = self.call()? {
                        return Ok(Some(exit));
                    }
                }

                Instr::Get => self.get()?,
                Instr::Set => self.set()?,

                // No defined behaviour: reject when sanitizing, skip
                // otherwise.
                Instr::Invalid => {
                    if self.sanitizing() {
                        return Err(RuntimeError::InvalidOpcode);
                    }
                }
            }
            pc += 1;
        }
        Ok(None)
    }

    /// Pop two operands pushed left-to-right: the right one is on top.
    fn pop_pair(&mut self) -> Result<(Value, Value)> {
        let b = self.pop()?;
        let a = self.pop()?;
        Ok((a, b))
    }

    fn ascii(&mut self) -> Result<()> {
        let v = self.pop()?;
        let result = match &v {
            Value::Number(n) => Value::Text(vec![n.rem_euclid(256) as u8]),
            Value::Text(bytes) if !bytes.is_empty() => Value::Number(bytes[0] as i64),
            _ => {
                if self.sanitizing() {
                    return Err(RuntimeError::BadAscii);
                }
                Value::Null
            }
        };
        self.stack.push(result);
        Ok(())
    }

    fn head(&mut self) -> Result<()> {
        let v = self.pop()?;
        let result = match v {
            Value::Text(bytes) if !bytes.is_empty() => Value::Text(vec![bytes[0]]),
            Value::List(items) if !items.is_empty() => {
                items.into_iter().next().unwrap_or(Value::Null)
            }
            other => {
                if self.sanitizing() {
                    return Err(RuntimeError::BadHead(other.type_name()));
                }
                Value::Null
            }
        };
        self.stack.push(result);
        Ok(())
    }

    fn tail(&mut self) -> Result<()> {
        let v = self.pop()?;
        let result = match v {
            Value::Text(bytes) if !bytes.is_empty() => Value::Text(bytes[1..].to_vec()),
            Value::List(items) if !items.is_empty() => {
                Value::List(items.into_iter().skip(1).collect())
            }
            other => {
                if self.sanitizing() {
                    return Err(RuntimeError::BadTail(other.type_name()));
                }
                Value::Null
            }
        };
        self.stack.push(result);
        Ok(())
    }

    /// `+` dispatches on the left operand: numeric addition, string
    /// concatenation, or list concatenation.
    fn add(&mut self) -> Result<()> {
        let (a, b) = self.pop_pair()?;
        let result = match a {
            Value::Number(x) => Value::Number(x.wrapping_add(b.to_number(self.mode)?)),
            Value::Text(mut bytes) => {
                bytes.extend_from_slice(&b.to_text(self.mode)?);
                Value::Text(bytes)
            }
            Value::List(mut items) => {
                items.extend(b.to_list(self.mode)?);
                Value::List(items)
            }
            other => {
                if self.sanitizing() {
                    return Err(RuntimeError::BadAdd(other.type_name()));
                }
                Value::Number(other.to_number(self.mode)?.wrapping_add(b.to_number(self.mode)?))
            }
        };
        self.stack.push(result);
        Ok(())
    }

    fn sub(&mut self) -> Result<()> {
        let (a, b) = self.pop_pair()?;
        let result = match a {
            Value::Number(x) => Value::Number(x.wrapping_sub(b.to_number(self.mode)?)),
            other => {
                if self.sanitizing() {
                    return Err(RuntimeError::BadSub(other.type_name()));
                }
                Value::Number(other.to_number(self.mode)?.wrapping_sub(b.to_number(self.mode)?))
            }
        };
        self.stack.push(result);
        Ok(())
    }

    fn mult(&mut self) -> Result<()> {
        let (a, b) = self.pop_pair()?;
        let result = match a {
            Value::Number(x) => Value::Number(x.wrapping_mul(b.to_number(self.mode)?)),
            Value::Text(bytes) => {
                let count = self.repeat_count(&b)?;
                Value::Text(bytes.repeat(count))
            }
            Value::List(items) => {
                let count = self.repeat_count(&b)?;
                let mut repeated = Vec::with_capacity(items.len() * count);
                for _ in 0..count {
                    repeated.extend(items.iter().cloned());
                }
                Value::List(repeated)
            }
            other => {
                if self.sanitizing() {
                    return Err(RuntimeError::BadMult(other.type_name()));
                }
                Value::Number(other.to_number(self.mode)?.wrapping_mul(b.to_number(self.mode)?))
            }
        };
        self.stack.push(result);
        Ok(())
    }

    fn repeat_count(&self, v: &Value) -> Result<usize> {
        let n = v.to_number(self.mode)?;
        if n < 0 {
            if self.sanitizing() {
                return Err(RuntimeError::BadMult("a negative count"));
            }
            return Ok(0);
        }
        Ok(n as usize)
    }

    /// Truncated toward zero; a zero divisor fails in both modes.
    fn div(&mut self) -> Result<()> {
        let (a, b) = self.pop_pair()?;
        let x = match a {
            Value::Number(x) => x,
            other => {
                if self.sanitizing() {
                    return Err(RuntimeError::BadDiv(other.type_name()));
                }
                other.to_number(self.mode)?
            }
        };
        let y = b.to_number(self.mode)?;
        if y == 0 {
            return Err(RuntimeError::DivisionByZero);
        }
        self.stack.push(Value::Number(x.wrapping_div(y)));
        Ok(())
    }

    /// Operands must be non-negative; a zero divisor fails in both modes.
    fn rem(&mut self) -> Result<()> {
        let (a, b) = self.pop_pair()?;
        let x = match a {
            Value::Number(x) => x,
            other => {
                if self.sanitizing() {
                    return Err(RuntimeError::BadMod(other.type_name()));
                }
                other.to_number(self.mode)?
            }
        };
        let y = b.to_number(self.mode)?;
        if y == 0 {
            return Err(RuntimeError::DivisionByZero);
        }
        if (x < 0 || y < 0) && self.sanitizing() {
            return Err(RuntimeError::BadMod("negative numbers"));
        }
        self.stack.push(Value::Number(x.wrapping_rem(y)));
        Ok(())
    }

    /// `^` raises a number, or joins a list's elements with a separator.
    fn exp(&mut self) -> Result<()> {
        let (a, b) = self.pop_pair()?;
        let result = match a {
            Value::Number(base) => Value::Number(self.power(base, &b)?),
            Value::List(items) => {
                let separator = b.to_text(self.mode)?;
                let mut joined = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        joined.extend_from_slice(&separator);
                    }
                    joined.extend_from_slice(&item.to_text(self.mode)?);
                }
                Value::Text(joined)
            }
            other => {
                if self.sanitizing() {
                    return Err(RuntimeError::BadExp(other.type_name()));
                }
                Value::Number(self.power(other.to_number(self.mode)?, &b)?)
            }
        };
        self.stack.push(result);
        Ok(())
    }

    /// Integer power. Overflow yields 0; a negative exponent fails when
    /// sanitizing and yields 0 otherwise.
    fn power(&self, base: i64, exponent: &Value) -> Result<i64> {
        let exp = exponent.to_number(self.mode)?;
        if exp < 0 {
            if self.sanitizing() {
                return Err(RuntimeError::BadExp("a negative exponent"));
            }
            return Ok(0);
        }
        if exp == 0 {
            return Ok(1);
        }
        Ok(match base {
            0 => 0,
            1 => 1,
            -1 => {
                if exp % 2 == 0 {
                    1
                } else {
                    -1
                }
            }
            _ => {
                let exp = u32::try_from(exp).unwrap_or(u32::MAX);
                base.checked_pow(exp).unwrap_or(0)
            }
        })
    }

    /// Read one line. An empty read at end of input is null; otherwise the
    /// newline and every trailing carriage return are stripped.
    fn prompt(&mut self) -> Result<()> {
        let mut line = Vec::new();
        let read = self.input.read_until(b'\n', &mut line)?;
        if read == 0 {
            self.stack.push(Value::Null);
            return Ok(());
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        while line.last() == Some(&b'\r') {
            line.pop();
        }
        self.stack.push(Value::Text(line));
        Ok(())
    }

    /// A trailing backslash suppresses itself and the newline.
    fn write_output(&mut self) -> Result<()> {
        let v = self.pop()?;
        let text = v.to_text(self.mode)?;
        if text.last() == Some(&b'\\') {
            self.output.write_all(&text[..text.len() - 1])?;
        } else {
            self.output.write_all(&text)?;
            self.output.write_all(b"\n")?;
        }
        self.output.flush()?;
        self.stack.push(Value::Null);
        Ok(())
    }

    fn call(&mut self) -> Result<Option<u8>> {
        let v = self.pop()?;
        match v {
            Value::Block(idx) => {
                let program = self.program;
                let block = program
                    .blocks
                    .get(idx)
                    .ok_or(RuntimeError::BadCall("an unknown block"))?;
                self.run(block)
            }
            other => {
                if self.sanitizing() {
                    return Err(RuntimeError::BadCall(other.type_name()));
                }
                // Calling a plain value yields the value.
                self.stack.push(other);
                Ok(None)
            }
        }
    }

    /// `GET collection index length` slices a string or list. The indices
    /// are structural: out-of-range fails in both modes.
    fn get(&mut self) -> Result<()> {
        let length = self.pop()?;
        let index = self.pop()?;
        let collection = self.pop()?;
        let result = match collection {
            Value::Text(bytes) => {
                let (start, end) =
                    self.range(&index, &length, bytes.len(), RuntimeError::BadGet)?;
                Value::Text(bytes[start..end].to_vec())
            }
            Value::List(items) => {
                let (start, end) =
                    self.range(&index, &length, items.len(), RuntimeError::BadGet)?;
                Value::List(items[start..end].to_vec())
            }
            other => {
                if self.sanitizing() {
                    return Err(RuntimeError::BadGet(other.type_name()));
                }
                let items = other.to_list(self.mode)?;
                let (start, end) =
                    self.range(&index, &length, items.len(), RuntimeError::BadGet)?;
                Value::List(items[start..end].to_vec())
            }
        };
        self.stack.push(result);
        Ok(())
    }

    /// `SET collection index length replacement` splices the replacement
    /// over the selected range, coercing it to the collection's kind.
    fn set(&mut self) -> Result<()> {
        let replacement = self.pop()?;
        let length = self.pop()?;
        let index = self.pop()?;
        let collection = self.pop()?;
        let result = match collection {
            Value::Text(bytes) => {
                let (start, end) =
                    self.range(&index, &length, bytes.len(), RuntimeError::BadSet)?;
                let mut spliced = bytes[..start].to_vec();
                spliced.extend_from_slice(&replacement.to_text(self.mode)?);
                spliced.extend_from_slice(&bytes[end..]);
                Value::Text(spliced)
            }
            Value::List(items) => {
                let (start, end) =
                    self.range(&index, &length, items.len(), RuntimeError::BadSet)?;
                let mut spliced = items[..start].to_vec();
                spliced.extend(replacement.to_list(self.mode)?);
                spliced.extend_from_slice(&items[end..]);
                Value::List(spliced)
            }
            other => {
                if self.sanitizing() {
                    return Err(RuntimeError::BadSet(other.type_name()));
                }
                let items = other.to_list(self.mode)?;
                let (start, end) =
                    self.range(&index, &length, items.len(), RuntimeError::BadSet)?;
                let mut spliced = items[..start].to_vec();
                spliced.extend(replacement.to_list(self.mode)?);
                spliced.extend_from_slice(&items[end..]);
                Value::List(spliced)
            }
        };
        self.stack.push(result);
        Ok(())
    }

    /// Coerce an index and length to a validated `start..end` range.
    fn range(
        &self,
        index: &Value,
        length: &Value,
        len: usize,
        misuse: fn(&'static str) -> RuntimeError,
    ) -> Result<(usize, usize)> {
        let start = index.to_number(self.mode)?;
        let span = length.to_number(self.mode)?;
        if start < 0 || span < 0 {
            return Err(misuse("a negative index"));
        }
        let start = start as usize;
        let end = start + span as usize;
        if end > len {
            return Err(RuntimeError::OutOfRange { start, end, len });
        }
        Ok((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer;
    use crate::lexer;
    use crate::parser;

    fn compile(source: &str) -> Program {
        let tokens = lexer::lex(source).unwrap();
        let ast = parser::parse(source.to_string(), tokens).unwrap();
        let analysis = analyzer::analyze(&ast);
        crate::emitter::emit(&ast, &analysis).unwrap()
    }

    fn run_with(source: &str, mode: Mode, input: &[u8]) -> (Vec<u8>, Option<u8>) {
        let program = compile(source);
        let mut output = Vec::new();
        let exit = execute(&program, mode, &mut output, input).unwrap();
        (output, exit)
    }

    fn run(source: &str) -> (Vec<u8>, Option<u8>) {
        run_with(source, Mode::Sanitize, b"")
    }

    fn run_err(source: &str) -> RuntimeError {
        let program = compile(source);
        let mut output = Vec::new();
        execute(&program, Mode::Sanitize, &mut output, &b""[..]).unwrap_err()
    }

    #[test]
    fn dump_zero() {
        let (out, exit) = run("D 0");
        assert_eq!(out, b"0");
        assert_eq!(exit, None);
    }

    #[test]
    fn assignment_is_an_expression() {
        let (out, _) = run("D ; = a 3 : a");
        assert_eq!(out, b"3");
        let (out, _) = run("D = a 3");
        assert_eq!(out, b"3");
    }

    #[test]
    fn quit_returns_exit_code() {
        let (out, exit) = run("QUIT 42");
        assert_eq!(out, b"");
        assert_eq!(exit, Some(42));
    }

    #[test]
    fn quit_wraps_to_a_byte() {
        assert_eq!(run("QUIT 300").1, Some(44));
        assert_eq!(run("QUIT ~1").1, Some(255));
    }

    #[test]
    fn output_appends_newline() {
        let (out, _) = run(r#"OUTPUT "hi""#);
        assert_eq!(out, b"hi\n");
    }

    #[test]
    fn output_trailing_backslash_suppresses_newline() {
        let (out, _) = run(r#"OUTPUT "hello\""#);
        assert_eq!(out, b"hello");
    }

    #[test]
    fn while_sums_and_yields_null() {
        let (out, _) = run("; = i 0 ; = sum 0 ; WHILE < i 10 ; = sum + sum i = i + i 1 D sum");
        assert_eq!(out, b"45");
        let (out, _) = run("D WHILE FALSE 1");
        assert_eq!(out, b"null");
    }

    #[test]
    fn if_evaluates_exactly_one_arm() {
        let (out, _) = run(r#"; IF TRUE OUTPUT "yes" OUTPUT "no" D 1"#);
        assert_eq!(out, b"yes\n1");
        let (out, _) = run(r#"; IF FALSE OUTPUT "yes" OUTPUT "no" D 1"#);
        assert_eq!(out, b"no\n1");
    }

    #[test]
    fn and_short_circuits() {
        // The falsy left operand is the result and the output never runs.
        let (out, _) = run(r#"D & 0 OUTPUT "ran""#);
        assert_eq!(out, b"0");
        let (out, _) = run("D & 1 2");
        assert_eq!(out, b"2");
    }

    #[test]
    fn or_short_circuits() {
        let (out, _) = run(r#"D | 1 OUTPUT "ran""#);
        assert_eq!(out, b"1");
        let (out, _) = run("D | 0 2");
        assert_eq!(out, b"2");
    }

    #[test]
    fn blocks_defer_and_call_runs_them() {
        let (out, _) = run("; = blk BLOCK OUTPUT \"ran\" ; D 1 : CALL blk");
        // Nothing printed until CALL.
        assert_eq!(out, b"1ran\n");
    }

    #[test]
    fn blocks_see_the_global_scope() {
        let source = "D ; = a 1 ; = b 2 ; = blk BLOCK ; = a 5 ; = c 6 ; = e 7 ; = f 8 \
                      : + + + + , a , b , c , d , e ; = c 3 ; = d 4 : + CALL blk , f";
        let (out, _) = run(source);
        assert_eq!(out, b"[5, 2, 6, 4, 7, 8]");
    }

    #[test]
    fn quit_propagates_through_call() {
        let (out, exit) = run("; = blk BLOCK QUIT 7 ; CALL blk D \"unreached\"");
        assert_eq!(out, b"");
        assert_eq!(exit, Some(7));
    }

    #[test]
    fn prompt_reads_lines_and_strips_trailing_cr() {
        let (out, _) = run_with("D PROMPT", Mode::Sanitize, b"foo\r\r\r\n");
        assert_eq!(out, b"\"foo\"");
        let (out, _) = run_with("D PROMPT", Mode::Sanitize, b"a\rb\r\n");
        assert_eq!(out, b"\"a\\rb\"");
    }

    #[test]
    fn prompt_at_end_of_input_is_null() {
        let (out, _) = run_with("D PROMPT", Mode::Sanitize, b"");
        assert_eq!(out, b"null");
        // A line without a final newline still reads as text.
        let (out, _) = run_with("D PROMPT", Mode::Sanitize, b"last");
        assert_eq!(out, b"\"last\"");
    }

    #[test]
    fn string_concatenation_copies_buffers() {
        let (out, _) = run(r#"; = a + "" 12 ; = b + "" 34 : D + a b"#);
        assert_eq!(out, b"\"1234\"");
    }

    #[test]
    fn arithmetic_dispatches_on_left_operand() {
        assert_eq!(run("D + 1 \"2\"").0, b"3");
        assert_eq!(run(r#"D + "1" 2"#).0, b"\"12\"");
        assert_eq!(run("D + , 1 2").0, b"[1, 2]");
        assert_eq!(run("D * \"ab\" 3").0, b"\"ababab\"");
        assert_eq!(run("D * , 0 2").0, b"[0, 0]");
        assert_eq!(run("D - 10 \"4\"").0, b"6");
    }

    #[test]
    fn division_truncates_toward_zero() {
        assert_eq!(run("D / 7 2").0, b"3");
        assert_eq!(run("D / ~7 2").0, b"-3");
        assert!(matches!(run_err("D / 1 0"), RuntimeError::DivisionByZero));
    }

    #[test]
    fn remainder_requires_non_negative_operands() {
        assert_eq!(run("D % 7 3").0, b"1");
        assert!(matches!(run_err("D % ~7 3"), RuntimeError::BadMod(_)));
        assert!(matches!(run_err("D % 7 0"), RuntimeError::DivisionByZero));
    }

    #[test]
    fn exponentiation_and_join() {
        assert_eq!(run("D ^ 2 10").0, b"1024");
        assert_eq!(run("D ^ 0 0").0, b"1");
        // Overflow collapses to zero.
        assert_eq!(run("D ^ 10 40").0, b"0");
        assert_eq!(run(r#"D ^ + , 1 , 2 "-""#).0, b"\"1-2\"");
        assert_eq!(run(r#"D ^ @ "-""#).0, b"\"\"");
    }

    #[test]
    fn comparisons_use_left_operand_rules() {
        assert_eq!(run("D < 5 \"10\"").0, b"true");
        assert_eq!(run(r#"D < "5" 10"#).0, b"false");
        assert_eq!(run("D > , 2 , 1").0, b"true");
    }

    #[test]
    fn equality_is_strict() {
        assert_eq!(run("D ? 1 \"1\"").0, b"false");
        assert_eq!(run("D ? 1 1").0, b"true");
        assert_eq!(run("D ? NULL FALSE").0, b"false");
        assert_eq!(run("D ? , 1 , 1").0, b"true");
    }

    #[test]
    fn ascii_converts_both_ways() {
        assert_eq!(run("D ASCII 72").0, b"\"H\"");
        assert_eq!(run(r#"D ASCII "HI""#).0, b"72");
        assert!(matches!(run_err("D ASCII TRUE"), RuntimeError::BadAscii));
        assert!(matches!(run_err(r#"D ASCII """#), RuntimeError::BadAscii));
    }

    #[test]
    fn head_and_tail() {
        assert_eq!(run(r#"D [ "abc""#).0, b"\"a\"");
        assert_eq!(run(r#"D ] "abc""#).0, b"\"bc\"");
        assert_eq!(run("D [ + , 1 , 2").0, b"1");
        assert_eq!(run("D ] + , 1 , 2").0, b"[2]");
        assert!(matches!(run_err(r#"D [ """#), RuntimeError::BadHead(_)));
        assert!(matches!(run_err("D ] @"), RuntimeError::BadTail(_)));
    }

    #[test]
    fn length_counts() {
        assert_eq!(run(r#"D LENGTH "hello""#).0, b"5");
        assert_eq!(run("D LENGTH + , 1 , 2").0, b"2");
        assert_eq!(run("D LENGTH 12345").0, b"5");
        assert_eq!(run("D LENGTH ~100").0, b"3");
        assert_eq!(run("D LENGTH NULL").0, b"0");
    }

    #[test]
    fn get_slices_strings_and_lists() {
        assert_eq!(run(r#"D GET "abcd" 1 2"#).0, b"\"bc\"");
        assert_eq!(run(r#"D GET "abcd" 0 0"#).0, b"\"\"");
        assert_eq!(run("D GET + + , 1 , 2 , 3 1 2").0, b"[2, 3]");
        assert!(matches!(
            run_err(r#"D GET "ab" 1 5"#),
            RuntimeError::OutOfRange { .. }
        ));
    }

    #[test]
    fn set_splices_with_coercion() {
        assert_eq!(run(r#"D SET "abcd" 1 2 "xyz""#).0, b"\"axyzd\"");
        assert_eq!(run(r#"D SET "abcd" 1 2 """#).0, b"\"ad\"");
        assert_eq!(run("D SET + , 1 , 2 0 1 , 9").0, b"[9, 2]");
        assert!(matches!(
            run_err(r#"D SET "ab" 3 1 "x""#),
            RuntimeError::OutOfRange { .. }
        ));
    }

    #[test]
    fn negate_and_not() {
        assert_eq!(run("D ~ 5").0, b"-5");
        assert_eq!(run("D ~ \"12x\"").0, b"-12");
        assert_eq!(run("D ! TRUE").0, b"false");
        assert_eq!(run("D ! \"\"").0, b"true");
    }

    #[test]
    fn box_wraps_a_single_value() {
        assert_eq!(run("D , NULL").0, b"[null]");
    }

    #[test]
    fn random_is_non_negative() {
        let program = compile("QUIT % RANDOM 100");
        let mut output = Vec::new();
        let exit = execute(&program, Mode::Sanitize, &mut output, &b""[..]).unwrap();
        assert!(matches!(exit, Some(code) if code < 100));
    }

    #[test]
    fn calling_a_non_block_fails_when_sanitizing() {
        assert!(matches!(run_err("CALL 3"), RuntimeError::BadCall(_)));
        let (out, _) = run_with("D CALL 3", Mode::Lenient, b"");
        assert_eq!(out, b"3");
    }

    #[test]
    fn block_arithmetic_fails_when_sanitizing() {
        assert!(matches!(
            run_err("+ 1 BLOCK 2"),
            RuntimeError::BlockNotAllowed
        ));
        let (out, _) = run_with("D + 1 BLOCK 2", Mode::Lenient, b"");
        assert_eq!(out, b"1");
    }

    #[test]
    fn invalid_instruction_by_mode() {
        assert!(matches!(
            run_err("; = a 1 OUTPUT a"),
            RuntimeError::InvalidOpcode
        ));
        let (out, exit) = run_with("; = a 1 OUTPUT a", Mode::Lenient, b"");
        assert_eq!(out, b"");
        assert_eq!(exit, None);
    }

    #[test]
    fn lenient_type_misuse_falls_back() {
        assert_eq!(run_with("D - TRUE 1", Mode::Lenient, b"").0, b"0");
        assert_eq!(run_with("D [ 5", Mode::Lenient, b"").0, b"null");
    }

    #[test]
    fn dump_peeks_without_popping() {
        // Both dumps see their own operand; the sequence drops the first.
        let (out, _) = run("; D 1 D 2");
        assert_eq!(out, b"12");
    }

    #[test]
    fn hand_assembled_then_opcodes() {
        // AndThen and OrThen aren't produced by the short-circuit lowering,
        // but the machine still implements them for hand-built programs.
        let program = Program {
            code: vec![
                Instr::Nop,
                Instr::Constant(0),
                Instr::Constant(1),
                Instr::AndThen,
                Instr::Constant(1),
                Instr::OrThen,
                Instr::Dump,
            ],
            blocks: Vec::new(),
            constants: vec![Value::Number(0), Value::Number(5)],
            variable_count: 0,
        };
        let mut output = Vec::new();
        let exit = execute(&program, Mode::Sanitize, &mut output, &b""[..]).unwrap();
        // AndThen keeps the falsy 0; OrThen on that 0 takes the other side.
        assert_eq!(output, b"5");
        assert_eq!(exit, None);
    }

    #[test]
    fn nested_calls_share_globals() {
        let source = "; = inner BLOCK = x + x 1 ; = outer BLOCK ; CALL inner CALL inner \
                      ; = x 0 ; CALL outer D x";
        let (out, _) = run(source);
        assert_eq!(out, b"2");
    }
}
