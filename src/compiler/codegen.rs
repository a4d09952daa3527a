//! The single-pass compiler: parses and emits bytecode in one traversal,
//! with no AST in between.
//!
//! Expressions go through a Pratt table mapping each token kind to its
//! prefix rule, infix rule, and precedence. Scope resolution happens on the
//! fly: a name is a local of the current function, an upvalue captured from
//! an enclosing one, or a global, in that order. Nested functions get their
//! own compiler context; contexts form a stack linked through `enclosing`.

use super::lexer::TokenKind;
use super::parser::Parser;
use crate::vm::{Heap, Obj, ObjFunction, ObjRef, OpCode, Value};

/// Locals and upvalues are indexed with 15 bits; the 16th is the
/// local/upvalue flag in closure descriptors.
pub const MAX_LOCALS: usize = 32767;
pub const MAX_UPVALUES: usize = 32767;
/// Pending `break` jumps a single loop can hold.
const MAX_BREAKS: usize = 64;

/// Compilation failed; the errors were already reported to stderr.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub errors: usize,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "compilation failed with {} error(s)", self.errors)
    }
}

impl std::error::Error for CompileError {}

/// What kind of function a compiler context is building.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
    Anonymous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

impl<'src, 'h> ParseRule<'src, 'h> {
    fn new(
        prefix: Option<ParseFn<'src, 'h>>,
        infix: Option<ParseFn<'src, 'h>>,
        precedence: Precedence,
    ) -> ParseRule<'src, 'h> {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    fn none() -> ParseRule<'src, 'h> {
        ParseRule::new(None, None, Precedence::None)
    }
}

/// The Pratt table.
fn rule<'src, 'h>(kind: TokenKind) -> ParseRule<'src, 'h> {
    use TokenKind::*;
    match kind {
        LeftParen => ParseRule::new(
            Some(Compiler::grouping),
            Some(Compiler::call),
            Precedence::Call,
        ),
        Dot => ParseRule::new(None, Some(Compiler::dot), Precedence::Call),
        Minus => ParseRule::new(
            Some(Compiler::unary),
            Some(Compiler::binary),
            Precedence::Term,
        ),
        Plus => ParseRule::new(
            Some(Compiler::unary),
            Some(Compiler::binary),
            Precedence::Term,
        ),
        Slash | Star => ParseRule::new(None, Some(Compiler::binary), Precedence::Factor),
        Bang => ParseRule::new(Some(Compiler::unary), None, Precedence::None),
        BangEqual | EqualEqual => {
            ParseRule::new(None, Some(Compiler::binary), Precedence::Equality)
        }
        Greater | GreaterEqual | Less | LessEqual => {
            ParseRule::new(None, Some(Compiler::binary), Precedence::Comparison)
        }
        Identifier => ParseRule::new(Some(Compiler::variable), None, Precedence::None),
        String => ParseRule::new(Some(Compiler::string), None, Precedence::None),
        Number => ParseRule::new(Some(Compiler::number), None, Precedence::None),
        And => ParseRule::new(None, Some(Compiler::and_), Precedence::And),
        Or => ParseRule::new(None, Some(Compiler::or_), Precedence::Or),
        Nil | True | False => ParseRule::new(Some(Compiler::literal), None, Precedence::None),
        Fun => ParseRule::new(Some(Compiler::fun_expression), None, Precedence::None),
        This => ParseRule::new(Some(Compiler::this_), None, Precedence::None),
        Super => ParseRule::new(Some(Compiler::super_), None, Precedence::None),
        _ => ParseRule::none(),
    }
}

/// A local variable slot. `depth` is -1 between declaration and the end of
/// its initializer, which is what makes `var a = a;` an error.
#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

/// One upvalue of the function being compiled: where it comes from in the
/// enclosing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u16,
    is_local: bool,
}

/// An enclosing loop, for `break`/`continue`.
#[derive(Debug)]
struct LoopCtx {
    start: usize,
    scope_depth: i32,
    breaks: Vec<usize>,
}

/// Per-function compiler state; contexts stack up through `enclosing` while
/// nested functions compile.
struct FnCtx<'src> {
    enclosing: Option<Box<FnCtx<'src>>>,
    function: ObjFunction,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
}

impl<'src> FnCtx<'src> {
    fn new(kind: FunctionKind, name: Option<crate::vm::StrRef>) -> FnCtx<'src> {
        // Slot 0 belongs to the callee; methods see it as `this`.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        FnCtx {
            enclosing: None,
            function: ObjFunction::new(name),
            kind,
            locals: vec![Local {
                name: slot_zero,
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

/// Innermost class being compiled, for `this`/`super` legality.
struct ClassCtx {
    enclosing: Option<Box<ClassCtx>>,
    has_superclass: bool,
}

fn resolve_local(ctx: &FnCtx, name: &str) -> Result<Option<usize>, &'static str> {
    for (i, local) in ctx.locals.iter().enumerate().rev() {
        if local.name == name {
            if local.depth == -1 {
                return Err("Can't read local variable in its own initializer.");
            }
            return Ok(Some(i));
        }
    }
    Ok(None)
}

fn add_upvalue(ctx: &mut FnCtx, index: u16, is_local: bool) -> Result<u16, &'static str> {
    for (i, upvalue) in ctx.upvalues.iter().enumerate() {
        if upvalue.index == index && upvalue.is_local == is_local {
            return Ok(i as u16);
        }
    }
    if ctx.upvalues.len() >= MAX_UPVALUES {
        return Err("Too many closure variables in function.");
    }
    ctx.upvalues.push(UpvalueDesc { index, is_local });
    Ok((ctx.upvalues.len() - 1) as u16)
}

/// Resolve `name` as a capture from an enclosing context. Marking the source
/// local as captured happens before descriptor dedup, so a repeated capture
/// can never un-set the flag.
fn resolve_upvalue(ctx: &mut FnCtx, name: &str) -> Result<Option<u16>, &'static str> {
    let captured = {
        let Some(enclosing) = ctx.enclosing.as_deref_mut() else {
            return Ok(None);
        };
        if let Some(slot) = resolve_local(enclosing, name)? {
            enclosing.locals[slot].is_captured = true;
            Some((slot as u16, true))
        } else if let Some(index) = resolve_upvalue(enclosing, name)? {
            Some((index, false))
        } else {
            None
        }
    };

    match captured {
        Some((index, is_local)) => add_upvalue(ctx, index, is_local).map(Some),
        None => Ok(None),
    }
}

pub struct Compiler<'src, 'h> {
    parser: Parser<'src>,
    heap: &'h mut Heap,
    ctx: Box<FnCtx<'src>>,
    class_ctx: Option<Box<ClassCtx>>,
}

/// Compile `source` into a top-level script function. Errors have been
/// reported to stderr; the returned function lives on `heap`.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, CompileError> {
    let mut compiler = Compiler::new(source, heap);
    while !compiler.parser.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.finish()
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Compiler<'src, 'h> {
        Compiler {
            parser: Parser::new(source),
            heap,
            ctx: Box::new(FnCtx::new(FunctionKind::Script, None)),
            class_ctx: None,
        }
    }

    fn finish(mut self) -> Result<ObjRef, CompileError> {
        if self.ctx.function.chunk.last_op() != Some(OpCode::Return) {
            self.emit_return();
        }
        if self.parser.had_error() {
            return Err(CompileError {
                errors: self.parser.error_count(),
            });
        }
        let function = std::mem::replace(&mut self.ctx.function, ObjFunction::new(None));
        Ok(self.heap.alloc(Obj::Function(function)))
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    fn emit_op(&mut self, op: OpCode) {
        let line = self.parser.previous.line;
        self.ctx.function.chunk.write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.parser.previous.line;
        self.ctx.function.chunk.write(byte, line);
    }

    fn emit_indexed(&mut self, base: OpCode, index: usize) {
        let line = self.parser.previous.line;
        self.ctx
            .function
            .chunk
            .write_variable_length_op(base, index, line);
    }

    fn emit_return(&mut self) {
        if self.ctx.kind == FunctionKind::Initializer {
            self.emit_indexed(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> usize {
        match self.ctx.function.chunk.add_constant(value) {
            Some(index) => index,
            None => {
                self.parser.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_indexed(OpCode::Constant, index);
    }

    fn identifier_constant(&mut self, name: &str) -> usize {
        let interned = self.heap.intern(name);
        self.make_constant(Value::obj(interned.obj))
    }

    /// Emit a jump with a placeholder displacement; returns the offset of
    /// the placeholder for `patch_jump`.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xFF);
        self.emit_byte(0xFF);
        self.ctx.function.chunk.len() - 2
    }

    /// Point the jump at `offset` to the current end of the chunk.
    fn patch_jump(&mut self, offset: usize) {
        let jump = self.ctx.function.chunk.len() - offset - 2;
        if jump > i16::MAX as usize {
            self.parser.error("Too much code to jump over.");
            return;
        }
        let bytes = (jump as i16).to_le_bytes();
        self.ctx.function.chunk.code[offset] = bytes[0];
        self.ctx.function.chunk.code[offset + 1] = bytes[1];
    }

    /// Emit a backward jump to `loop_start`.
    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Jump);
        let displacement = loop_start as isize - (self.ctx.function.chunk.len() as isize + 2);
        if displacement < i16::MIN as isize {
            self.parser.error("Loop body too large.");
        }
        let bytes = (displacement as i16).to_le_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    /// Emit pops/upvalue closes for every local above `target_depth`,
    /// batching plain pops. Leaves the compiler's local list untouched; the
    /// callers that actually leave the scope truncate it themselves.
    fn emit_scope_unwind(&mut self, target_depth: i32) {
        let mut batch = 0usize;
        let locals: Vec<(i32, bool)> = self
            .ctx
            .locals
            .iter()
            .rev()
            .map(|l| (l.depth, l.is_captured))
            .collect();
        for (depth, is_captured) in locals {
            if depth <= target_depth {
                break;
            }
            if is_captured {
                self.flush_pops(batch);
                batch = 0;
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                batch += 1;
            }
        }
        self.flush_pops(batch);
    }

    fn flush_pops(&mut self, mut count: usize) {
        while count > 255 {
            self.emit_op(OpCode::PopN);
            self.emit_byte(255);
            count -= 255;
        }
        if count == 1 {
            self.emit_op(OpCode::Pop);
        } else if count > 0 {
            self.emit_op(OpCode::PopN);
            self.emit_byte(count as u8);
        }
    }

    // ------------------------------------------------------------------
    // Scopes and variables
    // ------------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.ctx.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.ctx.scope_depth -= 1;
        let depth = self.ctx.scope_depth;
        self.emit_scope_unwind(depth);
        while matches!(self.ctx.locals.last(), Some(l) if l.depth > depth) {
            self.ctx.locals.pop();
        }
    }

    fn add_local(&mut self, name: &'src str) {
        if self.ctx.locals.len() >= MAX_LOCALS {
            self.parser.error("Too many local variables in function.");
            return;
        }
        self.ctx.locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.ctx.scope_depth == 0 {
            return;
        }
        let name = self.parser.previous.lexeme;
        let mut duplicate = false;
        for local in self.ctx.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.ctx.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.parser
                .error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    /// Consume an identifier, declare it, and return its constant index
    /// (globals only; locals live on the stack and return 0).
    fn parse_variable_name(&mut self, message: &str) -> usize {
        self.parser.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.ctx.scope_depth > 0 {
            return 0;
        }
        let name = self.parser.previous.lexeme;
        self.identifier_constant(name)
    }

    fn mark_initialized(&mut self) {
        let depth = self.ctx.scope_depth;
        if depth == 0 {
            return;
        }
        if let Some(local) = self.ctx.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: usize) {
        if self.ctx.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_indexed(OpCode::DefineGlobal, global);
    }

    fn named_variable(&mut self, name: &str, lvalue: bool) {
        let (get_op, set_op, index) = match resolve_local(&self.ctx, name) {
            Err(message) => {
                self.parser.error(message);
                return;
            }
            Ok(Some(slot)) => (OpCode::GetLocal, OpCode::SetLocal, slot),
            Ok(None) => match resolve_upvalue(&mut self.ctx, name) {
                Err(message) => {
                    self.parser.error(message);
                    return;
                }
                Ok(Some(index)) => (OpCode::GetUpvalue, OpCode::SetUpvalue, index as usize),
                Ok(None) => {
                    let index = self.identifier_constant(name);
                    (OpCode::GetGlobal, OpCode::SetGlobal, index)
                }
            },
        };

        if lvalue && self.parser.matches(TokenKind::Equal) {
            self.expression();
            self.emit_indexed(set_op, index);
        } else {
            self.emit_indexed(get_op, index);
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.parser.advance();
        let Some(prefix) = rule(self.parser.previous.kind).prefix else {
            self.parser.error("Expect expression.");
            return;
        };

        // Only the shallowest position of an expression may be an
        // assignment target.
        let lvalue = precedence <= Precedence::Assignment;
        prefix(self, lvalue);
        self.infix_loop(precedence, lvalue);
    }

    /// The infix half of `parse_precedence`, split out so an already-parsed
    /// prefix (an anonymous function heading a statement) can continue here.
    fn infix_loop(&mut self, precedence: Precedence, lvalue: bool) {
        while precedence <= rule(self.parser.current.kind).precedence {
            self.parser.advance();
            let Some(infix) = rule(self.parser.previous.kind).infix else {
                break;
            };
            infix(self, lvalue);
        }

        if lvalue && self.parser.matches(TokenKind::Equal) {
            self.parser.error("Invalid assignment target.");
        }
    }

    fn number(&mut self, _lvalue: bool) {
        let value: f64 = self.parser.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::number(value));
    }

    fn string(&mut self, _lvalue: bool) {
        let lexeme = self.parser.previous.lexeme;
        let text = &lexeme[1..lexeme.len() - 1];
        let interned = self.heap.intern(text);
        self.emit_constant(Value::obj(interned.obj));
    }

    fn literal(&mut self, _lvalue: bool) {
        match self.parser.previous.kind {
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            _ => {}
        }
    }

    fn grouping(&mut self, _lvalue: bool) {
        self.expression();
        self.parser
            .consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _lvalue: bool) {
        let operator = self.parser.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            // Prefix plus parses its operand and leaves it alone.
            TokenKind::Plus => {}
            _ => {}
        }
    }

    fn binary(&mut self, _lvalue: bool) {
        let operator = self.parser.previous.kind;
        let precedence = rule(operator).precedence;
        self.parse_precedence(precedence.next());
        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => {}
        }
    }

    fn and_(&mut self, _lvalue: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _lvalue: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn variable(&mut self, lvalue: bool) {
        let name = self.parser.previous.lexeme;
        self.named_variable(name, lvalue);
    }

    fn call(&mut self, _lvalue: bool) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn dot(&mut self, lvalue: bool) {
        self.parser
            .consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.parser.previous.lexeme;
        let index = self.identifier_constant(name);

        if lvalue && self.parser.matches(TokenKind::Equal) {
            self.expression();
            self.emit_indexed(OpCode::SetProperty, index);
        } else if self.parser.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_indexed(OpCode::Invoke, index);
            self.emit_byte(argc);
        } else {
            self.emit_indexed(OpCode::GetProperty, index);
        }
    }

    fn this_(&mut self, _lvalue: bool) {
        if self.class_ctx.is_none() {
            self.parser.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _lvalue: bool) {
        match self.class_ctx.as_deref() {
            None => self.parser.error("Can't use 'super' outside of a class."),
            Some(ctx) if !ctx.has_superclass => self
                .parser
                .error("Can't use 'super' in a class with no superclass."),
            Some(_) => {}
        }

        self.parser.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.parser
            .consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.parser.previous.lexeme;
        let index = self.identifier_constant(name);

        self.named_variable("this", false);
        self.named_variable("super", false);
        self.emit_indexed(OpCode::GetSuper, index);
    }

    fn fun_expression(&mut self, _lvalue: bool) {
        self.function(FunctionKind::Anonymous);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: usize = 0;
        if !self.parser.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.parser.error("Can't have more than 255 arguments.");
                } else {
                    argc += 1;
                }
                if !self.parser.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.parser
            .consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    // ------------------------------------------------------------------
    // Functions and classes
    // ------------------------------------------------------------------

    fn begin_ctx(&mut self, kind: FunctionKind) {
        let name = match kind {
            FunctionKind::Script | FunctionKind::Anonymous => None,
            _ => Some(self.heap.intern(self.parser.previous.lexeme)),
        };
        let ctx = Box::new(FnCtx::new(kind, name));
        let enclosing = std::mem::replace(&mut self.ctx, ctx);
        self.ctx.enclosing = Some(enclosing);
    }

    /// Finish the current context: emit the implicit return, restore the
    /// enclosing context, and allocate the finished function.
    fn end_ctx(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        if self.ctx.function.chunk.last_op() != Some(OpCode::Return) {
            self.emit_return();
        }

        let enclosing = self
            .ctx
            .enclosing
            .take()
            .expect("end_ctx on the script context");
        let ctx = std::mem::replace(&mut self.ctx, enclosing);
        let mut function = ctx.function;
        function.upvalue_count = ctx.upvalues.len();
        let handle = self.heap.alloc(Obj::Function(function));
        (handle, ctx.upvalues)
    }

    /// Compile a function body (parameters through closing brace) and emit
    /// the code that produces it at runtime: a plain constant when nothing
    /// is captured, else a closure with its capture descriptors.
    fn function(&mut self, kind: FunctionKind) {
        self.begin_ctx(kind);
        self.begin_scope();

        self.parser
            .consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.parser.check(TokenKind::RightParen) {
            loop {
                if self.ctx.function.arity == 255 {
                    self.parser
                        .error_at_current("Can't have more than 255 parameters.");
                }
                self.ctx.function.arity += 1;
                let constant = self.parse_variable_name("Expect parameter name.");
                self.define_variable(constant);
                if !self.parser.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.parser
            .consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.parser
            .consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_ctx();
        let index = self.make_constant(Value::obj(function));
        if upvalues.is_empty() {
            self.emit_indexed(OpCode::Constant, index);
        } else {
            self.emit_indexed(OpCode::Closure, index);
            for upvalue in upvalues {
                let word = ((upvalue.is_local as u16) << 15) | upvalue.index;
                let bytes = word.to_le_bytes();
                self.emit_byte(bytes[0]);
                self.emit_byte(bytes[1]);
            }
        }
    }

    fn method(&mut self) {
        self.parser
            .consume(TokenKind::Identifier, "Expect method name.");
        let name = self.parser.previous.lexeme;
        let index = self.identifier_constant(name);
        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_indexed(OpCode::Method, index);
    }

    fn class_declaration(&mut self) {
        self.parser.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.parser.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        self.emit_indexed(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        let enclosing = self.class_ctx.take();
        self.class_ctx = Some(Box::new(ClassCtx {
            enclosing,
            has_superclass: false,
        }));

        if self.parser.matches(TokenKind::Less) {
            self.parser
                .consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass_name = self.parser.previous.lexeme;
            self.named_variable(superclass_name, false);
            if class_name.lexeme == superclass_name {
                self.parser.error("A class can't inherit from itself.");
            }

            // `super` becomes an ordinary local of a scope wrapping the
            // class body, so closures resolve it like any other name.
            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();

            self.named_variable(class_name.lexeme, false);
            self.emit_op(OpCode::Inherit);
            if let Some(ctx) = self.class_ctx.as_deref_mut() {
                ctx.has_superclass = true;
            }
        }

        self.named_variable(class_name.lexeme, false);
        self.parser
            .consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.parser.check(TokenKind::RightBrace) && !self.parser.check(TokenKind::Eof) {
            self.method();
        }
        self.parser
            .consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let has_superclass = self
            .class_ctx
            .as_deref()
            .is_some_and(|ctx| ctx.has_superclass);
        if has_superclass {
            self.end_scope();
        }

        if let Some(ctx) = self.class_ctx.take() {
            self.class_ctx = ctx.enclosing;
        }
    }

    // ------------------------------------------------------------------
    // Statements and declarations
    // ------------------------------------------------------------------

    fn declaration(&mut self) {
        if self.parser.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.parser.check(TokenKind::Fun) {
            self.fun_declaration_or_expression();
        } else if self.parser.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.parser.panic_mode() {
            self.parser.synchronize();
        }
    }

    /// `fun name(...)` declares a function; `fun (...)` at statement
    /// position is an anonymous function heading an expression statement.
    fn fun_declaration_or_expression(&mut self) {
        self.parser.advance(); // the `fun` keyword
        if self.parser.check(TokenKind::Identifier) {
            let global = self.parse_variable_name("Expect function name.");
            self.mark_initialized();
            self.function(FunctionKind::Function);
            self.define_variable(global);
        } else {
            self.function(FunctionKind::Anonymous);
            self.infix_loop(Precedence::Assignment, true);
            self.parser
                .consume(TokenKind::Semicolon, "Expect ';' after expression.");
            self.emit_op(OpCode::Pop);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable_name("Expect variable name.");
        if self.parser.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.parser.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.parser.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.parser.matches(TokenKind::If) {
            self.if_statement();
        } else if self.parser.matches(TokenKind::While) {
            self.while_statement();
        } else if self.parser.matches(TokenKind::For) {
            self.for_statement();
        } else if self.parser.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.parser.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.parser.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.parser.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.parser.check(TokenKind::RightBrace) && !self.parser.check(TokenKind::Eof) {
            self.declaration();
        }
        self.parser
            .consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.parser
            .consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.parser
            .consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.parser
            .consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.parser
            .consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.parser.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.ctx.function.chunk.len();
        let scope_depth = self.ctx.scope_depth;
        self.ctx.loops.push(LoopCtx {
            start: loop_start,
            scope_depth,
            breaks: Vec::new(),
        });

        self.parser
            .consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.parser
            .consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        let breaks = self.ctx.loops.pop().map(|l| l.breaks).unwrap_or_default();
        for offset in breaks {
            self.patch_jump(offset);
        }
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.parser
            .consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.parser.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.parser.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.ctx.function.chunk.len();
        let mut exit_jump = None;
        if !self.parser.matches(TokenKind::Semicolon) {
            self.expression();
            self.parser
                .consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.parser.matches(TokenKind::RightParen) {
            // The increment runs after the body: jump over it now, run it
            // on the way back around.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.ctx.function.chunk.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.parser
                .consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let scope_depth = self.ctx.scope_depth;
        self.ctx.loops.push(LoopCtx {
            start: loop_start,
            scope_depth,
            breaks: Vec::new(),
        });

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }

        let breaks = self.ctx.loops.pop().map(|l| l.breaks).unwrap_or_default();
        for offset in breaks {
            self.patch_jump(offset);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.ctx.kind == FunctionKind::Script {
            self.parser.error("Can't return from top-level code.");
        }

        if self.parser.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.ctx.kind == FunctionKind::Initializer {
                self.parser
                    .error("Can't return a value from an initializer.");
            }
            self.expression();
            self.parser
                .consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn break_statement(&mut self) {
        self.parser
            .consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        let Some(target_depth) = self.ctx.loops.last().map(|l| l.scope_depth) else {
            self.parser.error("Can't use 'break' outside of a loop.");
            return;
        };

        self.emit_scope_unwind(target_depth);
        let jump = self.emit_jump(OpCode::Jump);
        let too_many = match self.ctx.loops.last_mut() {
            Some(l) if l.breaks.len() < MAX_BREAKS => {
                l.breaks.push(jump);
                false
            }
            _ => true,
        };
        if too_many {
            self.parser.error("Too many break statements in one loop.");
        }
    }

    fn continue_statement(&mut self) {
        self.parser
            .consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        let Some((start, target_depth)) = self
            .ctx
            .loops
            .last()
            .map(|l| (l.start, l.scope_depth))
        else {
            self.parser.error("Can't use 'continue' outside of a loop.");
            return;
        };

        self.emit_scope_unwind(target_depth);
        self.emit_loop(start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Chunk;

    fn compile_ok(source: &str) -> (Heap, ObjRef) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap).expect("program should compile");
        (heap, function)
    }

    fn compile_err(source: &str) -> CompileError {
        let mut heap = Heap::new();
        compile(source, &mut heap).expect_err("program should not compile")
    }

    /// Walk a chunk instruction by instruction, returning (offset, opcode)
    /// pairs. Fails the test on a malformed stream.
    fn walk(heap: &Heap, chunk: &Chunk) -> Vec<(usize, OpCode)> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < chunk.len() {
            let op = OpCode::from_u8(chunk.code[offset]).expect("defined opcode");
            out.push((offset, op));
            let operands = match op {
                OpCode::PopN | OpCode::Call => 1,
                OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => 2,
                OpCode::Invoke | OpCode::Invoke16 | OpCode::Invoke24 => {
                    op.index_width().unwrap_or(1) + 1
                }
                OpCode::Closure | OpCode::Closure16 | OpCode::Closure24 => {
                    let width = op.index_width().unwrap_or(1);
                    let mut index = 0usize;
                    for i in 0..width {
                        index |= (chunk.code[offset + 1 + i] as usize) << (8 * i);
                    }
                    let count = match heap.get(
                        chunk.constants[index].as_obj().expect("function constant"),
                    ) {
                        Obj::Function(f) => f.upvalue_count,
                        _ => 0,
                    };
                    width + 2 * count
                }
                _ => op.index_width().unwrap_or(0),
            };
            offset += 1 + operands;
        }
        out
    }

    /// Every function reachable from the script's constant pool.
    fn all_chunks<'a>(heap: &'a Heap, root: ObjRef) -> Vec<&'a Chunk> {
        let mut out = Vec::new();
        let mut pending = vec![root];
        while let Some(r) = pending.pop() {
            let Obj::Function(f) = heap.get(r) else { continue };
            out.push(&f.chunk);
            for constant in &f.chunk.constants {
                if let Some(c) = constant.as_obj() {
                    if matches!(heap.get(c), Obj::Function(_)) {
                        pending.push(c);
                    }
                }
            }
        }
        out
    }

    #[test]
    fn test_script_ends_with_implicit_return() {
        let (heap, function) = compile_ok("print 1;");
        let chunk = &heap.function(function).chunk;
        let ops: Vec<OpCode> = walk(&heap, chunk).into_iter().map(|(_, op)| op).collect();
        assert_eq!(ops.last(), Some(&OpCode::Return));
        assert_eq!(ops[ops.len() - 2], OpCode::Nil);
    }

    #[test]
    fn test_jumps_land_on_instruction_boundaries() {
        let sources = [
            "if (1 < 2) print 1; else print 2;",
            "var i = 0; while (i < 10) { if (i == 5) break; i = i + 1; }",
            "for (var i = 0; i < 3; i = i + 1) { if (i == 1) continue; print i; }",
            "print 1 and 2 or 3;",
        ];
        for source in sources {
            let (heap, function) = compile_ok(source);
            for chunk in all_chunks(&heap, function) {
                let instructions = walk(&heap, chunk);
                let offsets: Vec<usize> = instructions.iter().map(|(o, _)| *o).collect();
                for (offset, op) in &instructions {
                    if matches!(
                        op,
                        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue
                    ) {
                        let displacement = i16::from_le_bytes([
                            chunk.code[offset + 1],
                            chunk.code[offset + 2],
                        ]);
                        let target = (*offset as isize + 3 + displacement as isize) as usize;
                        assert!(
                            offsets.contains(&target) || target == chunk.len(),
                            "jump at {} targets {} which is not an instruction boundary",
                            offset,
                            target
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_no_placeholder_jumps_survive() {
        let (heap, function) = compile_ok(
            "var i = 0; while (i < 3) { if (i == 1) { i = i + 2; continue; } i = i + 1; }",
        );
        for chunk in all_chunks(&heap, function) {
            for (offset, op) in walk(&heap, chunk) {
                if matches!(op, OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue) {
                    let raw = u16::from_le_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
                    assert_ne!(raw, 0xFFFF, "unpatched jump at offset {}", offset);
                }
            }
        }
    }

    #[test]
    fn test_function_without_captures_is_a_plain_constant() {
        let (heap, function) = compile_ok("fun f() { return 1; } print f();");
        let chunk = &heap.function(function).chunk;
        let ops: Vec<OpCode> = walk(&heap, chunk).into_iter().map(|(_, op)| op).collect();
        assert!(!ops.contains(&OpCode::Closure));
        assert!(ops.contains(&OpCode::Constant));
    }

    #[test]
    fn test_capture_emits_closure_and_close_upvalue() {
        let (heap, function) = compile_ok(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        );
        let mut saw_closure = false;
        let mut saw_close = false;
        for chunk in all_chunks(&heap, function) {
            for (_, op) in walk(&heap, chunk) {
                saw_closure |= matches!(op, OpCode::Closure | OpCode::Closure16 | OpCode::Closure24);
                saw_close |= op == OpCode::CloseUpvalue;
            }
        }
        assert!(saw_closure);
        assert!(saw_close);
    }

    #[test]
    fn test_captured_flag_survives_descriptor_dedup() {
        // The same variable is resolved twice from the inner function; the
        // deduplicated descriptor must still close the captured local.
        let (heap, function) = compile_ok(
            "fun outer() { var x = 1; fun inner() { return x + x; } return inner; }",
        );
        let mut close_upvalues = 0;
        let mut upvalue_counts = Vec::new();
        for chunk in all_chunks(&heap, function) {
            for (_, op) in walk(&heap, chunk) {
                if op == OpCode::CloseUpvalue {
                    close_upvalues += 1;
                }
            }
            for constant in &chunk.constants {
                if let Some(r) = constant.as_obj() {
                    if let Obj::Function(f) = heap.get(r) {
                        upvalue_counts.push(f.upvalue_count);
                    }
                }
            }
        }
        assert_eq!(close_upvalues, 1);
        // inner captured x exactly once despite two uses.
        assert!(upvalue_counts.contains(&1));
    }

    #[test]
    fn test_transitive_capture_through_middle_function() {
        let (heap, function) = compile_ok(
            "fun a() { var x = 1; fun b() { fun c() { return x; } return c; } return b; }",
        );
        // Both b and c end up with one upvalue each: b captures the local,
        // c re-captures b's upvalue.
        let mut counts = Vec::new();
        for chunk in all_chunks(&heap, function) {
            for constant in &chunk.constants {
                if let Some(r) = constant.as_obj() {
                    if let Obj::Function(f) = heap.get(r) {
                        if f.name.is_some() && f.upvalue_count > 0 {
                            counts.push(f.upvalue_count);
                        }
                    }
                }
            }
        }
        assert_eq!(counts, vec![1, 1]);
    }

    #[test]
    fn test_wide_constant_indexes() {
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("print {}.5;", i));
        }
        let (heap, function) = compile_ok(&source);
        let chunk = &heap.function(function).chunk;
        let ops: Vec<OpCode> = walk(&heap, chunk).into_iter().map(|(_, op)| op).collect();
        assert!(ops.contains(&OpCode::Constant));
        assert!(ops.contains(&OpCode::Constant16));
    }

    #[test]
    fn test_constant_dedup_across_statements() {
        let (heap, function) = compile_ok("print 1; print 1; print 1;");
        let chunk = &heap.function(function).chunk;
        let numbers = chunk
            .constants
            .iter()
            .filter(|v| v.is_number())
            .count();
        assert_eq!(numbers, 1);
    }

    #[test]
    fn test_popn_batching_in_scopes() {
        let mut source = String::from("{");
        for i in 0..10 {
            source.push_str(&format!("var v{} = {};", i, i));
        }
        source.push('}');
        let (heap, function) = compile_ok(&source);
        let chunk = &heap.function(function).chunk;
        let mut saw_popn = false;
        for (offset, op) in walk(&heap, chunk) {
            if op == OpCode::PopN {
                saw_popn = true;
                assert_eq!(chunk.code[offset + 1], 10);
            }
        }
        assert!(saw_popn);
    }

    #[test]
    fn test_parameter_limits() {
        let params = |n: usize| {
            let names: Vec<String> = (0..n).map(|i| format!("p{}", i)).collect();
            format!("fun f({}) {{}}", names.join(", "))
        };
        let mut heap = Heap::new();
        assert!(compile(&params(255), &mut heap).is_ok());
        assert!(compile(&params(256), &mut heap).is_err());
    }

    #[test]
    fn test_argument_limits() {
        let call = |n: usize| {
            let args: Vec<String> = (0..n).map(|i| i.to_string()).collect();
            format!("f({});", args.join(", "))
        };
        let mut heap = Heap::new();
        assert!(compile(&call(255), &mut heap).is_ok());
        assert!(compile(&call(256), &mut heap).is_err());
    }

    #[test]
    fn test_jump_distance_limits() {
        // Each `print 12345;` is 3 bytes (the constant pool deduplicates,
        // so the index stays 1 byte); the branch also skips a Pop and the
        // 3-byte else jump, so the jumped distance is 3n + 4.
        let branch_over = |n: usize| {
            let mut body = String::new();
            for _ in 0..n {
                body.push_str("print 12345;");
            }
            format!("if (true) {{ {} }}", body)
        };
        let mut heap = Heap::new();
        // 3 * 10921 + 4 == 32767, the largest encodable displacement.
        assert!(compile(&branch_over(10921), &mut heap).is_ok());
        assert!(compile(&branch_over(10922), &mut heap).is_err());
    }

    #[test]
    fn test_break_limits() {
        let loops = |n: usize| {
            let mut body = String::new();
            for _ in 0..n {
                body.push_str("if (x) break; ");
            }
            format!("var x = false; while (x) {{ {} }}", body)
        };
        let mut heap = Heap::new();
        assert!(compile(&loops(64), &mut heap).is_ok());
        assert!(compile(&loops(65), &mut heap).is_err());
    }

    #[test]
    fn test_scope_and_placement_errors() {
        compile_err("{ var a = 1; var a = 2; }");
        compile_err("{ var a = a; }");
        compile_err("return 1;");
        compile_err("break;");
        compile_err("continue;");
        compile_err("print this;");
        compile_err("print super.x;");
        compile_err("class A { f() { return super.f(); } }");
        compile_err("class A < A {}");
        compile_err("class A { init() { return 1; } }");
        compile_err("1 = 2;");
        compile_err("var;");
        compile_err("print 1");
    }

    #[test]
    fn test_initializer_returns_this_slot() {
        let (heap, function) = compile_ok("class A { init() { this.x = 1; } }");
        // Find the initializer and confirm it ends with GetLocal 0; Return.
        let mut found = false;
        for chunk in all_chunks(&heap, function) {
            for constant in &chunk.constants {
                if let Some(r) = constant.as_obj() {
                    if let Obj::Function(f) = heap.get(r) {
                        if f.name.map(|n| heap.str_text(n.obj)) == Some("init") {
                            let ops = walk(&heap, &f.chunk);
                            let tail: Vec<OpCode> =
                                ops.iter().rev().take(2).map(|(_, op)| *op).collect();
                            assert_eq!(tail, vec![OpCode::Return, OpCode::GetLocal]);
                            found = true;
                        }
                    }
                }
            }
        }
        assert!(found);
    }

    #[test]
    fn test_error_recovery_reports_multiple_statements() {
        let error = compile_err("var 1 = 2; var 2 = 3;");
        assert!(error.errors >= 2);
    }
}
