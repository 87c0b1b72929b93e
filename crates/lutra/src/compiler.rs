//! Single-pass bytecode compiler.
//!
//! The compiler is a Pratt parser that emits bytecode while it parses;
//! there is no AST. Expressions are driven by a fixed rule table mapping
//! each token kind to an optional prefix parser, an optional infix parser,
//! and an infix precedence. Statements are ordinary recursive descent on
//! top of that.
//!
//! Each function being compiled (the top-level script included) gets a
//! [`FnContext`] on the context stack: the heap function receiving the
//! code, its local slots, its scope depth, and the upvalue descriptors
//! that the `Closure` instruction will need. Variable references resolve
//! innermost-first: current locals, then captured variables threaded
//! through every enclosing function, then globals by name.
//!
//! The in-progress functions on the context stack are GC roots: string
//! constants and function objects are allocated on the VM heap as they are
//! compiled, and a collection can land between any two allocations.
//!
//! On a parse error the compiler enters panic mode, suppressing further
//! diagnostics until the next statement boundary, and keeps going to the
//! end of the file so one mistake reports once rather than cascading.

use crate::chunk::OpCode;
use crate::error::{Error, Result};
use crate::object::{Function, ObjKind, ObjRef};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::Value;
use crate::vm::Vm;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
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

type ParseFn<'src, 'vm> = fn(&mut Parser<'src, 'vm>, bool);

struct Rule<'src, 'vm> {
    prefix: Option<ParseFn<'src, 'vm>>,
    infix: Option<ParseFn<'src, 'vm>>,
    precedence: Precedence,
}

fn rule<'src, 'vm>(kind: TokenKind) -> Rule<'src, 'vm> {
    type Entry<'src, 'vm> = (
        Option<ParseFn<'src, 'vm>>,
        Option<ParseFn<'src, 'vm>>,
        Precedence,
    );
    let (prefix, infix, precedence): Entry<'src, 'vm> = match kind {
        TokenKind::LeftParen => (Some(Parser::grouping), Some(Parser::call), Precedence::Call),
        TokenKind::Dot => (None, Some(Parser::dot), Precedence::Call),
        TokenKind::Minus => (Some(Parser::unary), Some(Parser::binary), Precedence::Term),
        TokenKind::Plus => (None, Some(Parser::binary), Precedence::Term),
        TokenKind::Slash => (None, Some(Parser::binary), Precedence::Factor),
        TokenKind::Star => (None, Some(Parser::binary), Precedence::Factor),
        TokenKind::Bang => (Some(Parser::unary), None, Precedence::None),
        TokenKind::BangEqual => (None, Some(Parser::binary), Precedence::Equality),
        TokenKind::EqualEqual => (None, Some(Parser::binary), Precedence::Equality),
        TokenKind::Greater => (None, Some(Parser::binary), Precedence::Comparison),
        TokenKind::GreaterEqual => (None, Some(Parser::binary), Precedence::Comparison),
        TokenKind::Less => (None, Some(Parser::binary), Precedence::Comparison),
        TokenKind::LessEqual => (None, Some(Parser::binary), Precedence::Comparison),
        TokenKind::Identifier => (Some(Parser::variable), None, Precedence::None),
        TokenKind::String => (Some(Parser::string), None, Precedence::None),
        TokenKind::Number => (Some(Parser::number), None, Precedence::None),
        TokenKind::And => (None, Some(Parser::and_op), Precedence::And),
        TokenKind::Or => (None, Some(Parser::or_op), Precedence::Or),
        TokenKind::False => (Some(Parser::literal), None, Precedence::None),
        TokenKind::Nil => (Some(Parser::literal), None, Precedence::None),
        TokenKind::True => (Some(Parser::literal), None, Precedence::None),
        TokenKind::Super => (Some(Parser::super_expr), None, Precedence::None),
        TokenKind::This => (Some(Parser::this_expr), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    Rule {
        prefix,
        infix,
        precedence,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// Lexical depth, or -1 while the initializer is still being compiled.
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. The stack of these mirrors the lexical
/// nesting of function declarations.
struct FnContext<'src> {
    function: ObjRef,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

struct ClassContext {
    has_superclass: bool,
}

/// Compile a source string into a top-level script function on the VM
/// heap. All diagnostics go to the VM's error sink; the returned error
/// carries the first of them.
pub(crate) fn compile(vm: &mut Vm, source: &str) -> Result<ObjRef> {
    let mut parser = Parser::new(vm, source);
    parser.begin_context(FunctionKind::Script);

    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }

    let ctx = parser.end_context();
    if parser.had_error {
        Err(Error::Compile(
            parser
                .first_error
                .unwrap_or_else(|| "compilation failed".to_string()),
        ))
    } else {
        Ok(ctx.function)
    }
}

pub(crate) struct Parser<'src, 'vm> {
    vm: &'vm mut Vm,
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    first_error: Option<String>,
    contexts: Vec<FnContext<'src>>,
    classes: Vec<ClassContext>,
}

impl<'src, 'vm> Parser<'src, 'vm> {
    fn new(vm: &'vm mut Vm, source: &'src str) -> Parser<'src, 'vm> {
        Parser {
            vm,
            scanner: Scanner::new(source),
            current: Token::empty(),
            previous: Token::empty(),
            had_error: false,
            panic_mode: false,
            first_error: None,
            contexts: Vec::new(),
            classes: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Token plumbing and diagnostics
    // -----------------------------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let token = self.current;
            self.error_at(token, token.lexeme);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        let locus = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        let line = format!("[line {}] Error{}: {}", token.line, locus, message);
        self.vm.diag(&line);
        if self.first_error.is_none() {
            self.first_error = Some(line);
        }
        self.had_error = true;
    }

    /// Skip forward to a likely statement boundary so one parse error does
    /// not cascade.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -----------------------------------------------------------------------
    // Emission helpers
    // -----------------------------------------------------------------------

    fn current_function(&self) -> ObjRef {
        self.contexts.last().unwrap().function
    }

    fn current_kind(&self) -> FunctionKind {
        self.contexts.last().unwrap().kind
    }

    fn current_offset(&self) -> usize {
        self.vm.heap.chunk(self.current_function()).code.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        let function = self.current_function();
        self.vm.heap.function_mut(function).chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_return(&mut self) {
        if self.current_kind() == FunctionKind::Initializer {
            // An initializer always returns the instance sitting in slot 0.
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let function = self.current_function();
        let index = self
            .vm
            .heap
            .function_mut(function)
            .chunk
            .add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let string = self.vm.intern(name);
        self.make_constant(Value::Obj(string))
    }

    /// Emit a jump with a placeholder offset; returns the offset of the
    /// operand for [`Parser::patch_jump`].
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_offset() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 to step over the operand itself.
        let jump = self.current_offset() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }

        let function = self.current_function();
        let code = &mut self.vm.heap.function_mut(function).chunk.code;
        code[offset] = ((jump >> 8) & 0xff) as u8;
        code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);

        let offset = self.current_offset() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }

        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    // -----------------------------------------------------------------------
    // Function contexts and scopes
    // -----------------------------------------------------------------------

    fn begin_context(&mut self, kind: FunctionKind) {
        let function = self.vm.alloc(ObjKind::Function(Function::new()));
        // Root the in-progress function before anything else can allocate.
        self.vm.compiler_roots.push(function);

        let mut locals = Vec::new();
        // Slot 0 belongs to the VM: the callee itself, or `this` inside a
        // method body.
        locals.push(Local {
            name: if kind == FunctionKind::Function || kind == FunctionKind::Script {
                ""
            } else {
                "this"
            },
            depth: 0,
            is_captured: false,
        });

        self.contexts.push(FnContext {
            function,
            kind,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
        });

        if kind != FunctionKind::Script {
            let name = self.vm.intern(self.previous.lexeme);
            self.vm.heap.function_mut(function).name = Some(name);
        }
    }

    fn end_context(&mut self) -> FnContext<'src> {
        self.emit_return();
        let ctx = self.contexts.pop().unwrap();
        self.vm.compiler_roots.pop();

        #[cfg(feature = "print-code")]
        if !self.had_error {
            let name = match self.vm.heap.function(ctx.function).name {
                Some(n) => self.vm.heap.str_text(n).to_string(),
                None => "<script>".to_string(),
            };
            crate::debug::disassemble_chunk(
                &self.vm.heap,
                self.vm.heap.chunk(ctx.function),
                &name,
            );
        }

        ctx
    }

    fn begin_scope(&mut self) {
        self.contexts.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = {
            let ctx = self.contexts.last_mut().unwrap();
            ctx.scope_depth -= 1;
            ctx.scope_depth
        };

        loop {
            let captured = {
                let ctx = self.contexts.last().unwrap();
                match ctx.locals.last() {
                    Some(local) if local.depth > depth => Some(local.is_captured),
                    _ => None,
                }
            };
            match captured {
                // A captured local moves to the heap instead of vanishing.
                Some(true) => self.emit_op(OpCode::CloseUpvalue),
                Some(false) => self.emit_op(OpCode::Pop),
                None => break,
            }
            self.contexts.last_mut().unwrap().locals.pop();
        }
    }

    // -----------------------------------------------------------------------
    // Variable declaration and resolution
    // -----------------------------------------------------------------------

    fn add_local(&mut self, name: &'src str) {
        if self.contexts.last().unwrap().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.contexts.last_mut().unwrap().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.contexts.last().unwrap().scope_depth == 0 {
            return;
        }

        let name = self.previous.lexeme;
        let mut duplicate = false;
        {
            let ctx = self.contexts.last().unwrap();
            for local in ctx.locals.iter().rev() {
                if local.depth != -1 && local.depth < ctx.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);

        self.declare_variable();
        if self.contexts.last().unwrap().scope_depth > 0 {
            return 0;
        }

        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let ctx = self.contexts.last_mut().unwrap();
        if ctx.scope_depth == 0 {
            return;
        }
        let depth = ctx.scope_depth;
        ctx.locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.contexts.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, ctx_index: usize, name: &str) -> Option<u8> {
        let mut uninitialized = false;
        let mut found = None;
        for (i, local) in self.contexts[ctx_index].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    uninitialized = true;
                }
                found = Some(i as u8);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    /// Resolve `name` as a variable captured from an enclosing function,
    /// threading an upvalue through every function in between.
    fn resolve_upvalue(&mut self, ctx_index: usize, name: &str) -> Option<u8> {
        if ctx_index == 0 {
            return None;
        }

        if let Some(local) = self.resolve_local(ctx_index - 1, name) {
            self.contexts[ctx_index - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(ctx_index, local, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(ctx_index - 1, name) {
            return Some(self.add_upvalue(ctx_index, upvalue, false));
        }

        None
    }

    fn add_upvalue(&mut self, ctx_index: usize, index: u8, is_local: bool) -> u8 {
        let desc = UpvalueDesc { index, is_local };
        if let Some(i) = self.contexts[ctx_index]
            .upvalues
            .iter()
            .position(|u| *u == desc)
        {
            return i as u8;
        }

        if self.contexts[ctx_index].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }

        self.contexts[ctx_index].upvalues.push(desc);
        let function = self.contexts[ctx_index].function;
        self.vm.heap.function_mut(function).upvalue_count += 1;
        (self.contexts[ctx_index].upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let ctx = self.contexts.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(ctx, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(upvalue) = self.resolve_upvalue(ctx, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    // -----------------------------------------------------------------------
    // Declarations and statements
    // -----------------------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassContext {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass_name = self.previous.lexeme;
            self.named_variable(superclass_name, false);

            if class_name == superclass_name {
                self.error("A class can't inherit from itself.");
            }

            // A scope holding the superclass under the synthetic name
            // `super`, so super-expressions in the methods can find it.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }

        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.lexeme);

        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_op_byte(OpCode::Method, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // The function may refer to itself recursively, so its name is
        // usable before the body finishes compiling.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.begin_context(kind);
        // No matching end_scope: the whole context ends with the body.
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let function = self.current_function();
                if self.vm.heap.function(function).arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.vm.heap.function_mut(function).arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let ctx = self.end_context();
        let constant = self.make_constant(Value::Obj(ctx.function));
        self.emit_op_byte(OpCode::Closure, constant);

        for upvalue in &ctx.upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_offset();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_offset();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            // The increment runs after the body, so the body jumps over it
            // and the loop-back lands on it.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_offset();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.current_kind() == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_kind() == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }

            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        // Only at assignment altitude may a place expression consume `=`.
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            let infix = rule(self.previous.kind).infix.unwrap();
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == u8::MAX {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap();
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let string = self.vm.intern(&lexeme[1..lexeme.len() - 1]);
        self.emit_constant(Value::Obj(string));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.lexeme, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;

        self.parse_precedence(Precedence::Unary);

        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(rule(operator).precedence.next());

        match operator {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
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
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!(),
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            // recv.name(args) collapses lookup and call into one dispatch.
            let arg_count = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name);
        }
    }

    /// `and` leaves the left value on the stack when it is falsy; the jump
    /// deliberately does not pop, so that value *is* the result.
    fn and_op(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);

        self.patch_jump(end_jump);
    }

    fn or_op(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);

        self.patch_jump(end_jump);
    }

    fn this_expr(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }

        // `this` is never an assignment target.
        self.named_variable("this", false);
    }

    fn super_expr(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_op_byte(OpCode::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_op_byte(OpCode::GetSuper, name);
        }
    }
}
