//! Lutra is a bytecode compiler and virtual machine for a small,
//! dynamically typed, class-based scripting language.
//!
//! Source text is lowered in a single pass: a Pratt parser emits bytecode
//! directly into per-function chunks, with no AST in between. A stack VM
//! executes the chunks, with call frames, closures and captured upvalues,
//! and classes with single inheritance, over a heap managed
//! by a precise mark-and-sweep garbage collector. Strings are interned, so
//! equal contents means the same object.
//!
//! # Quick start
//!
//! ```
//! use lutra::Vm;
//!
//! let mut vm = Vm::with_capture();
//! vm.interpret(r#"
//! fun greet(name) { return "hello, " + name; }
//! print greet("world");
//! "#).unwrap();
//! assert_eq!(vm.take_print_output(), vec!["hello, world"]);
//! ```
//!
//! A [`Vm`] built with [`Vm::new`] prints to the process stdout and
//! stderr instead of capturing; that is what the `lutra` binary uses.
//! Globals persist across [`Vm::interpret`] calls, so a REPL can feed the
//! same VM line by line.
//!
//! # Language surface
//!
//! - values: numbers (IEEE-754 doubles), strings, booleans, `nil`
//! - statements: `print`, `var`, blocks, `if`/`else`, `while`, `for`,
//!   `return`, `fun`, `class` (with `< Super` inheritance)
//! - expressions: arithmetic and comparison operators, short-circuit
//!   `and`/`or`, assignment, calls, property access, `this`, `super`
//! - closures capture variables by reference; captured locals outlive
//!   their stack frame
//! - one native function, `clock()`, returning seconds as a number
//!
//! # Debug features
//!
//! Cargo features for poking at the implementation, all off by default:
//! `print-code` disassembles each function after compilation,
//! `trace-execution` dumps the stack and each instruction as it runs,
//! `log-gc` narrates collections, and `stress-gc` collects on every
//! allocation.

mod chunk;
mod compiler;
#[cfg(any(feature = "print-code", feature = "trace-execution"))]
mod debug;
mod error;
mod heap;
mod object;
mod scanner;
mod table;
mod value;
mod vm;

pub use error::{Error, Result};
pub use value::Value;
pub use vm::Vm;
