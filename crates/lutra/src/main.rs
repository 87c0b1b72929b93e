//! Lutra command-line entry point.
//!
//! Behavior:
//! - with **no args**, start an interactive REPL; each line runs against
//!   the same VM, so definitions persist across lines.
//! - with **one arg**, execute that source file.
//! - with anything more, print usage and exit 64.
//!
//! Exit codes follow the sysexits convention: 0 on success, 65 for a
//! compile error, 70 for a runtime error, 74 when the source file cannot
//! be read.

use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use lutra::{Error, Vm};

const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    match args.len() {
        1 => repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: lutra [path]");
            ExitCode::from(EX_USAGE)
        }
    }
}

fn repl() -> ExitCode {
    let mut vm = Vm::new();
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            return ExitCode::SUCCESS;
        }

        match lines.next() {
            Some(Ok(line)) => {
                // Errors are already reported on stderr; the REPL carries on.
                let _ = vm.interpret(&line);
            }
            // EOF (Ctrl-D) or a read error ends the session.
            _ => {
                println!();
                return ExitCode::SUCCESS;
            }
        }
    }
}

fn run_file(path: &str) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(_) => {
            eprintln!("Could not open file \"{}\".", path);
            return ExitCode::from(EX_IOERR);
        }
    };

    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Compile(_)) => ExitCode::from(EX_DATAERR),
        Err(Error::Runtime(_)) => ExitCode::from(EX_SOFTWARE),
    }
}
