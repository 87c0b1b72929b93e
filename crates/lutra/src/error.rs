use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The source did not compile. Carries the first diagnostic; the full
    /// list was already written to the error sink.
    #[error("Compile error: {0}")]
    Compile(String),

    /// Execution aborted. The stack trace was already written to the error
    /// sink; this carries the bare message.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, Error>;
