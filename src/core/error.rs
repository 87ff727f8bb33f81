// This module defines error types for the kiln backend using the thiserror crate for
// idiomatic Rust error handling. CompileError is the main error enum covering the
// fatal failure class of the engine: contract violations between the front end and
// the instruction selector (requesting the destination of a destination-less
// instruction, redirecting a built instruction), allocator exhaustion, broken
// register/value ownership, failed call-boundary evacuation and unsupported operand
// combinations. Each variant carries relevant context (operation names, register
// names, error reasons) for debugging. The module also provides CompileResult<T> as
// a convenience type alias for Result<T, CompileError>. Expected architecture
// constraint misses are not errors; they are plain boolean results at their call
// sites and the caller falls back to an explicit move.

//! Error types for the kiln backend.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

/// Main error type for function lowering.
///
/// Every variant is a compiler-bug class failure: it aborts the current
/// function and is never caught and patched over, because any code generated
/// past it would be unsound.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Instruction {instruction} does not have a destination")]
    NoDestination {
        instruction: String,
    },

    #[error("Register allocation failed: {reason}")]
    RegisterAllocation {
        reason: String,
    },

    #[error("Register {register} is already claimed by another live value")]
    RegisterConflict {
        register: String,
    },

    #[error("Register evacuation failed")]
    EvacuationFailed,

    #[error("Redirection was requested after the instruction was built")]
    RedirectAfterBuild,

    #[error("Missing {name} register")]
    MissingRegister {
        name: String,
    },

    #[error("Unsupported operation: {reason}")]
    Unsupported {
        reason: String,
    },

    #[error("Code generation failed: {reason}")]
    CodeGeneration {
        reason: String,
    },

    #[error("Invalid value: {reason}")]
    InvalidValue {
        reason: String,
    },

    #[error("Scope error: {reason}")]
    Scope {
        reason: String,
    },
}

/// Result type alias for lowering operations.
pub type CompileResult<T> = Result<T, CompileError>;
