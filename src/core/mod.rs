// This module serves as the central hub for kiln's core infrastructure components,
// providing the building blocks shared across both target architectures. It exports
// and organizes the ambient subsystems: session management (arena-based memory
// allocation, string interning, lowering statistics), error handling (CompileError
// and CompileResult used throughout lowering), data formats (integer and decimal
// formats with their operand sizes) and target description (architecture selection
// and pointer width). The allocation and lowering machinery itself lives in the
// sibling modules at the crate root.

//! Core infrastructure shared by the lowering pipeline.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based memory allocation using `bumpalo`
//! - String interning for labels, symbols and constant identifiers
//! - Lowering statistics
//!
//! ## Error Handling (`error`)
//! - `CompileError` covering allocation, evacuation and lowering failures
//! - `CompileResult` alias used across the crate
//!
//! ## Formats (`format`)
//! - Signed, unsigned and decimal value formats
//! - Operand sizes with their textual access modifiers
//!
//! ## Target Description (`target`)
//! - Architecture selection between x86-64 and AArch64
//! - Pointer width and stack alignment queries

pub mod error;
pub mod format;
pub mod session;
pub mod target;

// Re-export core components
pub use error::{CompileError, CompileResult};
pub use format::{Format, Size};
pub use session::{CompilationSession, SessionStats};
pub use target::{Arch, TargetConfig};
