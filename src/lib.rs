//! Kiln - instruction selection and local register allocation.
//!
//! Kiln lowers typed function bodies to x86-64 or AArch64 assembly text in
//! two replay passes over a recorded instruction stream. The simulate pass
//! resolves variable reads and scope structure; the build pass assigns
//! registers, inserts the moves and spills the assignment requires, and
//! finalizes each operand. A redirect pass between the two fuses scaled
//! additions into address computations and steers producers straight into
//! the return register.
//!
//! # Primary Usage
//!
//! ```ignore
//! use kiln::core::session::CompilationSession;
//! use kiln::core::target::TargetConfig;
//! use kiln::unit::{FunctionSignature, Unit};
//! use bumpalo::Bump;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let mut unit = Unit::new(&session, TargetConfig::x64(), signature);
//! // record instructions through unit.add(...)
//! let lines = kiln::translate::lower_function(&mut unit)?;
//! ```
//!
//! # Architecture
//!
//! - [`unit`] - Recorded function, value slots and the two replay passes
//! - [`handle`] - Value placement descriptors from register to memory forms
//! - [`memory`] - Placement conversion, relocation and reconciliation
//! - [`instruction`] - Per operation simulate and build rules
//! - [`oracle`] - Redirect pass running between simulate and build
//! - [`translate`] - Frame layout and assembly rendering
//! - [`core`] - Session, targets, formats and error types

pub mod arch;
pub mod core;
pub mod handle;
pub mod instruction;
pub mod memory;
pub mod oracle;
pub mod register;
pub mod scope;
pub mod trace;
pub mod translate;
pub mod unit;
pub mod value;

pub use crate::core::error::{CompileError, CompileResult};
pub use crate::core::format::{Format, Size};
pub use crate::core::session::{CompilationSession, SessionStats};
pub use crate::core::target::{Arch, TargetConfig};
pub use crate::handle::{Constant, Handle, HandleKind};
pub use crate::instruction::{InstrId, Instruction, InstructionKind};
pub use crate::register::Reg;
pub use crate::scope::VariableId;
pub use crate::translate::{assembly_header, data_section, lower_function};
pub use crate::unit::{FunctionSignature, Unit};
pub use crate::value::ValueId;
