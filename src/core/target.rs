// Target configuration for the lowering engine. The original code base kept the
// architecture selection and related switches in global mutable state; here they are
// bundled into one immutable TargetConfig value that is created once per compilation
// and threaded through the allocation unit and every instruction build path. The
// config answers the binary x86-64/AArch64 question, carries the word size and stack
// alignment of the ABI and the debug-information flag that controls whether source
// position directives are emitted.

//! Immutable per-compilation target configuration.

use crate::core::format::{Format, Size};

/// Supported target architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// x86-64, System V ABI.
    X64,
    /// AArch64, AAPCS64.
    Arm64,
}

/// Architecture and ABI selection threaded through the whole unit.
#[derive(Debug, Clone, Copy)]
pub struct TargetConfig {
    pub arch: Arch,
    /// Emit `.loc` style source position directives.
    pub debug_info: bool,
}

impl TargetConfig {
    pub fn x64() -> Self {
        TargetConfig {
            arch: Arch::X64,
            debug_info: false,
        }
    }

    pub fn arm64() -> Self {
        TargetConfig {
            arch: Arch::Arm64,
            debug_info: false,
        }
    }

    pub fn with_debug_info(mut self, enabled: bool) -> Self {
        self.debug_info = enabled;
        self
    }

    pub fn is_x64(&self) -> bool {
        self.arch == Arch::X64
    }

    pub fn is_arm64(&self) -> bool {
        self.arch == Arch::Arm64
    }

    /// Width of a general purpose register.
    pub fn size(&self) -> Size {
        Size::Qword
    }

    pub fn bytes(&self) -> i32 {
        8
    }

    /// Default integer format of the target.
    pub fn format(&self) -> Format {
        Format::Int64
    }

    /// Required stack alignment at call boundaries.
    pub fn stack_alignment(&self) -> i32 {
        16
    }
}
