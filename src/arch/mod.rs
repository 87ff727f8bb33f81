// This module selects the machine description for the configured target. Each
// architecture contributes its register table (partition names plus role flags)
// and the calling convention's parameter register sequences. The unit consumes
// these tables through the functions here and never branches on the target for
// register discovery itself.

//! Target architecture descriptions.

pub mod arm64;
pub mod x64;

use crate::core::target::TargetConfig;
use crate::register::RegisterDescriptor;

/// Build the register table for the configured target.
pub fn registers(target: &TargetConfig) -> Vec<RegisterDescriptor> {
    if target.is_x64() {
        x64::registers(target)
    } else {
        arm64::registers()
    }
}

/// Full width names of the integer parameter registers in passing order.
pub fn parameter_registers(target: &TargetConfig) -> &'static [&'static str] {
    if target.is_x64() {
        x64::PARAMETER_REGISTERS
    } else {
        arm64::PARAMETER_REGISTERS
    }
}

/// Full width names of the decimal parameter registers in passing order.
pub fn decimal_parameter_registers(target: &TargetConfig) -> &'static [&'static str] {
    if target.is_x64() {
        x64::DECIMAL_PARAMETER_REGISTERS
    } else {
        arm64::DECIMAL_PARAMETER_REGISTERS
    }
}
