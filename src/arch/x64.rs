// This module describes the x86-64 register file under the System V calling
// convention. The ordering of the table matters: the allocator walks it in
// order, so the volatile scratch registers appear where the original register
// preference placed them. rbp is reserved only when debug information requires
// a frame base pointer; otherwise it is allocatable as a non-volatile register.

//! x86-64 register table and calling convention.

use crate::core::target::TargetConfig;
use crate::register::{flag, RegisterDescriptor};

/// Integer parameter registers in passing order.
pub const PARAMETER_REGISTERS: &[&str] = &["rdi", "rsi", "rdx", "rcx", "r8", "r9"];

/// Decimal parameter registers in passing order.
pub const DECIMAL_PARAMETER_REGISTERS: &[&str] = &[
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7",
];

pub fn registers(target: &TargetConfig) -> Vec<RegisterDescriptor> {
    let base_pointer_flags = if target.debug_info {
        flag::BASE_POINTER | flag::RESERVED
    } else {
        flag::BASE_POINTER
    };

    let mut table = vec![
        RegisterDescriptor::new(
            ["rax", "eax", "ax", "al"],
            flag::VOLATILE | flag::RETURN | flag::NUMERATOR,
        ),
        RegisterDescriptor::new(["rbx", "ebx", "bx", "bl"], 0),
        RegisterDescriptor::new(["rcx", "ecx", "cx", "cl"], flag::VOLATILE | flag::SHIFT),
        RegisterDescriptor::new(
            ["rdx", "edx", "dx", "dl"],
            flag::VOLATILE | flag::REMAINDER,
        ),
        RegisterDescriptor::new(["rsi", "esi", "si", "sil"], flag::VOLATILE),
        RegisterDescriptor::new(["rdi", "edi", "di", "dil"], flag::VOLATILE),
        RegisterDescriptor::new(["rbp", "ebp", "bp", "bpl"], base_pointer_flags),
        RegisterDescriptor::new(
            ["rsp", "esp", "sp", "spl"],
            flag::RESERVED | flag::STACK_POINTER,
        ),
    ];

    for index in 0..16u8 {
        let names = media_names(index);
        let mut flags = flag::MEDIA | flag::VOLATILE;
        if index == 0 {
            flags |= flag::DECIMAL_RETURN;
        }
        table.push(RegisterDescriptor::new(names, flags));
    }

    table.push(RegisterDescriptor::new(
        ["r8", "r8d", "r8w", "r8b"],
        flag::VOLATILE,
    ));
    table.push(RegisterDescriptor::new(
        ["r9", "r9d", "r9w", "r9b"],
        flag::VOLATILE,
    ));
    table.push(RegisterDescriptor::new(
        ["r10", "r10d", "r10w", "r10b"],
        flag::VOLATILE,
    ));
    table.push(RegisterDescriptor::new(
        ["r11", "r11d", "r11w", "r11b"],
        flag::VOLATILE,
    ));
    table.push(RegisterDescriptor::new(["r12", "r12d", "r12w", "r12b"], 0));
    table.push(RegisterDescriptor::new(["r13", "r13d", "r13w", "r13b"], 0));
    table.push(RegisterDescriptor::new(["r14", "r14d", "r14w", "r14b"], 0));
    table.push(RegisterDescriptor::new(["r15", "r15d", "r15w", "r15b"], 0));

    table
}

fn media_names(index: u8) -> [&'static str; 4] {
    const NAMES: [&str; 16] = [
        "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
        "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
    ];
    let name = NAMES[index as usize];
    [name, name, name, name]
}
