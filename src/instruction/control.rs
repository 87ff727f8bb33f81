// This module builds control transfer: conditional and unconditional jumps,
// label marks, returns and debug line markers, plus the prologue and epilogue
// the translator completes once register use and local memory are known. The
// x86-64 prologue pushes each saved register individually and pads the local
// allocation so the frame stays 16 byte aligned counting the implicit return
// address push. The AArch64 prologue packs saved registers into stp pairs
// with pre index writeback and restores them with ldp post index.

//! Control flow lowering and frame construction.

use crate::arch;
use crate::core::error::CompileResult;
use crate::handle::Handle;
use crate::instruction::{flags, Condition, InstrId, Parameter};
use crate::memory;
use crate::unit::Unit;
use crate::value::ValueId;

/// Place each incoming parameter value in its convention register. Overflow
/// parameters keep their stack variable homes.
pub fn build_initialize<'a>(unit: &mut Unit<'a>) -> CompileResult<()> {
    let integer_names = arch::parameter_registers(&unit.target);
    let decimal_names = arch::decimal_parameter_registers(&unit.target);
    let mut integer = 0;
    let mut decimal = 0;

    for index in 0..unit.function.parameters.len() {
        let variable = unit.function.parameters[index];
        let value = match unit.parameter_value(variable) {
            Some(value) => value,
            None => continue,
        };
        let media = unit.format(value).is_decimal();
        let names = if media { decimal_names } else { integer_names };
        let next = if media { &mut decimal } else { &mut integer };
        if *next >= names.len() {
            continue;
        }
        let reg = unit.register_by_name(names[*next])?;
        *next += 1;
        unit.set_handle(value, Handle::Register(reg));
        unit.registers[reg.index()].occupant = Some(value);
    }
    Ok(())
}

/// Branch mnemonic for the condition on the given target. Unsigned
/// comparisons pick the carry based forms.
pub fn jump_operation(x64: bool, condition: Option<Condition>, signed: bool) -> &'static str {
    if x64 {
        match (condition, signed) {
            (None, _) => "jmp",
            (Some(Condition::Equal), _) => "je",
            (Some(Condition::NotEqual), _) => "jne",
            (Some(Condition::Greater), true) => "jg",
            (Some(Condition::Greater), false) => "ja",
            (Some(Condition::GreaterOrEqual), true) => "jge",
            (Some(Condition::GreaterOrEqual), false) => "jae",
            (Some(Condition::Less), true) => "jl",
            (Some(Condition::Less), false) => "jb",
            (Some(Condition::LessOrEqual), true) => "jle",
            (Some(Condition::LessOrEqual), false) => "jbe",
        }
    } else {
        match (condition, signed) {
            (None, _) => "b",
            (Some(Condition::Equal), _) => "b.eq",
            (Some(Condition::NotEqual), _) => "b.ne",
            (Some(Condition::Greater), true) => "b.gt",
            (Some(Condition::Greater), false) => "b.hi",
            (Some(Condition::GreaterOrEqual), true) => "b.ge",
            (Some(Condition::GreaterOrEqual), false) => "b.hs",
            (Some(Condition::Less), true) => "b.lt",
            (Some(Condition::Less), false) => "b.lo",
            (Some(Condition::LessOrEqual), true) => "b.le",
            (Some(Condition::LessOrEqual), false) => "b.ls",
        }
    }
}

pub fn build_jump<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    label: &'a str,
    condition: Option<Condition>,
    signed: bool,
) -> CompileResult<()> {
    let operation = jump_operation(unit.target.is_x64(), condition, signed);
    let instruction = unit.instruction_mut(id);
    instruction.operation = format!("{} {}", operation, label);
    instruction.built = true;
    Ok(())
}

pub fn build_label_mark<'a>(unit: &mut Unit<'a>, id: InstrId, label: &'a str) -> CompileResult<()> {
    let instruction = unit.instruction_mut(id);
    instruction.operation = format!("{}:", label);
    instruction.built = true;
    Ok(())
}

/// Stage the returned value into the return register. The epilogue text is
/// attached by the translator once the frame is known.
pub fn build_return<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    value: Option<ValueId>,
) -> CompileResult<()> {
    let mut parameters = Vec::new();

    if let Some(value) = value {
        let media = unit.format(value).is_decimal();
        let reg = unit.return_register(media)?;
        if unit.register_of(value) != Some(reg) {
            memory::clear_register(unit, reg)?;
            memory::relocate(unit, value, Handle::Register(reg))?;
            unit.registers[reg.index()].occupant = Some(value);
        }
        let size = crate::core::format::Size::from_bytes(unit.format(value).bytes());
        parameters.push(Parameter {
            value,
            flags: flags::READS | flags::HIDDEN,
            size,
            finalized: Some(Handle::Register(reg)),
        });
    }

    let instruction = unit.instruction_mut(id);
    instruction.parameters = parameters;
    instruction.built = true;
    Ok(())
}

pub fn build_debug_position<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    line: u32,
    column: u32,
) -> CompileResult<()> {
    let annotate = unit.target.debug_info;
    let instruction = unit.instruction_mut(id);
    if annotate {
        instruction.operation = format!(".loc 1 {} {}", line, column);
    }
    instruction.built = true;
    Ok(())
}

/// Frame construction result handed back to the translator.
pub struct FrameInfo {
    pub lines: Vec<String>,
    /// Bytes subtracted from the stack pointer for locals and padding.
    pub local_allocation: i32,
    /// Bytes consumed by saved registers, return address included on x86-64.
    pub saved_bytes: i32,
}

fn round_up(value: i32, alignment: i32) -> i32 {
    (value + alignment - 1) / alignment * alignment
}

/// Build the prologue lines for the function.
pub fn prologue(x64: bool, save: &[String], local_memory: i32) -> FrameInfo {
    let mut lines = Vec::new();

    if x64 {
        for name in save {
            lines.push(format!("push {}", name));
        }
        // The call pushed the return address, so the frame starts 8 bytes
        // past alignment.
        let saved_bytes = 8 * save.len() as i32 + 8;
        let local_allocation = round_up(local_memory + saved_bytes, 16) - saved_bytes;
        if local_allocation > 0 {
            lines.push(format!("sub rsp, {}", local_allocation));
        }
        return FrameInfo {
            lines,
            local_allocation,
            saved_bytes,
        };
    }

    let mut index = 0;
    while index + 1 < save.len() {
        lines.push(format!(
            "stp {}, {}, [sp, #-16]!",
            save[index],
            save[index + 1]
        ));
        index += 2;
    }
    if index < save.len() {
        lines.push(format!("str {}, [sp, #-16]!", save[index]));
    }
    let saved_bytes = 16 * ((save.len() as i32 + 1) / 2);
    let local_allocation = round_up(local_memory, 16);
    if local_allocation > 0 {
        lines.push(format!("sub sp, sp, #{}", local_allocation));
    }
    FrameInfo {
        lines,
        local_allocation,
        saved_bytes,
    }
}

/// Build the epilogue lines mirroring the prologue.
pub fn epilogue(x64: bool, save: &[String], local_allocation: i32) -> Vec<String> {
    let mut lines = Vec::new();

    if x64 {
        if local_allocation > 0 {
            lines.push(format!("add rsp, {}", local_allocation));
        }
        for name in save.iter().rev() {
            lines.push(format!("pop {}", name));
        }
        lines.push("ret".to_string());
        return lines;
    }

    if local_allocation > 0 {
        lines.push(format!("add sp, sp, #{}", local_allocation));
    }
    let mut pairs = Vec::new();
    let mut index = 0;
    while index + 1 < save.len() {
        pairs.push(format!(
            "ldp {}, {}, [sp], #16",
            save[index],
            save[index + 1]
        ));
        index += 2;
    }
    if index < save.len() {
        pairs.push(format!("ldr {}, [sp], #16", save[index]));
    }
    pairs.reverse();
    lines.extend(pairs);
    lines.push("ret".to_string());
    lines
}
