// This module drives a recorded function through the full lowering pipeline
// and renders the result as assembly text. The pipeline appends the implicit
// prologue and return, runs the simulate pass, the redirect pass and the
// build pass, then resolves the frame: callee saved registers are collected
// from the built parameters, stack variables, temporaries and explicit
// allocations receive their stack pointer relative offsets, and the prologue
// and epilogue lines are attached. Operand text referencing other values is
// captured right after each instruction builds, while its register choices
// are still current; frame relative operands carry no such references and
// render once the layout is known.

//! Function lowering pipeline and assembly rendering.

use hashbrown::HashMap;
use log::{debug, info};

use crate::core::error::{CompileError, CompileResult};
use crate::core::format::{Format, Size};
use crate::core::session::CompilationSession;
use crate::core::target::TargetConfig;
use crate::handle::{Constant, Handle, SectionModifier};
use crate::instruction::control;
use crate::instruction::{InstrId, Instruction, InstructionKind};
use crate::oracle;
use crate::register::flag;
use crate::scope::VariableId;
use crate::unit::Unit;

/// Stack pointer relative placement of everything the function spills.
pub struct FrameLayout {
    variable_offsets: HashMap<VariableId, i32>,
    allocation_offsets: HashMap<u32, i32>,
    temporary_offsets: HashMap<u32, i32>,
    /// Total bytes of local memory before alignment.
    pub local_memory: i32,
}

/// Lower one recorded function to its final assembly lines.
pub fn lower_function<'a>(unit: &mut Unit<'a>) -> CompileResult<Vec<String>> {
    info!("lowering {}", unit.function.name);

    ensure_initialize(unit);
    ensure_return(unit)?;

    unit.simulate_pass()?;
    oracle::run(unit)?;
    unit.build_pass()?;

    let save = saved_registers(unit);
    let layout = layout_frame(unit);
    let x64 = unit.target.is_x64();

    let frame = control::prologue(x64, &save, layout.local_memory);
    let epilogue = control::epilogue(x64, &save, frame.local_allocation);
    debug!(
        "{}: frame of {} local bytes, {} saved",
        unit.function.name, frame.local_allocation, save.len()
    );

    for index in 0..unit.order().len() {
        let id = unit.order()[index];
        if matches!(unit.instruction(id).kind, InstructionKind::Initialize) {
            unit.instruction_mut(id).operation = frame.lines.join("\n");
        } else if matches!(unit.instruction(id).kind, InstructionKind::Return { .. }) {
            unit.instruction_mut(id).operation = epilogue.join("\n");
        }
    }

    let mut lines = vec![
        format!(".global {}", unit.function.name),
        format!("{}:", unit.function.name),
    ];
    for index in 0..unit.order().len() {
        let id = unit.order()[index];
        lines.extend(render_instruction(unit, id, &layout)?);
    }
    Ok(lines)
}

/// Leading assembler directives for the target.
pub fn assembly_header(target: &TargetConfig) -> Vec<String> {
    let mut lines = Vec::new();
    if target.is_x64() {
        lines.push(".intel_syntax noprefix".to_string());
    }
    lines.push(".section .text".to_string());
    lines
}

/// Render the constants registered during lowering into a data section.
pub fn data_section<'a>(session: &CompilationSession<'a>) -> Vec<String> {
    let constants = session.constant_data();
    if constants.is_empty() {
        return Vec::new();
    }

    let mut lines = vec![".section .data".to_string()];
    for (identifier, constant) in constants {
        lines.push(format!("{}:", identifier));
        lines.push(format!("{} {}", Size::Qword.allocator(), constant.bits()));
    }
    lines
}

fn ensure_initialize<'a>(unit: &mut Unit<'a>) {
    let present = unit
        .order()
        .first()
        .map(|id| matches!(unit.instruction(*id).kind, InstructionKind::Initialize))
        .unwrap_or(false);
    if present {
        return;
    }

    let result = unit.new_value(Format::Int64);
    let id = InstrId(unit.instructions.len() as u32);
    unit.instructions
        .push(Instruction::new(InstructionKind::Initialize, result));
    unit.order.insert(0, id);
}

fn ensure_return<'a>(unit: &mut Unit<'a>) -> CompileResult<()> {
    let present = unit
        .order()
        .last()
        .map(|id| matches!(unit.instruction(*id).kind, InstructionKind::Return { .. }))
        .unwrap_or(false);
    if present {
        return Ok(());
    }

    let result = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::Return { value: None },
        result,
    ))?;
    Ok(())
}

/// Non-volatile registers the built function touches, in register order. On
/// AArch64 the link register joins the set as soon as the body calls.
fn saved_registers<'a>(unit: &Unit<'a>) -> Vec<String> {
    let mut used = vec![false; unit.registers.len()];

    for instruction in &unit.instructions {
        for parameter in &instruction.parameters {
            if let Some(handle) = &parameter.finalized {
                if let Some(reg) = handle.as_register() {
                    used[reg.index()] = true;
                }
            }
        }
        if let InstructionKind::Call { .. } = instruction.kind {
            for (index, register) in unit.registers.iter().enumerate() {
                if register.has_flag(flag::RETURN_ADDRESS) {
                    used[index] = true;
                }
            }
        }
    }

    let mut save = Vec::new();
    for (index, register) in unit.registers.iter().enumerate() {
        if !used[index] || register.is_volatile() || register.is_media() {
            continue;
        }
        if register.is_reserved() && !register.has_flag(flag::RETURN_ADDRESS) {
            continue;
        }
        save.push(register.full_name().to_string());
    }
    save
}

/// Assign stack pointer relative offsets: the outgoing argument overflow
/// zone sits at the bottom, then explicit allocations, variable homes and
/// temporary spill slots.
fn layout_frame<'a>(unit: &Unit<'a>) -> FrameLayout {
    let mut reserve = 0;
    let mut variables: Vec<VariableId> = Vec::new();
    let mut allocations: Vec<(u32, i32)> = Vec::new();
    let mut temporaries: Vec<u32> = Vec::new();

    let mut visit = |handle: &Handle<'a>| match handle {
        Handle::StackMemory {
            offset,
            absolute: true,
        } => {
            reserve = reserve.max(offset + 8);
        }
        Handle::StackVariable { variable, .. } => {
            if !variables.contains(variable) {
                variables.push(*variable);
            }
        }
        Handle::StackAllocation {
            identity, bytes, ..
        } => {
            if !allocations.iter().any(|(other, _)| other == identity) {
                allocations.push((*identity, *bytes));
            }
        }
        Handle::TemporaryMemory { identity, .. } => {
            if !temporaries.contains(identity) {
                temporaries.push(*identity);
            }
        }
        _ => {}
    };

    for instruction in &unit.instructions {
        for parameter in &instruction.parameters {
            if let Some(handle) = &parameter.finalized {
                visit(handle);
            }
        }
        match &instruction.kind {
            InstructionKind::Call { destinations, .. }
            | InstructionKind::Reorder { destinations, .. } => {
                for destination in destinations {
                    visit(destination);
                }
            }
            _ => {}
        }
    }
    for slot in unit.slots.iter() {
        visit(&slot.handle);
    }

    let mut cursor = round_up(reserve, 8);

    let mut allocation_offsets = HashMap::new();
    allocations.sort_by_key(|(identity, _)| *identity);
    for (identity, bytes) in allocations {
        allocation_offsets.insert(identity, cursor);
        cursor += round_up(bytes.max(8), 8);
    }

    let mut variable_offsets = HashMap::new();
    variables.sort_by_key(|variable| variable.0);
    for variable in variables {
        variable_offsets.insert(variable, cursor);
        cursor += 8;
    }

    let mut temporary_offsets = HashMap::new();
    temporaries.sort();
    for identity in temporaries {
        temporary_offsets.insert(identity, cursor);
        cursor += 8;
    }

    FrameLayout {
        variable_offsets,
        allocation_offsets,
        temporary_offsets,
        local_memory: cursor,
    }
}

fn round_up(value: i32, alignment: i32) -> i32 {
    (value + alignment - 1) / alignment * alignment
}

/// Capture operand text for handles that reference other values, resolving
/// their registers while the allocation state still matches the instruction.
pub(crate) fn capture_operands<'a>(unit: &mut Unit<'a>, id: InstrId) {
    let parameters = unit.instruction(id).parameters.clone();
    let mut captured = Vec::with_capacity(parameters.len());

    for parameter in &parameters {
        let text = match &parameter.finalized {
            Some(handle) if !handle.inner_values().is_empty() => {
                render_referencing(unit, handle, parameter.size)
            }
            _ => None,
        };
        captured.push(text);
    }
    unit.instruction_mut(id).captured = captured;
}

fn render_instruction<'a>(
    unit: &Unit<'a>,
    id: InstrId,
    layout: &FrameLayout,
) -> CompileResult<Vec<String>> {
    let instruction = unit.instruction(id);

    let mut operands: Vec<String> = Vec::new();
    for (index, parameter) in instruction.parameters.iter().enumerate() {
        if parameter.is_hidden() {
            continue;
        }
        let captured = instruction.captured.get(index).and_then(|c| c.clone());
        let text = match captured {
            Some(text) => text,
            None => {
                let handle = parameter.finalized.as_ref().ok_or_else(|| {
                    CompileError::CodeGeneration {
                        reason: format!("unfinalized operand in {}", instruction.operation),
                    }
                })?;
                render_handle(unit, handle, parameter.size, layout)?
            }
        };
        operands.push(text);
    }

    if instruction.operation.is_empty() {
        return Ok(Vec::new());
    }
    if operands.is_empty() {
        return Ok(instruction.operation.split('\n').map(str::to_string).collect());
    }
    Ok(vec![format!(
        "{} {}",
        instruction.operation,
        operands.join(", ")
    )])
}

/// Final operand text for a handle with no value references. Frame relative
/// forms resolve against the computed layout.
fn render_handle<'a>(
    unit: &Unit<'a>,
    handle: &Handle<'a>,
    size: Size,
    layout: &FrameLayout,
) -> CompileResult<String> {
    let x64 = unit.target.is_x64();

    match handle {
        Handle::Register(reg) => Ok(unit.registers[reg.index()].name(size).to_string()),

        Handle::Constant(Constant::Integer(value)) => {
            if x64 {
                Ok(value.to_string())
            } else {
                Ok(format!("#{}", value))
            }
        }

        Handle::StackVariable { variable, offset } => {
            let base = layout.variable_offsets.get(variable).copied().unwrap_or(0);
            Ok(frame_operand(x64, base + offset, size))
        }

        Handle::StackMemory { offset, .. } => Ok(frame_operand(x64, *offset, size)),

        Handle::TemporaryMemory { identity, offset } => {
            let base = layout.temporary_offsets.get(identity).copied().unwrap_or(0);
            Ok(frame_operand(x64, base + offset, size))
        }

        Handle::StackAllocation {
            identity, offset, ..
        } => {
            let base = layout.allocation_offsets.get(identity).copied().unwrap_or(0);
            Ok(frame_operand(x64, base + offset, size))
        }

        Handle::DataSection {
            symbol,
            address,
            modifier,
            offset,
        } => Ok(render_section(x64, symbol, *address, *modifier, *offset, size)),

        Handle::ConstantData { value } => {
            let identifier = unit
                .session
                .constant_identifier(unit.function.name, value);
            if x64 {
                Ok(format!("{} [rip+{}]", size.access_modifier(), identifier))
            } else {
                Ok(identifier.to_string())
            }
        }

        // Reference carrying handles are normally captured at build time.
        Handle::Memory { .. } | Handle::ComplexMemory { .. } | Handle::Expression { .. } => {
            render_referencing(unit, handle, size).ok_or_else(|| CompileError::CodeGeneration {
                reason: "memory operand lost its address register".to_string(),
            })
        }

        Handle::None | Handle::Constant(Constant::Decimal(_)) | Handle::Pack { .. } => {
            Err(CompileError::CodeGeneration {
                reason: format!("handle {:?} can not appear as an operand", handle),
            })
        }
    }
}

fn render_section(
    x64: bool,
    symbol: &str,
    address: bool,
    modifier: SectionModifier,
    offset: i32,
    size: Size,
) -> String {
    if x64 {
        let inner = if offset != 0 {
            format!("[rip+{}{:+}]", symbol, offset)
        } else {
            format!("[rip+{}]", symbol)
        };
        if address {
            inner
        } else {
            format!("{} {}", size.access_modifier(), inner)
        }
    } else {
        match modifier {
            SectionModifier::Page => symbol.to_string(),
            SectionModifier::Lower12Bits => format!(":lo12:{}", symbol),
            SectionModifier::None => symbol.to_string(),
        }
    }
}

/// Render a handle whose address is built from other values, resolving their
/// registers from the current allocation state.
fn render_referencing<'a>(unit: &Unit<'a>, handle: &Handle<'a>, size: Size) -> Option<String> {
    let x64 = unit.target.is_x64();
    let name = |value| {
        let reg = unit.register_of(value)?;
        Some(unit.registers[reg.index()].name(Size::Qword).to_string())
    };

    match handle {
        Handle::Memory { base, offset } => {
            let base = name(*base)?;
            if x64 {
                Some(format!(
                    "{} [{}{}]",
                    size.access_modifier(),
                    base,
                    signed_offset(*offset)
                ))
            } else if *offset != 0 {
                Some(format!("[{}, #{}]", base, offset))
            } else {
                Some(format!("[{}]", base))
            }
        }

        Handle::ComplexMemory {
            base,
            index,
            stride,
            displacement,
        } => {
            let base = name(*base)?;
            let index = name(*index)?;
            if x64 {
                let mut inner = format!("{}+{}", base, index);
                if *stride > 1 {
                    inner = format!("{}+{}*{}", base, index, stride);
                }
                Some(format!(
                    "{} [{}{}]",
                    size.access_modifier(),
                    inner,
                    signed_offset(*displacement)
                ))
            } else if *stride > 1 {
                Some(format!(
                    "[{}, {}, lsl #{}]",
                    base,
                    index,
                    stride.trailing_zeros()
                ))
            } else {
                Some(format!("[{}, {}]", base, index))
            }
        }

        Handle::Expression {
            base,
            index,
            stride,
            displacement,
        } => {
            if x64 {
                let mut parts: Vec<String> = Vec::new();
                if let Some(base) = base {
                    parts.push(name(*base)?);
                }
                if let Some(index) = index {
                    let index = name(*index)?;
                    if *stride > 1 {
                        parts.push(format!("{}*{}", index, stride));
                    } else {
                        parts.push(index);
                    }
                }
                if parts.is_empty() {
                    return Some(format!("[{}]", displacement));
                }
                Some(format!(
                    "[{}{}]",
                    parts.join("+"),
                    signed_offset(*displacement)
                ))
            } else {
                let base = name((*base)?)?;
                if let Some(index) = index {
                    let index = name(*index)?;
                    if *stride > 1 {
                        Some(format!("{}, {}, lsl #{}", base, index, stride.trailing_zeros()))
                    } else {
                        Some(format!("{}, {}", base, index))
                    }
                } else {
                    Some(format!("{}, #{}", base, displacement))
                }
            }
        }

        _ => None,
    }
}

fn signed_offset(offset: i32) -> String {
    if offset == 0 {
        String::new()
    } else {
        format!("{:+}", offset)
    }
}

fn frame_operand(x64: bool, offset: i32, size: Size) -> String {
    if x64 {
        if offset != 0 {
            format!("{} [rsp{:+}]", size.access_modifier(), offset)
        } else {
            format!("{} [rsp]", size.access_modifier())
        }
    } else if offset != 0 {
        format!("[sp, #{}]", offset)
    } else {
        "[sp]".to_string()
    }
}
