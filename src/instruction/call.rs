// This module builds calls and the surrounding traffic. Arguments are staged
// by a reorder that resolves all argument moves as one clobber safe group.
// Before the transfer an evacuation walks the volatile registers and moves
// every occupant that outlives the call into a non-volatile register when one
// is free, otherwise out to stack memory; afterwards a validation pass
// confirms no live value remains in a volatile register. The call itself
// locks its destination registers while building, resets the volatile
// registers afterwards and binds its result to the return register.

//! Call lowering, argument reordering and register evacuation.

use log::{debug, warn};

use crate::arch;
use crate::core::error::{CompileError, CompileResult};
use crate::core::format::{Format, Size};
use crate::handle::Handle;
use crate::instruction::{flags, Callee, InstrId, Instruction, InstructionKind, Parameter};
use crate::memory;
use crate::register::Reg;
use crate::unit::Unit;
use crate::value::ValueId;

/// Stage a call: a reorder moves the arguments into their convention slots,
/// an evacuation clears the volatile registers and the call transfers.
/// Returns the call instruction whose result carries the returned value.
pub fn call_with_arguments<'a>(
    unit: &mut Unit<'a>,
    function: &'a str,
    arguments: Vec<ValueId>,
    return_format: Option<Format>,
) -> CompileResult<InstrId> {
    stage_call(unit, Callee::Symbol(function), arguments, return_format)
}

/// Call through a computed function value, for function pointers and
/// loaded virtual entries.
pub fn call_value_with_arguments<'a>(
    unit: &mut Unit<'a>,
    function: ValueId,
    arguments: Vec<ValueId>,
    return_format: Option<Format>,
) -> CompileResult<InstrId> {
    stage_call(unit, Callee::Value(function), arguments, return_format)
}

/// Call a function returning a decomposed aggregate. The returned member
/// values are bound to the convention's return layout when the call builds.
pub fn call_returning_pack<'a>(
    unit: &mut Unit<'a>,
    function: &'a str,
    arguments: Vec<ValueId>,
    member_formats: &[Format],
) -> CompileResult<(InstrId, Vec<ValueId>)> {
    let members: Vec<ValueId> = member_formats
        .iter()
        .map(|format| unit.new_value(*format))
        .collect();
    let id = stage_call(unit, Callee::Symbol(function), arguments, None)?;
    let result = unit.instruction(id).result;
    unit.set_handle(
        result,
        Handle::Pack {
            members: members.clone(),
        },
    );
    Ok((id, members))
}

fn stage_call<'a>(
    unit: &mut Unit<'a>,
    callee: Callee<'a>,
    arguments: Vec<ValueId>,
    return_format: Option<Format>,
) -> CompileResult<InstrId> {
    let destinations = argument_destinations(unit, &arguments)?;

    let reorder_result = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::Reorder {
            destinations: destinations.clone(),
            sources: arguments,
        },
        reorder_result,
    ))?;

    let evacuate_result = unit.new_value(Format::Int64);
    unit.add(Instruction::new(InstructionKind::Evacuate, evacuate_result))?;

    let call_result = unit.new_value(return_format.unwrap_or(Format::Int64));
    unit.add(Instruction::new(
        InstructionKind::Call {
            callee,
            destinations,
            return_format,
        },
        call_result,
    ))
}

/// The convention slot of each argument: integer and decimal register
/// sequences first, stack memory beyond them.
fn argument_destinations<'a>(
    unit: &Unit<'a>,
    arguments: &[ValueId],
) -> CompileResult<Vec<Handle<'a>>> {
    let integer_names = arch::parameter_registers(&unit.target);
    let decimal_names = arch::decimal_parameter_registers(&unit.target);

    let mut destinations = Vec::with_capacity(arguments.len());
    let mut integers = 0;
    let mut decimals = 0;
    let mut stack_offset = 0;

    for argument in arguments {
        let decimal = unit.format(*argument).is_decimal();
        let names = if decimal { decimal_names } else { integer_names };
        let position = if decimal { &mut decimals } else { &mut integers };

        if *position < names.len() {
            let reg = unit.register_by_name(names[*position])?;
            *position += 1;
            destinations.push(Handle::Register(reg));
        } else {
            destinations.push(Handle::StackMemory {
                offset: stack_offset,
                absolute: true,
            });
            stack_offset += 8;
        }
    }
    Ok(destinations)
}

pub fn build_reorder<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    destinations: Vec<Handle<'a>>,
    sources: Vec<ValueId>,
) -> CompileResult<()> {
    let moves: Vec<(ValueId, Handle<'a>)> =
        sources.into_iter().zip(destinations.into_iter()).collect();
    memory::align(unit, moves)?;
    unit.instruction_mut(id).built = true;
    Ok(())
}

/// Move every volatile occupant that outlives this position out of harm's
/// way, then confirm the volatile registers carry nothing live.
pub fn build_evacuate<'a>(unit: &mut Unit<'a>, id: InstrId) -> CompileResult<()> {
    let position = unit.position;

    for index in 0..unit.registers.len() {
        let reg = Reg(index as u8);
        let register = &unit.registers[index];
        if !register.is_volatile() || register.is_reserved() {
            continue;
        }
        let occupant = match register.occupant {
            Some(occupant) => occupant,
            None => continue,
        };
        if unit.handle(occupant) != Handle::Register(reg)
            || !unit.is_used_after(occupant, position)
        {
            continue;
        }

        let media = register.is_media();
        if let Some(shelter) = available_non_volatile(unit, media) {
            debug!(
                "evacuating {} into {}",
                unit.registers[index].full_name(),
                unit.registers[shelter.index()].full_name()
            );
            unit.session.record_eviction();
            memory::relocate(unit, occupant, Handle::Register(shelter))?;
            unit.registers[shelter.index()].occupant = Some(occupant);
            unit.registers[index].occupant = None;
        } else {
            warn!(
                "no callee saved register free, {} spills to memory across the call",
                unit.registers[index].full_name()
            );
            unit.release(reg)?;
        }
    }

    validate_evacuation(unit, position)?;
    unit.instruction_mut(id).built = true;
    Ok(())
}

fn available_non_volatile<'a>(unit: &Unit<'a>, media: bool) -> Option<Reg> {
    for index in 0..unit.registers.len() {
        let reg = Reg(index as u8);
        let register = &unit.registers[index];
        if !register.is_volatile()
            && register.is_media() == media
            && unit.is_register_available(reg, unit.position)
        {
            return Some(reg);
        }
    }
    None
}

fn validate_evacuation<'a>(unit: &Unit<'a>, position: i32) -> CompileResult<()> {
    for index in 0..unit.registers.len() {
        let register = &unit.registers[index];
        if !register.is_volatile() || register.is_reserved() {
            continue;
        }
        if let Some(occupant) = register.occupant {
            if unit.handle(occupant) == Handle::Register(Reg(index as u8))
                && unit.is_used_after(occupant, position)
            {
                return Err(CompileError::EvacuationFailed);
            }
        }
    }
    Ok(())
}

pub fn build_call<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    callee: Callee<'a>,
    destinations: Vec<Handle<'a>>,
    return_format: Option<Format>,
) -> CompileResult<()> {
    let mut locked = Vec::new();
    for destination in &destinations {
        locked.extend(unit.lock_handle(destination));
    }

    match callee {
        Callee::Symbol(function) => {
            let operation = if unit.target.is_x64() { "call" } else { "bl" };
            let instruction = unit.instruction_mut(id);
            instruction.operation = format!("{} {}", operation, function);
            instruction.built = true;
        }
        Callee::Value(function) => {
            let handle = unit.handle(function);
            let operand = if unit.target.is_x64() && handle.is_memory() {
                locked.extend(secure_memory_callee(unit, function)?);
                unit.handle(function)
            } else {
                // A register transfer target; AArch64 has no memory form.
                let operand = memory::move_to_register(unit, function, false, Size::Qword)?;
                locked.extend(unit.lock_handle(&operand));
                operand
            };

            let operation = if unit.target.is_x64() { "call" } else { "blr" };
            let instruction = unit.instruction_mut(id);
            instruction.operation = operation.to_string();
            instruction.parameters = vec![Parameter {
                value: function,
                flags: flags::READS,
                size: Size::Qword,
                finalized: Some(operand),
            }];
            instruction.built = true;
        }
    }

    unit.unlock_all(&locked);

    // The callee may clobber every volatile register.
    unit.reset_volatile_registers();

    let result = unit.instruction(id).result;
    if let Handle::Pack { members } = unit.handle(result) {
        bind_pack_return(unit, &members)?;
    } else if let Some(format) = return_format {
        unit.set_format(result, format);
        let reg = unit.return_register(format.is_decimal())?;
        unit.occupy(reg, result);
    }
    Ok(())
}

/// Keep a memory resident callee operand usable through the transfer. Inner
/// address registers that have to outlive the call move to callee saved
/// registers; short lived ones only need to survive argument staging, so any
/// register does.
fn secure_memory_callee<'a>(unit: &mut Unit<'a>, function: ValueId) -> CompileResult<Vec<Reg>> {
    let position = unit.position;
    let handle = unit.handle(function);
    let callee_lives_on = unit.is_used_after(function, position);
    let mut locked = Vec::new();

    for inner in handle.inner_values() {
        let lives_on = callee_lives_on || unit.is_used_after(inner, position);
        match unit.register_of(inner) {
            Some(reg) if !(lives_on && unit.register(reg).is_volatile()) => {
                unit.lock_register(reg);
                locked.push(reg);
            }
            _ => {
                let reg = if lives_on {
                    unit.next_non_volatile_register(false, &locked)?
                } else {
                    unit.next_register(false, &locked)?
                };
                memory::relocate(unit, inner, Handle::Register(reg))?;
                unit.registers[reg.index()].occupant = Some(inner);
                unit.lock_register(reg);
                locked.push(reg);
            }
        }
    }
    Ok(locked)
}

/// Bind the members of a decomposed aggregate return to the convention's
/// return layout: the parameter register sequences first, stack positions
/// beyond them. Nested packs flatten in declaration order.
fn bind_pack_return<'a>(unit: &mut Unit<'a>, members: &[ValueId]) -> CompileResult<()> {
    let integer_names = arch::parameter_registers(&unit.target);
    let decimal_names = arch::decimal_parameter_registers(&unit.target);
    let mut integers = 0;
    let mut decimals = 0;
    let mut offset = 0;

    let mut queue: Vec<ValueId> = members.to_vec();
    let mut index = 0;
    while index < queue.len() {
        let member = queue[index];
        index += 1;

        if let Handle::Pack { members: inner } = unit.handle(member) {
            for (ahead, value) in inner.into_iter().enumerate() {
                queue.insert(index + ahead, value);
            }
            continue;
        }

        let decimal = unit.format(member).is_decimal();
        let names = if decimal { decimal_names } else { integer_names };
        let counter = if decimal { &mut decimals } else { &mut integers };

        if *counter < names.len() {
            let reg = unit.register_by_name(names[*counter])?;
            *counter += 1;
            unit.occupy(reg, member);
        } else {
            unit.set_handle(
                member,
                Handle::StackMemory {
                    offset,
                    absolute: true,
                },
            );
            offset += 8;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::CompilationSession;
    use crate::core::target::TargetConfig;
    use crate::unit::{FunctionSignature, Unit, UnitMode};
    use bumpalo::Bump;

    fn unit<'a>(session: &'a CompilationSession<'a>, target: TargetConfig) -> Unit<'a> {
        Unit::new(
            session,
            target,
            FunctionSignature {
                name: session.intern("sample"),
                parameters: Vec::new(),
                return_format: None,
            },
        )
    }

    #[test]
    fn arguments_map_onto_the_convention_slots() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session, TargetConfig::x64());

        let a = unit.new_value(Format::Int64);
        let b = unit.new_value(Format::Decimal);
        let c = unit.new_value(Format::Int64);

        let destinations = argument_destinations(&unit, &[a, b, c]).unwrap();

        let rdi = unit.register_by_name("rdi").unwrap();
        let xmm0 = unit.register_by_name("xmm0").unwrap();
        let rsi = unit.register_by_name("rsi").unwrap();
        assert_eq!(
            destinations,
            vec![
                Handle::Register(rdi),
                Handle::Register(xmm0),
                Handle::Register(rsi),
            ]
        );
    }

    #[test]
    fn overflowing_arguments_spill_to_the_stack_zone() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session, TargetConfig::x64());

        let arguments: Vec<ValueId> =
            (0..8).map(|_| unit.new_value(Format::Int64)).collect();
        let destinations = argument_destinations(&unit, &arguments).unwrap();

        assert!(destinations[5].is_register());
        assert_eq!(
            destinations[6],
            Handle::StackMemory {
                offset: 0,
                absolute: true
            }
        );
        assert_eq!(
            destinations[7],
            Handle::StackMemory {
                offset: 8,
                absolute: true
            }
        );
    }

    #[test]
    fn evacuation_moves_live_values_out_of_volatile_registers() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session, TargetConfig::x64());

        let value = unit.new_value(Format::Int64);
        let rsi = unit.register_by_name("rsi").unwrap();
        unit.occupy(rsi, value);
        unit.use_value_at(value, 0);
        unit.use_value_at(value, 10);
        unit.position = 1;

        let result = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(InstructionKind::Evacuate, result))
            .unwrap();
        unit.mode = UnitMode::Build;
        crate::instruction::build_one(&mut unit, id).unwrap();
        unit.mode = UnitMode::Default;

        // The value now lives in a non-volatile register and no volatile
        // register carries anything live.
        let home = unit.register_of(value).unwrap();
        assert!(!unit.register(home).is_volatile());
        assert!(validate_evacuation(&unit, 1).is_ok());
        assert_eq!(session.stats().registers_evicted, 1);
    }

    #[test]
    fn calls_through_a_function_value_use_a_register_operand() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session, TargetConfig::x64());

        let pointer = unit.new_value(Format::Int64);
        let rbx = unit.register_by_name("rbx").unwrap();
        unit.occupy(rbx, pointer);

        let result = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::Call {
                    callee: Callee::Value(pointer),
                    destinations: Vec::new(),
                    return_format: None,
                },
                result,
            ))
            .unwrap();
        unit.mode = UnitMode::Build;
        crate::instruction::build_one(&mut unit, id).unwrap();
        unit.mode = UnitMode::Default;

        let built = unit.instruction(id);
        assert_eq!(built.operation, "call");
        assert_eq!(built.parameters[0].finalized, Some(Handle::Register(rbx)));
    }

    #[test]
    fn arm64_calls_a_function_value_with_a_register_branch() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session, TargetConfig::arm64());

        let pointer = unit.new_value(Format::Int64);
        let x19 = unit.register_by_name("x19").unwrap();
        unit.occupy(x19, pointer);

        let result = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::Call {
                    callee: Callee::Value(pointer),
                    destinations: Vec::new(),
                    return_format: None,
                },
                result,
            ))
            .unwrap();
        unit.mode = UnitMode::Build;
        crate::instruction::build_one(&mut unit, id).unwrap();
        unit.mode = UnitMode::Default;

        let built = unit.instruction(id);
        assert_eq!(built.operation, "blr");
        assert_eq!(built.parameters[0].finalized, Some(Handle::Register(x19)));
    }

    #[test]
    fn memory_callee_addresses_move_to_callee_saved_registers() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session, TargetConfig::x64());

        // The base register is volatile and the address is needed again
        // after the call.
        let base = unit.new_value(Format::Int64);
        let rsi = unit.register_by_name("rsi").unwrap();
        unit.occupy(rsi, base);
        unit.use_value_at(base, 0);
        unit.use_value_at(base, 10);
        unit.position = 1;

        let pointer = unit.new_value(Format::Int64);
        unit.set_handle(pointer, Handle::Memory { base, offset: 0 });

        let result = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::Call {
                    callee: Callee::Value(pointer),
                    destinations: Vec::new(),
                    return_format: None,
                },
                result,
            ))
            .unwrap();
        unit.mode = UnitMode::Build;
        crate::instruction::build_one(&mut unit, id).unwrap();
        unit.mode = UnitMode::Default;

        assert_eq!(unit.instruction(id).operation, "call");
        let home = unit.register_of(base).unwrap();
        assert!(!unit.register(home).is_volatile());
    }

    #[test]
    fn pack_returns_bind_member_by_member() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session, TargetConfig::x64());

        let (_, members) = call_returning_pack(
            &mut unit,
            session.intern("make_pair"),
            Vec::new(),
            &[Format::Int64, Format::Decimal, Format::Int64],
        )
        .unwrap();
        unit.build_pass().unwrap();

        let rdi = unit.register_by_name("rdi").unwrap();
        let xmm0 = unit.register_by_name("xmm0").unwrap();
        let rsi = unit.register_by_name("rsi").unwrap();
        assert_eq!(unit.register_of(members[0]), Some(rdi));
        assert_eq!(unit.register_of(members[1]), Some(xmm0));
        assert_eq!(unit.register_of(members[2]), Some(rsi));
    }

    #[test]
    fn call_resets_volatile_registers_and_binds_the_return() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session, TargetConfig::x64());

        let stale = unit.new_value(Format::Int64);
        let rsi = unit.register_by_name("rsi").unwrap();
        unit.occupy(rsi, stale);

        let result = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::Call {
                    callee: Callee::Symbol(session.intern("callee")),
                    destinations: Vec::new(),
                    return_format: Some(Format::Int64),
                },
                result,
            ))
            .unwrap();
        unit.mode = UnitMode::Build;
        crate::instruction::build_one(&mut unit, id).unwrap();
        unit.mode = UnitMode::Default;

        assert_eq!(unit.instruction(id).operation, "call callee");
        assert!(unit.handle(stale).is_none());

        let rax = unit.return_register(false).unwrap();
        assert_eq!(unit.register_of(result), Some(rax));
    }
}
