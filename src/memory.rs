// This module implements the move resolution layer between the operand
// conversion engine and the move instruction. It decides how a value travels
// into an accepted storage form: write only destinations get a bare register,
// values that an operation would destroy while still needed elsewhere are
// duplicated, everything else relocates. Corrective move groups at control
// flow joins run through the align combinator, which orders the moves so no
// pending source is clobbered and breaks register cycles with an exchange on
// x86-64 or a scratch register elsewhere.

//! Conversion of values between storage forms and parallel move resolution.

use log::trace;

use crate::core::error::{CompileError, CompileResult};
use crate::core::format::Size;
use crate::handle::{Handle, HandleKind};
use crate::instruction::{fits_bits, flags, Instruction, InstructionKind, MoveMode};
use crate::register::Reg;
use crate::trace::{directives_for, Directive};
use crate::unit::Unit;
use crate::value::ValueId;

/// Convert the value's current handle into one of the accepted kinds.
pub fn convert<'a>(
    unit: &mut Unit<'a>,
    value: ValueId,
    kinds: &[HandleKind],
    operand_flags: u32,
    size: Size,
) -> CompileResult<Handle<'a>> {
    let current = unit.handle(value);
    let kind = unit.kind_of(value);
    let media = unit.format(value).is_decimal();

    if kinds.contains(&kind) {
        let acceptable = match &current {
            Handle::Constant(constant) => {
                let bits = flags::bit_limit_of(operand_flags);
                !constant.is_decimal() && fits_bits(constant.bits(), bits)
            }
            _ => true,
        };
        if acceptable {
            return Ok(current);
        }
    }

    for target in kinds {
        match target {
            HandleKind::Register | HandleKind::MediaRegister => {
                let want_media = *target == HandleKind::MediaRegister || media;
                return to_register(unit, value, operand_flags, want_media, size);
            }
            HandleKind::Memory => return to_memory(unit, value),
            // The remaining kinds can not be produced by a conversion.
            _ => continue,
        }
    }

    Err(CompileError::Unsupported {
        reason: format!("no operand conversion reaches the accepted kinds from {:?}", kind),
    })
}

fn to_register<'a>(
    unit: &mut Unit<'a>,
    value: ValueId,
    operand_flags: u32,
    media: bool,
    size: Size,
) -> CompileResult<Handle<'a>> {
    let position = unit.position;
    let destination = operand_flags & flags::DESTINATION != 0;
    let reads = operand_flags & flags::READS != 0;
    let writable = operand_flags & flags::WRITE_ACCESS != 0;
    let relocates = operand_flags & flags::RELOCATE_TO_DESTINATION != 0;

    // A destination whose previous contents are irrelevant only needs a
    // bare register.
    if unit.handle(value).is_none() || (destination && !reads) {
        let reg = get_register_for(unit, value, media)?;
        unit.occupy(reg, value);
        return Ok(Handle::Register(reg));
    }

    // An in place write would destroy contents that are still needed, so
    // operate on a duplicate instead.
    if writable && !relocates && unit.is_used_after(value, position) {
        let copy = copy_to_register(unit, value, media, size)?;
        return Ok(unit.handle(copy));
    }

    move_to_register(unit, value, media, size)
}

fn to_memory<'a>(unit: &mut Unit<'a>, value: ValueId) -> CompileResult<Handle<'a>> {
    let handle = unit.handle(value);
    if handle.is_memory() {
        return Ok(handle);
    }
    let bytes = unit.format(value).bytes() as i32;
    let destination = unit.temporary_memory(bytes);
    relocate(unit, value, destination.clone())?;
    Ok(destination)
}

/// Move the value into a register of the requested class, making the
/// register the value's new home.
pub fn move_to_register<'a>(
    unit: &mut Unit<'a>,
    value: ValueId,
    media: bool,
    size: Size,
) -> CompileResult<Handle<'a>> {
    if let Some(reg) = unit.register_of(value) {
        if unit.register(reg).is_media() == media {
            return Ok(Handle::Register(reg));
        }
    }

    // Keep the registers behind the current handle intact while choosing.
    let current = unit.handle(value);
    let locked = unit.lock_handle(&current);
    let reg = get_register_for(unit, value, media);
    unit.unlock_all(&locked);
    let reg = reg?;

    emit_move(unit, value, Handle::Register(reg), size, MoveMode::Load)?;
    Ok(Handle::Register(reg))
}

/// Copy the value into a fresh register, leaving the original untouched.
/// Returns the copy.
pub fn copy_to_register<'a>(
    unit: &mut Unit<'a>,
    value: ValueId,
    media: bool,
    size: Size,
) -> CompileResult<ValueId> {
    let current = unit.handle(value);
    let locked = unit.lock_handle(&current);
    let reg = get_register_for(unit, value, media);
    unit.unlock_all(&locked);
    let reg = reg?;

    let format = unit.format(value);
    let copy = unit.new_value(format);
    let destination = unit.new_value(format);
    unit.set_handle(destination, Handle::Register(reg));

    let instruction = Instruction::new(
        InstructionKind::Move {
            destination,
            source: value,
            mode: MoveMode::Copy,
        },
        copy,
    );
    unit.add(instruction)?;
    unit.occupy(reg, copy);
    Ok(copy)
}

/// Move the value into the given storage and make that storage its home.
pub fn relocate<'a>(unit: &mut Unit<'a>, value: ValueId, target: Handle<'a>) -> CompileResult<()> {
    let size = Size::from_bytes(unit.format(value).bytes());
    emit_move(unit, value, target, size, MoveMode::Relocate)
}

fn emit_move<'a>(
    unit: &mut Unit<'a>,
    source: ValueId,
    target: Handle<'a>,
    size: Size,
    mode: MoveMode,
) -> CompileResult<()> {
    let format = unit.format(source);
    let destination = unit.new_value(format);
    unit.set_handle(destination, target);
    let result = unit.new_value(format);
    let _ = size;

    let instruction = Instruction::new(
        InstructionKind::Move {
            destination,
            source,
            mode,
        },
        result,
    );
    unit.add(instruction)?;
    Ok(())
}

/// Free the register for unrelated use, moving a live occupant aside first.
pub fn clear_register<'a>(unit: &mut Unit<'a>, reg: Reg) -> CompileResult<()> {
    let position = unit.position;
    let live = match unit.register(reg).occupant {
        Some(occupant) => {
            unit.handle(occupant) == Handle::Register(reg) && !unit.is_expiring(occupant, position)
        }
        None => false,
    };
    if live {
        trace!("clearing {}", unit.register(reg).full_name());
        unit.release(reg)?;
    } else {
        unit.reset_register(reg);
    }
    Ok(())
}

/// Pick a register for the value, honoring the directives derived from its
/// lifetime window.
pub fn get_register_for<'a>(
    unit: &mut Unit<'a>,
    value: ValueId,
    media: bool,
) -> CompileResult<Reg> {
    let directives = directives_for(unit, value);
    let mut avoid: Vec<Reg> = Vec::new();
    let mut prefer_non_volatile = false;

    for directive in &directives {
        match directive {
            Directive::SpecificRegister(reg) => {
                if unit.register(*reg).is_media() == media
                    && unit.is_register_available(*reg, unit.position)
                {
                    unit.reset_register(*reg);
                    return Ok(*reg);
                }
            }
            Directive::AvoidRegisters(registers) => avoid.extend(registers.iter().copied()),
            Directive::NonVolatility => prefer_non_volatile = true,
        }
    }

    if prefer_non_volatile {
        // On AArch64 a value that must outlive a call has to land in a
        // callee saved register here; exhaustion fails loudly instead of
        // downgrading to a volatile register. x86-64 keeps the preference
        // soft because the evacuation pass can still spill to memory.
        if unit.target.is_arm64() {
            return unit.next_non_volatile_register(media, &avoid);
        }
        for index in 0..unit.registers.len() {
            let reg = Reg(index as u8);
            let register = &unit.registers[index];
            if !register.is_volatile()
                && register.is_media() == media
                && !avoid.contains(&reg)
                && unit.is_register_available(reg, unit.position)
            {
                unit.reset_register(reg);
                return Ok(reg);
            }
        }
    }

    unit.next_register(media, &avoid)
}

/// Resolve a group of simultaneous moves so that no pending source is
/// clobbered before it is read. Cycles among general registers are broken
/// with an exchange on x86-64 and with a scratch register elsewhere.
pub fn align<'a>(unit: &mut Unit<'a>, moves: Vec<(ValueId, Handle<'a>)>) -> CompileResult<()> {
    let (pending, locked) = partition_alignment(unit, moves);
    for reg in &locked {
        unit.lock_register(*reg);
    }
    let outcome = align_pending(unit, pending);
    unit.unlock_all(&locked);
    outcome
}

/// Drop moves whose value already sits in its target and collect every
/// register the corrective sequence must not disturb: destinations of the
/// dropped moves, pending sources and pending register targets. The dropped
/// destinations stay pinned too, otherwise a corrective move could borrow an
/// already correct location as scratch.
fn partition_alignment<'a>(
    unit: &Unit<'a>,
    mut moves: Vec<(ValueId, Handle<'a>)>,
) -> (Vec<(ValueId, Handle<'a>)>, Vec<Reg>) {
    let mut locked: Vec<Reg> = Vec::new();
    moves.retain(|(value, target)| {
        if unit.handle(*value) == *target {
            unit.session.record_eliminated_move();
            if let Some(reg) = target.as_register() {
                locked.push(reg);
            }
            false
        } else {
            true
        }
    });

    for (value, target) in &moves {
        if let Some(reg) = target.as_register() {
            locked.push(reg);
        }
        if let Some(reg) = unit.register_of(*value) {
            locked.push(reg);
        }
    }
    locked.sort_unstable();
    locked.dedup();
    (moves, locked)
}

fn align_pending<'a>(unit: &mut Unit<'a>, mut moves: Vec<(ValueId, Handle<'a>)>) -> CompileResult<()> {
    while !moves.is_empty() {
        let mut progressed = false;

        for index in 0..moves.len() {
            let (value, target) = moves[index].clone();
            let blocked = match target.as_register() {
                Some(reg) => moves
                    .iter()
                    .enumerate()
                    .any(|(other, (source, _))| {
                        other != index && unit.register_of(*source) == Some(reg)
                    }),
                None => false,
            };
            if !blocked {
                unit.session.record_corrective_move();
                relocate(unit, value, target)?;
                if let Some(reg) = unit.register_of(value) {
                    unit.registers[reg.index()].occupant = Some(value);
                }
                moves.remove(index);
                progressed = true;
                break;
            }
        }

        if progressed {
            continue;
        }

        // Every pending destination is someone else's source, so the moves
        // form a cycle.
        let (value, target) = moves[0].clone();
        let target_reg = target
            .as_register()
            .ok_or_else(|| CompileError::RegisterConflict {
                register: "cycle through a non register target".to_string(),
            })?;

        let occupant = moves
            .iter()
            .map(|(source, _)| *source)
            .find(|source| unit.register_of(*source) == Some(target_reg));

        if unit.target.is_x64() && !unit.register(target_reg).is_media() {
            if let Some(occupant) = occupant {
                unit.session.record_corrective_move();
                exchange(unit, value, occupant)?;
                moves.remove(0);
                continue;
            }
        }

        // Rotate through a scratch register to open the cycle.
        let mut avoid: Vec<Reg> = moves
            .iter()
            .filter_map(|(source, target)| {
                target.as_register().or_else(|| unit.register_of(*source))
            })
            .collect();
        avoid.sort_unstable();
        avoid.dedup();
        let media = unit.register(target_reg).is_media();
        let scratch = unit.next_register(media, &avoid)?;
        unit.session.record_corrective_move();
        relocate(unit, value, Handle::Register(scratch))?;
        unit.registers[scratch.index()].occupant = Some(value);
    }

    Ok(())
}

/// Swap the storage of two register resident values.
pub fn exchange<'a>(unit: &mut Unit<'a>, first: ValueId, second: ValueId) -> CompileResult<()> {
    let format = unit.format(first);
    let result = unit.new_value(format);
    let instruction = Instruction::new(InstructionKind::Exchange { first, second }, result);
    unit.add(instruction)?;
    Ok(())
}
