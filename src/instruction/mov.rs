// This module builds moves and exchanges. A move whose source and destination
// already agree is dropped. Zeroing a register uses the xor idiom on x86-64
// and the hardwired zero register on AArch64. Address expressions materialize
// with lea on x86-64 and with add on AArch64, data section symbols with
// rip-relative lea or an adrp plus lo12 pair, and wide AArch64 immediates as
// a mov followed by movk sections. Loads narrower than the destination pick a
// zero or sign extending form from the source format. After building, the
// move's mode decides how storage relinks: copies leave the source alone
// while loads and relocations make the destination the source's new home.

//! Move and exchange lowering.

use crate::core::error::{CompileError, CompileResult};
use crate::core::format::Size;
use crate::handle::{Constant, Handle};
use crate::instruction::{
    assemble, flags, kinds, literal, InstrId, MoveMode, OperandSpec, Parameter,
};
use crate::unit::Unit;
use crate::value::ValueId;

pub fn build_move<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    destination: ValueId,
    source: ValueId,
    mode: MoveMode,
) -> CompileResult<()> {
    if let Some(target) = unit.instruction(id).redirect_target.clone() {
        unit.set_handle(destination, target.clone());
        if let Some(reg) = target.as_register() {
            unit.registers[reg.index()].occupant = Some(destination);
        }
    }

    let destination_handle = unit.handle(destination);
    let source_handle = unit.handle(source);

    if destination_handle == source_handle && !destination_handle.is_none() {
        unit.session.record_eliminated_move();
        let instruction = unit.instruction_mut(id);
        instruction.built = true;
        relink(unit, id, source, mode, destination_handle);
        return Ok(());
    }

    if unit.target.is_x64() {
        build_move_x64(unit, id, destination, source)?;
    } else {
        build_move_arm64(unit, id, destination, source)?;
    }

    let committed = match unit.instruction(id).destination() {
        Ok(handle) => handle.clone(),
        // Idiom expansions commit without a destination parameter.
        Err(_) => unit.handle(destination),
    };
    relink(unit, id, source, mode, committed);
    Ok(())
}

/// Apply the move mode to the allocation state after the operation is
/// committed.
fn relink<'a>(unit: &mut Unit<'a>, id: InstrId, source: ValueId, mode: MoveMode, target: Handle<'a>) {
    let result = unit.instruction(id).result;
    match mode {
        MoveMode::Copy => {
            unit.set_handle(result, target.clone());
            if let Some(reg) = target.as_register() {
                unit.registers[reg.index()].occupant = Some(result);
            }
        }
        MoveMode::Load | MoveMode::Relocate => {
            unit.set_handle(source, target.clone());
            if let Some(reg) = target.as_register() {
                unit.registers[reg.index()].occupant = Some(source);
            }
        }
    }
}

fn size_of(unit: &Unit<'_>, value: ValueId) -> Size {
    Size::from_bytes(unit.format(value).bytes())
}

fn build_move_x64<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    destination: ValueId,
    source: ValueId,
) -> CompileResult<()> {
    let destination_format = unit.format(destination);
    let source_format = unit.format(source);
    let destination_size = size_of(unit, destination);
    let source_size = size_of(unit, source);

    // Crossing the integer and decimal domains converts instead of moving.
    if destination_format.is_decimal() != source_format.is_decimal() {
        let operation = if destination_format.is_decimal() {
            "cvtsi2sd"
        } else {
            "cvttsd2si"
        };
        let (destination_kinds, source_kinds) = if destination_format.is_decimal() {
            (kinds::MEDIA_REGISTER, kinds::REGISTER_OR_MEMORY)
        } else {
            (kinds::REGISTER, kinds::MEDIA_OR_MEMORY)
        };
        return assemble(
            unit,
            id,
            operation,
            vec![
                OperandSpec {
                    value: destination,
                    flags: flags::DESTINATION | flags::WRITE_ACCESS,
                    kinds: destination_kinds,
                    size: destination_size,
                },
                OperandSpec {
                    value: source,
                    flags: flags::READS,
                    kinds: source_kinds,
                    size: source_size,
                },
            ],
        );
    }

    if destination_format.is_decimal() {
        let destination_is_memory = unit.handle(destination).is_memory();
        let source_kinds = if destination_is_memory {
            kinds::MEDIA_REGISTER
        } else {
            kinds::MEDIA_OR_MEMORY
        };
        return assemble(
            unit,
            id,
            "movsd",
            vec![
                OperandSpec {
                    value: destination,
                    flags: flags::DESTINATION | flags::WRITE_ACCESS,
                    kinds: kinds::MEDIA_OR_MEMORY,
                    size: destination_size,
                },
                OperandSpec {
                    value: source,
                    flags: flags::READS,
                    kinds: source_kinds,
                    size: source_size,
                },
            ],
        );
    }

    let source_handle = unit.handle(source);

    // Address computations materialize with lea.
    if matches!(source_handle, Handle::Expression { .. })
        || matches!(source_handle, Handle::DataSection { address: true, .. })
    {
        return assemble(
            unit,
            id,
            "lea",
            vec![
                OperandSpec {
                    value: destination,
                    flags: flags::DESTINATION | flags::WRITE_ACCESS,
                    kinds: kinds::REGISTER,
                    size: destination_size,
                },
                OperandSpec {
                    value: source,
                    flags: flags::READS,
                    kinds: kinds::EXPRESSION,
                    size: source_size,
                },
            ],
        );
    }

    let destination_is_memory = unit.handle(destination).is_memory();

    if let Some(constant) = source_handle.as_constant() {
        // Zeroing a register clears it against itself.
        if constant.is_zero() && !destination_is_memory {
            let handle = crate::memory::convert(
                unit,
                destination,
                kinds::REGISTER,
                flags::DESTINATION | flags::WRITE_ACCESS,
                destination_size,
            )?;
            let instruction = unit.instruction_mut(id);
            instruction.operation = "xor".to_string();
            instruction.parameters = vec![
                Parameter {
                    value: destination,
                    flags: flags::DESTINATION | flags::WRITE_ACCESS,
                    size: destination_size,
                    finalized: Some(handle.clone()),
                },
                Parameter {
                    value: destination,
                    flags: flags::READS,
                    size: destination_size,
                    finalized: Some(handle),
                },
            ];
            instruction.built = true;
            return Ok(());
        }

        // Stores take at most a 32 bit immediate; registers take 64.
        let immediate_bits = if destination_is_memory { 32 } else { 64 };
        return assemble(
            unit,
            id,
            "mov",
            vec![
                OperandSpec {
                    value: destination,
                    flags: flags::DESTINATION | flags::WRITE_ACCESS,
                    kinds: kinds::REGISTER_OR_MEMORY,
                    size: destination_size,
                },
                OperandSpec {
                    value: source,
                    flags: flags::READS | flags::bit_limit(immediate_bits),
                    kinds: kinds::CONSTANT_OR_REGISTER,
                    size: source_size,
                },
            ],
        );
    }

    // Narrow sources widen with an extending load.
    if source_size.bytes() < destination_size.bytes() && !destination_is_memory {
        let operation = if source_format.is_unsigned() {
            // A 32 bit write already clears the upper half.
            if source_size == Size::Dword {
                "mov"
            } else {
                "movzx"
            }
        } else {
            "movsx"
        };
        return assemble(
            unit,
            id,
            operation,
            vec![
                OperandSpec {
                    value: destination,
                    flags: flags::DESTINATION | flags::WRITE_ACCESS,
                    kinds: kinds::REGISTER,
                    size: destination_size,
                },
                OperandSpec {
                    value: source,
                    flags: flags::READS,
                    kinds: kinds::REGISTER_OR_MEMORY,
                    size: source_size,
                },
            ],
        );
    }

    // Memory to memory routes through a register.
    let source_kinds = if destination_is_memory {
        kinds::REGISTER
    } else {
        kinds::REGISTER_OR_MEMORY
    };
    assemble(
        unit,
        id,
        "mov",
        vec![
            OperandSpec {
                value: destination,
                flags: flags::DESTINATION | flags::WRITE_ACCESS,
                kinds: kinds::REGISTER_OR_MEMORY,
                size: destination_size,
            },
            OperandSpec {
                value: source,
                flags: flags::READS,
                kinds: source_kinds,
                size: source_size,
            },
        ],
    )
}

fn build_move_arm64<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    destination: ValueId,
    source: ValueId,
) -> CompileResult<()> {
    let destination_format = unit.format(destination);
    let source_format = unit.format(source);
    let destination_size = size_of(unit, destination);
    let source_size = size_of(unit, source);

    if destination_format.is_decimal() != source_format.is_decimal() {
        let operation = if destination_format.is_decimal() {
            "scvtf"
        } else {
            "fcvtzs"
        };
        let (destination_kinds, source_kinds) = if destination_format.is_decimal() {
            (kinds::MEDIA_REGISTER, kinds::REGISTER)
        } else {
            (kinds::REGISTER, kinds::MEDIA_REGISTER)
        };
        return assemble(
            unit,
            id,
            operation,
            vec![
                OperandSpec {
                    value: destination,
                    flags: flags::DESTINATION | flags::WRITE_ACCESS,
                    kinds: destination_kinds,
                    size: destination_size,
                },
                OperandSpec {
                    value: source,
                    flags: flags::READS,
                    kinds: source_kinds,
                    size: source_size,
                },
            ],
        );
    }

    let destination_is_memory = unit.handle(destination).is_memory();
    let source_handle = unit.handle(source);

    if destination_format.is_decimal() {
        let operation = if destination_is_memory {
            "str"
        } else if source_handle.is_memory() || matches!(source_handle, Handle::ConstantData { .. })
        {
            "ldr"
        } else {
            "fmov"
        };
        let (destination_kinds, source_kinds) = if destination_is_memory {
            (kinds::MEMORY, kinds::MEDIA_REGISTER)
        } else {
            (kinds::MEDIA_REGISTER, kinds::MEDIA_OR_MEMORY)
        };
        return assemble(
            unit,
            id,
            operation,
            vec![
                OperandSpec {
                    value: destination,
                    flags: flags::DESTINATION | flags::WRITE_ACCESS,
                    kinds: destination_kinds,
                    size: destination_size,
                },
                OperandSpec {
                    value: source,
                    flags: flags::READS,
                    kinds: source_kinds,
                    size: source_size,
                },
            ],
        );
    }

    // Data section addresses build as an adrp plus lo12 pair.
    if let Handle::DataSection {
        symbol,
        address: true,
        ..
    } = source_handle
    {
        let handle = crate::memory::convert(
            unit,
            destination,
            kinds::REGISTER,
            flags::DESTINATION | flags::WRITE_ACCESS,
            destination_size,
        )?;
        let reg = handle
            .as_register()
            .ok_or_else(|| CompileError::CodeGeneration {
                reason: "address materialization needs a register".to_string(),
            })?;
        let name = unit.register(reg).full_name();
        let result = unit.instruction(id).result;
        unit.add(literal(result, format!("adrp {}, {}", name, symbol)))?;

        let instruction = unit.instruction_mut(id);
        instruction.operation = format!("add {}, {}, :lo12:{}", name, name, symbol);
        instruction.parameters = vec![Parameter {
            value: destination,
            flags: flags::DESTINATION | flags::WRITE_ACCESS | flags::HIDDEN,
            size: destination_size,
            finalized: Some(Handle::Register(reg)),
        }];
        instruction.built = true;
        return Ok(());
    }

    if matches!(source_handle, Handle::Expression { .. }) {
        return assemble(
            unit,
            id,
            "add",
            vec![
                OperandSpec {
                    value: destination,
                    flags: flags::DESTINATION | flags::WRITE_ACCESS,
                    kinds: kinds::REGISTER,
                    size: destination_size,
                },
                OperandSpec {
                    value: source,
                    flags: flags::READS,
                    kinds: kinds::EXPRESSION,
                    size: source_size,
                },
            ],
        );
    }

    if let Some(constant) = source_handle.as_constant() {
        // A zero store reads the hardwired zero register.
        if constant.is_zero() && destination_is_memory {
            let zero = unit.zero_register()?;
            return assemble_store_register(unit, id, destination, source, zero, destination_size);
        }
        if constant.is_zero() && !destination_is_memory {
            let zero = unit.zero_register()?;
            let handle = crate::memory::convert(
                unit,
                destination,
                kinds::REGISTER,
                flags::DESTINATION | flags::WRITE_ACCESS,
                destination_size,
            )?;
            let instruction = unit.instruction_mut(id);
            instruction.operation = "mov".to_string();
            instruction.parameters = vec![
                Parameter {
                    value: destination,
                    flags: flags::DESTINATION | flags::WRITE_ACCESS,
                    size: destination_size,
                    finalized: Some(handle),
                },
                Parameter {
                    value: source,
                    flags: flags::READS,
                    size: destination_size,
                    finalized: Some(Handle::Register(zero)),
                },
            ];
            instruction.built = true;
            return Ok(());
        }

        let bits = constant.bits();
        if crate::instruction::fits_bits(bits, 16) && bits >= 0 && !destination_is_memory {
            return assemble(
                unit,
                id,
                "mov",
                vec![
                    OperandSpec {
                        value: destination,
                        flags: flags::DESTINATION | flags::WRITE_ACCESS,
                        kinds: kinds::REGISTER,
                        size: destination_size,
                    },
                    OperandSpec {
                        value: source,
                        flags: flags::READS | flags::bit_limit(16),
                        kinds: kinds::CONSTANT_OR_REGISTER,
                        size: source_size,
                    },
                ],
            );
        }

        if !destination_is_memory {
            return build_sectioned_constant(unit, id, destination, bits, destination_size);
        }

        // A store of a wide constant routes through a register.
        return assemble(
            unit,
            id,
            "str",
            vec![
                OperandSpec {
                    value: destination,
                    flags: flags::DESTINATION | flags::WRITE_ACCESS,
                    kinds: kinds::MEMORY,
                    size: destination_size,
                },
                OperandSpec {
                    value: source,
                    flags: flags::READS,
                    kinds: kinds::REGISTER,
                    size: source_size,
                },
            ],
        );
    }

    if destination_is_memory {
        let operation = match destination_size {
            Size::Byte => "strb",
            Size::Word => "strh",
            _ => "str",
        };
        return assemble(
            unit,
            id,
            operation,
            vec![
                OperandSpec {
                    value: destination,
                    flags: flags::DESTINATION | flags::WRITE_ACCESS,
                    kinds: kinds::MEMORY,
                    size: destination_size,
                },
                OperandSpec {
                    value: source,
                    flags: flags::READS,
                    kinds: kinds::REGISTER,
                    size: source_size,
                },
            ],
        );
    }

    if source_handle.is_memory() {
        let operation = match (source_size, source_format.is_unsigned()) {
            (Size::Byte, true) => "ldrb",
            (Size::Byte, false) => "ldrsb",
            (Size::Word, true) => "ldrh",
            (Size::Word, false) => "ldrsh",
            (Size::Dword, false) if destination_size == Size::Qword => "ldrsw",
            _ => "ldr",
        };
        return assemble(
            unit,
            id,
            operation,
            vec![
                OperandSpec {
                    value: destination,
                    flags: flags::DESTINATION | flags::WRITE_ACCESS,
                    kinds: kinds::REGISTER,
                    size: destination_size,
                },
                OperandSpec {
                    value: source,
                    flags: flags::READS,
                    kinds: kinds::MEMORY,
                    size: source_size,
                },
            ],
        );
    }

    assemble(
        unit,
        id,
        "mov",
        vec![
            OperandSpec {
                value: destination,
                flags: flags::DESTINATION | flags::WRITE_ACCESS,
                kinds: kinds::REGISTER,
                size: destination_size,
            },
            OperandSpec {
                value: source,
                flags: flags::READS,
                kinds: kinds::REGISTER,
                size: source_size,
            },
        ],
    )
}

fn assemble_store_register<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    destination: ValueId,
    source: ValueId,
    register: crate::register::Reg,
    size: Size,
) -> CompileResult<()> {
    let handle = crate::memory::convert(
        unit,
        destination,
        kinds::MEMORY,
        flags::DESTINATION | flags::WRITE_ACCESS,
        size,
    )?;
    let operation = match size {
        Size::Byte => "strb",
        Size::Word => "strh",
        _ => "str",
    };
    let instruction = unit.instruction_mut(id);
    instruction.operation = operation.to_string();
    instruction.parameters = vec![
        Parameter {
            value: source,
            flags: flags::READS,
            size,
            finalized: Some(Handle::Register(register)),
        },
        Parameter {
            value: destination,
            flags: flags::DESTINATION | flags::WRITE_ACCESS,
            size,
            finalized: Some(handle),
        },
    ];
    instruction.built = true;
    Ok(())
}

/// Materialize a wide immediate as a mov of the low section followed by movk
/// for each non zero upper section.
fn build_sectioned_constant<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    destination: ValueId,
    bits: i64,
    size: Size,
) -> CompileResult<()> {
    let handle = crate::memory::convert(
        unit,
        destination,
        kinds::REGISTER,
        flags::DESTINATION | flags::WRITE_ACCESS,
        size,
    )?;
    let reg = handle
        .as_register()
        .ok_or_else(|| CompileError::CodeGeneration {
            reason: "sectioned constant needs a register".to_string(),
        })?;
    let name = unit.register(reg).full_name();
    let result = unit.instruction(id).result;

    let sections = [
        (bits as u64) & 0xffff,
        ((bits as u64) >> 16) & 0xffff,
        ((bits as u64) >> 32) & 0xffff,
        ((bits as u64) >> 48) & 0xffff,
    ];

    let mut lines = vec![format!("mov {}, #{}", name, sections[0])];
    for (index, section) in sections.iter().enumerate().skip(1) {
        if *section != 0 {
            lines.push(format!("movk {}, #{}, lsl #{}", name, section, index * 16));
        }
    }

    // Inserted instructions land in front of the one being built, so the
    // instruction itself carries the final line of the sequence.
    let last = lines.pop().unwrap_or_default();
    for line in lines {
        unit.add(literal(result, line))?;
    }

    let instruction = unit.instruction_mut(id);
    instruction.operation = last;
    instruction.parameters = vec![Parameter {
        value: destination,
        flags: flags::DESTINATION | flags::WRITE_ACCESS | flags::HIDDEN,
        size,
        finalized: Some(Handle::Register(reg)),
    }];
    instruction.built = true;
    Ok(())
}

/// Swap the storages of two register resident values.
pub fn build_exchange<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    first: ValueId,
    second: ValueId,
) -> CompileResult<()> {
    let first_size = size_of(unit, first);
    let second_size = size_of(unit, second);

    assemble(
        unit,
        id,
        "xchg",
        vec![
            OperandSpec {
                value: first,
                flags: flags::READS | flags::WRITE_ACCESS | flags::RELOCATE_TO_DESTINATION,
                kinds: kinds::REGISTER,
                size: first_size,
            },
            OperandSpec {
                value: second,
                flags: flags::READS | flags::WRITE_ACCESS,
                kinds: kinds::REGISTER,
                size: second_size,
            },
        ],
    )?;

    // The operation swaps the contents, so the storages trade places.
    let first_handle = unit.handle(first);
    let second_handle = unit.handle(second);
    unit.set_handle(first, second_handle.clone());
    unit.set_handle(second, first_handle.clone());
    if let Some(reg) = second_handle.as_register() {
        unit.registers[reg.index()].occupant = Some(first);
    }
    if let Some(reg) = first_handle.as_register() {
        unit.registers[reg.index()].occupant = Some(second);
    }
    Ok(())
}
