// This module builds the arithmetic operations. Additions and subtractions
// are two operand forms on x86-64 and three operand forms on AArch64.
// Multiplications by a power of two reduce to shifts, and small odd
// multipliers on x86-64 fuse into a single lea over a scaled index
// expression. x86-64 division follows the hardware protocol: the dividend is
// staged into the numerator register, the remainder register is cleared and
// both are locked for the duration, the numerator is sign or zero extended,
// and the quotient or remainder is taken from the protocol register
// afterwards. AArch64 divides directly and derives the remainder with msub.

//! Arithmetic instruction lowering.

use crate::core::error::{CompileError, CompileResult};
use crate::core::format::{Format, Size};
use crate::handle::{Constant, Handle};
use crate::instruction::{
    assemble, flags, kinds, literal, InstrId, Instruction, InstructionKind, OperandSpec,
    Parameter, UnaryOp,
};
use crate::memory;
use crate::unit::Unit;
use crate::value::ValueId;

/// Flags of a two operand destination that is read, written and left holding
/// the result.
const IN_PLACE: u32 = flags::DESTINATION
    | flags::WRITE_ACCESS
    | flags::READS
    | flags::ATTACH_TO_DESTINATION;

fn size_of(unit: &Unit<'_>, value: ValueId) -> Size {
    Size::from_bytes(unit.format(value).bytes())
}

fn power_of_two(handle: &Handle<'_>) -> Option<u32> {
    match handle.as_constant() {
        Some(Constant::Integer(value)) if value > 1 && (value & (value - 1)) == 0 => {
            Some(value.trailing_zeros())
        }
        _ => None,
    }
}

/// Build a two operand x86-64 or three operand AArch64 binary operation.
fn build_binary<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    operations: (&str, &str),
    first: ValueId,
    second: ValueId,
    assigns: bool,
    immediate_bits: u32,
) -> CompileResult<()> {
    let decimal = unit.format(first).is_decimal();
    let operation = if decimal { operations.1 } else { operations.0 };
    let size = size_of(unit, first);

    if unit.target.is_x64() {
        let mut first_flags = IN_PLACE;
        if assigns {
            first_flags |= flags::RELOCATE_TO_DESTINATION;
        }
        let destination_kinds = if decimal {
            kinds::MEDIA_REGISTER
        } else if assigns {
            kinds::REGISTER_OR_MEMORY
        } else {
            kinds::REGISTER
        };
        let first_is_memory = assigns && unit.handle(first).is_memory() && !decimal;
        let second_kinds = if decimal {
            kinds::MEDIA_OR_MEMORY
        } else if first_is_memory {
            kinds::CONSTANT_OR_REGISTER
        } else {
            kinds::CONSTANT_REGISTER_MEMORY
        };
        return assemble(
            unit,
            id,
            operation,
            vec![
                OperandSpec {
                    value: first,
                    flags: first_flags,
                    kinds: destination_kinds,
                    size,
                },
                OperandSpec {
                    value: second,
                    flags: flags::READS | flags::bit_limit(32),
                    kinds: second_kinds,
                    size,
                },
            ],
        );
    }

    // AArch64 three operand form: the destination doubles as the first
    // source when assigning.
    let result = unit.instruction(id).result;
    let register_kinds = if decimal {
        kinds::MEDIA_REGISTER
    } else {
        kinds::REGISTER
    };
    let second_kinds = if decimal {
        kinds::MEDIA_REGISTER
    } else {
        kinds::CONSTANT_OR_REGISTER
    };
    let destination = if assigns { first } else { result };
    let mut destination_flags = flags::DESTINATION | flags::WRITE_ACCESS;
    if assigns {
        destination_flags |= flags::READS | flags::ATTACH_TO_DESTINATION;
    }

    assemble(
        unit,
        id,
        operation,
        vec![
            OperandSpec {
                value: destination,
                flags: destination_flags,
                kinds: register_kinds,
                size,
            },
            OperandSpec {
                value: first,
                flags: flags::READS,
                kinds: register_kinds,
                size,
            },
            OperandSpec {
                value: second,
                flags: flags::READS | flags::bit_limit(immediate_bits),
                kinds: second_kinds,
                size,
            },
        ],
    )
}

pub fn build_addition<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    first: ValueId,
    second: ValueId,
    assigns: bool,
) -> CompileResult<()> {
    let operations = if unit.target.is_x64() {
        ("add", "addsd")
    } else {
        ("add", "fadd")
    };
    build_binary(unit, id, operations, first, second, assigns, 12)
}

pub fn build_subtraction<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    first: ValueId,
    second: ValueId,
    assigns: bool,
) -> CompileResult<()> {
    let operations = if unit.target.is_x64() {
        ("sub", "subsd")
    } else {
        ("sub", "fsub")
    };
    build_binary(unit, id, operations, first, second, assigns, 12)
}

pub fn build_multiplication<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    first: ValueId,
    second: ValueId,
    assigns: bool,
) -> CompileResult<()> {
    let decimal = unit.format(first).is_decimal();
    let size = size_of(unit, first);

    if !decimal {
        // Powers of two reduce to a left shift.
        if let Some(shift) = power_of_two(&unit.handle(second)) {
            let count = unit.new_value(Format::Int64);
            unit.set_handle(count, Handle::Constant(Constant::Integer(shift as i64)));
            let operation = if unit.target.is_x64() { "sal" } else { "lsl" };
            return build_binary(unit, id, (operation, ""), first, count, assigns, 6);
        }

        // Small odd multipliers fuse into a scaled index address.
        if unit.target.is_x64() && !assigns {
            if let Some(Constant::Integer(multiplier)) = unit.handle(second).as_constant() {
                if matches!(multiplier, 3 | 5 | 9) {
                    memory::move_to_register(unit, first, false, size)?;
                    let expression = unit.new_value(unit.format(first));
                    unit.set_handle(
                        expression,
                        Handle::Expression {
                            base: Some(first),
                            index: Some(first),
                            stride: (multiplier - 1) as i32,
                            displacement: 0,
                        },
                    );
                    let result = unit.instruction(id).result;
                    return assemble(
                        unit,
                        id,
                        "lea",
                        vec![
                            OperandSpec {
                                value: result,
                                flags: flags::DESTINATION | flags::WRITE_ACCESS,
                                kinds: kinds::REGISTER,
                                size,
                            },
                            OperandSpec {
                                value: expression,
                                flags: flags::READS,
                                kinds: kinds::EXPRESSION,
                                size,
                            },
                        ],
                    );
                }
            }
        }
    }

    if unit.target.is_x64() {
        let mut first_flags = IN_PLACE;
        if assigns {
            first_flags |= flags::RELOCATE_TO_DESTINATION;
        }
        let operation = if decimal { "mulsd" } else { "imul" };
        let destination_kinds = if decimal {
            kinds::MEDIA_REGISTER
        } else {
            // imul writes a register even when assigning to memory.
            kinds::REGISTER
        };
        let second_kinds = if decimal {
            kinds::MEDIA_OR_MEMORY
        } else {
            kinds::CONSTANT_REGISTER_MEMORY
        };
        return assemble(
            unit,
            id,
            operation,
            vec![
                OperandSpec {
                    value: first,
                    flags: first_flags,
                    kinds: destination_kinds,
                    size,
                },
                OperandSpec {
                    value: second,
                    flags: flags::READS | flags::bit_limit(32),
                    kinds: second_kinds,
                    size,
                },
            ],
        );
    }

    let operation = if decimal { "fmul" } else { "mul" };
    let register_kinds = if decimal {
        kinds::MEDIA_REGISTER
    } else {
        kinds::REGISTER
    };
    let result = unit.instruction(id).result;
    let destination = if assigns { first } else { result };
    let mut destination_flags = flags::DESTINATION | flags::WRITE_ACCESS;
    if assigns {
        destination_flags |= flags::READS | flags::ATTACH_TO_DESTINATION;
    }
    assemble(
        unit,
        id,
        operation,
        vec![
            OperandSpec {
                value: destination,
                flags: destination_flags,
                kinds: register_kinds,
                size,
            },
            OperandSpec {
                value: first,
                flags: flags::READS,
                kinds: register_kinds,
                size,
            },
            OperandSpec {
                value: second,
                flags: flags::READS,
                kinds: register_kinds,
                size,
            },
        ],
    )
}

pub fn build_division<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    first: ValueId,
    second: ValueId,
    modulus: bool,
    assigns: bool,
    unsigned: bool,
) -> CompileResult<()> {
    let decimal = unit.format(first).is_decimal();
    let size = size_of(unit, first);

    if decimal {
        let operations = if unit.target.is_x64() {
            ("", "divsd")
        } else {
            ("", "fdiv")
        };
        return build_binary(unit, id, operations, first, second, assigns, 0);
    }

    // Divisions by a power of two reduce to a right shift, logical for
    // unsigned values and arithmetic for signed ones.
    if !modulus {
        if let Some(shift) = power_of_two(&unit.handle(second)) {
            let count = unit.new_value(Format::Int64);
            unit.set_handle(count, Handle::Constant(Constant::Integer(shift as i64)));
            let operation = match (unsigned, unit.target.is_x64()) {
                (true, true) => "shr",
                (true, false) => "lsr",
                (false, true) => "sar",
                (false, false) => "asr",
            };
            return build_binary(unit, id, (operation, ""), first, count, assigns, 6);
        }
    }

    if unit.target.is_x64() {
        return build_division_x64(unit, id, first, second, modulus, assigns, unsigned, size);
    }
    build_division_arm64(unit, id, first, second, modulus, assigns, unsigned, size)
}

#[allow(clippy::too_many_arguments)]
fn build_division_x64<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    first: ValueId,
    second: ValueId,
    modulus: bool,
    assigns: bool,
    unsigned: bool,
    size: Size,
) -> CompileResult<()> {
    let numerator = unit.numerator()?;
    let remainder = unit.remainder()?;
    let position = unit.position;

    // Stage the dividend into the numerator register, duplicating it when it
    // is still needed afterwards, and free the remainder register which the
    // operation clobbers.
    memory::clear_register(unit, remainder)?;

    let dividend = if unit.is_used_after(first, position) && !assigns {
        memory::copy_to_register(unit, first, false, size)?
    } else {
        first
    };
    if unit.register_of(dividend) != Some(numerator) {
        memory::clear_register(unit, numerator)?;
        memory::relocate(unit, dividend, Handle::Register(numerator))?;
        unit.registers[numerator.index()].occupant = Some(dividend);
    }

    unit.lock_register(numerator);
    unit.lock_register(remainder);

    let extension = Instruction::new(
        InstructionKind::ExtendNumerator { unsigned },
        unit.instruction(id).result,
    );
    unit.add(extension)?;

    let divisor = memory::convert(
        unit,
        second,
        kinds::REGISTER_OR_MEMORY,
        flags::READS,
        size,
    )?;
    let divisor_locked = unit.lock_handle(&divisor);

    let operation = if unsigned { "div" } else { "idiv" };
    let instruction = unit.instruction_mut(id);
    instruction.operation = operation.to_string();
    instruction.parameters = vec![
        Parameter {
            value: first,
            flags: flags::DESTINATION | flags::WRITE_ACCESS | flags::HIDDEN,
            size,
            finalized: Some(Handle::Register(numerator)),
        },
        Parameter {
            value: second,
            flags: flags::READS,
            size,
            finalized: Some(divisor),
        },
    ];
    instruction.built = true;

    unit.unlock_all(&divisor_locked);
    unit.unlock_register(numerator);
    unit.unlock_register(remainder);

    // The quotient lands in the numerator, the remainder beside it. The
    // other protocol register holds garbage afterwards.
    let result = unit.instruction(id).result;
    if modulus {
        unit.reset_register(numerator);
        unit.occupy(remainder, result);
    } else {
        unit.reset_register(remainder);
        unit.occupy(numerator, result);
    }

    if assigns {
        unit.join(first, result);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_division_arm64<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    first: ValueId,
    second: ValueId,
    modulus: bool,
    assigns: bool,
    unsigned: bool,
    size: Size,
) -> CompileResult<()> {
    let operation = if unsigned { "udiv" } else { "sdiv" };
    let result = unit.instruction(id).result;

    if !modulus {
        let destination = if assigns { first } else { result };
        let mut destination_flags = flags::DESTINATION | flags::WRITE_ACCESS;
        if assigns {
            destination_flags |= flags::READS | flags::ATTACH_TO_DESTINATION;
        }
        return assemble(
            unit,
            id,
            operation,
            vec![
                OperandSpec {
                    value: destination,
                    flags: destination_flags,
                    kinds: kinds::REGISTER,
                    size,
                },
                OperandSpec {
                    value: first,
                    flags: flags::READS,
                    kinds: kinds::REGISTER,
                    size,
                },
                OperandSpec {
                    value: second,
                    flags: flags::READS,
                    kinds: kinds::REGISTER,
                    size,
                },
            ],
        );
    }

    // Remainder: divide into a scratch, then subtract the scaled quotient.
    let dividend = memory::convert(unit, first, kinds::REGISTER, flags::READS, size)?;
    let divisor = memory::convert(unit, second, kinds::REGISTER, flags::READS, size)?;
    let mut locked = unit.lock_handle(&dividend);
    locked.extend(unit.lock_handle(&divisor));

    let scratch = unit.next_register(false, &[])?;
    unit.lock_register(scratch);
    let quotient = unit.new_value(unit.format(first));
    unit.occupy(scratch, quotient);

    let dividend_reg = dividend
        .as_register()
        .ok_or_else(|| CompileError::CodeGeneration {
            reason: "remainder dividend must be a register".to_string(),
        })?;
    let divisor_reg = divisor
        .as_register()
        .ok_or_else(|| CompileError::CodeGeneration {
            reason: "remainder divisor must be a register".to_string(),
        })?;

    let scratch_name = unit.register(scratch).full_name();
    let dividend_name = unit.register(dividend_reg).name(size);
    let divisor_name = unit.register(divisor_reg).name(size);
    unit.add(literal(
        quotient,
        format!("{} {}, {}, {}", operation, scratch_name, dividend_name, divisor_name),
    ))?;

    let destination = memory::convert(
        unit,
        result,
        kinds::REGISTER,
        flags::DESTINATION | flags::WRITE_ACCESS,
        size,
    )?;
    let destination_reg = destination
        .as_register()
        .ok_or_else(|| CompileError::CodeGeneration {
            reason: "remainder destination must be a register".to_string(),
        })?;

    let destination_name = unit.register(destination_reg).name(size);
    let instruction = unit.instruction_mut(id);
    instruction.operation = format!(
        "msub {}, {}, {}, {}",
        destination_name, scratch_name, divisor_name, dividend_name
    );
    instruction.parameters = vec![Parameter {
        value: result,
        flags: flags::DESTINATION | flags::WRITE_ACCESS | flags::HIDDEN,
        size,
        finalized: Some(destination),
    }];
    instruction.built = true;

    unit.unlock_register(scratch);
    unit.unlock_all(&locked);

    if assigns {
        unit.join(first, result);
    }
    Ok(())
}

pub fn build_unary<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    operator: UnaryOp,
    first: ValueId,
) -> CompileResult<()> {
    let decimal = unit.format(first).is_decimal();
    let size = size_of(unit, first);

    if unit.target.is_x64() {
        if decimal {
            // Flip the sign bit with a mask from the data section.
            let mask = unit.new_value(Format::Decimal);
            unit.set_handle(
                mask,
                Handle::ConstantData {
                    value: Constant::Decimal(-0.0),
                },
            );
            return assemble(
                unit,
                id,
                "xorpd",
                vec![
                    OperandSpec {
                        value: first,
                        flags: IN_PLACE,
                        kinds: kinds::MEDIA_REGISTER,
                        size,
                    },
                    OperandSpec {
                        value: mask,
                        flags: flags::READS,
                        kinds: kinds::MEMORY,
                        size,
                    },
                ],
            );
        }

        let operation = match operator {
            UnaryOp::Negate => "neg",
            UnaryOp::Not => "not",
        };
        return assemble(
            unit,
            id,
            operation,
            vec![OperandSpec {
                value: first,
                flags: IN_PLACE,
                kinds: kinds::REGISTER_OR_MEMORY,
                size,
            }],
        );
    }

    let operation = match (operator, decimal) {
        (UnaryOp::Negate, true) => "fneg",
        (UnaryOp::Negate, false) => "neg",
        (UnaryOp::Not, _) => "mvn",
    };
    let register_kinds = if decimal {
        kinds::MEDIA_REGISTER
    } else {
        kinds::REGISTER
    };
    let result = unit.instruction(id).result;
    assemble(
        unit,
        id,
        operation,
        vec![
            OperandSpec {
                value: result,
                flags: flags::DESTINATION | flags::WRITE_ACCESS,
                kinds: register_kinds,
                size,
            },
            OperandSpec {
                value: first,
                flags: flags::READS,
                kinds: register_kinds,
                size,
            },
        ],
    )
}

/// Extend the numerator before an x86-64 division: cqo propagates the sign
/// into the remainder register, a zero store clears it for unsigned
/// divisions.
pub fn build_extend_numerator<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    unsigned: bool,
) -> CompileResult<()> {
    let operation = if unsigned {
        let remainder = unit.remainder()?;
        let name = unit.register(remainder).name(Size::Dword);
        format!("xor {}, {}", name, name)
    } else {
        "cqo".to_string()
    };
    let instruction = unit.instruction_mut(id);
    instruction.operation = operation;
    instruction.built = true;
    Ok(())
}
