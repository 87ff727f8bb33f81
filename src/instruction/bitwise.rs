// This module builds the bitwise operations. Logical operations follow the
// two operand x86-64 form and the three operand AArch64 form. Shift counts on
// x86-64 are either an immediate or the dedicated shift count register, so a
// variable count is staged into that register and the operand renders as its
// byte partition. Right shifts pick the arithmetic or logical form from the
// signedness of the shifted value.

//! Bitwise and shift instruction lowering.

use crate::core::error::CompileResult;
use crate::core::format::Size;
use crate::handle::Handle;
use crate::instruction::{
    assemble, flags, kinds, BitwiseOp, InstrId, OperandSpec, Parameter,
};
use crate::memory;
use crate::unit::Unit;
use crate::value::ValueId;

const IN_PLACE: u32 = flags::DESTINATION
    | flags::WRITE_ACCESS
    | flags::READS
    | flags::ATTACH_TO_DESTINATION;

fn size_of(unit: &Unit<'_>, value: ValueId) -> Size {
    Size::from_bytes(unit.format(value).bytes())
}

fn operation_of(unit: &Unit<'_>, operator: BitwiseOp, first: ValueId) -> &'static str {
    let unsigned = unit.format(first).is_unsigned();
    if unit.target.is_x64() {
        match operator {
            BitwiseOp::And => "and",
            BitwiseOp::Or => "or",
            BitwiseOp::Xor => "xor",
            BitwiseOp::ShiftLeft => "sal",
            BitwiseOp::ShiftRight => {
                if unsigned {
                    "shr"
                } else {
                    "sar"
                }
            }
        }
    } else {
        match operator {
            BitwiseOp::And => "and",
            BitwiseOp::Or => "orr",
            BitwiseOp::Xor => "eor",
            BitwiseOp::ShiftLeft => "lsl",
            BitwiseOp::ShiftRight => {
                if unsigned {
                    "lsr"
                } else {
                    "asr"
                }
            }
        }
    }
}

pub fn build_bitwise<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    operator: BitwiseOp,
    first: ValueId,
    second: ValueId,
    assigns: bool,
) -> CompileResult<()> {
    let operation = operation_of(unit, operator, first);
    let size = size_of(unit, first);

    if unit.target.is_x64() {
        let mut first_flags = IN_PLACE;
        if assigns {
            first_flags |= flags::RELOCATE_TO_DESTINATION;
        }
        let destination_kinds = if assigns {
            kinds::REGISTER_OR_MEMORY
        } else {
            kinds::REGISTER
        };

        if operator.is_shift() {
            let count_is_constant = unit.handle(second).as_constant().is_some();
            if count_is_constant {
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
                            flags: flags::READS | flags::bit_limit(8),
                            kinds: kinds::CONSTANT_OR_REGISTER,
                            size: Size::Byte,
                        },
                    ],
                );
            }
            return build_variable_shift(unit, id, operation, first, second, first_flags, size);
        }

        let second_kinds = if assigns && unit.handle(first).is_memory() {
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

    // AArch64 three operand form. Shift counts take a small immediate, the
    // logical operations keep both sources in registers.
    let second_kinds = if operator.is_shift() {
        kinds::CONSTANT_OR_REGISTER
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
                flags: flags::READS | flags::bit_limit(6),
                kinds: second_kinds,
                size,
            },
        ],
    )
}

/// Stage a variable shift count into the shift register and shift against
/// its byte partition.
fn build_variable_shift<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    operation: &str,
    first: ValueId,
    second: ValueId,
    first_flags: u32,
    size: Size,
) -> CompileResult<()> {
    let shift = unit.shift_register()?;

    if unit.register_of(second) != Some(shift) {
        memory::clear_register(unit, shift)?;
        memory::relocate(unit, second, Handle::Register(shift))?;
        unit.registers[shift.index()].occupant = Some(second);
    }
    unit.lock_register(shift);

    let destination_kinds = if first_flags & flags::RELOCATE_TO_DESTINATION != 0 {
        kinds::REGISTER_OR_MEMORY
    } else {
        kinds::REGISTER
    };
    let destination = memory::convert(unit, first, destination_kinds, first_flags, size)?;

    let instruction = unit.instruction_mut(id);
    instruction.operation = operation.to_string();
    instruction.parameters = vec![
        Parameter {
            value: first,
            flags: first_flags,
            size,
            finalized: Some(destination),
        },
        Parameter {
            value: second,
            flags: flags::READS,
            size: Size::Byte,
            finalized: Some(Handle::Register(shift)),
        },
    ];
    instruction.built = true;

    unit.unlock_register(shift);
    crate::instruction::simulate_parameter_flags(unit, id)
}
