// This module builds comparisons. Comparing against zero on x86-64 folds into
// a test of the register against itself. Decimal comparisons use the ordered
// compare forms. A comparison only sets flags, so no operand is a
// destination and the following conditional jump picks the branch form.

//! Comparison lowering.

use crate::core::error::CompileResult;
use crate::core::format::Size;
use crate::instruction::{assemble, flags, kinds, InstrId, OperandSpec, Parameter};
use crate::memory;
use crate::unit::Unit;
use crate::value::ValueId;

fn size_of(unit: &Unit<'_>, value: ValueId) -> Size {
    Size::from_bytes(unit.format(value).bytes())
}

pub fn build_compare<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    first: ValueId,
    second: ValueId,
) -> CompileResult<()> {
    let decimal = unit.format(first).is_decimal();
    let size = size_of(unit, first);

    if decimal {
        let operation = if unit.target.is_x64() { "comisd" } else { "fcmp" };
        let second_kinds = if unit.target.is_x64() {
            kinds::MEDIA_OR_MEMORY
        } else {
            kinds::MEDIA_REGISTER
        };
        return assemble(
            unit,
            id,
            operation,
            vec![
                OperandSpec {
                    value: first,
                    flags: flags::READS,
                    kinds: kinds::MEDIA_REGISTER,
                    size,
                },
                OperandSpec {
                    value: second,
                    flags: flags::READS,
                    kinds: second_kinds,
                    size,
                },
            ],
        );
    }

    let second_is_zero = unit
        .handle(second)
        .as_constant()
        .map(|constant| constant.is_zero())
        .unwrap_or(false);

    if unit.target.is_x64() {
        // Compare with zero folds into a self test once the value is in a
        // register.
        if second_is_zero {
            let handle = memory::convert(unit, first, kinds::REGISTER, flags::READS, size)?;
            let instruction = unit.instruction_mut(id);
            instruction.operation = "test".to_string();
            instruction.parameters = vec![
                Parameter {
                    value: first,
                    flags: flags::READS,
                    size,
                    finalized: Some(handle.clone()),
                },
                Parameter {
                    value: first,
                    flags: flags::READS,
                    size,
                    finalized: Some(handle),
                },
            ];
            instruction.built = true;
            return Ok(());
        }

        let first_is_memory = unit.handle(first).is_memory();
        let second_kinds = if first_is_memory {
            kinds::CONSTANT_OR_REGISTER
        } else {
            kinds::CONSTANT_REGISTER_MEMORY
        };
        return assemble(
            unit,
            id,
            "cmp",
            vec![
                OperandSpec {
                    value: first,
                    flags: flags::READS,
                    kinds: kinds::REGISTER_OR_MEMORY,
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

    assemble(
        unit,
        id,
        "cmp",
        vec![
            OperandSpec {
                value: first,
                flags: flags::READS,
                kinds: kinds::REGISTER,
                size,
            },
            OperandSpec {
                value: second,
                flags: flags::READS | flags::bit_limit(12),
                kinds: kinds::CONSTANT_OR_REGISTER,
                size,
            },
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::Format;
    use crate::core::session::CompilationSession;
    use crate::core::target::TargetConfig;
    use crate::handle::{Constant, Handle};
    use crate::instruction::{Instruction, InstructionKind};
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

    fn build<'a>(unit: &mut Unit<'a>, first: ValueId, second: ValueId) -> InstrId {
        let result = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::Compare { first, second },
                result,
            ))
            .unwrap();
        unit.mode = UnitMode::Build;
        crate::instruction::build_one(unit, id).unwrap();
        unit.mode = UnitMode::Default;
        id
    }

    #[test]
    fn zero_comparisons_fold_into_a_self_test() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session, TargetConfig::x64());

        let first = unit.new_value(Format::Int64);
        let rbx = unit.register_by_name("rbx").unwrap();
        unit.occupy(rbx, first);

        let second = unit.new_value(Format::Int64);
        unit.set_handle(second, Handle::Constant(Constant::Integer(0)));

        let id = build(&mut unit, first, second);
        let built = unit.instruction(id);
        assert_eq!(built.operation, "test");
        assert_eq!(built.parameters[0].finalized, built.parameters[1].finalized);
    }

    #[test]
    fn wide_immediates_are_materialized_before_comparing() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session, TargetConfig::x64());

        let first = unit.new_value(Format::Int64);
        let rbx = unit.register_by_name("rbx").unwrap();
        unit.occupy(rbx, first);

        let second = unit.new_value(Format::Int64);
        unit.set_handle(
            second,
            Handle::Constant(Constant::Integer(0x1_0000_0000)),
        );

        let id = build(&mut unit, first, second);
        let built = unit.instruction(id);
        assert_eq!(built.operation, "cmp");
        assert!(built.parameters[1].finalized.as_ref().unwrap().is_register());
    }
}
