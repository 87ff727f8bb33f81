// This module resolves the abstract value producers during the simulation
// pass. Constants become immediate or data section handles, variable reads
// join the reader onto the variable's current value so both share storage,
// variable writes update the scope chain, memory address computations fold
// constant offsets into plain displacements and stack allocations receive
// their identity. None of these produce operations of their own.

//! Simulation of constants, variable accesses and address computations.

use crate::core::error::CompileResult;
use crate::core::format::Format;
use crate::handle::{Constant, Handle};
use crate::instruction::{AccessMode, InstrId};
use crate::scope::VariableId;
use crate::unit::Unit;
use crate::value::ValueId;

pub fn simulate_get_constant<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    constant: Constant,
) -> CompileResult<()> {
    let result = unit.instruction(id).result;
    if constant.is_decimal() {
        // Decimal immediates are not encodable, they are loaded from the
        // data section instead.
        unit.set_format(result, Format::Decimal);
        unit.set_handle(result, Handle::ConstantData { value: constant });
    } else {
        unit.set_handle(result, Handle::Constant(constant));
    }
    Ok(())
}

pub fn simulate_get_variable<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    variable: VariableId,
) -> CompileResult<()> {
    let result = unit.instruction(id).result;
    let current = unit.variable_value(variable)?;
    // The reader shares the variable's storage from here on.
    unit.join(result, current);
    Ok(())
}

/// Resolve the required variables to their current values so the dependency
/// replay keeps them alive through the whole region.
pub fn simulate_require_variables<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    variables: Vec<VariableId>,
) -> CompileResult<()> {
    let mut values = Vec::with_capacity(variables.len());
    for variable in &variables {
        values.push(unit.variable_value(*variable)?);
    }

    let position = unit.instruction(id).position;
    for value in &values {
        unit.use_value_at(*value, position);
    }
    if let crate::instruction::InstructionKind::RequireVariables {
        values: resolved, ..
    } = &mut unit.instruction_mut(id).kind
    {
        *resolved = values;
    }
    Ok(())
}

pub fn simulate_set_variable<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    variable: VariableId,
    source: ValueId,
) -> CompileResult<()> {
    let result = unit.instruction(id).result;
    unit.write_variable(variable, source)?;
    unit.join(result, source);
    Ok(())
}

pub fn simulate_get_memory_address<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    mode: AccessMode,
    start: ValueId,
    offset: ValueId,
    stride: i32,
) -> CompileResult<()> {
    let result = unit.instruction(id).result;

    // A constant offset folds into the displacement.
    let folded = match unit.handle(offset) {
        Handle::Constant(Constant::Integer(value)) => Some(value as i32 * stride),
        _ => None,
    };

    let handle = match (mode, folded) {
        (AccessMode::Address, Some(displacement)) => Handle::Expression {
            base: Some(start),
            index: None,
            stride: 1,
            displacement,
        },
        (AccessMode::Address, None) => Handle::Expression {
            base: Some(start),
            index: Some(offset),
            stride,
            displacement: 0,
        },
        (_, Some(displacement)) => Handle::Memory {
            base: start,
            offset: displacement,
        },
        (_, None) => Handle::ComplexMemory {
            base: start,
            index: offset,
            stride,
            displacement: 0,
        },
    };

    unit.set_handle(result, handle);
    Ok(())
}

pub fn simulate_allocate_stack<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    bytes: i32,
) -> CompileResult<()> {
    let result = unit.instruction(id).result;
    let identity = unit.next_identity();
    unit.set_handle(
        result,
        Handle::StackAllocation {
            identity,
            bytes,
            offset: 0,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::CompilationSession;
    use crate::core::target::TargetConfig;
    use crate::instruction::{Instruction, InstructionKind};
    use crate::scope::{Variable, VariableCategory};
    use crate::unit::{FunctionSignature, Unit};
    use bumpalo::Bump;

    fn unit<'a>(session: &'a CompilationSession<'a>) -> Unit<'a> {
        Unit::new(
            session,
            TargetConfig::x64(),
            FunctionSignature {
                name: session.intern("sample"),
                parameters: Vec::new(),
                return_format: None,
            },
        )
    }

    #[test]
    fn constants_resolve_to_immediates_or_data() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session);

        let integer = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::GetConstant {
                    constant: Constant::Integer(7),
                },
                integer,
            ))
            .unwrap();
        simulate_get_constant(&mut unit, id, Constant::Integer(7)).unwrap();
        assert_eq!(unit.handle(integer), Handle::Constant(Constant::Integer(7)));

        let decimal = unit.new_value(Format::Decimal);
        let id = unit
            .add(Instruction::new(
                InstructionKind::GetConstant {
                    constant: Constant::Decimal(2.5),
                },
                decimal,
            ))
            .unwrap();
        simulate_get_constant(&mut unit, id, Constant::Decimal(2.5)).unwrap();
        assert_eq!(
            unit.handle(decimal),
            Handle::ConstantData {
                value: Constant::Decimal(2.5)
            }
        );
    }

    #[test]
    fn variable_reads_share_storage_and_writes_rebind() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session);

        let variable = unit.declare_variable(Variable {
            name: session.intern("x"),
            format: Format::Int64,
            category: VariableCategory::Local,
        });
        unit.enter_scope(vec![variable]);

        let read = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::GetVariable { variable },
                read,
            ))
            .unwrap();
        simulate_get_variable(&mut unit, id, variable).unwrap();
        let current = unit.variable_value(variable).unwrap();
        assert!(unit.same(read, current));

        let source = unit.new_value(Format::Int64);
        let result = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::SetVariable { variable, source },
                result,
            ))
            .unwrap();
        simulate_set_variable(&mut unit, id, variable, source).unwrap();
        assert_eq!(unit.variable_value(variable).unwrap(), source);
    }

    #[test]
    fn constant_offsets_fold_into_displacements() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session);

        let start = unit.new_value(Format::Int64);
        let offset = unit.new_value(Format::Int64);
        unit.set_handle(offset, Handle::Constant(Constant::Integer(3)));

        let result = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::GetMemoryAddress {
                    mode: AccessMode::Read,
                    start,
                    offset,
                    stride: 8,
                },
                result,
            ))
            .unwrap();
        simulate_get_memory_address(&mut unit, id, AccessMode::Read, start, offset, 8).unwrap();
        assert_eq!(
            unit.handle(result),
            Handle::Memory {
                base: start,
                offset: 24
            }
        );

        let address = unit.new_value(Format::Int64);
        let index = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::GetMemoryAddress {
                    mode: AccessMode::Address,
                    start,
                    offset: index,
                    stride: 4,
                },
                address,
            ))
            .unwrap();
        simulate_get_memory_address(&mut unit, id, AccessMode::Address, start, index, 4).unwrap();
        assert_eq!(
            unit.handle(address),
            Handle::Expression {
                base: Some(start),
                index: Some(index),
                stride: 4,
                displacement: 0
            }
        );
    }

    #[test]
    fn stack_allocations_receive_distinct_identities() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session);

        let first = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::AllocateStack { bytes: 32 },
                first,
            ))
            .unwrap();
        simulate_allocate_stack(&mut unit, id, 32).unwrap();

        let second = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::AllocateStack { bytes: 16 },
                second,
            ))
            .unwrap();
        simulate_allocate_stack(&mut unit, id, 16).unwrap();

        match (unit.handle(first), unit.handle(second)) {
            (
                Handle::StackAllocation { identity: a, bytes: 32, .. },
                Handle::StackAllocation { identity: b, bytes: 16, .. },
            ) => assert_ne!(a, b),
            other => panic!("unexpected handles {:?}", other),
        }
    }

    #[test]
    fn required_variables_resolve_into_dependencies() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session);

        let variable = unit.declare_variable(Variable {
            name: session.intern("i"),
            format: Format::Int64,
            category: VariableCategory::Local,
        });
        unit.enter_scope(vec![variable]);
        let current = unit.variable_value(variable).unwrap();

        let result = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::RequireVariables {
                    variables: vec![variable],
                    values: Vec::new(),
                },
                result,
            ))
            .unwrap();
        simulate_require_variables(&mut unit, id, vec![variable]).unwrap();

        match &unit.instruction(id).kind {
            InstructionKind::RequireVariables { values, .. } => {
                assert_eq!(values.as_slice(), &[current]);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert!(unit.instruction(id).dependencies().contains(&current));
    }
}
