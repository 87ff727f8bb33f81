// This module runs between the simulation and build passes, when constant
// handles are known but no register has been chosen yet. Two rewrites run
// over the instruction stream. Returned values are steered into the return
// register by redirecting their producer, so no corrective move is needed
// before the epilogue. Adjacent constant-plus-scaled-multiply pairs collapse
// into a single address computation: the multiplication becomes silent and
// the addition becomes a move from an address expression that one `lea`
// materializes.

//! Pre-build redirect and fusion pass.

use log::{debug, trace};

use crate::core::error::CompileResult;
use crate::handle::{Constant, Handle};
use crate::instruction::{InstrId, InstructionKind, MoveMode};
use crate::unit::Unit;
use crate::value::ValueId;

pub fn run<'a>(unit: &mut Unit<'a>) -> CompileResult<()> {
    fuse_scaled_additions(unit);
    steer_returns(unit)?;
    Ok(())
}

/// Strides a scaled index expression can carry, minus the extra base term.
fn expressible_multiplier(handle: &Handle<'_>) -> Option<i32> {
    match handle.as_constant() {
        Some(Constant::Integer(value)) if matches!(value, 3 | 5 | 9) => Some(value as i32 - 1),
        _ => None,
    }
}

/// Collapse `k + m * b` with the multiplication immediately preceding the
/// addition and its result dying there. The pair becomes one expression
/// handle, materialized by whichever consumer needs a concrete location.
fn fuse_scaled_additions<'a>(unit: &mut Unit<'a>) {
    if !unit.target.is_x64() {
        return;
    }

    let order: Vec<InstrId> = unit.order().to_vec();
    for window in order.windows(2) {
        let (producer, consumer) = (window[0], window[1]);
        if unit.instruction(producer).built || unit.instruction(consumer).built {
            continue;
        }

        let (base, stride, product) = match &unit.instruction(producer).kind {
            InstructionKind::Multiplication {
                first,
                second,
                assigns: false,
            } => match expressible_multiplier(&unit.handle(*second)) {
                Some(stride) => (*first, stride, unit.instruction(producer).result),
                None => continue,
            },
            _ => continue,
        };

        let displacement = match &unit.instruction(consumer).kind {
            InstructionKind::Addition {
                first,
                second,
                assigns: false,
            } => {
                let (product_side, other) = if unit.same(*second, product) {
                    (*second, *first)
                } else if unit.same(*first, product) {
                    (*first, *second)
                } else {
                    continue;
                };
                if unit.is_used_after(product_side, unit.instruction(consumer).position) {
                    continue;
                }
                match unit.handle(other).as_constant() {
                    Some(Constant::Integer(value)) => value as i32,
                    _ => continue,
                }
            }
            _ => continue,
        };

        trace!("fusing scaled multiplication into an address computation");
        let format = unit.format(product);
        let expression = unit.new_value(format);
        unit.set_handle(
            expression,
            Handle::Expression {
                base: Some(base),
                index: Some(base),
                stride,
                displacement,
            },
        );

        let result = unit.instruction(consumer).result;
        unit.instruction_mut(producer).kind = InstructionKind::Nop;
        unit.instruction_mut(consumer).kind = InstructionKind::Move {
            destination: result,
            source: expression,
            mode: MoveMode::Copy,
        };
    }
}

/// Redirect the producer of each returned value into the return register,
/// provided nothing between producer and return can disturb that register.
fn steer_returns<'a>(unit: &mut Unit<'a>) -> CompileResult<()> {
    let order: Vec<InstrId> = unit.order().to_vec();

    for (index, id) in order.iter().enumerate() {
        let value = match unit.instruction(*id).kind {
            InstructionKind::Return { value: Some(value) } => value,
            _ => continue,
        };

        let producer = match producer_of(unit, &order, index, value) {
            Some(producer) => producer,
            None => continue,
        };
        if !window_is_stable(unit, &order, producer.1 + 1, index) {
            continue;
        }

        let media = unit.format(value).is_decimal();
        let reg = unit.return_register(media)?;
        let target = Handle::Register(reg);
        let x64 = unit.target.is_x64();
        if unit.instruction_mut(producer.0).redirect(target, x64)? {
            debug!(
                "steering returned value into {}",
                unit.registers[reg.index()].full_name()
            );
        }
    }
    Ok(())
}

fn producer_of<'a>(
    unit: &Unit<'a>,
    order: &[InstrId],
    before: usize,
    value: ValueId,
) -> Option<(InstrId, usize)> {
    for index in (0..before).rev() {
        let id = order[index];
        let instruction = unit.instruction(id);
        if !instruction.built && unit.same(instruction.result, value) {
            return Some((id, index));
        }
    }
    None
}

/// Whether no instruction in the window can clobber the return register.
fn window_is_stable<'a>(unit: &Unit<'a>, order: &[InstrId], from: usize, to: usize) -> bool {
    order[from..to].iter().all(|id| {
        !matches!(
            unit.instruction(*id).kind,
            InstructionKind::Call { .. }
                | InstructionKind::Evacuate
                | InstructionKind::Division { .. }
                | InstructionKind::ExtendNumerator { .. }
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::Format;
    use crate::core::session::CompilationSession;
    use crate::core::target::TargetConfig;
    use crate::instruction::{Callee, Instruction};
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
    fn returned_producers_are_steered_into_the_return_register() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session);

        let a = unit.new_value(Format::Int64);
        let b = unit.new_value(Format::Int64);
        let sum = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::Addition {
                    first: a,
                    second: b,
                    assigns: false,
                },
                sum,
            ))
            .unwrap();
        let return_result = unit.new_value(Format::Int64);
        unit.add(Instruction::new(
            InstructionKind::Return { value: Some(sum) },
            return_result,
        ))
        .unwrap();

        run(&mut unit).unwrap();

        let rax = unit.return_register(false).unwrap();
        assert_eq!(
            unit.instruction(id).redirect_target,
            Some(Handle::Register(rax))
        );
    }

    #[test]
    fn calls_between_producer_and_return_block_steering() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session);

        let a = unit.new_value(Format::Int64);
        let b = unit.new_value(Format::Int64);
        let sum = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::Addition {
                    first: a,
                    second: b,
                    assigns: false,
                },
                sum,
            ))
            .unwrap();
        let call_result = unit.new_value(Format::Int64);
        unit.add(Instruction::new(
            InstructionKind::Call {
                callee: Callee::Symbol(session.intern("helper")),
                destinations: Vec::new(),
                return_format: None,
            },
            call_result,
        ))
        .unwrap();
        let return_result = unit.new_value(Format::Int64);
        unit.add(Instruction::new(
            InstructionKind::Return { value: Some(sum) },
            return_result,
        ))
        .unwrap();

        run(&mut unit).unwrap();
        assert_eq!(unit.instruction(id).redirect_target, None);
    }

    #[test]
    fn constant_plus_scaled_multiply_fuses_into_one_expression() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session);

        let b = unit.new_value(Format::Int64);
        let five = unit.new_value(Format::Int64);
        unit.set_handle(five, Handle::Constant(Constant::Integer(5)));
        let k = unit.new_value(Format::Int64);
        unit.set_handle(k, Handle::Constant(Constant::Integer(24)));

        let product = unit.new_value(Format::Int64);
        let mul = unit
            .add(Instruction::new(
                InstructionKind::Multiplication {
                    first: b,
                    second: five,
                    assigns: false,
                },
                product,
            ))
            .unwrap();
        let sum = unit.new_value(Format::Int64);
        let add = unit
            .add(Instruction::new(
                InstructionKind::Addition {
                    first: k,
                    second: product,
                    assigns: false,
                },
                sum,
            ))
            .unwrap();

        run(&mut unit).unwrap();

        assert!(matches!(unit.instruction(mul).kind, InstructionKind::Nop));
        let source = match &unit.instruction(add).kind {
            InstructionKind::Move { source, .. } => *source,
            other => panic!("expected a move, found {:?}", other),
        };
        assert_eq!(
            unit.handle(source),
            Handle::Expression {
                base: Some(b),
                index: Some(b),
                stride: 4,
                displacement: 24
            }
        );
    }
}
