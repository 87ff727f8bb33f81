// This module derives register placement directives for a value by scanning
// the instruction window its lifetime spans. A value that lives across a call
// prefers a non-volatile register so it survives without evacuation. A value
// live across an x86-64 division must stay clear of the numerator and
// remainder registers, and one live across a variable shift must stay clear
// of the shift count register. A value that flows into a return close to its
// last use is steered directly into the return register.

//! Register placement directives derived from value lifetimes.

use crate::instruction::InstructionKind;
use crate::register::Reg;
use crate::unit::Unit;
use crate::value::ValueId;

/// A recommendation for where a value should be placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Prefer a non-volatile register.
    NonVolatility,
    /// Place the value directly into this register if possible.
    SpecificRegister(Reg),
    /// Keep the value out of these registers.
    AvoidRegisters(Vec<Reg>),
}

/// Whether the value's remaining lifetime crosses a call.
pub fn crosses_call<'a>(unit: &Unit<'a>, value: ValueId) -> bool {
    let position = unit.position;
    for id in unit.order() {
        let instruction = unit.instruction(*id);
        if instruction.position <= position || !unit.is_used_after(value, instruction.position) {
            continue;
        }
        if matches!(instruction.kind, InstructionKind::Call { .. }) {
            return true;
        }
    }
    false
}

/// Directives for the value, derived from the instructions inside its
/// remaining lifetime window.
pub fn directives_for<'a>(unit: &Unit<'a>, value: ValueId) -> Vec<Directive> {
    let position = unit.position;
    let mut directives = Vec::new();
    let mut avoid: Vec<Reg> = Vec::new();

    for id in unit.order() {
        let instruction = unit.instruction(*id);
        if instruction.position <= position {
            continue;
        }
        if !unit.is_used_after(value, instruction.position - 1) {
            break;
        }

        match &instruction.kind {
            InstructionKind::Call { .. } | InstructionKind::Evacuate => {
                if !directives.contains(&Directive::NonVolatility) {
                    directives.push(Directive::NonVolatility);
                }
            }
            InstructionKind::Division { .. } if unit.target.is_x64() => {
                if let (Ok(numerator), Ok(remainder)) = (unit.numerator(), unit.remainder()) {
                    push_avoid(&mut avoid, numerator);
                    push_avoid(&mut avoid, remainder);
                }
            }
            InstructionKind::Bitwise { operator, second, .. }
                if unit.target.is_x64() && operator.is_shift() =>
            {
                // A variable shift count claims the shift register.
                if unit.handle(*second).as_constant().is_none() {
                    if let Ok(shift) = unit.shift_register() {
                        push_avoid(&mut avoid, shift);
                    }
                }
            }
            InstructionKind::Return { value: Some(returned) } => {
                if unit.same(*returned, value) {
                    let media = unit.format(value).is_decimal();
                    if let Ok(reg) = unit.return_register(media) {
                        directives.push(Directive::SpecificRegister(reg));
                    }
                }
            }
            _ => {}
        }
    }

    if !avoid.is_empty() {
        directives.push(Directive::AvoidRegisters(avoid));
    }
    directives
}

fn push_avoid(avoid: &mut Vec<Reg>, reg: Reg) {
    if !avoid.contains(&reg) {
        avoid.push(reg);
    }
}
