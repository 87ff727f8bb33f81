// This module implements the register caching policy at region boundaries
// and the reconciliation of storage layouts at control flow joins. Caching
// filters the supplied usage descriptors in a fixed order, places the most
// used variables into registers first and may reclaim a register from a less
// used occupant. Symmetry snapshots the layout where control diverges and
// every rejoining path emits the minimal corrective move set back to that
// layout; label merges do the same for forward joins, keyed by label name.

//! Variable caching and control flow join reconciliation.

use hashbrown::HashMap;
use log::{debug, trace};

use crate::core::error::CompileResult;
use crate::core::format::Size;
use crate::handle::{Handle, HandleKind};
use crate::instruction::{InstrId, InstructionKind};
use crate::memory;
use crate::register::Reg;
use crate::scope::VariableUsage;
use crate::unit::Unit;
use crate::value::ValueId;

/// Handle kinds a join snapshot or recorded label state may contain.
const PLACED: &[HandleKind] = &[
    HandleKind::Register,
    HandleKind::MediaRegister,
    HandleKind::Memory,
];

/// Place the supplied variables for the region about to execute. The filter
/// rules apply in order: unresolvable descriptors go first, then unedited
/// constants, then values dead after the region that are not in memory, then
/// aliases of an already kept location.
pub fn build_cache_variables<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    usages: Vec<VariableUsage>,
    non_volatile: bool,
) -> CompileResult<()> {
    let mut descriptors: Vec<(VariableUsage, ValueId)> = Vec::new();
    for usage in usages {
        if let Ok(value) = unit.variable_value(usage.variable) {
            if !unit.handle(value).is_none() {
                descriptors.push((usage, value));
            }
        }
    }

    descriptors.retain(|(usage, value)| usage.edited || !unit.handle(*value).is_constant());
    descriptors.retain(|(usage, value)| usage.used_after || unit.handle(*value).is_memory());

    let mut kept: Vec<(VariableUsage, ValueId)> = Vec::new();
    for (usage, value) in descriptors {
        if !kept.iter().any(|(_, other)| unit.handle(*other) == unit.handle(value)) {
            kept.push((usage, value));
        }
    }

    let mut future: HashMap<ValueId, u32> = HashMap::new();
    for (usage, value) in &kept {
        future.insert(*value, usage.usages);
    }

    let (placed, mut pending): (Vec<_>, Vec<_>) = kept
        .into_iter()
        .partition(|(_, value)| unit.handle(*value).is_register());
    pending.sort_by(|a, b| b.0.usages.cmp(&a.0.usages));

    // Registers already carrying a kept variable stay pinned while the rest
    // are placed.
    let mut locked: Vec<Reg> = Vec::new();
    for (_, value) in &placed {
        if let Some(reg) = unit.register_of(*value) {
            unit.lock_register(reg);
            locked.push(reg);
        }
    }

    for (usage, value) in pending {
        let media = unit.format(value).is_decimal();
        match pick_cache_register(unit, media, non_volatile, usage.usages, &future) {
            Some(reg) => {
                trace!(
                    "caching variable into {}",
                    unit.registers[reg.index()].full_name()
                );
                if unit.registers[reg.index()].occupant.is_some() {
                    unit.release(reg)?;
                }
                memory::relocate(unit, value, Handle::Register(reg))?;
                unit.registers[reg.index()].occupant = Some(value);
                unit.lock_register(reg);
                locked.push(reg);
            }
            None => {
                // No register is justified, make sure the value survives in
                // memory.
                if !unit.handle(value).is_memory() {
                    debug!("releasing uncachable variable to memory");
                    let destination = match unit.variable_home_of(value) {
                        Some(home) => home,
                        None => unit.temporary_memory(unit.format(value).bytes() as i32),
                    };
                    memory::relocate(unit, value, destination)?;
                }
            }
        }
    }

    unit.unlock_all(&locked);
    unit.instruction_mut(id).built = true;
    Ok(())
}

/// An available register of the class, preferring the requested volatility,
/// otherwise a register whose occupant has fewer future uses.
fn pick_cache_register<'a>(
    unit: &Unit<'a>,
    media: bool,
    non_volatile: bool,
    usages: u32,
    future: &HashMap<ValueId, u32>,
) -> Option<Reg> {
    let preference = if non_volatile { [false, true] } else { [true, false] };

    for volatile in preference {
        for index in 0..unit.registers.len() {
            let reg = Reg(index as u8);
            let register = &unit.registers[index];
            if register.is_media() == media
                && register.is_volatile() == volatile
                && unit.is_register_available(reg, unit.position)
            {
                return Some(reg);
            }
        }
    }

    for index in 0..unit.registers.len() {
        let reg = Reg(index as u8);
        let register = &unit.registers[index];
        if register.is_media() != media || !unit.is_register_releasable(reg) {
            continue;
        }
        let occupant_usages = register
            .occupant
            .and_then(|occupant| future.get(&occupant).copied())
            .unwrap_or(0);
        if occupant_usages < usages {
            return Some(reg);
        }
    }
    None
}

/// Write the variables edited inside the current scope back to their stack
/// homes so every path out of the scope agrees on where they live.
pub fn build_merge_scope<'a>(unit: &mut Unit<'a>, id: InstrId) -> CompileResult<()> {
    let loads = match unit.scope {
        Some(scope) => unit.scopes[scope.0 as usize].loads.clone(),
        None => Vec::new(),
    };

    let mut moves: Vec<(ValueId, Handle<'a>)> = Vec::new();
    for (variable, loaded) in loads {
        let current = match unit.variable_value(variable) {
            Ok(current) => current,
            Err(_) => continue,
        };
        if unit.same(current, loaded) {
            continue;
        }
        let home = Handle::StackVariable {
            variable,
            offset: 0,
        };
        moves.push((current, home));
    }

    memory::align(unit, moves)?;
    unit.instruction_mut(id).built = true;
    Ok(())
}

/// Snapshot the current location of every listed variable. Bare constants
/// are forced into real locations first and aliases collapse onto one entry.
/// The snapshot is stored in the instruction so rejoining paths can read it.
pub fn build_symmetry_start<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    variables: Vec<crate::scope::VariableId>,
) -> CompileResult<()> {
    let mut snapshot: Vec<(crate::scope::VariableId, Handle<'a>)> = Vec::new();

    for variable in variables {
        let value = match unit.variable_value(variable) {
            Ok(value) => value,
            Err(_) => continue,
        };
        if unit.handle(value).is_none() {
            continue;
        }
        if !PLACED.contains(&unit.kind_of(value)) {
            let size = Size::from_bytes(unit.format(value).bytes());
            memory::convert(unit, value, PLACED, 0, size)?;
        }
        let handle = unit.handle(value);
        // Aliases collapse into one canonical location.
        if snapshot.iter().any(|(_, other)| *other == handle) {
            continue;
        }
        snapshot.push((variable, handle));
    }

    if let InstructionKind::SymmetryStart { state, .. } = &mut unit.instruction_mut(id).kind {
        *state = snapshot;
    }
    unit.instruction_mut(id).built = true;
    Ok(())
}

/// Reconcile the current layout with the snapshot taken where control
/// diverged. Only values still live at this position take part.
pub fn build_symmetry_end<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    start: InstrId,
) -> CompileResult<()> {
    let snapshot = match &unit.instruction(start).kind {
        InstructionKind::SymmetryStart { state, .. } => state.clone(),
        _ => Vec::new(),
    };

    // The body may have rebound a variable to a new value, so each one is
    // resolved again here and its current value moves into the canonical
    // location.
    let mut moves: Vec<(ValueId, Handle<'a>)> = Vec::new();
    for (variable, handle) in snapshot {
        if handle.is_constant() {
            continue;
        }
        let value = match unit.variable_value(variable) {
            Ok(value) => value,
            Err(_) => continue,
        };
        if unit.handle(value).is_none() {
            continue;
        }
        moves.push((value, handle));
    }

    memory::align(unit, moves)?;
    unit.instruction_mut(id).built = true;
    Ok(())
}

/// Forward join at a label. The first arrival records the unit state, later
/// arrivals reorder their layout to match it.
pub fn build_label_merge<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    label: &'a str,
) -> CompileResult<()> {
    if let Some(state) = unit.state_at(label) {
        let state = state.clone();
        let mut moves: Vec<(ValueId, Handle<'a>)> = Vec::new();
        for (variable, handle) in state {
            let value = match unit.variable_value(variable) {
                Ok(value) => value,
                Err(_) => continue,
            };
            if unit.handle(value).is_none() {
                continue;
            }
            moves.push((value, handle));
        }
        memory::align(unit, moves)?;
        unit.instruction_mut(id).built = true;
        return Ok(());
    }

    // First arrival. Force variables out of handle kinds a later arrival can
    // not reproduce, then record where everything lives.
    let mut variables: Vec<crate::scope::VariableId> = Vec::new();
    let mut scope = unit.scope;
    while let Some(current) = scope {
        for (&variable, _) in unit.scopes[current.0 as usize].variables.iter() {
            if !variables.contains(&variable) {
                variables.push(variable);
            }
        }
        scope = unit.scopes[current.0 as usize].outer;
    }

    let mut state: Vec<(crate::scope::VariableId, Handle<'a>)> = Vec::new();
    for variable in variables {
        let value = match unit.variable_value(variable) {
            Ok(value) => value,
            Err(_) => continue,
        };
        if unit.handle(value).is_none() {
            continue;
        }
        if !PLACED.contains(&unit.kind_of(value)) {
            let size = Size::from_bytes(unit.format(value).bytes());
            memory::convert(unit, value, PLACED, 0, size)?;
        }
        state.push((variable, unit.handle(value)));
    }

    debug!("recording join state at {}", label);
    unit.record_state(label, state);
    unit.instruction_mut(id).built = true;
    Ok(())
}

pub fn build_lock_register<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    register: Reg,
    lock: bool,
) -> CompileResult<()> {
    if lock {
        unit.lock_register(register);
    } else {
        unit.unlock_register(register);
    }
    unit.instruction_mut(id).built = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::Format;
    use crate::core::session::CompilationSession;
    use crate::core::target::TargetConfig;
    use crate::handle::Constant;
    use crate::instruction::{Instruction, InstructionKind};
    use crate::scope::{Variable, VariableCategory, VariableId};
    use crate::unit::{FunctionSignature, Unit, UnitMode};
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

    fn declare<'a>(unit: &mut Unit<'a>, session: &'a CompilationSession<'a>, name: &str) -> VariableId {
        let name = session.intern(name);
        unit.declare_variable(Variable {
            name,
            format: Format::Int64,
            category: VariableCategory::Local,
        })
    }

    fn build<'a>(unit: &mut Unit<'a>, id: InstrId) {
        unit.mode = UnitMode::Build;
        crate::instruction::build_one(unit, id).unwrap();
        unit.mode = UnitMode::Default;
    }

    #[test]
    fn caching_places_the_most_used_variable_first() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session);

        let hot = declare(&mut unit, &session, "hot");
        let cold = declare(&mut unit, &session, "cold");
        unit.enter_scope(vec![hot, cold]);

        let hot_value = unit.variable_value(hot).unwrap();
        let cold_value = unit.variable_value(cold).unwrap();

        let usages = vec![
            VariableUsage { variable: hot, usages: 9, edited: true, used_after: true },
            VariableUsage { variable: cold, usages: 2, edited: true, used_after: true },
        ];
        let result = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::CacheVariables { usages, non_volatile: false },
                result,
            ))
            .unwrap();
        build(&mut unit, id);

        assert!(unit.register_of(hot_value).is_some());
        assert!(unit.register_of(cold_value).is_some());
        assert_ne!(unit.register_of(hot_value), unit.register_of(cold_value));
    }

    #[test]
    fn unedited_constants_are_not_cached() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session);

        let variable = declare(&mut unit, &session, "k");
        unit.enter_scope(vec![variable]);
        let value = unit.variable_value(variable).unwrap();
        unit.set_handle(value, Handle::Constant(Constant::Integer(5)));

        let usages = vec![VariableUsage {
            variable,
            usages: 8,
            edited: false,
            used_after: true,
        }];
        let result = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::CacheVariables { usages, non_volatile: false },
                result,
            ))
            .unwrap();
        build(&mut unit, id);

        assert_eq!(unit.handle(value), Handle::Constant(Constant::Integer(5)));
    }

    #[test]
    fn merge_scope_writes_edited_variables_home() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session);

        let variable = declare(&mut unit, &session, "x");
        unit.enter_scope(vec![variable]);

        // Editing rebinds the variable to a register resident value.
        let edited = unit.new_value(Format::Int64);
        let rcx = unit.register_by_name("rcx").unwrap();
        unit.occupy(rcx, edited);
        unit.write_variable(variable, edited).unwrap();

        let result = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(InstructionKind::MergeScope, result))
            .unwrap();
        build(&mut unit, id);

        assert_eq!(
            unit.handle(edited),
            Handle::StackVariable {
                variable,
                offset: 0
            }
        );
    }

    #[test]
    fn symmetry_restores_the_divergence_layout() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session);

        let variable = declare(&mut unit, &session, "i");
        unit.enter_scope(vec![variable]);

        let value = unit.variable_value(variable).unwrap();
        let rbx = unit.register_by_name("rbx").unwrap();
        unit.occupy(rbx, value);
        unit.use_value_at(value, 0);
        unit.use_value_at(value, 20);

        let start_result = unit.new_value(Format::Int64);
        let start = unit
            .add(Instruction::new(
                InstructionKind::SymmetryStart {
                    variables: vec![variable],
                    state: Vec::new(),
                },
                start_result,
            ))
            .unwrap();
        build(&mut unit, start);

        // The body moves the variable elsewhere.
        let rsi = unit.register_by_name("rsi").unwrap();
        unit.registers[rbx.index()].occupant = None;
        unit.occupy(rsi, value);
        unit.use_value_at(value, 0);
        unit.use_value_at(value, 20);
        unit.position = 2;

        let end_result = unit.new_value(Format::Int64);
        let end = unit
            .add(Instruction::new(
                InstructionKind::SymmetryEnd { start },
                end_result,
            ))
            .unwrap();
        build(&mut unit, end);

        assert_eq!(unit.handle(value), Handle::Register(rbx));
    }

    #[test]
    fn label_merge_records_then_reorders() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session);

        let variable = declare(&mut unit, &session, "n");
        unit.enter_scope(vec![variable]);

        let value = unit.variable_value(variable).unwrap();
        let r12 = unit.register_by_name("r12").unwrap();
        unit.occupy(r12, value);
        unit.use_value_at(value, 0);
        unit.use_value_at(value, 30);

        let label = session.intern("main_L0");
        let first_result = unit.new_value(Format::Int64);
        let first = unit
            .add(Instruction::new(
                InstructionKind::LabelMerge { label },
                first_result,
            ))
            .unwrap();
        build(&mut unit, first);
        assert!(unit.state_at(label).is_some());

        let r13 = unit.register_by_name("r13").unwrap();
        unit.registers[r12.index()].occupant = None;
        unit.occupy(r13, value);
        unit.use_value_at(value, 0);
        unit.use_value_at(value, 30);
        unit.position = 2;

        let second_result = unit.new_value(Format::Int64);
        let second = unit
            .add(Instruction::new(
                InstructionKind::LabelMerge { label },
                second_result,
            ))
            .unwrap();
        build(&mut unit, second);

        assert_eq!(unit.handle(value), Handle::Register(r12));
    }

    #[test]
    fn lock_instruction_pins_and_unpins() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut unit = unit(&session);

        let rbx = unit.register_by_name("rbx").unwrap();
        let result = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::LockRegister { register: rbx, lock: true },
                result,
            ))
            .unwrap();
        build(&mut unit, id);
        assert!(unit.register(rbx).is_locked());

        let result = unit.new_value(Format::Int64);
        let id = unit
            .add(Instruction::new(
                InstructionKind::LockRegister { register: rbx, lock: false },
                result,
            ))
            .unwrap();
        build(&mut unit, id);
        assert!(!unit.register(rbx).is_locked());
    }
}
