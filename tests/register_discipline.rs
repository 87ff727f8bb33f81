// Allocation discipline: one live claimant per register, locked registers
// stay untouched, redundant moves disappear and constant multiplies and
// divides by powers of two become shifts.

use bumpalo::Bump;
use kiln::instruction::{Instruction, InstructionKind};
use kiln::memory;
use kiln::{
    CompilationSession, Constant, Format, FunctionSignature, Handle, TargetConfig, Unit, ValueId,
};

fn unit<'a>(session: &'a CompilationSession<'a>, target: TargetConfig) -> Unit<'a> {
    let _ = env_logger::builder().is_test(true).try_init();
    Unit::new(
        session,
        target,
        FunctionSignature {
            name: session.intern("sample"),
            parameters: Vec::new(),
            return_format: Some(Format::Int64),
        },
    )
}

fn live_register_value<'a>(unit: &mut Unit<'a>, name: &str) -> ValueId {
    let value = unit.new_value(Format::Int64);
    let reg = unit.register_by_name(name).unwrap();
    unit.occupy(reg, value);
    unit.use_value_at(value, 100);
    value
}

#[test]
fn next_register_never_returns_a_live_claimants_register() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::x64());

    let claimed = live_register_value(&mut unit, "rbx");
    let rbx = unit.register_by_name("rbx").unwrap();

    for _ in 0..8 {
        let reg = unit.next_register(false, &[]).unwrap();
        assert_ne!(reg, rbx);
        let value = unit.new_value(Format::Int64);
        unit.occupy(reg, value);
        unit.use_value_at(value, 100);
    }
    assert_eq!(unit.register_of(claimed), Some(rbx));
}

#[test]
fn locked_registers_are_skipped() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::x64());

    let rcx = unit.register_by_name("rcx").unwrap();
    unit.lock_register(rcx);

    for _ in 0..12 {
        match unit.next_register(false, &[]) {
            Ok(reg) => {
                assert_ne!(reg, rcx);
                let value = unit.new_value(Format::Int64);
                unit.occupy(reg, value);
                unit.use_value_at(value, 100);
            }
            // Running out with the lock held is fine, handing out the
            // locked register is not.
            Err(_) => break,
        }
    }
    unit.unlock_register(rcx);
}

#[test]
fn stale_occupants_free_their_register() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::x64());

    let value = live_register_value(&mut unit, "rbx");
    let rbx = unit.register_by_name("rbx").unwrap();

    // Once the value moves to memory the register no longer counts as held.
    let slot = unit.temporary_memory(8);
    unit.set_handle(value, slot);
    assert!(unit.is_register_available(rbx, 0));
}

#[test]
fn moving_a_value_onto_itself_emits_nothing() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::x64());

    let value = live_register_value(&mut unit, "rbx");
    let before = unit.order().len();
    let moved = memory::move_to_register(&mut unit, value, false, kiln::Size::Qword).unwrap();
    assert_eq!(unit.order().len(), before);
    let rbx = unit.register_by_name("rbx").unwrap();
    assert_eq!(moved, Handle::Register(rbx));
}

#[test]
fn multiply_by_power_of_two_becomes_a_shift() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::x64());

    let first = live_register_value(&mut unit, "rbx");
    let second = unit.new_value(Format::Int64);
    unit.set_handle(second, Handle::Constant(Constant::Integer(8)));

    let result = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::Multiplication {
            first,
            second,
            assigns: false,
        },
        result,
    ))
    .unwrap();
    unit.build_pass().unwrap();

    let operations: Vec<String> = unit
        .order()
        .iter()
        .map(|id| unit.instruction(*id).operation.clone())
        .collect();
    assert!(operations.iter().any(|op| op == "sal"));
    assert!(!operations.iter().any(|op| op == "imul"));
}

#[test]
fn unsigned_divide_by_power_of_two_becomes_a_shift() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::x64());

    let first = live_register_value(&mut unit, "rbx");
    unit.set_format(first, Format::Uint64);
    let second = unit.new_value(Format::Uint64);
    unit.set_handle(second, Handle::Constant(Constant::Integer(16)));

    let result = unit.new_value(Format::Uint64);
    unit.add(Instruction::new(
        InstructionKind::Division {
            first,
            second,
            modulus: false,
            assigns: false,
            unsigned: true,
        },
        result,
    ))
    .unwrap();
    unit.build_pass().unwrap();

    let operations: Vec<String> = unit
        .order()
        .iter()
        .map(|id| unit.instruction(*id).operation.clone())
        .collect();
    assert!(operations.iter().any(|op| op == "shr"));
    assert!(!operations.iter().any(|op| op == "div" || op == "idiv"));
}

#[test]
fn signed_divide_by_power_of_two_becomes_an_arithmetic_shift() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::x64());

    let first = live_register_value(&mut unit, "rbx");
    let second = unit.new_value(Format::Int64);
    unit.set_handle(second, Handle::Constant(Constant::Integer(8)));

    let result = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::Division {
            first,
            second,
            modulus: false,
            assigns: false,
            unsigned: false,
        },
        result,
    ))
    .unwrap();
    unit.build_pass().unwrap();

    let operations: Vec<String> = unit
        .order()
        .iter()
        .map(|id| unit.instruction(*id).operation.clone())
        .collect();
    assert!(operations.iter().any(|op| op == "sar"));
    assert!(!operations.iter().any(|op| op == "idiv"));
}
