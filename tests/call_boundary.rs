// Call boundaries: volatile values that survive a call are moved to safety,
// arguments land in their convention slots and the link register is saved on
// AArch64 as soon as the body calls.

use bumpalo::Bump;
use kiln::instruction::call::call_with_arguments;
use kiln::instruction::{Instruction, InstructionKind};
use kiln::scope::{Variable, VariableCategory};
use kiln::{
    lower_function, CompilationSession, Format, FunctionSignature, Handle, TargetConfig, Unit,
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

#[test]
fn values_living_past_a_call_leave_volatile_registers() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::x64());

    let survivor = unit.new_value(Format::Int64);
    let rcx = unit.register_by_name("rcx").unwrap();
    unit.occupy(rcx, survivor);

    let call = call_with_arguments(&mut unit, session.intern("helper"), Vec::new(), Some(Format::Int64)).unwrap();
    let returned = unit.instruction(call).result;

    // Reading the survivor after the call keeps it alive across it.
    let sum = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::Addition {
            first: returned,
            second: survivor,
            assigns: false,
        },
        sum,
    ))
    .unwrap();

    unit.build_pass().unwrap();

    match unit.register_of(survivor) {
        Some(reg) => assert!(!unit.register(reg).is_volatile()),
        // Released to memory is equally safe.
        None => assert!(unit.handle(survivor).is_memory()),
    }
}

#[test]
fn arguments_reach_their_convention_slots() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::x64());

    let first = unit.new_value(Format::Int64);
    let rbx = unit.register_by_name("rbx").unwrap();
    unit.occupy(rbx, first);
    let second = unit.new_value(Format::Int64);
    let r12 = unit.register_by_name("r12").unwrap();
    unit.occupy(r12, second);

    call_with_arguments(
        &mut unit,
        session.intern("helper"),
        vec![first, second],
        None,
    )
    .unwrap();
    unit.build_pass().unwrap();

    // The marshalling moves target the convention registers in order.
    let rdi = unit.register_by_name("rdi").unwrap();
    let rsi = unit.register_by_name("rsi").unwrap();
    let mut destinations = Vec::new();
    for id in unit.order().to_vec() {
        let instruction = unit.instruction(id);
        if instruction.operation != "mov" {
            continue;
        }
        for parameter in &instruction.parameters {
            if !parameter.is_destination() {
                continue;
            }
            if let Some(Handle::Register(reg)) = &parameter.finalized {
                destinations.push(*reg);
            }
        }
    }
    assert!(destinations.contains(&rdi));
    assert!(destinations.contains(&rsi));
}

#[test]
fn arm64_saves_the_link_register_when_the_body_calls() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::arm64());

    let variable = unit.declare_variable(Variable {
        name: session.intern("a"),
        format: Format::Int64,
        category: VariableCategory::Parameter,
    });
    unit.function.parameters.push(variable);
    unit.enter_scope(vec![variable]);

    let loaded = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::GetVariable { variable },
        loaded,
    ))
    .unwrap();
    let call = call_with_arguments(
        &mut unit,
        session.intern("helper"),
        vec![loaded],
        Some(Format::Int64),
    )
    .unwrap();
    let returned = unit.instruction(call).result;
    let result = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::Return {
            value: Some(returned),
        },
        result,
    ))
    .unwrap();
    unit.exit_scope();

    let lines = lower_function(&mut unit).unwrap();
    assert!(lines.iter().any(|line| line == "bl helper"));
    assert!(lines
        .iter()
        .any(|line| line.contains("x30") && line.contains("[sp, #-16]!")));
    assert!(lines
        .iter()
        .any(|line| line.contains("x30") && line.contains("[sp], #16")));
}

#[test]
fn the_call_result_arrives_in_the_return_register() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::x64());

    let call = call_with_arguments(
        &mut unit,
        session.intern("helper"),
        Vec::new(),
        Some(Format::Int64),
    )
    .unwrap();
    let returned = unit.instruction(call).result;
    unit.build_pass().unwrap();

    let rax = unit.register_by_name("rax").unwrap();
    assert_eq!(unit.register_of(returned), Some(rax));
}
