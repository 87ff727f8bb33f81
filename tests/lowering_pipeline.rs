// End to end lowering of small function bodies on both targets, checking the
// complete pipeline from recording to rendered assembly.

use bumpalo::Bump;
use kiln::instruction::{Instruction, InstructionKind};
use kiln::scope::{Variable, VariableCategory};
use kiln::{
    assembly_header, lower_function, CompilationSession, Constant, Format, FunctionSignature,
    TargetConfig, Unit, ValueId,
};

fn unit<'a>(
    session: &'a CompilationSession<'a>,
    target: TargetConfig,
    name: &str,
) -> Unit<'a> {
    let _ = env_logger::builder().is_test(true).try_init();
    let name = session.intern(name);
    Unit::new(
        session,
        target,
        FunctionSignature {
            name,
            parameters: Vec::new(),
            return_format: Some(Format::Int64),
        },
    )
}

fn with_parameter<'a>(unit: &mut Unit<'a>, name: &'a str) -> ValueId {
    let variable = unit.declare_variable(Variable {
        name,
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
    loaded
}

fn return_value<'a>(unit: &mut Unit<'a>, value: ValueId) {
    let result = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::Return { value: Some(value) },
        result,
    ))
    .unwrap();
    unit.exit_scope();
}

#[test]
fn constant_return_on_x64() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::x64(), "seven");

    unit.enter_scope(Vec::new());
    let value = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::GetConstant {
            constant: Constant::Integer(7),
        },
        value,
    ))
    .unwrap();
    return_value(&mut unit, value);

    let lines = lower_function(&mut unit).unwrap();
    assert_eq!(lines[0], ".global seven");
    assert_eq!(lines[1], "seven:");
    assert!(lines.iter().any(|line| line == "mov rax, 7"));
    assert_eq!(lines.last().unwrap(), "ret");
}

#[test]
fn identity_needs_one_move_on_x64() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::x64(), "identity");

    let name = session.intern("a");
    let loaded = with_parameter(&mut unit, name);
    return_value(&mut unit, loaded);

    let lines = lower_function(&mut unit).unwrap();
    assert!(lines.iter().any(|line| line == "mov rax, rdi"));
}

#[test]
fn identity_needs_no_move_on_arm64() {
    // The first parameter already sits in the return register, so the
    // redundancy guard drops the move entirely.
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::arm64(), "identity");

    let name = session.intern("a");
    let loaded = with_parameter(&mut unit, name);
    return_value(&mut unit, loaded);

    let lines = lower_function(&mut unit).unwrap();
    assert!(!lines.iter().any(|line| line.starts_with("mov ")));
    assert_eq!(lines.last().unwrap(), "ret");
}

#[test]
fn addition_of_two_parameters() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::x64(), "sum");

    let first = unit.declare_variable(Variable {
        name: session.intern("a"),
        format: Format::Int64,
        category: VariableCategory::Parameter,
    });
    let second = unit.declare_variable(Variable {
        name: session.intern("b"),
        format: Format::Int64,
        category: VariableCategory::Parameter,
    });
    unit.function.parameters.push(first);
    unit.function.parameters.push(second);
    unit.enter_scope(vec![first, second]);

    let left = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::GetVariable { variable: first },
        left,
    ))
    .unwrap();
    let right = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::GetVariable { variable: second },
        right,
    ))
    .unwrap();
    let sum = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::Addition {
            first: left,
            second: right,
            assigns: false,
        },
        sum,
    ))
    .unwrap();
    return_value(&mut unit, sum);

    let lines = lower_function(&mut unit).unwrap();
    assert!(lines.iter().any(|line| line.starts_with("add ")));
    assert!(lines.iter().any(|line| line.contains("rsi")));
}

#[test]
fn header_switches_syntax_per_target() {
    let x64 = assembly_header(&TargetConfig::x64());
    assert!(x64.iter().any(|line| line == ".intel_syntax noprefix"));

    let arm64 = assembly_header(&TargetConfig::arm64());
    assert!(!arm64.iter().any(|line| line.contains("intel")));
    assert!(arm64.iter().any(|line| line == ".section .text"));
}

#[test]
fn x64_frame_stays_aligned_counting_the_return_address() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::x64(), "framed");

    let local = unit.declare_variable(Variable {
        name: session.intern("slot"),
        format: Format::Int64,
        category: VariableCategory::Local,
    });
    unit.enter_scope(vec![local]);
    let value = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::GetConstant {
            constant: Constant::Integer(5),
        },
        value,
    ))
    .unwrap();
    let written = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::SetVariable {
            variable: local,
            source: value,
        },
        written,
    ))
    .unwrap();
    let read = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::GetVariable { variable: local },
        read,
    ))
    .unwrap();
    return_value(&mut unit, read);

    let lines = lower_function(&mut unit).unwrap();

    let pushes = lines.iter().filter(|line| line.starts_with("push ")).count() as i32;
    let allocation = lines
        .iter()
        .find_map(|line| line.strip_prefix("sub rsp, "))
        .map(|rest| rest.parse::<i32>().unwrap())
        .unwrap_or(0);
    assert_eq!((allocation + 8 * pushes + 8) % 16, 0);
}

#[test]
fn arm64_frame_is_a_multiple_of_sixteen() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut unit = unit(&session, TargetConfig::arm64(), "framed");

    let local = unit.declare_variable(Variable {
        name: session.intern("slot"),
        format: Format::Int64,
        category: VariableCategory::Local,
    });
    unit.enter_scope(vec![local]);
    let value = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::GetConstant {
            constant: Constant::Integer(5),
        },
        value,
    ))
    .unwrap();
    let written = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::SetVariable {
            variable: local,
            source: value,
        },
        written,
    ))
    .unwrap();
    let read = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::GetVariable { variable: local },
        read,
    ))
    .unwrap();
    return_value(&mut unit, read);

    let lines = lower_function(&mut unit).unwrap();

    let allocation = lines
        .iter()
        .find_map(|line| line.strip_prefix("sub sp, sp, #"))
        .map(|rest| rest.parse::<i32>().unwrap())
        .unwrap_or(0);
    assert!(allocation > 0);
    assert_eq!(allocation % 16, 0);
}
