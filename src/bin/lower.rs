// Demo driver for the lowering library. Records a handful of sample function
// bodies through the public unit API, runs the full pipeline and prints the
// resulting assembly for the selected target.

use bumpalo::Bump;
use clap::{Parser, ValueEnum};

use kiln::instruction::call::call_with_arguments;
use kiln::instruction::{Instruction, InstructionKind};
use kiln::scope::{Variable, VariableCategory};
use kiln::{
    assembly_header, data_section, lower_function, CompilationSession, CompileResult, Constant,
    Format, FunctionSignature, TargetConfig, Unit,
};

#[derive(Clone, Copy, ValueEnum)]
enum Target {
    /// x86-64, System V ABI.
    X64,
    /// AArch64, AAPCS64.
    Arm64,
}

/// Lower sample functions and print the assembly.
#[derive(Parser)]
#[command(name = "lower", version)]
struct Args {
    /// Target architecture.
    #[arg(long, value_enum, default_value_t = Target::X64)]
    target: Target,
}

fn main() -> CompileResult<()> {
    env_logger::init();
    let args = Args::parse();

    let target = match args.target {
        Target::X64 => TargetConfig::x64(),
        Target::Arm64 => TargetConfig::arm64(),
    };

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);

    for line in assembly_header(&target) {
        println!("{}", line);
    }
    println!();

    for lines in [scale(&session, target)?, relay(&session, target)?] {
        for line in lines {
            println!("{}", line);
        }
        println!();
    }

    for line in data_section(&session) {
        println!("{}", line);
    }
    Ok(())
}

/// scale(a) = a * 3 + 24, folded into one address computation on x86-64.
fn scale<'a>(
    session: &'a CompilationSession<'a>,
    target: TargetConfig,
) -> CompileResult<Vec<String>> {
    let a = Variable {
        name: session.intern("a"),
        format: Format::Int64,
        category: VariableCategory::Parameter,
    };

    let mut unit = Unit::new(
        session,
        target,
        FunctionSignature {
            name: session.intern("scale"),
            parameters: Vec::new(),
            return_format: Some(Format::Int64),
        },
    );
    let a = unit.declare_variable(a);
    unit.function.parameters.push(a);
    unit.enter_scope(vec![a]);

    let loaded = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::GetVariable { variable: a },
        loaded,
    ))?;
    let three = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::GetConstant {
            constant: Constant::Integer(3),
        },
        three,
    ))?;
    let product = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::Multiplication {
            first: loaded,
            second: three,
            assigns: false,
        },
        product,
    ))?;
    let offset = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::GetConstant {
            constant: Constant::Integer(24),
        },
        offset,
    ))?;
    let sum = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::Addition {
            first: offset,
            second: product,
            assigns: false,
        },
        sum,
    ))?;
    let result = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::Return { value: Some(sum) },
        result,
    ))?;
    unit.exit_scope();

    lower_function(&mut unit)
}

/// relay(a) = helper(a) + 1, showing call marshalling and evacuation.
fn relay<'a>(
    session: &'a CompilationSession<'a>,
    target: TargetConfig,
) -> CompileResult<Vec<String>> {
    let a = Variable {
        name: session.intern("a"),
        format: Format::Int64,
        category: VariableCategory::Parameter,
    };

    let mut unit = Unit::new(
        session,
        target,
        FunctionSignature {
            name: session.intern("relay"),
            parameters: Vec::new(),
            return_format: Some(Format::Int64),
        },
    );
    let a = unit.declare_variable(a);
    unit.function.parameters.push(a);
    unit.enter_scope(vec![a]);

    let loaded = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::GetVariable { variable: a },
        loaded,
    ))?;
    let call = call_with_arguments(
        &mut unit,
        session.intern("helper"),
        vec![loaded],
        Some(Format::Int64),
    )?;
    let returned = unit.instruction(call).result;
    let one = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::GetConstant {
            constant: Constant::Integer(1),
        },
        one,
    ))?;
    let sum = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::Addition {
            first: returned,
            second: one,
            assigns: false,
        },
        sum,
    ))?;
    let result = unit.new_value(Format::Int64);
    unit.add(Instruction::new(
        InstructionKind::Return { value: Some(sum) },
        result,
    ))?;
    unit.exit_scope();

    lower_function(&mut unit)
}
