// This module defines the instruction model and the operand conversion engine.
// Instructions are recorded abstractly with their value dependencies and only
// committed to machine operations during the build pass. Each operand of a
// machine operation declares the handle kinds it accepts, cheapest first, plus
// a set of flags describing how the operand participates: whether it is the
// destination, whether it is written, whether the instruction's result attaches
// to its storage and how wide an immediate it tolerates. The assemble engine
// converts each operand's current handle into an accepted form, locking the
// registers of already converted operands so later conversions cannot steal
// them, and finally replays the flags onto the unit's allocation state.
// Redirection allows a later pass to force an instruction's destination before
// it is built; redirecting a built instruction is an error.

//! Abstract instructions and the operand conversion engine.

pub mod arithmetic;
pub mod bitwise;
pub mod call;
pub mod compare;
pub mod control;
pub mod flow;
pub mod mov;
pub mod variables;

use crate::core::error::{CompileError, CompileResult};
use crate::core::format::{Format, Size};
use crate::handle::{Constant, Handle, HandleKind};
use crate::memory;
use crate::register::Reg;
use crate::scope::{ScopeId, VariableId, VariableUsage};
use crate::unit::Unit;
use crate::value::ValueId;

/// Identifier of an instruction in the unit's instruction table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrId(pub u32);

impl InstrId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Operand participation flags.
pub mod flags {
    /// No special participation.
    pub const NONE: u32 = 0;
    /// The operand receives the result of the operation.
    pub const DESTINATION: u32 = 1 << 1;
    /// The operation writes through the operand.
    pub const WRITE_ACCESS: u32 = 1 << 2;
    /// The instruction's result takes this operand's storage after build.
    pub const ATTACH_TO_DESTINATION: u32 = 1 << 3;
    /// The operand's value relocates into the destination after build.
    pub const RELOCATE_TO_DESTINATION: u32 = 1 << 4;
    /// The operand does not appear in the rendered operation.
    pub const HIDDEN: u32 = 1 << 5;
    /// The result must not end up aliasing this operand.
    pub const NO_ATTACH: u32 = 1 << 6;
    /// The operation reads the operand's previous contents.
    pub const READS: u32 = 1 << 7;
    /// An address expression is acceptable as is.
    pub const ALLOW_ADDRESS: u32 = 1 << 8;

    const BIT_LIMIT_SHIFT: u32 = 24;

    /// Restrict immediate operands to the given signed bit width.
    pub const fn bit_limit(bits: u32) -> u32 {
        bits << BIT_LIMIT_SHIFT
    }

    pub const fn bit_limit_of(value: u32) -> u32 {
        value >> BIT_LIMIT_SHIFT
    }
}

/// Accepted kind lists shared by the operand specifications.
pub mod kinds {
    use crate::handle::HandleKind::{self, *};

    pub const REGISTER: &[HandleKind] = &[Register];
    pub const MEDIA_REGISTER: &[HandleKind] = &[MediaRegister];
    pub const MEMORY: &[HandleKind] = &[Memory];
    pub const REGISTER_OR_MEMORY: &[HandleKind] = &[Register, Memory];
    pub const MEDIA_OR_MEMORY: &[HandleKind] = &[MediaRegister, Memory];
    pub const CONSTANT_OR_REGISTER: &[HandleKind] = &[Constant, Register];
    pub const CONSTANT_REGISTER_MEMORY: &[HandleKind] = &[Constant, Register, Memory];
    pub const EXPRESSION: &[HandleKind] = &[Expression];
}

/// Whether a signed immediate fits in the given bit width.
pub fn fits_bits(value: i64, bits: u32) -> bool {
    if bits == 0 || bits >= 64 {
        return true;
    }
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    min <= value && value <= max
}

/// Comparison conditions shared by both targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
}

impl Condition {
    pub fn invert(self) -> Self {
        match self {
            Condition::Equal => Condition::NotEqual,
            Condition::NotEqual => Condition::Equal,
            Condition::Greater => Condition::LessOrEqual,
            Condition::GreaterOrEqual => Condition::Less,
            Condition::Less => Condition::GreaterOrEqual,
            Condition::LessOrEqual => Condition::Greater,
        }
    }
}

/// How a move treats its source value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMode {
    /// Destination is an independent copy, the source stays put.
    Copy,
    /// The source value starts living in the destination.
    Load,
    /// Like `Load`, and the move may not be dropped even when redundant
    /// looking, since it writes a home location.
    Relocate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitwiseOp {
    And,
    Or,
    Xor,
    ShiftLeft,
    ShiftRight,
}

impl BitwiseOp {
    pub fn is_shift(self) -> bool {
        matches!(self, BitwiseOp::ShiftLeft | BitwiseOp::ShiftRight)
    }
}

/// What a call transfers to: a linker symbol or a computed function value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee<'a> {
    Symbol(&'a str),
    Value(ValueId),
}

/// How a computed memory address is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    /// Only the address itself is wanted.
    Address,
}

/// A built operand: the participating value, the handle it was converted to
/// and how it takes part in the operation.
#[derive(Debug, Clone)]
pub struct Parameter<'a> {
    pub value: ValueId,
    pub flags: u32,
    pub size: Size,
    pub finalized: Option<Handle<'a>>,
}

impl<'a> Parameter<'a> {
    pub fn is_destination(&self) -> bool {
        self.flags & flags::DESTINATION != 0
    }

    pub fn is_hidden(&self) -> bool {
        self.flags & flags::HIDDEN != 0
    }
}

/// Operand requirements handed to the assemble engine.
pub struct OperandSpec {
    pub value: ValueId,
    pub flags: u32,
    pub kinds: &'static [HandleKind],
    pub size: Size,
}

/// The operation an abstract instruction stands for.
#[derive(Debug, Clone)]
pub enum InstructionKind<'a> {
    Addition { first: ValueId, second: ValueId, assigns: bool },
    Subtraction { first: ValueId, second: ValueId, assigns: bool },
    Multiplication { first: ValueId, second: ValueId, assigns: bool },
    Division {
        first: ValueId,
        second: ValueId,
        modulus: bool,
        assigns: bool,
        unsigned: bool,
    },
    Unary { operator: UnaryOp, first: ValueId },
    Bitwise {
        operator: BitwiseOp,
        first: ValueId,
        second: ValueId,
        assigns: bool,
    },
    Compare { first: ValueId, second: ValueId },
    Move { destination: ValueId, source: ValueId, mode: MoveMode },
    Exchange { first: ValueId, second: ValueId },
    GetConstant { constant: Constant },
    GetVariable { variable: VariableId },
    SetVariable { variable: VariableId, source: ValueId },
    GetMemoryAddress {
        mode: AccessMode,
        start: ValueId,
        offset: ValueId,
        stride: i32,
    },
    AllocateStack { bytes: i32 },
    /// Keeps variables alive across a region so loop bodies read and write
    /// the same storage on every iteration. The values are resolved during
    /// simulation and extend lifetimes through the dependency replay.
    RequireVariables {
        variables: Vec<VariableId>,
        values: Vec<ValueId>,
    },
    Call {
        callee: Callee<'a>,
        destinations: Vec<Handle<'a>>,
        return_format: Option<Format>,
    },
    Evacuate,
    Reorder {
        destinations: Vec<Handle<'a>>,
        sources: Vec<ValueId>,
    },
    Jump {
        label: &'a str,
        condition: Option<Condition>,
        signed: bool,
    },
    LabelMark { label: &'a str },
    Return { value: Option<ValueId> },
    Initialize,
    CacheVariables {
        usages: Vec<VariableUsage>,
        non_volatile: bool,
    },
    MergeScope,
    SymmetryStart {
        variables: Vec<VariableId>,
        state: Vec<(VariableId, Handle<'a>)>,
    },
    SymmetryEnd { start: InstrId },
    LabelMerge { label: &'a str },
    LockRegister { register: Reg, lock: bool },
    ExtendNumerator { unsigned: bool },
    DebugPosition { line: u32, column: u32 },
    Nop,
}

/// One recorded instruction.
#[derive(Debug, Clone)]
pub struct Instruction<'a> {
    pub kind: InstructionKind<'a>,
    pub position: i32,
    pub scope: Option<ScopeId>,
    pub result: ValueId,
    /// Rendered operation. Multi line for composite sequences such as the
    /// prologue.
    pub operation: String,
    pub parameters: Vec<Parameter<'a>>,
    /// Operand text captured right after build for parameters whose handles
    /// reference other values. Register choices may change later in the
    /// pass, so these are resolved while they are still current.
    pub captured: Vec<Option<String>>,
    pub built: bool,
    pub redirect_target: Option<Handle<'a>>,
}

impl<'a> Instruction<'a> {
    pub fn new(kind: InstructionKind<'a>, result: ValueId) -> Self {
        Self {
            kind,
            position: -1,
            scope: None,
            result,
            operation: String::new(),
            parameters: Vec::new(),
            captured: Vec::new(),
            built: false,
            redirect_target: None,
        }
    }

    /// Values the instruction depends on, used for lifetime computation.
    pub fn dependencies(&self) -> Vec<ValueId> {
        let mut values = vec![self.result];
        match &self.kind {
            InstructionKind::Addition { first, second, .. }
            | InstructionKind::Subtraction { first, second, .. }
            | InstructionKind::Multiplication { first, second, .. }
            | InstructionKind::Division { first, second, .. }
            | InstructionKind::Bitwise { first, second, .. }
            | InstructionKind::Compare { first, second }
            | InstructionKind::Exchange { first, second } => {
                values.push(*first);
                values.push(*second);
            }
            InstructionKind::Unary { first, .. } => values.push(*first),
            InstructionKind::Move {
                destination,
                source,
                ..
            } => {
                values.push(*destination);
                values.push(*source);
            }
            InstructionKind::SetVariable { source, .. } => values.push(*source),
            InstructionKind::GetMemoryAddress { start, offset, .. } => {
                values.push(*start);
                values.push(*offset);
            }
            InstructionKind::Reorder { sources, .. } => values.extend(sources.iter().copied()),
            InstructionKind::Call {
                callee: Callee::Value(function),
                ..
            } => values.push(*function),
            InstructionKind::RequireVariables { values: required, .. } => {
                values.extend(required.iter().copied())
            }
            InstructionKind::Return { value: Some(value) } => values.push(*value),
            _ => {}
        }
        values
    }

    /// Whether the instruction can honor a redirected destination of the
    /// given shape on the given target.
    pub fn accepts_redirect(&self, target: &Handle<'a>, x64: bool) -> bool {
        let to_register = target.is_register();
        match &self.kind {
            InstructionKind::Addition { .. }
            | InstructionKind::Subtraction { .. }
            | InstructionKind::Multiplication { .. }
            | InstructionKind::Bitwise { .. }
            | InstructionKind::Unary { .. }
            | InstructionKind::GetConstant { .. } => to_register,
            // Moves can retarget to registers anywhere and to memory on
            // x86-64 where stores take full addressing forms.
            InstructionKind::Move { .. } => to_register || (x64 && target.is_memory()),
            _ => false,
        }
    }

    /// Force the instruction's destination. Legal only before the
    /// instruction has been built.
    pub fn redirect(&mut self, target: Handle<'a>, x64: bool) -> CompileResult<bool> {
        if self.built {
            return Err(CompileError::RedirectAfterBuild);
        }
        if !self.accepts_redirect(&target, x64) {
            return Ok(false);
        }
        self.redirect_target = Some(target);
        Ok(true)
    }

    /// The destination handle of a built instruction.
    pub fn destination(&self) -> CompileResult<&Handle<'a>> {
        self.parameters
            .iter()
            .find(|p| p.is_destination())
            .and_then(|p| p.finalized.as_ref())
            .ok_or(CompileError::NoDestination {
                instruction: self.operation.clone(),
            })
    }
}

/// A fully rendered line that needs no operand conversion, used for fixed
/// sequences such as sign extensions and sectioned constant loads.
pub fn literal<'a>(result: ValueId, text: String) -> Instruction<'a> {
    let mut instruction = Instruction::new(InstructionKind::Nop, result);
    instruction.operation = text;
    instruction.built = true;
    instruction
}

/// Resolve one instruction during the simulate pass.
pub fn simulate_one<'a>(unit: &mut Unit<'a>, id: InstrId) -> CompileResult<()> {
    match unit.instruction(id).kind.clone() {
        InstructionKind::GetConstant { constant } => {
            variables::simulate_get_constant(unit, id, constant)
        }
        InstructionKind::GetVariable { variable } => {
            variables::simulate_get_variable(unit, id, variable)
        }
        InstructionKind::SetVariable { variable, source } => {
            variables::simulate_set_variable(unit, id, variable, source)
        }
        InstructionKind::GetMemoryAddress {
            mode,
            start,
            offset,
            stride,
        } => variables::simulate_get_memory_address(unit, id, mode, start, offset, stride),
        InstructionKind::AllocateStack { bytes } => {
            variables::simulate_allocate_stack(unit, id, bytes)
        }
        InstructionKind::RequireVariables { variables, .. } => {
            variables::simulate_require_variables(unit, id, variables)
        }
        _ => Ok(()),
    }
}

/// Build one instruction into its machine operation.
pub fn build_one<'a>(unit: &mut Unit<'a>, id: InstrId) -> CompileResult<()> {
    if unit.instruction(id).built {
        return Ok(());
    }
    let outcome: CompileResult<()> = match unit.instruction(id).kind.clone() {
        InstructionKind::Addition { first, second, assigns } => {
            arithmetic::build_addition(unit, id, first, second, assigns)
        }
        InstructionKind::Subtraction { first, second, assigns } => {
            arithmetic::build_subtraction(unit, id, first, second, assigns)
        }
        InstructionKind::Multiplication { first, second, assigns } => {
            arithmetic::build_multiplication(unit, id, first, second, assigns)
        }
        InstructionKind::Division {
            first,
            second,
            modulus,
            assigns,
            unsigned,
        } => arithmetic::build_division(unit, id, first, second, modulus, assigns, unsigned),
        InstructionKind::Unary { operator, first } => {
            arithmetic::build_unary(unit, id, operator, first)
        }
        InstructionKind::ExtendNumerator { unsigned } => {
            arithmetic::build_extend_numerator(unit, id, unsigned)
        }
        InstructionKind::Bitwise {
            operator,
            first,
            second,
            assigns,
        } => bitwise::build_bitwise(unit, id, operator, first, second, assigns),
        InstructionKind::Compare { first, second } => compare::build_compare(unit, id, first, second),
        InstructionKind::Move {
            destination,
            source,
            mode,
        } => mov::build_move(unit, id, destination, source, mode),
        InstructionKind::Exchange { first, second } => mov::build_exchange(unit, id, first, second),
        InstructionKind::Call {
            callee,
            destinations,
            return_format,
        } => call::build_call(unit, id, callee, destinations, return_format),
        InstructionKind::Evacuate => call::build_evacuate(unit, id),
        InstructionKind::Reorder {
            destinations,
            sources,
        } => call::build_reorder(unit, id, destinations, sources),
        InstructionKind::Jump {
            label,
            condition,
            signed,
        } => control::build_jump(unit, id, label, condition, signed),
        InstructionKind::LabelMark { label } => control::build_label_mark(unit, id, label),
        InstructionKind::Return { value } => control::build_return(unit, id, value),
        InstructionKind::CacheVariables { usages, non_volatile } => {
            flow::build_cache_variables(unit, id, usages, non_volatile)
        }
        InstructionKind::MergeScope => flow::build_merge_scope(unit, id),
        InstructionKind::SymmetryStart { variables, .. } => {
            flow::build_symmetry_start(unit, id, variables)
        }
        InstructionKind::SymmetryEnd { start } => flow::build_symmetry_end(unit, id, start),
        InstructionKind::LabelMerge { label } => flow::build_label_merge(unit, id, label),
        InstructionKind::LockRegister { register, lock } => {
            flow::build_lock_register(unit, id, register, lock)
        }
        InstructionKind::DebugPosition { line, column } => {
            control::build_debug_position(unit, id, line, column)
        }
        // The prologue text is completed by the translator once register use
        // and local memory are known; binding the incoming parameters to
        // their convention registers happens here so every later build sees
        // them placed.
        InstructionKind::Initialize => {
            control::build_initialize(unit)?;
            unit.instruction_mut(id).built = true;
            Ok(())
        }
        InstructionKind::Nop => {
            unit.instruction_mut(id).built = true;
            Ok(())
        }
        InstructionKind::GetConstant { .. }
        | InstructionKind::GetVariable { .. }
        | InstructionKind::SetVariable { .. }
        | InstructionKind::GetMemoryAddress { .. }
        | InstructionKind::AllocateStack { .. }
        | InstructionKind::RequireVariables { .. } => {
            // Resolved during simulation, no code of their own.
            unit.instruction_mut(id).built = true;
            Ok(())
        }
    };
    outcome?;
    crate::translate::capture_operands(unit, id);
    Ok(())
}

/// Convert every operand into an accepted handle and commit the operation.
pub fn assemble<'a>(
    unit: &mut Unit<'a>,
    id: InstrId,
    operation: &str,
    operands: Vec<OperandSpec>,
) -> CompileResult<()> {
    let redirect = unit.instruction(id).redirect_target.clone();
    let mut locked: Vec<Reg> = Vec::new();
    let mut parameters: Vec<Parameter<'a>> = Vec::new();

    for spec in &operands {
        if spec.flags & flags::DESTINATION != 0 {
            if let Some(target) = &redirect {
                unit.set_handle(spec.value, target.clone());
                if let Some(reg) = target.as_register() {
                    unit.registers[reg.index()].occupant = Some(spec.value);
                }
            }
        }

        let handle = memory::convert(unit, spec.value, spec.kinds, spec.flags, spec.size)?;
        locked.extend(unit.lock_handle(&handle));
        parameters.push(Parameter {
            value: spec.value,
            flags: spec.flags,
            size: spec.size,
            finalized: Some(handle),
        });
    }

    unit.unlock_all(&locked);

    let instruction = unit.instruction_mut(id);
    instruction.operation = operation.to_string();
    instruction.parameters = parameters;
    instruction.built = true;

    simulate_parameter_flags(unit, id)
}

/// Replay the operand flags onto the allocation state of the unit: attach the
/// result to the destination storage and relocate values that the operation
/// moved.
pub fn simulate_parameter_flags<'a>(unit: &mut Unit<'a>, id: InstrId) -> CompileResult<()> {
    let result = unit.instruction(id).result;
    let parameters = unit.instruction(id).parameters.clone();

    let destination = parameters
        .iter()
        .find(|p| p.is_destination())
        .and_then(|p| p.finalized.clone());

    for parameter in &parameters {
        if parameter.flags & flags::ATTACH_TO_DESTINATION != 0 {
            match &parameter.finalized {
                Some(Handle::Register(reg)) => unit.occupy(*reg, result),
                Some(handle) => unit.set_handle(result, handle.clone()),
                None => {}
            }
        }
        if parameter.flags & flags::RELOCATE_TO_DESTINATION != 0 {
            if let Some(target) = &destination {
                unit.set_handle(parameter.value, target.clone());
                if let Some(reg) = target.as_register() {
                    unit.registers[reg.index()].occupant = Some(parameter.value);
                }
            }
        }
    }
    Ok(())
}
