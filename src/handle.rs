// This module defines the handle model that describes where a value currently lives.
// A handle is one of a small set of storage shapes: nothing yet, an immediate
// constant, a register, one of several memory forms (variable slot, stack slot,
// temporary spill slot, explicit stack allocation, computed address), an address
// expression that has not been dereferenced, a data section reference, a constant
// that must be materialized from the data section, or a pack of member values.
// Handles are compared structurally so that redundant moves can be detected, and
// each handle can enumerate the values it captures so their lifetimes and register
// locks can be maintained.

//! Storage handles describing the current location of a value.

use crate::core::format::Size;
use crate::register::Reg;
use crate::scope::VariableId;
use crate::value::ValueId;

/// Classification of a handle used when matching instruction operand
/// requirements. Each parameter of an instruction accepts an ordered list of
/// kinds, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Immediate constant encodable in the instruction.
    Constant,
    /// General purpose register.
    Register,
    /// Media (floating point) register.
    MediaRegister,
    /// Any dereferenced memory form.
    Memory,
    /// Address expression that has not been dereferenced.
    Expression,
    /// No storage, or storage that can not serve as an operand.
    None,
}

/// Modifier applied when referencing a data section symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionModifier {
    /// Plain reference to the symbol address.
    None,
    /// AArch64 page address of the symbol (adrp).
    Page,
    /// AArch64 low twelve bits of the symbol address.
    Lower12Bits,
}

/// An immediate constant value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Integer(i64),
    Decimal(f64),
}

impl Constant {
    /// Raw bits of the constant as stored in memory.
    pub fn bits(&self) -> i64 {
        match self {
            Constant::Integer(value) => *value,
            Constant::Decimal(value) => value.to_bits() as i64,
        }
    }

    /// Bit pattern used for deduplication in the constant data section.
    pub fn bits_pattern(&self) -> u64 {
        self.bits() as u64
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Constant::Integer(value) => *value == 0,
            Constant::Decimal(value) => *value == 0.0,
        }
    }

    pub fn is_decimal(&self) -> bool {
        matches!(self, Constant::Decimal(_))
    }
}

/// The storage location of a value at a given moment of lowering.
#[derive(Debug, Clone, PartialEq)]
pub enum Handle<'a> {
    /// The value has no storage yet.
    None,

    /// Immediate constant.
    Constant(Constant),

    /// The value lives in a register.
    Register(Reg),

    /// Memory addressed by another value plus a byte offset.
    Memory { base: ValueId, offset: i32 },

    /// The stack slot that is the home of a local variable or parameter.
    /// The offset is resolved against the frame layout after building.
    StackVariable { variable: VariableId, offset: i32 },

    /// A raw stack position. Absolute positions are measured from the frame
    /// base instead of the current stack offset.
    StackMemory { offset: i32, absolute: bool },

    /// A spill slot created when a register occupant had to be released.
    /// The identity ties together every reference to the same slot.
    TemporaryMemory { identity: u32, offset: i32 },

    /// An explicit stack allocation of a fixed number of bytes.
    StackAllocation { identity: u32, bytes: i32, offset: i32 },

    /// Memory addressed by base plus scaled index plus displacement.
    ComplexMemory {
        base: ValueId,
        index: ValueId,
        stride: i32,
        displacement: i32,
    },

    /// An address computation that has not been dereferenced. Either part may
    /// be absent; a missing base makes the displacement absolute.
    Expression {
        base: Option<ValueId>,
        index: Option<ValueId>,
        stride: i32,
        displacement: i32,
    },

    /// Reference to a symbol in the data section. When `address` is set the
    /// handle denotes the address of the symbol rather than its contents.
    DataSection {
        symbol: &'a str,
        address: bool,
        modifier: SectionModifier,
        offset: i32,
    },

    /// A constant too wide or of the wrong class for an immediate, emitted
    /// into the data section and loaded from there.
    ConstantData { value: Constant },

    /// A pack of member values that travel together.
    Pack { members: Vec<ValueId> },
}

impl<'a> Handle<'a> {
    /// Values captured inside this handle. Their lifetimes must cover every
    /// use of the handle and their registers must stay intact while the
    /// handle is live.
    pub fn inner_values(&self) -> Vec<ValueId> {
        match self {
            Handle::Memory { base, .. } => vec![*base],
            Handle::ComplexMemory { base, index, .. } => vec![*base, *index],
            Handle::Expression { base, index, .. } => {
                let mut values = Vec::new();
                if let Some(base) = base {
                    values.push(*base);
                }
                if let Some(index) = index {
                    values.push(*index);
                }
                values
            }
            Handle::Pack { members } => members.clone(),
            _ => Vec::new(),
        }
    }

    /// Whether this handle dereferences memory.
    pub fn is_memory(&self) -> bool {
        matches!(
            self,
            Handle::Memory { .. }
                | Handle::StackVariable { .. }
                | Handle::StackMemory { .. }
                | Handle::TemporaryMemory { .. }
                | Handle::StackAllocation { .. }
                | Handle::ComplexMemory { .. }
                | Handle::ConstantData { .. }
        ) || matches!(
            self,
            Handle::DataSection { address: false, .. }
        )
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Handle::Register(_))
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Handle::Constant(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Handle::None)
    }

    pub fn as_register(&self) -> Option<Reg> {
        match self {
            Handle::Register(reg) => Some(*reg),
            _ => None,
        }
    }

    pub fn as_constant(&self) -> Option<Constant> {
        match self {
            Handle::Constant(constant) => Some(*constant),
            _ => None,
        }
    }
}

/// Default operand size for a memory handle when none is imposed.
pub fn default_size() -> Size {
    Size::Qword
}
