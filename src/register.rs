// This module defines the register model used by the allocation unit. Each
// physical register is described by its partition names (one per operand size),
// a set of role flags and its current allocation state: a counted lock and an
// optional occupant value. The flags identify volatility, reserved registers,
// return registers and the special roles some instructions impose (numerator
// and remainder for x86-64 division, the shift count register, the zero
// register on AArch64). Availability and releasability are judged against the
// occupant's lifetime by the unit, which owns the slot table.

//! Physical registers, their roles and their allocation state.

use crate::core::format::Size;
use crate::value::ValueId;

/// Register role flags.
pub mod flag {
    /// Clobbered by calls.
    pub const VOLATILE: u32 = 1;
    /// Never handed out by the allocator.
    pub const RESERVED: u32 = 2;
    /// Integer return register.
    pub const RETURN: u32 = 4;
    /// Stack pointer.
    pub const STACK_POINTER: u32 = 8;
    /// Division numerator on x86-64 (rax).
    pub const NUMERATOR: u32 = 16;
    /// Division remainder on x86-64 (rdx).
    pub const REMAINDER: u32 = 32;
    /// Floating point register.
    pub const MEDIA: u32 = 64;
    /// Decimal return register.
    pub const DECIMAL_RETURN: u32 = 128;
    /// Shift count register on x86-64 (rcx).
    pub const SHIFT: u32 = 256;
    /// Frame base pointer.
    pub const BASE_POINTER: u32 = 512;
    /// Hardwired zero register on AArch64.
    pub const ZERO: u32 = 1024;
    /// Return address register on AArch64.
    pub const RETURN_ADDRESS: u32 = 2048;
}

/// Index of a register in the unit's register table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reg(pub u8);

impl Reg {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Description and allocation state of one physical register.
#[derive(Debug, Clone)]
pub struct RegisterDescriptor {
    /// Partition names ordered from the widest to the narrowest size.
    pub names: [&'static str; 4],
    pub flags: u32,
    /// Counted lock. A locked register may not be evicted or handed out.
    pub lock_count: u32,
    /// Value currently occupying the register, if any.
    pub occupant: Option<ValueId>,
}

impl RegisterDescriptor {
    pub fn new(names: [&'static str; 4], flags: u32) -> Self {
        Self {
            names,
            flags,
            lock_count: 0,
            occupant: None,
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn is_volatile(&self) -> bool {
        self.has_flag(flag::VOLATILE)
    }

    pub fn is_reserved(&self) -> bool {
        self.has_flag(flag::RESERVED)
    }

    pub fn is_media(&self) -> bool {
        self.has_flag(flag::MEDIA)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    pub fn lock(&mut self) {
        self.lock_count += 1;
    }

    pub fn unlock(&mut self) {
        debug_assert!(self.lock_count > 0);
        self.lock_count = self.lock_count.saturating_sub(1);
    }

    /// Partition name for the given operand size.
    pub fn name(&self, size: Size) -> &'static str {
        match size {
            Size::None | Size::Qword => self.names[0],
            Size::Dword => self.names[1],
            Size::Word => self.names[2],
            Size::Byte => self.names[3],
        }
    }

    /// Full width partition name.
    pub fn full_name(&self) -> &'static str {
        self.names[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counted_locks_nest() {
        let mut register = RegisterDescriptor::new(["rax", "eax", "ax", "al"], flag::VOLATILE);
        assert!(!register.is_locked());

        register.lock();
        register.lock();
        assert!(register.is_locked());

        register.unlock();
        assert!(register.is_locked());
        register.unlock();
        assert!(!register.is_locked());
    }

    #[test]
    fn partition_names_follow_size() {
        let register = RegisterDescriptor::new(["rcx", "ecx", "cx", "cl"], flag::VOLATILE);
        assert_eq!(register.name(Size::Qword), "rcx");
        assert_eq!(register.name(Size::Dword), "ecx");
        assert_eq!(register.name(Size::Word), "cx");
        assert_eq!(register.name(Size::Byte), "cl");
    }

    #[test]
    fn flags_identify_roles() {
        let register = RegisterDescriptor::new(
            ["rax", "eax", "ax", "al"],
            flag::VOLATILE | flag::RETURN | flag::NUMERATOR,
        );
        assert!(register.is_volatile());
        assert!(register.has_flag(flag::RETURN));
        assert!(register.has_flag(flag::NUMERATOR));
        assert!(!register.is_media());
        assert!(!register.is_reserved());
    }
}
