// This module describes the AArch64 register file under the AAPCS64 calling
// convention. x0 through x18 are caller saved, x19 through x28 are callee
// saved, x29 is the frame base pointer, x30 holds the return address and the
// hardwired zero register is exposed so that zero stores need no
// materialization. The double precision registers follow the same split with
// d0 carrying decimal returns.

//! AArch64 register table and calling convention.

use crate::register::{flag, RegisterDescriptor};

/// Integer parameter registers in passing order.
pub const PARAMETER_REGISTERS: &[&str] = &["x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7"];

/// Decimal parameter registers in passing order.
pub const DECIMAL_PARAMETER_REGISTERS: &[&str] =
    &["d0", "d1", "d2", "d3", "d4", "d5", "d6", "d7"];

const GENERAL_NAMES: [[&str; 2]; 29] = [
    ["x0", "w0"],
    ["x1", "w1"],
    ["x2", "w2"],
    ["x3", "w3"],
    ["x4", "w4"],
    ["x5", "w5"],
    ["x6", "w6"],
    ["x7", "w7"],
    ["x8", "w8"],
    ["x9", "w9"],
    ["x10", "w10"],
    ["x11", "w11"],
    ["x12", "w12"],
    ["x13", "w13"],
    ["x14", "w14"],
    ["x15", "w15"],
    ["x16", "w16"],
    ["x17", "w17"],
    ["x18", "w18"],
    ["x19", "w19"],
    ["x20", "w20"],
    ["x21", "w21"],
    ["x22", "w22"],
    ["x23", "w23"],
    ["x24", "w24"],
    ["x25", "w25"],
    ["x26", "w26"],
    ["x27", "w27"],
    ["x28", "w28"],
];

const MEDIA_NAMES: [[&str; 2]; 29] = [
    ["d0", "s0"],
    ["d1", "s1"],
    ["d2", "s2"],
    ["d3", "s3"],
    ["d4", "s4"],
    ["d5", "s5"],
    ["d6", "s6"],
    ["d7", "s7"],
    ["d8", "s8"],
    ["d9", "s9"],
    ["d10", "s10"],
    ["d11", "s11"],
    ["d12", "s12"],
    ["d13", "s13"],
    ["d14", "s14"],
    ["d15", "s15"],
    ["d16", "s16"],
    ["d17", "s17"],
    ["d18", "s18"],
    ["d19", "s19"],
    ["d20", "s20"],
    ["d21", "s21"],
    ["d22", "s22"],
    ["d23", "s23"],
    ["d24", "s24"],
    ["d25", "s25"],
    ["d26", "s26"],
    ["d27", "s27"],
    ["d28", "s28"],
];

pub fn registers() -> Vec<RegisterDescriptor> {
    let mut table = Vec::new();

    for (index, names) in GENERAL_NAMES.iter().enumerate() {
        let mut flags = if index <= 18 { flag::VOLATILE } else { 0 };
        if index == 0 {
            flags |= flag::RETURN;
        }
        table.push(RegisterDescriptor::new(
            [names[0], names[1], names[1], names[1]],
            flags,
        ));
    }

    table.push(RegisterDescriptor::new(
        ["x29", "w29", "w29", "w29"],
        flag::BASE_POINTER | flag::RESERVED,
    ));
    table.push(RegisterDescriptor::new(
        ["x30", "w30", "w30", "w30"],
        flag::RESERVED | flag::RETURN_ADDRESS,
    ));
    table.push(RegisterDescriptor::new(
        ["xzr", "wzr", "wzr", "wzr"],
        flag::RESERVED | flag::VOLATILE | flag::ZERO,
    ));
    table.push(RegisterDescriptor::new(
        ["sp", "wsp", "wsp", "wsp"],
        flag::RESERVED | flag::STACK_POINTER,
    ));

    for (index, names) in MEDIA_NAMES.iter().enumerate() {
        let mut flags = flag::MEDIA;
        if index <= 18 {
            flags |= flag::VOLATILE;
        }
        if index == 0 {
            flags |= flag::DECIMAL_RETURN;
        }
        table.push(RegisterDescriptor::new(
            [names[0], names[1], names[1], names[1]],
            flags,
        ));
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::Size;

    #[test]
    fn volatility_split_matches_the_convention() {
        let table = registers();
        let find = |name: &str| table.iter().find(|r| r.full_name() == name).unwrap();

        assert!(find("x0").is_volatile());
        assert!(find("x0").has_flag(flag::RETURN));
        assert!(find("x18").is_volatile());
        assert!(!find("x19").is_volatile());
        assert!(!find("x28").is_volatile());
        assert!(find("x30").has_flag(flag::RETURN_ADDRESS));
        assert!(find("xzr").has_flag(flag::ZERO));
        assert!(find("sp").has_flag(flag::STACK_POINTER));
        assert!(find("d0").has_flag(flag::DECIMAL_RETURN));
        assert!(!find("d19").is_volatile());
    }

    #[test]
    fn narrow_accesses_use_the_word_partition() {
        let table = registers();
        let x1 = table.iter().find(|r| r.full_name() == "x1").unwrap();
        assert_eq!(x1.name(Size::Qword), "x1");
        assert_eq!(x1.name(Size::Dword), "w1");
        assert_eq!(x1.name(Size::Byte), "w1");
    }
}
