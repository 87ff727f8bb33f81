// Value formats and operand sizes. A Format describes how the bits of a value
// are interpreted (signed/unsigned integer of a given width, or decimal), a
// Size is the plain byte width of an operand. Formats travel on values and
// instruction parameters; sizes drive register partition selection (rax/eax/
// ax/al) and memory operand prefixes. The decimal format always occupies a
// full word and lives in media registers.

//! Value formats and operand sizes.

use crate::core::error::{CompileError, CompileResult};

/// Interpretation of a value's bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    /// Double-precision floating point. Held in media registers.
    Decimal,
}

impl Format {
    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            Format::Uint8 | Format::Uint16 | Format::Uint32 | Format::Uint64
        )
    }

    pub fn is_decimal(self) -> bool {
        self == Format::Decimal
    }

    /// Byte width of the format. Decimal values take a full word.
    pub fn bytes(self) -> i32 {
        match self {
            Format::Int8 | Format::Uint8 => 1,
            Format::Int16 | Format::Uint16 => 2,
            Format::Int32 | Format::Uint32 => 4,
            Format::Int64 | Format::Uint64 | Format::Decimal => 8,
        }
    }

    pub fn bits(self) -> i32 {
        self.bytes() * 8
    }

    pub fn size(self) -> Size {
        Size::from_bytes(self.bytes())
    }
}

/// Plain operand byte width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Size {
    None,
    Byte,
    Word,
    Dword,
    Qword,
}

impl Size {
    pub fn from_bytes(bytes: i32) -> Size {
        match bytes {
            1 => Size::Byte,
            2 => Size::Word,
            4 => Size::Dword,
            _ => Size::Qword,
        }
    }

    pub fn try_from_bytes(bytes: i32) -> CompileResult<Size> {
        match bytes {
            1 => Ok(Size::Byte),
            2 => Ok(Size::Word),
            4 => Ok(Size::Dword),
            8 => Ok(Size::Qword),
            _ => Err(CompileError::InvalidValue {
                reason: format!("invalid operand size of {bytes} bytes"),
            }),
        }
    }

    pub fn from_format(format: Format) -> Size {
        if format.is_decimal() {
            Size::Qword
        } else {
            Size::from_bytes(format.bytes())
        }
    }

    pub fn bytes(self) -> i32 {
        match self {
            Size::None => 0,
            Size::Byte => 1,
            Size::Word => 2,
            Size::Dword => 4,
            Size::Qword => 8,
        }
    }

    pub fn bits(self) -> i32 {
        self.bytes() * 8
    }

    /// Converts the size back into a format with the requested signedness.
    pub fn to_format(self, unsigned: bool) -> Format {
        match (self, unsigned) {
            (Size::Byte, true) => Format::Uint8,
            (Size::Byte, false) => Format::Int8,
            (Size::Word, true) => Format::Uint16,
            (Size::Word, false) => Format::Int16,
            (Size::Dword, true) => Format::Uint32,
            (Size::Dword, false) => Format::Int32,
            (_, true) => Format::Uint64,
            (_, false) => Format::Int64,
        }
    }

    /// x86-64 memory operand prefix.
    pub fn access_modifier(self) -> &'static str {
        match self {
            Size::None => "",
            Size::Byte => "byte ptr",
            Size::Word => "word ptr",
            Size::Dword => "dword ptr",
            Size::Qword => "qword ptr",
        }
    }

    /// Data-section allocator directive for the size.
    pub fn allocator(self) -> &'static str {
        match self {
            Size::None => "",
            Size::Byte => ".byte",
            Size::Word => ".short",
            Size::Dword => ".long",
            Size::Qword => ".quad",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_round_trip() {
        assert_eq!(Size::Dword.to_format(false), Format::Int32);
        assert_eq!(Size::Dword.to_format(true), Format::Uint32);
        assert_eq!(Format::Int32.size(), Size::Dword);
        assert_eq!(Size::from_format(Format::Decimal), Size::Qword);
    }

    #[test]
    fn test_size_queries() {
        assert_eq!(Size::Qword.bytes(), 8);
        assert_eq!(Size::Byte.bits(), 8);
        assert!(Size::try_from_bytes(3).is_err());
        assert_eq!(Size::from_bytes(2), Size::Word);
    }

    #[test]
    fn test_signedness() {
        assert!(Format::Uint16.is_unsigned());
        assert!(!Format::Int64.is_unsigned());
        assert!(Format::Decimal.is_decimal());
        assert!(!Format::Decimal.is_unsigned());
    }
}
