use serde::{Deserialize, Serialize};

/// A general purpose register, by hardware encoding.
///
/// The 32-bit and 16-bit names (`eax`, `ax`, ...) use the same encoding as
/// their 64-bit counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Register {
    /// `rax` / `eax`
    Rax = 0,
    /// `rcx` / `ecx`
    Rcx = 1,
    /// `rdx` / `edx`
    Rdx = 2,
    /// `rbx` / `ebx`
    Rbx = 3,
    /// `rsp` / `esp`
    Rsp = 4,
    /// `rbp` / `ebp`
    Rbp = 5,
    /// `rsi` / `esi`
    Rsi = 6,
    /// `rdi` / `edi`
    Rdi = 7,
    /// `r8`
    R8 = 8,
    /// `r9`
    R9 = 9,
    /// `r10`
    R10 = 10,
    /// `r11`
    R11 = 11,
    /// `r12`
    R12 = 12,
    /// `r13`
    R13 = 13,
    /// `r14`
    R14 = 14,
    /// `r15`
    R15 = 15,
}

impl Register {
    /// All registers in encoding order.
    pub const ALL: [Register; 16] = [
        Self::Rax,
        Self::Rcx,
        Self::Rdx,
        Self::Rbx,
        Self::Rsp,
        Self::Rbp,
        Self::Rsi,
        Self::Rdi,
        Self::R8,
        Self::R9,
        Self::R10,
        Self::R11,
        Self::R12,
        Self::R13,
        Self::R14,
        Self::R15,
    ];

    /// Returns the 4-bit hardware index.
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Returns the low three bits used in the opcode or ModRM byte.
    pub fn low_bits(self) -> u8 {
        self.index() & 7
    }

    /// Checks if the register needs a REX.B prefix (`r8`-`r15`).
    pub fn is_extended(self) -> bool {
        self.index() >= 8
    }
}

/// A segment register, by hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Segment {
    /// `es`
    Es = 0,
    /// `cs`
    Cs = 1,
    /// `ss`
    Ss = 2,
    /// `ds`
    Ds = 3,
    /// `fs`
    Fs = 4,
    /// `gs`
    Gs = 5,
}

impl Segment {
    /// Returns the 3-bit hardware index.
    pub fn index(self) -> u8 {
        self as u8
    }
}
