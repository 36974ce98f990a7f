use serde::{Deserialize, Serialize};

/// A calling convention understood by [`CodeGenerator::call`].
///
/// In 64-bit mode every convention maps to the single platform ABI, so the
/// value only matters for 32-bit code.
///
/// [`CodeGenerator::call`]: crate::CodeGenerator::call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Convention {
    /// Arguments pushed right to left, caller cleans the stack.
    Cdecl,

    /// Arguments pushed right to left, callee cleans the stack.
    Stdcall,

    /// First two arguments in `ecx`/`edx`, rest pushed, callee cleans.
    Fastcall,

    /// Receiver in `ecx`, rest pushed, callee cleans.
    Thiscall,

    /// The 64-bit ABI: `rcx`/`rdx`/`r8`/`r9` (or `xmm0`-`xmm3`), shadow
    /// space, caller cleans.
    Win64,
}

impl Convention {
    /// Checks if the caller restores the stack after the call.
    pub fn caller_cleans(self) -> bool {
        matches!(self, Self::Cdecl | Self::Win64)
    }

    /// Number of leading parameters bound to registers in 32-bit mode.
    pub fn narrow_register_parameters(self) -> usize {
        match self {
            Self::Cdecl | Self::Stdcall | Self::Win64 => 0,
            Self::Fastcall => 2,
            Self::Thiscall => 1,
        }
    }
}
