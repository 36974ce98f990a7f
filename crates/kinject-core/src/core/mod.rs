mod hex;
pub(crate) mod macros;
mod protection;

use self::macros::{impl_address, impl_id};
pub use self::{hex::Hex, protection::Protection};

impl_address!(Va, u64, "virtual address in a target process");

impl_id!(ProcessId, u32, "A process identifier");
impl_id!(ThreadId, u32, "A thread identifier");

/// An opened reference to a target process.
///
/// Handles are issued by the host's [`ProcessHost::open_process`] and must
/// be returned through [`ProcessHost::close_process`].
///
/// [`ProcessHost::open_process`]: crate::ProcessHost::open_process
/// [`ProcessHost::close_process`]: crate::ProcessHost::close_process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    /// The raw host value.
    pub raw: u64,

    /// The process this handle refers to.
    pub pid: ProcessId,
}

/// Pointer width of a target address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Bitness {
    /// 32-bit pointers.
    Narrow,

    /// 64-bit pointers.
    Wide,
}

impl Bitness {
    /// Returns `true` for 64-bit pointers.
    pub fn is_wide(self) -> bool {
        matches!(self, Self::Wide)
    }

    /// Size of a pointer in bytes.
    pub fn pointer_size(self) -> usize {
        match self {
            Self::Narrow => 4,
            Self::Wide => 8,
        }
    }
}
