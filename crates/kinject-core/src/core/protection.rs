use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Page protection flags for memory in a target process.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Protection: u8 {
        /// Read permission.
        const R = 0b00000001;

        /// Write permission.
        const W = 0b00000010;

        /// Execute permission.
        const X = 0b00000100;

        /// Combined Read and Write permissions.
        const RW = Self::R.bits() | Self::W.bits();

        /// Combined Read and Execute permissions.
        const RX = Self::R.bits() | Self::X.bits();

        /// Full access: Read, Write, and Execute permissions.
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

impl std::fmt::Display for Protection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut result = *b"---";

        if self.contains(Protection::R) {
            result[0] = b'r';
        }
        if self.contains(Protection::W) {
            result[1] = b'w';
        }
        if self.contains(Protection::X) {
            result[2] = b'x';
        }

        for byte in result {
            write!(f, "{}", byte as char)?;
        }

        Ok(())
    }
}
