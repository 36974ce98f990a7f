use crate::{Convention, Register, Segment};

/// An error that can occur while emitting code.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodegenError {
    /// The output buffer is empty.
    #[error("Invalid output buffer")]
    InvalidBuffer,

    /// The output buffer cannot hold the emitted bytes.
    #[error("Buffer overflow ({needed} bytes needed, {available} available)")]
    BufferOverflow {
        /// Bytes the emitter needed.
        needed: usize,

        /// Bytes left in the buffer.
        available: usize,
    },

    /// The parameter list is full.
    #[error("Too many parameters (maximum is {0})")]
    TooManyParameters(usize),

    /// A receiver-first convention was used without any parameter.
    #[error("{0:?} requires a receiver parameter")]
    MissingReceiver(Convention),

    /// The convention is not available for the current pointer width.
    #[error("{0:?} is not supported in this mode")]
    UnsupportedConvention(Convention),

    /// The register cannot be encoded in the current pointer width.
    #[error("Register {0:?} is not encodable in this mode")]
    InvalidRegister(Register),

    /// The segment register cannot be used with this operation.
    #[error("Segment register {0:?} is not usable here")]
    InvalidSegment(Segment),
}

impl From<CodegenError> for kinject_core::InjectError {
    fn from(value: CodegenError) -> Self {
        Self::Codegen(Box::new(value))
    }
}
