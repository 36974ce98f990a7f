//! Call trampoline generator for x86 and x86-64.
//!
//! A [`CodeGenerator`] appends machine code to a caller supplied buffer:
//! a register-preserving prologue, a call to an absolute target with typed
//! immediate arguments, the matching epilogue and a return. The output is
//! position independent and needs no relocation.
//!
//! ```
//! # use kinject_codegen::{CodeGenerator, Convention};
//! # use kinject_core::{Bitness, Va};
//! let mut buffer = [0u8; 64];
//! let mut generator = CodeGenerator::new(&mut buffer, Bitness::Wide)?;
//!
//! generator.push_pointer(Va(0x1000))?;
//! generator.call(Convention::Win64, Va(0x2000))?;
//! generator.ret(0)?;
//! # Ok::<(), kinject_codegen::CodegenError>(())
//! ```

mod call;
mod convention;
mod error;
mod generator;
mod parameter;
mod register;
mod stack;
mod thunk;

#[cfg(test)]
mod sim;


pub use self::{
    call::wide_stack_reservation,
    convention::Convention,
    error::CodegenError,
    generator::{CodeGenerator, MAX_PARAMETERS, Parameters},
    parameter::{Parameter, ParameterKind},
    register::{Register, Segment},
    thunk::{InitializerCall, emit_initializer_thunk},
};
