//! Module injection driven by process and image notifications.
//!
//! This crate re-exports the kinject workspace:
//!
//! - [`kinject_core`] types and host interfaces, at the crate root,
//! - [`cipher`], the chained-seed payload cipher (feature `cipher`),
//! - [`codegen`], the x86/x86-64 call trampoline generator (feature
//!   `codegen`),
//! - [`engine`], the injection engine (feature `engine`).

pub use kinject_core::*;

#[cfg(feature = "cipher")]
pub use kinject_cipher as cipher;

#[cfg(feature = "codegen")]
pub use kinject_codegen as codegen;

#[cfg(feature = "engine")]
pub use kinject_engine as engine;
