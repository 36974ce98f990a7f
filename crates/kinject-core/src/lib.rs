//! Core types and host interfaces shared by the kinject crates.
//!
//! The engine never talks to an operating system directly. Everything it
//! needs from the environment it runs in is expressed through the traits in
//! this crate, which a driver glue layer implements.

mod core;
mod error;
mod host;
pub mod path;

pub use self::{
    core::{Bitness, Hex, ProcessHandle, ProcessId, Protection, ThreadId, Va},
    error::InjectError,
    host::{
        ApcDescriptor, ApcKind, ApcPrimitive, ImageLoader, ImageSource, InjectionHost,
        MappedImage, NotifyRegistration, ProcessHost, TicketId, VirtualMemory,
    },
};
