//! Remote initializer calls.
//!
//! A thunk is a pair of pages in the target process: a code page holding a
//! callback-shaped trampoline, and a data page whose first word the
//! trampoline overwrites with the initializer's return value.
//!
//! ```text
//!   code page (r-x)                 data page (rw-)
//! +--------------------+          +------------------+
//! | prologue           |          | state: u32       |
//! | mov rbx, context  -+--------->| 0xC0000016 until |
//! | call initializer   |          | the call returns |
//! | mov [rbx], eax     |          +------------------+
//! | epilogue, ret      |
//! +--------------------+
//! ```

use std::task::Poll;

use kinject_codegen::{CodeGenerator, InitializerCall, emit_initializer_thunk};
use kinject_core::{
    Bitness, Hex, InjectError, ProcessHandle, Protection, TicketId, Va, VirtualMemory,
};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// State word of a data page whose trampoline has not run yet.
pub const THUNK_WAITING: u32 = 0xC000_0016;

/// Reason code passed to every initializer.
pub const DLL_PROCESS_ATTACH: u32 = 1;

/// The result an initializer returns on failure.
const THUNK_FAILURE: u32 = 0;

/// Layout of the start of a data page.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct ThunkData {
    state: u32,
}

/// What a completed initializer reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThunkOutcome {
    /// The initializer returned the given non-zero value.
    Succeeded(u32),

    /// The initializer returned zero.
    Failed,
}

/// A pollable view of a thunk's data page.
#[derive(Debug, Clone, Copy)]
pub struct ThunkCompletion {
    process: ProcessHandle,
    data: Va,
}

impl ThunkCompletion {
    /// Reads the state word without blocking.
    pub fn try_poll<Memory>(&self, memory: &Memory) -> Poll<Result<ThunkOutcome, InjectError>>
    where
        Memory: VirtualMemory,
    {
        let mut page = ThunkData::default();

        if let Err(err) = memory.read(self.process, self.data, page.as_mut_bytes()) {
            return Poll::Ready(Err(err));
        }

        match page.state {
            THUNK_WAITING => Poll::Pending,
            THUNK_FAILURE => Poll::Ready(Ok(ThunkOutcome::Failed)),
            result => Poll::Ready(Ok(ThunkOutcome::Succeeded(result))),
        }
    }
}

/// One pending initializer call in a target process.
#[derive(Debug)]
pub struct Thunk {
    routine: Va,
    code: Va,
    data: Option<Va>,
    ticket: Option<TicketId>,
    outcome: Option<ThunkOutcome>,
}

impl Thunk {
    /// Allocates the pages of a thunk calling `routine` and writes the
    /// trampoline.
    ///
    /// Either both pages are allocated and initialized, or neither page
    /// is left behind.
    pub fn allocate<Memory>(
        memory: &Memory,
        process: ProcessHandle,
        bitness: Bitness,
        routine: Va,
        image_base: Va,
    ) -> Result<Self, InjectError>
    where
        Memory: VirtualMemory,
    {
        let page_size = memory.page_size();

        let code = memory.allocate(process, page_size, Protection::RWX)?;
        let data = match memory.allocate(process, page_size, Protection::RW) {
            Ok(data) => data,
            Err(err) => {
                if let Err(err) = memory.free(process, code) {
                    tracing::error!(%err, %code, "failed to free thunk code");
                }

                return Err(err);
            }
        };

        let thunk = Self {
            routine,
            code,
            data: Some(data),
            ticket: None,
            outcome: None,
        };

        if let Err(err) = thunk.initialize(memory, process, bitness, image_base, page_size) {
            if let Err(err) = thunk.free(memory, process) {
                tracing::error!(%err, "failed to release partially built thunk");
            }

            return Err(err);
        }

        Ok(thunk)
    }

    fn initialize<Memory>(
        &self,
        memory: &Memory,
        process: ProcessHandle,
        bitness: Bitness,
        image_base: Va,
        page_size: usize,
    ) -> Result<(), InjectError>
    where
        Memory: VirtualMemory,
    {
        let data = self.data.ok_or(InjectError::Other("thunk is finalized"))?;

        let waiting = ThunkData {
            state: THUNK_WAITING,
        };
        memory.write(process, data, waiting.as_bytes())?;

        let mut buffer = vec![0u8; page_size];
        let mut generator = CodeGenerator::new(&mut buffer, bitness)?;
        emit_initializer_thunk(
            &mut generator,
            &InitializerCall {
                routine: self.routine,
                image_base,
                reason: DLL_PROCESS_ATTACH,
                data,
            },
        )?;

        tracing::trace!(
            code = %self.code,
            %data,
            routine = %self.routine,
            bytes = %Hex(generator.code()),
            "generated thunk"
        );

        memory.write(process, self.code, generator.code())?;

        let old = memory.protect(process, self.code, page_size, Protection::RX)?;
        if old != Protection::RWX {
            tracing::warn!(code = %self.code, %old, "unexpected thunk code protection");
        }

        Ok(())
    }

    /// Returns the initializer routine.
    pub fn routine(&self) -> Va {
        self.routine
    }

    /// Returns the address of the trampoline.
    pub fn code(&self) -> Va {
        self.code
    }

    /// Returns the data page, or `None` once the thunk is finalized.
    pub fn data(&self) -> Option<Va> {
        self.data
    }

    /// Checks whether the thunk was handed to the delivery primitive.
    pub fn is_queued(&self) -> bool {
        self.ticket.is_some()
    }

    pub(crate) fn mark_queued(&mut self, ticket: TicketId) {
        self.ticket = Some(ticket);
    }

    /// Returns a pollable view of the data page.
    pub fn completion(&self, process: ProcessHandle) -> Option<ThunkCompletion> {
        self.data.map(|data| ThunkCompletion { process, data })
    }

    /// Polls the data page, caching a completed outcome.
    pub fn try_poll<Memory>(
        &mut self,
        memory: &Memory,
        process: ProcessHandle,
    ) -> Poll<Result<ThunkOutcome, InjectError>>
    where
        Memory: VirtualMemory,
    {
        if let Some(outcome) = self.outcome {
            return Poll::Ready(Ok(outcome));
        }

        let Some(completion) = self.completion(process) else {
            return Poll::Ready(Err(InjectError::Other("thunk is finalized")));
        };

        let result = completion.try_poll(memory);
        if let Poll::Ready(Ok(outcome)) = result {
            self.outcome = Some(outcome);
        }

        result
    }

    /// Releases both pages, returning the first failure.
    pub fn free<Memory>(mut self, memory: &Memory, process: ProcessHandle) -> Result<(), InjectError>
    where
        Memory: VirtualMemory,
    {
        let mut result = Ok(());

        if let Err(err) = memory.free(process, self.code) {
            tracing::error!(%err, code = %self.code, "failed to free thunk code");
            result = Err(err);
        }

        if let Some(data) = self.data.take() {
            if let Err(err) = memory.free(process, data) {
                tracing::error!(%err, %data, "failed to free thunk data");

                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        result
    }
}
