use kinject_core::{Bitness, Va};

use crate::{CodeGenerator, CodegenError, Convention};

/// Number of arguments the delivery callback receives.
const CALLBACK_ARGUMENTS: u16 = 3;

/// Describes one initializer call performed by [`emit_initializer_thunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitializerCall {
    /// The initializer routine.
    pub routine: Va,

    /// Base of the image the initializer belongs to.
    pub image_base: Va,

    /// Reason code passed as the second argument.
    pub reason: u32,

    /// Data page passed as the third argument.
    pub data: Va,
}

/// Emits a callback-shaped trampoline that runs one initializer.
///
/// The trampoline is entered as `callback(context, arg1, arg2)` where
/// `context` is the address of a 32-bit result slot. It calls
/// `routine(image_base, reason, data)` with the standard convention and
/// stores the low 32 bits of the return value into the result slot.
///
/// ```text
/// begin_code
/// mov rbx, rcx            ; mov ebx, [ebp+8] in 32-bit code
/// call routine(image_base, reason, data)
/// mov dword ptr [rbx], eax
/// end_code
/// ret                     ; ret 12 in 32-bit code
/// ```
///
/// Parameters pushed before this call are bound to the initializer call as
/// well, so the parameter list is expected to be empty.
pub fn emit_initializer_thunk(
    generator: &mut CodeGenerator<'_>,
    call: &InitializerCall,
) -> Result<usize, CodegenError> {
    let pending = generator.parameters.len();

    let result = generator.transaction(|g| {
        let mut size = g.begin_code(false)?;

        size += match g.bitness() {
            // mov rbx, rcx
            Bitness::Wide => g.add_bytes(&[0x48, 0x89, 0xCB])?,
            // mov ebx, dword ptr [ebp+8]
            Bitness::Narrow => g.add_bytes(&[0x8B, 0x5D, 0x08])?,
        };

        g.push_pointer(call.image_base)?;
        g.push_uint32(call.reason)?;
        g.push_pointer(call.data)?;
        size += g.call(Convention::Stdcall, call.routine)?;

        // mov dword ptr [rbx], eax
        size += g.add_bytes(&[0x89, 0x03])?;

        size += g.end_code()?;
        size += match g.bitness() {
            Bitness::Wide => g.ret(0)?,
            Bitness::Narrow => g.ret(CALLBACK_ARGUMENTS * 4)?,
        };

        Ok(size)
    });

    if result.is_err() {
        generator.parameters.truncate(pending);
    }

    result
}
