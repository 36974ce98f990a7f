use kinject_core::{Bitness, Hex, Va};
use smallvec::SmallVec;

use crate::{CodegenError, Parameter};

/// Maximum number of parameters a generator accepts.
pub const MAX_PARAMETERS: usize = 13;

/// Parameter list of a [`CodeGenerator`].
pub type Parameters = SmallVec<[Parameter; MAX_PARAMETERS]>;

/// A stateful machine code emitter over a caller supplied buffer.
///
/// Bytes are appended at a write cursor. Every `add_*` emitter returns the
/// number of bytes it wrote; composite emitters ([`begin_code`],
/// [`call`], ...) return the total size of the sequence they produced and
/// either emit the whole sequence or nothing.
///
/// [`begin_code`]: Self::begin_code
/// [`call`]: Self::call
pub struct CodeGenerator<'a> {
    pub(crate) buffer: &'a mut [u8],
    pub(crate) offset: usize,
    pub(crate) bitness: Bitness,
    pub(crate) preserve_all: bool,
    pub(crate) parameters: Parameters,
    pub(crate) first_live: usize,
}

impl std::fmt::Debug for CodeGenerator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CodeGenerator")
            .field("code", &Hex(self.code()))
            .field("capacity", &self.buffer.len())
            .field("bitness", &self.bitness)
            .field("preserve_all", &self.preserve_all)
            .field("parameters", &self.live_parameters())
            .finish()
    }
}

impl<'a> CodeGenerator<'a> {
    /// Creates a new generator writing into `buffer`.
    pub fn new(buffer: &'a mut [u8], bitness: Bitness) -> Result<Self, CodegenError> {
        if buffer.is_empty() {
            return Err(CodegenError::InvalidBuffer);
        }

        Ok(Self {
            buffer,
            offset: 0,
            bitness,
            preserve_all: false,
            parameters: Parameters::new(),
            first_live: 0,
        })
    }

    /// Zeroes the buffer and clears all state except the buffer and width.
    pub fn reset(&mut self) {
        self.buffer.fill(0);
        self.offset = 0;
        self.preserve_all = false;
        self.parameters.clear();
        self.first_live = 0;
    }

    /// Returns the pointer width the generator emits code for.
    pub fn bitness(&self) -> Bitness {
        self.bitness
    }

    /// Checks if the generator emits 64-bit code.
    pub fn is_wide(&self) -> bool {
        self.bitness.is_wide()
    }

    /// Returns the write cursor.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the buffer capacity.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the bytes emitted so far.
    pub fn code(&self) -> &[u8] {
        &self.buffer[..self.offset]
    }

    /// Returns the parameters that have not been bound yet.
    pub fn live_parameters(&self) -> &[Parameter] {
        &self.parameters[self.first_live..]
    }

    /// Runs `f` and rolls the cursor back if it fails.
    pub(crate) fn transaction(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<usize, CodegenError>,
    ) -> Result<usize, CodegenError> {
        let start = self.offset;

        match f(self) {
            Ok(size) => {
                debug_assert_eq!(size, self.offset - start);
                Ok(size)
            }
            Err(err) => {
                self.buffer[start..self.offset].fill(0);
                self.offset = start;
                Err(err)
            }
        }
    }

    //
    // Primitive emitters.
    //

    /// Appends raw bytes.
    pub fn add_bytes(&mut self, bytes: &[u8]) -> Result<usize, CodegenError> {
        let available = self.buffer.len() - self.offset;
        if bytes.len() > available {
            return Err(CodegenError::BufferOverflow {
                needed: bytes.len(),
                available,
            });
        }

        self.buffer[self.offset..self.offset + bytes.len()].copy_from_slice(bytes);
        self.offset += bytes.len();
        Ok(bytes.len())
    }

    /// Appends a signed byte.
    pub fn add_int8(&mut self, value: i8) -> Result<usize, CodegenError> {
        self.add_bytes(&value.to_le_bytes())
    }

    /// Appends a byte.
    pub fn add_uint8(&mut self, value: u8) -> Result<usize, CodegenError> {
        self.add_bytes(&[value])
    }

    /// Appends a signed 16-bit value.
    pub fn add_int16(&mut self, value: i16) -> Result<usize, CodegenError> {
        self.add_bytes(&value.to_le_bytes())
    }

    /// Appends a 16-bit value.
    pub fn add_uint16(&mut self, value: u16) -> Result<usize, CodegenError> {
        self.add_bytes(&value.to_le_bytes())
    }

    /// Appends a signed 32-bit value.
    pub fn add_int32(&mut self, value: i32) -> Result<usize, CodegenError> {
        self.add_bytes(&value.to_le_bytes())
    }

    /// Appends a 32-bit value.
    pub fn add_uint32(&mut self, value: u32) -> Result<usize, CodegenError> {
        self.add_bytes(&value.to_le_bytes())
    }

    /// Appends a signed 64-bit value.
    pub fn add_int64(&mut self, value: i64) -> Result<usize, CodegenError> {
        self.add_bytes(&value.to_le_bytes())
    }

    /// Appends a 64-bit value.
    pub fn add_uint64(&mut self, value: u64) -> Result<usize, CodegenError> {
        self.add_bytes(&value.to_le_bytes())
    }

    /// Appends a pointer of the generator's width.
    pub fn add_pointer(&mut self, value: Va) -> Result<usize, CodegenError> {
        match self.bitness {
            Bitness::Wide => self.add_uint64(value.0),
            Bitness::Narrow => self.add_uint32(value.0 as u32),
        }
    }

    //
    // Parameter list.
    //

    /// Appends a typed parameter for the next [`call`].
    ///
    /// [`call`]: Self::call
    pub fn push(&mut self, parameter: impl Into<Parameter>) -> Result<(), CodegenError> {
        if self.parameters.len() == MAX_PARAMETERS {
            return Err(CodegenError::TooManyParameters(MAX_PARAMETERS));
        }

        self.parameters.push(parameter.into());
        Ok(())
    }

    /// Appends a signed 8-bit parameter.
    pub fn push_int8(&mut self, value: i8) -> Result<(), CodegenError> {
        self.push(value)
    }

    /// Appends an unsigned 8-bit parameter.
    pub fn push_uint8(&mut self, value: u8) -> Result<(), CodegenError> {
        self.push(value)
    }

    /// Appends a signed 16-bit parameter.
    pub fn push_int16(&mut self, value: i16) -> Result<(), CodegenError> {
        self.push(value)
    }

    /// Appends an unsigned 16-bit parameter.
    pub fn push_uint16(&mut self, value: u16) -> Result<(), CodegenError> {
        self.push(value)
    }

    /// Appends a signed 32-bit parameter.
    pub fn push_int32(&mut self, value: i32) -> Result<(), CodegenError> {
        self.push(value)
    }

    /// Appends an unsigned 32-bit parameter.
    pub fn push_uint32(&mut self, value: u32) -> Result<(), CodegenError> {
        self.push(value)
    }

    /// Appends a signed 64-bit parameter.
    pub fn push_int64(&mut self, value: i64) -> Result<(), CodegenError> {
        self.push(value)
    }

    /// Appends an unsigned 64-bit parameter.
    pub fn push_uint64(&mut self, value: u64) -> Result<(), CodegenError> {
        self.push(value)
    }

    /// Appends a boolean parameter.
    pub fn push_bool(&mut self, value: bool) -> Result<(), CodegenError> {
        self.push(value)
    }

    /// Appends a single precision parameter.
    pub fn push_float(&mut self, value: f32) -> Result<(), CodegenError> {
        self.push(value)
    }

    /// Appends a double precision parameter.
    pub fn push_double(&mut self, value: f64) -> Result<(), CodegenError> {
        self.push(value)
    }

    /// Appends a pointer parameter, truncated to the generator's width.
    pub fn push_pointer(&mut self, value: Va) -> Result<(), CodegenError> {
        let value = match self.bitness {
            Bitness::Wide => value,
            Bitness::Narrow => Va(value.0 & 0xFFFF_FFFF),
        };

        self.push(value)
    }

    //
    // Prologue, epilogue and return.
    //

    /// Emits the register-save prologue.
    ///
    /// 64-bit code saves `rbx`, `rbp`, `rsi`, `rdi` and `r12`-`r15`; with
    /// `preserve_all` it also saves `rax`, `rcx`, `rdx` and `r8`-`r11`, and
    /// pads the odd register count with 8 bytes so that `rsp` keeps the
    /// alignment a later [`call`] expects.
    /// 32-bit code sets up an `ebp` frame and saves `ebx`, `ebp`, `esi`
    /// and `edi`.
    ///
    /// [`call`]: Self::call
    pub fn begin_code(&mut self, preserve_all: bool) -> Result<usize, CodegenError> {
        let size = self.transaction(|this| {
            let mut size = 0;

            match this.bitness {
                Bitness::Wide => {
                    if preserve_all {
                        size += this.add_bytes(&[
                            0x50, // push rax
                            0x51, // push rcx
                            0x52, // push rdx
                        ])?;
                    }

                    size += this.add_bytes(&[
                        0x53, // push rbx
                        0x55, // push rbp
                        0x56, // push rsi
                        0x57, // push rdi
                    ])?;

                    if preserve_all {
                        size += this.add_bytes(&[
                            0x41, 0x50, // push r8
                            0x41, 0x51, // push r9
                            0x41, 0x52, // push r10
                            0x41, 0x53, // push r11
                        ])?;
                    }

                    size += this.add_bytes(&[
                        0x41, 0x54, // push r12
                        0x41, 0x55, // push r13
                        0x41, 0x56, // push r14
                        0x41, 0x57, // push r15
                    ])?;

                    if preserve_all {
                        // sub rsp, 8
                        size += this.add_bytes(&[0x48, 0x83, 0xEC, 0x08])?;
                    }
                }
                Bitness::Narrow => {
                    size += this.add_bytes(&[
                        0x55, // push ebp
                        0x8B, 0xEC, // mov ebp, esp
                        0x53, // push ebx
                        0x55, // push ebp
                        0x56, // push esi
                        0x57, // push edi
                    ])?;
                }
            }

            Ok(size)
        })?;

        self.preserve_all = preserve_all;
        tracing::trace!(preserve_all, size, "prologue");
        Ok(size)
    }

    /// Emits the mirror image of the last [`begin_code`] prologue.
    ///
    /// [`begin_code`]: Self::begin_code
    pub fn end_code(&mut self) -> Result<usize, CodegenError> {
        let restore_all = self.preserve_all;

        let size = self.transaction(|this| {
            let mut size = 0;

            match this.bitness {
                Bitness::Wide => {
                    if restore_all {
                        // add rsp, 8
                        size += this.add_bytes(&[0x48, 0x83, 0xC4, 0x08])?;
                    }

                    size += this.add_bytes(&[
                        0x41, 0x5F, // pop r15
                        0x41, 0x5E, // pop r14
                        0x41, 0x5D, // pop r13
                        0x41, 0x5C, // pop r12
                    ])?;

                    if restore_all {
                        size += this.add_bytes(&[
                            0x41, 0x5B, // pop r11
                            0x41, 0x5A, // pop r10
                            0x41, 0x59, // pop r9
                            0x41, 0x58, // pop r8
                        ])?;
                    }

                    size += this.add_bytes(&[
                        0x5F, // pop rdi
                        0x5E, // pop rsi
                        0x5D, // pop rbp
                        0x5B, // pop rbx
                    ])?;

                    if restore_all {
                        size += this.add_bytes(&[
                            0x5A, // pop rdx
                            0x59, // pop rcx
                            0x58, // pop rax
                        ])?;
                    }
                }
                Bitness::Narrow => {
                    size += this.add_bytes(&[
                        0x5F, // pop edi
                        0x5E, // pop esi
                        0x5D, // pop ebp
                        0x5B, // pop ebx
                        0x89, 0xEC, // mov esp, ebp
                        0x5D, // pop ebp
                    ])?;
                }
            }

            Ok(size)
        })?;

        self.preserve_all = false;
        tracing::trace!(restore_all, size, "epilogue");
        Ok(size)
    }

    /// Emits a near return.
    ///
    /// In 32-bit mode a non-zero `size` pops that many bytes of arguments
    /// (`ret imm16`). 64-bit code always uses a plain `ret`.
    pub fn ret(&mut self, size: u16) -> Result<usize, CodegenError> {
        self.transaction(|this| {
            if size != 0 && !this.is_wide() {
                Ok(this.add_uint8(0xC2)? + this.add_uint16(size)?)
            } else {
                this.add_uint8(0xC3)
            }
        })
    }
}
