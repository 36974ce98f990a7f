//! Hand-placed stack operations.
//!
//! These helpers sit below [`CodeGenerator::call`] for trampolines that need
//! to save and restore state outside of the call sequence. Operands that
//! cannot be encoded in the generator's mode are rejected with an error.

use kinject_core::Bitness;

use crate::{CodeGenerator, CodegenError, Register, Segment};

/// Operand size prefix.
const OPERAND_SIZE: u8 = 0x66;

/// REX prefix with only the B bit set.
const REX_B: u8 = 0x41;

impl CodeGenerator<'_> {
    fn check_register(&self, register: Register) -> Result<(), CodegenError> {
        if register.is_extended() && self.bitness == Bitness::Narrow {
            return Err(CodegenError::InvalidRegister(register));
        }

        Ok(())
    }

    fn add_register_opcode(
        &mut self,
        base: u8,
        register: Register,
        word: bool,
    ) -> Result<usize, CodegenError> {
        self.check_register(register)?;

        self.transaction(|this| {
            let mut size = 0;

            if word {
                size += this.add_uint8(OPERAND_SIZE)?;
            }

            if register.is_extended() {
                size += this.add_uint8(REX_B)?;
            }

            size += this.add_uint8(base + register.low_bits())?;
            Ok(size)
        })
    }

    /// `push r64` in 64-bit mode, `push r32` in 32-bit mode.
    pub fn push_register(&mut self, register: Register) -> Result<usize, CodegenError> {
        self.add_register_opcode(0x50, register, false)
    }

    /// `pop r64` in 64-bit mode, `pop r32` in 32-bit mode.
    pub fn pop_register(&mut self, register: Register) -> Result<usize, CodegenError> {
        self.add_register_opcode(0x58, register, false)
    }

    /// `push r16`
    pub fn push_register16(&mut self, register: Register) -> Result<usize, CodegenError> {
        self.add_register_opcode(0x50, register, true)
    }

    /// `pop r16`
    pub fn pop_register16(&mut self, register: Register) -> Result<usize, CodegenError> {
        self.add_register_opcode(0x58, register, true)
    }

    /// Emits `opcode /digit` with a `[register]` operand.
    fn add_indirect(
        &mut self,
        opcode: u8,
        digit: u8,
        register: Register,
    ) -> Result<usize, CodegenError> {
        self.check_register(register)?;

        self.transaction(|this| {
            let mut size = 0;

            if register.is_extended() {
                size += this.add_uint8(REX_B)?;
            }

            size += this.add_uint8(opcode)?;

            let reg = digit << 3;
            size += match register.low_bits() {
                // [rsp] needs a SIB byte.
                4 => this.add_bytes(&[reg | 0x04, 0x24])?,
                // [rbp] needs a zero displacement.
                5 => this.add_bytes(&[0x40 | reg | 0x05, 0x00])?,
                low => this.add_uint8(reg | low)?,
            };

            Ok(size)
        })
    }

    /// `push [register]`
    pub fn push_indirect(&mut self, register: Register) -> Result<usize, CodegenError> {
        self.add_indirect(0xFF, 6, register)
    }

    /// `pop [register]`
    pub fn pop_indirect(&mut self, register: Register) -> Result<usize, CodegenError> {
        self.add_indirect(0x8F, 0, register)
    }

    /// `push [address]` with an absolute 32-bit address.
    pub fn push_memory(&mut self, address: u32) -> Result<usize, CodegenError> {
        self.transaction(|this| Ok(this.add_bytes(&[0xFF, 0x34, 0x25])? + this.add_uint32(address)?))
    }

    /// `pop [address]` with an absolute 32-bit address.
    pub fn pop_memory(&mut self, address: u32) -> Result<usize, CodegenError> {
        self.transaction(|this| Ok(this.add_bytes(&[0x8F, 0x04, 0x25])? + this.add_uint32(address)?))
    }

    /// `push imm8` (sign extended to the stack width).
    pub fn push_imm8(&mut self, value: i8) -> Result<usize, CodegenError> {
        self.transaction(|this| Ok(this.add_uint8(0x6A)? + this.add_int8(value)?))
    }

    /// `push imm16` (a 2-byte push).
    pub fn push_imm16(&mut self, value: u16) -> Result<usize, CodegenError> {
        self.transaction(|this| Ok(this.add_bytes(&[OPERAND_SIZE, 0x68])? + this.add_uint16(value)?))
    }

    /// `push imm32` (sign extended in 64-bit mode).
    pub fn push_imm32(&mut self, value: u32) -> Result<usize, CodegenError> {
        self.transaction(|this| Ok(this.add_uint8(0x68)? + this.add_uint32(value)?))
    }

    /// Pushes a full 64-bit immediate.
    ///
    /// In 64-bit mode this is `push imm32` followed by
    /// `mov dword ptr [rsp+4], imm32` for the high half. In 32-bit mode the
    /// value takes two stack slots, high half first.
    pub fn push_imm64(&mut self, value: u64) -> Result<usize, CodegenError> {
        let low = value as u32;
        let high = (value >> 32) as u32;

        self.transaction(|this| match this.bitness {
            Bitness::Wide => Ok(this.add_uint8(0x68)?
                + this.add_uint32(low)?
                + this.add_bytes(&[0xC7, 0x44, 0x24, 0x04])?
                + this.add_uint32(high)?),
            Bitness::Narrow => Ok(this.add_uint8(0x68)?
                + this.add_uint32(high)?
                + this.add_uint8(0x68)?
                + this.add_uint32(low)?),
        })
    }

    /// `push sreg`
    ///
    /// Only `fs` and `gs` can be pushed in 64-bit mode.
    pub fn push_segment(&mut self, segment: Segment) -> Result<usize, CodegenError> {
        match segment {
            Segment::Fs => self.add_bytes(&[0x0F, 0xA0]),
            Segment::Gs => self.add_bytes(&[0x0F, 0xA8]),
            _ if self.is_wide() => Err(CodegenError::InvalidSegment(segment)),
            _ => self.add_uint8(0x06 + (segment.index() << 3)),
        }
    }

    /// `pop sreg`
    ///
    /// `cs` can never be popped; only `fs` and `gs` can be popped in 64-bit
    /// mode.
    pub fn pop_segment(&mut self, segment: Segment) -> Result<usize, CodegenError> {
        match segment {
            Segment::Fs => self.add_bytes(&[0x0F, 0xA1]),
            Segment::Gs => self.add_bytes(&[0x0F, 0xA9]),
            Segment::Cs => Err(CodegenError::InvalidSegment(segment)),
            _ if self.is_wide() => Err(CodegenError::InvalidSegment(segment)),
            _ => self.add_uint8(0x07 + (segment.index() << 3)),
        }
    }
}
