use kinject_core::{Bitness, Va};

use crate::{CodeGenerator, CodegenError, Convention, Parameter, ParameterKind};

/// Size of the register home area reserved for the callee in 64-bit code.
const SHADOW_SPACE: u32 = 0x20;

/// Number of parameters passed in registers in 64-bit code.
const WIDE_REGISTER_PARAMETERS: usize = 4;

/// Encodings of the four 64-bit argument registers.
struct ArgumentRegister {
    /// `mov r64, imm64`
    mov_imm64: [u8; 2],

    /// `mov r32, imm32` (zero extends into the full register)
    mov_imm32: &'static [u8],

    /// ModRM of `movq xmmN, rax`
    movq_modrm: u8,
}

const ARGUMENT_REGISTERS: [ArgumentRegister; WIDE_REGISTER_PARAMETERS] = [
    // rcx / xmm0
    ArgumentRegister {
        mov_imm64: [0x48, 0xB9],
        mov_imm32: &[0xB9],
        movq_modrm: 0xC0,
    },
    // rdx / xmm1
    ArgumentRegister {
        mov_imm64: [0x48, 0xBA],
        mov_imm32: &[0xBA],
        movq_modrm: 0xC8,
    },
    // r8 / xmm2
    ArgumentRegister {
        mov_imm64: [0x49, 0xB8],
        mov_imm32: &[0x41, 0xB8],
        movq_modrm: 0xD0,
    },
    // r9 / xmm3
    ArgumentRegister {
        mov_imm64: [0x49, 0xB9],
        mov_imm32: &[0x41, 0xB9],
        movq_modrm: 0xD8,
    },
];

/// `mov ecx, imm32` and `mov edx, imm32`, in binding order.
const NARROW_ARGUMENT_REGISTERS: [u8; 2] = [0xB9, 0xBA];

/// Returns the stack reservation of a 64-bit call with `count` parameters.
///
/// The shadow space plus one slot per stack parameter, padded so that the
/// callee observes a 16-byte aligned stack after the return address is
/// pushed.
pub fn wide_stack_reservation(count: usize) -> u32 {
    let mut size = SHADOW_SPACE + 8 * count.saturating_sub(WIDE_REGISTER_PARAMETERS) as u32;

    if size % 16 == 0 {
        size += 8;
    }

    size
}

/// Returns the zero extended immediate of an integer parameter narrower
/// than 64 bits.
fn narrow_immediate(parameter: &Parameter) -> u32 {
    match parameter.kind.size() {
        1 => parameter.low8() as u32,
        2 => parameter.low16() as u32,
        _ => parameter.low32(),
    }
}

/// Returns the `rsp` displacement of the stack slot of parameter `index`.
fn wide_stack_slot(index: usize) -> u32 {
    SHADOW_SPACE + 8 * (index - WIDE_REGISTER_PARAMETERS) as u32
}

impl CodeGenerator<'_> {
    /// Emits a call to `target` with the pending parameters.
    ///
    /// The parameter list is consumed by a successful call. On error
    /// nothing is emitted and the parameters are kept.
    pub fn call(&mut self, convention: Convention, target: Va) -> Result<usize, CodegenError> {
        tracing::trace!(
            ?convention,
            %target,
            parameters = self.parameters.len(),
            bitness = ?self.bitness,
            "call"
        );

        let first_live = self.first_live;
        let result = self.transaction(|this| match this.bitness {
            Bitness::Wide => this.call_wide(target),
            Bitness::Narrow => match convention {
                Convention::Cdecl | Convention::Stdcall => this.call_stack(convention, target),
                Convention::Fastcall => this.call_fastcall(target),
                Convention::Thiscall => this.call_thiscall(target),
                Convention::Win64 => Err(CodegenError::UnsupportedConvention(convention)),
            },
        });

        match result {
            Ok(size) => {
                self.parameters.clear();
                self.first_live = 0;
                Ok(size)
            }
            Err(err) => {
                self.first_live = first_live;
                Err(err)
            }
        }
    }

    //
    // 64-bit.
    //

    fn call_wide(&mut self, target: Va) -> Result<usize, CodegenError> {
        let parameters = self.parameters.clone();
        let reservation = wide_stack_reservation(parameters.len());
        let mut size = 0;

        //
        // Materialize the register parameters. `rax` is the only scratch
        // register and is never an argument register.
        //
        for (index, parameter) in parameters.iter().enumerate().take(WIDE_REGISTER_PARAMETERS) {
            size += self.bind_wide_register(index, parameter)?;
        }

        //
        // Reserve the shadow space and the stack parameter slots.
        //
        size += self.adjust_rsp(0xEC, reservation)?;

        for (index, parameter) in parameters.iter().enumerate().skip(WIDE_REGISTER_PARAMETERS) {
            size += self.store_wide_stack(index, parameter)?;
        }

        size += self.emit_call(target)?;
        size += self.adjust_rsp(0xC4, reservation)?;

        Ok(size)
    }

    fn bind_wide_register(
        &mut self,
        index: usize,
        parameter: &Parameter,
    ) -> Result<usize, CodegenError> {
        let register = &ARGUMENT_REGISTERS[index];

        let size = if parameter.kind.is_floating() {
            self.load_rax(parameter)? + self.add_movq_xmm_rax(register.movq_modrm)?
        } else if parameter.kind.size() == 8 {
            // mov r64, imm64
            self.add_bytes(&register.mov_imm64)? + self.add_uint64(parameter.value)?
        } else {
            // mov r32, imm32
            self.add_bytes(register.mov_imm32)? + self.add_uint32(narrow_immediate(parameter))?
        };

        Ok(size)
    }

    /// Loads the bits of a floating point parameter into `rax`.
    fn load_rax(&mut self, parameter: &Parameter) -> Result<usize, CodegenError> {
        match parameter.kind {
            // mov rax, imm32
            ParameterKind::Float => {
                Ok(self.add_bytes(&[0x48, 0xC7, 0xC0])? + self.add_uint32(parameter.low32())?)
            }
            // mov rax, imm64
            _ => Ok(self.add_bytes(&[0x48, 0xB8])? + self.add_uint64(parameter.value)?),
        }
    }

    /// `movq xmmN, rax`
    fn add_movq_xmm_rax(&mut self, modrm: u8) -> Result<usize, CodegenError> {
        self.add_bytes(&[0x66, 0x48, 0x0F, 0x6E, modrm])
    }

    /// Emits the ModRM/SIB/displacement of `[rsp + disp]` for `reg` field 0.
    fn add_rsp_operand(&mut self, displacement: u32) -> Result<usize, CodegenError> {
        if displacement <= 0x7F {
            Ok(self.add_bytes(&[0x44, 0x24])? + self.add_uint8(displacement as u8)?)
        } else {
            Ok(self.add_bytes(&[0x84, 0x24])? + self.add_uint32(displacement)?)
        }
    }

    fn store_wide_stack(
        &mut self,
        index: usize,
        parameter: &Parameter,
    ) -> Result<usize, CodegenError> {
        let slot = wide_stack_slot(index);

        let size = match parameter.kind {
            ParameterKind::Int64
            | ParameterKind::UInt64
            | ParameterKind::Pointer
            | ParameterKind::Float
            | ParameterKind::Double => {
                // mov rax, imm64
                // mov qword ptr [rsp+slot], rax
                self.add_bytes(&[0x48, 0xB8])?
                    + self.add_uint64(parameter.value)?
                    + self.add_bytes(&[0x48, 0x89])?
                    + self.add_rsp_operand(slot)?
            }
            ParameterKind::Int32 | ParameterKind::UInt32 => {
                // mov dword ptr [rsp+slot], imm32
                self.add_uint8(0xC7)?
                    + self.add_rsp_operand(slot)?
                    + self.add_uint32(parameter.low32())?
            }
            ParameterKind::Int16 | ParameterKind::UInt16 => {
                // mov word ptr [rsp+slot], imm16
                self.add_bytes(&[0x66, 0xC7])?
                    + self.add_rsp_operand(slot)?
                    + self.add_uint16(parameter.low16())?
            }
            ParameterKind::Int8 | ParameterKind::UInt8 | ParameterKind::Bool => {
                // mov byte ptr [rsp+slot], imm8
                self.add_uint8(0xC6)?
                    + self.add_rsp_operand(slot)?
                    + self.add_uint8(parameter.low8())?
            }
        };

        Ok(size)
    }

    /// `sub rsp, imm` (`0xEC`) or `add rsp, imm` (`0xC4`).
    fn adjust_rsp(&mut self, modrm: u8, amount: u32) -> Result<usize, CodegenError> {
        if amount <= 0x7F {
            Ok(self.add_bytes(&[0x48, 0x83, modrm])? + self.add_uint8(amount as u8)?)
        } else {
            Ok(self.add_bytes(&[0x48, 0x81, modrm])? + self.add_uint32(amount)?)
        }
    }

    //
    // 32-bit.
    //

    fn call_stack(&mut self, convention: Convention, target: Va) -> Result<usize, CodegenError> {
        let (mut size, pushed) = self.push_live_parameters()?;
        size += self.emit_call(target)?;

        if convention.caller_cleans() {
            size += self.add_esp(pushed)?;
        }

        Ok(size)
    }

    fn call_fastcall(&mut self, target: Va) -> Result<usize, CodegenError> {
        // With a single parameter this degenerates to a stdcall with the
        // parameter in ecx.
        let mut size = self.bind_narrow_registers(Convention::Fastcall)?;

        let (pushed_size, _) = self.push_live_parameters()?;
        size += pushed_size;
        size += self.emit_call(target)?;

        Ok(size)
    }

    fn call_thiscall(&mut self, target: Va) -> Result<usize, CodegenError> {
        let Some(receiver) = self.parameters.get(self.first_live).copied() else {
            tracing::error!("thiscall without a receiver parameter");
            return Err(CodegenError::MissingReceiver(Convention::Thiscall));
        };

        if receiver.kind != ParameterKind::Pointer {
            tracing::warn!(kind = ?receiver.kind, "receiver is not a pointer");
        }

        if receiver.low32() == 0 {
            tracing::warn!("receiver is null");
        }

        let mut size = self.bind_narrow_registers(Convention::Thiscall)?;

        let (pushed_size, _) = self.push_live_parameters()?;
        size += pushed_size;
        size += self.emit_call(target)?;

        Ok(size)
    }

    /// Moves the leading live parameters into the registers of `convention`.
    fn bind_narrow_registers(&mut self, convention: Convention) -> Result<usize, CodegenError> {
        let count = convention.narrow_register_parameters();
        let mut size = 0;

        for opcode in NARROW_ARGUMENT_REGISTERS.iter().take(count) {
            let Some(parameter) = self.parameters.get(self.first_live).copied() else {
                break;
            };

            // mov r32, imm32
            size += self.add_uint8(*opcode)? + self.add_uint32(parameter.low32())?;
            self.first_live += 1;
        }

        Ok(size)
    }

    /// Pushes the live parameters right to left.
    ///
    /// Returns the emitted size and the number of stack bytes pushed.
    fn push_live_parameters(&mut self) -> Result<(usize, u32), CodegenError> {
        let live: Vec<Parameter> = self.live_parameters().to_vec();
        let mut size = 0;
        let mut pushed = 0;

        for parameter in live.iter().rev() {
            match parameter.kind {
                kind if kind.is_wide_on_narrow_stack() => {
                    // push high, push low
                    size += self.add_uint8(0x68)? + self.add_uint32(parameter.high32())?;
                    size += self.add_uint8(0x68)? + self.add_uint32(parameter.low32())?;
                    pushed += 8;
                }
                ParameterKind::Int8 => {
                    // push imm8 (sign extended)
                    size += self.add_uint8(0x6A)? + self.add_uint8(parameter.low8())?;
                    pushed += 4;
                }
                ParameterKind::UInt8 if parameter.low8() <= 0x7F => {
                    size += self.add_uint8(0x6A)? + self.add_uint8(parameter.low8())?;
                    pushed += 4;
                }
                ParameterKind::Bool => {
                    size += self.add_uint8(0x6A)? + self.add_uint8(parameter.low8().min(1))?;
                    pushed += 4;
                }
                _ => {
                    // push imm32
                    size += self.add_uint8(0x68)? + self.add_uint32(parameter.low32())?;
                    pushed += 4;
                }
            }
        }

        Ok((size, pushed))
    }

    /// `add esp, imm`
    fn add_esp(&mut self, amount: u32) -> Result<usize, CodegenError> {
        match amount {
            0 => Ok(0),
            1..=0x7F => Ok(self.add_bytes(&[0x83, 0xC4])? + self.add_uint8(amount as u8)?),
            _ => Ok(self.add_bytes(&[0x81, 0xC4])? + self.add_uint32(amount)?),
        }
    }

    //
    // Shared.
    //

    /// `mov rax/eax, target` followed by `call rax/eax`.
    fn emit_call(&mut self, target: Va) -> Result<usize, CodegenError> {
        let size = match self.bitness {
            Bitness::Wide => self.add_bytes(&[0x48, 0xB8])? + self.add_uint64(target.0)?,
            Bitness::Narrow => self.add_uint8(0xB8)? + self.add_uint32(target.0 as u32)?,
        };

        Ok(size + self.add_bytes(&[0xFF, 0xD0])?)
    }
}
