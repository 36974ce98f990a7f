//! A tiny interpreter for the instructions the generator emits.
//!
//! Only the encodings produced by this crate are understood; anything else
//! panics so a test notices immediately.

use std::collections::BTreeMap;

use kinject_core::Bitness;

use crate::Register;

pub struct Machine {
    pub regs: [u64; 16],
    pub memory: BTreeMap<u64, u8>,
    pub width: usize,
    /// Bytes the callee removes from the stack on `call rax`.
    pub callee_pops: u64,
    /// Values of rcx/rdx/r8/r9 (or ecx/edx) and the stack pointer observed
    /// at each `call`.
    pub calls: Vec<CallSite>,
}

#[derive(Debug, Clone)]
pub struct CallSite {
    pub target: u64,
    pub regs: [u64; 16],
    pub rsp: u64,
}

impl Machine {
    pub const STACK_TOP: u64 = 0x7000_0000;

    pub fn new(bitness: Bitness) -> Self {
        let mut regs = [0u64; 16];
        for (index, reg) in regs.iter_mut().enumerate() {
            *reg = 0x1111_0000 + index as u64 * 0x101;
        }
        regs[Register::Rsp.index() as usize] = Self::STACK_TOP;

        Self {
            regs,
            memory: BTreeMap::new(),
            width: bitness.pointer_size(),
            callee_pops: 0,
            calls: Vec::new(),
        }
    }

    pub fn rsp(&self) -> u64 {
        self.regs[Register::Rsp.index() as usize]
    }

    fn set_rsp(&mut self, value: u64) {
        self.regs[Register::Rsp.index() as usize] = value;
    }

    fn mask(&self, value: u64) -> u64 {
        if self.width == 4 { value & 0xFFFF_FFFF } else { value }
    }

    pub fn read(&self, address: u64, size: usize) -> u64 {
        let mut value = 0u64;
        for i in 0..size {
            let byte = self.memory.get(&(address + i as u64)).copied().unwrap_or(0);
            value |= (byte as u64) << (8 * i);
        }
        value
    }

    pub fn write(&mut self, address: u64, value: u64, size: usize) {
        for i in 0..size {
            self.memory.insert(address + i as u64, (value >> (8 * i)) as u8);
        }
    }

    pub fn push(&mut self, value: u64, size: usize) {
        let rsp = self.rsp() - size as u64;
        self.set_rsp(rsp);
        self.write(rsp, value, size);
    }

    fn pop(&mut self, size: usize) -> u64 {
        let rsp = self.rsp();
        let value = self.read(rsp, size);
        self.set_rsp(rsp + size as u64);
        value
    }

    /// Runs `code` until its end or a `ret`.
    pub fn run(&mut self, code: &[u8]) {
        let mut ip = 0;

        let imm8 = |ip: usize| code[ip] as u64;
        let imm16 = |ip: usize| u16::from_le_bytes([code[ip], code[ip + 1]]) as u64;
        let imm32 = |ip: usize| {
            u32::from_le_bytes([code[ip], code[ip + 1], code[ip + 2], code[ip + 3]]) as u64
        };
        let imm64 = |ip: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&code[ip..ip + 8]);
            u64::from_le_bytes(bytes)
        };

        while ip < code.len() {
            let mut word = false;
            let mut rex_b = false;
            let mut rex_w = false;

            loop {
                match code[ip] {
                    0x66 => word = true,
                    0x41 if self.width == 8 => rex_b = true,
                    0x48 if self.width == 8 => rex_w = true,
                    0x49 if self.width == 8 => {
                        rex_w = true;
                        rex_b = true;
                    }
                    _ => break,
                }
                ip += 1;
            }

            let opcode = code[ip];
            ip += 1;

            let ext = if rex_b { 8 } else { 0 };
            let size = if word { 2 } else { self.width };

            match opcode {
                0x50..=0x57 => {
                    let value = self.regs[(opcode - 0x50 + ext) as usize];
                    self.push(value, size);
                }
                0x58..=0x5F => {
                    let index = (opcode - 0x58 + ext) as usize;
                    let value = self.pop(size);
                    self.regs[index] = if word {
                        (self.regs[index] & !0xFFFF) | value
                    } else {
                        value
                    };
                }
                0x6A => {
                    let value = imm8(ip) as u8 as i8 as i64 as u64;
                    self.push(self.mask(value), self.width);
                    ip += 1;
                }
                0x68 if word => {
                    self.push(imm16(ip), 2);
                    ip += 2;
                }
                0x68 => {
                    let value = imm32(ip) as u32 as i32 as i64 as u64;
                    self.push(self.mask(value), self.width);
                    ip += 4;
                }
                0xB8..=0xBF if rex_w => {
                    self.regs[(opcode - 0xB8 + ext) as usize] = imm64(ip);
                    ip += 8;
                }
                0xB8..=0xBF => {
                    self.regs[(opcode - 0xB8 + ext) as usize] = imm32(ip);
                    ip += 4;
                }
                0x8B if code[ip] == 0xEC => {
                    // mov ebp, esp
                    self.regs[Register::Rbp.index() as usize] = self.rsp();
                    ip += 1;
                }
                0x8B if code[ip] == 0x5D => {
                    // mov ebx, [ebp+disp8]
                    let address = self.regs[Register::Rbp.index() as usize] + imm8(ip + 1);
                    self.regs[Register::Rbx.index() as usize] = self.read(address, 4);
                    ip += 2;
                }
                0x89 if code[ip] == 0xEC => {
                    // mov esp, ebp
                    let rbp = self.regs[Register::Rbp.index() as usize];
                    self.set_rsp(rbp);
                    ip += 1;
                }
                0x89 if code[ip] == 0xCB => {
                    // mov rbx, rcx
                    self.regs[Register::Rbx.index() as usize] =
                        self.mask(self.regs[Register::Rcx.index() as usize]);
                    ip += 1;
                }
                0x89 if code[ip] == 0x03 => {
                    // mov [rbx], eax
                    let address = self.regs[Register::Rbx.index() as usize];
                    let value = self.regs[Register::Rax.index() as usize];
                    self.write(address, value, 4);
                    ip += 1;
                }
                0x89 if code[ip] == 0x44 && code[ip + 1] == 0x24 => {
                    // mov [rsp+disp8], rax
                    let address = self.rsp() + imm8(ip + 2);
                    let value = self.regs[Register::Rax.index() as usize];
                    self.write(address, value, 8);
                    ip += 3;
                }
                0xC7 if code[ip] == 0xC0 => {
                    // mov rax, imm32 (sign extended)
                    self.regs[Register::Rax.index() as usize] =
                        imm32(ip + 1) as u32 as i32 as i64 as u64;
                    ip += 5;
                }
                0xC7 if code[ip] == 0x44 && code[ip + 1] == 0x24 => {
                    let address = self.rsp() + imm8(ip + 2);
                    if word {
                        self.write(address, imm16(ip + 3), 2);
                        ip += 5;
                    } else {
                        self.write(address, imm32(ip + 3), 4);
                        ip += 7;
                    }
                }
                0xC6 if code[ip] == 0x44 && code[ip + 1] == 0x24 => {
                    let address = self.rsp() + imm8(ip + 2);
                    self.write(address, imm8(ip + 3), 1);
                    ip += 4;
                }
                0x83 => {
                    let amount = imm8(ip + 1);
                    match code[ip] {
                        0xEC => self.set_rsp(self.rsp() - amount),
                        0xC4 => self.set_rsp(self.rsp() + amount),
                        modrm => panic!("unsupported 83 /{modrm:02x}"),
                    }
                    ip += 2;
                }
                0x81 => {
                    let amount = imm32(ip + 1);
                    match code[ip] {
                        0xEC => self.set_rsp(self.rsp() - amount),
                        0xC4 => self.set_rsp(self.rsp() + amount),
                        modrm => panic!("unsupported 81 /{modrm:02x}"),
                    }
                    ip += 5;
                }
                0x0F if code[ip] == 0x6E => {
                    // movq xmm, rax (xmm state is not modelled)
                    ip += 2;
                }
                0xFF if code[ip] == 0xD0 => {
                    let target = self.regs[Register::Rax.index() as usize];
                    self.calls.push(CallSite {
                        target,
                        regs: self.regs,
                        rsp: self.rsp(),
                    });
                    self.set_rsp(self.rsp() + self.callee_pops);
                    ip += 1;
                }
                0xC3 => {
                    self.pop(self.width);
                    return;
                }
                0xC2 => {
                    let amount = imm16(ip);
                    self.pop(self.width);
                    self.set_rsp(self.rsp() + amount);
                    return;
                }
                other => panic!("unsupported opcode {other:02x} at {}", ip - 1),
            }
        }
    }
}
