//! A tiny register-machine instruction set for driving the kernel without an ARM core.
//!
//! Instructions are byte aligned and little endian. Registers are the sixteen words of a thread
//! [`Context`]; r12 carries the service selector and r15 is the program counter.
//!
//! | opcode | form            | effect                                      |
//! |--------|-----------------|---------------------------------------------|
//! | `00`   | `NOP`           |                                             |
//! | `01`   | `SVC imm32`     | r12 = imm32, trap into the kernel           |
//! | `02`   | `MOVI rd, imm32`| rd = imm32                                  |
//! | `03`   | `ADDI rd, imm32`| rd = rd + imm32 (wrapping)                  |
//! | `04`   | `MOV rd, rs`    | rd = rs                                     |
//! | `05`   | `LDR rd, [rs]`  | rd = 32-bit load from rs                    |
//! | `06`   | `STR rv, [ra]`  | 32-bit store of rv to ra                    |
//! | `07`   | `BNZ rs, rel32` | if rs != 0, pc = next + rel32               |
//! | `08`   | `B rel32`       | pc = next + rel32                           |
//! | `FF`   | `HALT`          | stop the thread with r0 as its exit reason  |

use ember_kernel::{Context, REG_COUNT, REG_PC, REG_SELECTOR};
use ember_mem::GuestMemory;

use super::{CoreExit, ExecutableCore, ExitReason};

pub mod op {
    pub const NOP: u8 = 0x00;
    pub const SVC: u8 = 0x01;
    pub const MOVI: u8 = 0x02;
    pub const ADDI: u8 = 0x03;
    pub const MOV: u8 = 0x04;
    pub const LDR: u8 = 0x05;
    pub const STR: u8 = 0x06;
    pub const BNZ: u8 = 0x07;
    pub const B: u8 = 0x08;
    pub const HALT: u8 = 0xFF;
}

/// Reference interpreter for the byte-code instruction set.
#[derive(Debug, Default, Clone)]
pub struct ByteCodeCore {
    retired: u64,
}

impl ByteCodeCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instructions retired since construction.
    pub fn retired(&self) -> u64 {
        self.retired
    }

    /// Execute one instruction. `Ok(None)` continues, `Ok(Some(_))` retires the instruction and
    /// stops, `Err(_)` stops without retiring it.
    fn step(
        &mut self,
        ctx: &mut Context,
        mem: &mut dyn GuestMemory,
    ) -> Result<Option<ExitReason>, ExitReason> {
        let pc = ctx.regs[REG_PC];
        let [opcode] = fetch::<1>(mem, pc)?;
        let undefined = ExitReason::Undefined { pc };
        let reg = |b: u8| -> Result<usize, ExitReason> {
            let r = usize::from(b);
            if r < REG_COUNT {
                Ok(r)
            } else {
                Err(undefined)
            }
        };

        let (next, stop) = match opcode {
            op::NOP => (pc.wrapping_add(1), None),
            op::SVC => {
                let imm = fetch::<4>(mem, pc.wrapping_add(1))?;
                ctx.regs[REG_SELECTOR] = u32::from_le_bytes(imm);
                (pc.wrapping_add(5), Some(ExitReason::ServiceCall))
            }
            op::MOVI | op::ADDI => {
                let [rd, a, b, c, d] = fetch::<5>(mem, pc.wrapping_add(1))?;
                let rd = reg(rd)?;
                let imm = u32::from_le_bytes([a, b, c, d]);
                ctx.regs[rd] = if opcode == op::MOVI {
                    imm
                } else {
                    ctx.regs[rd].wrapping_add(imm)
                };
                (pc.wrapping_add(6), None)
            }
            op::MOV | op::LDR | op::STR => {
                let [x, y] = fetch::<2>(mem, pc.wrapping_add(1))?;
                let (x, y) = (reg(x)?, reg(y)?);
                match opcode {
                    op::MOV => ctx.regs[x] = ctx.regs[y],
                    op::LDR => {
                        ctx.regs[x] = mem
                            .read_u32_le(u64::from(ctx.regs[y]))
                            .map_err(ExitReason::Fault)?
                    }
                    _ => mem
                        .write_u32_le(u64::from(ctx.regs[y]), ctx.regs[x])
                        .map_err(ExitReason::Fault)?,
                }
                (pc.wrapping_add(3), None)
            }
            op::BNZ => {
                let [rs, a, b, c, d] = fetch::<5>(mem, pc.wrapping_add(1))?;
                let rs = reg(rs)?;
                let next = pc.wrapping_add(6);
                let rel = i32::from_le_bytes([a, b, c, d]);
                if ctx.regs[rs] != 0 {
                    (next.wrapping_add_signed(rel), None)
                } else {
                    (next, None)
                }
            }
            op::B => {
                let rel = i32::from_le_bytes(fetch::<4>(mem, pc.wrapping_add(1))?);
                (pc.wrapping_add(5).wrapping_add_signed(rel), None)
            }
            op::HALT => (pc, Some(ExitReason::Halt)),
            _ => return Err(undefined),
        };
        ctx.regs[REG_PC] = next;
        self.retired += 1;
        Ok(stop)
    }
}

fn fetch<const N: usize>(mem: &dyn GuestMemory, addr: u32) -> Result<[u8; N], ExitReason> {
    let mut buf = [0u8; N];
    mem.fetch(u64::from(addr), &mut buf)
        .map_err(ExitReason::Fault)?;
    Ok(buf)
}

impl ExecutableCore for ByteCodeCore {
    fn run(&mut self, ctx: &mut Context, mem: &mut dyn GuestMemory, budget: u64) -> CoreExit {
        let mut executed = 0;
        while executed < budget {
            match self.step(ctx, mem) {
                Ok(None) => executed += 1,
                Ok(Some(reason)) => return CoreExit::new(executed + 1, reason),
                Err(reason) => return CoreExit::new(executed, reason),
            }
        }
        CoreExit::new(executed, ExitReason::BudgetExhausted)
    }
}

/// Assembler for byte-code programs.
///
/// ```
/// use ember_system::core::bytecode::Program;
///
/// let mut p = Program::new();
/// p.movi(0, 3);
/// let top = p.here();
/// p.addi(0, u32::MAX).bnz_to(0, top).halt();
/// assert_eq!(p.len(), 6 + 6 + 6 + 1);
/// ```
#[derive(Debug, Default, Clone)]
pub struct Program {
    bytes: Vec<u8>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the next instruction.
    pub fn here(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn nop(&mut self) -> &mut Self {
        self.bytes.push(op::NOP);
        self
    }

    pub fn svc(&mut self, selector: u32) -> &mut Self {
        self.bytes.push(op::SVC);
        self.bytes.extend_from_slice(&selector.to_le_bytes());
        self
    }

    pub fn movi(&mut self, rd: u8, imm: u32) -> &mut Self {
        self.reg_imm(op::MOVI, rd, imm)
    }

    pub fn addi(&mut self, rd: u8, imm: u32) -> &mut Self {
        self.reg_imm(op::ADDI, rd, imm)
    }

    pub fn mov(&mut self, rd: u8, rs: u8) -> &mut Self {
        self.bytes.extend_from_slice(&[op::MOV, rd, rs]);
        self
    }

    pub fn ldr(&mut self, rd: u8, ra: u8) -> &mut Self {
        self.bytes.extend_from_slice(&[op::LDR, rd, ra]);
        self
    }

    pub fn str(&mut self, rv: u8, ra: u8) -> &mut Self {
        self.bytes.extend_from_slice(&[op::STR, rv, ra]);
        self
    }

    /// Branch to the program offset `target` while `rs` is non-zero.
    pub fn bnz_to(&mut self, rs: u8, target: u32) -> &mut Self {
        let rel = target.wrapping_sub(self.here() + 6) as i32;
        self.reg_imm(op::BNZ, rs, rel as u32)
    }

    pub fn b_to(&mut self, target: u32) -> &mut Self {
        let rel = target.wrapping_sub(self.here() + 5) as i32;
        self.bytes.push(op::B);
        self.bytes.extend_from_slice(&rel.to_le_bytes());
        self
    }

    pub fn halt(&mut self) -> &mut Self {
        self.bytes.push(op::HALT);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    fn reg_imm(&mut self, opcode: u8, r: u8, imm: u32) -> &mut Self {
        self.bytes.extend_from_slice(&[opcode, r]);
        self.bytes.extend_from_slice(&imm.to_le_bytes());
        self
    }
}
