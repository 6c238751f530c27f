use crate::devices::Fatal;
use crate::fields::{add_with_carry, register_name, DataOp, Mode, Operand2, Psr, LR, PC};
use crate::memory::Bus;
use crate::processor::Cpu;
use crate::vfp::Vfp;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum HwKind {
    Half,
    SignedByte,
    SignedHalf,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum HwOffset {
    Imm(u32),
    Reg(usize),
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CoprocDataProcOp {
    pub cp_number: u32,
    pub cp_opcode: u32,
    pub crn: u32,
    pub crd: u32,
    pub cp: u32,
    pub crm: u32,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CoprocDataTransferOp {
    pub cp_number: u32,
    pub pre: bool,
    pub up: bool,
    pub long: bool,
    pub writeback: bool,
    pub load: bool,
    pub rn: usize,
    pub crd: u32,
    pub offset: u32,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CoprocRegTransferOp {
    pub cp_number: u32,
    pub cp_opcode: u32,
    pub load: bool,
    pub crn: u32,
    pub rd: usize,
    pub cp: u32,
    pub crm: u32,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Instruction {
    DataProc { op: DataOp, s: bool, rn: usize, rd: usize, op2: Operand2 },
    Multiply { acc: bool, s: bool, rd: usize, rn: usize, rs: usize, rm: usize },
    MultiplyLong { signed: bool, acc: bool, s: bool, rd_hi: usize, rd_lo: usize, rs: usize, rm: usize },
    Swap { byte: bool, rn: usize, rd: usize, rm: usize },
    Mrs { spsr: bool, rd: usize },
    MsrReg { spsr: bool, rm: usize },
    MsrFlags { spsr: bool, op2: Operand2 },
    SingleTransfer { pre: bool, up: bool, byte: bool, writeback: bool, load: bool, rn: usize, rd: usize, offset: Operand2 },
    HalfwordTransfer { pre: bool, up: bool, writeback: bool, load: bool, rn: usize, rd: usize, kind: HwKind, offset: HwOffset },
    BlockTransfer { pre: bool, up: bool, user_bank: bool, writeback: bool, load: bool, rn: usize, list: u16 },
    Branch { link: bool, offset: i32 },
    BranchExchange { rn: usize },
    CoprocDataProc(CoprocDataProcOp),
    CoprocDataTransfer(CoprocDataTransferOp),
    CoprocRegTransfer(CoprocRegTransferOp),
    Swi,
    Undefined,
}

impl Instruction {
    pub fn execute(&self, cpu: &mut Cpu, bus: &mut Bus, vfp: &mut Vfp) -> Result<(), Fatal> {
        match *self {
            Self::DataProc { op, s, rn, rd, op2 } => data_proc(cpu, op, s, rn, rd, op2),
            Self::Multiply { acc, s, rd, rn, rs, rm } => multiply(cpu, acc, s, rd, rn, rs, rm),
            Self::MultiplyLong { signed, acc, s, rd_hi, rd_lo, rs, rm } => {
                multiply_long(cpu, signed, acc, s, rd_hi, rd_lo, rs, rm)
            }
            Self::Swap { byte, rn, rd, rm } => swap(cpu, bus, byte, rn, rd, rm),
            Self::Mrs { spsr, rd } => {
                let value = if spsr { cpu.read_spsr()?.0 } else { cpu.cpsr.0 };
                cpu.write_register(rd, value)
            }
            Self::MsrReg { spsr, rm } => {
                let value = cpu.read_register(rm)?;
                write_psr(cpu, spsr, value, false)
            }
            Self::MsrFlags { spsr, op2 } => {
                let value = op2.eval(cpu, false)?;
                write_psr(cpu, spsr, value, true)
            }
            Self::SingleTransfer { pre, up, byte, writeback, load, rn, rd, offset } => {
                single_transfer(cpu, bus, pre, up, byte, writeback, load, rn, rd, offset)
            }
            Self::HalfwordTransfer { pre, up, writeback, load, rn, rd, kind, offset } => {
                halfword_transfer(cpu, bus, pre, up, writeback, load, rn, rd, kind, offset)
            }
            Self::BlockTransfer { pre, up, user_bank, writeback, load, rn, list } => {
                block_transfer(cpu, bus, pre, up, user_bank, writeback, load, rn, list)
            }
            Self::Branch { link, offset } => {
                let pc = cpu.read_register(PC)?;
                if link {
                    cpu.write_register(LR, pc.wrapping_sub(4))?;
                }
                cpu.write_register(PC, pc.wrapping_add(offset as u32))
            }
            Self::BranchExchange { rn } => {
                let target = cpu.read_register(rn)?;
                if target & 1 != 0 {
                    return Err(Fatal::new("Cannot switch to THUMB instruction set"));
                }
                cpu.write_register(PC, target)
            }
            Self::CoprocDataProc(op) => match op.cp_number {
                10 => vfp.data_proc(&op, bus),
                11 => Err(Fatal::new("Double-precision VFP unsupported")),
                15 => Ok(()),
                n => Err(Fatal::new(format!("Unimplemented coprocessor CP{}", n))),
            },
            Self::CoprocDataTransfer(op) => match op.cp_number {
                10 => vfp.data_transfer(&op, cpu, bus),
                11 => Err(Fatal::new("Double-precision VFP unsupported")),
                15 => Ok(()),
                n => Err(Fatal::new(format!("Unimplemented coprocessor CP{}", n))),
            },
            Self::CoprocRegTransfer(op) => match op.cp_number {
                10 => vfp.reg_transfer(&op, cpu),
                11 => Err(Fatal::new("Double-precision VFP unsupported")),
                15 => Ok(()),
                n => Err(Fatal::new(format!("Unimplemented coprocessor CP{}", n))),
            },
            Self::Swi => exception(cpu, Mode::Svc, 0x08),
            Self::Undefined => exception(cpu, Mode::Und, 0x04),
        }
    }
}

impl Instruction {
    /// Renders the instruction as assembly text for the debugger.
    pub fn as_asm(&self) -> String {
        match *self {
            Self::DataProc { op, s, rn, rd, op2 } => {
                let mnemonic = match op {
                    DataOp::And => "and",
                    DataOp::Eor => "eor",
                    DataOp::Sub => "sub",
                    DataOp::Rsb => "rsb",
                    DataOp::Add => "add",
                    DataOp::Adc => "adc",
                    DataOp::Sbc => "sbc",
                    DataOp::Rsc => "rsc",
                    DataOp::Tst => "tst",
                    DataOp::Teq => "teq",
                    DataOp::Cmp => "cmp",
                    DataOp::Cmn => "cmn",
                    DataOp::Orr => "orr",
                    DataOp::Mov => "mov",
                    DataOp::Bic => "bic",
                    DataOp::Mvn => "mvn",
                };
                let suffix = if s && !op.is_compare() { "s" } else { "" };
                match op {
                    _ if op.is_compare() => {
                        format!("{} {}, {}", mnemonic, register_name(rn), op2)
                    }
                    DataOp::Mov | DataOp::Mvn => {
                        format!("{}{} {}, {}", mnemonic, suffix, register_name(rd), op2)
                    }
                    _ => format!(
                        "{}{} {}, {}, {}",
                        mnemonic,
                        suffix,
                        register_name(rd),
                        register_name(rn),
                        op2
                    ),
                }
            }
            Self::Multiply { acc, s, rd, rn, rs, rm } => {
                let suffix = if s { "s" } else { "" };
                if acc {
                    format!(
                        "mla{} {}, {}, {}, {}",
                        suffix,
                        register_name(rd),
                        register_name(rm),
                        register_name(rs),
                        register_name(rn)
                    )
                } else {
                    format!(
                        "mul{} {}, {}, {}",
                        suffix,
                        register_name(rd),
                        register_name(rm),
                        register_name(rs)
                    )
                }
            }
            Self::MultiplyLong { signed, acc, s, rd_hi, rd_lo, rs, rm } => {
                let mnemonic = match (signed, acc) {
                    (false, false) => "umull",
                    (false, true) => "umlal",
                    (true, false) => "smull",
                    (true, true) => "smlal",
                };
                format!(
                    "{}{} {}, {}, {}, {}",
                    mnemonic,
                    if s { "s" } else { "" },
                    register_name(rd_lo),
                    register_name(rd_hi),
                    register_name(rm),
                    register_name(rs)
                )
            }
            Self::Swap { byte, rn, rd, rm } => format!(
                "swp{} {}, {}, [{}]",
                if byte { "b" } else { "" },
                register_name(rd),
                register_name(rm),
                register_name(rn)
            ),
            Self::Mrs { spsr, rd } => {
                format!("mrs {}, {}", register_name(rd), if spsr { "spsr" } else { "cpsr" })
            }
            Self::MsrReg { spsr, rm } => {
                format!("msr {}, {}", if spsr { "spsr" } else { "cpsr" }, register_name(rm))
            }
            Self::MsrFlags { spsr, op2 } => {
                format!("msr {}, {}", if spsr { "spsr_flg" } else { "cpsr_flg" }, op2)
            }
            Self::SingleTransfer { pre, up, byte, writeback, load, rn, rd, offset } => {
                let mnemonic = if load { "ldr" } else { "str" };
                let b = if byte { "b" } else { "" };
                let sign = if up { "" } else { "-" };
                if pre {
                    format!(
                        "{}{} {}, [{}, {}{}]{}",
                        mnemonic,
                        b,
                        register_name(rd),
                        register_name(rn),
                        sign,
                        offset,
                        if writeback { "!" } else { "" }
                    )
                } else {
                    format!(
                        "{}{} {}, [{}], {}{}",
                        mnemonic,
                        b,
                        register_name(rd),
                        register_name(rn),
                        sign,
                        offset
                    )
                }
            }
            Self::HalfwordTransfer { pre, up, writeback, load, rn, rd, kind, offset } => {
                let mnemonic = match (kind, load) {
                    (HwKind::Half, true) => "ldrh",
                    (HwKind::Half, false) => "strh",
                    (HwKind::SignedByte, _) => "ldrsb",
                    (HwKind::SignedHalf, _) => "ldrsh",
                };
                let offset = match offset {
                    HwOffset::Imm(value) => format!("#0x{:x}", value),
                    HwOffset::Reg(rm) => register_name(rm),
                };
                let sign = if up { "" } else { "-" };
                if pre {
                    format!(
                        "{} {}, [{}, {}{}]{}",
                        mnemonic,
                        register_name(rd),
                        register_name(rn),
                        sign,
                        offset,
                        if writeback { "!" } else { "" }
                    )
                } else {
                    format!("{} {}, [{}], {}{}", mnemonic, register_name(rd), register_name(rn), sign, offset)
                }
            }
            Self::BlockTransfer { pre, up, user_bank, writeback, load, rn, list } => {
                let mode = match (up, pre) {
                    (true, false) => "ia",
                    (true, true) => "ib",
                    (false, false) => "da",
                    (false, true) => "db",
                };
                let regs: Vec<String> =
                    (0..16).filter(|reg| list >> reg & 1 != 0).map(register_name).collect();
                format!(
                    "{}{} {}{}, {{{}}}{}",
                    if load { "ldm" } else { "stm" },
                    mode,
                    register_name(rn),
                    if writeback { "!" } else { "" },
                    regs.join(", "),
                    if user_bank { "^" } else { "" }
                )
            }
            Self::Branch { link, offset } => {
                format!("b{} #{}", if link { "l" } else { "" }, offset)
            }
            Self::BranchExchange { rn } => format!("bx {}", register_name(rn)),
            Self::CoprocDataProc(op) => format!(
                "cdp p{}, {}, cr{}, cr{}, cr{}, {}",
                op.cp_number, op.cp_opcode, op.crd, op.crn, op.crm, op.cp
            ),
            Self::CoprocDataTransfer(op) => format!(
                "{} p{}, cr{}, [{}, #0x{:x}]{}",
                if op.load { "ldc" } else { "stc" },
                op.cp_number,
                op.crd,
                register_name(op.rn),
                op.offset << 2,
                if op.writeback { "!" } else { "" }
            ),
            Self::CoprocRegTransfer(op) => format!(
                "{} p{}, {}, {}, cr{}, cr{}, {}",
                if op.load { "mrc" } else { "mcr" },
                op.cp_number,
                op.cp_opcode,
                register_name(op.rd),
                op.crn,
                op.crm,
                op.cp
            ),
            Self::Swi => String::from("swi"),
            Self::Undefined => String::from("undefined"),
        }
    }
}

fn data_proc(cpu: &mut Cpu, op: DataOp, s: bool, rn: usize, rd: usize, op2: Operand2) -> Result<(), Fatal> {
    let op1 = cpu.read_register(rn)?;
    let op2 = op2.eval(cpu, s)?;
    let carry = cpu.cpsr.c();
    let set = s || op.is_compare();

    let result = match op {
        DataOp::And | DataOp::Tst => logical(cpu, op1 & op2, set),
        DataOp::Eor | DataOp::Teq => logical(cpu, op1 ^ op2, set),
        DataOp::Orr => logical(cpu, op1 | op2, set),
        DataOp::Bic => logical(cpu, op1 & !op2, set),
        DataOp::Mov => logical(cpu, op2, set),
        DataOp::Mvn => logical(cpu, !op2, set),
        DataOp::Sub | DataOp::Cmp => arithmetic(cpu, op1, !op2, true, set),
        DataOp::Rsb => arithmetic(cpu, op2, !op1, true, set),
        DataOp::Add | DataOp::Cmn => arithmetic(cpu, op1, op2, false, set),
        DataOp::Adc => arithmetic(cpu, op1, op2, carry, set),
        DataOp::Sbc => arithmetic(cpu, op1, !op2, carry, set),
        DataOp::Rsc => arithmetic(cpu, op2, !op1, carry, set),
    };

    if !op.is_compare() {
        cpu.write_register(rd, result)?;
    }
    Ok(())
}

// Logical ops take N/Z from the result; C was already set by the shifter.
fn logical(cpu: &mut Cpu, result: u32, set: bool) -> u32 {
    if set {
        cpu.cpsr.set_nz(result);
    }
    result
}

fn arithmetic(cpu: &mut Cpu, a: u32, b: u32, carry: bool, set: bool) -> u32 {
    let (result, carry_out, overflow) = add_with_carry(a, b, carry);
    if set {
        cpu.cpsr.set_nz(result);
        cpu.cpsr.set_c(carry_out);
        cpu.cpsr.set_v(overflow);
    }
    result
}

fn multiply(cpu: &mut Cpu, acc: bool, s: bool, rd: usize, rn: usize, rs: usize, rm: usize) -> Result<(), Fatal> {
    let mut result = cpu.read_register(rm)?.wrapping_mul(cpu.read_register(rs)?);
    if acc {
        result = result.wrapping_add(cpu.read_register(rn)?);
    }
    if s {
        cpu.cpsr.set_nz(result);
    }
    cpu.write_register(rd, result)
}

fn multiply_long(
    cpu: &mut Cpu,
    signed: bool,
    acc: bool,
    s: bool,
    rd_hi: usize,
    rd_lo: usize,
    rs: usize,
    rm: usize,
) -> Result<(), Fatal> {
    let op_a = cpu.read_register(rm)?;
    let op_b = cpu.read_register(rs)?;
    let initial = if acc {
        (cpu.read_register(rd_hi)? as u64) << 32 | cpu.read_register(rd_lo)? as u64
    } else {
        0
    };

    let result = if signed {
        (op_a as i32 as i64).wrapping_mul(op_b as i32 as i64).wrapping_add(initial as i64) as u64
    } else {
        (op_a as u64).wrapping_mul(op_b as u64).wrapping_add(initial)
    };

    if s {
        cpu.cpsr.set_n(result >> 63 != 0);
        cpu.cpsr.set_z(result == 0);
    }

    cpu.write_register(rd_lo, result as u32)?;
    cpu.write_register(rd_hi, (result >> 32) as u32)
}

fn swap(cpu: &mut Cpu, bus: &mut Bus, byte: bool, rn: usize, rd: usize, rm: usize) -> Result<(), Fatal> {
    if rd == PC || rn == PC || rm == PC {
        return Err(Fatal::new("PC cannot be used as an operand (Rd, Rn or Rm) in a SWAP instruction"));
    }

    let addr = cpu.read_register(rn)?;
    if byte {
        let tmp = bus.read_byte(addr);
        bus.write_byte(addr, cpu.read_register(rm)? as u8);
        cpu.write_register(rd, tmp as u32)
    } else {
        let tmp = bus.read_dword_le(addr);
        bus.write_dword_le(addr, cpu.read_register(rm)?);
        cpu.write_register(rd, tmp)
    }
}

/// Writes CPSR or the current mode's SPSR. User mode may only touch the
/// flag bits, whatever the caller asked for.
fn write_psr(cpu: &mut Cpu, spsr: bool, value: u32, flags_only: bool) -> Result<(), Fatal> {
    if flags_only || cpu.mode()? == Mode::Usr {
        let mask = 0xF000_0000;
        if spsr {
            if cpu.mode()? == Mode::Usr {
                return Err(Fatal::new("Cannot write to SPSR in user mode"));
            }
            let old = cpu.read_spsr()?.0;
            cpu.write_spsr(Psr(value & mask | old & !mask))
        } else {
            cpu.cpsr.0 = value & mask | cpu.cpsr.0 & !mask;
            Ok(())
        }
    } else if spsr {
        cpu.write_spsr(Psr(value))
    } else {
        cpu.cpsr = Psr(value);
        Ok(())
    }
}

fn single_transfer(
    cpu: &mut Cpu,
    bus: &mut Bus,
    pre: bool,
    up: bool,
    byte: bool,
    writeback: bool,
    load: bool,
    rn: usize,
    rd: usize,
    offset: Operand2,
) -> Result<(), Fatal> {
    let mut base = cpu.read_register(rn)?;
    let offset = offset.eval(cpu, false)?;

    let addr;
    if pre {
        base = if up { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
        addr = base;
    } else {
        addr = base;
        base = if up { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
    }

    if load {
        let value = if byte { bus.read_byte(addr) as u32 } else { bus.read_dword_le(addr) };
        cpu.write_register(rd, value)?;
    } else {
        let value = cpu.read_register(rd)?;
        if byte {
            bus.write_byte(addr, value as u8);
        } else {
            bus.write_dword_le(addr, value);
        }
    }

    // Post-indexing always writes back; pre-indexing only with the W bit.
    if writeback || !pre {
        if rn == PC {
            return Err(Fatal::new("Writeback to PC not allowed"));
        }
        cpu.write_register(rn, base)?;
    }
    Ok(())
}

fn halfword_transfer(
    cpu: &mut Cpu,
    bus: &mut Bus,
    pre: bool,
    up: bool,
    writeback: bool,
    load: bool,
    rn: usize,
    rd: usize,
    kind: HwKind,
    offset: HwOffset,
) -> Result<(), Fatal> {
    let mut base = cpu.read_register(rn)?;
    let offset = match offset {
        HwOffset::Imm(value) => value,
        HwOffset::Reg(rm) => {
            if rm == PC {
                return Err(Fatal::new("PC used as offset"));
            }
            cpu.read_register(rm)?
        }
    };

    let addr;
    if pre {
        base = if up { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
        addr = base;
    } else {
        addr = base;
        base = if up { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
    }

    match kind {
        HwKind::Half => {
            if load {
                let value = bus.read_word_le(addr) as u32;
                cpu.write_register(rd, value)?;
            } else {
                // A halfword store of PC stores the instruction address + 12.
                let value = if rd == PC {
                    cpu.read_register(PC)?.wrapping_add(4)
                } else {
                    cpu.read_register(rd)?
                };
                bus.write_word_le(addr, value as u16);
            }
        }
        HwKind::SignedByte => {
            if !load {
                return Err(Fatal::new("Signed transfers can only be loads"));
            }
            let value = bus.read_byte(addr) as i8 as i32 as u32;
            cpu.write_register(rd, value)?;
        }
        HwKind::SignedHalf => {
            if !load {
                return Err(Fatal::new("Signed transfers can only be loads"));
            }
            let value = bus.read_word_le(addr) as i16 as i32 as u32;
            cpu.write_register(rd, value)?;
        }
    }

    if writeback || !pre {
        if rn == PC {
            return Err(Fatal::new("Cannot write back to PC"));
        }
        cpu.write_register(rn, base)?;
    }
    Ok(())
}

fn block_transfer(
    cpu: &mut Cpu,
    bus: &mut Bus,
    pre: bool,
    up: bool,
    user_bank: bool,
    writeback: bool,
    load: bool,
    rn: usize,
    list: u16,
) -> Result<(), Fatal> {
    if list == 0 {
        return Err(Fatal::new("The register list cannot be empty"));
    }
    if rn == PC {
        return Err(Fatal::new("Base register cannot be PC"));
    }
    if user_bank {
        match cpu.mode()? {
            Mode::Usr | Mode::Sys => {
                return Err(Fatal::new("Force user mode set in non-privileged mode"))
            }
            _ => {}
        }
    }

    let mut address = cpu.read_register(rn)? & !0x3;
    let offset: u32 = if up { 4 } else { 4u32.wrapping_neg() };
    let order: Vec<usize> = if up { (0..16).collect() } else { (0..16).rev().collect() };

    for reg in order {
        if list >> reg & 1 == 0 {
            continue;
        }

        if pre {
            address = address.wrapping_add(offset);
        }

        // When the base sits in the list, writeback is performed as soon as
        // its slot comes up, so later transfers see the updated base.
        if writeback && reg == rn {
            cpu.write_register(rn, address)?;
        }

        if load {
            let value = bus.read_dword_le(address);
            if user_bank {
                cpu.write_user(reg, value);
            } else {
                cpu.write_register(reg, value)?;
            }
        } else {
            let value = if user_bank { cpu.read_user(reg) } else { cpu.read_register(reg)? };
            bus.write_dword_le(address, value);
        }

        if !pre {
            address = address.wrapping_add(offset);
        }
    }

    // An LDM with the S bit that loads PC also restores CPSR from SPSR.
    if load && user_bank && list >> PC & 1 != 0 {
        cpu.cpsr = cpu.read_spsr()?;
    }

    if writeback && list >> rn & 1 == 0 {
        cpu.write_register(rn, address)?;
    }
    Ok(())
}

/// SWI and undefined instruction traps: switch mode, save the return address
/// in the new mode's LR, save CPSR into its SPSR and jump to the vector.
fn exception(cpu: &mut Cpu, mode: Mode, vector: u32) -> Result<(), Fatal> {
    cpu.change_mode(mode);
    let ret = cpu.read_register(PC)?.wrapping_sub(4);
    cpu.write_register(LR, ret)?;
    cpu.write_register(PC, vector)?;
    cpu.write_spsr(cpu.cpsr)
}
