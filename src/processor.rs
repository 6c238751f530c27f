// This is the place for the basic processor implementation: the banked
// register file, the fetch/decode/execute tick and the interactive debugger.
// Instruction semantics live in the instructions module.

use std::io;
use std::io::prelude::*;

use termion::style;

use crate::devices::{Fatal, Signal};
use crate::fields::{Condition, Mode, Psr, PC, SP};
use crate::memory::Bus;
use crate::parser::parse_instruction;
use crate::vfp::Vfp;

pub struct Cpu {
    r_usr: [u32; 16], // USR/SYS bank, plus the unbanked low registers and PC
    r_fiq: [u32; 7],  // R8-R14
    r_irq: [u32; 2],  // SP/LR per exception mode
    r_svc: [u32; 2],
    r_abt: [u32; 2],
    r_und: [u32; 2],
    spsr_svc: Psr,
    spsr_abt: Psr,
    spsr_und: Psr,
    spsr_irq: Psr,
    spsr_fiq: Psr,
    pub cpsr: Psr,
}

impl Cpu {
    pub fn new(start_addr: u32) -> Cpu {
        let mut cpu = Cpu {
            r_usr: [0; 16],
            r_fiq: [0; 7],
            r_irq: [0; 2],
            r_svc: [0; 2],
            r_abt: [0; 2],
            r_und: [0; 2],
            spsr_svc: Psr(0),
            spsr_abt: Psr(0),
            spsr_und: Psr(0),
            spsr_irq: Psr(0),
            spsr_fiq: Psr(0),
            cpsr: Psr(Mode::Svc as u32),
        };
        cpu.r_usr[PC] = start_addr;
        cpu
    }

    pub fn mode(&self) -> Result<Mode, Fatal> {
        self.cpsr.mode().ok_or_else(|| Fatal::new("Invalid mode"))
    }

    pub fn change_mode(&mut self, mode: Mode) {
        self.cpsr.set_mode(mode);
    }

    /// The raw program counter, without the pipelined view.
    pub fn pc(&self) -> u32 {
        self.r_usr[PC]
    }

    pub fn read_register(&self, reg: usize) -> Result<u32, Fatal> {
        match reg {
            // First 8 regs never banked
            0..=7 => Ok(self.r_usr[reg]),
            // R8-R12 banked between the general and the FIQ bank
            8..=12 => {
                if self.mode()? == Mode::Fiq {
                    Ok(self.r_fiq[reg - 8])
                } else {
                    Ok(self.r_usr[reg])
                }
            }
            // SP/LR always banked
            13 | 14 => match self.mode()? {
                Mode::Usr | Mode::Sys => Ok(self.r_usr[reg]),
                Mode::Fiq => Ok(self.r_fiq[reg - 8]),
                Mode::Irq => Ok(self.r_irq[reg - 13]),
                Mode::Svc => Ok(self.r_svc[reg - 13]),
                Mode::Abt => Ok(self.r_abt[reg - 13]),
                Mode::Und => Ok(self.r_und[reg - 13]),
            },
            // PC reads give the pipelined view
            15 => Ok(self.r_usr[PC].wrapping_add(4)),
            _ => Err(Fatal::new(format!("Invalid register r{}", reg))),
        }
    }

    pub fn write_register(&mut self, reg: usize, value: u32) -> Result<(), Fatal> {
        match reg {
            0..=7 => self.r_usr[reg] = value,
            8..=12 => {
                if self.mode()? == Mode::Fiq {
                    self.r_fiq[reg - 8] = value;
                } else {
                    self.r_usr[reg] = value;
                }
            }
            13 | 14 => match self.mode()? {
                Mode::Usr | Mode::Sys => self.r_usr[reg] = value,
                Mode::Fiq => self.r_fiq[reg - 8] = value,
                Mode::Irq => self.r_irq[reg - 13] = value,
                Mode::Svc => self.r_svc[reg - 13] = value,
                Mode::Abt => self.r_abt[reg - 13] = value,
                Mode::Und => self.r_und[reg - 13] = value,
            },
            // PC writes take effect on the next fetch
            15 => self.r_usr[PC] = value,
            _ => return Err(Fatal::new(format!("Invalid register r{}", reg))),
        }
        Ok(())
    }

    /// User bank access for the S bit of block transfers.
    pub fn read_user(&self, reg: usize) -> u32 {
        self.r_usr[reg]
    }

    pub fn write_user(&mut self, reg: usize, value: u32) {
        self.r_usr[reg] = value;
    }

    pub fn read_spsr(&self) -> Result<Psr, Fatal> {
        match self.mode()? {
            Mode::Svc => Ok(self.spsr_svc),
            Mode::Abt => Ok(self.spsr_abt),
            Mode::Und => Ok(self.spsr_und),
            Mode::Irq => Ok(self.spsr_irq),
            Mode::Fiq => Ok(self.spsr_fiq),
            Mode::Usr | Mode::Sys => Err(Fatal::new("Cannot read from SPSR in user mode")),
        }
    }

    pub fn write_spsr(&mut self, value: Psr) -> Result<(), Fatal> {
        match self.mode()? {
            Mode::Svc => self.spsr_svc = value,
            Mode::Abt => self.spsr_abt = value,
            Mode::Und => self.spsr_und = value,
            Mode::Irq => self.spsr_irq = value,
            Mode::Fiq => self.spsr_fiq = value,
            Mode::Usr | Mode::Sys => return Err(Fatal::new("Cannot write to SPSR in user mode")),
        }
        Ok(())
    }

    /// Fetches, decodes and executes a single instruction.
    pub fn tick(&mut self, bus: &mut Bus, vfp: &mut Vfp) -> Result<Signal, Fatal> {
        let pc = self.r_usr[PC];
        let instr = bus.read_dword_le(pc);
        self.r_usr[PC] = pc.wrapping_add(4);

        // An all-zero word means the kernel ran off into empty memory.
        if instr == 0 {
            return Ok(Signal::Quit);
        }

        // PLD is a cache hint, safe to ignore.
        if instr == 0xF5D1_F100 {
            return Ok(Signal::Ok);
        }

        if !Condition::from_bits(instr >> 28).holds(self.cpsr) {
            return Ok(Signal::Ok);
        }

        // WFI doubles as a breakpoint: drop into the debugger prompt.
        if instr & 0x0FFF_00FF == 0x0320_0003 {
            return debug_break(self, bus, vfp);
        }

        parse_instruction(instr).execute(self, bus, vfp)?;
        Ok(Signal::Ok)
    }

    /// Prints the register state to stdout.
    pub fn dump(&self) -> Result<(), Fatal> {
        println!("Registers:");
        for reg in 0..=12 {
            let value = self.read_register(reg)?;
            println!("${:<3}: {:10} (0x{:08x})", reg, value, value);
        }
        let pc = self.read_register(PC)?;
        println!("PC  : {:10} (0x{:08x})", pc, pc);
        let cpsr = self.cpsr.0 & !0x1F;
        println!("CPSR: {:10} (0x{:08x})", cpsr, cpsr);
        Ok(())
    }
}

/// Interactive debugger, entered through the breakpoint encoding. Reads
/// single commands from stdin until told to resume or quit.
fn debug_break(cpu: &mut Cpu, bus: &mut Bus, vfp: &Vfp) -> Result<Signal, Fatal> {
    println!("{}Breakpoint reached!{}", style::Bold, style::Reset);
    let next = parse_instruction(bus.read_dword_le(cpu.pc()));
    println!("Next instruction: {}", next.as_asm());
    println!("Commands:");
    println!("\tc         - Dump CPU");
    println!("\tv         - Dump VFP");
    println!("\te         - Dump Emulator");
    println!("\tsa<n>     - Dump last n words on the stack (asc)");
    println!("\tsd<n>     - Dump last n words on the stack (dsc)");
    println!("\tma<n>r<r> - Dump n words at memory address in register r (asc)");
    println!("\tmd<n>r<r> - Dump n words at memory address in register r (dsc)");
    println!("\tq         - Quit the emulator");

    loop {
        print!("\nEnter a command: ");
        io::stdout().flush().expect("");
        let mut line = String::new();
        if io::stdin().read_line(&mut line).is_err() {
            return Ok(Signal::Ok);
        }
        let cmd = line.trim();

        match cmd.chars().next() {
            Some('c') => cpu.dump()?,
            Some('v') => vfp.dump(),
            Some('e') => {
                cpu.dump()?;
                bus.dump();
            }
            Some('s') if cmd.len() > 2 => {
                let ascending = cmd.as_bytes()[1] == b'a';
                let count = cmd[2..].parse().unwrap_or(0);
                let base = cpu.read_register(SP)?;
                dump_window(bus, base, count, ascending, "SP");
            }
            Some('m') if cmd.len() > 2 => {
                let ascending = cmd.as_bytes()[1] == b'a';
                if let Some(split) = cmd[2..].find('r') {
                    let count = cmd[2..2 + split].parse().unwrap_or(0);
                    let reg: usize = cmd[3 + split..].parse().unwrap_or(0);
                    if reg <= 15 {
                        let base = cpu.read_register(reg)?;
                        dump_window(bus, base, count, ascending, &format!("r{}", reg));
                    }
                }
            }
            Some('q') => return Ok(Signal::Quit),
            _ => return Ok(Signal::Ok),
        }
    }
}

/// Prints a window of `count` words around `base`, walking down in memory
/// when ascending (stack order) and up otherwise.
fn dump_window(bus: &mut Bus, base: u32, count: u32, ascending: bool, label: &str) {
    for i in 0..count {
        let (offset, sign) = if ascending { (i * 4, '-') } else { ((count - 1 - i) * 4, '+') };
        let addr = if ascending { base.wrapping_sub(offset) } else { base.wrapping_add(offset) };
        let data = bus.read_dword_le(addr);
        let text: String = data
            .to_be_bytes()
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        println!("{}{}{:<2} \t0x{:08x} : 0x{:08x} : '{}'", label, sign, offset, addr, data, text);
    }
}
