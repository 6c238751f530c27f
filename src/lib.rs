use std::fs;

pub mod devices;
pub mod fields;
pub mod instructions;
pub mod memory;
pub mod parser;
pub mod processor;
pub mod screen;
pub mod vfp;

pub use devices::{Fatal, Signal};

use memory::Bus;
use processor::Cpu;
use screen::{NullScreen, Screen};
use vfp::Vfp;

/// Host window refresh interval in milliseconds.
const FRAME_TIME: u64 = 20;

pub struct Configuration {
    pub mem_size: usize,
    pub start_addr: u32,
    pub graphics: bool,
    pub nes_enabled: bool,
    pub quiet: bool,
    pub gpio_test_offset: Option<usize>,
}

impl Default for Configuration {
    fn default() -> Configuration {
        Configuration {
            mem_size: 0x10000,
            start_addr: 0,
            graphics: false,
            nes_enabled: false,
            quiet: false,
            gpio_test_offset: None,
        }
    }
}

pub struct Emulator {
    pub cpu: Cpu,
    pub vfp: Vfp,
    pub bus: Bus,
    start_addr: u32,
    terminated: bool,
    last_refresh: u64,
}

impl Emulator {
    pub fn new(config: Configuration) -> Emulator {
        Emulator::with_screen(config, Box::new(NullScreen))
    }

    pub fn with_screen(config: Configuration, screen: Box<dyn Screen>) -> Emulator {
        Emulator {
            cpu: Cpu::new(config.start_addr),
            vfp: Vfp::new(),
            bus: Bus::new(&config, screen),
            start_addr: config.start_addr,
            terminated: false,
            last_refresh: 0,
        }
    }

    /// Loads a raw kernel image from disk into SDRAM at the start address.
    pub fn load(&mut self, path: &str) -> Result<(), Fatal> {
        let image =
            fs::read(path).map_err(|_| Fatal::new(format!("Cannot open file '{}'", path)))?;
        self.load_image(&image)
    }

    pub fn load_image(&mut self, image: &[u8]) -> Result<(), Fatal> {
        let start = self.start_addr as usize;
        if start + image.len() > self.bus.memory.size() {
            return Err(Fatal::new("Not enough memory for kernel"));
        }
        self.bus.memory.data[start..start + image.len()].copy_from_slice(image);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.terminated
    }

    /// One emulation step: a CPU tick, plus a screen refresh whenever enough
    /// host time has passed.
    pub fn tick(&mut self) -> Result<(), Fatal> {
        if let Signal::Quit = self.cpu.tick(&mut self.bus, &mut self.vfp)? {
            self.terminated = true;
        }

        if self.bus.graphics {
            let now = self.bus.time_ms();
            if now - self.last_refresh > FRAME_TIME {
                if let Signal::Quit = self.bus.refresh() {
                    self.terminated = true;
                }
                self.last_refresh = now;
            }
        }
        Ok(())
    }

    pub fn run(&mut self) -> Result<(), Fatal> {
        while self.is_running() {
            self.tick()?;
        }
        Ok(())
    }

    /// Prints the CPU state followed by the non-zero memory words.
    pub fn dump(&mut self) -> Result<(), Fatal> {
        self.cpu.dump()?;
        self.bus.dump();
        Ok(())
    }
}
