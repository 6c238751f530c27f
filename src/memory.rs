// SDRAM and the bus that routes every load and store either into it or to
// one of the memory-mapped devices. The bus also carries the info/error
// sinks and the system timer, so the devices themselves stay plain state.

use std::time::Instant;

use crate::devices::{
    AuxWrite, Framebuffer, Gpio, Mailbox, Nes, Peripheral, Signal, GPIO_PORT_COUNT, MBOX_READ,
    MBOX_STATUS, MBOX_WRITE,
};
use crate::screen::{Key, Screen};
use crate::Configuration;

/// SDRAM and the IO peripherals alias at four address ranges; dropping the
/// top two bits collapses them, which is fine because caching is ignored.
pub const MEM_MASK: u32 = 0x3FFF_FFFF;

const TIMER_LO: u32 = 0x2000_3004;
const TIMER_HI: u32 = 0x2000_3008;
const DMA_BASE: u32 = 0x2000_7000;
const DMA_END: u32 = 0x2000_7FF4;

pub struct Memory {
    pub data: Vec<u8>,
}

impl Memory {
    pub fn new(size: usize) -> Memory {
        Memory { data: vec![0; size] }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

pub struct Bus {
    pub memory: Memory,
    pub gpio: Gpio,
    pub mbox: Mailbox,
    pub fb: Framebuffer,
    pub pr: Peripheral,
    pub nes: Nes,
    pub screen: Box<dyn Screen>,
    pub quiet: bool,
    pub graphics: bool,
    pub nes_enabled: bool,
    pub gpio_test_offset: Option<usize>,
    start: Instant,
}

impl Bus {
    pub fn new(config: &Configuration, screen: Box<dyn Screen>) -> Bus {
        Bus {
            memory: Memory::new(config.mem_size),
            gpio: Gpio::new(),
            mbox: Mailbox::new(),
            fb: Framebuffer::new(),
            pr: Peripheral::new(),
            nes: Nes::new(),
            screen,
            quiet: config.quiet,
            graphics: config.graphics,
            nes_enabled: config.nes_enabled,
            gpio_test_offset: config.gpio_test_offset,
            start: Instant::now(),
        }
    }

    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("Info: {}", msg);
        }
    }

    pub fn error(&self, msg: &str) {
        if !self.quiet {
            println!("Error: {}", msg);
        }
    }

    fn putc(&self, byte: u8) {
        if !self.quiet {
            print!("{}", byte as char);
        }
    }

    /// Microseconds since startup; the guest reads this at the system timer
    /// registers and sees real time passing.
    pub fn system_timer(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    pub fn time_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    // -- reads --------------------------------------------------------------

    pub fn read_byte(&mut self, addr: u32) -> u8 {
        let addr = addr & MEM_MASK;

        if (addr as usize) < self.memory.size() {
            return self.memory.data[addr as usize];
        }

        self.error(&format!("Out of bounds memory access at address 0x{:08x}", addr));
        0
    }

    pub fn read_word_le(&mut self, addr: u32) -> u16 {
        let addr = addr & MEM_MASK;

        if (addr as usize) + 1 < self.memory.size() {
            // Unaligned reads behave like the enclosing aligned word rotated
            // by the misalignment, the way the bus does with the MMU off.
            let base = (addr & !0x3) as usize;
            let off = (addr & 0x3) as usize;
            let data = &self.memory.data;
            return data[base + off] as u16 | (data[base + ((off + 1) & 0x3)] as u16) << 8;
        }

        if self.fb.is_buffer(addr) {
            return self.fb.read_word(addr);
        }

        self.error(&format!("Out of bounds memory access at address 0x{:08x}", addr));
        0
    }

    pub fn read_dword_le(&mut self, addr: u32) -> u32 {
        let addr = addr & MEM_MASK;

        if (addr as usize) + 3 < self.memory.size() {
            let base = (addr & !0x3) as usize;
            let off = (addr & 0x3) as usize;
            let data = &self.memory.data;
            let mut value = 0;
            for i in 0..4 {
                value |= (data[base + ((off + i) & 0x3)] as u32) << (8 * i);
            }
            return value;
        }

        if addr == TIMER_LO {
            return self.system_timer() as u32;
        }
        if addr == TIMER_HI {
            return (self.system_timer() >> 32) as u32;
        }
        if Gpio::is_port(addr) {
            return self.gpio_read(addr);
        }
        if Mailbox::is_port(addr) {
            return self.mbox_read(addr);
        }
        if Peripheral::is_aux_port(addr) {
            return self.aux_read(addr);
        }
        if self.fb.is_buffer(addr) {
            return self.fb.read_dword(addr);
        }
        if (DMA_BASE..DMA_END).contains(&addr) {
            return 0;
        }

        self.error(&format!("Out of bounds memory access at address 0x{:08x}", addr));
        0
    }

    pub fn read_word_be(&mut self, addr: u32) -> u16 {
        self.read_word_le(addr).swap_bytes()
    }

    pub fn read_dword_be(&mut self, addr: u32) -> u32 {
        self.read_dword_le(addr).swap_bytes()
    }

    // -- writes -------------------------------------------------------------

    pub fn write_byte(&mut self, addr: u32, data: u8) {
        let addr = addr & MEM_MASK;

        if (addr as usize) < self.memory.size() {
            self.memory.data[addr as usize] = data;
            return;
        }

        self.error(&format!("Out of bounds memory access at address 0x{:08x}", addr));
    }

    pub fn write_word_le(&mut self, addr: u32, data: u16) {
        let addr = addr & MEM_MASK;

        if (addr as usize) + 1 < self.memory.size() {
            self.memory.data[addr as usize] = data as u8;
            self.memory.data[addr as usize + 1] = (data >> 8) as u8;
            return;
        }

        if self.fb.is_buffer(addr) {
            self.fb.write_word(addr, data);
            return;
        }

        self.error(&format!("Out of bounds memory access at address 0x{:08x}", addr));
    }

    pub fn write_dword_le(&mut self, addr: u32, data: u32) {
        let addr = addr & MEM_MASK;

        if (addr as usize) + 3 < self.memory.size() {
            for i in 0..4 {
                self.memory.data[addr as usize + i] = (data >> (8 * i)) as u8;
            }
            return;
        }

        if Gpio::is_port(addr) {
            self.gpio_write(addr, data);
            return;
        }
        if Mailbox::is_port(addr) {
            self.mbox_write(addr, data);
            return;
        }
        if Peripheral::is_aux_port(addr) {
            self.aux_write(addr, data);
            return;
        }
        if self.fb.is_buffer(addr) {
            self.fb.write_dword(addr, data);
            return;
        }
        if (DMA_BASE..DMA_END).contains(&addr) {
            return;
        }

        self.error(&format!("Out of bounds memory access at address 0x{:08x}", addr));
    }

    pub fn write_word_be(&mut self, addr: u32, data: u16) {
        self.write_word_le(addr, data.swap_bytes());
    }

    pub fn write_dword_be(&mut self, addr: u32, data: u32) {
        self.write_dword_le(addr, data.swap_bytes());
    }

    // -- device routing -----------------------------------------------------

    fn gpio_read(&mut self, addr: u32) -> u32 {
        match self.gpio.read_port(addr) {
            Some(value) => value,
            None => {
                self.error(&format!("GPIO unimplemented 0x{:08x}", addr & !0x3));
                0
            }
        }
    }

    fn gpio_write(&mut self, addr: u32, val: u32) {
        let nes = if self.nes_enabled { Some(&mut self.nes) } else { None };
        if self.gpio.write_port(addr, val, nes).is_none() {
            self.error(&format!("GPIO unimplemented 0x{:08x}", addr & !0x3));
        }
    }

    fn mbox_read(&mut self, addr: u32) -> u32 {
        let addr = addr & !0x3;
        match addr {
            MBOX_READ => {
                let channel = self.mbox.last_channel as u32;
                // A failed framebuffer request flips the high bits.
                if channel == 1 && self.fb.error {
                    channel | !0xF
                } else {
                    channel
                }
            }
            // Always ready to send and receive.
            MBOX_STATUS => 0,
            _ => {
                self.error(&format!("Mailbox unimplemented 0x{:08x}", addr));
                0
            }
        }
    }

    fn mbox_write(&mut self, addr: u32, val: u32) {
        let addr = addr & !0x3;
        let channel = (val & 0xF) as u8;
        let data = val & !0xF;

        self.mbox.last_channel = channel;

        match addr {
            MBOX_WRITE => match channel {
                1 => self.fb_request(data),
                _ => self.error(&format!("Wrong channel 0x{:x}", channel)),
            },
            _ => self.error(&format!("Mailbox unimplemented 0x{:08x}", addr)),
        }
    }

    fn aux_read(&mut self, addr: u32) -> u32 {
        match self.pr.read(addr) {
            Some(value) => value,
            None => {
                self.error(&format!("Unsupported peripheral read: 0x{:08x}", addr));
                0
            }
        }
    }

    fn aux_write(&mut self, addr: u32, data: u32) {
        match self.pr.write(addr, data) {
            AuxWrite::Stored => {}
            AuxWrite::Output(byte) => self.putc(byte),
            AuxWrite::Unknown => {
                self.error(&format!("Unsupported peripheral write: 0x{:08x}", addr));
            }
        }
    }

    /// Services a framebuffer request received through mailbox channel 1:
    /// reads the descriptor out of guest memory, allocates the pixel store
    /// right behind SDRAM and writes the patched descriptor back.
    fn fb_request(&mut self, addr: u32) {
        self.fb.error = false;

        if !self.graphics {
            self.error("Graphic mode must be enabled for framebuffer");
            self.fb.error = true;
            return;
        }

        if addr < 0x4000_0000 {
            self.error("Invalid framebuffer address");
            self.fb.error = true;
            return;
        }
        let addr = addr - 0x4000_0000;

        let mut words = [0; 10];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.read_dword_le(addr + (i as u32) * 4);
        }
        let mut req = crate::devices::FbRequest::from_words(words);

        if req.depth == 8 {
            // The palette is assumed to sit right behind the descriptor.
            for i in 0..256 {
                self.fb.palette[i] = self.read_word_le(addr + 40 + (i as u32) * 2);
            }
        } else if req.depth != 16 && req.depth != 24 && req.depth != 32 {
            self.error("Unsupported pixel format");
        }

        self.fb.bpp = req.depth >> 3;
        let pitch = req.virt_width.saturating_mul(self.fb.bpp);
        self.fb.pitch = pitch + (4 - pitch % 4) % 4;
        self.fb.size = self.fb.pitch.saturating_mul(req.virt_height);

        if self.fb.size == 0 || self.fb.size > 1 << 28 {
            self.error("Invalid framebuffer size");
            self.fb.error = true;
            return;
        }

        req.pitch = self.fb.pitch;
        req.size = self.fb.size;
        self.fb.address = self.memory.size() as u32;
        req.addr = self.fb.address;
        self.fb.buffer = vec![0; self.fb.size as usize];
        self.fb.width = req.virt_width;
        self.fb.height = req.virt_height;

        // Write the patched descriptor back for the guest to pick up.
        for (i, word) in req.to_words().iter().enumerate() {
            self.write_dword_le(addr + (i as u32) * 4, *word);
        }

        self.screen.resize(req.virt_width, req.virt_height);
    }

    /// One presentation refresh: blit, pump host events and route the keys
    /// to the NES pad and the GPIO test ports.
    pub fn refresh(&mut self) -> Signal {
        let input = self.screen.refresh(&self.fb);
        if input.closed {
            return Signal::Quit;
        }

        for (key, down) in input.keys {
            match key {
                Key::Digit(n) => {
                    if let Some(offset) = self.gpio_test_offset {
                        let port = offset + n as usize - 1;
                        if port < GPIO_PORT_COUNT {
                            self.gpio.ports[port].state = down as u8;
                        }
                    }
                }
                _ => {
                    if self.nes_enabled {
                        self.nes.set_key(key, down);
                    }
                }
            }
        }
        Signal::Ok
    }

    /// Prints the non-zero words in the first 64K of memory.
    pub fn dump(&mut self) {
        println!("Non-zero memory:");
        let limit = self.memory.size().min(65535);
        for addr in (0..limit).step_by(4) {
            let data = self.read_dword_be(addr as u32);
            if data != 0 {
                println!("0x{:08x}: 0x{:08x}", addr, data);
            }
        }
    }
}
