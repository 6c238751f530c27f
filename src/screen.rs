// Presentation layer: an abstract pixel target the framebuffer renders into,
// plus the host input that comes back from it. The minifb window is the real
// implementation; NullScreen serves batch runs and tests.

use minifb::{Window, WindowOptions};

use crate::devices::Framebuffer;

/// Host keys the emulator cares about: the controller bindings and the digit
/// row used for GPIO testing.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Key {
    Space,
    Tab,
    Return,
    P,
    A,
    D,
    W,
    S,
    Digit(u8),
}

/// What the host window reported during one refresh.
pub struct ScreenInput {
    pub closed: bool,
    pub keys: Vec<(Key, bool)>,
}

impl ScreenInput {
    pub fn empty() -> ScreenInput {
        ScreenInput { closed: false, keys: Vec::new() }
    }
}

pub trait Screen {
    fn resize(&mut self, width: u32, height: u32);

    /// Blits the framebuffer, pumps the host event loop and reports the
    /// current key states.
    fn refresh(&mut self, fb: &Framebuffer) -> ScreenInput;
}

pub struct NullScreen;

impl Screen for NullScreen {
    fn resize(&mut self, _width: u32, _height: u32) {}

    fn refresh(&mut self, _fb: &Framebuffer) -> ScreenInput {
        ScreenInput::empty()
    }
}

const TRACKED_KEYS: [(minifb::Key, Key); 17] = [
    (minifb::Key::Space, Key::Space),
    (minifb::Key::Tab, Key::Tab),
    (minifb::Key::Enter, Key::Return),
    (minifb::Key::P, Key::P),
    (minifb::Key::A, Key::A),
    (minifb::Key::D, Key::D),
    (minifb::Key::W, Key::W),
    (minifb::Key::S, Key::S),
    (minifb::Key::Key1, Key::Digit(1)),
    (minifb::Key::Key2, Key::Digit(2)),
    (minifb::Key::Key3, Key::Digit(3)),
    (minifb::Key::Key4, Key::Digit(4)),
    (minifb::Key::Key5, Key::Digit(5)),
    (minifb::Key::Key6, Key::Digit(6)),
    (minifb::Key::Key7, Key::Digit(7)),
    (minifb::Key::Key8, Key::Digit(8)),
    (minifb::Key::Key9, Key::Digit(9)),
];

pub struct Monitor {
    window: Window,
    buffer: Vec<u32>,
    width: usize,
    height: usize,
}

impl Monitor {
    pub fn new() -> Monitor {
        Monitor {
            window: Monitor::open_window(640, 480),
            buffer: vec![0; 640 * 480],
            width: 640,
            height: 480,
        }
    }

    fn open_window(width: usize, height: usize) -> Window {
        Window::new("Raspberry Pi Emulator", width, height, WindowOptions::default())
            .unwrap_or_else(|e| {
                panic!("{}", e);
            })
    }
}

impl Screen for Monitor {
    fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.width = width as usize;
        self.height = height as usize;
        self.buffer = vec![0; self.width * self.height];
        // minifb windows cannot change size, so open a fresh one.
        self.window = Monitor::open_window(self.width, self.height);
    }

    fn refresh(&mut self, fb: &Framebuffer) -> ScreenInput {
        if !self.window.is_open() {
            return ScreenInput { closed: true, keys: Vec::new() };
        }

        for y in 0..self.height {
            for x in 0..self.width {
                let (r, g, b) = fb.pixel(x as u32, y as u32);
                self.buffer[y * self.width + x] = (r as u32) << 16 | (g as u32) << 8 | b as u32;
            }
        }
        self.window
            .update_with_buffer(&self.buffer, self.width, self.height)
            .expect("Error updating screen!");

        let keys = TRACKED_KEYS
            .iter()
            .map(|&(host, key)| (key, self.window.is_key_down(host)))
            .collect();
        ScreenInput { closed: false, keys }
    }
}
