//! Circular byte buffers between the UART interrupts and the main loop.

use core::cell::RefCell;

use critical_section::Mutex;

pub const BUFSIZE: usize = 256;

#[derive(Debug)]
struct Ring {
    buf: [u8; BUFSIZE],
    write_idx: u8,
    read_idx: u8,
}

/// Single producer, single consumer ring of 256 bytes. One slot stays free,
/// so it holds at most 255 bytes; a byte put into a full buffer is dropped.
#[derive(Debug)]
pub struct ComBuffer {
    ring: Mutex<RefCell<Ring>>,
}

impl Default for ComBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ComBuffer {
    pub const fn new() -> Self {
        Self { ring: Mutex::new(RefCell::new(Ring { buf: [0; BUFSIZE], write_idx: 0, read_idx: 0 })) }
    }

    pub fn put(&self, c: u8) {
        critical_section::with(|cs| {
            let mut ring = self.ring.borrow_ref_mut(cs);
            let next = ring.write_idx.wrapping_add(1);
            if next != ring.read_idx {
                let idx = ring.write_idx as usize;
                ring.buf[idx] = c;
                ring.write_idx = next;
            }
        })
    }

    pub fn put_data(&self, data: &[u8]) {
        for c in data {
            self.put(*c);
        }
    }

    pub fn puts(&self, s: &str) {
        self.put_data(s.as_bytes());
    }

    /// Discards everything not yet read.
    pub fn flush(&self) {
        critical_section::with(|cs| {
            let mut ring = self.ring.borrow_ref_mut(cs);
            ring.read_idx = ring.write_idx;
        })
    }

    pub fn available(&self) -> bool {
        critical_section::with(|cs| {
            let ring = self.ring.borrow_ref(cs);
            ring.read_idx != ring.write_idx
        })
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| {
            let ring = self.ring.borrow_ref(cs);
            ring.write_idx.wrapping_sub(ring.read_idx) as usize
        })
    }

    pub fn is_empty(&self) -> bool {
        !self.available()
    }

    pub fn get(&self) -> Option<u8> {
        critical_section::with(|cs| {
            let mut ring = self.ring.borrow_ref_mut(cs);
            if ring.read_idx == ring.write_idx {
                return None;
            }
            let c = ring.buf[ring.read_idx as usize];
            ring.read_idx = ring.read_idx.wrapping_add(1);
            Some(c)
        })
    }

    /// Moves up to `dest.len()` bytes out of the buffer.
    pub fn get_into(&self, dest: &mut [u8]) -> usize {
        let mut n = 0;
        while n < dest.len() {
            match self.get() {
                Some(c) => dest[n] = c,
                None => break,
            }
            n += 1;
        }
        n
    }
}
