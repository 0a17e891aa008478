use esp_hal::{
    i2c::master::{Error as I2cError, I2c},
    time::{Duration, Instant},
    Blocking,
};
use heapless::Vec;

pub trait DelayOps {
    fn delay_us(&self, micros: u32);
    fn delay_ms(&self, millis: u32);
}

pub trait I2cOps {
    type Error;

    fn read(&mut self, addr: u8, buffer: &mut [u8]) -> Result<(), Self::Error>;
    fn write(&mut self, addr: u8, bytes: &[u8]) -> Result<(), Self::Error>;
    fn write_read(&mut self, addr: u8, bytes: &[u8], buffer: &mut [u8]) -> Result<(), Self::Error>;
    fn probe(&mut self, addr: u8) -> Result<bool, Self::Error>;

    /// Collects every candidate address that ACKs an address phase.
    fn scan<const N: usize>(&mut self, candidates: &[u8], found: &mut Vec<u8, N>) {
        for &addr in candidates {
            if matches!(self.probe(addr), Ok(true)) {
                let _ = found.push(addr);
            }
        }
    }
}

pub struct HalI2c<'d> {
    bus: I2c<'d, Blocking>,
}

impl<'d> HalI2c<'d> {
    pub fn new(bus: I2c<'d, Blocking>) -> Self {
        Self { bus }
    }
}

// Address-rule tables carry 8-bit styled addresses; the bus only ever
// sees the low 7 bits.
fn wire(addr: u8) -> u8 {
    addr & 0x7F
}

impl I2cOps for HalI2c<'_> {
    type Error = I2cError;

    fn read(&mut self, addr: u8, buffer: &mut [u8]) -> Result<(), Self::Error> {
        self.bus.read(wire(addr), buffer)
    }

    fn write(&mut self, addr: u8, bytes: &[u8]) -> Result<(), Self::Error> {
        self.bus.write(wire(addr), bytes)
    }

    fn write_read(&mut self, addr: u8, bytes: &[u8], buffer: &mut [u8]) -> Result<(), Self::Error> {
        self.bus.write_read(wire(addr), bytes, buffer)
    }

    fn probe(&mut self, addr: u8) -> Result<bool, Self::Error> {
        match self.bus.write(wire(addr), &[0x00]) {
            Ok(()) => Ok(true),
            Err(I2cError::AcknowledgeCheckFailed(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[derive(Clone, Copy, Default)]
pub struct BusyDelay;

impl BusyDelay {
    pub const fn new() -> Self {
        Self
    }

    fn delay_duration(&self, duration: Duration) {
        let start = Instant::now();
        while start.elapsed() < duration {}
    }
}

impl DelayOps for BusyDelay {
    fn delay_us(&self, micros: u32) {
        self.delay_duration(Duration::from_micros(micros as u64));
    }

    fn delay_ms(&self, millis: u32) {
        self.delay_duration(Duration::from_millis(millis as u64));
    }
}
