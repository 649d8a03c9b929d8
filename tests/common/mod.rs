//! In-process bootloader: the command loop runs on a thread behind a pair
//! of channels standing in for the serial line.

#![allow(dead_code)]

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};
use embedded_hal::watchdog::Watchdog;

use sboot::device::sim::{SimulatedNvm, SimulatedSystem};
use sboot::device::{DeviceConfig, Dispatcher, Nvm, Uart};
use sboot::geometry::{Geometry, Region};
use sboot::{Options, SerialPort, Updater};

/// The other end of the line went away
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Closed;

/// One end of a simulated serial line
pub struct Wire {
    tx: Sender<u8>,
    rx: Receiver<u8>,
}

/// Connected pair of line ends
pub fn wire() -> (Wire, Wire) {
    let (a_tx, b_rx) = channel();
    let (b_tx, a_rx) = channel();

    (Wire { tx: a_tx, rx: a_rx }, Wire { tx: b_tx, rx: b_rx })
}

impl Read<u8> for Wire {
    type Error = Closed;

    fn read(&mut self) -> nb::Result<u8, Closed> {
        match self.rx.recv_timeout(Duration::from_millis(1)) {
            Ok(b) => Ok(b),
            Err(RecvTimeoutError::Timeout) => Err(nb::Error::WouldBlock),
            Err(RecvTimeoutError::Disconnected) => Err(nb::Error::Other(Closed)),
        }
    }
}

impl Write<u8> for Wire {
    type Error = Closed;

    fn write(&mut self, byte: u8) -> nb::Result<(), Closed> {
        self.tx.send(byte).map_err(|_| nb::Error::Other(Closed))
    }

    fn flush(&mut self) -> nb::Result<(), Closed> {
        Ok(())
    }
}

impl SerialPort<Closed> for Wire {
    fn set_rts(&mut self, _level: bool) -> Result<(), Closed> {
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> Result<(), Closed> {
        Ok(())
    }
}

/// Accepts every byte and never answers
pub struct Silent;

impl Read<u8> for Silent {
    type Error = Closed;

    fn read(&mut self) -> nb::Result<u8, Closed> {
        Err(nb::Error::WouldBlock)
    }
}

impl Write<u8> for Silent {
    type Error = Closed;

    fn write(&mut self, _byte: u8) -> nb::Result<(), Closed> {
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Closed> {
        Ok(())
    }
}

impl SerialPort<Closed> for Silent {
    fn set_rts(&mut self, _level: bool) -> Result<(), Closed> {
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> Result<(), Closed> {
        Ok(())
    }
}

/// Thread sleep delay
#[derive(Copy, Clone, Default)]
pub struct Sleep;

impl DelayMs<u32> for Sleep {
    fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(ms as u64));
    }
}

impl DelayMs<u16> for Sleep {
    fn delay_ms(&mut self, ms: u16) {
        thread::sleep(Duration::from_millis(ms as u64));
    }
}

#[derive(Default)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn feed(&mut self) {}
}

/// Four 256 byte application pages
pub const GEOMETRY: Geometry = Geometry {
    application: Region::new(0, 1024, 256),
    boot: Region::new(0x400, 512, 256),
    eeprom: Region::new(0, 128, 32),
    user_signature: Region::new(0, 64, 64),
};

pub type Device = Dispatcher<Uart<Wire>, SimulatedNvm, SimulatedSystem, NoWatchdog, Sleep>;

pub fn device(line: Wire) -> Device {
    dispatcher(Uart::new(line))
}

pub fn dispatcher(link: Uart<Wire>) -> Device {
    let nvm = Nvm::new(SimulatedNvm::new(GEOMETRY).with_latency(3), GEOMETRY, 1_000);

    Dispatcher::new(
        link,
        nvm,
        SimulatedSystem::new(),
        NoWatchdog,
        Sleep,
        DeviceConfig::default(),
    )
}

/// Serves commands until the host end is dropped
pub fn spawn(mut device: Device) -> JoinHandle<Device> {
    thread::spawn(move || {
        while device.step().is_ok() {}
        device
    })
}

pub fn options() -> Options {
    Options {
        rendezvous_timeout_ms: 2_000,
        ..Options::default()
    }
}

/// Updater connected to a freshly started bootloader
pub fn connect() -> (Updater<Wire, Sleep, Closed>, JoinHandle<Device>) {
    let (host, target) = wire();
    let handle = spawn(device(target));

    (Updater::new(host, Sleep, options()), handle)
}

/// Drops the host end and collects the bootloader state
pub fn finish(updater: Updater<Wire, Sleep, Closed>, handle: JoinHandle<Device>) -> (SimulatedNvm, SimulatedSystem) {
    drop(updater.free());

    let (_, nvm, system, _, _) = handle.join().expect("bootloader thread panicked").release();
    (nvm.release(), system)
}
