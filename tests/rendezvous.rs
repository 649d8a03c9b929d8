//! Finding the bootloader.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{dispatcher, finish, options, wire, Closed, Silent, Sleep, Wire};
use sboot::device::{BootTimer, Entry, HandshakeArbiter, Uart};
use sboot::protocol::BOOTLOADER_VERSION;
use sboot::{Error, Options, Updater};

#[test]
fn cancelled_from_another_thread() {
    let opts = Options {
        rendezvous_timeout_ms: 0,
        ..Options::default()
    };
    let mut u = Updater::<Silent, Sleep, Closed>::new(Silent, Sleep, opts);

    let cancel = Arc::new(AtomicBool::new(false));
    let c = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        c.store(true, Ordering::Relaxed);
    });

    assert_eq!(u.wait_for_bootloader(Some(&*cancel)), Err(Error::Cancelled));
    canceller.join().unwrap();
}

#[test]
fn gives_up_after_timeout() {
    let opts = Options {
        rendezvous_timeout_ms: 50,
        ..Options::default()
    };
    let mut u = Updater::<Silent, Sleep, Closed>::new(Silent, Sleep, opts);

    assert_eq!(
        u.wait_for_bootloader(None),
        Err(Error::ResponseTimeout)
    );
}

struct WallTimer(Option<Instant>);

impl BootTimer for WallTimer {
    fn start(&mut self) {
        self.0 = Some(Instant::now());
    }

    fn elapsed_ms(&mut self) -> u32 {
        self.0.map(|t| t.elapsed().as_millis() as u32).unwrap_or(0)
    }

    fn stop(&mut self) {
        self.0 = None;
    }
}

#[test]
fn handshake_then_commands() {
    let (host, target) = wire();

    // Arbiter first, then the command loop on the same line
    let handle = thread::spawn(move || {
        let mut link = Uart::new(target);
        let mut arbiter = HandshakeArbiter::new(WallTimer(None), 2_000);
        assert_eq!(arbiter.decide(&mut link), Ok(Entry::Bootloader));

        let mut d = dispatcher(link);
        while d.step().is_ok() {}
        d
    });

    let mut u = Updater::<Wire, Sleep, Closed>::new(host, Sleep, options());
    u.wait_for_bootloader(None).unwrap();

    // Acks of any extra NOPs were drained, replies line up with requests
    assert_eq!(u.bootloader_version().unwrap(), BOOTLOADER_VERSION);
    assert_eq!(u.mcu_ids().unwrap(), [0x1E, 0x97, 0x46, 0x09]);

    finish(u, handle);
}

#[test]
fn nobody_calls_the_application_starts() {
    let (_host, target) = wire();
    let mut arbiter = HandshakeArbiter::new(WallTimer(None), 20);

    let mut link = Uart::new(target);
    assert_eq!(arbiter.decide(&mut link), Ok(Entry::Application));
    assert!(arbiter.free().0.is_none());
}
