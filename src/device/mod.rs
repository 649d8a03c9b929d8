//! Bootloader side of the protocol.
//!
//! The bootloader is written against `embedded-hal` traits and a handful
//! of seams for the parts of the XMEGA that have no HAL abstraction (the
//! NVM controller and the system control block), so the same command loop
//! runs on the part and against [`sim`] on a host.
//!
//! ```text
//! reset ──> arbiter ──> Entry::Application ──> system::start_application
//!              │
//!              └──────> Entry::Bootloader ──> Dispatcher::run (never returns)
//! ```

pub mod arbiter;
pub mod dispatcher;
pub mod link;
pub mod nvm;
pub mod sim;
pub mod system;

pub use arbiter::{BootTimer, Entry, HandshakeArbiter, PinArbiter};
pub use dispatcher::Dispatcher;
pub use link::{Link, Rs485, Uart};
pub use nvm::{Nvm, NvmController, NvmError};
pub use system::SystemControl;

/// Bootloader build-time settings
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct DeviceConfig {
    /// Polls of the NVM busy flag before an operation is given up
    pub nvm_spin_limit: u32,

    /// Delay between acknowledging a reset and performing it, lets the
    /// acknowledgement leave the UART
    pub reset_delay_ms: u16,

    /// Polls of the link for the next byte of an index or payload before
    /// the command is abandoned with FAIL. Without it a host that stops
    /// mid-page would have its next opcodes taken as payload.
    pub byte_spin_limit: u32,

    /// Length of the handshake window of [`HandshakeArbiter`]
    pub handshake_window_ms: u32,

    /// Line settling time around RS-485 direction changes
    pub settle_us: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            nvm_spin_limit: 1_000_000,
            reset_delay_ms: 10,
            byte_spin_limit: 2_000_000,
            handshake_window_ms: 2_000,
            settle_us: 50,
        }
    }
}
