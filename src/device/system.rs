//! System control: configuration change protected registers, software
//! reset and the hand-over to the application.

use crate::protocol::MCU_ID_LEN;

/// `RST.CTRL` software reset bit
pub const SOFTWARE_RESET: u8 = 0x01;

/// Registers behind the configuration change protection (CCP) unlock
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ProtectedRegister {
    /// `RST.CTRL`
    ResetControl,
    /// `PMIC.CTRL`, interrupt levels and vector table selection
    InterruptControl,
}

pub trait SystemControl {
    /// DEVID0..2 followed by REVID
    fn device_id(&mut self) -> [u8; MCU_ID_LEN];

    /// Masks interrupts, returning whether they were enabled
    fn mask_interrupts(&mut self) -> bool;

    fn restore_interrupts(&mut self, enabled: bool);

    /// Writes the CCP unlock key then `value` to `register`. The store must
    /// land within four cycles of the key.
    ///
    /// # Safety
    /// Interrupts must be masked for the duration of the call, an interrupt
    /// inside the unlock window makes the write miss.
    unsafe fn unlock_and_write(&mut self, register: ProtectedRegister, value: u8);

    /// Resets `EIND` and `RAMPZ` so indirect jumps and flash reads address
    /// the application section
    fn clear_extended_addressing(&mut self);

    /// Transfers control to `address`
    ///
    /// # Safety
    /// Whatever sits at `address` is executed, there is no check that an
    /// application is present.
    unsafe fn jump(&mut self, address: u32) -> !;
}

/// Writes a protected register as one indivisible operation
pub fn protected_write<S: SystemControl>(system: &mut S, register: ProtectedRegister, value: u8) {
    let enabled = system.mask_interrupts();
    unsafe { system.unlock_and_write(register, value) };
    system.restore_interrupts(enabled);
}

/// Resets the part through `RST.CTRL`. Returns only on a simulated part.
pub fn software_reset<S: SystemControl>(system: &mut S) {
    info!("Software reset");
    protected_write(system, ProtectedRegister::ResetControl, SOFTWARE_RESET);
}

/// Leaves the bootloader for the application at `entry`.
///
/// Interrupts stay masked, the vector table is moved back to the
/// application section and the extended addressing registers are cleared
/// before the jump. The application image is not checked.
pub fn start_application<S: SystemControl>(system: &mut S, entry: u32) -> ! {
    info!("Starting application at {:#x}", entry);

    let _ = system.mask_interrupts();
    unsafe { system.unlock_and_write(ProtectedRegister::InterruptControl, 0) };
    system.clear_extended_addressing();

    unsafe { system.jump(entry) }
}
