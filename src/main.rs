#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::convert::TryFrom;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};

use sboot::geometry::MemorySizes;
use sboot::image::Image;
use sboot::protocol::BAUD_RATE;
use sboot::{Options, Updater};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "19200")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Replace the application with a raw binary image
    Update {
        /// Firmware image (raw binary)
        file: PathBuf,

        /// Read every page back after writing
        #[structopt(long)]
        verify: bool,
    },
    /// Compare the application section against a raw binary image
    Verify {
        file: PathBuf,
    },
    /// Show bootloader, device and memory information
    Info,
    /// Dump the EEPROM to a file
    ReadEeprom {
        file: PathBuf,
    },
    /// Reset the device out of the bootloader
    Reset,
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if o.baud != BAUD_RATE {
        warn!("Bootloader runs at {} baud, using {}", BAUD_RATE, o.baud);
    }

    if let Err(e) = run(o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(o: Args) -> anyhow::Result<()> {
    info!("Connecting to serial port");

    let mut u = Updater::linux(&o.port, o.baud, o.options)
        .with_context(|| format!("opening {}", o.port))?;

    info!("Waiting for bootloader");

    // Only the rendezvous timeout or stopping the process ends the search
    u.wait_for_bootloader(None).context("looking for bootloader")?;

    info!("Bootloader found");

    let sizes = u.memory_sizes().context("reading memory sizes")?;

    match o.operation {
        Operation::Update { file, verify } => {
            let image = load(&file, &sizes)?;
            u.check_image(&image, &sizes)?;

            info!(
                "Image {} ({}), {} pages of {}",
                file.display(),
                bytefmt::format(image.len() as u64),
                image.page_count(),
                bytefmt::format(image.page_size() as u64)
            );

            let bar = progress_bar(image.page_count());
            u.program(&image, |page, _| bar.set_position(page as u64))
                .context("writing")?;
            bar.finish();

            // Verification needs the bootloader, so it runs before the final reset
            if verify {
                u.verify(&image).context("verifying")?;
                u.verify_crc(&image, &sizes).context("checking CRC")?;
            }

            u.reset_device().context("resetting")?;

            info!("Update complete");
        }
        Operation::Verify { file } => {
            let image = load(&file, &sizes)?;
            u.check_image(&image, &sizes)?;

            u.verify(&image).context("verifying")?;
            u.verify_crc(&image, &sizes).context("checking CRC")?;

            info!("Verification OK");
        }
        Operation::Info => {
            let version = u.bootloader_version()?;
            let ids = u.mcu_ids()?;
            let serial = u.serial_number()?;
            let fuses = u.fuses()?;
            let (app_crc, boot_crc) = u.flash_crcs()?;

            info!("Bootloader version: {}", version);
            info!("MCU ID: {} rev {}", hex::encode(&ids[..3]), ids[3]);
            info!("Serial: {}", hex::encode(&serial));
            info!("Fuses: {}", hex::encode(&fuses));
            info!(
                "Application: {} in {} pages, CRC {:08x}",
                bytefmt::format(sizes.application as u64),
                sizes.application_pages(),
                app_crc
            );
            info!(
                "Boot: {} ({} pages), CRC {:08x}",
                bytefmt::format(sizes.boot as u64),
                sizes.boot / sizes.boot_page,
                boot_crc
            );
            info!(
                "EEPROM: {} in {} pages",
                bytefmt::format(sizes.eeprom as u64),
                sizes.eeprom_pages()
            );
        }
        Operation::ReadEeprom { file } => {
            let mut data = Vec::with_capacity(sizes.eeprom as usize);
            for page in 0..sizes.eeprom_pages() {
                let index = u16::try_from(page).context("EEPROM page index")?;
                data.extend(u.read_eeprom_page(index)?);
            }

            std::fs::write(&file, &data).with_context(|| format!("writing {}", file.display()))?;
            info!("Wrote {} to {}", bytefmt::format(data.len() as u64), file.display());
        }
        Operation::Reset => {
            u.reset_device()?;
            info!("Device reset");
        }
    }

    Ok(())
}

fn load(file: &Path, sizes: &MemorySizes) -> anyhow::Result<Image> {
    let image = Image::load(file, sizes.application_page as usize)
        .with_context(|| format!("reading {}", file.display()))?;

    if image.is_empty() {
        bail!("{} is empty", file.display());
    }

    Ok(image)
}

fn progress_bar(pages: usize) -> ProgressBar {
    let bar = ProgressBar::new(pages as u64);
    bar.set_style(ProgressStyle::default_bar().template("{bar:40} page {pos}/{len} ({percent}%)"));
    bar
}
