//! Diagnostic endpoints: firmware identification, chip reset and the
//! data-flash dump used when qualifying a new pack.
//!
//! The `show_*` methods render into any [`core::fmt::Write`] sink so the
//! host side can expose them however it likes. Bus failures are logged and
//! reported in-band (`-1`), never propagated; a flaky link should not take
//! the diagnostic surface down with it.

use core::fmt::{self, Write};

use embedded_hal_async::delay::DelayNs;

use crate::fmt::*;
use crate::registers::{control_subcommands, data_flash};
use crate::transport::Bus;
use crate::{Bq27x00, Platform};

/// Settle time after poking the data-flash window registers, in ms.
const SLAVE_LATENCY_MS: u32 = 100;

/// The data-flash window is this many bytes wide.
const WINDOW_SIZE: usize = 32;

/// Standard registers included in the dump, by their G3 addresses.
const DUMP_REGS: [(&str, u8); 12] = [
    ("Temperature", 0x06),
    ("Voltage", 0x08),
    ("Flags", 0x0a),
    ("NominalAvailableCapacity", 0x0c),
    ("FullAvailableCapacity", 0x0e),
    ("RemainingCapacity", 0x10),
    ("FullChargeCapacity", 0x12),
    ("AverageCurrent", 0x14),
    ("StateOfHealth", 0x28),
    ("CycleCount", 0x2a),
    ("StateOfCharge", 0x2c),
    ("OperationConfiguration", 0x3a),
];

/// Data-flash subclasses worth dumping and their lengths in bytes.
const SUBCLASSES: [(u8, usize); 30] = [
    (0x02, 10),
    (0x20, 6),
    (0x22, 10),
    (0x24, 15),
    (0x30, 26),
    (0x31, 25),
    (0x38, 10),
    (0x40, 14),
    (0x44, 17),
    (0x50, 79),
    (0x51, 14),
    (0x52, 28),
    (0x53, 46),
    (0x54, 46),
    (0x55, 66),
    (0x56, 66),
    (0x57, 20),
    (0x58, 20),
    (0x59, 20),
    (0x5a, 20),
    (0x5b, 20),
    (0x5c, 20),
    (0x5d, 20),
    (0x5e, 20),
    (0x68, 16),
    (0x69, 19),
    (0x6a, 45),
    (0x6b, 19),
    (0x6c, 20),
    (0x6d, 20),
];

impl<B, D, P, E> Bq27x00<B, D, P>
where
    B: Bus<Error = E>,
    D: DelayNs,
    P: Platform,
{
    /// Reads the firmware version straight from the chip, bypassing the
    /// value cached at probe time.
    pub async fn read_fw_version(&mut self) -> Result<u16, crate::Error<E>> {
        self.control_read(control_subcommands::FW_VER).await
    }

    /// Reads the data-flash version straight from the chip.
    pub async fn read_df_version(&mut self) -> Result<u16, crate::Error<E>> {
        self.control_read(control_subcommands::DF_VER).await
    }

    /// Reads the device-type word straight from the chip.
    pub async fn read_device_type(&mut self) -> Result<u16, crate::Error<E>> {
        self.control_read(control_subcommands::DEV_TYPE).await
    }

    /// Resets the gauge. All learned pack data is discarded.
    pub async fn reset(&mut self) -> Result<(), crate::Error<E>> {
        info!("resetting the gauge");
        self.control_read(control_subcommands::RESET).await?;
        Ok(())
    }

    pub async fn show_fw_version<W: Write>(&mut self, out: &mut W) -> fmt::Result {
        match self.read_fw_version().await {
            Ok(version) => writeln!(out, "{}", version),
            Err(_) => {
                warn!("error reading the firmware version");
                writeln!(out, "-1")
            }
        }
    }

    pub async fn show_df_version<W: Write>(&mut self, out: &mut W) -> fmt::Result {
        match self.read_df_version().await {
            Ok(version) => writeln!(out, "{}", version),
            Err(_) => {
                warn!("error reading the data-flash version");
                writeln!(out, "-1")
            }
        }
    }

    pub async fn show_device_type<W: Write>(&mut self, out: &mut W) -> fmt::Result {
        match self.read_device_type().await {
            Ok(device) => writeln!(out, "{}", device),
            Err(_) => {
                warn!("error reading the device type");
                writeln!(out, "-1")
            }
        }
    }

    /// Reset endpoint. Always answers `okay`; a failed reset is only
    /// logged, matching the other diagnostic endpoints.
    pub async fn show_reset<W: Write>(&mut self, out: &mut W) -> fmt::Result {
        if self.reset().await.is_err() {
            warn!("error resetting the gauge");
        }

        writeln!(out, "okay")
    }

    /// Dump endpoint wrapping [`Self::dump_data_flash`].
    pub async fn show_dump_data_flash<W: Write>(&mut self, out: &mut W) -> fmt::Result {
        warn!("dumping the gauge data flash");
        self.dump_data_flash(out).await?;
        writeln!(out, "okay")
    }

    /// Dumps the control status, the standard registers and every known
    /// data-flash subclass. The chip must be unsealed for the subclass
    /// part; a bus failure along the way ends the dump early.
    pub async fn dump_data_flash<W: Write>(&mut self, out: &mut W) -> fmt::Result {
        let status = match self.control_read(control_subcommands::STATUS).await {
            Ok(status) => status,
            Err(_) => {
                warn!("error reading the control status");
                return Ok(());
            }
        };
        writeln!(out, "Control=0x{:04x}", status)?;

        for (name, reg) in DUMP_REGS {
            match self.bus.read_word(reg).await {
                Ok(value) => writeln!(out, "{}=0x{:04x}", name, value)?,
                Err(_) => {
                    warn!("error reading a dump register");
                    return Ok(());
                }
            }
        }

        if self.unseal().await.is_err() {
            warn!("error unsealing the gauge, skipping the data-flash dump");
            return Ok(());
        }

        for (subclass, len) in SUBCLASSES {
            self.dump_subclass(out, subclass, len).await?;
        }

        // TODO: reseal the chip once the dump is done instead of leaving
        // data flash writable until the next reset.

        Ok(())
    }

    /// Sends the two-word unseal key through Control().
    async fn unseal(&mut self) -> Result<(), crate::Error<E>> {
        self.bus
            .write_word(crate::registers::CONTROL, control_subcommands::UNSEAL_KEY0)
            .await?;
        self.delay.delay_ms(SLAVE_LATENCY_MS).await;

        self.bus
            .write_word(crate::registers::CONTROL, control_subcommands::UNSEAL_KEY1)
            .await?;
        self.delay.delay_ms(SLAVE_LATENCY_MS).await;

        Ok(())
    }

    async fn dump_subclass<W: Write>(
        &mut self,
        out: &mut W,
        subclass: u8,
        len: usize,
    ) -> fmt::Result {
        if self
            .bus
            .write_byte(data_flash::BLOCK_DATA_CONTROL, 0)
            .await
            .is_err()
        {
            warn!("error enabling data-flash access");
            return Ok(());
        }
        self.delay.delay_ms(SLAVE_LATENCY_MS).await;

        if self
            .bus
            .write_byte(data_flash::DATA_CLASS, subclass)
            .await
            .is_err()
        {
            warn!("error selecting data-flash subclass 0x{:02x}", subclass);
            return Ok(());
        }
        self.delay.delay_ms(SLAVE_LATENCY_MS).await;

        let mut remaining = len;
        let mut block = 0u8;

        while remaining > 0 {
            let count = remaining.min(WINDOW_SIZE);
            let mut window = [0u8; WINDOW_SIZE];

            if self
                .bus
                .write_byte(data_flash::DATA_BLOCK, block)
                .await
                .is_err()
            {
                warn!("error selecting a data-flash block");
                return Ok(());
            }
            self.delay.delay_ms(SLAVE_LATENCY_MS).await;

            if self
                .bus
                .read_block(data_flash::BLOCK_DATA, &mut window[..count])
                .await
                .is_err()
            {
                warn!("error reading the data-flash window");
                return Ok(());
            }

            write!(
                out,
                "subclass=0x{:02x} len={:02} blk={} count={:02}:",
                subclass, len, block, count
            )?;
            for byte in &window[..count] {
                write!(out, " 0x{:02x}", byte)?;
            }
            writeln!(out)?;

            remaining -= count;
            block += 1;
        }

        Ok(())
    }
}
