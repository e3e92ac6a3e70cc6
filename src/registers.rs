//! Register layout of the two known firmware generations.
//!
//! The G3 (bq27000/bq27200) and L1 (bq27500/bq27520) firmwares place the
//! same logical quantities at different addresses, and the L1 firmware
//! drops several registers entirely. Everything here is plain data; the
//! active table is picked once at probe time and never changes afterwards.

use crate::fmt::bitflags;

/// Control() register, common to both firmwares.
pub const CONTROL: u8 = 0x00;

/// Control() subcommands. Issuing one requires a 2-byte write followed by
/// a 2-byte read of the same register after the chip had time to settle.
pub mod control_subcommands {
    pub const STATUS: u16 = 0x0000;
    pub const DEV_TYPE: u16 = 0x0001;
    pub const FW_VER: u16 = 0x0002;
    pub const DF_VER: u16 = 0x001F;
    pub const RESET: u16 = 0x0041;

    /// Two-word magic key that unseals data-flash access.
    pub const UNSEAL_KEY0: u16 = 0x0414;
    pub const UNSEAL_KEY1: u16 = 0x3672;
}

/// Registers driving the data-flash window used by the diagnostic dump.
pub mod data_flash {
    pub const DATA_CLASS: u8 = 0x3E;
    pub const DATA_BLOCK: u8 = 0x3F;
    pub const BLOCK_DATA: u8 = 0x40;
    pub const BLOCK_DATA_CONTROL: u8 = 0x61;
}

/// Abstract register names, used to index the per-firmware tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Field {
    Temperature = 0,
    InternalTemperature,
    Voltage,
    AverageCurrent,
    Flags,
    TimeToEmpty,
    TimeToFull,
    TimeToEmptyAvg,
    TimeToEmptyConstPower,
    NominalAvailableCapacity,
    LastMeasuredDischarge,
    CycleCount,
    AvailableEnergy,
    RelativeStateOfCharge,
    InitialLastMeasuredDischarge,
    StateOfCharge,
    DesignCapacity,
    /// Accessed through [`CONTROL`] directly; listed for completeness.
    #[allow(dead_code)]
    Control,
}

const NUM_FIELDS: usize = 18;

/// Field-indexed register addresses of one firmware generation. `None`
/// marks a register the firmware does not implement.
pub(crate) struct RegisterMap([Option<u8>; NUM_FIELDS]);

impl RegisterMap {
    pub(crate) fn get(&self, field: Field) -> Option<u8> {
        self.0[field as usize]
    }
}

/// TI G3 firmware (v3.24). Every field is present.
pub(crate) static G3_REGS: RegisterMap = RegisterMap([
    Some(0x06), // Temperature
    Some(0x36), // InternalTemperature
    Some(0x08), // Voltage
    Some(0x14), // AverageCurrent
    Some(0x0A), // Flags
    Some(0x16), // TimeToEmpty
    Some(0x18), // TimeToFull
    Some(0x1C), // TimeToEmptyAvg
    Some(0x26), // TimeToEmptyConstPower
    Some(0x0C), // NominalAvailableCapacity
    Some(0x12), // LastMeasuredDischarge
    Some(0x2A), // CycleCount
    Some(0x22), // AvailableEnergy
    Some(0x0B), // RelativeStateOfCharge
    Some(0x76), // InitialLastMeasuredDischarge
    Some(0x2C), // StateOfCharge
    Some(0x3C), // DesignCapacity
    Some(0x00), // Control
]);

/// TI L1 firmware (v6.00). Several registers went missing in this one.
pub(crate) static L1_REGS: RegisterMap = RegisterMap([
    Some(0x06), // Temperature
    Some(0x28), // InternalTemperature
    Some(0x08), // Voltage
    Some(0x14), // AverageCurrent
    Some(0x0A), // Flags
    Some(0x16), // TimeToEmpty
    None,       // TimeToFull
    Some(0x1A), // TimeToEmptyAvg
    None,       // TimeToEmptyConstPower
    Some(0x0C), // NominalAvailableCapacity
    None,       // LastMeasuredDischarge
    Some(0x1E), // CycleCount
    None,       // AvailableEnergy
    None,       // RelativeStateOfCharge
    None,       // InitialLastMeasuredDischarge
    Some(0x20), // StateOfCharge
    Some(0x2E), // DesignCapacity
    Some(0x00), // Control
]);

bitflags! {
    /// Flags() bits of the G3 (bq27000/bq27200) firmware
    pub struct Bq27000Flags: u16 {
        const CHGS = 1 << 7;
        const FC = 1 << 5;
    }
}

bitflags! {
    /// Flags() bits of the L1 (bq27500/bq27520) firmware
    pub struct Bq27500Flags: u16 {
        const FC = 1 << 9;
        const DSC = 1 << 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l1_firmware_marks_dropped_registers_absent() {
        let absent = [
            Field::TimeToFull,
            Field::TimeToEmptyConstPower,
            Field::LastMeasuredDischarge,
            Field::AvailableEnergy,
            Field::RelativeStateOfCharge,
            Field::InitialLastMeasuredDischarge,
        ];

        for field in absent {
            assert_eq!(L1_REGS.get(field), None, "{:?}", field);
            assert!(G3_REGS.get(field).is_some(), "{:?}", field);
        }
    }

    #[test]
    fn control_is_register_zero_in_both_layouts() {
        assert_eq!(G3_REGS.get(Field::Control), Some(CONTROL));
        assert_eq!(L1_REGS.get(Field::Control), Some(CONTROL));
    }
}
