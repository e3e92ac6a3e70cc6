//! Conversion of raw register words into SI units.
//!
//! The two firmware generations disagree on sign convention and scaling:
//! the G3 chips report charge and energy in units derived from the external
//! sense resistor and temperature ratiometrically, the L1 chips report µAh,
//! mA and Kelvin directly.

use crate::registers::Bq27000Flags;
use crate::Chip;

/// Sense resistor the bq27000/bq27200 unit formulas are based on, in mOhm.
pub const SENSE_RESISTOR: i32 = 20;

/// Raw value of a time register when the chip has no estimate yet.
const NO_TIME_DATA: u16 = 65535;

/// Temperature in tenths of a degree Celsius.
pub(crate) fn temperature_dc(chip: Chip, raw: u16) -> i32 {
    match chip {
        Chip::Bq27500 => i32::from(raw) - 2731,
        Chip::Bq27000 => (i32::from(raw) * 5 - 5463) / 2,
    }
}

/// Voltage in µV.
pub(crate) fn voltage_uv(raw: u16) -> i32 {
    i32::from(raw) * 1000
}

/// Charge in µAh.
pub(crate) fn charge_uah(chip: Chip, raw: u16) -> i32 {
    match chip {
        Chip::Bq27500 => i32::from(raw) * 1000,
        Chip::Bq27000 => i32::from(raw) * 3570 / SENSE_RESISTOR,
    }
}

/// Design capacity in µAh. The G3 chips store this as a single data-flash
/// byte scaled by 256.
pub(crate) fn design_capacity_uah(chip: Chip, raw: u16) -> i32 {
    match chip {
        Chip::Bq27500 => i32::from(raw) * 1000,
        Chip::Bq27000 => i32::from(raw) * 256 * 3570 / SENSE_RESISTOR,
    }
}

/// Available energy in µWh.
pub(crate) fn energy_uwh(chip: Chip, raw: u16) -> i32 {
    match chip {
        Chip::Bq27500 => i32::from(raw) * 1000,
        Chip::Bq27000 => i32::from(raw) * 29200 / SENSE_RESISTOR,
    }
}

/// Current in µA, negative while charging. The G3 chips report magnitude
/// only; the sign comes from the CHGS flag. The L1 chips report a signed
/// value in mA.
pub(crate) fn current_ua(chip: Chip, raw: u16, flags: u16) -> i32 {
    match chip {
        Chip::Bq27500 => i32::from(raw as i16) * 1000,
        Chip::Bq27000 => {
            let mut current = i32::from(raw);

            if Bq27000Flags::from_bits_truncate(flags).contains(Bq27000Flags::CHGS) {
                current = -current;
            }

            current * 3570 / SENSE_RESISTOR
        }
    }
}

/// Time in seconds, `None` when the chip reports its "no data" sentinel.
pub(crate) fn time_secs(raw: u16) -> Option<u32> {
    if raw == NO_TIME_DATA {
        None
    } else {
        Some(u32::from(raw) * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Bq27000Flags;

    #[test]
    fn g3_current_magnitude_scales_with_the_sense_resistor() {
        assert_eq!(current_ua(Chip::Bq27000, 0, 0), 0);
        assert_eq!(current_ua(Chip::Bq27000, 100, 0), 100 * 3570 / 20);
        assert_eq!(current_ua(Chip::Bq27000, 65535, 0), 65535 * 3570 / 20);
    }

    #[test]
    fn g3_current_sign_comes_from_the_chgs_flag() {
        let charging = Bq27000Flags::CHGS.bits();

        assert_eq!(current_ua(Chip::Bq27000, 100, charging), -17850);
        assert_eq!(current_ua(Chip::Bq27000, 100, 0), 17850);
    }

    #[test]
    fn l1_current_is_sign_extended() {
        assert_eq!(current_ua(Chip::Bq27500, 0xFFEC, 0), -20_000);
        assert_eq!(current_ua(Chip::Bq27500, 0x7FFF, 0), 32_767_000);
        assert_eq!(current_ua(Chip::Bq27500, 0x8000, 0), -32_768_000);
    }

    #[test]
    fn temperature_is_converted_to_tenths_of_celsius() {
        assert_eq!(temperature_dc(Chip::Bq27500, 3001), 270);
        assert_eq!(temperature_dc(Chip::Bq27500, 2731), 0);
        // G3 counts in quarter Kelvin
        assert_eq!(temperature_dc(Chip::Bq27000, 1192), 248);
    }

    #[test]
    fn charge_and_energy_scaling_differ_per_generation() {
        assert_eq!(charge_uah(Chip::Bq27500, 1200), 1_200_000);
        assert_eq!(charge_uah(Chip::Bq27000, 1200), 1200 * 3570 / 20);

        assert_eq!(energy_uwh(Chip::Bq27500, 500), 500_000);
        assert_eq!(energy_uwh(Chip::Bq27000, 500), 500 * 29200 / 20);

        assert_eq!(design_capacity_uah(Chip::Bq27500, 1340), 1_340_000);
        assert_eq!(design_capacity_uah(Chip::Bq27000, 5), 5 * 256 * 3570 / 20);
    }

    #[test]
    fn time_sentinel_means_no_data() {
        assert_eq!(time_secs(100), Some(6000));
        assert_eq!(time_secs(0), Some(0));
        assert_eq!(time_secs(65535), None);
    }
}
