#![cfg_attr(not(test), no_std)]

//! A driver for the Texas Instruments bq27000/bq27200/bq27500/bq27520
//! single-cell battery gauges.
//!
//! The chip keeps a rolling estimate of remaining charge, cycle count,
//! voltage, current, temperature and time-to-empty/full in a small register
//! file, reachable over i2c or the single-wire HDQ link. Two mutually
//! incompatible firmware generations exist; the driver identifies the one
//! present at probe time and installs the matching register map.
//!
//! The register file is polled in the background (see [`poller`]) into a
//! cached snapshot; [`Bq27x00::property`] answers host-side battery
//! property requests from that cache, refreshing it first when it has gone
//! stale.

pub(crate) mod fmt;

mod decode;
mod diag;
mod registers;
pub mod poller;
pub mod transport;

use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;

use fmt::*;
use registers::{control_subcommands, Field, RegisterMap, CONTROL, G3_REGS, L1_REGS};

pub use decode::SENSE_RESISTOR;
pub use registers::{Bq27000Flags, Bq27500Flags};
pub use transport::{Bus, HdqBus, HdqRead, I2cBus, I2C_ADDR};

/// Firmware version that selects the L1 (bq27500/bq27520) register layout.
const L1_FW_VERSION: u16 = 0x0600;

/// Firmware version that selects the G3 (bq27000/bq27200) register layout.
const G3_FW_VERSION: u16 = 0x0324;

/// Snapshots older than this are refreshed before answering a property read.
const CACHE_MAX_AGE: Duration = Duration::from_secs(5);

/// Settle time between issuing a Control() subcommand and reading the reply.
const CONTROL_SETTLE_MS: u32 = 10;

/// Thermistor readings below -35.0 °C mean the sensor is missing or broken.
const THERMISTOR_FAULT_DC: i32 = -350;

/// Subtracted when substituting the internal sensor: the board runs warmer
/// than the battery. Tenths of a degree.
const INTERNAL_TEMP_OFFSET_DC: i32 = 20;

/// Capacity reported while the fake-battery latch is set, high enough that
/// user space never decides to shut down over it.
const FAKE_BATTERY_CAPACITY: i32 = 96;

/// Driver error type
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// The underlying transfer failed.
    Bus(E),
    /// A 16-bit HDQ read did not stabilize within the retry budget.
    TornRead,
    /// The flags register could not be read; the battery is treated as
    /// absent until a poll succeeds again.
    NoDevice,
    /// The chip reported its "no data" sentinel for this value.
    NoData,
    /// The transport does not implement this transfer.
    Unsupported,
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Bus(e)
    }
}

/// The two firmware generations and their register-level dialects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Chip {
    /// bq27000 and bq27200: unsigned current, ratiometric temperature,
    /// charge units derived from the sense resistor.
    Bq27000,
    /// bq27500 and bq27520: signed current in mA, Kelvin temperature,
    /// µAh directly.
    Bq27500,
}

/// Charging state reported through [`Property::Status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    Charging,
    Discharging,
    NotCharging,
    Full,
}

/// Battery chemistry reported through [`Property::Technology`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Technology {
    LithiumIon,
}

/// Battery properties the driver can answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Property {
    Status,
    Present,
    VoltageNow,
    CurrentNow,
    Capacity,
    Temp,
    TimeToEmptyNow,
    TimeToEmptyAvg,
    TimeToFullNow,
    Technology,
    ChargeNow,
    ChargeFull,
    ChargeFullDesign,
    CycleCount,
    EnergyNow,
}

/// A resolved property value. Numeric values use the units of the chip
/// formulas: µV, µA, µAh, µWh, tenths of a degree Celsius, seconds, percent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Value {
    Status(Status),
    Bool(bool),
    Int(i32),
    Technology(Technology),
}

/// Host-side collaborators of the driver: the supply aggregator and the
/// board-specific thermistor fix-up.
pub trait Platform {
    /// Whether any external supply is online. Consulted for the G3 status
    /// derivation when the chip reports neither charging nor full.
    fn external_power_present(&mut self) -> bool;

    /// Called after a poll whenever the snapshot visibly changed.
    fn battery_changed(&mut self);

    /// Board-specific thermistor curve fix-up, tenths of a degree Celsius.
    fn translate_temperature(&mut self, temperature: i32) -> i32 {
        temperature
    }
}

/// The most recently decoded register values.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub(crate) struct Snapshot {
    /// Raw flag word; `None` when the last read failed, which the property
    /// layer reports as an absent battery.
    flags: Option<u16>,
    /// Relative state of charge in percent.
    capacity: u16,
    /// Raw thermistor reading; decoded lazily so the board fix-up and the
    /// fake-battery fallback see every property read.
    temperature: Option<u16>,
    /// Raw internal sensor reading.
    internal_temp: Option<u16>,
    /// Seconds; `None` when the chip has no estimate.
    time_to_empty: Option<u32>,
    time_to_empty_avg: Option<u32>,
    time_to_full: Option<u32>,
    /// Last measured discharge in µAh.
    charge_full: i32,
    cycle_count: u16,
    /// Raw average current, G3 only.
    current_now: u16,
}

impl Snapshot {
    /// Inequality check feeding change notification. The instantaneous
    /// current is excluded: it jitters between any two consecutive polls.
    fn differs_from(&self, other: &Snapshot) -> bool {
        let significant = |s: &Snapshot| {
            (
                s.flags,
                s.capacity,
                s.temperature,
                s.internal_temp,
                s.time_to_empty,
                s.time_to_empty_avg,
                s.time_to_full,
                s.charge_full,
                s.cycle_count,
            )
        };

        significant(self) != significant(other)
    }
}

/// Gauge handle. Owns the transport, the cached snapshot and the register
/// map; shared between the poll loop and property readers behind an async
/// mutex (see [`poller`]).
pub struct Bq27x00<B, D, P> {
    pub(crate) bus: B,
    pub(crate) delay: D,
    pub(crate) platform: P,
    pub(crate) chip: Chip,
    regs: &'static RegisterMap,
    pub(crate) cache: Snapshot,
    last_update: Option<Instant>,
    charge_design_full: Option<i32>,
    device_type: u16,
    fw_ver: u16,
    df_ver: u16,
    pub(crate) fake_battery: bool,
    pub(crate) thermistor_warned: bool,
}

impl<B, D, P, E> Bq27x00<B, D, P>
where
    B: Bus<Error = E>,
    D: DelayNs,
    P: Platform,
{
    /// Identifies the firmware on the chip, installs the matching register
    /// map and runs the first refresh. The map is frozen afterwards.
    pub async fn probe(bus: B, delay: D, platform: P) -> Result<Self, Error<E>> {
        let mut di = Self::bare(Chip::Bq27000, bus, delay, platform);

        di.device_type = di.control_read(control_subcommands::DEV_TYPE).await?;
        di.fw_ver = di.control_read(control_subcommands::FW_VER).await?;
        di.df_ver = di.control_read(control_subcommands::DF_VER).await?;

        info!(
            "gauge device type 0x{:04x}, fw 0x{:04x}, df 0x{:04x}",
            di.device_type, di.fw_ver, di.df_ver
        );

        (di.chip, di.regs) = match di.fw_ver {
            L1_FW_VERSION => (Chip::Bq27500, &L1_REGS),
            G3_FW_VERSION => (Chip::Bq27000, &G3_REGS),
            _ => {
                warn!(
                    "unknown gauge firmware 0x{:04x}, assuming the G3 layout",
                    di.fw_ver
                );
                (Chip::Bq27000, &G3_REGS)
            }
        };

        di.init().await;

        Ok(di)
    }

    /// Builds the device state for a chip whose identity the board already
    /// knows, e.g. an HDQ-attached bq27000 that cannot answer Control()
    /// queries.
    pub async fn attach(chip: Chip, bus: B, delay: D, platform: P) -> Self {
        let mut di = Self::bare(chip, bus, delay, platform);
        di.init().await;
        di
    }

    fn bare(chip: Chip, bus: B, delay: D, platform: P) -> Self {
        Self {
            bus,
            delay,
            platform,
            chip,
            regs: Self::map_for(chip),
            cache: Snapshot::default(),
            last_update: None,
            charge_design_full: None,
            device_type: 0,
            fw_ver: 0,
            df_ver: 0,
            fake_battery: false,
            thermistor_warned: false,
        }
    }

    fn map_for(chip: Chip) -> &'static RegisterMap {
        match chip {
            Chip::Bq27000 => &G3_REGS,
            Chip::Bq27500 => &L1_REGS,
        }
    }

    async fn init(&mut self) {
        // Prime the temperature readings so an early property enumeration
        // cannot observe an uninitialized snapshot.
        self.cache.temperature = self.read_indexed(Field::Temperature, false).await.ok();
        self.cache.internal_temp = self
            .read_indexed(Field::InternalTemperature, false)
            .await
            .ok();

        self.refresh().await;
    }

    /// Two-phase Control() round-trip: write the subcommand, give the chip
    /// time to settle, read the 16-bit reply back from the same register.
    pub(crate) async fn control_read(&mut self, subcommand: u16) -> Result<u16, Error<E>> {
        self.bus.write_word(CONTROL, subcommand).await?;
        self.delay.delay_ms(CONTROL_SETTLE_MS).await;
        self.bus.read_word(CONTROL).await
    }

    /// Reads an abstract field through the active register map. Fields the
    /// firmware does not implement read as zero without touching the bus.
    async fn read_indexed(&mut self, field: Field, single: bool) -> Result<u16, Error<E>> {
        let Some(reg) = self.regs.get(field) else {
            return Ok(0);
        };

        if single {
            Ok(u16::from(self.bus.read_byte(reg).await?))
        } else {
            self.bus.read_word(reg).await
        }
    }

    async fn read_rsoc(&mut self) -> Result<u16, Error<E>> {
        match self.chip {
            Chip::Bq27500 => self.read_indexed(Field::StateOfCharge, false).await,
            Chip::Bq27000 => self.read_indexed(Field::RelativeStateOfCharge, true).await,
        }
    }

    async fn read_charge(&mut self, field: Field) -> Result<i32, Error<E>> {
        let raw = self.read_indexed(field, false).await?;
        Ok(decode::charge_uah(self.chip, raw))
    }

    async fn read_design_capacity(&mut self) -> Result<i32, Error<E>> {
        let raw = match self.chip {
            Chip::Bq27500 => self.read_indexed(Field::DesignCapacity, false).await?,
            Chip::Bq27000 => {
                self.read_indexed(Field::InitialLastMeasuredDischarge, true)
                    .await?
            }
        };

        Ok(decode::design_capacity_uah(self.chip, raw))
    }

    async fn read_time(&mut self, field: Field) -> Option<u32> {
        match self.read_indexed(field, false).await {
            Ok(raw) => decode::time_secs(raw),
            Err(_) => {
                warn!("error reading a time register");
                None
            }
        }
    }

    /// Rebuilds the snapshot from the register file and notifies the
    /// platform when anything other than the instantaneous current changed.
    ///
    /// A failed flags read leaves the rest of the snapshot untouched; the
    /// battery then reads as absent until the next successful poll.
    pub async fn refresh(&mut self) {
        let mut cache = Snapshot::default();

        match self.read_indexed(Field::Flags, false).await {
            Ok(flags) => {
                cache.flags = Some(flags);
                cache.capacity = match self.read_rsoc().await {
                    Ok(rsoc) => rsoc,
                    Err(_) => {
                        warn!("error reading relative state of charge");
                        0
                    }
                };
                cache.temperature = self.read_indexed(Field::Temperature, false).await.ok();
                cache.internal_temp = self
                    .read_indexed(Field::InternalTemperature, false)
                    .await
                    .ok();
                cache.time_to_empty = self.read_time(Field::TimeToEmpty).await;
                cache.time_to_empty_avg = self.read_time(Field::TimeToEmptyAvg).await;
                cache.time_to_full = self.read_time(Field::TimeToFull).await;
                cache.charge_full = match self.read_charge(Field::LastMeasuredDischarge).await {
                    Ok(charge) => charge,
                    Err(_) => {
                        warn!("error reading last measured discharge");
                        0
                    }
                };
                cache.cycle_count = match self.read_indexed(Field::CycleCount, false).await {
                    Ok(count) => count,
                    Err(_) => {
                        warn!("error reading cycle count");
                        0
                    }
                };

                if self.chip == Chip::Bq27000 {
                    cache.current_now = self
                        .read_indexed(Field::AverageCurrent, false)
                        .await
                        .unwrap_or_default();
                }

                // The design capacity lives in data flash; one successful
                // read is valid for the lifetime of the pack.
                if self.charge_design_full.is_none() {
                    match self.read_design_capacity().await {
                        Ok(capacity) => self.charge_design_full = Some(capacity),
                        Err(_) => warn!("error reading initial last measured discharge"),
                    }
                }
            }
            Err(_) => warn!("error reading gauge flags"),
        }

        if cache.differs_from(&self.cache) {
            self.platform.battery_changed();
        }

        self.cache = cache;
        self.last_update = Some(Instant::now());
    }

    async fn update_if_stale(&mut self) {
        let stale = self
            .last_update
            .map_or(true, |at| at.elapsed() > CACHE_MAX_AGE);

        if stale {
            self.refresh().await;
        }
    }

    /// Answers a single property request, refreshing the snapshot first
    /// when it is stale.
    ///
    /// While the flags register is unreadable only [`Property::Present`]
    /// can be answered; everything else fails with [`Error::NoDevice`].
    pub async fn property(&mut self, property: Property) -> Result<Value, Error<E>> {
        self.update_if_stale().await;

        let present = self.cache.flags.is_some();
        if property != Property::Present && !present {
            return Err(Error::NoDevice);
        }
        let flags = self.cache.flags.unwrap_or(0);

        let value = match property {
            Property::Status => Value::Status(self.battery_status(flags)),
            Property::Present => Value::Bool(present),
            Property::VoltageNow => Value::Int(self.read_voltage().await?),
            Property::CurrentNow => Value::Int(self.battery_current(flags).await?),
            Property::Capacity => {
                if self.fake_battery {
                    Value::Int(FAKE_BATTERY_CAPACITY)
                } else {
                    Value::Int(i32::from(self.cache.capacity))
                }
            }
            Property::Temp => Value::Int(self.battery_temperature()?),
            Property::TimeToEmptyNow => {
                Value::Int(self.cache.time_to_empty.ok_or(Error::NoData)? as i32)
            }
            Property::TimeToEmptyAvg => {
                Value::Int(self.cache.time_to_empty_avg.ok_or(Error::NoData)? as i32)
            }
            Property::TimeToFullNow => {
                Value::Int(self.cache.time_to_full.ok_or(Error::NoData)? as i32)
            }
            Property::Technology => Value::Technology(Technology::LithiumIon),
            Property::ChargeNow => {
                Value::Int(self.read_charge(Field::NominalAvailableCapacity).await?)
            }
            Property::ChargeFull => Value::Int(self.cache.charge_full),
            Property::ChargeFullDesign => Value::Int(self.charge_design_full.unwrap_or(0)),
            Property::CycleCount => Value::Int(i32::from(self.cache.cycle_count)),
            Property::EnergyNow => Value::Int(self.read_energy().await?),
        };

        Ok(value)
    }

    fn battery_status(&mut self, flags: u16) -> Status {
        match self.chip {
            Chip::Bq27500 => {
                let flags = Bq27500Flags::from_bits_truncate(flags);

                if flags.contains(Bq27500Flags::FC) {
                    Status::Full
                } else if flags.contains(Bq27500Flags::DSC) {
                    Status::Discharging
                } else {
                    Status::Charging
                }
            }
            Chip::Bq27000 => {
                let flags = Bq27000Flags::from_bits_truncate(flags);

                if flags.contains(Bq27000Flags::FC) {
                    Status::Full
                } else if flags.contains(Bq27000Flags::CHGS) {
                    Status::Charging
                } else if self.platform.external_power_present() {
                    Status::NotCharging
                } else {
                    Status::Discharging
                }
            }
        }
    }

    /// Decodes the cached thermistor reading, applying the board fix-up
    /// and the fake-battery fallback when the thermistor is missing or
    /// broken.
    fn battery_temperature(&mut self) -> Result<i32, Error<E>> {
        let raw = self.cache.temperature.ok_or(Error::NoData)?;
        let mut temperature = decode::temperature_dc(self.chip, raw);

        temperature = self.platform.translate_temperature(temperature);

        if temperature < THERMISTOR_FAULT_DC {
            if !self.thermistor_warned {
                warn!("battery thermistor missing or malfunctioning, using the internal sensor");
                self.thermistor_warned = true;
            }

            let internal = self.cache.internal_temp.ok_or(Error::NoData)?;
            temperature = decode::temperature_dc(self.chip, internal) - INTERNAL_TEMP_OFFSET_DC;
            self.fake_battery = true;
        } else {
            // Any plausible reading clears the latch.
            self.fake_battery = false;
        }

        Ok(temperature)
    }

    async fn battery_current(&mut self, flags: u16) -> Result<i32, Error<E>> {
        let raw = match self.chip {
            Chip::Bq27500 => self.read_indexed(Field::AverageCurrent, false).await?,
            Chip::Bq27000 => self.cache.current_now,
        };

        Ok(decode::current_ua(self.chip, raw, flags))
    }

    async fn read_voltage(&mut self) -> Result<i32, Error<E>> {
        let raw = self.read_indexed(Field::Voltage, false).await?;
        Ok(decode::voltage_uv(raw))
    }

    async fn read_energy(&mut self) -> Result<i32, Error<E>> {
        let raw = self.read_indexed(Field::AvailableEnergy, false).await?;
        Ok(decode::energy_uwh(self.chip, raw))
    }

    /// The chip generation selected at probe time.
    pub fn chip(&self) -> Chip {
        self.chip
    }

    /// Firmware version word cached at probe time.
    pub fn fw_version(&self) -> u16 {
        self.fw_ver
    }

    /// Data-flash version word cached at probe time.
    pub fn df_version(&self) -> u16 {
        self.df_ver
    }

    /// Device-type word cached at probe time.
    pub fn device_type(&self) -> u16 {
        self.device_type
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use embassy_time::MockDriver;

    /// Serializes tests that advance or depend on the shared mock clock.
    static TIME_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[tokio::test]
    async fn probe_selects_the_map_from_the_firmware_version() {
        let gauge = probe(l1_bus()).await;
        assert_eq!(gauge.chip(), Chip::Bq27500);
        assert_eq!(gauge.fw_version(), 0x0600);
        assert_eq!(gauge.df_version(), 0x0101);
        assert_eq!(gauge.device_type(), 0x0500);

        let gauge = probe(g3_bus()).await;
        assert_eq!(gauge.chip(), Chip::Bq27000);
    }

    #[tokio::test]
    async fn unknown_firmware_falls_back_to_the_g3_layout() {
        let mut bus = g3_bus();
        bus.fw_ver = 0x9999;

        let gauge = probe(bus).await;
        assert_eq!(gauge.chip(), Chip::Bq27000);
        assert_eq!(gauge.fw_version(), 0x9999);
    }

    #[tokio::test]
    async fn l1_nominal_properties() {
        let mut gauge = probe(l1_bus()).await;

        assert_eq!(
            gauge.property(Property::Status).await,
            Ok(Value::Status(Status::Full))
        );
        assert_eq!(
            gauge.property(Property::Present).await,
            Ok(Value::Bool(true))
        );
        assert_eq!(gauge.property(Property::Temp).await, Ok(Value::Int(270)));
        assert_eq!(
            gauge.property(Property::VoltageNow).await,
            Ok(Value::Int(3_800_000))
        );
        assert_eq!(
            gauge.property(Property::CurrentNow).await,
            Ok(Value::Int(-20_000))
        );
        assert_eq!(gauge.property(Property::Capacity).await, Ok(Value::Int(75)));
        assert_eq!(
            gauge.property(Property::TimeToEmptyNow).await,
            Ok(Value::Int(6000))
        );
        assert_eq!(
            gauge.property(Property::TimeToEmptyAvg).await,
            Ok(Value::Int(7200))
        );
        assert_eq!(
            gauge.property(Property::Technology).await,
            Ok(Value::Technology(Technology::LithiumIon))
        );
        assert_eq!(
            gauge.property(Property::ChargeNow).await,
            Ok(Value::Int(800_000))
        );
        assert_eq!(
            gauge.property(Property::ChargeFullDesign).await,
            Ok(Value::Int(1_340_000))
        );
        assert_eq!(
            gauge.property(Property::CycleCount).await,
            Ok(Value::Int(12))
        );
        // AvailableEnergy is gone in the L1 firmware
        assert_eq!(gauge.property(Property::EnergyNow).await, Ok(Value::Int(0)));
    }

    #[tokio::test]
    async fn g3_charging_current_is_negated_by_the_chgs_flag() {
        let mut gauge = probe(g3_bus()).await;

        assert_eq!(
            gauge.property(Property::Status).await,
            Ok(Value::Status(Status::Charging))
        );
        assert_eq!(
            gauge.property(Property::CurrentNow).await,
            Ok(Value::Int(-17_850))
        );
    }

    #[tokio::test]
    async fn g3_idle_status_depends_on_external_power() {
        let mut bus = g3_bus();
        bus.mem[0x0A] = 0; // neither charging nor full

        let mut gauge = probe(bus).await;

        assert_eq!(
            gauge.property(Property::Status).await,
            Ok(Value::Status(Status::Discharging))
        );

        gauge.platform.powered = true;
        assert_eq!(
            gauge.property(Property::Status).await,
            Ok(Value::Status(Status::NotCharging))
        );
    }

    #[tokio::test]
    async fn absent_fields_read_as_zero_without_bus_traffic() {
        let mut gauge = probe(l1_bus()).await;

        let absent = [
            Field::TimeToFull,
            Field::TimeToEmptyConstPower,
            Field::LastMeasuredDischarge,
            Field::AvailableEnergy,
            Field::RelativeStateOfCharge,
            Field::InitialLastMeasuredDischarge,
        ];

        let transfers = gauge.bus.reads.len();
        for field in absent {
            assert_eq!(gauge.read_indexed(field, false).await, Ok(0));
        }
        assert_eq!(gauge.bus.reads.len(), transfers);
    }

    #[tokio::test]
    async fn time_to_full_is_zero_on_l1_without_bus_traffic() {
        let _guard = TIME_LOCK.lock().unwrap();
        let mut gauge = probe(l1_bus()).await;

        let transfers = gauge.bus.reads.len();
        assert_eq!(
            gauge.property(Property::TimeToFullNow).await,
            Ok(Value::Int(0))
        );
        assert_eq!(gauge.bus.reads.len(), transfers);
    }

    #[tokio::test]
    async fn time_sentinel_surfaces_as_no_data() {
        let mut bus = l1_bus();
        bus.set_word(0x16, 65535);

        let mut gauge = probe(bus).await;
        assert_eq!(
            gauge.property(Property::TimeToEmptyNow).await,
            Err(Error::NoData)
        );
    }

    #[tokio::test]
    async fn thermistor_fault_latches_the_fake_battery() {
        let mut gauge = probe(l1_bus()).await;

        // -53.1 C cannot be a real battery temperature
        gauge.bus.set_word(0x06, 2200);
        gauge.refresh().await;

        assert_eq!(gauge.property(Property::Temp).await, Ok(Value::Int(350)));
        assert!(gauge.fake_battery);
        assert!(gauge.thermistor_warned);
        assert_eq!(gauge.property(Property::Capacity).await, Ok(Value::Int(96)));

        // a plausible reading clears the latch again
        gauge.bus.set_word(0x06, 3001);
        gauge.refresh().await;

        assert_eq!(gauge.property(Property::Temp).await, Ok(Value::Int(270)));
        assert!(!gauge.fake_battery);
        assert_eq!(gauge.property(Property::Capacity).await, Ok(Value::Int(75)));

        // a relapse latches again but does not warn a second time
        gauge.bus.set_word(0x06, 2200);
        gauge.refresh().await;

        assert_eq!(gauge.property(Property::Temp).await, Ok(Value::Int(350)));
        assert_eq!(gauge.property(Property::Capacity).await, Ok(Value::Int(96)));
        assert!(gauge.thermistor_warned);
    }

    #[tokio::test]
    async fn board_fixup_is_applied_before_the_fault_check() {
        let mut gauge = probe(l1_bus()).await;

        // the fix-up pushes a plausible reading below the fault threshold
        gauge.platform.temp_offset = -900;
        assert_eq!(gauge.property(Property::Temp).await, Ok(Value::Int(350)));
        assert!(gauge.fake_battery);
    }

    #[tokio::test]
    async fn dead_bus_reads_as_absent_battery() {
        let mut bus = FakeBus::new();
        bus.broken = Some(-5);

        let mut gauge = attach(Chip::Bq27500, bus).await;

        assert_eq!(gauge.platform.changed, 0);
        assert_eq!(
            gauge.property(Property::Present).await,
            Ok(Value::Bool(false))
        );
        assert_eq!(gauge.property(Property::Status).await, Err(Error::NoDevice));
        assert_eq!(
            gauge.property(Property::Capacity).await,
            Err(Error::NoDevice)
        );
        assert_eq!(
            gauge.property(Property::VoltageNow).await,
            Err(Error::NoDevice)
        );
        assert_eq!(gauge.platform.changed, 0);
    }

    #[tokio::test]
    async fn change_notification_ignores_the_instantaneous_current() {
        let mut gauge = probe(g3_bus()).await;
        let baseline = gauge.platform.changed;

        gauge.bus.set_word(0x14, 500); // only the current moved
        gauge.refresh().await;
        assert_eq!(gauge.platform.changed, baseline);
        assert_eq!(gauge.cache.current_now, 500);

        gauge.bus.set_word(0x2A, 41); // the cycle count moved
        gauge.refresh().await;
        assert_eq!(gauge.platform.changed, baseline + 1);

        gauge.refresh().await; // nothing moved
        assert_eq!(gauge.platform.changed, baseline + 1);
    }

    #[tokio::test]
    async fn design_capacity_is_read_once() {
        let mut gauge = probe(l1_bus()).await;

        let transfers = gauge.bus.reads_of(0x2E);
        assert_eq!(transfers, 1);

        gauge.refresh().await;
        gauge.refresh().await;
        assert_eq!(gauge.bus.reads_of(0x2E), transfers);
    }

    #[tokio::test]
    async fn stale_snapshots_are_refreshed_on_demand() {
        let _guard = TIME_LOCK.lock().unwrap();
        let mut gauge = probe(l1_bus()).await;

        let refreshes = gauge.bus.reads_of(0x0A);
        assert_eq!(refreshes, 1);

        // two seconds later the snapshot is still fresh
        MockDriver::get().advance(Duration::from_secs(2));
        gauge.property(Property::Capacity).await.unwrap();
        assert_eq!(gauge.bus.reads_of(0x0A), refreshes);

        // six seconds after the refresh it is not
        MockDriver::get().advance(Duration::from_secs(4));
        gauge.property(Property::Capacity).await.unwrap();
        assert_eq!(gauge.bus.reads_of(0x0A), refreshes + 1);
    }
}
