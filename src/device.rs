//! Hardware seen by the charger loop: the charger ICs, the battery side measurements,
//! the host services and the clocks. Voltages are µV, currents µA unless noted.

use crate::ic::IcError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargerType {
    #[default]
    Unknown,
    Usb,
    UsbCdp,
    UsbDcp,
    UsbPd,
    NonStandard,
}

/// A charger IC on one charge path
#[allow(async_fn_in_trait)]
pub trait ChargerDevice {
    type Error;

    /// Brings the device up. An error means the device isn't there (yet).
    async fn init(&mut self) -> Result<(), IcError<Self::Error>> {
        Ok(())
    }

    async fn plug_in(&mut self) -> Result<(), IcError<Self::Error>>;
    async fn plug_out(&mut self) -> Result<(), IcError<Self::Error>>;

    async fn set_input_current(&mut self, ua: u32) -> Result<(), IcError<Self::Error>>;
    async fn set_mivr(&mut self, uv: u32) -> Result<(), IcError<Self::Error>>;
    async fn enable_powerpath(&mut self, en: bool) -> Result<(), IcError<Self::Error>>;

    /// Whether the charge switch is on
    async fn is_enabled(&mut self) -> Result<bool, IcError<Self::Error>>;

    /// Online and actually charging, as reported by the charger's power supply
    async fn is_charging(&mut self) -> Result<bool, IcError<Self::Error>>;

    /// Junction temperature `(min, max)`, °C
    async fn junction_temp(&mut self) -> Result<(i32, i32), IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    async fn enable_safety_timer(&mut self, _en: bool) -> Result<(), IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    async fn enable_6pin_battery_charging(&mut self, _en: bool) -> Result<(), IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    async fn set_boot_volt_times(&mut self, _times: u32) -> Result<(), IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }
}

/// Battery and input measurements
#[allow(async_fn_in_trait)]
pub trait BatteryMonitor {
    type Error;

    async fn charger_type(&mut self) -> Result<ChargerType, IcError<Self::Error>>;

    /// Battery temperature in the unit the JEITA thresholds use
    async fn battery_temp(&mut self) -> Result<i32, IcError<Self::Error>>;

    /// mV
    async fn battery_voltage(&mut self) -> Result<i32, IcError<Self::Error>>;

    /// mA, positive while charging
    async fn battery_current(&mut self) -> Result<i32, IcError<Self::Error>>;

    /// mV
    async fn vbus(&mut self) -> Result<i32, IcError<Self::Error>>;

    /// %
    async fn uisoc(&mut self) -> Result<i32, IcError<Self::Error>>;

    async fn battery_exists(&mut self) -> Result<bool, IcError<Self::Error>>;
}

/// Services the host provides to the charger loop
pub trait Platform {
    /// Raises the CHGSTAT uevent
    fn chgstat_notify(&mut self);

    fn power_supply_changed(&mut self);

    fn power_off(&mut self);
}

pub trait Clock {
    /// Monotonic boot time
    fn now_ms(&self) -> u64;

    /// Local wall clock, seconds since midnight
    fn seconds_of_day(&self) -> i32;
}
