//! Compiled-in defaults and their overrides from the host's property store.
//!
//! A missing property is never fatal: the default is used and the miss is logged at error
//! level so it shows up in field logs.

use crate::fmt::*;

/// The host's property store (device tree or equivalent)
pub trait PropertySource {
    fn read_u32(&self, name: &str) -> Option<u32>;

    /// Presence of a boolean property
    fn read_bool(&self, name: &str) -> bool;

    /// Fills `out` from the start and returns how many entries the property holds
    fn read_i32_array(&self, name: &str, out: &mut [i32]) -> Option<usize>;
}

pub(crate) fn u32_or<S: PropertySource>(src: &S, name: &str, default: u32) -> u32 {
    src.read_u32(name).unwrap_or_else(|| {
        error!("use default {}: {}", name, default);
        default
    })
}

pub(crate) fn array_or<S: PropertySource, const N: usize>(src: &S, name: &str, default: [i32; N]) -> [i32; N] {
    let mut out = [0; N];

    match src.read_i32_array(name, &mut out) {
        Some(len) if len == N => out,
        _ => {
            error!("use default {}", name);
            default
        }
    }
}

/// Underscore name, then hyphen name, then the default
fn u32_alt<S: PropertySource>(src: &S, underscore: &str, hyphen: &str, default: u32) -> u32 {
    if let Some(val) = src.read_u32(underscore) {
        return val;
    }
    if let Some(val) = src.read_u32(hyphen) {
        return val;
    }

    error!("use default {}: {}", underscore, default);
    default
}

/// Same names as [`u32_alt`], but the hyphen lookup is not an `else` of the underscore
/// one: only the hyphen name decides the result.
fn u32_overwrite<S: PropertySource>(src: &S, underscore: &str, hyphen: &str, default: u32) -> u32 {
    if let Some(val) = src.read_u32(underscore) {
        debug!("{}: {} superseded by {}", underscore, val, hyphen);
    }

    src.read_u32(hyphen).unwrap_or_else(|| {
        error!("use default {}: {}", hyphen, default);
        default
    })
}

fn i32_alt<S: PropertySource>(src: &S, underscore: &str, hyphen: &str, default: i32) -> i32 {
    u32_alt(src, underscore, hyphen, default as u32) as i32
}

fn bool_alt<S: PropertySource>(src: &S, underscore: &str, hyphen: &str) -> bool {
    src.read_bool(underscore) || src.read_bool(hyphen)
}

/// Charge-path topology
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargerTopology {
    Single,
    DualInSeries,
    Divider,
    DualDivider,
    HvDivider,
    DualHvDivider,
}

impl From<u32> for ChargerTopology {
    fn from(raw: u32) -> Self {
        match raw {
            1 => Self::DualInSeries,
            2 => Self::Divider,
            3 => Self::DualDivider,
            4 => Self::HvDivider,
            5 => Self::DualHvDivider,
            _ => Self::Single,
        }
    }
}

/// JEITA band thresholds and charge voltages. Voltages in µV.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JeitaConfig {
    pub above_t4_cv: u32,
    pub t3_to_t4_cv: u32,
    pub t2_to_t3_cv: u32,
    pub t1_to_t2_cv: u32,
    pub t0_to_t1_cv: u32,
    pub below_t0_cv: u32,
    pub t4_thres: i32,
    pub t4_thres_minus_x: i32,
    pub t3_thres: i32,
    pub t3_thres_minus_x: i32,
    pub t2_thres: i32,
    pub t2_thres_plus_x: i32,
    pub t1_thres: i32,
    pub t1_thres_plus_x: i32,
    pub t0_thres: i32,
    pub t0_thres_plus_x: i32,
    pub neg_10_thres: i32,
}

impl Default for JeitaConfig {
    fn default() -> Self {
        Self {
            above_t4_cv: 4_240_000,
            t3_to_t4_cv: 4_240_000,
            t2_to_t3_cv: 4_340_000,
            t1_to_t2_cv: 4_240_000,
            t0_to_t1_cv: 4_040_000,
            below_t0_cv: 4_040_000,
            t4_thres: 50,
            t4_thres_minus_x: 47,
            t3_thres: 45,
            t3_thres_minus_x: 39,
            t2_thres: 10,
            t2_thres_plus_x: 16,
            t1_thres: 0,
            t1_thres_plus_x: 6,
            t0_thres: 0,
            t0_thres_plus_x: 0,
            neg_10_thres: 0,
        }
    }
}

impl JeitaConfig {
    fn load<S: PropertySource>(src: &S) -> Self {
        let d = Self::default();

        Self {
            above_t4_cv: u32_alt(src, "jeita_temp_above_t4_cv", "jeita-temp-above-t4-cv", d.above_t4_cv),
            t3_to_t4_cv: u32_alt(src, "jeita_temp_t3_to_t4_cv", "jeita-temp-t3-to-t4-cv", d.t3_to_t4_cv),
            t2_to_t3_cv: u32_alt(src, "jeita_temp_t2_to_t3_cv", "jeita-temp-t2-to-t3-cv", d.t2_to_t3_cv),
            t1_to_t2_cv: u32_alt(src, "jeita_temp_t1_to_t2_cv", "jeita-temp-t1-to-t2-cv", d.t1_to_t2_cv),
            t0_to_t1_cv: u32_alt(src, "jeita_temp_t0_to_t1_cv", "jeita-temp-t0-to-t1-cv", d.t0_to_t1_cv),
            below_t0_cv: u32_overwrite(src, "jeita_temp_below_t0_cv", "jeita-temp-below-t0-cv", d.below_t0_cv),
            t4_thres: i32_alt(src, "temp_t4_thres", "temp-t4-thres", d.t4_thres),
            t4_thres_minus_x: i32_alt(
                src,
                "temp_t4_thres_minus_x_degree",
                "temp-t4-thres-minus-x-degree",
                d.t4_thres_minus_x,
            ),
            t3_thres: i32_alt(src, "temp_t3_thres", "temp-t3-thres", d.t3_thres),
            t3_thres_minus_x: i32_alt(
                src,
                "temp_t3_thres_minus_x_degree",
                "temp-t3-thres-minus-x-degree",
                d.t3_thres_minus_x,
            ),
            t2_thres: i32_alt(src, "temp_t2_thres", "temp-t2-thres", d.t2_thres),
            t2_thres_plus_x: i32_alt(
                src,
                "temp_t2_thres_plus_x_degree",
                "temp-t2-thres-plus-x-degree",
                d.t2_thres_plus_x,
            ),
            t1_thres: i32_alt(src, "temp_t1_thres", "temp-t1-thres", d.t1_thres),
            t1_thres_plus_x: i32_alt(
                src,
                "temp_t1_thres_plus_x_degree",
                "temp-t1-thres-plus-x-degree",
                d.t1_thres_plus_x,
            ),
            t0_thres: i32_alt(src, "temp_t0_thres", "temp-t0-thres", d.t0_thres),
            t0_thres_plus_x: i32_alt(
                src,
                "temp_t0_thres_plus_x_degree",
                "temp-t0-thres-plus-x-degree",
                d.t0_thres_plus_x,
            ),
            neg_10_thres: i32_alt(src, "temp_neg_10_thres", "temp-neg-10-thres", d.neg_10_thres),
        }
    }
}

/// Battery temperature protection used when software JEITA is off
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ThermalConfig {
    pub enable_min_charge_temp: bool,
    pub min_charge_temp: i32,
    pub min_charge_temp_plus_x: i32,
    pub max_charge_temp: i32,
    pub max_charge_temp_minus_x: i32,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            enable_min_charge_temp: false,
            min_charge_temp: 0,
            min_charge_temp_plus_x: 6,
            max_charge_temp: 50,
            max_charge_temp_minus_x: 47,
        }
    }
}

impl ThermalConfig {
    fn load<S: PropertySource>(src: &S) -> Self {
        let d = Self::default();

        Self {
            enable_min_charge_temp: bool_alt(src, "enable_min_charge_temp", "enable-min-charge-temp"),
            min_charge_temp: i32_alt(src, "min_charge_temp", "min-charge-temp", d.min_charge_temp),
            min_charge_temp_plus_x: i32_alt(
                src,
                "min_charge_temp_plus_x_degree",
                "min-charge-temp-plus-x-degree",
                d.min_charge_temp_plus_x,
            ),
            max_charge_temp: i32_alt(src, "max_charge_temp", "max-charge-temp", d.max_charge_temp),
            max_charge_temp_minus_x: i32_alt(
                src,
                "max_charge_temp_minus_x_degree",
                "max-charge-temp-minus-x-degree",
                d.max_charge_temp_minus_x,
            ),
        }
    }
}

/// Charger core configuration. Voltages in µV, currents in µA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargerConfig {
    pub disable_charger: bool,
    pub charger_unlimited: bool,
    pub atm_enabled: bool,
    pub enable_sw_safety_timer: bool,
    pub disable_aicl: bool,
    pub alg_new_arbitration: bool,
    pub alg_unchangeable: bool,
    pub enable_boot_volt: bool,
    pub enable_sw_jeita: bool,
    pub enable_dynamic_mivr: bool,
    pub enable_fast_charging_indicator: bool,
    pub topology: ChargerTopology,

    pub battery_cv: u32,
    pub max_charger_voltage: u32,
    pub vbus_sw_ovp_voltage: u32,
    pub min_charger_voltage: u32,
    pub min_charger_voltage_1: u32,
    pub min_charger_voltage_2: u32,
    pub max_dmivr_charger_current: u32,
    pub enable_vbat_mon: u32,

    pub usb_charger_current: u32,
    pub ac_charger_current: u32,
    pub ac_charger_input_current: u32,
    pub charging_host_charger_current: u32,

    pub jeita: JeitaConfig,
    pub thermal: ThermalConfig,

    pub polling_interval_s: u32,
    pub max_charging_time_s: u32,
    /// Boot mode reported by the bootloader
    pub bootmode: u32,
}

impl Default for ChargerConfig {
    fn default() -> Self {
        Self {
            disable_charger: false,
            charger_unlimited: false,
            atm_enabled: false,
            enable_sw_safety_timer: false,
            disable_aicl: false,
            alg_new_arbitration: false,
            alg_unchangeable: false,
            enable_boot_volt: false,
            enable_sw_jeita: false,
            enable_dynamic_mivr: false,
            enable_fast_charging_indicator: false,
            topology: ChargerTopology::Single,
            battery_cv: 4_350_000,
            max_charger_voltage: 6_500_000,
            vbus_sw_ovp_voltage: 15_000_000,
            min_charger_voltage: 4_600_000,
            min_charger_voltage_1: 4_400_000,
            min_charger_voltage_2: 4_200_000,
            max_dmivr_charger_current: 1_800_000,
            enable_vbat_mon: 0,
            usb_charger_current: 500_000,
            ac_charger_current: 2_050_000,
            ac_charger_input_current: 3_200_000,
            charging_host_charger_current: 650_000,
            jeita: JeitaConfig::default(),
            thermal: ThermalConfig::default(),
            polling_interval_s: 10,
            max_charging_time_s: 12 * 60 * 60,
            bootmode: 0,
        }
    }
}

impl ChargerConfig {
    pub fn load<S: PropertySource>(src: &S, bootmode: u32) -> Self {
        let d = Self::default();

        let topology = u32_alt(src, "charger_configuration", "charger-configuration", 0).into();

        Self {
            disable_charger: bool_alt(src, "disable_charger", "disable-charger"),
            charger_unlimited: bool_alt(src, "charger_unlimited", "charger-unlimited"),
            atm_enabled: bool_alt(src, "atm_is_enabled", "atm-is-enabled"),
            enable_sw_safety_timer: bool_alt(src, "enable_sw_safety_timer", "enable-sw-safety-timer"),
            disable_aicl: bool_alt(src, "disable_aicl", "disable-aicl"),
            alg_new_arbitration: bool_alt(src, "alg_new_arbitration", "alg-new-arbitration"),
            alg_unchangeable: bool_alt(src, "alg_unchangeable", "alg-unchangeable"),
            enable_boot_volt: bool_alt(src, "enable_boot_volt", "enable-boot-volt"),
            enable_sw_jeita: bool_alt(src, "enable_sw_jeita", "enable-sw-jeita"),
            enable_dynamic_mivr: bool_alt(src, "enable_dynamic_mivr", "enable-dynamic-mivr"),
            enable_fast_charging_indicator: bool_alt(
                src,
                "enable_fast_charging_indicator",
                "enable-fast-charging-indicator",
            ),
            topology,
            battery_cv: u32_alt(src, "battery_cv", "battery-cv", d.battery_cv),
            max_charger_voltage: u32_alt(src, "max_charger_voltage", "max-charger-voltage", d.max_charger_voltage),
            vbus_sw_ovp_voltage: u32_alt(src, "vbus_sw_ovp_voltage", "vbus-sw-ovp-voltage", d.vbus_sw_ovp_voltage),
            min_charger_voltage: u32_alt(src, "min_charger_voltage", "min-charger-voltage", d.min_charger_voltage),
            min_charger_voltage_1: u32_alt(
                src,
                "min_charger_voltage_1",
                "min-charger-voltage-1",
                d.min_charger_voltage_1,
            ),
            min_charger_voltage_2: u32_alt(
                src,
                "min_charger_voltage_2",
                "min-charger-voltage-2",
                d.min_charger_voltage_2,
            ),
            max_dmivr_charger_current: u32_alt(
                src,
                "max_dmivr_charger_current",
                "max-dmivr-charger-current",
                d.max_dmivr_charger_current,
            ),
            enable_vbat_mon: u32_alt(src, "enable_vbat_mon", "enable-vbat-mon", d.enable_vbat_mon),
            usb_charger_current: u32_alt(src, "usb_charger_current", "usb-charger-current", d.usb_charger_current),
            ac_charger_current: u32_overwrite(src, "ac_charger_current", "ac-charger-current", d.ac_charger_current),
            ac_charger_input_current: u32_alt(
                src,
                "ac_charger_input_current",
                "ac-charger-input-current",
                d.ac_charger_input_current,
            ),
            charging_host_charger_current: u32_alt(
                src,
                "charging_host_charger_current",
                "charging-host-charger-current",
                d.charging_host_charger_current,
            ),
            jeita: JeitaConfig::load(src),
            thermal: ThermalConfig::load(src),
            polling_interval_s: d.polling_interval_s,
            max_charging_time_s: d.max_charging_time_s,
            bootmode,
        }
    }

    /// Kernel power-off charging boot
    pub fn is_kpoc(&self) -> bool {
        matches!(self.bootmode, 8 | 9)
    }

    /// Boot modes that run without the smart charging daemon
    pub fn skips_smart_charging(&self) -> bool {
        matches!(self.bootmode, 1 | 2 | 4 | 8 | 9)
    }
}

/// Scheduled-target charging settings. Times are seconds of the local day, currents mA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SmartChargingConfig {
    pub enable: bool,
    pub start_time: i32,
    pub end_time: i32,
    /// Reserve kept for the constant-voltage tail, s
    pub left_time_for_cv: i32,
    /// Target ui soc, %
    pub target_percentage: i32,
    /// mAh
    pub battery_size: i32,
    /// -1 disables current reduction
    pub current_limit: i32,
}

impl Default for SmartChargingConfig {
    fn default() -> Self {
        Self {
            enable: false,
            start_time: 0,
            end_time: 80000,
            left_time_for_cv: 3600,
            target_percentage: 80,
            battery_size: 3000,
            current_limit: 2000,
        }
    }
}
