//! Deep-discharge limits, curves and the bookkeeping around them

use heapless::Vec;

use crate::config::{array_or, u32_or, PropertySource};
use crate::fmt::*;
use crate::temp_region::{TempRegion, TempType};

/// Voted voltages must be strictly inside `(INVALID_MIN_VOLTAGE, INVALID_MAX_VOLTAGE)`
pub const INVALID_MAX_VOLTAGE: i32 = 3800;
pub const INVALID_MIN_VOLTAGE: i32 = 2000;
/// Coulomb counts at or above this are garbage
pub const INVALID_CC_VALUE: i32 = 5000;
pub const DEEP_DISCHG_UPDATE_CC_DELTA: i32 = 5;
/// Reported instead of a count when deep discharge is unsupported or unreadable
pub const GAUGE_INVALID_DEEP_DICHG_COUNT: i32 = 10;
pub const PUSH_DELAY_MS: u64 = 2000;
pub const TERM_VOLT_EFFECT_GAP_MV: i32 = 20;
pub const SUPER_ENDURANCE_GAP_MV: i32 = 100;

pub const DDB_CURVE_MAX: usize = 6;
pub const DDC_CURVE_MAX: usize = 10;
pub const SILI_CFG_TYPE_MAX: usize = 16;

const TRACK_UPLOAD_COUNT_MAX: u32 = 3;
const TRACK_UPLOAD_PERIOD_S: u64 = 24 * 3600;

pub fn voltage_valid(volt: i32) -> bool {
    volt > INVALID_MIN_VOLTAGE && volt < INVALID_MAX_VOLTAGE
}

pub fn cc_valid(cc: i32) -> bool {
    cc > 0 && cc < INVALID_CC_VALUE
}

/// Aging ratio of a pack
pub fn dischg_ratio(counts: i32, cc: i32) -> i32 {
    if !cc_valid(cc) {
        if counts == 0 {
            100
        } else {
            counts.saturating_mul(10)
        }
    } else {
        counts.saturating_mul(10) / cc
    }
}

/// Low-current condition of one temperature region
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DdbCurve {
    pub iterm: i32,
    pub vterm: i32,
    /// Consecutive matching samples before a count is committed
    pub ctime: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DdsCurve {
    pub temp: i32,
    pub step: i32,
    pub index: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DdtCoeff {
    pub term_voltage: i32,
    pub fcc_coeff: i32,
    pub soh_coeff: i32,
}

/// Runtime limits. Some of these are outputs of the voltage votables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeepDischgLimits {
    pub uv_thr: i32,
    pub count_thr: i32,
    pub count_cali: i32,
    /// ui soc the detection runs above, %
    pub soc: i32,
    pub term_voltage: i32,
    pub ratio_shake: i32,
    pub sub_ratio_shake: i32,
    pub ratio_default: i32,
    pub ratio_status: bool,
    pub sub_ratio_status: bool,
    pub current_fcc_coeff: i32,
    pub current_soh_coeff: i32,
    pub spare_power_term_voltage: i32,
    pub volt_step: i32,
    pub index_r: i32,
    pub index_t: i32,
    pub step_status: bool,
}

impl Default for DeepDischgLimits {
    fn default() -> Self {
        Self {
            uv_thr: 3000,
            count_thr: 1,
            count_cali: 0,
            soc: 10,
            term_voltage: 0,
            ratio_shake: 30,
            sub_ratio_shake: 30,
            ratio_default: 30,
            ratio_status: false,
            sub_ratio_status: false,
            current_fcc_coeff: 0,
            current_soh_coeff: 0,
            spare_power_term_voltage: 2700,
            volt_step: 100,
            index_r: 0,
            index_t: 0,
            step_status: false,
        }
    }
}

/// Threshold set of one temperature classifier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TempRangeConfig {
    pub range: [i32; 3],
    pub temp_type: TempType,
}

impl Default for TempRangeConfig {
    fn default() -> Self {
        Self {
            range: [0, 100, 250],
            temp_type: TempType::Shell,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DeepSpecConfig {
    pub support: bool,
    pub spare_power_support: bool,
    pub sili_ic_alg_support: bool,
    pub limits: DeepDischgLimits,
    pub term_coeff: Vec<DdtCoeff, DDC_CURVE_MAX>,
    pub step_curves: Vec<DdsCurve, DDC_CURVE_MAX>,
    pub batt_curves: [Vec<DdbCurve, DDB_CURVE_MAX>; TempRegion::COUNT],
    pub ddbc: TempRangeConfig,
    pub ddrc: TempRangeConfig,
    pub sili_alg_cfg: Vec<u32, SILI_CFG_TYPE_MAX>,
}

fn temp_type(value: u32) -> TempType {
    match value {
        0 => TempType::Battery,
        _ => TempType::Shell,
    }
}

fn read_triples<S: PropertySource, T, const N: usize>(
    src: &S,
    name: &str,
    make: impl Fn(i32, i32, i32) -> T,
) -> Vec<T, N> {
    let mut raw = [0i32; 3 * DDC_CURVE_MAX];
    let mut out = Vec::new();

    let Some(len) = src.read_i32_array(name, &mut raw) else {
        error!("{} not found", name);
        return out;
    };

    for chunk in raw[..len.min(raw.len())].chunks_exact(3) {
        if out.push(make(chunk[0], chunk[1], chunk[2])).is_err() {
            error!("{} has too many entries", name);
            break;
        }
    }
    out
}

impl DeepSpecConfig {
    const BATT_CURVE_NAMES: [&'static str; TempRegion::COUNT] = [
        "deep_spec,ddbc_temp_cold",
        "deep_spec,ddbc_temp_cool",
        "deep_spec,ddbc_temp_normal",
        "deep_spec,ddbc_temp_warm",
    ];

    pub fn load<S: PropertySource>(src: &S) -> Self {
        let defaults = DeepDischgLimits::default();
        let mut limits = DeepDischgLimits {
            uv_thr: u32_or(src, "deep_spec,uv_thr", defaults.uv_thr as u32) as i32,
            count_cali: u32_or(src, "deep_spec,count_cali", defaults.count_cali as u32) as i32,
            count_thr: u32_or(src, "deep_spec,count_thr", defaults.count_thr as u32) as i32,
            spare_power_term_voltage: u32_or(
                src,
                "deep_spec,spare_power_term_voltage",
                defaults.spare_power_term_voltage as u32,
            ) as i32,
            soc: u32_or(src, "deep_spec,vbat_soc", defaults.soc as u32) as i32,
            ratio_default: u32_or(src, "deep_spec,ratio_thr", defaults.ratio_default as u32) as i32,
            volt_step: u32_or(src, "deep_spec,volt_step", defaults.volt_step as u32) as i32,
            ..defaults
        };
        limits.ratio_shake = limits.ratio_default;
        limits.sub_ratio_shake = limits.ratio_default;

        let sili_ic_alg_support = src.read_bool("deep_spec,sili_ic_alg_support");
        let mut sili_alg_cfg = Vec::new();
        if sili_ic_alg_support {
            let mut raw = [0i32; SILI_CFG_TYPE_MAX];
            if let Some(len) = src.read_i32_array("deep_spec,sili_alg_cfg_list", &mut raw) {
                if len > 0 && len <= SILI_CFG_TYPE_MAX {
                    for bit in &raw[..len] {
                        // capacity equals the raw buffer, can't overflow
                        let _ = sili_alg_cfg.push(*bit as u32);
                    }
                }
            }
        }

        let mut batt_curves: [Vec<DdbCurve, DDB_CURVE_MAX>; TempRegion::COUNT] = Default::default();
        for (curve, name) in batt_curves.iter_mut().zip(Self::BATT_CURVE_NAMES) {
            *curve = read_triples(src, name, |iterm, vterm, ctime| DdbCurve { iterm, vterm, ctime });
        }

        let ddbc = TempRangeConfig {
            range: array_or(src, "deep_spec,ddbc_curve,temp_range", TempRangeConfig::default().range),
            temp_type: temp_type(u32_or(src, "deep_spec,ddbc_curve,temp_type", 1)),
        };
        let ddrc = TempRangeConfig {
            range: array_or(src, "ddrc_strategy,temp_range", TempRangeConfig::default().range),
            temp_type: temp_type(u32_or(src, "ddrc_strategy,temp_type", 1)),
        };

        Self {
            support: src.read_bool("deep_spec,support"),
            spare_power_support: src.read_bool("deep_spec,spare_power_support"),
            sili_ic_alg_support,
            limits,
            term_coeff: read_triples(src, "deep_spec,term_coeff", |term_voltage, fcc_coeff, soh_coeff| {
                DdtCoeff {
                    term_voltage,
                    fcc_coeff,
                    soh_coeff,
                }
            }),
            step_curves: read_triples(src, "deep_spec,count_step", |temp, step, index| DdsCurve {
                temp,
                step,
                index,
            }),
            batt_curves,
            ddbc,
            ddrc,
            sili_alg_cfg,
        }
    }

    /// Count increment for a committed deep discharge at `temp`
    pub fn count_step(&self, temp: i32) -> i32 {
        if self.step_curves.is_empty() {
            return 1;
        }

        let mut i = self.step_curves.len() - 1;
        while i > 0 && temp < self.step_curves[i].temp {
            i -= 1;
        }
        self.step_curves[i].step
    }

    /// First low-current condition of `region` that the sample satisfies
    pub fn low_current_match(&self, region: TempRegion, ibat_ma: i32, vbat_mv: i32) -> Option<&DdbCurve> {
        self.batt_curves[region.index()]
            .iter()
            .find(|limit| ibat_ma <= limit.iterm && vbat_mv <= limit.vterm)
    }

    /// Coefficient row the termination voltage falls into
    pub fn term_coeff(&self, volt: i32) -> Option<&DdtCoeff> {
        self.term_coeff.iter().rev().find(|row| volt >= row.term_voltage)
    }

    pub fn sili_alg_cfg_mask(&self) -> u32 {
        self.sili_alg_cfg
            .iter()
            .filter(|bit| **bit < 32)
            .fold(0, |mask, bit| mask | (1 << *bit))
    }
}

/// Bounds diagnostic uploads to a few per day
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UploadLimiter {
    count: u32,
    pre_time_s: u64,
}

impl UploadLimiter {
    pub const fn new() -> Self {
        Self {
            count: 0,
            pre_time_s: 0,
        }
    }

    /// Claims an upload slot. The caller reports the upload with [`Self::uploaded`].
    pub fn try_acquire(&mut self, now_s: u64) -> bool {
        if now_s.saturating_sub(self.pre_time_s) > TRACK_UPLOAD_PERIOD_S {
            self.count = 0;
        }

        if self.count >= TRACK_UPLOAD_COUNT_MAX {
            return false;
        }

        self.pre_time_s = now_s;
        true
    }

    pub fn uploaded(&mut self) {
        self.count += 1;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
