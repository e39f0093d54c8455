//! Scheduled-target charging.
//!
//! The user picks a window of the day by whose end the battery should be full. Ahead of
//! that, charging stops at the target percentage or runs at a reduced current, so the
//! cell spends as little time as possible sitting at 100 %.

use crate::config::SmartChargingConfig;
use crate::fmt::*;

const SECONDS_PER_DAY: i32 = 86400;

/// Slots exchanged with the smart charging daemon
pub const SC_DATA_LEN: usize = 15;
pub const SC_SOLUTION: usize = 14;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScSolution {
    Ignore,
    #[default]
    Keep,
    Disable,
    Reduce,
}

impl From<i32> for ScSolution {
    fn from(raw: i32) -> Self {
        match raw {
            0 => Self::Ignore,
            2 => Self::Disable,
            3 => Self::Reduce,
            _ => Self::Keep,
        }
    }
}

/// Seconds left in the `[start, end)` window at `now`, all in seconds of the day. A window
/// with `end < start` wraps over midnight.
pub fn left_time(start: i32, end: i32, now: i32) -> i32 {
    if end >= start {
        if now >= start && now < end {
            return end - now;
        }
    } else if now >= start {
        return SECONDS_PER_DAY - now + end;
    } else if now < end {
        return end - now;
    }

    0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScState {
    pub config: SmartChargingConfig,
    pub last_solution: ScSolution,
    /// Last solution pushed by the daemon
    pub solution: ScSolution,
    /// Charging is held off by the schedule
    pub disable_charger: bool,
    pub disable_in_this_plug: bool,
    pub pre_ibat: i32,
    pub data: [i32; SC_DATA_LEN],
}

impl Default for ScState {
    fn default() -> Self {
        Self::new(SmartChargingConfig::default())
    }
}

impl ScState {
    pub fn new(config: SmartChargingConfig) -> Self {
        Self {
            config,
            last_solution: ScSolution::Keep,
            solution: ScSolution::Keep,
            disable_charger: false,
            disable_in_this_plug: false,
            pre_ibat: -1,
            data: [0; SC_DATA_LEN],
        }
    }

    pub fn clear_data(&mut self) {
        self.data = [0; SC_DATA_LEN];
    }

    /// Takes the decision the daemon computed from the last data frame
    pub fn apply_daemon_data(&mut self, data: &[i32; SC_DATA_LEN]) {
        self.solution = data[SC_SOLUTION].into();
        self.disable_charger = self.solution == ScSolution::Disable;
    }

    /// Evaluates the schedule for the current second of the day, ui soc in % and battery
    /// current in mA.
    pub fn decide(&mut self, now: i32, uisoc: i32, ibat: i32) -> ScSolution {
        let cfg = &self.config;
        let left = left_time(cfg.start_time, cfg.end_time, now);
        let pct = uisoc * 100;
        let time_to_target = left - cfg.left_time_for_cv;
        let mut ttf = -1;
        let mut ttf_limit = -1;

        let ret = if !cfg.enable
            || left <= 0
            || left < cfg.left_time_for_cv
            || (ibat <= 0 && self.last_solution != ScSolution::Disable)
        {
            ScSolution::Ignore
        } else if pct > cfg.target_percentage * 100 {
            if time_to_target > 0 {
                ScSolution::Disable
            } else {
                ScSolution::Keep
            }
        } else {
            ttf = cfg.battery_size * 3600 / 10000 * (10000 - pct);
            if ibat != 0 {
                ttf /= ibat;
            }

            if ttf < time_to_target && cfg.current_limit > 0 && ibat > cfg.current_limit {
                ttf_limit = cfg.battery_size / 10000 * (10000 - pct) / cfg.current_limit;
                if ttf_limit < time_to_target {
                    ScSolution::Reduce
                } else {
                    ScSolution::Keep
                }
            } else {
                ScSolution::Keep
            }
        };

        debug!(
            "sc: en {} window {}..{} now {} left {} cv {} target {} ttf {} {} ibat {} uisoc {} -> {}",
            cfg.enable,
            cfg.start_time,
            cfg.end_time,
            now,
            left,
            cfg.left_time_for_cv,
            time_to_target,
            ttf,
            ttf_limit,
            ibat,
            uisoc,
            ret
        );

        self.last_solution = ret;
        self.disable_charger = ret == ScSolution::Disable;

        ret
    }
}
