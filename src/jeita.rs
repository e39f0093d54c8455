//! Software JEITA: battery temperature bands with guard-banded transitions.
//!
//! Temperatures are compared in whatever unit [`JeitaConfig`] thresholds are given in.
//! Leaving a band towards the normal one requires the reading to clear the band edge by
//! the configured `x` degrees, so a reading sitting on a threshold can't toggle charging.

use crate::config::JeitaConfig;
use crate::fmt::*;

/// JEITA band, ordered by temperature
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum JeitaSm {
    BelowT0,
    T0ToT1,
    T1ToT2,
    /// Normal band
    T2ToT3,
    T3ToT4,
    AboveT4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JeitaState {
    pub sm: JeitaSm,
    pub pre_sm: JeitaSm,
    /// Charge voltage ceiling in µV, 0 in the normal band (keep the default CV)
    pub cv: u32,
    pub charging: bool,
}

impl Default for JeitaState {
    fn default() -> Self {
        Self {
            sm: JeitaSm::T2ToT3,
            pre_sm: JeitaSm::T2ToT3,
            cv: 0,
            charging: true,
        }
    }
}

impl JeitaState {
    /// Band for a first reading, without any guard band
    pub fn init(cfg: &JeitaConfig, temp: i32) -> Self {
        let sm = if temp >= cfg.t4_thres {
            JeitaSm::AboveT4
        } else if temp > cfg.t3_thres {
            JeitaSm::T3ToT4
        } else if temp >= cfg.t2_thres {
            JeitaSm::T2ToT3
        } else if temp >= cfg.t1_thres {
            JeitaSm::T1ToT2
        } else if temp >= cfg.t0_thres {
            JeitaSm::T0ToT1
        } else {
            JeitaSm::BelowT0
        };

        Self {
            sm,
            pre_sm: sm,
            ..Self::default()
        }
    }

    /// Runs one transition for the latest battery temperature
    pub fn update(&mut self, cfg: &JeitaConfig, temp: i32) {
        use JeitaSm::*;

        self.pre_sm = self.sm;
        self.charging = true;

        if temp >= cfg.t4_thres {
            self.sm = AboveT4;
            self.charging = false;
        } else if temp > cfg.t3_thres {
            if self.sm == AboveT4 && temp >= cfg.t4_thres_minus_x {
                self.charging = false;
            } else {
                self.sm = T3ToT4;
            }
        } else if temp >= cfg.t2_thres {
            let hold = (self.sm == T3ToT4 && temp >= cfg.t3_thres_minus_x)
                || (self.sm == T1ToT2 && temp <= cfg.t2_thres_plus_x);
            if !hold {
                self.sm = T2ToT3;
            }
        } else if temp >= cfg.t1_thres {
            if matches!(self.sm, T0ToT1 | BelowT0) && temp <= cfg.t1_thres_plus_x {
                if self.sm == BelowT0 {
                    self.charging = false;
                }
            } else {
                self.sm = T1ToT2;
            }
        } else if temp >= cfg.t0_thres {
            if self.sm == BelowT0 && temp <= cfg.t0_thres_plus_x {
                self.charging = false;
            } else {
                self.sm = T0ToT1;
            }
        } else {
            self.sm = BelowT0;
            self.charging = false;
        }

        self.cv = match self.sm {
            AboveT4 => cfg.above_t4_cv,
            T3ToT4 => cfg.t3_to_t4_cv,
            T2ToT3 => 0,
            T1ToT2 => cfg.t1_to_t2_cv,
            T0ToT1 => cfg.t0_to_t1_cv,
            BelowT0 => cfg.below_t0_cv,
        };

        if self.sm != self.pre_sm {
            info!("jeita: {} -> {} at {}, cv {}", self.pre_sm, self.sm, temp, self.cv);
        }
    }
}
