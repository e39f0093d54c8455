//! Min/max charge temperature protection, used when software JEITA is off

use crate::config::ThermalConfig;
use crate::fmt::*;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BatTemp {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ThermalState {
    pub sm: BatTemp,
}

impl ThermalState {
    /// Returns whether charging is allowed at `temp`
    pub fn update(&mut self, cfg: &ThermalConfig, temp: i32) -> bool {
        if cfg.enable_min_charge_temp {
            if temp < cfg.min_charge_temp {
                error!("battery under temperature or ntc fail {} {}", temp, cfg.min_charge_temp);
                self.sm = BatTemp::Low;
                return false;
            } else if self.sm == BatTemp::Low {
                if temp < cfg.min_charge_temp_plus_x {
                    return false;
                }
                info!("battery temperature raised to {}, allow charging", temp);
                self.sm = BatTemp::Normal;
            }
        }

        if temp >= cfg.max_charge_temp {
            error!("battery over temperature or ntc fail {} {}", temp, cfg.max_charge_temp);
            self.sm = BatTemp::High;
            return false;
        } else if self.sm == BatTemp::High {
            if temp >= cfg.max_charge_temp_minus_x {
                return false;
            }
            info!("battery temperature dropped to {}, allow charging", temp);
            self.sm = BatTemp::Normal;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn over_temperature_recovers_below_minus_x() {
        let cfg = ThermalConfig::default();
        let mut state = ThermalState::default();

        assert!(state.update(&cfg, 45));
        assert!(!state.update(&cfg, 50));
        assert_eq!(state.sm, BatTemp::High);
        assert!(!state.update(&cfg, 48));
        assert!(!state.update(&cfg, 47));
        assert!(state.update(&cfg, 46));
        assert_eq!(state.sm, BatTemp::Normal);
    }

    #[test]
    fn min_temperature_is_optional() {
        let mut cfg = ThermalConfig::default();
        let mut state = ThermalState::default();
        assert!(state.update(&cfg, -5));

        cfg.enable_min_charge_temp = true;
        assert!(!state.update(&cfg, -5));
        assert_eq!(state.sm, BatTemp::Low);
        assert!(!state.update(&cfg, 3));
        assert!(state.update(&cfg, 6));
        assert_eq!(state.sm, BatTemp::Normal);
    }
}
