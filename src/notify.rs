//! Battery notify codes reported to the host UI

use crate::config::ChargerConfig;
use crate::fmt::*;

bitflags! {
    /// Charging faults shown to the user, raised with a CHGSTAT notification
    pub struct NotifyCode: u32 {
        const VBUS_OV = 1 << 0;
        const BAT_OT = 1 << 1;
        const OC = 1 << 2;
        const BAT_OV = 1 << 3;
        const ST_TMO = 1 << 4;
        const BAT_LT = 1 << 5;
        const TYPEC_WD = 1 << 6;
    }
}

impl Default for NotifyCode {
    fn default() -> Self {
        Self::empty()
    }
}

impl NotifyCode {
    /// Code forced by a UI test mode, `None` for an unknown mode
    pub fn for_test_mode(mode: u32) -> Option<Self> {
        match mode {
            1 => Some(Self::VBUS_OV),
            2 => Some(Self::BAT_OT),
            3 => Some(Self::OC),
            4 => Some(Self::BAT_OV),
            5 => Some(Self::ST_TMO),
            6 => Some(Self::BAT_LT),
            7 => Some(Self::TYPEC_WD),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatteryNotify {
    pub code: NotifyCode,
    /// 0 runs the real checks
    pub test_mode: u32,
}

impl BatteryNotify {
    /// Updates the code from the latest vbus (µV) and battery temperature. Returns true
    /// when a CHGSTAT notification has to be raised.
    pub fn check(&mut self, cfg: &ChargerConfig, vbus_uv: u32, temp: i32) -> bool {
        if self.test_mode != 0 {
            match NotifyCode::for_test_mode(self.test_mode) {
                Some(code) => self.code = code,
                None => debug!("unknown notify test mode {}", self.test_mode),
            }
            return true;
        }

        let mut raise = false;

        if vbus_uv < cfg.max_charger_voltage {
            self.code.remove(NotifyCode::VBUS_OV);
        } else {
            error!("charger voltage {} mV over {} mV", vbus_uv / 1000, cfg.max_charger_voltage / 1000);
            self.code.insert(NotifyCode::VBUS_OV);
            raise = true;
        }

        if temp >= cfg.thermal.max_charge_temp {
            error!("battery temperature {} too high", temp);
            self.code.insert(NotifyCode::BAT_OT);
            raise = true;
        } else {
            self.code.remove(NotifyCode::BAT_OT);
        }

        let low_limit = if cfg.enable_sw_jeita {
            Some(cfg.jeita.neg_10_thres)
        } else if cfg.thermal.enable_min_charge_temp {
            Some(cfg.thermal.min_charge_temp)
        } else {
            None
        };

        if let Some(limit) = low_limit {
            if temp < limit {
                error!("battery temperature {} too low", temp);
                self.code.insert(NotifyCode::BAT_LT);
                raise = true;
            } else {
                self.code.remove(NotifyCode::BAT_LT);
            }
        }

        raise
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faults_latch_per_check() {
        let cfg = ChargerConfig::default();
        let mut notify = BatteryNotify::default();

        assert!(!notify.check(&cfg, 5_000_000, 25));
        assert!(notify.code.is_empty());

        assert!(notify.check(&cfg, 6_500_000, 50));
        assert_eq!(notify.code, NotifyCode::VBUS_OV | NotifyCode::BAT_OT);

        assert!(notify.check(&cfg, 5_000_000, 50));
        assert_eq!(notify.code, NotifyCode::BAT_OT);

        assert!(!notify.check(&cfg, 5_000_000, 30));
        assert!(notify.code.is_empty());
    }

    #[test]
    fn low_temperature_follows_the_active_protection() {
        let mut cfg = ChargerConfig::default();
        let mut notify = BatteryNotify::default();
        assert!(!notify.check(&cfg, 5_000_000, -20));

        cfg.enable_sw_jeita = true;
        cfg.jeita.neg_10_thres = -10;
        assert!(notify.check(&cfg, 5_000_000, -20));
        assert_eq!(notify.code, NotifyCode::BAT_LT);
        assert!(!notify.check(&cfg, 5_000_000, -10));
    }

    #[test]
    fn test_mode_replaces_the_code() {
        let cfg = ChargerConfig::default();
        let mut notify = BatteryNotify {
            code: NotifyCode::BAT_OT,
            test_mode: 7,
        };

        assert!(notify.check(&cfg, 0, 25));
        assert_eq!(notify.code, NotifyCode::TYPEC_WD);
    }
}
