//! Charger supervisory loop.
//!
//! [`Charger`] owns the charge path devices, the fast charging algorithms and the
//! charging policy. The host wakes it with [`Charger::wake_up`] (or lets the polling
//! timer do it) and drives it with [`Charger::poll`]. One routine run samples the
//! battery, follows plug in and out, applies JEITA or thermal protection, then hands over
//! to the policy when charging is allowed.

use embedded_hal_async::delay::DelayNs;

use crate::alg::{AlgEvent, AlgorithmSlots, ChargingPolicy, ChgAlgorithm, PolicyInput};
use crate::config::ChargerConfig;
use crate::device::{BatteryMonitor, ChargerDevice, ChargerType, Clock, Platform};
use crate::fmt::*;
use crate::ic::IcError;
use crate::jeita::JeitaState;
use crate::notify::{BatteryNotify, NotifyCode};
use crate::smart_charging::{ScSolution, ScState};
use crate::thermal::ThermalState;
use crate::work::DelayedWork;

pub const CHG1_SETTING: usize = 0;
pub const CHG2_SETTING: usize = 1;
const CHG_SETTING_NUM: usize = 2;

/// Stored when the junction temperature can't be read
pub const TCHG_UNKNOWN: i32 = -127;
/// Used when the battery temperature can't be read
const DEFAULT_BATTERY_TEMP: i32 = 25;

const INIT_RETRIES: u32 = 3;
const INIT_RETRY_MS: u32 = 10_000;
const INIT_HOLD_MS: u32 = 60_000;

/// Input current while no charger is attached, µA
const PLUG_OUT_INPUT_CURRENT: u32 = 100_000;
/// Margin below a dynamic mivr level the battery has to stay under, mV
const DMIVR_MARGIN_MV: i32 = 200;

const KPOC_VBUS_MIN_MV: i32 = 2500;
const KPOC_UEVENT_PERIOD_MS: u64 = 60_000;

/// Boot voltage counter is cleared once the system has been up this long
const RESET_BOOT_VOLT_MS: u64 = 50_000;

/// Ui soc below which a protected battery gets its voltage monitor back
const BATPRO_RESUME_SOC: i32 = 80;

/// Per charge path bookkeeping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargerData {
    pub disable_charging_count: i32,
    /// µA, -1 when AICL found no limit
    pub input_current_limit_by_aicl: i32,
    pub junction_temp_min: i32,
    pub junction_temp_max: i32,
}

impl Default for ChargerData {
    fn default() -> Self {
        Self {
            disable_charging_count: 0,
            input_current_limit_by_aicl: -1,
            junction_temp_min: TCHG_UNKNOWN,
            junction_temp_max: TCHG_UNKNOWN,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChargerState {
    pub chr_type: ChargerType,
    /// The polling timer is rearmed on every routine run
    pub polling: bool,
    pub can_charging: bool,
    pub is_charging: bool,
    pub safety_timeout: bool,
    pub vbusov_stat: bool,
    pub dpdmov_stat: bool,
    pub lst_dpdmov_stat: bool,
    pub pd_reset: bool,
    pub cmd_discharging: bool,
    pub disable_charger: bool,
    pub is_suspend: bool,
    pub old_cv: u32,
    pub vbat_mon_en: bool,
    pub batpro_done: bool,
    pub stop_6pin_re_en: bool,
    pub cable_out_cnt: u32,
    pub battery_temp: i32,
    pub uisoc: i32,
    pub notify: BatteryNotify,
    pub jeita: JeitaState,
    pub thermal: ThermalState,
    pub sc: ScState,
    pub chg_data: [ChargerData; CHG_SETTING_NUM],
    pub enable_pp: [bool; CHG_SETTING_NUM],
    pub force_disable_pp: [bool; CHG_SETTING_NUM],
    /// Plug in time for the software safety timer
    pub charging_begin_ms: u64,
}

impl ChargerState {
    fn new(config: &ChargerConfig, sc: ScState) -> Self {
        Self {
            chr_type: ChargerType::Unknown,
            polling: false,
            can_charging: true,
            is_charging: false,
            safety_timeout: false,
            vbusov_stat: false,
            dpdmov_stat: false,
            lst_dpdmov_stat: false,
            pd_reset: false,
            cmd_discharging: false,
            disable_charger: config.disable_charger,
            is_suspend: false,
            old_cv: 0,
            vbat_mon_en: false,
            batpro_done: false,
            stop_6pin_re_en: false,
            cable_out_cnt: 0,
            battery_temp: DEFAULT_BATTERY_TEMP,
            uisoc: 0,
            notify: BatteryNotify::default(),
            jeita: JeitaState::default(),
            thermal: ThermalState::default(),
            sc,
            chg_data: [ChargerData::default(); CHG_SETTING_NUM],
            enable_pp: [true; CHG_SETTING_NUM],
            force_disable_pp: [false; CHG_SETTING_NUM],
            charging_begin_ms: 0,
        }
    }
}

fn checked<T, E>(what: &'static str, res: Result<T, IcError<E>>) -> Option<T> {
    match res {
        Ok(v) => Some(v),
        Err(e) => {
            if !e.is_not_supported() {
                warn!("{} failed", what);
            }
            None
        }
    }
}

pub struct Charger<C, M, A, P, H, D> {
    config: ChargerConfig,
    state: ChargerState,
    chg1: C,
    chg2: Option<C>,
    monitor: M,
    algs: AlgorithmSlots<A>,
    policy: P,
    host: H,
    delay: D,
    timer: DelayedWork,
    wake: bool,
    init_done: bool,
    init_retries: u32,
    power_off_pending: bool,
    uevent_time: Option<u64>,
    boot_volt_reset: bool,
}

impl<C, M, A, P, H, D> Charger<C, M, A, P, H, D>
where
    C: ChargerDevice,
    M: BatteryMonitor,
    A: ChgAlgorithm,
    P: ChargingPolicy,
    H: Platform,
    D: DelayNs,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ChargerConfig,
        sc: ScState,
        chg1: C,
        monitor: M,
        algs: AlgorithmSlots<A>,
        policy: P,
        host: H,
        delay: D,
    ) -> Self {
        Self {
            state: ChargerState::new(&config, sc),
            config,
            chg1,
            chg2: None,
            monitor,
            algs,
            policy,
            host,
            delay,
            timer: DelayedWork::new(),
            wake: false,
            init_done: false,
            init_retries: INIT_RETRIES,
            power_off_pending: false,
            uevent_time: None,
            boot_volt_reset: false,
        }
    }

    /// Adds the secondary charge path
    pub fn with_secondary(mut self, chg2: C) -> Self {
        self.chg2 = Some(chg2);
        self
    }

    pub fn config(&self) -> &ChargerConfig {
        &self.config
    }

    pub fn state(&self) -> &ChargerState {
        &self.state
    }

    pub fn chg1(&self) -> &C {
        &self.chg1
    }

    pub fn chg2(&self) -> Option<&C> {
        self.chg2.as_ref()
    }

    pub fn monitor_mut(&mut self) -> &mut M {
        &mut self.monitor
    }

    pub fn algorithms(&self) -> &AlgorithmSlots<A> {
        &self.algs
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn is_pending(&self) -> bool {
        self.wake
    }

    /// Arms the polling timer and queues the first routine run
    pub fn start(&mut self, now_ms: u64) {
        self.start_timer(now_ms);
        self.wake_up();
    }

    pub fn wake_up(&mut self) {
        self.wake = true;
    }

    /// Charger driver reported a cable removal
    pub fn cable_out(&mut self) {
        self.state.cable_out_cnt += 1;
        info!("cable_out_cnt={}", self.state.cable_out_cnt);
        self.wake_up();
    }

    pub fn set_cmd_discharging(&mut self, en: bool) {
        self.state.cmd_discharging = en;
        self.wake_up();
    }

    pub fn set_pd_reset(&mut self, reset: bool) {
        self.state.pd_reset = reset;
    }

    pub fn set_notify_test_mode(&mut self, mode: u32) {
        self.state.notify.test_mode = mode;
    }

    pub fn set_dpdm_ov(&mut self, ov: bool) {
        self.state.lst_dpdmov_stat = self.state.dpdmov_stat;
        self.state.dpdmov_stat = ov;
        self.wake_up();
    }

    pub fn sc_mut(&mut self) -> &mut ScState {
        &mut self.state.sc
    }

    pub fn chg_data_mut(&mut self, idx: usize) -> Option<&mut ChargerData> {
        self.state.chg_data.get_mut(idx)
    }

    pub fn suspend(&mut self) {
        self.state.is_suspend = true;
        debug!("enter suspend");
    }

    /// Resume notification. An expired polling deadline wakes the loop, and a power off
    /// held back while suspended happens now.
    pub fn resume(&mut self, now_ms: u64) {
        self.state.is_suspend = false;
        debug!("leave suspend");

        if self.timer.take_due(now_ms) {
            info!("alarm timeout, wake up charger");
            self.wake_up();
        }

        if self.power_off_pending {
            error!("resumed, shutdown");
            self.power_off_pending = false;
            self.host.power_off();
        }
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.timer.deadline()
    }

    /// Runs the routine if it was woken up or the polling timer expired
    pub async fn poll<K: Clock>(&mut self, clock: &K) {
        let now = clock.now_ms();

        // A timer expiring during suspend waits for the resume notification
        if !self.state.is_suspend && self.timer.take_due(now) {
            self.wake_up();
        }

        if self.wake {
            self.routine(clock).await;
        }
    }

    fn start_timer(&mut self, now_ms: u64) {
        let interval = u64::from(self.config.polling_interval_s) * 1000;
        self.timer.reschedule(now_ms, interval);
        debug!("alarm timer start: {}", now_ms + interval);
    }

    fn is_disable_charger(&self) -> bool {
        self.state.disable_charger
    }

    async fn init_algo(&mut self) -> bool {
        if checked("init primary charger", self.chg1.init().await).is_none() {
            error!("can't find primary charger");
            return false;
        }
        if let Some(chg2) = self.chg2.as_mut() {
            checked("init secondary charger", chg2.init().await);
        }

        self.algs.init_all().await;
        true
    }

    async fn routine<K: Clock>(&mut self, clock: &K) {
        while !self.init_done {
            if self.init_algo().await {
                self.init_done = true;
                if self.config.charger_unlimited {
                    self.config.enable_sw_safety_timer = false;
                    checked("disable safety timer", self.chg1.enable_safety_timer(false).await);
                }
            } else if self.init_retries > 0 {
                warn!("retry to init charger");
                self.init_retries -= 1;
                self.delay.delay_ms(INIT_RETRY_MS).await;
            } else {
                warn!("holding to init charger");
                self.delay.delay_ms(INIT_HOLD_MS).await;
            }
        }

        self.wake = false;
        let now = clock.now_ms();

        self.state.battery_temp =
            checked("battery temperature", self.monitor.battery_temp().await).unwrap_or(DEFAULT_BATTERY_TEMP);

        let charger_on = self.is_charger_on(clock).await;

        if self.state.polling {
            self.start_timer(now);
        }

        self.check_battery_exist().await;
        self.check_dynamic_mivr().await;
        self.check_status(now).await;
        self.kpoc_power_off_check(now).await;

        debug!(
            "T={} uisoc:{} type:{} can:{} pd_reset:{}",
            self.state.battery_temp,
            self.state.uisoc,
            self.state.chr_type,
            self.state.can_charging,
            self.state.pd_reset
        );

        if !self.is_disable_charger() && charger_on && self.state.can_charging {
            let input = PolicyInput {
                chr_type: self.state.chr_type,
                jeita_cv: if self.config.enable_sw_jeita { self.state.jeita.cv } else { 0 },
                battery_temp: self.state.battery_temp,
                uisoc: self.state.uisoc,
                sc_reduce: self.state.sc.last_solution == ScSolution::Reduce,
            };
            self.policy.do_algorithm(&input).await;
            self.charger_status_check().await;
        } else {
            debug!(
                "disable charging {} {} {}",
                self.is_disable_charger(),
                charger_on,
                self.state.can_charging
            );
        }

        if !self.config.skips_smart_charging() {
            self.smart_charging(clock.seconds_of_day()).await;
        }

        if self.config.enable_boot_volt && now > RESET_BOOT_VOLT_MS && !self.boot_volt_reset {
            match self.chg1.set_boot_volt_times(0).await {
                Ok(()) => {
                    info!("reset boot_battery_voltage times");
                    self.boot_volt_reset = true;
                }
                Err(_) => error!("reset boot_battery_voltage times fails"),
            }
        }
    }

    /// Follows plug in and out, returns whether a charger is attached
    async fn is_charger_on<K: Clock>(&mut self, clock: &K) -> bool {
        // A failed read looks like no change
        let chr_type = checked("charger type", self.monitor.charger_type().await).unwrap_or(self.state.chr_type);

        if chr_type == ChargerType::Unknown {
            if self.state.chr_type != ChargerType::Unknown {
                self.plug_out().await;
                self.state.cable_out_cnt = 0;
            }
        } else {
            if self.state.chr_type != chr_type {
                self.plug_in(chr_type, clock).await;
            }

            if self.state.cable_out_cnt > 0 {
                self.plug_out().await;
                self.plug_in(chr_type, clock).await;
                self.state.cable_out_cnt = 0;
            }
        }

        chr_type != ChargerType::Unknown
    }

    async fn plug_in<K: Clock>(&mut self, chr_type: ChargerType, clock: &K) {
        let s = &mut self.state;
        s.chr_type = chr_type;
        s.polling = true;
        s.can_charging = true;
        s.safety_timeout = false;
        s.vbusov_stat = false;
        s.old_cv = 0;
        s.stop_6pin_re_en = false;
        s.batpro_done = false;
        s.charging_begin_ms = clock.now_ms();
        s.notify.code.remove(NotifyCode::ST_TMO);

        self.smart_charging(clock.seconds_of_day()).await;
        info!("plug in, type:{}", chr_type);

        let vbat = checked("battery voltage", self.monitor.battery_voltage().await).unwrap_or(0);
        self.algs.notify_all(AlgEvent::PlugIn).await;
        for (_, alg) in self.algs.iter_mut() {
            alg.set_ref_vbat(vbat).await;
        }

        self.state.sc.clear_data();
        self.state.sc.disable_in_this_plug = false;

        checked("plug in", self.chg1.plug_in().await);
        self.force_disable_power_path(CHG1_SETTING, false).await;
    }

    async fn plug_out(&mut self) {
        info!("plug out");

        let s = &mut self.state;
        s.chr_type = ChargerType::Unknown;
        s.polling = false;
        s.dpdmov_stat = false;
        s.lst_dpdmov_stat = false;
        s.pd_reset = false;

        for data in s.chg_data.iter_mut() {
            data.disable_charging_count = 0;
            data.input_current_limit_by_aicl = -1;
        }

        self.algs.notify_all(AlgEvent::PlugOut).await;
        for (_, alg) in self.algs.iter_mut() {
            alg.plugout_reset().await;
        }

        self.state.sc.clear_data();

        checked(
            "set input current",
            self.chg1.set_input_current(PLUG_OUT_INPUT_CURRENT).await,
        );
        checked("set mivr", self.chg1.set_mivr(self.config.min_charger_voltage).await);
        checked("plug out", self.chg1.plug_out().await);
        self.force_disable_power_path(CHG1_SETTING, true).await;

        if self.config.enable_vbat_mon != 0 {
            checked("disable 6pin charging", self.chg1.enable_6pin_battery_charging(false).await);
        }
    }

    async fn force_disable_power_path(&mut self, idx: usize, disable: bool) {
        if self.state.force_disable_pp[idx] == disable {
            return;
        }
        self.state.force_disable_pp[idx] = disable;

        let en = !disable && self.state.enable_pp[idx];
        let dev = match idx {
            CHG1_SETTING => Some(&mut self.chg1),
            _ => self.chg2.as_mut(),
        };

        match dev {
            Some(dev) => {
                checked("enable power path", dev.enable_powerpath(en).await);
            }
            None => error!("charger {} not found", idx),
        }
    }

    async fn check_battery_exist(&mut self) {
        if self.is_disable_charger() {
            return;
        }

        let mut missing = 0;
        for _ in 0..3 {
            if checked("battery exist", self.monitor.battery_exists().await) == Some(false) {
                missing += 1;
            }
        }

        if missing >= 3 {
            error!("battery doesn't exist");
        }
    }

    async fn check_dynamic_mivr(&mut self) {
        if !self.config.enable_dynamic_mivr || self.algs.any_running().await {
            return;
        }

        let Some(vbat) = checked("battery voltage", self.monitor.battery_voltage().await) else {
            return;
        };

        let cfg = &self.config;
        let mivr = if vbat < (cfg.min_charger_voltage_2 / 1000) as i32 - DMIVR_MARGIN_MV {
            cfg.min_charger_voltage_2
        } else if vbat < (cfg.min_charger_voltage_1 / 1000) as i32 - DMIVR_MARGIN_MV {
            cfg.min_charger_voltage_1
        } else {
            cfg.min_charger_voltage
        };

        checked("set mivr", self.chg1.set_mivr(mivr).await);
    }

    async fn sample_tchg(&mut self) {
        let paths = [Some(&mut self.chg1), self.chg2.as_mut()];

        for (data, dev) in self.state.chg_data.iter_mut().zip(paths) {
            let Some(dev) = dev else {
                continue;
            };
            let (min, max) = checked("junction temperature", dev.junction_temp().await)
                .unwrap_or((TCHG_UNKNOWN, TCHG_UNKNOWN));
            data.junction_temp_min = min;
            data.junction_temp_max = max;
        }
    }

    /// False if vbus is over `max_charger_voltage`
    fn vbus_ok(&self, vbus_mv: i32) -> bool {
        let vchr = i64::from(vbus_mv) * 1000;
        if vchr > i64::from(self.config.max_charger_voltage) {
            error!("vbus({} mV) > {} mV", vbus_mv, self.config.max_charger_voltage / 1000);
            return false;
        }
        true
    }

    async fn charging_allowed(&mut self, temp: i32, vbus_mv: i32) -> bool {
        if self.config.enable_sw_jeita {
            self.state.jeita.update(&self.config.jeita, temp);
            if !self.state.jeita.charging {
                return false;
            }
        } else if !self.state.thermal.update(&self.config.thermal, temp) {
            return false;
        }

        self.sample_tchg().await;

        if !self.vbus_ok(vbus_mv) {
            return false;
        }

        let s = &self.state;
        !(s.cmd_discharging || s.safety_timeout || s.vbusov_stat || s.dpdmov_stat || s.sc.disable_charger)
    }

    fn check_safety_timer(&mut self, now_ms: u64) {
        if !self.config.enable_sw_safety_timer || self.state.safety_timeout {
            return;
        }

        let elapsed = now_ms.saturating_sub(self.state.charging_begin_ms);
        if elapsed > u64::from(self.config.max_charging_time_s) * 1000 {
            error!("charging for {} s, safety timeout", elapsed / 1000);
            self.state.safety_timeout = true;
            self.state.notify.code.insert(NotifyCode::ST_TMO);
            self.host.chgstat_notify();
        }
    }

    async fn check_status(&mut self, now_ms: u64) {
        if self.state.chr_type == ChargerType::Unknown {
            return;
        }

        let temp = self.state.battery_temp;
        self.state.uisoc = checked("uisoc", self.monitor.uisoc().await).unwrap_or(0);
        let vbus_mv = checked("vbus", self.monitor.vbus().await).unwrap_or(0);

        self.state.vbat_mon_en =
            !(self.config.enable_sw_jeita || self.config.enable_vbat_mon == 0 || self.state.batpro_done);

        self.check_safety_timer(now_ms);
        let charging = self.charging_allowed(temp, vbus_mv).await;

        let vbus_uv = u32::try_from(vbus_mv).unwrap_or(0).saturating_mul(1000);
        if self.state.notify.check(&self.config, vbus_uv, temp) {
            info!("chgstat notify: {=u32:#x}", self.state.notify.code.bits());
            self.host.chgstat_notify();
        }

        let s = &mut self.state;
        if charging && s.uisoc < BATPRO_RESUME_SOC && s.batpro_done {
            s.vbat_mon_en = true;
            s.batpro_done = false;
            s.stop_6pin_re_en = false;
        }

        info!(
            "tmp:{} (jeita:{} sm:{} cv:{} en:{}) (sm:{}) en:{} c:{} s:{} ov:{} {} sc:{} {}",
            temp,
            self.config.enable_sw_jeita,
            s.jeita.sm,
            s.jeita.cv,
            s.jeita.charging,
            s.thermal.sm,
            charging,
            s.cmd_discharging,
            s.safety_timeout,
            s.vbusov_stat,
            s.dpdmov_stat,
            s.sc.disable_charger,
            s.can_charging
        );

        let chg_dev_chgen = checked("charger enabled", self.chg1.is_enabled().await).unwrap_or(true);

        if charging != self.state.can_charging || (!charging && chg_dev_chgen) {
            self.policy.enable_charging(charging).await;
        }

        self.state.can_charging = charging;
    }

    async fn kpoc_power_off_check(&mut self, now_ms: u64) {
        if !self.config.is_kpoc() {
            return;
        }

        let vbus = checked("vbus", self.monitor.vbus().await).unwrap_or(-1);
        if (0..KPOC_VBUS_MIN_MV).contains(&vbus)
            && self.state.chr_type == ChargerType::Unknown
            && !self.state.pd_reset
        {
            error!("unplug charger in kpoc mode, vbus={}, shutdown", vbus);
            if self.state.is_suspend {
                warn!("suspended, shutdown on resume");
                self.power_off_pending = true;
            } else {
                self.host.power_off();
            }
        }

        match self.uevent_time {
            None => self.uevent_time = Some(now_ms),
            Some(last) if now_ms.saturating_sub(last) >= KPOC_UEVENT_PERIOD_MS => {
                self.host.chgstat_notify();
                self.uevent_time = Some(now_ms);
            }
            Some(_) => {}
        }
    }

    async fn charger_status_check(&mut self) {
        // An unreadable charger counts as charging
        let charging = checked("charger status", self.chg1.is_charging().await).unwrap_or(true);

        if charging != self.state.is_charging {
            self.host.power_supply_changed();
        }
        self.state.is_charging = charging;
    }

    async fn smart_charging(&mut self, seconds_of_day: i32) {
        let uisoc = checked("uisoc", self.monitor.uisoc().await).unwrap_or(0);
        let ibat = checked("battery current", self.monitor.battery_current().await).unwrap_or(0);

        self.state.sc.decide(seconds_of_day, uisoc, ibat);
        debug!("sc disable_charger: {}", self.state.sc.disable_charger);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use embassy_futures::block_on;

    use super::*;
    use crate::alg::{AlgId, AlgState};
    use crate::config::SmartChargingConfig;
    use crate::jeita::JeitaSm;

    #[derive(Default)]
    struct FakeChg {
        init_failures: u32,
        plug_ins: u32,
        plug_outs: u32,
        input_current: Option<u32>,
        mivr: Option<u32>,
        powerpath: Option<bool>,
        six_pin: Option<bool>,
        enabled: bool,
        charging: bool,
        tchg: Option<(i32, i32)>,
    }

    impl ChargerDevice for FakeChg {
        type Error = ();

        async fn init(&mut self) -> Result<(), IcError<()>> {
            if self.init_failures > 0 {
                self.init_failures -= 1;
                return Err(IcError::Bus(()));
            }
            Ok(())
        }
        async fn plug_in(&mut self) -> Result<(), IcError<()>> {
            self.plug_ins += 1;
            Ok(())
        }
        async fn plug_out(&mut self) -> Result<(), IcError<()>> {
            self.plug_outs += 1;
            Ok(())
        }
        async fn set_input_current(&mut self, ua: u32) -> Result<(), IcError<()>> {
            self.input_current = Some(ua);
            Ok(())
        }
        async fn set_mivr(&mut self, uv: u32) -> Result<(), IcError<()>> {
            self.mivr = Some(uv);
            Ok(())
        }
        async fn enable_powerpath(&mut self, en: bool) -> Result<(), IcError<()>> {
            self.powerpath = Some(en);
            Ok(())
        }
        async fn is_enabled(&mut self) -> Result<bool, IcError<()>> {
            Ok(self.enabled)
        }
        async fn is_charging(&mut self) -> Result<bool, IcError<()>> {
            Ok(self.charging)
        }
        async fn junction_temp(&mut self) -> Result<(i32, i32), IcError<()>> {
            self.tchg.ok_or(IcError::Bus(()))
        }
        async fn enable_6pin_battery_charging(&mut self, en: bool) -> Result<(), IcError<()>> {
            self.six_pin = Some(en);
            Ok(())
        }
    }

    struct FakeMon {
        chr_type: ChargerType,
        temp: i32,
        vbat: i32,
        ibat: i32,
        vbus: i32,
        uisoc: i32,
    }

    impl Default for FakeMon {
        fn default() -> Self {
            Self {
                chr_type: ChargerType::Unknown,
                temp: 25,
                vbat: 3900,
                ibat: 1000,
                vbus: 5000,
                uisoc: 50,
            }
        }
    }

    impl BatteryMonitor for FakeMon {
        type Error = ();

        async fn charger_type(&mut self) -> Result<ChargerType, IcError<()>> {
            Ok(self.chr_type)
        }
        async fn battery_temp(&mut self) -> Result<i32, IcError<()>> {
            Ok(self.temp)
        }
        async fn battery_voltage(&mut self) -> Result<i32, IcError<()>> {
            Ok(self.vbat)
        }
        async fn battery_current(&mut self) -> Result<i32, IcError<()>> {
            Ok(self.ibat)
        }
        async fn vbus(&mut self) -> Result<i32, IcError<()>> {
            Ok(self.vbus)
        }
        async fn uisoc(&mut self) -> Result<i32, IcError<()>> {
            Ok(self.uisoc)
        }
        async fn battery_exists(&mut self) -> Result<bool, IcError<()>> {
            Ok(true)
        }
    }

    #[derive(Default)]
    struct FakeAlg {
        state: Option<AlgState>,
        events: Vec<AlgEvent>,
        ref_vbat: i32,
        resets: u32,
    }

    impl ChgAlgorithm for FakeAlg {
        async fn init(&mut self, _id: AlgId) {}
        async fn notify(&mut self, evt: AlgEvent) {
            self.events.push(evt);
        }
        async fn set_ref_vbat(&mut self, vbat: i32) {
            self.ref_vbat = vbat;
        }
        async fn plugout_reset(&mut self) {
            self.resets += 1;
        }
        async fn is_algo_ready(&mut self) -> AlgState {
            self.state.unwrap_or(AlgState::Ready)
        }
    }

    #[derive(Default)]
    struct FakePolicy {
        runs: u32,
        enables: Vec<bool>,
    }

    impl ChargingPolicy for FakePolicy {
        async fn do_algorithm(&mut self, _input: &PolicyInput) {
            self.runs += 1;
        }
        async fn enable_charging(&mut self, en: bool) {
            self.enables.push(en);
        }
    }

    #[derive(Default)]
    struct FakeHost {
        chgstat: u32,
        psy_changed: u32,
        power_offs: u32,
    }

    impl Platform for FakeHost {
        fn chgstat_notify(&mut self) {
            self.chgstat += 1;
        }
        fn power_supply_changed(&mut self) {
            self.psy_changed += 1;
        }
        fn power_off(&mut self) {
            self.power_offs += 1;
        }
    }

    #[derive(Default)]
    struct FakeDelay {
        slept_ms: Vec<u32>,
    }

    impl DelayNs for FakeDelay {
        async fn delay_ns(&mut self, ns: u32) {
            self.slept_ms.push(ns / 1_000_000);
        }

        async fn delay_ms(&mut self, ms: u32) {
            self.slept_ms.push(ms);
        }
    }

    struct FakeClock {
        now_ms: u64,
        sod: i32,
    }

    impl Clock for FakeClock {
        fn now_ms(&self) -> u64 {
            self.now_ms
        }
        fn seconds_of_day(&self) -> i32 {
            self.sod
        }
    }

    type TestCharger = Charger<FakeChg, FakeMon, FakeAlg, FakePolicy, FakeHost, FakeDelay>;

    fn charger(config: ChargerConfig) -> TestCharger {
        let algs = AlgorithmSlots::probe(|name| match name {
            "pd" | "pe" => Some(FakeAlg::default()),
            _ => None,
        });

        Charger::new(
            config,
            ScState::default(),
            FakeChg::default(),
            FakeMon::default(),
            algs,
            FakePolicy::default(),
            FakeHost::default(),
            FakeDelay::default(),
        )
        .with_secondary(FakeChg::default())
    }

    fn at(now_ms: u64) -> FakeClock {
        FakeClock { now_ms, sod: 0 }
    }

    fn run(chg: &mut TestCharger, now_ms: u64) {
        chg.wake_up();
        block_on(chg.poll(&at(now_ms)));
    }

    fn plugged(config: ChargerConfig) -> TestCharger {
        let mut chg = charger(config);
        chg.monitor_mut().chr_type = ChargerType::UsbDcp;
        run(&mut chg, 0);
        chg
    }

    #[test]
    fn plug_in_notifies_algorithms() {
        let chg = plugged(ChargerConfig::default());
        let s = chg.state();

        assert_eq!(s.chr_type, ChargerType::UsbDcp);
        assert!(s.polling);
        assert!(s.can_charging);
        assert_eq!(chg.chg1().plug_ins, 1);
        assert_eq!(chg.chg1().powerpath, None);

        let pd = chg.algorithms().get(AlgId::Pdc).unwrap();
        assert_eq!(pd.events, [AlgEvent::PlugIn]);
        assert_eq!(pd.ref_vbat, 3900);
        assert_eq!(chg.policy().runs, 1);
        assert_eq!(chg.next_deadline(), Some(10_000));
    }

    #[test]
    fn plug_out_resets_both_charge_paths() {
        let mut chg = plugged(ChargerConfig::default());
        for idx in [CHG1_SETTING, CHG2_SETTING] {
            let data = chg.chg_data_mut(idx).unwrap();
            data.disable_charging_count = 3;
            data.input_current_limit_by_aicl = 1_500_000;
        }
        chg.set_pd_reset(true);

        chg.monitor_mut().chr_type = ChargerType::Unknown;
        run(&mut chg, 1000);

        let s = chg.state();
        for data in s.chg_data {
            assert_eq!(data.disable_charging_count, 0);
            assert_eq!(data.input_current_limit_by_aicl, -1);
        }
        assert_eq!(s.chr_type, ChargerType::Unknown);
        assert!(!s.polling);
        assert!(!s.pd_reset);

        let chg1 = chg.chg1();
        assert_eq!(chg1.plug_outs, 1);
        assert_eq!(chg1.input_current, Some(100_000));
        assert_eq!(chg1.mivr, Some(ChargerConfig::default().min_charger_voltage));
        assert_eq!(chg1.powerpath, Some(false));
        assert_eq!(chg1.six_pin, None);

        let pe = chg.algorithms().get(AlgId::Pe).unwrap();
        assert_eq!(pe.events, [AlgEvent::PlugIn, AlgEvent::PlugOut]);
        assert_eq!(pe.resets, 1);
    }

    #[test]
    fn vbat_monitor_is_turned_off_on_plug_out() {
        let config = ChargerConfig {
            enable_vbat_mon: 1,
            ..ChargerConfig::default()
        };
        let mut chg = plugged(config);
        chg.monitor_mut().chr_type = ChargerType::Unknown;
        run(&mut chg, 1000);

        assert_eq!(chg.chg1().six_pin, Some(false));
    }

    #[test]
    fn cable_out_while_present_replugs() {
        let mut chg = plugged(ChargerConfig::default());
        chg.cable_out();
        assert!(chg.is_pending());
        run(&mut chg, 1000);

        assert_eq!(chg.chg1().plug_outs, 1);
        assert_eq!(chg.chg1().plug_ins, 2);
        assert_eq!(chg.chg1().powerpath, Some(true));
        assert_eq!(chg.state().cable_out_cnt, 0);
        assert_eq!(chg.state().chr_type, ChargerType::UsbDcp);
    }

    #[test]
    fn unchanged_type_is_not_a_new_plug() {
        let mut chg = plugged(ChargerConfig::default());
        run(&mut chg, 1000);
        run(&mut chg, 2000);

        assert_eq!(chg.chg1().plug_ins, 1);
        assert_eq!(chg.policy().runs, 3);
    }

    #[test]
    fn hot_battery_stops_charging_under_jeita() {
        let mut config = ChargerConfig {
            enable_sw_jeita: true,
            ..ChargerConfig::default()
        };
        config.thermal.max_charge_temp = 60;
        let mut chg = plugged(config);

        chg.monitor_mut().temp = 50;
        run(&mut chg, 1000);

        let s = chg.state();
        assert_eq!(s.jeita.sm, JeitaSm::AboveT4);
        assert!(!s.can_charging);
        assert_eq!(chg.policy().enables, [false]);
        assert_eq!(chg.policy().runs, 1);

        chg.monitor_mut().temp = 48;
        run(&mut chg, 2000);
        assert!(!chg.state().can_charging);

        chg.monitor_mut().temp = 46;
        run(&mut chg, 3000);
        assert_eq!(chg.state().jeita.sm, JeitaSm::T3ToT4);
        assert!(chg.state().can_charging);
        assert_eq!(chg.policy().enables, [false, true]);
    }

    #[test]
    fn over_temperature_raises_chgstat() {
        let mut chg = plugged(ChargerConfig::default());
        chg.monitor_mut().temp = 55;
        run(&mut chg, 1000);

        assert!(chg.state().notify.code.contains(NotifyCode::BAT_OT));
        assert_eq!(chg.host().chgstat, 1);
        assert!(!chg.state().can_charging);
    }

    #[test]
    fn vbus_over_max_blocks_charging() {
        let mut chg = plugged(ChargerConfig::default());
        chg.monitor_mut().vbus = 7000;
        run(&mut chg, 1000);

        assert!(chg.state().notify.code.contains(NotifyCode::VBUS_OV));
        assert!(!chg.state().can_charging);
    }

    #[test]
    fn junction_temperature_read_failure_is_stored() {
        let mut chg = plugged(ChargerConfig::default());
        let s = chg.state();
        assert_eq!(s.chg_data[CHG1_SETTING].junction_temp_max, TCHG_UNKNOWN);
        assert_eq!(s.chg_data[CHG2_SETTING].junction_temp_min, TCHG_UNKNOWN);

        chg.chg1.tchg = Some((30, 41));
        run(&mut chg, 1000);
        assert_eq!(chg.state().chg_data[CHG1_SETTING].junction_temp_max, 41);
    }

    #[test]
    fn dynamic_mivr_follows_battery_voltage() {
        let config = ChargerConfig {
            enable_dynamic_mivr: true,
            ..ChargerConfig::default()
        };
        let mut chg = plugged(config);
        assert_eq!(chg.chg1().mivr, Some(4_200_000));

        chg.monitor_mut().vbat = 4100;
        run(&mut chg, 1000);
        assert_eq!(chg.chg1().mivr, Some(4_400_000));

        chg.monitor_mut().vbat = 4300;
        run(&mut chg, 2000);
        assert_eq!(chg.chg1().mivr, Some(4_600_000));
    }

    #[test]
    fn dynamic_mivr_leaves_running_algorithm_alone() {
        let config = ChargerConfig {
            enable_dynamic_mivr: true,
            ..ChargerConfig::default()
        };
        let algs = AlgorithmSlots::probe(|name| {
            (name == "pe5").then(|| FakeAlg {
                state: Some(AlgState::Running),
                ..FakeAlg::default()
            })
        });
        let mut chg = Charger::new(
            config,
            ScState::default(),
            FakeChg::default(),
            FakeMon {
                chr_type: ChargerType::UsbPd,
                ..FakeMon::default()
            },
            algs,
            FakePolicy::default(),
            FakeHost::default(),
            FakeDelay::default(),
        );
        run(&mut chg, 0);

        assert_eq!(chg.chg1().mivr, None);
    }

    #[test]
    fn safety_timer_latches_until_replug() {
        let config = ChargerConfig {
            enable_sw_safety_timer: true,
            max_charging_time_s: 100,
            ..ChargerConfig::default()
        };
        let mut chg = plugged(config);
        run(&mut chg, 50_000);
        assert!(chg.state().can_charging);

        run(&mut chg, 101_000);
        assert!(chg.state().safety_timeout);
        assert!(!chg.state().can_charging);
        assert!(chg.state().notify.code.contains(NotifyCode::ST_TMO));

        chg.cable_out();
        run(&mut chg, 102_000);
        assert!(!chg.state().safety_timeout);
        assert!(chg.state().can_charging);
    }

    #[test]
    fn unlimited_charger_drops_the_safety_timer() {
        let config = ChargerConfig {
            enable_sw_safety_timer: true,
            charger_unlimited: true,
            max_charging_time_s: 100,
            ..ChargerConfig::default()
        };
        let mut chg = plugged(config);
        run(&mut chg, 200_000);

        assert!(!chg.config().enable_sw_safety_timer);
        assert!(!chg.state().safety_timeout);
    }

    #[test]
    fn init_retries_then_holds() {
        let mut chg = charger(ChargerConfig::default());
        chg.chg1.init_failures = 5;
        run(&mut chg, 0);

        assert_eq!(chg.delay.slept_ms, [10_000, 10_000, 10_000, 60_000, 60_000]);
    }

    #[test]
    fn polling_timer_wakes_the_loop() {
        let mut chg = plugged(ChargerConfig::default());
        assert!(!chg.is_pending());

        block_on(chg.poll(&at(5_000)));
        assert_eq!(chg.policy().runs, 1);

        block_on(chg.poll(&at(10_000)));
        assert_eq!(chg.policy().runs, 2);
        assert_eq!(chg.next_deadline(), Some(20_000));
    }

    #[test]
    fn timer_during_suspend_waits_for_resume() {
        let mut chg = plugged(ChargerConfig::default());
        chg.suspend();
        block_on(chg.poll(&at(15_000)));
        assert_eq!(chg.policy().runs, 1);

        chg.resume(16_000);
        assert!(chg.is_pending());
        block_on(chg.poll(&at(16_000)));
        assert_eq!(chg.policy().runs, 2);
    }

    #[test]
    fn kpoc_unplug_powers_off() {
        let config = ChargerConfig {
            bootmode: 8,
            ..ChargerConfig::default()
        };
        let mut chg = charger(config);
        chg.monitor_mut().vbus = 0;
        run(&mut chg, 0);

        assert_eq!(chg.host().power_offs, 1);
    }

    #[test]
    fn kpoc_power_off_waits_for_resume() {
        let config = ChargerConfig {
            bootmode: 9,
            ..ChargerConfig::default()
        };
        let mut chg = charger(config);
        chg.monitor_mut().vbus = 100;
        chg.suspend();
        run(&mut chg, 0);
        assert_eq!(chg.host().power_offs, 0);

        chg.resume(10);
        assert_eq!(chg.host().power_offs, 1);
    }

    #[test]
    fn kpoc_keeps_power_on_pd_reset() {
        let config = ChargerConfig {
            bootmode: 8,
            ..ChargerConfig::default()
        };
        let mut chg = charger(config);
        chg.monitor_mut().vbus = 0;
        chg.set_pd_reset(true);
        run(&mut chg, 0);

        assert_eq!(chg.host().power_offs, 0);
    }

    #[test]
    fn kpoc_uevent_is_rate_limited() {
        let config = ChargerConfig {
            bootmode: 8,
            ..ChargerConfig::default()
        };
        let mut chg = plugged(config);
        run(&mut chg, 30_000);
        assert_eq!(chg.host().chgstat, 0);

        run(&mut chg, 60_000);
        assert_eq!(chg.host().chgstat, 1);

        run(&mut chg, 100_000);
        assert_eq!(chg.host().chgstat, 1);
        assert_eq!(chg.host().power_offs, 0);
    }

    #[test]
    fn smart_charging_holds_charging_off() {
        let mut chg = plugged(ChargerConfig::default());
        *chg.sc_mut() = ScState::new(SmartChargingConfig {
            enable: true,
            ..SmartChargingConfig::default()
        });
        chg.monitor_mut().uisoc = 85;

        let clock = FakeClock { now_ms: 1000, sod: 70000 };
        chg.wake_up();
        block_on(chg.poll(&clock));
        assert_eq!(chg.state().sc.last_solution, ScSolution::Disable);
        assert!(chg.state().can_charging);

        chg.wake_up();
        block_on(chg.poll(&FakeClock { now_ms: 2000, sod: 70010 }));
        assert!(!chg.state().can_charging);
        assert_eq!(chg.policy().enables, [false]);
    }

    #[test]
    fn smart_charging_is_skipped_in_factory_modes() {
        let config = ChargerConfig {
            bootmode: 4,
            ..ChargerConfig::default()
        };
        let mut chg = plugged(config);
        chg.sc_mut().config.enable = true;
        chg.monitor_mut().uisoc = 85;

        chg.wake_up();
        block_on(chg.poll(&FakeClock { now_ms: 1000, sod: 70000 }));
        // Only the plug in evaluation ran, before the schedule was enabled
        assert_eq!(chg.state().sc.last_solution, ScSolution::Ignore);
    }

    #[test]
    fn status_change_is_reported() {
        let mut chg = plugged(ChargerConfig::default());
        assert_eq!(chg.host().psy_changed, 0);

        chg.chg1.charging = true;
        run(&mut chg, 1000);
        assert_eq!(chg.host().psy_changed, 1);
        assert!(chg.state().is_charging);
    }
}
