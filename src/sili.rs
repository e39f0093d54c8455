//! Silicon-anode deep-discharge compensation.
//!
//! [`Sili`] watches the battery for deep-discharge events (low current at low voltage while
//! discharging), counts them per pack, and turns the count into termination and shutdown
//! voltage votes through the DDRC curves. Two votables arbitrate the voltages:
//! `GAUGE_SHUTDOWN_VOLTAGE` and `GAUGE_TERM_VOLTAGE`, both highest-wins. A winning
//! shutdown voltage becomes `uv_thr` and is published on the gauge topic; a winning
//! termination voltage is written to every gauge IC.
//!
//! Everything periodic is a [`DelayedWork`] run from [`Sili::poll`]. Bus deliveries for the
//! subscriptions made in [`Sili::subscribe`] go through [`Sili::handle`].

use core::fmt::Write;

use heapless::{String, Vec};

use crate::calib::GAUGE_IC_NUM_MAX;
use crate::config::PropertySource;
use crate::ddrc::{DdrcPoint, DdrcStrategy};
use crate::deep_spec::*;
use crate::fmt::*;
use crate::ic::{id_match, log_ic_error, GaugeIc, IcError, IcFunc, GPIO_STATUS_NOT_SUPPORT};
use crate::mms::items::*;
use crate::mms::{topics, Bus, BusError, Delivery, ItemData, Msg, MsgPrio, MsgType, SubscriberId};
use crate::temp_region::{RegionSample, TempClassifier, TempRegion, TempType, GAUGE_LOW_ABNORMAL_TEMP};
use crate::voter::*;
use crate::work::{earliest, DelayedWork};
use crate::ChgError;

/// Capacity of the diagnostic track message
pub const DEEP_INFO_LEN: usize = 1023;
pub const DUMP_INFO_LEN: usize = 256;

const DETECT_PERIOD_MS: u64 = 5000;
const TEMP_PERIOD_MS: u64 = 5000;
const CHECK_DELAY_MS: u64 = 2000;
/// Any vote at this level is outside the valid window and never applied
const READY_VOLTAGE_MV: i32 = INVALID_MAX_VOLTAGE;
/// The IC algorithm term voltage is only followed below this ui soc
const ALG_TERM_SOC_MAX: i32 = 15;
const SPARE_POWER_SOC_MAX: i32 = 5;
const SPARE_POWER_TEMP_MIN: i32 = 250;
const SPARE_POWER_TEMP_MAX: i32 = 400;
/// Stand-in for a gauge value that could not be read
const READ_FAILED: i32 = -22;

/// Battery pack a per-pack operation applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pack {
    Main,
    Sub,
}

impl Pack {
    pub fn topic(self) -> &'static str {
        match self {
            Self::Main => topics::GAUGE,
            Self::Sub => topics::SUB_GAUGE,
        }
    }
}

#[derive(Default)]
struct Works {
    dischg: DelayedWork,
    sub_dischg: DelayedWork,
    ratio: DelayedWork,
    temp: DelayedWork,
    track: DelayedWork,
    sub_track: DelayedWork,
    id: DelayedWork,
    term_check: DelayedWork,
    spare_check: DelayedWork,
}

impl Works {
    fn all(&self) -> [&DelayedWork; 9] {
        [
            &self.dischg,
            &self.sub_dischg,
            &self.ratio,
            &self.temp,
            &self.track,
            &self.sub_track,
            &self.id,
            &self.term_check,
            &self.spare_check,
        ]
    }
}

pub struct Sili<G: GaugeIc> {
    gauges: Vec<G, GAUGE_IC_NUM_MAX>,
    sub_gauge: Option<usize>,
    spec: DeepSpecConfig,
    ddrc: DdrcStrategy,
    ddrc_tbatt: TempClassifier,
    ddbc_tbatt: TempClassifier,
    shutdown: Votable,
    term: Votable,

    counts: i32,
    sub_counts: i32,
    cc: i32,
    sub_cc: i32,
    ratio: i32,
    sub_ratio: i32,

    ui_soc: i32,
    wired_online: bool,
    wls_online: bool,
    super_endurance: bool,
    sili_err: bool,
    dsg_enable: bool,
    alg_term_volt: i32,
    spare_power_enable: bool,
    first_record: bool,

    dischg_cnts: i32,
    sub_dischg_cnts: i32,
    limiter: UploadLimiter,
    sub_limiter: UploadLimiter,
    track_msg: String<DEEP_INFO_LEN>,
    id_info: String<DUMP_INFO_LEN>,

    works: Works,
    subscribers: Vec<SubscriberId, 4>,
}

fn bus_int(bus: &Bus, topic: &str, item: u32, fallback: i32) -> i32 {
    bus.item_int(topic, item).unwrap_or_else(|e| {
        debug!("{} item {} unavailable: {}", topic, item, e);
        fallback
    })
}

fn publish(bus: &mut Bus, topic: &str, msg: Msg<'_>) {
    if let Err(e) = bus.publish_to(topic, msg) {
        error!("publish {} item {} error: {}", topic, msg.item, e);
    }
}

/// Moves `now` toward `target` by at most `step`
fn step_toward(now: i32, target: i32, step: i32) -> i32 {
    if target > now {
        if target - now > step {
            now + step
        } else {
            target
        }
    } else if now - target > step {
        now - step
    } else {
        target
    }
}

/// Highest curve entry whose calibrated count the coulomb count has reached. Returns the
/// entry index and, when one matched, its calibrated count.
fn curve_index(data: &[DdrcPoint], cc: i32, count_cali: i32) -> (usize, Option<i32>) {
    if !cc_valid(cc) {
        return (0, Some(0));
    }

    for i in (1..data.len()).rev() {
        let counts = (data[i].count - count_cali).max(0);
        if cc >= counts {
            return (i, Some(counts));
        }
    }
    (0, None)
}

impl<G: GaugeIc> Sili<G> {
    /// Gauge 0 is the main IC; a second gauge is the sub pack
    pub fn new(spec: DeepSpecConfig, ddrc: DdrcStrategy, gauges: Vec<G, GAUGE_IC_NUM_MAX>) -> Self {
        let sub_gauge = if gauges.len() >= 2 { Some(1) } else { None };

        Self {
            sub_gauge,
            ddrc_tbatt: TempClassifier::new(spec.ddrc.range, spec.ddrc.temp_type),
            ddbc_tbatt: TempClassifier::new(spec.ddbc.range, spec.ddbc.temp_type),
            gauges,
            spec,
            ddrc,
            shutdown: Votable::new(GAUGE_SHUTDOWN_VOLTAGE_VOTABLE, VoteRule::Max),
            term: Votable::new(GAUGE_TERM_VOLTAGE_VOTABLE, VoteRule::Max),
            counts: 0,
            sub_counts: 0,
            cc: 0,
            sub_cc: 0,
            ratio: 0,
            sub_ratio: 0,
            ui_soc: 0,
            wired_online: false,
            wls_online: false,
            super_endurance: false,
            sili_err: false,
            dsg_enable: false,
            alg_term_volt: 0,
            spare_power_enable: false,
            first_record: true,
            dischg_cnts: 0,
            sub_dischg_cnts: 0,
            limiter: UploadLimiter::new(),
            sub_limiter: UploadLimiter::new(),
            track_msg: String::new(),
            id_info: String::new(),
            works: Works::default(),
            subscribers: Vec::new(),
        }
    }

    pub fn load<S: PropertySource>(src: &S, gauges: Vec<G, GAUGE_IC_NUM_MAX>) -> Self {
        Self::new(DeepSpecConfig::load(src), DdrcStrategy::load(src), gauges)
    }

    /// Subscribes to every input topic already registered on the bus
    pub fn subscribe(&mut self, bus: &mut Bus) -> Result<(), BusError> {
        for name in [topics::GAUGE, topics::COMMON, topics::WIRED, topics::WIRELESS] {
            let Some(topic) = bus.topic(name) else {
                warn!("{} topic not found", name);
                continue;
            };
            let subscriber = bus.subscribe(topic)?;
            self.subscribers
                .push(subscriber)
                .map_err(|_| BusError::TooManySubscribers)?;
        }
        Ok(())
    }

    pub fn is_subscriber(&self, subscriber: SubscriberId) -> bool {
        self.subscribers.contains(&subscriber)
    }

    pub fn gauges(&self) -> &[G] {
        &self.gauges
    }

    pub fn gauges_mut(&mut self) -> &mut [G] {
        &mut self.gauges
    }

    pub fn support(&self) -> bool {
        self.spec.support
    }

    pub fn limits(&self) -> &DeepDischgLimits {
        &self.spec.limits
    }

    pub fn counts(&self) -> (i32, i32) {
        (self.counts, self.sub_counts)
    }

    pub fn ratio(&self) -> i32 {
        self.ratio
    }

    pub fn sub_ratio(&self) -> i32 {
        self.sub_ratio
    }

    pub fn ratio_trange(&self) -> TempRegion {
        self.ddrc_tbatt.index_n
    }

    pub fn spare_power_enable(&self) -> bool {
        self.spare_power_enable
    }

    pub fn sili_err(&self) -> bool {
        self.sili_err
    }

    pub fn shutdown_votable(&self) -> &Votable {
        &self.shutdown
    }

    pub fn term_votable(&self) -> &Votable {
        &self.term
    }

    pub fn id_info(&self) -> &str {
        &self.id_info
    }

    fn charging(&self) -> bool {
        self.wired_online || self.wls_online
    }

    /// Count shown to the host. Parallel packs report the larger one.
    pub fn show_deep_dischg_count(&self) -> i32 {
        if !self.spec.support {
            return GAUGE_INVALID_DEEP_DICHG_COUNT;
        }
        if self.sub_gauge.is_some() {
            return self.counts.max(self.sub_counts);
        }
        self.counts
    }

    pub fn count_cali(&self) -> i32 {
        self.spec.limits.count_cali
    }

    /// Ratio threshold, or -10 when deep discharge is unsupported
    pub fn ratio_thr(&self) -> i32 {
        if !self.spec.support {
            return -GAUGE_INVALID_DEEP_DICHG_COUNT;
        }
        self.spec.limits.ratio_default
    }

    async fn read_count(&mut self, index: usize) -> i32 {
        let Some(gauge) = self.gauges.get_mut(index) else {
            return GAUGE_INVALID_DEEP_DICHG_COUNT;
        };

        match gauge.deep_dischg_count().await {
            Ok(count) => count,
            Err(e) => {
                log_ic_error(index, IcFunc::GetDeepDischgCount, &e);
                GAUGE_INVALID_DEEP_DICHG_COUNT
            }
        }
    }

    async fn main_deep_term_volt(&mut self) -> i32 {
        let Some(gauge) = self.gauges.first_mut() else {
            return READ_FAILED;
        };

        match gauge.deep_term_volt().await {
            Ok(volt) => volt,
            Err(e) => {
                log_ic_error(0, IcFunc::GetDeepTermVolt, &e);
                READ_FAILED
            }
        }
    }

    async fn main_last_cc(&mut self) -> i32 {
        let Some(gauge) = self.gauges.first_mut() else {
            return READ_FAILED;
        };

        match gauge.last_cc().await {
            Ok(cc) => cc,
            Err(e) => {
                log_ic_error(0, IcFunc::GetLastCc, &e);
                READ_FAILED
            }
        }
    }

    async fn set_main_last_cc(&mut self, cc: i32) {
        if let Some(gauge) = self.gauges.first_mut() {
            if let Err(e) = gauge.set_last_cc(cc).await {
                log_ic_error(0, IcFunc::SetLastCc, &e);
            }
        }
    }

    async fn main_batt_id_info(&mut self) -> i32 {
        let Some(gauge) = self.gauges.first_mut() else {
            return -1;
        };

        match gauge.batt_id_info().await {
            Ok(id) => id,
            Err(e) => {
                log_ic_error(0, IcFunc::GetBattIdInfo, &e);
                -1
            }
        }
    }

    async fn write_deep_term_volt(&mut self, volt: i32) {
        for (i, gauge) in self.gauges.iter_mut().enumerate() {
            if let Err(e) = gauge.set_deep_term_volt(volt).await {
                log_ic_error(i, IcFunc::SetDeepTermVolt, &e);
            }
        }
    }

    async fn write_alg_cfg(&mut self, cfg: u32) {
        for (i, gauge) in self.gauges.iter_mut().enumerate() {
            if let Err(e) = gauge.set_sili_ic_alg_cfg(cfg).await {
                log_ic_error(i, IcFunc::SetSiliIcAlgCfg, &e);
            }
        }
    }

    async fn write_alg_term_volt(&mut self, volt: i32) {
        for (i, gauge) in self.gauges.iter_mut().enumerate() {
            if let Err(e) = gauge.set_sili_ic_alg_term_volt(volt).await {
                log_ic_error(i, IcFunc::SetSiliIcAlgTermVolt, &e);
            }
        }
    }

    /// Highest algorithm term voltage any IC reports, 0 when none does
    async fn read_alg_term_volt(&mut self) -> i32 {
        let mut volt = 0;
        for (i, gauge) in self.gauges.iter_mut().enumerate() {
            match gauge.sili_ic_alg_term_volt().await {
                Ok(v) => volt = volt.max(v),
                Err(e) => log_ic_error(i, IcFunc::GetSiliIcAlgTermVolt, &e),
            }
        }
        volt
    }

    async fn read_dsg_enable(&mut self) {
        let Some(gauge) = self.gauges.first_mut() else {
            return;
        };

        match gauge.sili_ic_alg_dsg_enable().await {
            Ok(enable) => self.dsg_enable = enable,
            Err(e) => log_ic_error(0, IcFunc::GetSiliIcAlgDsgEnable, &e),
        }
    }

    async fn write_spare_power(&mut self) {
        let mut ok = true;
        for (i, gauge) in self.gauges.iter_mut().enumerate() {
            if let Err(e) = gauge.set_sili_spare_power().await {
                log_ic_error(i, IcFunc::SetSiliSparePower, &e);
                ok = false;
                break;
            }
        }
        self.spare_power_enable = ok;
    }

    fn apply_shutdown(&mut self, election: Election, bus: &mut Bus) {
        let Some(volt) = election.value else {
            return;
        };
        if !self.spec.support {
            return;
        }
        if !voltage_valid(volt) {
            info!("volt {} invalid, client {}", volt, election.client);
            return;
        }

        info!("shutdown voltage vote client {}, volt = {}", election.client, volt);
        self.spec.limits.uv_thr = volt;
        publish(bus, topics::GAUGE, Msg::int(MsgPrio::High, GAUGE_ITEM_VBAT_UV, volt));
    }

    async fn apply_term(&mut self, election: Election, bus: &mut Bus, now_ms: u64) {
        let Some(volt) = election.value else {
            return;
        };
        if !self.spec.support {
            return;
        }
        if !voltage_valid(volt) {
            info!("volt {} invalid, client {}", volt, election.client);
            return;
        }

        let current = self.main_deep_term_volt().await;
        if let Some(row) = self.spec.term_coeff(volt).copied() {
            self.spec.limits.current_fcc_coeff = row.fcc_coeff;
            self.spec.limits.current_soh_coeff = row.soh_coeff;
        }

        let limits = &self.spec.limits;
        publish(bus, topics::GAUGE, Msg::int(MsgPrio::Medium, GAUGE_ITEM_FCC_COEFF, limits.current_fcc_coeff));
        publish(bus, topics::GAUGE, Msg::int(MsgPrio::Medium, GAUGE_ITEM_SOH_COEFF, limits.current_soh_coeff));

        info!("term voltage vote client {}, volt = {}", election.client, volt);
        self.spec.limits.term_voltage = volt;
        if current != volt || election.step {
            self.write_deep_term_volt(volt).await;
            self.works.term_check.reschedule(now_ms, CHECK_DELAY_MS);
        }
    }

    fn vote_shutdown(&mut self, bus: &mut Bus, client: &'static str, enabled: bool, value: i32) {
        match self.shutdown.vote(client, enabled, value, false) {
            Ok(Some(election)) => self.apply_shutdown(election, bus),
            Ok(None) => {}
            Err(e) => error!("{}: {} vote error {}", self.shutdown.name(), client, e),
        }
    }

    async fn vote_term(
        &mut self,
        bus: &mut Bus,
        now_ms: u64,
        client: &'static str,
        enabled: bool,
        value: i32,
        step: bool,
    ) {
        match self.term.vote(client, enabled, value, step) {
            Ok(Some(election)) => self.apply_term(election, bus, now_ms).await,
            Ok(None) => {}
            Err(e) => error!("{}: {} vote error {}", self.term.name(), client, e),
        }
    }

    fn vote_super_endurance(&mut self, bus: &mut Bus) {
        let term_voltage = self.spec.limits.term_voltage;
        self.vote_shutdown(bus, SUPER_ENDURANCE_MODE_VOTER, !self.super_endurance, term_voltage);
    }

    /// Votes one `(term, shutdown)` pair in the fixed order the votables expect
    async fn vote_deep_count(&mut self, bus: &mut Bus, now_ms: u64, vterm: i32, vshut: i32) {
        self.vote_term(bus, now_ms, DEEP_COUNT_VOTER, true, vterm, false).await;
        self.vote_super_endurance(bus);
        self.vote_shutdown(bus, DEEP_COUNT_VOTER, true, vshut);
    }

    fn update_ratio(&mut self, pack: Pack, bus: &Bus) {
        let cc = bus_int(bus, pack.topic(), GAUGE_ITEM_CC, 0);

        match pack {
            Pack::Main => {
                self.cc = cc;
                self.ratio = dischg_ratio(self.counts, cc);
            }
            Pack::Sub => {
                self.sub_cc = cc;
                self.sub_ratio = dischg_ratio(self.sub_counts, cc);
            }
        }
    }

    /// Re-resolves the voltage targets of `pack` from its coulomb count and votes them,
    /// stepping by at most `volt_step` unless a direct jump is allowed
    async fn resolve_ddrc(&mut self, pack: Pack, bus: &mut Bus, now_ms: u64) {
        if !self.spec.support {
            return;
        }
        if pack == Pack::Sub && self.sub_gauge.is_none() {
            return;
        }

        self.update_ratio(pack, bus);
        let cc = match pack {
            Pack::Main => self.cc,
            Pack::Sub => self.sub_cc,
        };

        let region = self.ddrc.temp_region(Some(self.ddrc_tbatt.index_n), 0);
        let curve = self.ddrc.select(self.ratio, region);
        if curve.data.is_empty() {
            return;
        }

        let (index_cc, count_thr) = curve_index(curve.data, cc, self.spec.limits.count_cali);
        let point = curve.data[index_cc];
        let (curve_r, curve_t) = (curve.index_r, curve.index_t);
        if let Some(thr) = count_thr {
            self.spec.limits.count_thr = thr;
        }

        let vterm = point.vbat1;
        let vshut = point.vbat0;
        let current_volt = self.main_deep_term_volt().await;
        let current_shut = match self.shutdown.client_vote(DEEP_COUNT_VOTER) {
            Some(v) if v > 0 => v,
            _ => vshut + current_volt - vterm,
        };

        self.track_msg.clear();
        let _ = write!(
            self.track_msg,
            "$$track_reason@@vote$$temp_p@@{}$$temp_n@@{}$$ratio_p@@{}$$ratio_n@@{}$$vstep@@{}\
             $$vterm_final@@{}$$term_now@@{}$$index@@{}",
            self.ddrc_tbatt.index_p as i32,
            self.ddrc_tbatt.index_n as i32,
            self.spec.limits.index_r,
            curve_r as i32,
            self.spec.limits.volt_step,
            vterm,
            current_volt,
            index_cc
        );

        let mut last_cc = 0;
        let (mut update_vterm, mut update_vshut) = (0, 0);
        if current_volt != vterm {
            last_cc = self.main_last_cc().await;

            if last_cc <= 0 || self.spec.limits.step_status || cc < last_cc {
                update_vterm = vterm;
                update_vshut = vshut;
                self.set_main_last_cc(cc).await;
                self.vote_deep_count(bus, now_ms, vterm, vshut).await;
            } else if cc >= last_cc + DEEP_DISCHG_UPDATE_CC_DELTA {
                self.set_main_last_cc(cc).await;

                let step = self.spec.limits.volt_step;
                update_vterm = step_toward(current_volt, vterm, step);
                update_vshut = step_toward(current_shut, vshut, step);
                if update_vterm == vterm {
                    update_vshut = vshut;
                }
                self.vote_deep_count(bus, now_ms, update_vterm, update_vshut).await;
            } else {
                self.vote_deep_count(bus, now_ms, current_volt, current_shut).await;
            }
        } else {
            self.vote_deep_count(bus, now_ms, vterm, vshut).await;
        }

        info!(
            "{}: [{}, {}][{}, {}, {}, {}] [{}, {}, {}, {}, {}]",
            pack,
            update_vterm,
            update_vshut,
            vterm,
            current_volt,
            vshut,
            current_shut,
            last_cc,
            cc,
            self.counts,
            self.ratio,
            self.spec.limits.step_status
        );

        self.spec.limits.index_r = curve_r as i32;
        self.spec.limits.index_t = curve_t as i32;
        self.spec.limits.step_status = false;
    }

    async fn resolve_all(&mut self, bus: &mut Bus, now_ms: u64) {
        self.resolve_ddrc(Pack::Main, bus, now_ms).await;
        if self.sub_gauge.is_some() {
            self.resolve_ddrc(Pack::Sub, bus, now_ms).await;
        }
    }

    /// Stores a new count and persists it. A main-pack count is written to every IC.
    pub async fn set_deep_dischg_count(&mut self, pack: Pack, count: i32) -> Result<(), ChgError<G::Error>> {
        if !self.spec.support {
            return Err(IcError::NotSupported.into());
        }
        if count < 0 {
            return Err(IcError::InvalidArg.into());
        }

        let mut result = Ok(());
        match pack {
            Pack::Main => {
                self.counts = count;
                self.sub_counts = count;
                for (i, gauge) in self.gauges.iter_mut().enumerate() {
                    if let Err(e) = gauge.set_deep_dischg_count(count).await {
                        log_ic_error(i, IcFunc::SetDeepDischgCount, &e);
                        result = Err(e.into());
                    }
                }
            }
            Pack::Sub => {
                let Some(index) = self.sub_gauge else {
                    return Err(IcError::NotSupported.into());
                };
                self.sub_counts = count;
                if let Some(gauge) = self.gauges.get_mut(index) {
                    if let Err(e) = gauge.set_deep_dischg_count(count).await {
                        log_ic_error(index, IcFunc::SetDeepDischgCount, &e);
                        result = Err(e.into());
                    }
                }
            }
        }

        info!("{} deep dischg count = {}", pack, count);
        result
    }

    /// Detection commit. With parallel packs a main-pack count only touches the main IC.
    async fn commit_count(&mut self, pack: Pack, count: i32) -> Result<(), ChgError<G::Error>> {
        if pack == Pack::Sub || self.sub_gauge.is_none() {
            return self.set_deep_dischg_count(pack, count).await;
        }

        self.counts = count;
        let mut result = Ok(());
        if let Some(gauge) = self.gauges.first_mut() {
            if let Err(e) = gauge.set_deep_dischg_count(count).await {
                log_ic_error(0, IcFunc::SetDeepDischgCount, &e);
                result = Err(e.into());
            }
        }
        info!("{} deep dischg count = {}", pack, count);
        result
    }

    pub async fn set_count_cali(&mut self, val: i32, bus: &mut Bus, now_ms: u64) -> Result<(), ChgError<G::Error>> {
        if !self.spec.support {
            return Err(IcError::NotSupported.into());
        }
        if val < 0 {
            return Err(IcError::InvalidArg.into());
        }

        self.spec.limits.count_cali = val;
        if !self.charging() {
            self.spec.limits.step_status = true;
            self.resolve_all(bus, now_ms).await;
        }
        info!("count_cali = {}", val);
        Ok(())
    }

    pub async fn set_ratio_thr(&mut self, ratio: i32, bus: &mut Bus, now_ms: u64) -> Result<(), ChgError<G::Error>> {
        if !self.spec.support {
            return Err(IcError::NotSupported.into());
        }
        if !(0..=100).contains(&ratio) {
            error!("ratio({}) invalid", ratio);
            return Err(IcError::InvalidArg.into());
        }

        let limits = &mut self.spec.limits;
        limits.ratio_default = ratio;
        limits.ratio_shake = ratio;
        limits.ratio_status = false;
        if !self.charging() {
            self.spec.limits.step_status = true;
            self.resolve_all(bus, now_ms).await;
        }
        info!("ratio_default = {}", ratio);
        Ok(())
    }

    /// Charging state input. Re-evaluates whether detection should run.
    pub fn set_online(&mut self, wired: bool, wireless: bool, bus: &Bus, now_ms: u64) {
        self.wired_online = wired;
        self.wls_online = wireless;
        self.deep_dischg_check(bus, now_ms);
    }

    /// Arms detection while discharging above the start soc, cancels it otherwise
    pub fn deep_dischg_check(&mut self, bus: &Bus, now_ms: u64) {
        self.ui_soc = bus_int(bus, topics::COMMON, COMM_ITEM_UI_SOC, 0);
        if !self.spec.support {
            return;
        }

        if !self.charging() && self.ui_soc >= self.spec.limits.soc {
            self.works.dischg.schedule(now_ms, 0);
            if self.sub_gauge.is_some() {
                self.works.sub_dischg.schedule(now_ms, 0);
            }
            self.works.ratio.schedule(now_ms, 0);
        } else {
            self.works.dischg.cancel();
            self.works.sub_dischg.cancel();
        }
    }

    fn deep_temperature(bus: &Bus, temp_type: TempType) -> i32 {
        let (topic, item) = match temp_type {
            TempType::Battery => (topics::GAUGE, GAUGE_ITEM_TEMP),
            TempType::Shell => (topics::COMMON, COMM_ITEM_SHELL_TEMP),
        };

        bus.item_int(topic, item).unwrap_or_else(|e| {
            warn!("can't get {} temp: {}", temp_type, e);
            GAUGE_LOW_ABNORMAL_TEMP
        })
    }

    /// One detection sample for `pack`. Commits a count once the low-current condition
    /// held for `ctime` consecutive samples.
    async fn update_deep_dischg(&mut self, pack: Pack, bus: &mut Bus, now_ms: u64) {
        if self.charging() {
            match pack {
                Pack::Main => self.dischg_cnts = 0,
                Pack::Sub => self.sub_dischg_cnts = 0,
            }
            return;
        }

        let topic = pack.topic();
        let ui_soc = bus_int(bus, topics::COMMON, COMM_ITEM_UI_SOC, 0);
        self.ui_soc = ui_soc;
        let vbat_min_mv = bus_int(bus, topic, GAUGE_ITEM_VOL_MIN, 0);
        let batt_temp = bus_int(bus, topic, GAUGE_ITEM_TEMP, 0);
        let ibat_ma = bus_int(bus, topic, GAUGE_ITEM_CURR, 0);

        let step = self.spec.count_step(batt_temp);
        let region = self.ddbc_tbatt.index_n;
        let matched = self
            .spec
            .low_current_match(region, ibat_ma, vbat_min_mv)
            .map(|limit| limit.ctime);

        let cnts = match pack {
            Pack::Main => &mut self.dischg_cnts,
            Pack::Sub => &mut self.sub_dischg_cnts,
        };
        let committed = match matched {
            Some(ctime) => {
                *cnts += 1;
                if *cnts >= ctime {
                    *cnts = 0;
                    true
                } else {
                    false
                }
            }
            None => {
                *cnts = 0;
                false
            }
        };

        debug!(
            "{}: [{}, {}, {}, {}] region {} match {} commit {}",
            pack,
            ui_soc,
            vbat_min_mv,
            batt_temp,
            ibat_ma,
            region,
            matched.is_some(),
            committed
        );

        if !committed {
            let work = match pack {
                Pack::Main => &mut self.works.dischg,
                Pack::Sub => &mut self.works.sub_dischg,
            };
            work.reschedule(now_ms, DETECT_PERIOD_MS);
            return;
        }

        let count = match pack {
            Pack::Main => self.counts,
            Pack::Sub => self.sub_counts,
        } + step;
        if self.commit_count(pack, count).await.is_err() {
            warn!("{} count {} not persisted", pack, count);
        }
        self.update_ratio(pack, bus);

        self.track_msg.clear();
        let _ = write!(self.track_msg, "$$track_reason@@deep_dischg$$trange@@{}", region as i32);
        match pack {
            Pack::Main => self.works.track.schedule(now_ms, 0),
            Pack::Sub => self.works.sub_track.schedule(now_ms, 0),
        };
    }

    async fn deep_ratio_work(&mut self, bus: &mut Bus, now_ms: u64) {
        let index_n = self.ddrc_tbatt.index_n;
        let index_p = self.ddrc_tbatt.index_p;
        let crossed = (index_n >= TempRegion::Normal) != (index_p >= TempRegion::Normal);

        if crossed {
            self.spec.limits.step_status = true;
            self.resolve_all(bus, now_ms).await;
            self.ddrc_tbatt.index_p = index_n;
        } else if index_n >= TempRegion::Normal {
            self.resolve_all(bus, now_ms).await;
            self.ddrc_tbatt.index_p = index_n;
        }

        self.works.track.schedule(now_ms, 0);
    }

    async fn deep_temp_work(&mut self, bus: &mut Bus, now_ms: u64) {
        if !self.spec.support {
            return;
        }

        let tratio = Self::deep_temperature(bus, self.ddrc_tbatt.temp_type);
        let tcurve = Self::deep_temperature(bus, self.ddbc_tbatt.temp_type);

        match self.ddrc_tbatt.sample(tratio) {
            RegionSample::Stable(now) => {
                if self.ddrc_tbatt.index_n < TempRegion::Normal
                    && self.ddrc_tbatt.index_p > now
                    && !self.charging()
                    && self.ui_soc < self.spec.limits.soc
                {
                    self.spec.limits.step_status = true;
                    self.resolve_all(bus, now_ms).await;
                    self.ddrc_tbatt.index_p = now;
                }
            }
            RegionSample::Committed { pre, now } => info!("ddrc region {} -> {}", pre, now),
            RegionSample::Pending(_) => {}
        }

        if let RegionSample::Committed { pre, now } = self.ddbc_tbatt.sample(tcurve) {
            info!("ddbc region {} -> {}", pre, now);
        }

        self.works.temp.schedule(now_ms, TEMP_PERIOD_MS);
    }

    fn upload(&mut self, pack: Pack, bus: &mut Bus, now_ms: u64) {
        let limiter = match pack {
            Pack::Main => &mut self.limiter,
            Pack::Sub => &mut self.sub_limiter,
        };
        if !limiter.try_acquire(now_ms / 1000) {
            return;
        }

        if bus.topic(topics::ERROR).is_none() {
            error!("error topic not found");
            return;
        }
        publish(
            bus,
            topics::ERROR,
            Msg::str(MsgPrio::Medium, ERR_ITEM_DEEP_DISCHG_INFO, &self.track_msg),
        );
        limiter.uploaded();
    }

    async fn deep_track_work(&mut self, pack: Pack, bus: &mut Bus, now_ms: u64) {
        let topic = pack.topic();
        let vbat_min_mv = bus_int(bus, topic, GAUGE_ITEM_VOL_MIN, 0);
        let batt_temp = bus_int(bus, topic, GAUGE_ITEM_TEMP, 0);
        let ibat_ma = bus_int(bus, topic, GAUGE_ITEM_CURR, 0);
        let term_volt = self.term.effective_result().unwrap_or(READ_FAILED);
        let ui_soc = bus_int(bus, topics::COMMON, COMM_ITEM_UI_SOC, 0);
        let limits = self.spec.limits;

        match pack {
            Pack::Main => {
                let bybid = bus_int(bus, topics::WIRED, WIRED_ITEM_BYB_ID_INFO, GPIO_STATUS_NOT_SUPPORT);
                let batt_id = self.main_batt_id_info().await;
                let _ = write!(
                    self.track_msg,
                    "$$dischg_counts@@{}$$count_thr@@{}$$count_cali@@{}$$cc@@{}$$ratio@@{}\
                     $$vbat_uv@@{}$$vterm@@{}$$vbat_min@@{}$$tbat@@{}$$ui_soc@@{}$$ibat_ma@@{}\
                     $$bybid@@{}$$batt_id@@{}$$sili_err@@{}",
                    self.counts,
                    limits.count_thr,
                    limits.count_cali,
                    self.cc,
                    self.ratio,
                    limits.uv_thr,
                    term_volt,
                    vbat_min_mv,
                    batt_temp,
                    ui_soc,
                    ibat_ma,
                    bybid,
                    batt_id,
                    self.sili_err as i32
                );
            }
            Pack::Sub => {
                let _ = write!(
                    self.track_msg,
                    "$$sub_dischg_counts@@{}$$count_thr@@{}$$count_cali@@{}$$sub_cc@@{}$$sub_ratio@@{}\
                     $$vbat_uv@@{}$$vterm@@{}$$vbat_min@@{}$$tbat@@{}$$ui_soc@@{}$$ibat_ma@@{}\
                     $$bybid@@{}$$batt_id@@{}$$sili_err@@{}",
                    self.sub_counts,
                    limits.count_thr,
                    limits.count_cali,
                    self.sub_cc,
                    self.sub_ratio,
                    limits.uv_thr,
                    term_volt,
                    vbat_min_mv,
                    batt_temp,
                    ui_soc,
                    ibat_ma,
                    0,
                    0,
                    self.sili_err as i32
                );
            }
        }

        if let Some(topic_id) = bus.topic(topic) {
            if let Ok(ItemData::Str(info)) = bus.item_data(topic_id, GAUGE_ITEM_REG_INFO) {
                if !info.is_empty() {
                    let tag = match pack {
                        Pack::Main => "maingaugeinfo",
                        Pack::Sub => "subgaugeinfo",
                    };
                    let _ = write!(self.track_msg, "$${}@@{}", tag, info);
                }
            }
        }

        self.upload(pack, bus, now_ms);
        self.track_msg.clear();
    }

    async fn init_sili_status(&mut self, bus: &Bus) {
        let byb_match = bus_int(bus, topics::WIRED, WIRED_ITEM_BYB_ID_MATCH_INFO, id_match::IGNORE);
        let batt_match = match self.gauges.first_mut() {
            Some(gauge) => match gauge.batt_id_match_info().await {
                Ok(status) => status,
                Err(e) => {
                    log_ic_error(0, IcFunc::GetBattIdMatchInfo, &e);
                    id_match::IGNORE
                }
            },
            None => id_match::IGNORE,
        };

        self.sili_err = byb_match == id_match::NOT_MATCH && batt_match == id_match::SILI;

        let bybid = bus_int(bus, topics::WIRED, WIRED_ITEM_BYB_ID_INFO, GPIO_STATUS_NOT_SUPPORT);
        let batt_id = self.main_batt_id_info().await;

        self.id_info.clear();
        let _ = write!(
            self.id_info,
            "$$deep_support@@{}$$byb_id@@{}$$batt_id@@{}$$sili_err@@{}$$counts@@{}$$uv_thr@@{}",
            self.spec.support as i32,
            bybid,
            batt_id,
            self.sili_err as i32,
            self.counts,
            self.spec.limits.uv_thr
        );

        info!(
            "[{}, {}, {}, {}, {}, {}]",
            byb_match,
            batt_match,
            bybid,
            batt_id,
            self.sili_err,
            self.spec.support
        );
    }

    /// Brings the votables up: READY holds both above the valid window while the persisted
    /// counts are read and the first targets are resolved, then steps aside.
    pub async fn init(&mut self, bus: &mut Bus, now_ms: u64) {
        if !self.spec.support {
            return;
        }

        let uv_thr = self.spec.limits.uv_thr;
        self.vote_shutdown(bus, READY_VOTER, true, READY_VOLTAGE_MV);
        self.vote_term(bus, now_ms, READY_VOTER, true, READY_VOLTAGE_MV, false).await;
        self.vote_shutdown(bus, SPEC_VOTER, true, uv_thr);

        self.counts = self.read_count(0).await;
        if let Some(index) = self.sub_gauge {
            self.sub_counts = self.read_count(index).await;
        }

        let tratio = Self::deep_temperature(bus, self.ddrc_tbatt.temp_type);
        let tcurve = Self::deep_temperature(bus, self.ddbc_tbatt.temp_type);
        self.ddrc_tbatt.index_p = self.ddrc_tbatt.reset(tratio);
        self.ddbc_tbatt.reset(tcurve);
        self.resolve_all(bus, now_ms).await;

        self.vote_term(bus, now_ms, READY_VOTER, false, 0, false).await;
        self.vote_super_endurance(bus);
        self.vote_shutdown(bus, READY_VOTER, false, 0);

        self.works.temp.schedule(now_ms, TEMP_PERIOD_MS);
    }

    /// Configures the IC discharge algorithm from the configured bit list
    pub async fn alg_cfg_init(&mut self, bus: &mut Bus, now_ms: u64) {
        if !self.spec.sili_ic_alg_support {
            return;
        }

        let mask = self.spec.sili_alg_cfg_mask();
        self.write_alg_cfg(mask).await;
        self.read_dsg_enable().await;
        if self.dsg_enable {
            self.vote_shutdown(bus, READY_VOTER, true, READY_VOLTAGE_MV);
            self.vote_term(bus, now_ms, READY_VOTER, true, READY_VOLTAGE_MV, false).await;
        }
        info!("alg_cfg = {}, dsg_enable = {}", mask, self.dsg_enable);
    }

    pub async fn deep_dischg_init(&mut self, bus: &mut Bus, now_ms: u64) {
        self.deep_dischg_check(bus, now_ms);
        self.init_sili_status(bus).await;
        if self.spec.support {
            self.works.id.schedule(now_ms, PUSH_DELAY_MS);
        }
    }

    /// Follows the IC algorithm's term voltage at low soc, only ever lowering it unless
    /// forced or on the first reading after soc dropped below the limit
    async fn update_alg_term_volt(&mut self, force: bool, bus: &mut Bus) {
        if !self.dsg_enable {
            return;
        }
        if self.ui_soc >= ALG_TERM_SOC_MAX {
            self.first_record = true;
            return;
        }
        if self.spec.limits.term_voltage == 0 || !self.term.is_client_vote_enabled(READY_VOTER) {
            return;
        }

        let volt = self.read_alg_term_volt().await;
        if volt != 0 && (force || self.first_record || self.alg_term_volt == 0 || self.alg_term_volt > volt) {
            self.alg_term_volt = volt;
            self.write_alg_term_volt(volt).await;
            self.spec.limits.uv_thr = if self.super_endurance {
                volt - SUPER_ENDURANCE_GAP_MV
            } else {
                volt
            };
            info!("uv_thr = {}", self.spec.limits.uv_thr);
            publish(
                bus,
                topics::GAUGE,
                Msg::int(MsgPrio::High, GAUGE_ITEM_VBAT_UV, self.spec.limits.uv_thr),
            );
        }
        self.first_record = false;
    }

    async fn super_endurance_work(&mut self, bus: &mut Bus) {
        if !self.spec.support {
            return;
        }
        if self.dsg_enable {
            self.update_alg_term_volt(true, bus).await;
        }
        self.vote_super_endurance(bus);
    }

    async fn alg_cfg_work(&mut self, bus: &mut Bus, now_ms: u64) {
        if !self.spec.support || !self.spec.sili_ic_alg_support {
            error!("sili ic alg not support");
            return;
        }

        let Ok(cfg) = bus.item_int(topics::GAUGE, GAUGE_ITEM_SILI_IC_ALG_CFG) else {
            return;
        };

        self.write_alg_cfg(cfg as u32).await;
        self.read_dsg_enable().await;
        if !self.dsg_enable {
            self.vote_term(bus, now_ms, READY_VOTER, false, 0, true).await;
            self.vote_super_endurance(bus);
            self.vote_shutdown(bus, READY_VOTER, false, 0);
            self.alg_term_volt = 0;
            self.write_alg_term_volt(0).await;
        } else {
            self.vote_shutdown(bus, READY_VOTER, true, READY_VOLTAGE_MV);
            self.vote_term(bus, now_ms, READY_VOTER, true, READY_VOLTAGE_MV, false).await;
        }
        info!("alg_cfg = {}, dsg_enable = {}", cfg, self.dsg_enable);
    }

    async fn spare_power_work(&mut self, bus: &Bus, now_ms: u64) {
        if !self.spec.support || !self.spec.spare_power_support || !self.dsg_enable {
            error!("spare power not support");
            return;
        }

        let enable = bus_int(bus, topics::GAUGE, GAUGE_ITEM_SPARE_POWER_ENABLE, 0) != 0;
        let temp = bus_int(bus, topics::GAUGE, GAUGE_ITEM_TEMP, 0);
        let soc = bus_int(bus, topics::GAUGE, GAUGE_ITEM_SOC, 0);
        info!("spare power request {}", enable);

        self.spare_power_enable = false;
        if temp > SPARE_POWER_TEMP_MIN && temp < SPARE_POWER_TEMP_MAX && self.ui_soc <= SPARE_POWER_SOC_MAX && soc != 0
        {
            self.write_spare_power().await;
            self.works.spare_check.reschedule(now_ms, CHECK_DELAY_MS);
        }
    }

    async fn spare_check_work(&mut self, now_ms: u64) {
        let volt = self.read_alg_term_volt().await;
        info!("ic alg term volt = {}", volt);

        if (self.spec.limits.spare_power_term_voltage - volt).abs() < TERM_VOLT_EFFECT_GAP_MV {
            info!("spare power set success");
        } else {
            self.write_spare_power().await;
            self.works.spare_check.schedule(now_ms, CHECK_DELAY_MS);
        }
    }

    async fn term_check_work(&mut self) {
        if self.dsg_enable {
            return;
        }

        let Some(gauge) = self.gauges.first_mut() else {
            return;
        };
        let simulate = match gauge.sili_simulate_term_volt().await {
            Ok(volt) => volt,
            Err(e) => {
                log_ic_error(0, IcFunc::GetSiliSimulateTermVolt, &e);
                return;
            }
        };

        let expect = self.spec.limits.term_voltage;
        info!("expect term voltage = {}, simulate volt = {}", expect, simulate);
        if (expect - simulate).abs() >= TERM_VOLT_EFFECT_GAP_MV {
            self.write_deep_term_volt(expect).await;
        }
    }

    fn id_work(&mut self, bus: &mut Bus) {
        publish(
            bus,
            topics::ERROR,
            Msg::str(MsgPrio::Medium, ERR_ITEM_BATT_ID, &self.id_info),
        );
    }

    /// Runs every work item whose deadline passed
    pub async fn poll(&mut self, bus: &mut Bus, now_ms: u64) {
        if self.works.dischg.take_due(now_ms) {
            self.update_deep_dischg(Pack::Main, bus, now_ms).await;
        }
        if self.works.sub_dischg.take_due(now_ms) {
            self.update_deep_dischg(Pack::Sub, bus, now_ms).await;
        }
        if self.works.ratio.take_due(now_ms) {
            self.deep_ratio_work(bus, now_ms).await;
        }
        if self.works.temp.take_due(now_ms) {
            self.deep_temp_work(bus, now_ms).await;
        }
        if self.works.track.take_due(now_ms) {
            self.deep_track_work(Pack::Main, bus, now_ms).await;
        }
        if self.works.sub_track.take_due(now_ms) {
            self.deep_track_work(Pack::Sub, bus, now_ms).await;
        }
        if self.works.id.take_due(now_ms) {
            self.id_work(bus);
        }
        if self.works.term_check.take_due(now_ms) {
            self.term_check_work().await;
        }
        if self.works.spare_check.take_due(now_ms) {
            self.spare_check_work(now_ms).await;
        }
    }

    pub fn next_deadline(&self) -> Option<u64> {
        earliest(self.works.all())
    }

    /// Handles one bus delivery. Deliveries for other subscribers are ignored.
    pub async fn handle(&mut self, delivery: Delivery, bus: &mut Bus, now_ms: u64) {
        if !self.is_subscriber(delivery.subscriber) {
            return;
        }
        let Some(topic) = bus.topic_name(delivery.topic) else {
            return;
        };

        match (topic, delivery.kind) {
            (topics::GAUGE, MsgType::Timer) => self.update_alg_term_volt(false, bus).await,
            (topics::GAUGE, MsgType::Item) => match delivery.item {
                GAUGE_ITEM_SPARE_POWER_ENABLE => self.spare_power_work(bus, now_ms).await,
                GAUGE_ITEM_SILI_IC_ALG_CFG => self.alg_cfg_work(bus, now_ms).await,
                _ => {}
            },
            (topics::COMMON, MsgType::Item) => match delivery.item {
                COMM_ITEM_UI_SOC => self.ui_soc = bus_int(bus, topics::COMMON, COMM_ITEM_UI_SOC, self.ui_soc),
                COMM_ITEM_SUPER_ENDURANCE_STATUS => {
                    self.super_endurance = bus_int(bus, topics::COMMON, COMM_ITEM_SUPER_ENDURANCE_STATUS, 0) != 0;
                    self.super_endurance_work(bus).await;
                }
                _ => {}
            },
            (topics::WIRED, MsgType::Item) if delivery.item == WIRED_ITEM_ONLINE => {
                let wired = bus_int(bus, topics::WIRED, WIRED_ITEM_ONLINE, 0) != 0;
                self.set_online(wired, self.wls_online, bus, now_ms);
            }
            (topics::WIRELESS, MsgType::Item) if delivery.item == WLS_ITEM_PRESENT => {
                let wireless = bus_int(bus, topics::WIRELESS, WLS_ITEM_PRESENT, 0) != 0;
                self.set_online(self.wired_online, wireless, bus, now_ms);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddrc::RatioRegion;
    use crate::deep_spec::DdbCurve;
    use crate::mms::MsgData;
    use embassy_futures::block_on;

    #[derive(Default)]
    struct FakeGauge {
        count: i32,
        term_volt: i32,
        last_cc: i32,
        alg_term_volt: i32,
        dsg_enable: bool,
        alg_cfg: u32,
        term_writes: u32,
    }

    impl GaugeIc for FakeGauge {
        type Error = ();

        async fn deep_dischg_count(&mut self) -> Result<i32, IcError<()>> {
            Ok(self.count)
        }

        async fn set_deep_dischg_count(&mut self, count: i32) -> Result<(), IcError<()>> {
            self.count = count;
            Ok(())
        }

        async fn deep_term_volt(&mut self) -> Result<i32, IcError<()>> {
            Ok(self.term_volt)
        }

        async fn set_deep_term_volt(&mut self, volt_mv: i32) -> Result<(), IcError<()>> {
            self.term_volt = volt_mv;
            self.term_writes += 1;
            Ok(())
        }

        async fn last_cc(&mut self) -> Result<i32, IcError<()>> {
            Ok(self.last_cc)
        }

        async fn set_last_cc(&mut self, cc: i32) -> Result<(), IcError<()>> {
            self.last_cc = cc;
            Ok(())
        }

        async fn set_sili_ic_alg_cfg(&mut self, cfg: u32) -> Result<(), IcError<()>> {
            self.alg_cfg = cfg;
            Ok(())
        }

        async fn sili_ic_alg_dsg_enable(&mut self) -> Result<bool, IcError<()>> {
            Ok(self.dsg_enable)
        }

        async fn sili_ic_alg_term_volt(&mut self) -> Result<i32, IcError<()>> {
            Ok(self.alg_term_volt)
        }

        async fn set_sili_ic_alg_term_volt(&mut self, volt_mv: i32) -> Result<(), IcError<()>> {
            self.alg_term_volt = volt_mv;
            Ok(())
        }
    }

    fn point(count: i32, vbat0: i32, vbat1: i32) -> DdrcPoint {
        DdrcPoint {
            count,
            vbat0,
            vbat1,
            index: 0,
        }
    }

    fn bus() -> Bus {
        let mut bus = Bus::new();
        for name in [topics::GAUGE, topics::COMMON, topics::WIRED, topics::WIRELESS, topics::ERROR] {
            bus.register_topic(name, None, 0).unwrap();
        }
        bus
    }

    fn set(bus: &mut Bus, topic: &str, item: u32, value: i32) {
        bus.set_item(topic, item, MsgData::Int(value)).unwrap();
    }

    fn sili(gauges: &[FakeGauge]) -> Sili<FakeGauge> {
        let mut spec = DeepSpecConfig::default();
        spec.support = true;

        let mut ddrc = DdrcStrategy::new([10, 20, 30, 40, 50], [0, 100, 250], TempType::Battery);
        ddrc.set_curve(
            RatioRegion::Min,
            TempRegion::Cold,
            &[point(0, 3000, 3400), point(100, 3200, 3600)],
        );

        let mut list = Vec::new();
        for g in gauges {
            let _ = list.push(FakeGauge {
                count: g.count,
                term_volt: g.term_volt,
                last_cc: g.last_cc,
                ..Default::default()
            });
        }
        Sili::new(spec, ddrc, list)
    }

    #[test]
    fn step_moves_by_volt_step_per_update() {
        let mut bus = bus();
        set(&mut bus, topics::GAUGE, GAUGE_ITEM_CC, 110);
        let mut sili = sili(&[FakeGauge {
            term_volt: 3800,
            last_cc: 100,
            ..Default::default()
        }]);

        block_on(sili.resolve_ddrc(Pack::Main, &mut bus, 0));
        assert_eq!(sili.term.effective_result(), Some(3700));
        assert_eq!(sili.gauges()[0].term_volt, 3700);
        assert_eq!(sili.gauges()[0].last_cc, 110);
        assert_eq!(sili.shutdown.client_vote(DEEP_COUNT_VOTER), Some(3300));

        // not enough charge moved since the last step
        set(&mut bus, topics::GAUGE, GAUGE_ITEM_CC, 112);
        block_on(sili.resolve_ddrc(Pack::Main, &mut bus, 0));
        assert_eq!(sili.gauges()[0].term_volt, 3700);

        set(&mut bus, topics::GAUGE, GAUGE_ITEM_CC, 115);
        block_on(sili.resolve_ddrc(Pack::Main, &mut bus, 0));
        assert_eq!(sili.gauges()[0].term_volt, 3600);
        assert_eq!(sili.shutdown.client_vote(DEEP_COUNT_VOTER), Some(3200));
    }

    #[test]
    fn forced_step_jumps_to_target() {
        let mut bus = bus();
        set(&mut bus, topics::GAUGE, GAUGE_ITEM_CC, 110);
        let mut sili = sili(&[FakeGauge {
            term_volt: 3800,
            last_cc: 100,
            ..Default::default()
        }]);

        sili.spec.limits.step_status = true;
        block_on(sili.resolve_ddrc(Pack::Main, &mut bus, 0));

        assert_eq!(sili.gauges()[0].term_volt, 3600);
        assert!(!sili.limits().step_status);
        assert_eq!(sili.limits().count_thr, 100);
    }

    #[test]
    fn matching_term_voltage_is_not_rewritten() {
        let mut bus = bus();
        set(&mut bus, topics::GAUGE, GAUGE_ITEM_CC, 50);
        let mut sili = sili(&[FakeGauge {
            term_volt: 3400,
            ..Default::default()
        }]);

        block_on(sili.resolve_ddrc(Pack::Main, &mut bus, 1000));

        // cc 50 stays on the first point, which equals the programmed voltage
        assert_eq!(sili.gauges()[0].term_writes, 0);
        assert_eq!(sili.limits().term_voltage, 3400);
        assert_eq!(sili.limits().uv_thr, 3400);
        assert_eq!(bus.item_int(topics::GAUGE, GAUGE_ITEM_VBAT_UV), Ok(3400));
        assert!(sili.works.term_check.deadline().is_none());
    }

    #[test]
    fn invalid_votes_are_not_applied() {
        let mut bus = bus();
        let mut sili = sili(&[FakeGauge::default()]);

        sili.vote_shutdown(&mut bus, SPEC_VOTER, true, INVALID_MAX_VOLTAGE);
        assert_eq!(sili.limits().uv_thr, 3000);
        assert_eq!(bus.item_int(topics::GAUGE, GAUGE_ITEM_VBAT_UV), Err(BusError::NoData));
    }

    #[test]
    fn counts_never_decrease_while_detecting() {
        let mut bus = bus();
        set(&mut bus, topics::COMMON, COMM_ITEM_UI_SOC, 50);
        set(&mut bus, topics::GAUGE, GAUGE_ITEM_VOL_MIN, 3200);
        set(&mut bus, topics::GAUGE, GAUGE_ITEM_CURR, 50);
        set(&mut bus, topics::GAUGE, GAUGE_ITEM_TEMP, 250);

        let mut sili = sili(&[FakeGauge {
            term_volt: 3400,
            ..Default::default()
        }]);
        sili.spec.batt_curves[TempRegion::Cold.index()]
            .push(DdbCurve {
                iterm: 100,
                vterm: 3300,
                ctime: 2,
            })
            .unwrap();

        let mut now = 0;
        let mut last = 0;
        for _ in 0..4 {
            sili.deep_dischg_check(&bus, now);
            block_on(sili.poll(&mut bus, now));
            now += DETECT_PERIOD_MS;
            block_on(sili.poll(&mut bus, now));

            let (counts, _) = sili.counts();
            assert_eq!(counts, last + 1);
            assert_eq!(sili.gauges()[0].count, counts);
            last = counts;
        }

        // a committed count stops the loop until the next check
        assert!(!sili.works.dischg.is_pending());

        assert_eq!(
            block_on(sili.set_deep_dischg_count(Pack::Main, -1)),
            Err(ChgError::Ic(IcError::InvalidArg))
        );
        assert_eq!(sili.counts().0, last);
    }

    #[test]
    fn charging_cancels_detection() {
        let mut bus = bus();
        set(&mut bus, topics::COMMON, COMM_ITEM_UI_SOC, 50);
        let mut sili = sili(&[FakeGauge::default()]);

        sili.set_online(false, false, &bus, 0);
        assert!(sili.works.dischg.is_pending());
        assert!(sili.works.ratio.is_pending());

        sili.set_online(false, true, &bus, 10);
        assert!(!sili.works.dischg.is_pending());
    }

    #[test]
    fn low_soc_keeps_detection_off() {
        let mut bus = bus();
        set(&mut bus, topics::COMMON, COMM_ITEM_UI_SOC, 5);
        let mut sili = sili(&[FakeGauge::default()]);

        sili.deep_dischg_check(&bus, 0);
        assert!(!sili.works.dischg.is_pending());
    }

    #[test]
    fn parallel_packs_show_the_larger_count() {
        let mut sili = sili(&[FakeGauge::default(), FakeGauge::default()]);

        assert!(block_on(sili.set_deep_dischg_count(Pack::Main, 4)).is_ok());
        assert_eq!(sili.gauges()[1].count, 4);

        assert!(block_on(sili.set_deep_dischg_count(Pack::Sub, 7)).is_ok());
        assert_eq!(sili.gauges()[0].count, 4);
        assert_eq!(sili.show_deep_dischg_count(), 7);
    }

    #[test]
    fn parallel_detection_keeps_pack_counts_apart() {
        let mut bus = bus();
        bus.register_topic(topics::SUB_GAUGE, None, 0).unwrap();
        set(&mut bus, topics::COMMON, COMM_ITEM_UI_SOC, 50);
        for topic in [topics::GAUGE, topics::SUB_GAUGE] {
            set(&mut bus, topic, GAUGE_ITEM_VOL_MIN, 3200);
            set(&mut bus, topic, GAUGE_ITEM_CURR, 50);
            set(&mut bus, topic, GAUGE_ITEM_TEMP, 250);
        }

        let mut sili = sili(&[FakeGauge::default(), FakeGauge::default()]);
        sili.spec.batt_curves[TempRegion::Cold.index()]
            .push(DdbCurve {
                iterm: 100,
                vterm: 3300,
                ctime: 1,
            })
            .unwrap();
        assert!(block_on(sili.set_deep_dischg_count(Pack::Sub, 10)).is_ok());

        // main pack alone
        sili.deep_dischg_check(&bus, 0);
        sili.works.sub_dischg.cancel();
        block_on(sili.poll(&mut bus, 0));
        assert_eq!(sili.counts(), (1, 10));
        assert_eq!(sili.gauges()[0].count, 1);
        assert_eq!(sili.gauges()[1].count, 10);

        // both packs, each from its own topic
        sili.deep_dischg_check(&bus, 1000);
        block_on(sili.poll(&mut bus, 1000));
        assert_eq!(sili.counts(), (2, 11));
        assert_eq!(sili.gauges()[0].count, 2);
        assert_eq!(sili.gauges()[1].count, 11);
        assert_eq!(sili.show_deep_dischg_count(), 11);
    }

    #[test]
    fn huge_count_saturates_the_ratio() {
        let bus = bus();
        let mut sili = sili(&[FakeGauge::default()]);

        assert!(block_on(sili.set_deep_dischg_count(Pack::Main, i32::MAX)).is_ok());
        sili.update_ratio(Pack::Main, &bus);
        assert_eq!(sili.ratio(), i32::MAX);
    }

    #[test]
    fn dischg_check_refreshes_ui_soc() {
        let mut bus = bus();
        set(&mut bus, topics::COMMON, COMM_ITEM_UI_SOC, 42);
        let mut sili = sili(&[FakeGauge::default()]);

        sili.deep_dischg_check(&bus, 0);
        assert_eq!(sili.ui_soc, 42);

        set(&mut bus, topics::COMMON, COMM_ITEM_UI_SOC, 41);
        block_on(sili.update_deep_dischg(Pack::Main, &mut bus, 0));
        assert_eq!(sili.ui_soc, 41);
    }

    #[test]
    fn unsupported_reports_invalid_count() {
        let mut sili = sili(&[FakeGauge::default()]);
        sili.spec.support = false;

        assert_eq!(sili.show_deep_dischg_count(), GAUGE_INVALID_DEEP_DICHG_COUNT);
        assert_eq!(sili.ratio_thr(), -GAUGE_INVALID_DEEP_DICHG_COUNT);
    }

    #[test]
    fn init_releases_ready_and_applies_curve() {
        let mut bus = bus();
        set(&mut bus, topics::GAUGE, GAUGE_ITEM_CC, 150);
        set(&mut bus, topics::COMMON, COMM_ITEM_SHELL_TEMP, -50);
        set(&mut bus, topics::GAUGE, GAUGE_ITEM_TEMP, -50);
        let mut sili = sili(&[FakeGauge {
            count: 3,
            term_volt: 3600,
            ..Default::default()
        }]);

        block_on(sili.init(&mut bus, 0));

        assert_eq!(sili.counts().0, 3);
        assert!(!sili.term.is_client_vote_enabled(READY_VOTER));
        assert_eq!(sili.term.effective_result(), Some(3600));
        assert_eq!(sili.limits().term_voltage, 3600);
        // super endurance off: shutdown follows the term voltage
        assert_eq!(sili.limits().uv_thr, 3600);
        assert_eq!(sili.next_deadline(), Some(TEMP_PERIOD_MS));
    }

    #[test]
    fn track_upload_is_rate_limited() {
        let mut bus = bus();
        let mut sili = sili(&[FakeGauge::default()]);

        for i in 0..4 {
            block_on(sili.deep_track_work(Pack::Main, &mut bus, i * 1000));
        }

        assert_eq!(sili.limiter.count(), 3);
        assert!(sili.track_msg.is_empty());
        let error = bus.topic(topics::ERROR).unwrap();
        match bus.item_data(error, ERR_ITEM_DEEP_DISCHG_INFO) {
            Ok(ItemData::Str(msg)) => assert!(msg.starts_with("$$dischg_counts@@0")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn alg_term_volt_only_moves_down() {
        let mut bus = bus();
        let mut sili = sili(&[FakeGauge::default()]);
        sili.dsg_enable = true;
        sili.ui_soc = 10;
        sili.spec.limits.term_voltage = 3400;
        sili.term.vote(READY_VOTER, true, READY_VOLTAGE_MV, false).unwrap();

        sili.gauges_mut()[0].alg_term_volt = 3300;
        block_on(sili.update_alg_term_volt(false, &mut bus));
        assert_eq!(sili.limits().uv_thr, 3300);

        sili.gauges_mut()[0].alg_term_volt = 3350;
        block_on(sili.update_alg_term_volt(false, &mut bus));
        assert_eq!(sili.limits().uv_thr, 3300);

        sili.super_endurance = true;
        block_on(sili.update_alg_term_volt(true, &mut bus));
        assert_eq!(sili.limits().uv_thr, 3350 - SUPER_ENDURANCE_GAP_MV);
    }

    #[test]
    fn curve_index_honours_calibration() {
        let data = [point(0, 3000, 3400), point(100, 3100, 3500), point(200, 3200, 3600)];

        assert_eq!(curve_index(&data, 150, 0), (1, Some(100)));
        assert_eq!(curve_index(&data, 150, 60), (2, Some(140)));
        assert_eq!(curve_index(&data, 50, 0), (0, None));
        assert_eq!(curve_index(&data, 0, 0), (0, Some(0)));
    }
}
