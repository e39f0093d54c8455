//! Gauge calibration persistence.
//!
//! The calibration timestamps of every gauge are stored by the userspace daemon. They are
//! fetched once after boot, written into the gauges, and pushed back whenever a gauge
//! reports a newer calibration.

use byteorder::{ByteOrder, LittleEndian};

use crate::fmt::*;
use crate::ic::{log_ic_error, CalibTime, GaugeIc, IcFunc};
use crate::mutual::{param_size, MutualAck, MutualChannel, MutualCmd, MutualEvent};
use crate::work::DelayedWork;

pub const CALIB_TAG_LEN: usize = 12;
pub const CALIB_ARGS_LEN: usize = 12;
pub const GAUGE_IC_NUM_MAX: usize = 2;
/// Extra obtain attempts after the first one
pub const CALIB_OBTAIN_COUNTS: u8 = 3;
const CALIB_INFO_LEN: usize = 4 + 4 + CALIB_ARGS_LEN;
pub const CALIB_INFO_LOAD_LEN: usize = CALIB_TAG_LEN + GAUGE_IC_NUM_MAX * CALIB_INFO_LEN;

const OBTAIN_DELAY_MS: u64 = 2000;

pub const OBTAIN_NOTIFIER: &str = "gauge_calib_obtain";
pub const UPDATE_NOTIFIER: &str = "gauge_calib_update";

/// The blob the daemon stores
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CalibInfoLoad {
    pub tag: [u8; CALIB_TAG_LEN],
    pub info: [CalibTime; GAUGE_IC_NUM_MAX],
}

impl CalibInfoLoad {
    pub fn encode(&self, buf: &mut [u8; CALIB_INFO_LOAD_LEN]) {
        buf[..CALIB_TAG_LEN].copy_from_slice(&self.tag);

        for (info, chunk) in self.info.iter().zip(buf[CALIB_TAG_LEN..].chunks_exact_mut(CALIB_INFO_LEN)) {
            LittleEndian::write_i32(&mut chunk[0..4], info.dod_time);
            LittleEndian::write_i32(&mut chunk[4..8], info.qmax_time);
            chunk[8..].copy_from_slice(&info.calib_args);
        }
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != CALIB_INFO_LOAD_LEN {
            return None;
        }

        let mut load = Self::default();
        load.tag.copy_from_slice(&buf[..CALIB_TAG_LEN]);

        for (info, chunk) in load.info.iter_mut().zip(buf[CALIB_TAG_LEN..].chunks_exact(CALIB_INFO_LEN)) {
            info.dod_time = LittleEndian::read_i32(&chunk[0..4]);
            info.qmax_time = LittleEndian::read_i32(&chunk[4..8]);
            info.calib_args.copy_from_slice(&chunk[8..]);
        }

        Some(load)
    }
}

pub struct GaugeCalib {
    load: CalibInfoLoad,
    init: [bool; GAUGE_IC_NUM_MAX],
    obtain_work: DelayedWork,
    tries_left: u8,
    requested: bool,
    update_pending: bool,
}

impl GaugeCalib {
    pub const fn new() -> Self {
        Self {
            load: CalibInfoLoad {
                tag: [0; CALIB_TAG_LEN],
                info: [CalibTime {
                    dod_time: 0,
                    qmax_time: 0,
                    calib_args: [0; CALIB_ARGS_LEN],
                }; GAUGE_IC_NUM_MAX],
            },
            init: [false; GAUGE_IC_NUM_MAX],
            obtain_work: DelayedWork::new(),
            tries_left: CALIB_OBTAIN_COUNTS,
            requested: false,
            update_pending: false,
        }
    }

    /// Claims the obtain and update commands on the channel
    pub fn register<const N: usize>(channel: &mut MutualChannel<N>) -> bool {
        let obtain = channel.register(OBTAIN_NOTIFIER, MutualCmd::GaugeCalibObtain);
        let update = channel.register(UPDATE_NOTIFIER, MutualCmd::GaugeCalibUpdate);

        obtain.is_ok() && update.is_ok()
    }

    pub fn load(&self) -> &CalibInfoLoad {
        &self.load
    }

    pub fn is_init(&self, index: usize) -> bool {
        self.init.get(index).copied().unwrap_or(false)
    }

    /// Queues the one-time fetch from the daemon
    pub fn request(&mut self, now_ms: u64) {
        if !self.requested {
            self.requested = true;
            self.obtain_work.schedule(now_ms, OBTAIN_DELAY_MS);
        }
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.obtain_work.deadline()
    }

    /// Runs due work: the obtain request and a queued update push
    pub async fn poll<G: GaugeIc, const N: usize>(
        &mut self,
        now_ms: u64,
        channel: &mut MutualChannel<N>,
        gauges: &mut [G],
    ) {
        if self.obtain_work.take_due(now_ms) {
            if let Err(ack) = channel.send(MutualCmd::GaugeCalibObtain, None, now_ms) {
                self.on_ack(MutualCmd::GaugeCalibObtain, ack, now_ms, gauges).await;
            }
        }

        if self.update_pending {
            self.update_pending = false;

            let mut buf = [0; CALIB_INFO_LOAD_LEN];
            self.load.encode(&mut buf);
            if let Err(ack) = channel.send(MutualCmd::GaugeCalibUpdate, Some(&buf), now_ms) {
                warn!("calib update not sent: {}", ack);
            }
        }
    }

    /// Completion of a command this component sent
    pub async fn on_ack<G: GaugeIc>(&mut self, cmd: MutualCmd, ack: MutualAck, now_ms: u64, gauges: &mut [G]) {
        match cmd {
            MutualCmd::GaugeCalibObtain => {
                if ack != MutualAck::Ok && self.tries_left > 0 {
                    self.tries_left -= 1;
                    self.obtain_work.reschedule(now_ms, OBTAIN_DELAY_MS);
                    return;
                }

                for (i, gauge) in gauges.iter_mut().take(GAUGE_IC_NUM_MAX).enumerate() {
                    let rc = gauge.set_calib_time(&self.load.info[i]).await;
                    if let Err(e) = &rc {
                        log_ic_error(i, IcFunc::SetCalibTime, e);
                    }
                    self.init[i] = rc.is_ok() && ack == MutualAck::Ok;
                }
            }
            MutualCmd::GaugeCalibUpdate => match ack {
                MutualAck::Ok => info!("calib update success"),
                _ => info!("calib update fail: {}", ack),
            },
            MutualCmd::WlsThirdPartAuth => {}
        }
    }

    /// Daemon response for the obtain command
    pub fn on_obtain_event(&mut self, event: &MutualEvent<'_>) {
        if event.cmd() != Some(MutualCmd::GaugeCalibObtain) {
            error!("cmd is not matching");
            return;
        }
        if param_size(event.param) != CALIB_INFO_LOAD_LEN {
            error!("calib data len {} is invalid", param_size(event.param));
            return;
        }

        if let Some(load) = CalibInfoLoad::decode(event.data) {
            self.load = load;
            for (i, info) in self.load.info.iter().enumerate() {
                info!("index:{}, dod_time:{}, qmax_time:{}", i, info.dod_time, info.qmax_time);
            }
        }
    }

    /// Reads the calibration times of gauge `index`, queueing a push to the daemon when they
    /// moved. Unknown times read as -1.
    pub async fn calib_time<G: GaugeIc>(&mut self, index: usize, gauge: &mut G) -> (i32, i32) {
        let Some(stored) = self.load.info.get_mut(index) else {
            return (-1, -1);
        };

        let (dod, qmax) = match gauge.calib_time().await {
            Ok(time) => {
                stored.calib_args = time.calib_args;
                (time.dod_time, time.qmax_time)
            }
            Err(e) => {
                log_ic_error(index, IcFunc::GetCalibTime, &e);
                (-1, -1)
            }
        };

        if self.init[index] {
            if dod != -1 && stored.dod_time != dod {
                stored.dod_time = dod;
                self.update_pending = true;
            }
            if qmax != -1 && stored.qmax_time != qmax {
                stored.qmax_time = qmax;
                self.update_pending = true;
            }
        }

        (dod, qmax)
    }
}

impl Default for GaugeCalib {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ic::IcError;
    use crate::mutual::{MutualFrame, MUTUAL_FRAME_LEN};
    use embassy_futures::block_on;

    #[derive(Default)]
    struct FakeGauge {
        stored: Option<CalibTime>,
        reported: Option<CalibTime>,
    }

    impl GaugeIc for FakeGauge {
        type Error = ();

        async fn calib_time(&mut self) -> Result<CalibTime, IcError<()>> {
            self.reported.ok_or(IcError::Bus(()))
        }

        async fn set_calib_time(&mut self, time: &CalibTime) -> Result<(), IcError<()>> {
            self.stored = Some(*time);
            Ok(())
        }
    }

    fn sample_load() -> CalibInfoLoad {
        let mut load = CalibInfoLoad::default();
        load.tag[..4].copy_from_slice(b"cali");
        load.info[0].dod_time = 1200;
        load.info[0].qmax_time = 3400;
        load.info[1].dod_time = -1;
        load.info[1].calib_args[11] = 0x5a;
        load
    }

    #[test]
    fn load_layout_is_little_endian() {
        let mut buf = [0; CALIB_INFO_LOAD_LEN];
        sample_load().encode(&mut buf);

        assert_eq!(buf.len(), 52);
        assert_eq!(&buf[..4], b"cali");
        assert_eq!(&buf[12..16], &1200i32.to_le_bytes());
        assert_eq!(&buf[32..36], &(-1i32).to_le_bytes());
        assert_eq!(buf[51], 0x5a);
        assert_eq!(CalibInfoLoad::decode(&buf), Some(sample_load()));
        assert_eq!(CalibInfoLoad::decode(&buf[1..]), None);
    }

    #[test]
    fn failed_obtain_retries_then_gives_up() {
        let mut channel: MutualChannel<4> = MutualChannel::new();
        assert!(GaugeCalib::register(&mut channel));
        let mut calib = GaugeCalib::new();
        let mut gauges = [FakeGauge::default()];

        calib.request(0);
        calib.request(0);
        assert_eq!(calib.next_deadline(), Some(2000));

        // daemon never attached, every attempt is refused right away
        let mut now = 2000;
        for _ in 0..CALIB_OBTAIN_COUNTS {
            block_on(calib.poll(now, &mut channel, &mut gauges));
            now += 2000;
            assert_eq!(calib.next_deadline(), Some(now));
        }

        block_on(calib.poll(now, &mut channel, &mut gauges));
        assert_eq!(calib.next_deadline(), None);
        assert!(gauges[0].stored.is_some());
        assert!(!calib.is_init(0));
    }

    #[test]
    fn obtained_times_are_written_to_gauges() {
        let mut channel: MutualChannel<4> = MutualChannel::new();
        GaugeCalib::register(&mut channel);
        channel.daemon_read();

        let mut calib = GaugeCalib::new();
        let mut gauges = [FakeGauge::default(), FakeGauge::default()];
        calib.request(0);
        block_on(calib.poll(2000, &mut channel, &mut gauges));
        assert!(channel.daemon_read().is_some());

        let mut payload = [0; CALIB_INFO_LOAD_LEN];
        sample_load().encode(&mut payload);
        let mut frame = [0; MUTUAL_FRAME_LEN];
        let mut data = [0; 256];
        data[..CALIB_INFO_LOAD_LEN].copy_from_slice(&payload);
        MutualFrame {
            cmd: MutualCmd::GaugeCalibObtain as u32,
            data_size: CALIB_INFO_LOAD_LEN as u32,
            data,
        }
        .encode(&mut frame);

        let event = channel.daemon_response(&frame).unwrap();
        calib.on_obtain_event(&event);

        let (cmd, ack) = channel.poll(2100).unwrap();
        block_on(calib.on_ack(cmd, ack, 2100, &mut gauges));

        assert_eq!(gauges[0].stored.map(|t| t.dod_time), Some(1200));
        assert_eq!(gauges[1].stored.map(|t| t.calib_args[11]), Some(0x5a));
        assert!(calib.is_init(0) && calib.is_init(1));
    }

    #[test]
    fn newer_calibration_queues_an_update() {
        let mut channel: MutualChannel<4> = MutualChannel::new();
        GaugeCalib::register(&mut channel);
        channel.daemon_read();

        let mut calib = GaugeCalib::new();
        let mut gauge = FakeGauge::default();
        block_on(calib.on_ack(
            MutualCmd::GaugeCalibObtain,
            MutualAck::Ok,
            0,
            core::slice::from_mut(&mut gauge),
        ));

        gauge.reported = Some(CalibTime {
            dod_time: 7,
            qmax_time: -1,
            calib_args: [1; CALIB_ARGS_LEN],
        });
        assert_eq!(block_on(calib.calib_time(0, &mut gauge)), (7, -1));
        assert_eq!(calib.load().info[0].dod_time, 7);
        assert_eq!(calib.load().info[0].qmax_time, 0);

        block_on(calib.poll(10, &mut channel, core::slice::from_mut(&mut gauge)));
        let frame = channel.daemon_read().unwrap();
        assert_eq!(frame.cmd, MutualCmd::GaugeCalibUpdate as u32);
        assert_eq!(frame.data_size as usize, CALIB_INFO_LOAD_LEN);

        // unreadable gauge reports unknown times and changes nothing
        gauge.reported = None;
        assert_eq!(block_on(calib.calib_time(0, &mut gauge)), (-1, -1));
        assert_eq!(calib.load().info[0].dod_time, 7);
    }

    #[test]
    fn wrong_sized_obtain_payload_is_ignored() {
        let mut calib = GaugeCalib::new();
        let data = [0xff; 10];
        calib.on_obtain_event(&MutualEvent {
            param: crate::mutual::param(MutualCmd::GaugeCalibObtain, data.len()),
            data: &data,
        });
        assert_eq!(calib.load(), &CalibInfoLoad::default());
    }
}
