//! Command channel to the userspace persistence daemon.
//!
//! A send parks one frame for the daemon and waits for its response. The daemon side
//! reads frames with [`MutualChannel::daemon_read`] and answers through
//! [`MutualChannel::daemon_response`].

use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

use crate::fmt::*;

pub const MUTUAL_CMD_DATA_LEN: usize = 256;
/// Ack deadline for a parked command
pub const MUTUAL_CMD_TIME_MS: u64 = 3000;
/// cmd + data size + payload
pub const MUTUAL_FRAME_LEN: usize = 8 + MUTUAL_CMD_DATA_LEN;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MutualCmd {
    WlsThirdPartAuth = 0,
    GaugeCalibObtain = 1,
    GaugeCalibUpdate = 2,
}

impl MutualCmd {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::WlsThirdPartAuth),
            1 => Some(Self::GaugeCalibObtain),
            2 => Some(Self::GaugeCalibUpdate),
            _ => None,
        }
    }
}

/// Outcome of a command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MutualAck {
    Ok = 0,
    /// Nobody registered for the command
    ChipNull = 1,
    DataNull = 2,
    DataInvalid = 3,
    HidlNotReady = 4,
    TimeOut = 5,
}

/// Packs a command and payload size into the notifier parameter
pub const fn param(cmd: MutualCmd, size: usize) -> u32 {
    ((cmd as u32 & 0xff) << 16) | (size as u32 & 0xffff)
}

pub const fn param_cmd(param: u32) -> u32 {
    (param >> 16) & 0xff
}

pub const fn param_size(param: u32) -> usize {
    (param & 0xffff) as usize
}

/// One command frame as exchanged with the daemon
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutualFrame {
    pub cmd: u32,
    pub data_size: u32,
    pub data: [u8; MUTUAL_CMD_DATA_LEN],
}

impl MutualFrame {
    fn new(cmd: MutualCmd, payload: &[u8]) -> Self {
        let mut data = [0; MUTUAL_CMD_DATA_LEN];
        data[..payload.len()].copy_from_slice(payload);

        Self {
            cmd: cmd as u32,
            data_size: payload.len() as u32,
            data,
        }
    }

    pub fn encode(&self, buf: &mut [u8; MUTUAL_FRAME_LEN]) {
        LittleEndian::write_u32(&mut buf[0..4], self.cmd);
        LittleEndian::write_u32(&mut buf[4..8], self.data_size);
        buf[8..].copy_from_slice(&self.data);
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != MUTUAL_FRAME_LEN {
            return None;
        }

        let mut data = [0; MUTUAL_CMD_DATA_LEN];
        data.copy_from_slice(&buf[8..]);

        Some(Self {
            cmd: LittleEndian::read_u32(&buf[0..4]),
            data_size: LittleEndian::read_u32(&buf[4..8]),
            data,
        })
    }

    pub fn payload(&self) -> &[u8] {
        let len = (self.data_size as usize).min(MUTUAL_CMD_DATA_LEN);
        &self.data[..len]
    }
}

/// A daemon response, addressed to the notifier owning `param`'s command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutualEvent<'a> {
    pub param: u32,
    pub data: &'a [u8],
}

impl MutualEvent<'_> {
    pub fn cmd(&self) -> Option<MutualCmd> {
        MutualCmd::from_raw(param_cmd(self.param))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MutualError {
    AlreadyRegistered,
    TooManyNotifiers,
    BadFrame,
    /// The frame's command has no registered notifier
    Unclaimed,
}

pub struct MutualChannel<const N: usize> {
    notifiers: Vec<(&'static str, MutualCmd), N>,
    hidl_ready: bool,
    parked: Option<MutualFrame>,
    pending: Option<(MutualCmd, u64)>,
    completed: Option<(MutualCmd, MutualAck)>,
    response: Option<MutualFrame>,
}

impl<const N: usize> MutualChannel<N> {
    pub const fn new() -> Self {
        Self {
            notifiers: Vec::new(),
            hidl_ready: false,
            parked: None,
            pending: None,
            completed: None,
            response: None,
        }
    }

    /// Claims `cmd` for `name`. Only one notifier may own a command.
    pub fn register(&mut self, name: &'static str, cmd: MutualCmd) -> Result<(), MutualError> {
        if self.notifiers.iter().any(|(_, c)| *c == cmd) {
            error!("{}: cmd {} already registered", name, cmd);
            return Err(MutualError::AlreadyRegistered);
        }

        self.notifiers
            .push((name, cmd))
            .map_err(|_| MutualError::TooManyNotifiers)
    }

    pub fn unregister(&mut self, name: &str) {
        self.notifiers.retain(|(n, _)| *n != name);
    }

    pub fn owner(&self, cmd: MutualCmd) -> Option<&'static str> {
        self.notifiers.iter().find(|(_, c)| *c == cmd).map(|(n, _)| *n)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Parks a command for the daemon. The result arrives through [`Self::poll`].
    pub fn send(&mut self, cmd: MutualCmd, payload: Option<&[u8]>, now_ms: u64) -> Result<(), MutualAck> {
        if matches!(payload, Some(p) if p.is_empty()) {
            return Err(MutualAck::DataNull);
        }
        let payload = payload.unwrap_or(&[]);

        if self.owner(cmd).is_none() {
            error!("cmd {}: no notifier", cmd);
            return Err(MutualAck::ChipNull);
        }
        if payload.len() > MUTUAL_CMD_DATA_LEN {
            error!("cmd {}: payload {} too long", cmd, payload.len());
            return Err(MutualAck::DataInvalid);
        }
        if !self.hidl_ready || self.pending.is_some() {
            warn!("cmd {}: daemon not ready", cmd);
            return Err(MutualAck::HidlNotReady);
        }

        self.parked = Some(MutualFrame::new(cmd, payload));
        self.pending = Some((cmd, now_ms + MUTUAL_CMD_TIME_MS));
        info!("cmd {} sent, size {}", cmd, payload.len());
        Ok(())
    }

    /// Daemon side read. The first read marks the daemon ready.
    pub fn daemon_read(&mut self) -> Option<MutualFrame> {
        if !self.hidl_ready {
            info!("daemon ready");
            self.hidl_ready = true;
        }
        self.parked.take()
    }

    /// Daemon side write. Completes the pending command and returns the response for
    /// the owning notifier.
    pub fn daemon_response(&mut self, buf: &[u8]) -> Result<MutualEvent<'_>, MutualError> {
        let frame = MutualFrame::decode(buf).ok_or(MutualError::BadFrame)?;
        let cmd = MutualCmd::from_raw(frame.cmd).ok_or(MutualError::BadFrame)?;

        if frame.data_size as usize > MUTUAL_CMD_DATA_LEN {
            return Err(MutualError::BadFrame);
        }
        if self.owner(cmd).is_none() {
            return Err(MutualError::Unclaimed);
        }

        if matches!(self.pending, Some((pending, _)) if pending == cmd) {
            self.pending = None;
            self.completed = Some((cmd, MutualAck::Ok));
        }

        let frame = self.response.insert(frame);
        Ok(MutualEvent {
            param: param(cmd, frame.data_size as usize),
            data: frame.payload(),
        })
    }

    /// Reports the completed command, or a timeout once the ack deadline passed
    pub fn poll(&mut self, now_ms: u64) -> Option<(MutualCmd, MutualAck)> {
        if let Some(done) = self.completed.take() {
            return Some(done);
        }

        match self.pending {
            Some((cmd, deadline)) if now_ms >= deadline => {
                warn!("cmd {} timed out", cmd);
                self.pending = None;
                self.parked = None;
                Some((cmd, MutualAck::TimeOut))
            }
            _ => None,
        }
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.pending.map(|(_, deadline)| deadline)
    }
}

impl<const N: usize> Default for MutualChannel<N> {
    fn default() -> Self {
        Self::new()
    }
}
