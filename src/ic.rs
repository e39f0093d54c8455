//! Fuel-gauge IC function dispatch.
//!
//! The gauge is an external collaborator: the charging core only needs a closed set
//! of functions from it. Every function has a default body reporting
//! [`IcError::NotSupported`], so a driver implements just what its silicon can do and
//! the core treats the rest as an absent feature.

use crate::fmt::*;

/// Function codes the core dispatches to a gauge IC. Used for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IcFunc {
    GetDeepDischgCount,
    SetDeepDischgCount,
    GetDeepTermVolt,
    SetDeepTermVolt,
    GetLastCc,
    SetLastCc,
    GetBattIdInfo,
    GetBattIdMatchInfo,
    SetSiliIcAlgCfg,
    GetSiliIcAlgDsgEnable,
    GetSiliIcAlgTermVolt,
    SetSiliIcAlgTermVolt,
    GetSiliSimulateTermVolt,
    SetSiliSparePower,
    SetCalibTime,
    GetCalibTime,
}

/// IC dispatch error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IcError<E> {
    /// Transient transport failure
    Bus(E),
    /// The IC does not implement this function
    NotSupported,
    InvalidArg,
}

impl<E> From<E> for IcError<E> {
    fn from(e: E) -> Self {
        Self::Bus(e)
    }
}

impl<E> IcError<E> {
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported)
    }
}

/// Reports an IC failure unless it is just a missing capability
pub(crate) fn log_ic_error<E>(index: usize, func: IcFunc, err: &IcError<E>) {
    if !err.is_not_supported() {
        error!("gauge[{}]: {} failed", index, func);
    }
}

/// Battery id match result reported by the gauge
pub mod id_match {
    pub const IGNORE: i32 = 0;
    pub const NOT_MATCH: i32 = 1;
    pub const SILI: i32 = 2;
    pub const NORMAL: i32 = 3;
}

/// Default reported when the gauge can't identify the battery id gpio
pub const GPIO_STATUS_NOT_SUPPORT: i32 = -1;

/// Calibration timestamps stored in the gauge
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CalibTime {
    pub dod_time: i32,
    pub qmax_time: i32,
    pub calib_args: [u8; crate::calib::CALIB_ARGS_LEN],
}

#[allow(async_fn_in_trait)]
pub trait GaugeIc {
    type Error;

    async fn deep_dischg_count(&mut self) -> Result<i32, IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    async fn set_deep_dischg_count(&mut self, _count: i32) -> Result<(), IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    /// Termination voltage programmed for deep discharge, in mV
    async fn deep_term_volt(&mut self) -> Result<i32, IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    async fn set_deep_term_volt(&mut self, _volt_mv: i32) -> Result<(), IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    /// Coulomb count at the last applied voltage step
    async fn last_cc(&mut self) -> Result<i32, IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    async fn set_last_cc(&mut self, _cc: i32) -> Result<(), IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    async fn batt_id_info(&mut self) -> Result<i32, IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    async fn batt_id_match_info(&mut self) -> Result<i32, IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    async fn set_sili_ic_alg_cfg(&mut self, _cfg: u32) -> Result<(), IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    async fn sili_ic_alg_dsg_enable(&mut self) -> Result<bool, IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    async fn sili_ic_alg_term_volt(&mut self) -> Result<i32, IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    async fn set_sili_ic_alg_term_volt(&mut self, _volt_mv: i32) -> Result<(), IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    async fn sili_simulate_term_volt(&mut self) -> Result<i32, IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    async fn set_sili_spare_power(&mut self) -> Result<(), IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    async fn calib_time(&mut self) -> Result<CalibTime, IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }

    async fn set_calib_time(&mut self, _time: &CalibTime) -> Result<(), IcError<Self::Error>> {
        Err(IcError::NotSupported)
    }
}
