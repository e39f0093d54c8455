#![no_std]

//! Charging control core for OPLUS phones: the charger supervisory loop with JEITA and
//! scheduled-target charging, vote arbitration, and the silicon-anode deep-discharge
//! compensation that moves the battery's termination and shutdown voltages as it ages.
//!
//! Hardware is reached through async traits ([`ic::GaugeIc`], [`device::ChargerDevice`],
//! [`device::BatteryMonitor`], [`alg::ChgAlgorithm`]). Nothing here spawns tasks: every
//! component exposes `poll` and `next_deadline`, and the host calls back in when a deadline
//! passes or an event arrives.

pub(crate) mod fmt;

pub mod alg;
pub mod calib;
pub mod charger;
pub mod config;
pub mod ddrc;
pub mod deep_spec;
pub mod device;
pub mod ic;
pub mod jeita;
pub mod mms;
pub mod mutual;
pub mod notify;
pub mod sili;
pub mod smart_charging;
pub mod temp_region;
pub mod thermal;
pub mod voter;
pub mod work;

use ic::IcError;
use mms::BusError;
use voter::VoteError;

pub use charger::{Charger, ChargerState};
pub use config::{ChargerConfig, PropertySource, SmartChargingConfig};
pub use sili::{Pack, Sili};
pub use voter::{Election, Votable, VoteRule};

/// Error surfaced to the host by the core's entry points
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChgError<E> {
    Ic(IcError<E>),
    Bus(BusError),
    Vote(VoteError),
}

impl<E> From<IcError<E>> for ChgError<E> {
    fn from(e: IcError<E>) -> Self {
        Self::Ic(e)
    }
}

impl<E> From<BusError> for ChgError<E> {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

impl<E> From<VoteError> for ChgError<E> {
    fn from(e: VoteError) -> Self {
        Self::Vote(e)
    }
}
