//! Temperature-region classifier with direction dependent hysteresis

use crate::fmt::*;

/// Threshold shift applied to the boundary of a freshly entered region, in 0.1 °C
pub const BATT_TEMP_HYST: i32 = 20;
/// Consecutive samples a new region must be seen before it is committed
pub const TEMP_CNTS: u8 = 3;
/// Reported when the temperature source can't be read
pub const GAUGE_LOW_ABNORMAL_TEMP: i32 = -200;

const RANGE_LEN: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TempRegion {
    Cold = 0,
    Cool = 1,
    Normal = 2,
    Warm = 3,
}

impl TempRegion {
    pub const COUNT: usize = 4;

    pub fn from_index(index: usize) -> Self {
        match index {
            0 => Self::Cold,
            1 => Self::Cool,
            2 => Self::Normal,
            _ => Self::Warm,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Which sensor feeds a classifier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TempType {
    Battery,
    Shell,
}

/// First region whose upper bound is above `temp`
pub fn get_temp_region(range: &[i32; RANGE_LEN], temp: i32) -> TempRegion {
    range
        .iter()
        .position(|thr| temp < *thr)
        .map_or(TempRegion::Warm, TempRegion::from_index)
}

/// Result of feeding one sample to the classifier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegionSample {
    /// The sample falls into the committed region
    Stable(TempRegion),
    /// A different region was seen, not yet debounced
    Pending(TempRegion),
    /// The region changed and the thresholds were rebuilt
    Committed { pre: TempRegion, now: TempRegion },
}

/// One classifier instance: a static default threshold set and a live one that
/// carries the hysteresis of the last transition
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TempClassifier {
    default: [i32; RANGE_LEN],
    live: [i32; RANGE_LEN],
    pub index_n: TempRegion,
    pub index_p: TempRegion,
    pub temp_type: TempType,
    cnts: u8,
}

impl TempClassifier {
    pub fn new(range: [i32; RANGE_LEN], temp_type: TempType) -> Self {
        Self {
            default: range,
            live: range,
            index_n: TempRegion::Cold,
            index_p: TempRegion::Cold,
            temp_type,
            cnts: 0,
        }
    }

    pub fn live_range(&self) -> &[i32; RANGE_LEN] {
        &self.live
    }

    pub fn default_range(&self) -> &[i32; RANGE_LEN] {
        &self.default
    }

    /// Classifies against the live thresholds without touching any state
    pub fn region(&self, temp: i32) -> TempRegion {
        get_temp_region(&self.live, temp)
    }

    pub fn thr_init(&mut self) {
        self.live = self.default;
    }

    /// Widens the boundary just crossed so that the reading has to move
    /// `BATT_TEMP_HYST` past it before flipping back
    pub fn thr_update(&mut self, now: TempRegion, pre: TempRegion) {
        if pre > now {
            // now < Warm here
            let i = now.index();
            self.live[i] = self.default[i] + BATT_TEMP_HYST;
            info!("now={}, pre={}, update thr[{}] to {}", now, pre, i, self.live[i]);
        } else if pre < now {
            let i = now.index() - 1;
            self.live[i] = self.default[i] - BATT_TEMP_HYST;
            info!("now={}, pre={}, update thr[{}] to {}", now, pre, i, self.live[i]);
        }
    }

    /// Resets the live thresholds and commits the region of `temp` without debounce
    pub fn reset(&mut self, temp: i32) -> TempRegion {
        self.thr_init();
        self.cnts = 0;
        self.index_n = self.region(temp);
        self.index_n
    }

    /// Feeds one sample through the debounce and hysteresis logic
    pub fn sample(&mut self, temp: i32) -> RegionSample {
        let now = self.region(temp);
        let pre = self.index_n;

        if now == pre {
            self.cnts = 0;
            return RegionSample::Stable(now);
        }

        self.cnts = self.cnts.saturating_add(1);
        if self.cnts < TEMP_CNTS {
            return RegionSample::Pending(now);
        }

        self.index_n = now;
        self.thr_init();
        self.thr_update(now, pre);

        RegionSample::Committed { pre, now }
    }
}
