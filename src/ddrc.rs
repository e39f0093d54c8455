//! Deep-discharge ratio compensation curves.
//!
//! Curves are laid out on a ratio x temperature grid. Each cell holds a list of
//! `{count, vbat0, vbat1}` points sorted by ascending count.

use core::fmt::Write;

use heapless::{String, Vec};

use crate::config::{array_or, u32_or, PropertySource};
use crate::fmt::*;
use crate::temp_region::{TempRegion, TempType};

pub const DDRC_CURVE_MAX: usize = 16;
const RATIO_RANGE_LEN: usize = 5;
const TEMP_RANGE_LEN: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RatioRegion {
    Min = 0,
    Low = 1,
    MidLow = 2,
    Mid = 3,
    MidHigh = 4,
    High = 5,
}

impl RatioRegion {
    pub const COUNT: usize = 6;

    fn from_index(index: usize) -> Self {
        match index {
            0 => Self::Min,
            1 => Self::Low,
            2 => Self::MidLow,
            3 => Self::Mid,
            4 => Self::MidHigh,
            _ => Self::High,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DdrcPoint {
    /// Coulomb count where this point starts applying
    pub count: i32,
    /// Shutdown voltage, mV
    pub vbat0: i32,
    /// Termination voltage, mV
    pub vbat1: i32,
    pub index: i32,
}

/// The curve picked for the present conditions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DdrcCurve<'a> {
    pub data: &'a [DdrcPoint],
    pub index_r: RatioRegion,
    pub index_t: TempRegion,
}

pub struct DdrcStrategy {
    ratio_range: [i32; RATIO_RANGE_LEN],
    temp_range: [i32; TEMP_RANGE_LEN],
    pub temp_type: TempType,
    curves: [[Vec<DdrcPoint, DDRC_CURVE_MAX>; TempRegion::COUNT]; RatioRegion::COUNT],
}

impl DdrcStrategy {
    pub fn new(
        ratio_range: [i32; RATIO_RANGE_LEN],
        temp_range: [i32; TEMP_RANGE_LEN],
        temp_type: TempType,
    ) -> Self {
        Self {
            ratio_range,
            temp_range,
            temp_type,
            curves: Default::default(),
        }
    }

    const RATIO_NAMES: [&'static str; RatioRegion::COUNT] = [
        "ratio_range_min",
        "ratio_range_low",
        "ratio_range_mid_low",
        "ratio_range_mid",
        "ratio_range_mid_high",
        "ratio_range_high",
    ];
    const TEMP_NAMES: [&'static str; TempRegion::COUNT] = ["temp_cold", "temp_cool", "temp_normal", "temp_warm"];

    /// Builds the strategy from `ddrc_strategy,*` properties. Each cell is a flat list of
    /// `count vbat0 vbat1 index` quadruples; a missing cell stays empty.
    pub fn load<S: PropertySource>(src: &S) -> Self {
        let temp_type = match u32_or(src, "ddrc_strategy,temp_type", 1) {
            0 => TempType::Battery,
            _ => TempType::Shell,
        };
        let mut strategy = Self::new(
            array_or(src, "ddrc_strategy,ratio_range", [10, 20, 30, 40, 50]),
            array_or(src, "ddrc_strategy,temp_range", [0, 100, 250]),
            temp_type,
        );

        let mut name: String<64> = String::new();
        let mut raw = [0i32; 4 * DDRC_CURVE_MAX];
        for (r, ratio_name) in Self::RATIO_NAMES.iter().enumerate() {
            for (t, temp_name) in Self::TEMP_NAMES.iter().enumerate() {
                name.clear();
                if write!(name, "ddrc_strategy,{},{}", ratio_name, temp_name).is_err() {
                    continue;
                }

                let Some(len) = src.read_i32_array(&name, &mut raw) else {
                    continue;
                };
                if len % 4 != 0 {
                    error!("ddrc curve {}:{} has a partial entry", r, t);
                    continue;
                }

                let mut points: Vec<DdrcPoint, DDRC_CURVE_MAX> = Vec::new();
                for chunk in raw[..len.min(raw.len())].chunks_exact(4) {
                    let _ = points.push(DdrcPoint {
                        count: chunk[0],
                        vbat0: chunk[1],
                        vbat1: chunk[2],
                        index: chunk[3],
                    });
                }
                strategy.set_curve(RatioRegion::from_index(r), TempRegion::from_index(t), &points);
            }
        }

        strategy
    }

    /// Installs the curve of one grid cell. Fails when the points don't fit.
    pub fn set_curve(&mut self, ratio: RatioRegion, temp: TempRegion, points: &[DdrcPoint]) -> bool {
        let cell = &mut self.curves[ratio as usize][temp.index()];
        cell.clear();

        if cell.extend_from_slice(points).is_err() {
            error!("ddrc curve {}:{} too long", ratio, temp);
            cell.clear();
            return false;
        }
        true
    }

    pub fn ratio_region(&self, ratio: i32) -> RatioRegion {
        self.ratio_range
            .iter()
            .position(|thr| ratio <= *thr)
            .map_or(RatioRegion::High, RatioRegion::from_index)
    }

    /// Uses the classifier's committed region when there is one, otherwise bins `temp`
    pub fn temp_region(&self, committed: Option<TempRegion>, temp: i32) -> TempRegion {
        if let Some(region) = committed {
            return region;
        }

        self.temp_range
            .iter()
            .position(|thr| temp <= *thr)
            .map_or(TempRegion::Warm, TempRegion::from_index)
    }

    pub fn select(&self, ratio: i32, temp: TempRegion) -> DdrcCurve<'_> {
        let index_r = self.ratio_region(ratio);
        info!("use ratio {} temp {} curve", index_r, temp);

        DdrcCurve {
            data: &self.curves[index_r as usize][temp.index()],
            index_r,
            index_t: temp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(count: i32, vbat0: i32, vbat1: i32) -> DdrcPoint {
        DdrcPoint {
            count,
            vbat0,
            vbat1,
            index: 0,
        }
    }

    #[test]
    fn ratio_bins_are_inclusive() {
        let strategy = DdrcStrategy::new([10, 20, 30, 40, 50], [0, 100, 250], TempType::Battery);

        assert_eq!(strategy.ratio_region(10), RatioRegion::Min);
        assert_eq!(strategy.ratio_region(11), RatioRegion::Low);
        assert_eq!(strategy.ratio_region(50), RatioRegion::MidHigh);
        assert_eq!(strategy.ratio_region(51), RatioRegion::High);
    }

    #[test]
    fn committed_temperature_region_wins() {
        let strategy = DdrcStrategy::new([10, 20, 30, 40, 50], [0, 100, 250], TempType::Shell);

        assert_eq!(strategy.temp_region(Some(TempRegion::Cold), 400), TempRegion::Cold);
        assert_eq!(strategy.temp_region(None, 100), TempRegion::Cool);
        assert_eq!(strategy.temp_region(None, 251), TempRegion::Warm);
    }

    #[test]
    fn select_returns_the_cell() {
        let mut strategy = DdrcStrategy::new([10, 20, 30, 40, 50], [0, 100, 250], TempType::Battery);
        let points = [point(0, 3000, 3400), point(100, 3100, 3500)];
        assert!(strategy.set_curve(RatioRegion::Low, TempRegion::Normal, &points));

        let curve = strategy.select(15, TempRegion::Normal);
        assert_eq!(curve.data, &points);
        assert_eq!(curve.index_r, RatioRegion::Low);

        assert!(strategy.select(15, TempRegion::Warm).data.is_empty());
    }

    #[test]
    fn load_reads_cells_by_region_name() {
        use crate::config::tests::Props;

        let props = Props::default()
            .array("ddrc_strategy,ratio_range", &[5, 15, 25, 35, 45])
            .array(
                "ddrc_strategy,ratio_range_low,temp_normal",
                &[0, 3000, 3400, 0, 200, 3100, 3500, 1],
            )
            .array("ddrc_strategy,ratio_range_mid,temp_cold", &[0, 3000, 3400]);
        let strategy = DdrcStrategy::load(&props);

        let curve = strategy.select(10, TempRegion::Normal);
        assert_eq!(curve.index_r, RatioRegion::Low);
        assert_eq!(curve.data.len(), 2);
        assert_eq!(curve.data[1], point(200, 3100, 3500).with_index(1));

        // partial quadruple is rejected
        assert!(strategy.select(30, TempRegion::Cold).data.is_empty());
    }

    impl DdrcPoint {
        fn with_index(mut self, index: i32) -> Self {
            self.index = index;
            self
        }
    }
}
