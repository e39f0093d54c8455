//! Fast charging algorithm slots and the charging policy hook.

use heapless::Vec;

use crate::fmt::*;

pub const MAX_ALG_NO: usize = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AlgId {
    Pe5p,
    Hvbp,
    Pe5,
    Pe4,
    Pdc,
    Pe2,
    Pe,
}

/// Slot order, which is also the arbitration order
pub const ALG_ORDER: [AlgId; MAX_ALG_NO] = [
    AlgId::Pe5p,
    AlgId::Hvbp,
    AlgId::Pe5,
    AlgId::Pe4,
    AlgId::Pdc,
    AlgId::Pe2,
    AlgId::Pe,
];

impl AlgId {
    /// Device names looked up for the slot, in preference order
    pub fn names(self) -> &'static [&'static str] {
        match self {
            Self::Pe5p => &["pe5p"],
            Self::Hvbp => &["hvbp"],
            Self::Pe5 => &["pe5"],
            Self::Pe4 => &["pe45", "pe4"],
            Self::Pdc => &["pd"],
            Self::Pe2 => &["pe2"],
            Self::Pe => &["pe"],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AlgState {
    Init,
    NotReady,
    TaNotSupport,
    Ready,
    Running,
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AlgEvent {
    PlugIn,
    PlugOut,
}

/// A fast charging negotiation algorithm
#[allow(async_fn_in_trait)]
pub trait ChgAlgorithm {
    async fn init(&mut self, id: AlgId);
    async fn notify(&mut self, evt: AlgEvent);
    /// mV
    async fn set_ref_vbat(&mut self, vbat: i32);
    async fn plugout_reset(&mut self);
    async fn is_algo_ready(&mut self) -> AlgState;
}

/// What the charging policy gets to see on each run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PolicyInput {
    pub chr_type: crate::device::ChargerType,
    /// JEITA voltage ceiling in µV, 0 for none
    pub jeita_cv: u32,
    pub battery_temp: i32,
    pub uisoc: i32,
    pub sc_reduce: bool,
}

/// Current and voltage setting policy run by the loop while charging is allowed
#[allow(async_fn_in_trait)]
pub trait ChargingPolicy {
    async fn do_algorithm(&mut self, input: &PolicyInput);
    async fn enable_charging(&mut self, en: bool);
}

/// The seven algorithm slots, each may stay empty
pub struct AlgorithmSlots<A> {
    slots: Vec<(AlgId, Option<A>), MAX_ALG_NO>,
}

impl<A: ChgAlgorithm> AlgorithmSlots<A> {
    /// Fills the slots from a lookup by device name
    pub fn probe(mut lookup: impl FnMut(&str) -> Option<A>) -> Self {
        let mut slots = Vec::new();

        for id in ALG_ORDER {
            let alg = id.names().iter().find_map(|name| {
                let found = lookup(name);
                if found.is_none() {
                    error!("cannot get {}", name);
                }
                found
            });
            // Capacity equals ALG_ORDER length
            let _ = slots.push((id, alg));
        }

        Self { slots }
    }

    pub fn get(&self, id: AlgId) -> Option<&A> {
        self.slots.iter().find(|(i, _)| *i == id)?.1.as_ref()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (AlgId, &mut A)> {
        self.slots
            .iter_mut()
            .filter_map(|(id, alg)| alg.as_mut().map(|alg| (*id, alg)))
    }

    pub async fn init_all(&mut self) {
        for (id, alg) in self.iter_mut() {
            info!("init {}", id);
            alg.init(id).await;
        }
    }

    pub async fn notify_all(&mut self, evt: AlgEvent) {
        for (_, alg) in self.iter_mut() {
            alg.notify(evt).await;
        }
    }

    /// True if any algorithm is driving the charger
    pub async fn any_running(&mut self) -> bool {
        for (_, alg) in self.iter_mut() {
            if alg.is_algo_ready().await == AlgState::Running {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    struct Fake {
        state: AlgState,
        inits: u32,
    }

    impl ChgAlgorithm for Fake {
        async fn init(&mut self, _id: AlgId) {
            self.inits += 1;
        }
        async fn notify(&mut self, _evt: AlgEvent) {}
        async fn set_ref_vbat(&mut self, _vbat: i32) {}
        async fn plugout_reset(&mut self) {}
        async fn is_algo_ready(&mut self) -> AlgState {
            self.state
        }
    }

    fn fake(state: AlgState) -> Fake {
        Fake { state, inits: 0 }
    }

    #[test]
    fn pe4_slot_prefers_pe45() {
        let slots = AlgorithmSlots::probe(|name| match name {
            "pe45" => Some(fake(AlgState::Ready)),
            "pe4" => Some(fake(AlgState::Running)),
            _ => None,
        });

        assert_eq!(slots.get(AlgId::Pe4).map(|a| a.state), Some(AlgState::Ready));
        assert!(slots.get(AlgId::Pe5p).is_none());
    }

    #[test]
    fn pe4_slot_falls_back() {
        let slots = AlgorithmSlots::probe(|name| (name == "pe4").then(|| fake(AlgState::Ready)));
        assert!(slots.get(AlgId::Pe4).is_some());
    }

    #[test]
    fn running_detection_skips_empty_slots() {
        let mut slots = AlgorithmSlots::probe(|name| match name {
            "pd" => Some(fake(AlgState::Ready)),
            "pe" => Some(fake(AlgState::Running)),
            _ => None,
        });
        assert!(block_on(slots.any_running()));

        block_on(slots.init_all());
        assert_eq!(slots.get(AlgId::Pdc).map(|a| a.inits), Some(1));

        let mut idle = AlgorithmSlots::probe(|name| (name == "pd").then(|| fake(AlgState::Ready)));
        assert!(!block_on(idle.any_running()));
    }
}
