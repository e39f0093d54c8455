//! Vote arbiter.
//!
//! A [`Votable`] aggregates the votes of independent policies ("clients") into a single
//! effective value. Voting does not call back into the owner: when the effective value
//! changes, `vote` hands an [`Election`] back and the owner applies it. This keeps the
//! "update vote, recompute, apply" sequence atomic under whatever exclusive borrow the
//! owner holds.

use heapless::Vec;

use crate::fmt::*;

pub const NUM_MAX_CLIENTS: usize = 32;
const NUM_MAX_MAPS: usize = 16;
const NUM_MAX_CHECKS: usize = 4;

/// Client reported as the winner while a debug force value is active
pub const DEBUG_FORCE_CLIENT: &str = "DEBUG_FORCE_CLIENT";

pub const READY_VOTER: &str = "READY_VOTER";
pub const SPEC_VOTER: &str = "SPEC_VOTER";
pub const DEEP_COUNT_VOTER: &str = "DEEP_COUNT_VOTER";
pub const SUPER_ENDURANCE_MODE_VOTER: &str = "SUPER_ENDURANCE_MODE_VOTER";

pub const GAUGE_SHUTDOWN_VOLTAGE_VOTABLE: &str = "GAUGE_SHUTDOWN_VOLTAGE";
pub const GAUGE_TERM_VOLTAGE_VOTABLE: &str = "GAUGE_TERM_VOLTAGE";
pub const GAUGE_UPDATE_VOTABLE: &str = "GAUGE_UPDATE";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VoteRule {
    /// Lowest enabled vote wins
    Min,
    /// Highest enabled vote wins
    Max,
    /// Result is 1 if any client is enabled
    SetAny,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VoteError {
    ClientTableFull,
    /// A check hook refused the vote with this code
    Rejected(i32),
}

/// An effective value the owner has to apply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Election {
    /// `None` when no client is enabled
    pub value: Option<i32>,
    pub client: Option<&'static str>,
    pub step: bool,
}

/// Inspects a vote before it is stored. A negative return rejects the vote.
pub type VoteCheck = fn(client: &str, enabled: bool, value: i32, step: bool) -> i32;

#[derive(Clone, Copy, Debug)]
struct Vote {
    client: &'static str,
    enabled: bool,
    value: i32,
}

pub struct Votable {
    name: &'static str,
    rule: VoteRule,
    default: Option<i32>,
    votes: Vec<Vote, NUM_MAX_CLIENTS>,
    maps: Vec<(i32, i32), NUM_MAX_MAPS>,
    checks: Vec<VoteCheck, NUM_MAX_CHECKS>,
    effective_id: Option<usize>,
    effective_result: Option<i32>,
    override_client: Option<&'static str>,
    override_result: Option<i32>,
    force_active: bool,
    force_val: i32,
    voted_on: bool,
}

impl Votable {
    pub fn new(name: &'static str, rule: VoteRule) -> Self {
        Self {
            name,
            rule,
            default: None,
            votes: Vec::new(),
            maps: Vec::new(),
            checks: Vec::new(),
            effective_id: None,
            effective_result: match rule {
                VoteRule::SetAny => Some(0),
                _ => None,
            },
            override_client: None,
            override_result: None,
            force_active: false,
            force_val: 0,
            voted_on: false,
        }
    }

    /// A votable that reports `default` while no client is enabled
    pub fn with_default(name: &'static str, rule: VoteRule, default: i32) -> Self {
        let mut votable = Self::new(name, rule);
        votable.default = Some(default);
        votable
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Compares `original` votes as if they were `mapped`. Duplicate mappings are ignored.
    pub fn add_map(&mut self, original: i32, mapped: i32) -> bool {
        if self.maps.iter().any(|(o, _)| *o == original) {
            error!("{}: duplicate mapping {} -> {}", self.name, original, mapped);
            return true;
        }

        self.maps.push((original, mapped)).is_ok()
    }

    pub fn add_check(&mut self, check: VoteCheck) -> bool {
        self.checks.push(check).is_ok()
    }

    fn register(&mut self, client: &'static str) -> Result<usize, VoteError> {
        self.votes
            .push(Vote {
                client,
                enabled: false,
                value: 0,
            })
            .map_err(|_| VoteError::ClientTableFull)?;

        Ok(self.votes.len() - 1)
    }

    fn mapped(&self, value: i32) -> i32 {
        self.maps
            .iter()
            .find(|(original, _)| *original == value)
            .map_or(value, |(_, mapped)| *mapped)
    }

    /// Runs the aggregation rule over all enabled votes, optionally skipping one client
    fn elect(&self, latest: usize, exclude: Option<&str>) -> (Option<i32>, Option<usize>) {
        let candidates = self
            .votes
            .iter()
            .enumerate()
            .filter(|(_, v)| exclude != Some(v.client));

        match self.rule {
            VoteRule::SetAny => {
                let any = candidates.fold(false, |acc, (_, v)| acc | v.enabled);
                (Some(any as i32), Some(latest))
            }
            VoteRule::Min | VoteRule::Max => {
                let mut winner: Option<(usize, i32)> = None;

                for (id, vote) in candidates.filter(|(_, v)| v.enabled) {
                    let value = self.mapped(vote.value);
                    let better = match winner {
                        None => true,
                        Some((_, best)) if self.rule == VoteRule::Min => value < best,
                        Some((_, best)) => value > best,
                    };

                    if better {
                        winner = Some((id, value));
                    }
                }

                match winner {
                    Some((id, _)) => (Some(self.votes[id].value), Some(id)),
                    None => (None, None),
                }
            }
        }
    }

    fn client_str(&self, id: Option<usize>) -> Option<&'static str> {
        id.and_then(|id| self.votes.get(id)).map(|v| v.client)
    }

    fn shadowed(&self) -> bool {
        self.force_active || self.override_result.is_some()
    }

    /// Registers or updates a client's vote.
    ///
    /// Returns the election to apply when the effective value changed, or when this is
    /// the first vote the votable ever saw. Nothing is returned while a force or override
    /// value shadows the normal result.
    pub fn vote(
        &mut self,
        client: &'static str,
        enabled: bool,
        value: i32,
        step: bool,
    ) -> Result<Option<Election>, VoteError> {
        let known = self.votes.iter().position(|v| v.client == client);
        if known.is_none() && self.votes.is_full() {
            return Err(VoteError::ClientTableFull);
        }

        let value = match self.rule {
            VoteRule::SetAny => enabled as i32,
            _ => value,
        };

        let current = known.map_or((false, 0), |id| (self.votes[id].enabled, self.votes[id].value));
        if self.voted_on && current == (enabled, value) {
            debug!("{}: {} ignoring similar vote {}", self.name, client, value);
            return Ok(None);
        }

        for check in self.checks.iter() {
            let rc = check(client, enabled, value, step);
            if rc < 0 {
                error!("{}: vote[{}] {} check error {}", self.name, client, value, rc);
                return Err(VoteError::Rejected(rc));
            }
        }

        // clients only take a slot once a vote is accepted
        let id = match known {
            Some(id) => id,
            None => self.register(client)?,
        };
        self.votes[id].enabled = enabled;
        self.votes[id].value = value;

        let (result, winner) = self.elect(id, None);
        let mut election = None;

        if !self.voted_on || result != self.effective_result {
            self.effective_id = winner;
            self.effective_result = result;
            debug!("{}: effective vote is now {} by {}", self.name, result, self.client_str(winner));

            if !self.shadowed() {
                election = Some(Election {
                    value: result,
                    client: self.client_str(winner),
                    step,
                });
            }
        } else if winner != self.effective_id {
            self.effective_id = winner;
        }

        self.voted_on = true;
        Ok(election)
    }

    /// Makes `client` win regardless of the other votes until disabled again
    pub fn override_vote(
        &mut self,
        client: &'static str,
        enabled: bool,
        value: i32,
        step: bool,
    ) -> Option<Election> {
        if self.force_active {
            self.override_result = if enabled { Some(value) } else { None };
            return None;
        }

        if enabled {
            self.override_client = Some(client);
            self.override_result = Some(value);
            Some(Election {
                value: Some(value),
                client: Some(client),
                step,
            })
        } else {
            self.override_result = None;
            self.override_client = None;
            Some(Election {
                value: self.effective_result,
                client: self.client_str(self.effective_id),
                step,
            })
        }
    }

    /// Debug force. While active, the forced value is the effective result.
    pub fn force(&mut self, active: bool, value: i32) -> Election {
        self.force_active = active;
        self.force_val = value;
        self.rerun_election(false)
    }

    /// Re-applies the current effective result
    pub fn rerun_election(&self, step: bool) -> Election {
        if self.force_active {
            Election {
                value: Some(self.force_val),
                client: Some(DEBUG_FORCE_CLIENT),
                step: false,
            }
        } else {
            Election {
                value: self.effective_result(),
                client: self.effective_client(),
                step,
            }
        }
    }

    pub fn effective_result(&self) -> Option<i32> {
        if self.force_active {
            return Some(self.force_val);
        }

        self.override_result
            .or(self.effective_result)
            .or(self.default)
    }

    /// Effective result as if `client` had not voted
    pub fn effective_result_excluding(&self, client: &str) -> Option<i32> {
        if self.force_active {
            return Some(self.force_val);
        }
        if self.override_result.is_some() {
            return self.override_result;
        }

        self.elect(0, Some(client)).0.or(self.default)
    }

    pub fn effective_client(&self) -> Option<&'static str> {
        if self.force_active {
            return Some(DEBUG_FORCE_CLIENT);
        }
        if self.override_result.is_some() {
            return self.override_client;
        }

        self.client_str(self.effective_id)
    }

    /// The client's own vote; `None` when it has not voted or is disabled
    pub fn client_vote(&self, client: &str) -> Option<i32> {
        let vote = self.votes.iter().find(|v| v.client == client)?;

        if vote.enabled || self.rule == VoteRule::SetAny {
            Some(vote.value)
        } else {
            None
        }
    }

    pub fn is_client_vote_enabled(&self, client: &str) -> bool {
        self.votes.iter().any(|v| v.client == client && v.enabled)
    }

    pub fn is_override_enabled(&self) -> bool {
        self.override_result.is_some()
    }
}

/// Name-keyed lookup over the votables of one owner
pub struct VotableRegistry<'a, const N: usize> {
    votables: Vec<&'a mut Votable, N>,
}

impl<'a, const N: usize> VotableRegistry<'a, N> {
    pub fn new() -> Self {
        Self { votables: Vec::new() }
    }

    pub fn register(&mut self, votable: &'a mut Votable) -> bool {
        if self.votables.iter().any(|v| v.name == votable.name) {
            return false;
        }
        self.votables.push(votable).is_ok()
    }

    pub fn find(&mut self, name: &str) -> Option<&mut Votable> {
        self.votables
            .iter_mut()
            .find(|v| v.name == name)
            .map(|v| &mut **v)
    }

    /// Votes on a votable by name. An unknown votable is logged and ignored.
    pub fn vote(
        &mut self,
        name: &str,
        client: &'static str,
        enabled: bool,
        value: i32,
        step: bool,
    ) -> Result<Option<Election>, VoteError> {
        match self.find(name) {
            Some(votable) => votable.vote(client, enabled, value, step),
            None => {
                error!("votable {} not found", name);
                Ok(None)
            }
        }
    }
}

impl<'a, const N: usize> Default for VotableRegistry<'a, N> {
    fn default() -> Self {
        Self::new()
    }
}
