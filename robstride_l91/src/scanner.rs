/*!
Identifier enumeration that copes with CAN arbitration.

When several devices answer close together, the adapter forwards whichever
reply won arbitration and the slower one may arrive after a short read
window has closed. A single ascending sweep therefore misses high, slow
identifiers. Discovery runs two passes instead:

1. pass A, ascending, short timeout
2. pass B, descending, long timeout
3. optionally a passive listen for late replies

Every identifier that answered in any of them is live. Live identifiers
with equal signatures and small id gaps are grouped into one physical
motor. The whole procedure runs several times and must produce the same
grouping each time, otherwise the scan is reported as unstable.

Only Activate and LoadParameters probes are sent, never a jog.
*/

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{IoError, LinkError, ScanError};
use crate::frame::Frame;
use crate::link::MotorLink;
use crate::registry::{MotorRegistry, MotorState, PhysicalMotor, ResponseSignature};
use crate::transport::Transport;

/// Discovery tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanConfig {
    /// Lowest identifier probed
    pub lo: u8,
    /// Highest identifier probed, inclusive
    pub hi: u8,
    /// Read window of pass A
    pub short_timeout: Duration,
    /// Read window of pass B
    pub long_timeout: Duration,
    /// Largest id distance still merged into one group
    pub mask_gap_tolerance: u8,
    /// Number of full scans that must agree
    pub stability_runs: u32,
    /// Listen window after pass B; zero disables it
    pub passive_listen: Duration,
    /// Confirm each responder with a LoadParameters probe
    pub verify_with_parameters: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            lo: 1,
            hi: 255,
            short_timeout: Duration::from_millis(50),
            long_timeout: Duration::from_millis(250),
            mask_gap_tolerance: 8,
            stability_runs: 2,
            passive_listen: Duration::ZERO,
            verify_with_parameters: true,
        }
    }
}

/// Direction of one probe pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOrder {
    Ascending,
    Descending,
}

impl PassOrder {
    /// Identifiers of `[lo, hi]` in probe order
    pub fn ids(self, lo: u8, hi: u8) -> Vec<u8> {
        let ids = lo..=hi;
        match self {
            Self::Ascending => ids.collect(),
            Self::Descending => ids.rev().collect(),
        }
    }
}

/// What one live identifier answered during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub signature: ResponseSignature,
    /// LoadParameters was answered too
    pub verified: bool,
    /// The passes disagreed about the signature
    pub conflicted: bool,
}

impl Observation {
    fn from_replies(replies: &[&Frame], verified: bool) -> Self {
        Self {
            signature: ResponseSignature::from_replies(replies.iter().copied()),
            verified,
            conflicted: false,
        }
    }
}

/// Two-pass scanner over a borrowed link
pub struct ArbitrationAwareScanner<'a, T: Transport> {
    link: &'a mut MotorLink<T>,
    config: ScanConfig,
}

impl<'a, T: Transport> ArbitrationAwareScanner<'a, T> {
    pub fn new(link: &'a mut MotorLink<T>, config: ScanConfig) -> Self {
        Self { link, config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Run `stability_runs` full scans and return the agreed registry.
    ///
    /// Runs agree when they produce the same canonical ids and no
    /// identifier changes group between runs. Members seen in any run are
    /// merged into the result.
    pub fn scan(&mut self) -> Result<MotorRegistry, ScanError> {
        let runs = self.config.stability_runs.max(1);
        let mut observed = Vec::with_capacity(runs as usize);

        for run in 1..=runs {
            let registry = self.scan_once()?;
            info!("Scan run {}/{}: {}", run, runs, registry.describe_groups());
            observed.push(registry);
        }

        if !is_stable(&observed) {
            warn!("Scan unstable across {} runs, refusing to pick a grouping", observed.len());
            return Err(ScanError::Unstable { observed });
        }

        let merged = merge_runs(&observed);
        merged.validate()?;
        info!("Scan stable: {} motor(s) {}", merged.len(), merged.describe_groups());
        Ok(merged)
    }

    /// One pass A + pass B (+ listen) cycle, grouped
    pub fn scan_once(&mut self) -> Result<MotorRegistry, ScanError> {
        let ScanConfig { lo, hi, .. } = self.config;
        if lo > hi {
            return Err(ScanError::InvalidRange { lo, hi });
        }

        let mut live = self.probe_pass(PassOrder::Ascending, self.config.short_timeout)?;
        let pass_b = self.probe_pass(PassOrder::Descending, self.config.long_timeout)?;

        for (id, seen) in pass_b {
            match live.get_mut(&id) {
                Some(first) if first.signature != seen.signature => {
                    warn!(
                        "Id {} answered {} in pass A but {} in pass B; keeping pass A",
                        id,
                        first.signature.to_hex(),
                        seen.signature.to_hex()
                    );
                    first.conflicted = true;
                }
                Some(first) => first.verified |= seen.verified,
                None => {
                    debug!("Id {} only answered in pass B", id);
                    live.insert(id, seen);
                }
            }
        }

        if !self.config.passive_listen.is_zero() {
            self.collect_late_replies(&mut live)?;
        }

        let registry = group_responders(&live, self.config.mask_gap_tolerance);
        registry.validate()?;
        Ok(registry)
    }

    /// Probe every identifier of the range once in `order`
    pub fn probe_pass(
        &mut self,
        order: PassOrder,
        timeout: Duration,
    ) -> Result<BTreeMap<u8, Observation>, IoError> {
        let mut live = BTreeMap::new();

        for id in order.ids(self.config.lo, self.config.hi) {
            if let Some(seen) = self.probe(id, timeout)? {
                debug!("Id {} answered: {}", id, seen.signature.to_hex());
                live.insert(id, seen);
            }
        }

        info!(
            "{:?} pass over [{}, {}] ({:?} timeout): {} responder(s)",
            order,
            self.config.lo,
            self.config.hi,
            timeout,
            live.len()
        );
        Ok(live)
    }

    fn probe(&mut self, id: u8, timeout: Duration) -> Result<Option<Observation>, IoError> {
        let activated = match self.link.activate(id, timeout) {
            Ok(reply) => reply,
            Err(LinkError::NoResponse { .. }) => return Ok(None),
            Err(LinkError::Io(e)) => return Err(e),
        };

        if !self.config.verify_with_parameters {
            return Ok(Some(Observation::from_replies(&[&activated], false)));
        }

        match self.link.load_parameters(id, timeout) {
            Ok(parameters) => Ok(Some(Observation::from_replies(&[&activated, &parameters], true))),
            Err(LinkError::NoResponse { .. }) => {
                debug!("Id {} answered Activate but not LoadParameters", id);
                Ok(Some(Observation::from_replies(&[&activated], false)))
            }
            Err(LinkError::Io(e)) => Err(e),
        }
    }

    /// Replies name the motor id of their sender, not the alias it was
    /// probed under, so a late reply is credited to that motor id when it
    /// lies in the scanned range and dropped otherwise.
    fn collect_late_replies(&mut self, live: &mut BTreeMap<u8, Observation>) -> Result<(), IoError> {
        let ScanConfig { lo, hi, passive_listen, .. } = self.config;

        for frame in self.link.listen(passive_listen)? {
            if !frame.is_extended_reply() {
                debug!("Dropping late reply without an extended id: {}", hex::encode(frame.to_reply_bytes()));
                continue;
            }
            let id = frame.responder_id();
            if id < lo || id > hi {
                debug!("Dropping late reply from motor {} outside [{}, {}]", id, lo, hi);
                continue;
            }
            if live.contains_key(&id) {
                continue;
            }
            info!("Late reply from motor {} during passive listen", id);
            live.insert(id, Observation::from_replies(&[&frame], false));
        }
        Ok(())
    }
}

/// Group live identifiers into physical motors.
///
/// Identifiers join a group when their signature matches and their distance
/// to the group's highest member is at most `tolerance`. The canonical id is
/// the lowest member.
pub fn group_responders(live: &BTreeMap<u8, Observation>, tolerance: u8) -> MotorRegistry {
    struct Group<'o> {
        signature: &'o ResponseSignature,
        members: BTreeSet<u8>,
        last: u8,
        verified: bool,
        conflicted: bool,
    }

    let mut groups: Vec<Group> = Vec::new();
    let mut open: BTreeMap<&ResponseSignature, usize> = BTreeMap::new();

    for (&id, seen) in live {
        let joined = open.get(&seen.signature).copied().filter(|&index| {
            let gap = id - groups[index].last;
            gap <= tolerance
        });

        match joined {
            Some(index) => {
                let group = &mut groups[index];
                group.members.insert(id);
                group.last = id;
                group.verified |= seen.verified;
                group.conflicted |= seen.conflicted;
            }
            None => {
                open.insert(&seen.signature, groups.len());
                groups.push(Group {
                    signature: &seen.signature,
                    members: BTreeSet::from([id]),
                    last: id,
                    verified: seen.verified,
                    conflicted: seen.conflicted,
                });
            }
        }
    }

    let motors = groups.into_iter().filter_map(|group| {
        let state = if group.conflicted {
            MotorState::Faulted
        } else if group.verified {
            MotorState::Activated
        } else {
            MotorState::Discovered
        };
        PhysicalMotor::from_members(group.members, group.signature.clone(), state)
    });

    MotorRegistry::from_motors_unchecked(motors)
}

fn is_stable(runs: &[MotorRegistry]) -> bool {
    let Some(first) = runs.first() else {
        return true;
    };
    let canonical = first.canonical_ids();
    if runs.iter().any(|run| run.canonical_ids() != canonical) {
        return false;
    }

    // An id seen in several runs must always land in the same group
    let mut owner: BTreeMap<u8, u8> = BTreeMap::new();
    for run in runs {
        for motor in run.iter() {
            for &member in &motor.member_ids {
                if let Some(previous) = owner.insert(member, motor.canonical_id) {
                    if previous != motor.canonical_id {
                        return false;
                    }
                }
            }
        }
    }
    true
}

fn merge_runs(runs: &[MotorRegistry]) -> MotorRegistry {
    let Some(first) = runs.first() else {
        return MotorRegistry::new();
    };

    let motors = first.iter().map(|motor| {
        let mut merged = motor.clone();
        let seen: Vec<&PhysicalMotor> = runs
            .iter()
            .filter_map(|run| run.by_canonical_id(motor.canonical_id))
            .collect();

        for other in &seen {
            merged.member_ids.extend(other.member_ids.iter().copied());
        }
        merged.state = if seen.iter().any(|m| m.state == MotorState::Faulted) {
            MotorState::Faulted
        } else if seen.iter().any(|m| m.state == MotorState::Activated) {
            MotorState::Activated
        } else {
            MotorState::Discovered
        };
        merged
    });

    MotorRegistry::from_motors_unchecked(motors)
}
