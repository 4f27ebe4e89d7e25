use itertools::Itertools;
use thiserror::Error;
use tracing::{debug, warn};


/// maximum number of proportional rescaling passes
const SCALING_PASSES: usize = 5;
/// maximum number of remainder correction passes
const CORRECTION_PASSES: usize = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("the calculation requires at least {required} processes while the environment provides only {available}")]
    Infeasible { required: u32, available: u32 },
}

impl AllocationError {
    /// number of processes missing to satisfy all minimums
    pub fn deficit(&self) -> u32 {
        match self {
            Self::Infeasible {
                required,
                available,
            } => required - available,
        }
    }
}

/// Process bounds a single domain reports before allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainResourceSpec {
    pub requested: u32,
    pub min: u32,
    /// `None` means unbounded (the total is the only limit)
    pub max: Option<u32>,
    pub pinned: bool,
}

impl DomainResourceSpec {
    pub fn new(requested: u32, min: u32, max: Option<u32>) -> Self {
        Self {
            requested,
            min,
            max,
            pinned: false,
        }
    }

    /// spec whose count must not be rescaled
    pub fn pinned(requested: u32) -> Self {
        Self {
            requested,
            min: requested,
            max: Some(requested),
            pinned: true,
        }
    }
}

/// Resolved process counts, one per input spec and in input order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationResult {
    pub counts: Vec<u32>,
    /// total the caller asked for, if any
    pub target: Option<u32>,
}

impl AllocationResult {
    pub fn total(&self) -> u32 {
        self.counts.iter().sum()
    }

    /// whether the counts add up to the requested total
    pub fn is_exact(&self) -> bool {
        self.target.map_or(true, |target| target == self.total())
    }
}

/// Working record for one spec during rebalancing
#[derive(Debug, Clone, Copy)]
struct Slot {
    count: i64,
    min: i64,
    max: i64,
    pinned: bool,
}

impl Slot {
    /// clamp into bounds, pinning the slot when a bound was hit
    /// returns true if the slot became pinned
    fn clamp(&mut self) -> bool {
        if self.count < self.min {
            self.count = self.min;
            self.pinned = true;
        } else if self.count > self.max {
            self.count = self.max;
            self.pinned = true;
        }

        self.pinned
    }
}

/// Distribute `total` processes over the given specs.
///
/// Without a total, or when the requested counts already add up to it, the
/// requested counts are returned unchanged. Otherwise counts are rescaled
/// proportionally and then nudged by a bounded remainder correction. The
/// result is best effort: if the bounds prevent an exact match a warning is
/// emitted and the closest distribution found is returned.
pub fn allocate(
    specs: &[DomainResourceSpec],
    total: Option<u32>,
) -> Result<AllocationResult, AllocationError> {
    let requested_sum: u32 = specs.iter().map(|spec| spec.requested).sum();

    let total = match total {
        None => {
            return Ok(AllocationResult {
                counts: specs.iter().map(|spec| spec.requested).collect(),
                target: None,
            })
        }
        Some(total) if total == requested_sum => {
            return Ok(AllocationResult {
                counts: specs.iter().map(|spec| spec.requested).collect(),
                target: Some(total),
            })
        }
        Some(total) => total,
    };

    let min_sum: u32 = specs.iter().map(|spec| spec.min).sum();

    if total < min_sum {
        return Err(AllocationError::Infeasible {
            required: min_sum,
            available: total,
        });
    }

    let target = i64::from(total);
    let mut slots = specs
        .iter()
        .map(|spec| Slot {
            count: i64::from(spec.requested),
            min: i64::from(spec.min),
            max: i64::from(spec.max.unwrap_or(total)),
            pinned: spec.pinned,
        })
        .collect_vec();

    let mut sum = i64::from(requested_sum);
    let mut fixed_procs: i64 = slots
        .iter()
        .filter(|slot| slot.pinned)
        .map(|slot| slot.count)
        .sum();

    // proportional rescaling of all unpinned slots
    let mut passes = 0;
    while sum != target && !all_pinned(&slots) && passes < SCALING_PASSES {
        let numerator = target - fixed_procs;
        let denominator = sum - fixed_procs;

        if denominator <= 0 {
            break;
        }

        sum = 0;

        for slot in slots.iter_mut() {
            if !slot.pinned {
                // integer arithmetic keeps the floor exact
                slot.count = slot.count * numerator / denominator;

                if slot.clamp() {
                    fixed_procs += slot.count;
                }
            }
            sum += slot.count;
        }

        passes += 1;
        debug!(pass = passes, sum = sum, target = target, "Rescaled process counts");
    }

    // remainder correction for rounding losses
    passes = 0;
    while sum != target && !all_pinned(&slots) && passes < CORRECTION_PASSES {
        let unpinned = slots.iter().filter(|slot| !slot.pinned).count() as f64;
        let mut delta = ((sum - target) as f64 / unpinned).round() as i64;

        if delta == 0 {
            delta = if sum < target { -1 } else { 1 };
        }

        for slot in slots.iter_mut() {
            if !slot.pinned {
                let previous = slot.count;
                slot.count -= delta;
                slot.clamp();
                sum += slot.count - previous;
            }

            if sum == target {
                break;
            }
        }

        passes += 1;
        debug!(pass = passes, sum = sum, target = target, "Corrected process counts");
    }

    let result = AllocationResult {
        // every slot is clamped into [min, max] with min >= 0
        counts: slots.iter().map(|slot| slot.count.max(0) as u32).collect(),
        target: Some(total),
    };

    if !result.is_exact() {
        warn!(
            used = sum,
            provided = total,
            "Total number of processes used ({sum}) is different from the number provided by the environment ({total})"
        );
    }

    Ok(result)
}

fn all_pinned(slots: &[Slot]) -> bool {
    slots.iter().all(|slot| slot.pinned)
}
