//! Whether a pruning run is worth doing.
//!
//! The decision compares point-in-time sizes of the transaction collection.
//! It is a cheap trigger, not an estimate of how many transactions are
//! actually eligible.

use std::fmt;

use crate::config::PruneOptions;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PruneReason {
    NoPreviousRun,
    NotEnoughNewTransactions,
    TooManyNewTransactions,
    GrownSignificantly,
    NotGrownSignificantly,
}

impl fmt::Display for PruneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::NoPreviousRun => "no pruning run found",
            Self::NotEnoughNewTransactions => "not enough new transactions",
            Self::TooManyNewTransactions => "too many new transactions",
            Self::GrownSignificantly => "transactions have grown significantly",
            Self::NotGrownSignificantly => "transactions have not grown significantly",
        };
        f.write_str(reason)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PruneDecision {
    pub required: bool,
    pub reason: PruneReason,
}

impl PruneDecision {
    fn prune(reason: PruneReason) -> Self {
        Self {
            required: true,
            reason,
        }
    }

    fn skip(reason: PruneReason) -> Self {
        Self {
            required: false,
            reason,
        }
    }
}

/// Decide whether to prune given the transaction count after the last run
/// (`None` when no run was recorded) and the current count.
///
/// `options` should already be resolved.
pub fn should_prune(last_count: Option<u64>, count: u64, options: &PruneOptions) -> PruneDecision {
    let Some(last_count) = last_count else {
        return PruneDecision::prune(PruneReason::NoPreviousRun);
    };
    let difference = count as i128 - last_count as i128;
    if difference < i128::from(options.min_new_transactions) {
        return PruneDecision::skip(PruneReason::NotEnoughNewTransactions);
    }
    if difference > i128::from(options.max_new_transactions) {
        return PruneDecision::prune(PruneReason::TooManyNewTransactions);
    }
    if count as f64 >= last_count as f64 * options.prune_factor {
        return PruneDecision::prune(PruneReason::GrownSignificantly);
    }
    PruneDecision::skip(PruneReason::NotGrownSignificantly)
}
