//! Account resolution from mappings
//!
//! `resolve` is a pure function of its inputs. Policy that depends on more
//! than the tables (the single-account shortcut, prompting) lives in the
//! coordinator.

use super::{PatternRule, RemoteIdentity};
use crate::{Account, MatchRule, Mapping};

/// Outcome of resolving a remote against the mapping table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<'a> {
    /// Exactly one account applies
    Unique(&'a Account),
    /// A human has to choose
    Ambiguous {
        /// Accounts worth suggesting, best first
        candidates: Vec<&'a Account>,
        /// Why the outcome is not unique
        reason: Ambiguity,
    },
    /// No rule matched and there is no account to suggest
    NotFound,
}

/// Why a resolution is ambiguous
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ambiguity {
    /// Several equally specific rules created at the same instant
    Tie,
    /// No rule matched but exactly one account exists
    SoleAccountUnmapped,
}

struct Candidate<'a> {
    specificity: usize,
    mapping: &'a Mapping,
    account: &'a Account,
}

/// Resolve which account applies to `remote`
///
/// Exact rules win outright. Otherwise the matching pattern rules with the
/// longest literal prefix are kept, and among those the most recently
/// created. Mappings whose account no longer exists are ignored.
pub fn resolve<'a>(
    remote: &RemoteIdentity,
    mappings: &'a [Mapping],
    accounts: &'a [Account],
) -> Resolution<'a> {
    let live = mappings.iter().filter_map(|mapping| {
        accounts
            .iter()
            .find(|a| a.id == mapping.account_id)
            .map(|account| (mapping, account))
    });

    let mut candidates = Vec::new();
    for (mapping, account) in live {
        match &mapping.rule {
            MatchRule::Exact(text) => {
                if text == remote.as_str() {
                    return Resolution::Unique(account);
                }
            }
            MatchRule::Pattern(text) => {
                // Invalid patterns are rejected on insert; skip any that slipped in
                let Ok(rule) = PatternRule::new(text) else {
                    continue;
                };
                if rule.matches(remote.as_str()) {
                    candidates.push(Candidate {
                        specificity: rule.specificity(),
                        mapping,
                        account,
                    });
                }
            }
        }
    }

    let Some(best) = candidates.iter().map(|c| c.specificity).max() else {
        return match accounts {
            [only] => Resolution::Ambiguous {
                candidates: vec![only],
                reason: Ambiguity::SoleAccountUnmapped,
            },
            _ => Resolution::NotFound,
        };
    };
    candidates.retain(|c| c.specificity == best);

    if let Some(account) = single_account(&candidates) {
        return Resolution::Unique(account);
    }

    let newest = candidates
        .iter()
        .map(|c| c.mapping.created_at)
        .max()
        .unwrap_or_default();
    candidates.retain(|c| c.mapping.created_at == newest);

    if let Some(account) = single_account(&candidates) {
        return Resolution::Unique(account);
    }

    let mut tied: Vec<&Account> = Vec::new();
    for candidate in &candidates {
        if !tied.iter().any(|a| a.id == candidate.account.id) {
            tied.push(candidate.account);
        }
    }

    Resolution::Ambiguous {
        candidates: tied,
        reason: Ambiguity::Tie,
    }
}

/// The account shared by every candidate, if there is exactly one
fn single_account<'a>(candidates: &[Candidate<'a>]) -> Option<&'a Account> {
    let first = candidates.first()?.account;
    candidates
        .iter()
        .all(|c| c.account.id == first.id)
        .then_some(first)
}
