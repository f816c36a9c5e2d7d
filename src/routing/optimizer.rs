//! Rule Optimizer Pipeline
//!
//! Each optimizer is a pure `RoutingPolicy -> RoutingPolicy` transform. The
//! pipeline never changes which outbound a connection is routed to.

use std::collections::HashSet;

use tracing::debug;

use super::error::RoutingError;
use super::types::*;

/// A single pass over the rule list
pub trait RulesOptimizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn optimize(&self, policy: RoutingPolicy) -> Result<RoutingPolicy, RoutingError>;
}

/// Run `optimizers` in order
pub fn apply_optimizers(
    mut policy: RoutingPolicy,
    optimizers: &[Box<dyn RulesOptimizer>],
) -> Result<RoutingPolicy, RoutingError> {
    for optimizer in optimizers {
        let before = policy.rules.len();
        policy = optimizer.optimize(policy)?;
        debug!(
            "Optimizer {} done: {} -> {} rules",
            optimizer.name(),
            before,
            policy.rules.len()
        );
    }
    Ok(policy)
}

/// Canonical key for `key` under `function`, or `None` if the key is unknown
pub fn canonical_key(function: Function, key: &str) -> Option<&'static str> {
    let key = key.trim().to_ascii_lowercase();
    let canonical = match function {
        Function::Domain => match key.as_str() {
            "" | "domain" | "suffix" => KEY_SUFFIX,
            "full" | "exact" => KEY_FULL,
            "keyword" | "contains" => KEY_KEYWORD,
            "geosite" => KEY_GEOSITE,
            _ => return None,
        },
        Function::Ip | Function::SourceIp => match key.as_str() {
            "" | "cidr" => KEY_CIDR,
            "geoip" => KEY_GEOIP,
            _ => return None,
        },
        Function::Port | Function::SourcePort => match key.as_str() {
            "" | "port" => KEY_PORT,
            _ => return None,
        },
        Function::L4Proto => match key.as_str() {
            "" | "proto" => KEY_PROTO,
            _ => return None,
        },
        Function::IpVersion => match key.as_str() {
            "" | "version" => KEY_VERSION,
            _ => return None,
        },
    };
    Some(canonical)
}

/// Canonical spelling of `value` for a parameter with canonical key `key`
pub fn canonical_value(key: &str, value: &str) -> String {
    let value = value.trim();
    match key {
        KEY_SUFFIX => value.trim_matches('.').to_ascii_lowercase(),
        KEY_FULL | KEY_KEYWORD => value.trim_end_matches('.').to_ascii_lowercase(),
        KEY_GEOSITE | KEY_GEOIP | KEY_PROTO => value.to_ascii_lowercase(),
        _ => value.to_string(),
    }
}

/// Rewrites keys to canonical form and normalizes case-insensitive values
#[derive(Debug, Default)]
pub struct RefineParamKeyOptimizer;

impl RulesOptimizer for RefineParamKeyOptimizer {
    fn name(&self) -> &'static str {
        "refine-param-key"
    }

    fn optimize(&self, mut policy: RoutingPolicy) -> Result<RoutingPolicy, RoutingError> {
        for rule in &mut policy.rules {
            for clause in &mut rule.clauses {
                for param in &mut clause.params {
                    let key = canonical_key(clause.function, &param.key).ok_or_else(|| {
                        RoutingError::syntax(
                            rule.line,
                            format!(
                                "unknown key '{}' for function '{}'",
                                param.key, clause.function
                            ),
                        )
                    })?;
                    param.value = canonical_value(key, &param.value);
                    param.key = key.to_string();
                }
            }
        }
        Ok(policy)
    }
}

/// Merges compatible rules and orders cheap predicates first.
///
/// Rules are split into maximal runs of consecutive rules that share an
/// outbound. Inside a run every rule yields the same result, so the run can be
/// rearranged freely; rules never cross a run boundary.
#[derive(Debug, Default)]
pub struct MergeAndSortOptimizer;

impl MergeAndSortOptimizer {
    fn merge_run(run: Vec<Rule>) -> Vec<Rule> {
        let mut merged: Vec<Rule> = Vec::with_capacity(run.len());
        for rule in run {
            let target = Self::is_mergeable(&rule)
                .then(|| {
                    merged.iter().position(|existing| {
                        Self::is_mergeable(existing)
                            && existing.clauses[0].function == rule.clauses[0].function
                    })
                })
                .flatten();

            match target {
                Some(index) => {
                    let existing = &mut merged[index];
                    existing.line = existing.line.min(rule.line);
                    for param in rule.clauses.into_iter().flat_map(|c| c.params) {
                        if !existing.clauses[0].params.contains(&param) {
                            existing.clauses[0].params.push(param);
                        }
                    }
                }
                None => merged.push(rule),
            }
        }

        // sort_by_key is stable: ties keep their original position
        merged.sort_by_key(Rule::cost);
        merged
    }

    fn is_mergeable(rule: &Rule) -> bool {
        rule.clauses.len() == 1 && !rule.clauses[0].negated
    }
}

impl RulesOptimizer for MergeAndSortOptimizer {
    fn name(&self) -> &'static str {
        "merge-and-sort"
    }

    fn optimize(&self, policy: RoutingPolicy) -> Result<RoutingPolicy, RoutingError> {
        let mut rules = Vec::with_capacity(policy.rules.len());
        let mut run: Vec<Rule> = Vec::new();

        for rule in policy.rules {
            if run.last().is_some_and(|last| last.outbound != rule.outbound) {
                rules.extend(Self::merge_run(std::mem::take(&mut run)));
            }
            run.push(rule);
        }
        rules.extend(Self::merge_run(run));

        Ok(RoutingPolicy {
            rules,
            final_outbound: policy.final_outbound,
        })
    }
}

/// Drops repeated params inside a clause and repeated rules
#[derive(Debug, Default)]
pub struct DeduplicateOptimizer;

impl RulesOptimizer for DeduplicateOptimizer {
    fn name(&self) -> &'static str {
        "deduplicate"
    }

    fn optimize(&self, policy: RoutingPolicy) -> Result<RoutingPolicy, RoutingError> {
        let mut rules: Vec<Rule> = Vec::with_capacity(policy.rules.len());

        for mut rule in policy.rules {
            for clause in &mut rule.clauses {
                let mut seen = HashSet::new();
                clause.params.retain(|param| seen.insert(param.clone()));
            }
            // a later copy of an earlier rule can never win
            if !rules.iter().any(|existing| existing.same_as(&rule)) {
                rules.push(rule);
            }
        }

        Ok(RoutingPolicy {
            rules,
            final_outbound: policy.final_outbound,
        })
    }
}
