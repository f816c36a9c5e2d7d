//! Routing Policy Parser
//!
//! Turns policy text into a [`RoutingPolicy`]. One rule per line:
//!
//! ```text
//! # comment
//! domain(suffix: example.com) && l4proto(tcp) -> proxy
//! !ip(10.0.0.0/8, 192.168.0.0/16) && port(80, 443) -> proxy
//! final: direct
//! ```

use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;

use super::error::RoutingError;
use super::types::{Clause, Function, Param, Rule, RoutingPolicy};

const CLAUSE_PATTERN: &str = r"^(!)?\s*([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)$";
const OUTBOUND_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_.-]*$";

struct Grammar {
    clause: Regex,
    outbound: Regex,
}

impl Grammar {
    fn new() -> Result<Self, RoutingError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| RoutingError::build(format!("invalid grammar: {}", e)))
        };
        Ok(Self {
            clause: compile(CLAUSE_PATTERN)?,
            outbound: compile(OUTBOUND_PATTERN)?,
        })
    }
}

/// Parse policy text. Exactly one `final:` directive is required.
pub fn parse_policy(text: &str) -> Result<RoutingPolicy, RoutingError> {
    let grammar = Grammar::new()?;
    let mut rules = Vec::new();
    let mut final_outbound: Option<String> = None;
    let mut last_line = 0;

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        last_line = line;
        let content = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        }
        .trim();
        if content.is_empty() {
            continue;
        }

        if let Some(name) = strip_final(content) {
            if final_outbound.is_some() {
                return Err(RoutingError::syntax(line, "duplicate final directive"));
            }
            let name = parse_outbound(&grammar, name, line)?;
            final_outbound = Some(name);
            continue;
        }

        rules.push(parse_rule(&grammar, content, line)?);
    }

    let final_outbound = final_outbound
        .ok_or_else(|| RoutingError::syntax(last_line.max(1), "missing final directive"))?;

    Ok(RoutingPolicy {
        rules,
        final_outbound,
    })
}

fn strip_final(content: &str) -> Option<&str> {
    let (head, rest) = content.split_once(':')?;
    head.trim().eq_ignore_ascii_case("final").then_some(rest)
}

fn parse_outbound(grammar: &Grammar, name: &str, line: usize) -> Result<String, RoutingError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RoutingError::syntax(line, "missing outbound name"));
    }
    if !grammar.outbound.is_match(name) {
        return Err(RoutingError::syntax(
            line,
            format!("invalid outbound name '{}'", name),
        ));
    }
    Ok(name.to_string())
}

/// Parse one `clause [&& clause ...] -> outbound` line
fn parse_rule(grammar: &Grammar, content: &str, line: usize) -> Result<Rule, RoutingError> {
    let (lhs, outbound) = content
        .rsplit_once("->")
        .ok_or_else(|| RoutingError::syntax(line, "expected '-> outbound'"))?;
    let outbound = parse_outbound(grammar, outbound, line)?;

    let mut clauses = Vec::new();
    for part in lhs.split("&&") {
        let part = part.trim();
        if part.is_empty() {
            return Err(RoutingError::syntax(line, "empty clause"));
        }
        clauses.push(parse_clause(grammar, part, line)?);
    }

    Ok(Rule {
        clauses,
        outbound,
        line,
    })
}

fn parse_clause(grammar: &Grammar, text: &str, line: usize) -> Result<Clause, RoutingError> {
    let caps = grammar
        .clause
        .captures(text)
        .ok_or_else(|| RoutingError::syntax(line, format!("malformed clause '{}'", text)))?;

    let negated = caps.get(1).is_some();
    let name = &caps[2];
    let function = Function::from_name(name)
        .ok_or_else(|| RoutingError::syntax(line, format!("unknown function '{}'", name)))?;

    let mut params = Vec::new();
    for token in caps[3].split(',') {
        let token = token.trim();
        if token.is_empty() {
            return Err(RoutingError::syntax(
                line,
                format!("empty parameter in '{}'", text),
            ));
        }
        params.push(parse_param(token, line)?);
    }

    Ok(Clause {
        function,
        negated,
        params,
    })
}

fn parse_param(token: &str, line: usize) -> Result<Param, RoutingError> {
    // IPv6 literals and `lo:hi` port ranges contain ':' but carry no key
    if token.parse::<IpNet>().is_ok() || token.parse::<IpAddr>().is_ok() || is_port_range(token) {
        return Ok(Param::bare(token));
    }

    match token.split_once(':') {
        Some((key, value)) => {
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return Err(RoutingError::syntax(
                    line,
                    format!("malformed parameter '{}'", token),
                ));
            }
            Ok(Param::new(key, value))
        }
        None => Ok(Param::bare(token)),
    }
}

fn is_port_range(token: &str) -> bool {
    token.split_once(':').is_some_and(|(lo, hi)| {
        lo.trim().parse::<u16>().is_ok() && hi.trim().parse::<u16>().is_ok()
    })
}
