//! Stage 1: country-specific pattern rules

use crate::country::Country;
use crate::tools::ToolId;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

type RuleSet = &'static [(ToolId, &'static [&'static str])];

const AU_RULES: RuleSet = &[
    (ToolId::Eligibility, &[
        r"\bpreservation\s+age\b",
        r"\bwhen\s+can\s+i\s+(access|withdraw|get\s+at)\b",
        r"\bcondition\s+of\s+release\b",
    ]),
    (ToolId::Tax, &[r"\btax(es|ed|able)?\b", r"\btax[-\s]free\b"]),
    (ToolId::Benefit, &[r"\bage\s+pension\b", r"\bcentrelink\b", r"\bassets?\s+test\b"]),
    (ToolId::Projection, &[
        r"\bproject(ion|ed)?\b",
        r"\bretirement\s+standard\b",
        r"\bhow\s+much\s+will\s+i\s+have\b",
    ]),
];

const US_RULES: RuleSet = &[
    (ToolId::Eligibility, &[
        r"\bwhen\s+can\s+i\s+(access|withdraw)\b",
        r"\bpenalty[-\s]free\b",
        r"\b59(\.5|½)",
    ]),
    (ToolId::Tax, &[r"\btax(es|ed|able)?\b", r"\bearly\s+withdrawal\s+penalty\b"]),
    (ToolId::Benefit, &[r"\bsocial\s+security\b"]),
    (ToolId::Projection, &[
        r"\brmds?\b",
        r"\brequired\s+minimum\s+distributions?\b",
        r"\bproject(ion|ed)?\b",
    ]),
];

const UK_RULES: RuleSet = &[
    (ToolId::Eligibility, &[
        r"\bwhen\s+can\s+i\s+(access|take|draw)\b",
        r"\bminimum\s+pension\s+age\b",
    ]),
    (ToolId::Tax, &[r"\btax(es|ed|able)?\b", r"\btax[-\s]free\b", r"\blump\s+sum\b"]),
    (ToolId::Benefit, &[r"\bstate\s+pension\b", r"\bnational\s+insurance\b"]),
    (ToolId::Projection, &[r"\bdrawdown\b", r"\bproject(ion|ed)?\b"]),
];

const IN_RULES: RuleSet = &[
    (ToolId::Eligibility, &[
        r"\bwhen\s+can\s+i\s+(withdraw|access)\b",
        r"\bwithdrawal\s+eligib(le|ility)\b",
    ]),
    (ToolId::Tax, &[r"\btax(es|ed|able)?\b", r"\btds\b"]),
    (ToolId::Benefit, &[r"\beps\b", r"\bnps\b", r"\bmonthly\s+pension\b", r"\bannuity\b"]),
    (ToolId::Projection, &[
        r"\bproject(ion|ed)?\b",
        r"\binterest\s+rate\b",
        r"\bcorpus\s+(at|by)\b",
    ]),
];

fn rule_set(country: Country) -> RuleSet {
    match country {
        Country::Au => AU_RULES,
        Country::Us => US_RULES,
        Country::Uk => UK_RULES,
        Country::In => IN_RULES,
    }
}

lazy_static! {
    static ref COMPILED: HashMap<Country, Vec<(ToolId, Regex)>> = Country::ALL
        .iter()
        .map(|country| {
            let compiled = rule_set(*country)
                .iter()
                .flat_map(|(tool, patterns)| {
                    patterns.iter().map(move |p| {
                        (*tool, Regex::new(&format!("(?i){}", p)).expect("valid classifier rule"))
                    })
                })
                .collect();
            (*country, compiled)
        })
        .collect();
}

/// Distinct tools whose rules match, in rule order
pub fn matching_tools(query: &str, country: Country) -> Vec<ToolId> {
    let mut matched = Vec::new();
    if let Some(rules) = COMPILED.get(&country) {
        for (tool, re) in rules {
            if !matched.contains(tool) && re.is_match(query) {
                matched.push(*tool);
            }
        }
    }
    matched
}

/// The single tool matched, if exactly one
pub fn unambiguous_match(query: &str, country: Country) -> Option<ToolId> {
    match matching_tools(query, country).as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}
