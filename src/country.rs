//! Country regimes and their terminology
//!
//! Every supported pension regime is a variant of [`Country`]. Terminology
//! lookups are total matches, so adding a regime forces every table to be
//! extended at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Country {
    Au,
    Us,
    Uk,
    In,
}

impl Country {
    pub const ALL: [Country; 4] = [Country::Au, Country::Us, Country::Uk, Country::In];

    pub fn code(&self) -> &'static str {
        match self {
            Country::Au => "AU",
            Country::Us => "US",
            Country::Uk => "UK",
            Country::In => "IN",
        }
    }

    /// Statutory access age used when a profile omits it
    pub fn default_preservation_age(&self) -> u32 {
        match self {
            Country::Au => 60,
            Country::Us => 59,
            Country::Uk => 55,
            Country::In => 58,
        }
    }

    pub fn terminology(&self) -> &'static CountryTerminology {
        match self {
            Country::Au => &AU_TERMS,
            Country::Us => &US_TERMS,
            Country::Uk => &UK_TERMS,
            Country::In => &IN_TERMS,
        }
    }
}

impl fmt::Display for Country {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Country {
    type Err = crate::error::OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "AU" => Ok(Country::Au),
            "US" => Ok(Country::Us),
            "UK" | "GB" => Ok(Country::Uk),
            "IN" => Ok(Country::In),
            other => Err(crate::error::OrchestrationError::InvalidRequest(format!(
                "unsupported country code '{}'",
                other
            ))),
        }
    }
}

/// Country-specific vocabulary used in prompts and compliance checks
#[derive(Debug)]
pub struct CountryTerminology {
    pub name: &'static str,
    pub currency: &'static str,
    pub currency_symbol: &'static str,
    pub retirement_account_term: &'static str,
    pub balance_term: &'static str,
    pub advisor_title: &'static str,
    /// Concepts a compliant answer is expected to use
    pub required_concepts: &'static [&'static str],
    pub regulators: &'static [&'static str],
}

static AU_TERMS: CountryTerminology = CountryTerminology {
    name: "Australia",
    currency: "AUD",
    currency_symbol: "$",
    retirement_account_term: "superannuation",
    balance_term: "super balance",
    advisor_title: "superannuation advisor",
    required_concepts: &["preservation age", "super", "superannuation"],
    regulators: &["ATO", "Department of Social Services", "ASFA"],
};

static US_TERMS: CountryTerminology = CountryTerminology {
    name: "United States",
    currency: "USD",
    currency_symbol: "$",
    retirement_account_term: "401(k)",
    balance_term: "401(k) balance",
    advisor_title: "retirement planning advisor",
    required_concepts: &["401(k)", "IRA", "retirement"],
    regulators: &["IRS", "Social Security Administration"],
};

static UK_TERMS: CountryTerminology = CountryTerminology {
    name: "United Kingdom",
    currency: "GBP",
    currency_symbol: "£",
    retirement_account_term: "pension pot",
    balance_term: "pension pot value",
    advisor_title: "pensions advisor",
    required_concepts: &["State Pension", "pension"],
    regulators: &["HMRC", "DWP", "FCA"],
};

static IN_TERMS: CountryTerminology = CountryTerminology {
    name: "India",
    currency: "INR",
    currency_symbol: "₹",
    retirement_account_term: "EPF",
    balance_term: "EPF corpus",
    advisor_title: "retirement advisor",
    required_concepts: &["EPF", "provident fund", "pension"],
    regulators: &["EPFO", "Income Tax Department", "PFRDA"],
};
