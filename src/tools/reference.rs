//! In-process reference calculators
//!
//! Simplified, deterministic versions of the calculator service used for
//! local runs and tests. Figures are indicative only. Same inputs always give
//! the same output.

use super::{Calculator, Capability, ToolId};
use crate::country::Country;
use crate::models::{MemberContext, QueryParams};
use crate::Result;
use serde_json::{json, Value};

struct Regime {
    benefit_age: u32,
    retirement_age: u32,
    annual_return: f64,
}

fn regime(country: Country) -> Regime {
    match country {
        Country::Au => Regime {
            benefit_age: 67,
            retirement_age: 67,
            annual_return: 0.07,
        },
        Country::Us => Regime {
            benefit_age: 67,
            retirement_age: 67,
            annual_return: 0.06,
        },
        Country::Uk => Regime {
            benefit_age: 66,
            retirement_age: 66,
            annual_return: 0.05,
        },
        Country::In => Regime {
            benefit_age: 58,
            retirement_age: 58,
            annual_return: 0.0815,
        },
    }
}

// Age Pension assets test, single homeowner
const AU_ASSETS_TEST_LIMIT: f64 = 314_000.0;
const UK_FULL_STATE_PENSION_WEEKLY: f64 = 221.20;
const UK_TAX_FREE_SHARE: f64 = 0.25;
const UK_LUMP_SUM_ALLOWANCE: f64 = 268_275.0;
const US_EARLY_PENALTY: f64 = 0.10;
const US_FEDERAL_RATE: f64 = 0.22;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceCalculator;

impl ReferenceCalculator {
    pub fn new() -> Self {
        Self
    }

    /// The profile's age only applies under its own regime
    fn preservation_age(country: Country, member: &MemberContext) -> u32 {
        if member.country != country || member.preservation_age == 0 {
            country.default_preservation_age()
        } else {
            member.preservation_age
        }
    }

    fn eligibility(country: Country, member: &MemberContext) -> Value {
        let preservation_age = Self::preservation_age(country, member);
        json!({
            "preservation_age": preservation_age,
            "current_age": member.age,
            "can_access": member.age >= preservation_age,
            "years_until_access": preservation_age.saturating_sub(member.age),
        })
    }

    fn tax(country: Country, member: &MemberContext, params: &QueryParams) -> Value {
        let amount = params.withdrawal_amount.unwrap_or(member.super_balance);
        let preserved = member.age < Self::preservation_age(country, member);

        let (tax, tax_free, note) = match country {
            Country::Au => {
                if preserved {
                    (amount * 0.17, 0.0, "Taxed at 17% including Medicare levy before preservation age")
                } else {
                    (0.0, amount, "Tax-free from age 60")
                }
            }
            Country::Us => {
                let penalty = if preserved { amount * US_EARLY_PENALTY } else { 0.0 };
                (amount * US_FEDERAL_RATE + penalty, 0.0, "Federal income tax plus 10% penalty before 59½")
            }
            Country::Uk => {
                let tax_free = (amount * UK_TAX_FREE_SHARE).min(UK_LUMP_SUM_ALLOWANCE);
                ((amount - tax_free) * 0.20, tax_free, "25% tax-free, remainder at basic rate")
            }
            Country::In => {
                if preserved {
                    (amount * 0.10, 0.0, "TDS applies to early withdrawal")
                } else {
                    (0.0, amount, "Exempt after retirement under Section 10(12)")
                }
            }
        };

        json!({
            "withdrawal_amount": round2(amount),
            "tax_free_amount": round2(tax_free),
            "tax_amount": round2(tax),
            "net_amount": round2(amount - tax),
            "note": note,
        })
    }

    fn benefit(country: Country, member: &MemberContext) -> Value {
        let rules = regime(country);
        let age_eligible = member.age >= rules.benefit_age;

        match country {
            Country::Au => {
                let assessable = member.super_balance + member.other_assets;
                json!({
                    "benefit": "Age Pension",
                    "eligibility_age": rules.benefit_age,
                    "age_eligible": age_eligible,
                    "assessable_assets": round2(assessable),
                    "assets_test_limit": AU_ASSETS_TEST_LIMIT,
                    "eligible": age_eligible && assessable <= AU_ASSETS_TEST_LIMIT,
                })
            }
            Country::Us => json!({
                "benefit": "Social Security",
                "earliest_claim_age": 62,
                "full_retirement_age": rules.benefit_age,
                "eligible": member.age >= 62,
            }),
            Country::Uk => json!({
                "benefit": "New State Pension",
                "state_pension_age": rules.benefit_age,
                "weekly_full_rate": UK_FULL_STATE_PENSION_WEEKLY,
                "annual_full_rate": round2(UK_FULL_STATE_PENSION_WEEKLY * 52.0),
                "eligible": age_eligible,
            }),
            Country::In => json!({
                "benefit": "EPS pension",
                "pension_age": rules.benefit_age,
                "eligible": age_eligible,
                "nps_annuity_share": 0.40,
                "nps_lump_sum_share": 0.60,
            }),
        }
    }

    fn projection(country: Country, member: &MemberContext) -> Value {
        let rules = regime(country);
        let years = rules.retirement_age.saturating_sub(member.age);
        let projected = member.super_balance * (1.0 + rules.annual_return).powi(years as i32);

        json!({
            "current_balance": round2(member.super_balance),
            "annual_return": rules.annual_return,
            "years_to_retirement": years,
            "retirement_age": rules.retirement_age,
            "projected_balance": round2(projected),
        })
    }
}

#[async_trait::async_trait]
impl Calculator for ReferenceCalculator {
    async fn invoke(
        &self,
        capability: &Capability,
        member: &MemberContext,
        params: &QueryParams,
    ) -> Result<Value> {
        let country = capability.country;
        Ok(match capability.tool {
            ToolId::Eligibility => Self::eligibility(country, member),
            ToolId::Tax => Self::tax(country, member, params),
            ToolId::Benefit => Self::benefit(country, member),
            ToolId::Projection => Self::projection(country, member),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::sample_members;
    use crate::tools::CapabilityRegistry;

    fn member(country: Country) -> MemberContext {
        sample_members().into_iter().find(|m| m.country == country).unwrap()
    }

    #[tokio::test]
    async fn test_eligibility_uses_profile_preservation_age() {
        let registry = CapabilityRegistry::bundled().unwrap();
        let capability = registry.get(Country::Au, ToolId::Eligibility).unwrap();
        let au = member(Country::Au);

        let out = ReferenceCalculator
            .invoke(&capability, &au, &QueryParams::default())
            .await
            .unwrap();
        assert_eq!(out["preservation_age"], 60);
    }

    #[tokio::test]
    async fn test_uk_tax_free_portion() {
        let registry = CapabilityRegistry::bundled().unwrap();
        let capability = registry.get(Country::Uk, ToolId::Tax).unwrap();
        let params = QueryParams {
            withdrawal_amount: Some(100_000.0),
        };

        let out = ReferenceCalculator
            .invoke(&capability, &member(Country::Uk), &params)
            .await
            .unwrap();
        assert_eq!(out["tax_free_amount"], 25_000.0);
        assert_eq!(out["tax_amount"], 15_000.0);
    }

    #[tokio::test]
    async fn test_rules_follow_capability_country() {
        let registry = CapabilityRegistry::bundled().unwrap();
        let us = member(Country::Us);

        let capability = registry.get(Country::Au, ToolId::Eligibility).unwrap();
        let out = ReferenceCalculator
            .invoke(&capability, &us, &QueryParams::default())
            .await
            .unwrap();
        assert_eq!(out["preservation_age"], 60);

        let capability = registry.get(Country::Au, ToolId::Benefit).unwrap();
        let out = ReferenceCalculator
            .invoke(&capability, &us, &QueryParams::default())
            .await
            .unwrap();
        assert_eq!(out["benefit"], "Age Pension");
    }
}
