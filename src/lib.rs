//! Pension Advisor Orchestrator
//!
//! Turns a member's retirement question into a validated, citation-backed
//! answer for four national pension regimes (AU, US, UK, IN):
//! - Deterministic safety guardrails on input and output
//! - Cheapest-first classification cascade (rules → similarity → LLM)
//! - Calculator tools resolved through a declarative capability registry
//! - LLM synthesis with an LLM judge and bounded retry
//! - Per-phase cost ledger and an append-only audit trail
//!
//! LIFECYCLE:
//! GUARDRAIL_IN → CLASSIFY → EXECUTE_TOOLS → SYNTHESIZE → VALIDATE → RETRY? → GUARDRAIL_OUT → DONE

pub mod agent;
pub mod api;
pub mod audit;
pub mod classifier;
pub mod config;
pub mod country;
pub mod error;
pub mod execution;
pub mod guardrails;
pub mod llm;
pub mod models;
pub mod profile;
pub mod synthesis;
pub mod tools;
pub mod verification;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use agent::{Orchestrator, OrchestratorState};
pub use country::Country;
