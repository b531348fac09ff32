//! Member profile store
//!
//! Profiles are read-only snapshots keyed by member id. A missing member is
//! always reported as [`OrchestrationError::MemberNotFound`], never as a
//! generic store failure.

use crate::country::Country;
use crate::error::OrchestrationError;
use crate::models::MemberContext;
use crate::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;

#[async_trait::async_trait]
pub trait MemberProfileStore: Send + Sync {
    async fn load_member(&self, member_id: &str) -> Result<MemberContext>;
}

/// In-memory profile store for development and tests
pub struct InMemoryProfileStore {
    members: Arc<RwLock<HashMap<String, MemberContext>>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self {
            members: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_members(members: impl IntoIterator<Item = MemberContext>) -> Self {
        let map = members
            .into_iter()
            .map(|m| (m.member_id.clone(), m))
            .collect();
        Self {
            members: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn upsert(&self, member: MemberContext) {
        let mut members = self.members.write().await;
        members.insert(member.member_id.clone(), member);
    }
}

impl Default for InMemoryProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MemberProfileStore for InMemoryProfileStore {
    async fn load_member(&self, member_id: &str) -> Result<MemberContext> {
        let members = self.members.read().await;
        members
            .get(member_id)
            .cloned()
            .ok_or_else(|| OrchestrationError::MemberNotFound(member_id.to_string()))
    }
}

/// Postgres-backed profile store (`member_profiles` table)
pub struct PostgresProfileStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresProfileStore {
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| OrchestrationError::Database(format!("Failed to create profile pool: {}", e)))?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS member_profiles (
                      member_id TEXT PRIMARY KEY,
                      name TEXT NOT NULL,
                      age INTEGER NOT NULL,
                      country TEXT NOT NULL,
                      super_balance DOUBLE PRECISION NOT NULL,
                      preservation_age INTEGER,
                      employment_status TEXT NOT NULL DEFAULT 'unknown',
                      marital_status TEXT,
                      other_assets DOUBLE PRECISION NOT NULL DEFAULT 0,
                      account_based_pension DOUBLE PRECISION NOT NULL DEFAULT 0,
                      annual_income_outside_super DOUBLE PRECISION NOT NULL DEFAULT 0,
                      debt DOUBLE PRECISION NOT NULL DEFAULT 0,
                      dependents INTEGER NOT NULL DEFAULT 0,
                      risk_profile TEXT,
                      home_ownership TEXT
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::Database(format!("Failed to initialize profile schema: {}", e))
            })?;

        Ok(())
    }
}

/// One `member_profiles` row; every column decodes strictly
#[derive(Debug, Clone, sqlx::FromRow)]
struct MemberRow {
    member_id: String,
    name: String,
    age: i32,
    country: String,
    super_balance: f64,
    preservation_age: Option<i32>,
    employment_status: String,
    marital_status: Option<String>,
    other_assets: f64,
    account_based_pension: f64,
    annual_income_outside_super: f64,
    debt: f64,
    dependents: i32,
    risk_profile: Option<String>,
    home_ownership: Option<String>,
}

impl TryFrom<MemberRow> for MemberContext {
    type Error = OrchestrationError;

    fn try_from(row: MemberRow) -> Result<Self> {
        let country: Country = row.country.parse()?;

        Ok(MemberContext {
            member_id: row.member_id,
            name: row.name,
            age: row.age.max(0) as u32,
            country,
            super_balance: row.super_balance,
            preservation_age: row
                .preservation_age
                .map(|p| p.max(0) as u32)
                .unwrap_or_else(|| country.default_preservation_age()),
            employment_status: row.employment_status,
            marital_status: row.marital_status,
            other_assets: row.other_assets,
            account_based_pension: row.account_based_pension,
            annual_income_outside_super: row.annual_income_outside_super,
            debt: row.debt,
            dependents: row.dependents.max(0) as u32,
            risk_profile: row.risk_profile,
            home_ownership: row.home_ownership,
        })
    }
}

#[async_trait::async_trait]
impl MemberProfileStore for PostgresProfileStore {
    async fn load_member(&self, member_id: &str) -> Result<MemberContext> {
        self.ensure_schema().await?;

        let row = sqlx::query_as::<_, MemberRow>("SELECT * FROM member_profiles WHERE member_id = $1")
            .bind(member_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OrchestrationError::ProfileStore(format!("Failed to load member: {}", e)))?;

        debug!(member_id = %member_id, found = row.is_some(), "Profile lookup");

        match row {
            Some(row) => MemberContext::try_from(row),
            None => Err(OrchestrationError::MemberNotFound(member_id.to_string())),
        }
    }
}

/// Demo members, one per country
pub fn sample_members() -> Vec<MemberContext> {
    let member = |id: &str, name: &str, age: u32, country: Country, balance: f64, status: &str| MemberContext {
        member_id: id.to_string(),
        name: name.to_string(),
        age,
        country,
        super_balance: balance,
        preservation_age: country.default_preservation_age(),
        employment_status: status.to_string(),
        marital_status: Some("Married".to_string()),
        other_assets: 50_000.0,
        account_based_pension: 0.0,
        annual_income_outside_super: 0.0,
        debt: 0.0,
        dependents: 0,
        risk_profile: Some("Balanced".to_string()),
        home_ownership: Some("Owner".to_string()),
    };

    vec![
        member("AU001", "Olivia Harris", 58, Country::Au, 420_000.0, "Full-time"),
        member("US001", "Michael Carter", 62, Country::Us, 310_000.0, "Part-time"),
        member("UK001", "Amelia Clarke", 57, Country::Uk, 185_000.0, "Full-time"),
        member("IN001", "Arjun Mehta", 55, Country::In, 2_400_000.0, "Full-time"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_lookup() {
        let store = InMemoryProfileStore::with_members(sample_members());
        let member = store.load_member("AU001").await.unwrap();
        assert_eq!(member.preservation_age, 60);
        assert_eq!(member.country, Country::Au);
    }

    #[tokio::test]
    async fn test_missing_member_is_distinct() {
        let store = InMemoryProfileStore::new();
        assert!(matches!(
            store.load_member("NOPE").await,
            Err(OrchestrationError::MemberNotFound(_))
        ));
    }

    fn row(country: &str) -> MemberRow {
        MemberRow {
            member_id: "AU900".to_string(),
            name: "Test Member".to_string(),
            age: 61,
            country: country.to_string(),
            super_balance: 250_000.0,
            preservation_age: None,
            employment_status: "Retired".to_string(),
            marital_status: None,
            other_assets: 10_000.0,
            account_based_pension: 0.0,
            annual_income_outside_super: 0.0,
            debt: 0.0,
            dependents: -1,
            risk_profile: None,
            home_ownership: None,
        }
    }

    #[test]
    fn test_row_conversion_defaults_preservation_age() {
        let member = MemberContext::try_from(row("AU")).unwrap();
        assert_eq!(member.preservation_age, 60);
        assert_eq!(member.dependents, 0);
        assert_eq!(member.other_assets, 10_000.0);
    }

    #[test]
    fn test_row_with_unknown_country_is_rejected() {
        assert!(MemberContext::try_from(row("NZ")).is_err());
    }

    #[tokio::test]
    async fn test_upsert_replaces_snapshot() {
        let store = InMemoryProfileStore::with_members(sample_members());
        let mut member = store.load_member("UK001").await.unwrap();
        member.age = 60;
        store.upsert(member).await;
        assert_eq!(store.load_member("UK001").await.unwrap().age, 60);
    }
}
