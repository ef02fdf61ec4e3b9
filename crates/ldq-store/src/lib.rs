//! Record store adapter: lead reads/writes and the activity log.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use ldq_core::{ActivityEntry, LeadId, LeadRecord, UserId};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "ldq-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("store migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// One predicate clause. Text matches are case-insensitive; platform is an
/// exact match; the owner clauses compare against rows that have an owner.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchClause {
    ContactNameContains(String),
    ContactNameEquals(String),
    CompanyContains(String),
    CompanyEquals(String),
    NotesContain(String),
    PlatformEquals(String),
    OwnerEquals(UserId),
    OwnerDiffers(UserId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanOrder {
    #[default]
    CreatedAtDesc,
    IdAsc,
}

/// Filter over live leads: `any_of` clauses are OR'd together, `all_of`
/// clauses are AND'd on top. An empty `any_of` group places no restriction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeadFilter {
    pub any_of: Vec<MatchClause>,
    pub all_of: Vec<MatchClause>,
    pub order: ScanOrder,
    pub limit: Option<i64>,
}

/// Patch-style lead update; only the populated fields are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeadUpdate {
    pub owner_id: Option<UserId>,
    pub company: Option<String>,
    pub stage: Option<String>,
}

impl LeadUpdate {
    pub fn owner(owner_id: UserId) -> Self {
        Self {
            owner_id: Some(owner_id),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.owner_id.is_none() && self.company.is_none() && self.stage.is_none()
    }
}

/// Read/write access to lead records and the append-only activity log.
#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn find_by_id(&self, id: LeadId) -> Result<Option<LeadRecord>, StoreError>;

    /// Live records (`deleted_at` unset) matching the filter.
    async fn find_live(&self, filter: &LeadFilter) -> Result<Vec<LeadRecord>, StoreError>;

    /// Returns the number of rows affected; 0 when the lead is missing,
    /// already deleted, or the update is empty.
    async fn update(&self, id: LeadId, update: LeadUpdate) -> Result<u64, StoreError>;

    /// Marks the lead deleted. Returns false when it was already gone.
    async fn soft_delete(&self, id: LeadId) -> Result<bool, StoreError>;

    async fn append_activity(&self, entry: ActivityEntry) -> Result<(), StoreError>;
}

pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!().run(pool).await?;
    Ok(())
}

const LEAD_COLUMNS: &str =
    "id, contact_name, company, platform, deal_value, notes, owner_id, stage, created_at, deleted_at";

/// Postgres-backed [`LeadStore`].
#[derive(Debug, Clone)]
pub struct PgLeadStore {
    pool: PgPool,
}

impl PgLeadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_clause(builder: &mut QueryBuilder<'_, Postgres>, clause: &MatchClause) {
    match clause {
        MatchClause::ContactNameContains(needle) => {
            builder
                .push("LOWER(contact_name) LIKE '%' || LOWER(")
                .push_bind(needle.clone())
                .push(") || '%'");
        }
        MatchClause::ContactNameEquals(needle) => {
            builder
                .push("LOWER(contact_name) = LOWER(")
                .push_bind(needle.clone())
                .push(")");
        }
        MatchClause::CompanyContains(needle) => {
            builder
                .push("LOWER(company) LIKE '%' || LOWER(")
                .push_bind(needle.clone())
                .push(") || '%'");
        }
        MatchClause::CompanyEquals(needle) => {
            builder
                .push("LOWER(company) = LOWER(")
                .push_bind(needle.clone())
                .push(")");
        }
        MatchClause::NotesContain(needle) => {
            builder
                .push("LOWER(notes) LIKE '%' || LOWER(")
                .push_bind(needle.clone())
                .push(") || '%'");
        }
        MatchClause::PlatformEquals(platform) => {
            builder.push("platform = ").push_bind(platform.clone());
        }
        MatchClause::OwnerEquals(owner) => {
            builder.push("owner_id = ").push_bind(*owner);
        }
        MatchClause::OwnerDiffers(owner) => {
            builder
                .push("(owner_id IS NOT NULL AND owner_id <> ")
                .push_bind(*owner)
                .push(")");
        }
    }
}

fn row_to_lead(row: &sqlx::postgres::PgRow) -> Result<LeadRecord, sqlx::Error> {
    Ok(LeadRecord {
        id: row.try_get("id")?,
        contact_name: row.try_get("contact_name")?,
        company: row.try_get("company")?,
        platform: row.try_get("platform")?,
        deal_value: row.try_get("deal_value")?,
        notes: row.try_get("notes")?,
        owner_id: row.try_get("owner_id")?,
        stage: row.try_get("stage")?,
        created_at: row.try_get("created_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

#[async_trait]
impl LeadStore for PgLeadStore {
    async fn find_by_id(&self, id: LeadId) -> Result<Option<LeadRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_lead).transpose().map_err(Into::into)
    }

    async fn find_live(&self, filter: &LeadFilter) -> Result<Vec<LeadRecord>, StoreError> {
        let mut builder = QueryBuilder::new(format!(
            "SELECT {LEAD_COLUMNS} FROM leads WHERE deleted_at IS NULL"
        ));

        if !filter.any_of.is_empty() {
            builder.push(" AND (");
            for (i, clause) in filter.any_of.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                push_clause(&mut builder, clause);
            }
            builder.push(")");
        }
        for clause in &filter.all_of {
            builder.push(" AND ");
            push_clause(&mut builder, clause);
        }

        match filter.order {
            ScanOrder::CreatedAtDesc => builder.push(" ORDER BY created_at DESC"),
            ScanOrder::IdAsc => builder.push(" ORDER BY id ASC"),
        };
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        debug!(matched = rows.len(), "lead scan");
        rows.iter()
            .map(row_to_lead)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    async fn update(&self, id: LeadId, update: LeadUpdate) -> Result<u64, StoreError> {
        if update.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::new("UPDATE leads SET updated_at = NOW()");
        if let Some(owner) = update.owner_id {
            builder.push(", owner_id = ").push_bind(owner);
        }
        if let Some(company) = update.company {
            builder.push(", company = ").push_bind(company);
        }
        if let Some(stage) = update.stage {
            builder.push(", stage = ").push_bind(stage);
        }
        builder
            .push(" WHERE id = ")
            .push_bind(id)
            .push(" AND deleted_at IS NULL");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn soft_delete(&self, id: LeadId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE leads SET deleted_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_activity(&self, entry: ActivityEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO activities (lead_id, kind, description, occurred_at, user_id) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entry.lead_id)
        .bind(&entry.kind)
        .bind(&entry.description)
        .bind(entry.occurred_at)
        .bind(entry.user_id)
        .execute(&self.pool)
        .await?;
        // Activity on a lead also bumps the lead itself.
        sqlx::query("UPDATE leads SET updated_at = NOW() WHERE id = $1")
            .bind(entry.lead_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory [`LeadStore`] mirroring the Postgres predicate semantics,
/// including NULL-field behavior. Backs pipeline tests and local runs
/// without a database.
#[derive(Debug, Default)]
pub struct MemoryLeadStore {
    leads: Mutex<Vec<LeadRecord>>,
    activities: Mutex<Vec<ActivityEntry>>,
}

impl MemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, lead: LeadRecord) {
        self.leads.lock().unwrap().push(lead);
    }

    pub fn lead(&self, id: LeadId) -> Option<LeadRecord> {
        self.leads.lock().unwrap().iter().find(|l| l.id == id).cloned()
    }

    pub fn activities(&self) -> Vec<ActivityEntry> {
        self.activities.lock().unwrap().clone()
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn clause_matches(lead: &LeadRecord, clause: &MatchClause) -> bool {
    match clause {
        MatchClause::ContactNameContains(needle) => contains_ci(&lead.contact_name, needle),
        MatchClause::ContactNameEquals(needle) => {
            lead.contact_name.to_lowercase() == needle.to_lowercase()
        }
        MatchClause::CompanyContains(needle) => lead
            .company
            .as_deref()
            .is_some_and(|company| contains_ci(company, needle)),
        MatchClause::CompanyEquals(needle) => lead
            .company
            .as_deref()
            .is_some_and(|company| company.to_lowercase() == needle.to_lowercase()),
        MatchClause::NotesContain(needle) => lead
            .notes
            .as_deref()
            .is_some_and(|notes| contains_ci(notes, needle)),
        MatchClause::PlatformEquals(platform) => lead.platform == *platform,
        MatchClause::OwnerEquals(owner) => lead.owner_id == Some(*owner),
        MatchClause::OwnerDiffers(owner) => {
            lead.owner_id.is_some() && lead.owner_id != Some(*owner)
        }
    }
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
    async fn find_by_id(&self, id: LeadId) -> Result<Option<LeadRecord>, StoreError> {
        Ok(self.lead(id))
    }

    async fn find_live(&self, filter: &LeadFilter) -> Result<Vec<LeadRecord>, StoreError> {
        let leads = self.leads.lock().unwrap();
        let mut matched: Vec<LeadRecord> = leads
            .iter()
            .filter(|lead| lead.is_live())
            .filter(|lead| {
                filter.any_of.is_empty()
                    || filter.any_of.iter().any(|c| clause_matches(lead, c))
            })
            .filter(|lead| filter.all_of.iter().all(|c| clause_matches(lead, c)))
            .cloned()
            .collect();

        match filter.order {
            ScanOrder::CreatedAtDesc => matched.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            ScanOrder::IdAsc => matched.sort_by_key(|lead| lead.id),
        }
        if let Some(limit) = filter.limit {
            matched.truncate(limit.max(0) as usize);
        }
        Ok(matched)
    }

    async fn update(&self, id: LeadId, update: LeadUpdate) -> Result<u64, StoreError> {
        if update.is_empty() {
            return Ok(0);
        }
        let mut leads = self.leads.lock().unwrap();
        let Some(lead) = leads.iter_mut().find(|l| l.id == id && l.is_live()) else {
            return Ok(0);
        };
        if let Some(owner) = update.owner_id {
            lead.owner_id = Some(owner);
        }
        if let Some(company) = update.company {
            lead.company = Some(company);
        }
        if let Some(stage) = update.stage {
            lead.stage = stage;
        }
        Ok(1)
    }

    async fn soft_delete(&self, id: LeadId) -> Result<bool, StoreError> {
        let mut leads = self.leads.lock().unwrap();
        let Some(lead) = leads.iter_mut().find(|l| l.id == id && l.is_live()) else {
            return Ok(false);
        };
        lead.deleted_at = Some(Utc::now());
        Ok(true)
    }

    async fn append_activity(&self, entry: ActivityEntry) -> Result<(), StoreError> {
        self.activities.lock().unwrap().push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn lead(id: LeadId, name: &str, company: Option<&str>, platform: &str) -> LeadRecord {
        LeadRecord {
            id,
            contact_name: name.to_string(),
            company: company.map(str::to_string),
            platform: platform.to_string(),
            deal_value: 1000.0,
            notes: None,
            owner_id: Some(6),
            stage: "new".to_string(),
            created_at: Utc
                .with_ymd_and_hms(2026, 3, 1, 12, 0, id as u32 % 60)
                .single()
                .unwrap(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn substring_match_is_case_insensitive() {
        let store = MemoryLeadStore::new();
        store.insert(lead(1, "Jane Doe", Some("Acme"), "LinkedIn"));

        let filter = LeadFilter {
            any_of: vec![MatchClause::ContactNameContains("jane".into())],
            ..LeadFilter::default()
        };
        let found = store.find_live(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 1);
    }

    #[tokio::test]
    async fn null_company_never_matches_company_clauses() {
        let store = MemoryLeadStore::new();
        store.insert(lead(1, "Jane Doe", None, "LinkedIn"));

        let filter = LeadFilter {
            any_of: vec![MatchClause::CompanyContains("acme".into())],
            ..LeadFilter::default()
        };
        assert!(store.find_live(&filter).await.unwrap().is_empty());

        let filter = LeadFilter {
            any_of: vec![MatchClause::CompanyEquals("acme".into())],
            ..LeadFilter::default()
        };
        assert!(store.find_live(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn owner_differs_skips_unowned_rows() {
        let store = MemoryLeadStore::new();
        let mut unowned = lead(1, "A", None, "Upwork");
        unowned.owner_id = None;
        store.insert(unowned);
        let mut routed = lead(2, "B", None, "Upwork");
        routed.owner_id = Some(4);
        store.insert(routed);
        store.insert(lead(3, "C", None, "Upwork")); // owner 6

        let filter = LeadFilter {
            all_of: vec![MatchClause::OwnerDiffers(6)],
            order: ScanOrder::IdAsc,
            ..LeadFilter::default()
        };
        let found = store.find_live(&filter).await.unwrap();
        assert_eq!(found.iter().map(|l| l.id).collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn soft_delete_excludes_from_scans_and_is_idempotent() {
        let store = MemoryLeadStore::new();
        store.insert(lead(1, "Jane Doe", None, "LinkedIn"));

        assert!(store.soft_delete(1).await.unwrap());
        assert!(!store.soft_delete(1).await.unwrap());

        let found = store.find_live(&LeadFilter::default()).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn update_returns_affected_count() {
        let store = MemoryLeadStore::new();
        store.insert(lead(1, "Jane Doe", None, "LinkedIn"));

        assert_eq!(store.update(1, LeadUpdate::owner(4)).await.unwrap(), 1);
        assert_eq!(store.lead(1).unwrap().owner_id, Some(4));
        assert_eq!(store.update(99, LeadUpdate::owner(4)).await.unwrap(), 0);
        assert_eq!(store.update(1, LeadUpdate::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ordering_and_limit_apply() {
        let store = MemoryLeadStore::new();
        store.insert(lead(1, "A", None, "Upwork"));
        store.insert(lead(2, "B", None, "Upwork"));
        store.insert(lead(3, "C", None, "Upwork"));

        let filter = LeadFilter {
            order: ScanOrder::CreatedAtDesc,
            limit: Some(2),
            ..LeadFilter::default()
        };
        let found = store.find_live(&filter).await.unwrap();
        assert_eq!(found.iter().map(|l| l.id).collect::<Vec<_>>(), vec![3, 2]);
    }
}
