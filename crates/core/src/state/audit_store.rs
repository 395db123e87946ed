//! # Audit Store
//!
//! Audit records in SQLite, one row per audit id in the `audits` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Url;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use super::db::AuditDb;
use crate::models::{AuditExecution, AuditStatus};
use crate::swarm::report::AuditReport;

/// Persisted summary of an audit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub id: String,
    pub url: String,
    pub domain: String,
    pub status: AuditStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub score: Option<u8>,
    pub pages_found: usize,
    pub pages_analyzed: usize,
    #[serde(default)]
    pub top_issues: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Summarize an execution for storage
    pub fn from_execution(execution: &AuditExecution) -> Self {
        let report: Option<AuditReport> = execution
            .results
            .get("report")
            .and_then(|r| serde_json::from_value(r.clone()).ok());

        let pages_found = execution
            .results
            .get("crawl")
            .and_then(|c| c.get("pages_found"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;

        let domain = Url::parse(&execution.seed_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();

        Self {
            id: execution.audit_id.clone(),
            url: execution.seed_url.clone(),
            domain,
            status: execution.status,
            start_time: execution.start_time,
            score: report.as_ref().and_then(|r| r.score),
            pages_found: report.as_ref().map_or(pages_found, |r| r.pages_found.max(pages_found)),
            pages_analyzed: report.as_ref().map_or(0, |r| r.pages_analyzed),
            top_issues: report.as_ref().map(|r| r.top_issues.clone()).unwrap_or_default(),
            recommendations: report
                .as_ref()
                .map(|r| r.recommendations.clone())
                .unwrap_or_default(),
            error: execution.error.clone(),
            updated_at: Utc::now(),
        }
    }

    /// Rebuild a finished execution for status and results queries.
    ///
    /// A record still marked active was interrupted by a restart and comes
    /// back as failed.
    pub fn into_execution(self) -> AuditExecution {
        let (status, error) = if self.status.is_active() {
            (
                AuditStatus::Failed,
                Some("interrupted by restart".to_string()),
            )
        } else {
            (self.status, self.error)
        };

        let report = AuditReport {
            audit_id: self.id.clone(),
            score: self.score,
            pages_found: self.pages_found,
            pages_analyzed: self.pages_analyzed,
            top_issues: self.top_issues,
            recommendations: self.recommendations,
            fallback: false,
            generated_at: self.updated_at,
        };

        let mut results = std::collections::HashMap::new();
        results.insert(
            "crawl".to_string(),
            serde_json::json!({ "pages_found": self.pages_found, "seed_url": self.url }),
        );
        if let Ok(report) = serde_json::to_value(&report) {
            results.insert("report".to_string(), report);
        }

        AuditExecution {
            audit_id: self.id,
            status,
            progress: if status == AuditStatus::Completed { 100 } else { 0 },
            current_step: status.as_str().to_string(),
            start_time: self.start_time,
            end_time: Some(self.updated_at),
            error,
            results,
            agent_statuses: std::collections::HashMap::new(),
            seed_url: self.url,
        }
    }
}

/// CRUD over the `audits` table
pub struct AuditStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl std::fmt::Debug for AuditStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditStore").finish_non_exhaustive()
    }
}

impl AuditStore {
    pub fn new(db: &AuditDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Open the database at `path` and build a store on it
    pub fn open_at(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::new(&AuditDb::open_at(path)?))
    }

    /// Insert or replace a record
    pub fn save(&self, record: &AuditRecord) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO audits
            (id, url, domain, status, start_time, score, pages_found, pages_analyzed,
             top_issues_json, recommendations_json, error, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                record.id,
                record.url,
                record.domain,
                record.status.as_str(),
                record.start_time.to_rfc3339(),
                record.score.map(i64::from),
                record.pages_found as i64,
                record.pages_analyzed as i64,
                serde_json::to_string(&record.top_issues)?,
                serde_json::to_string(&record.recommendations)?,
                record.error,
                record.updated_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to save audit {}", record.id))?;

        Ok(())
    }

    /// Load a record by audit id
    pub fn load(&self, id: &str) -> Result<Option<AuditRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_AUDITS))?;
        let mut rows = stmt.query_map(params![id], Self::row_to_record)?;
        let first = rows.next();
        match first {
            Some(record) => Ok(Some(record.context("Failed to read audit")?)),
            None => Ok(None),
        }
    }

    /// All records, most recently started first
    pub fn list_all(&self) -> Result<Vec<AuditRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(&format!("{} ORDER BY start_time DESC", SELECT_AUDITS))?;
        let records = stmt
            .query_map([], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list audits")?;

        Ok(records)
    }

    pub fn list_by_domain(&self, domain: &str) -> Result<Vec<AuditRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(&format!(
            "{} WHERE domain = ?1 ORDER BY start_time DESC",
            SELECT_AUDITS
        ))?;
        let records = stmt
            .query_map(params![domain], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list audits by domain")?;

        Ok(records)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let affected = conn.execute("DELETE FROM audits WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<AuditRecord> {
        let status: String = row.get(3)?;
        let start_time: String = row.get(4)?;
        let score: Option<i64> = row.get(5)?;
        let pages_found: i64 = row.get(6)?;
        let pages_analyzed: i64 = row.get(7)?;
        let top_issues: String = row.get(8)?;
        let recommendations: String = row.get(9)?;
        let updated_at: String = row.get(11)?;

        Ok(AuditRecord {
            id: row.get(0)?,
            url: row.get(1)?,
            domain: row.get(2)?,
            status: AuditStatus::from_str(&status),
            start_time: parse_timestamp(&start_time),
            score: score.map(|s| s.clamp(0, 100) as u8),
            pages_found: pages_found.max(0) as usize,
            pages_analyzed: pages_analyzed.max(0) as usize,
            top_issues: serde_json::from_str(&top_issues).unwrap_or_default(),
            recommendations: serde_json::from_str(&recommendations).unwrap_or_default(),
            error: row.get(10)?,
            updated_at: parse_timestamp(&updated_at),
        })
    }
}

const SELECT_AUDITS: &str = r#"
    SELECT id, url, domain, status, start_time, score, pages_found, pages_analyzed,
           top_issues_json, recommendations_json, error, updated_at
    FROM audits"#;

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuditRequest;
    use std::fs;

    fn completed_execution(id: &str) -> AuditExecution {
        let request = AuditRequest::new(id, "https://example.com/start", 5);
        let mut execution = AuditExecution::start(&request, "completed", 100);
        execution.results.insert(
            "crawl".into(),
            serde_json::json!({ "pages_found": 4, "pages_failed": 0 }),
        );
        execution.results.insert(
            "report".into(),
            serde_json::json!({
                "audit_id": id,
                "score": 82,
                "pages_found": 4,
                "pages_analyzed": 3,
                "top_issues": ["HTTP 404 (https://example.com/gone)"],
                "recommendations": ["Fix broken pages (1 pages)"],
                "fallback": false,
                "generated_at": "2024-05-01T10:00:00Z",
            }),
        );
        execution.finish(AuditStatus::Completed, None);
        execution
    }

    #[test]
    fn test_record_from_execution() {
        let record = AuditRecord::from_execution(&completed_execution("a1"));
        assert_eq!(record.domain, "example.com");
        assert_eq!(record.score, Some(82));
        assert_eq!(record.pages_found, 4);
        assert_eq!(record.pages_analyzed, 3);
        assert_eq!(record.top_issues.len(), 1);
    }

    #[test]
    fn test_store_crud() {
        let path = ".sitescope/test_audit_store.db";
        let _ = fs::remove_file(path);
        let store = AuditStore::open_at(path).unwrap();

        let record = AuditRecord::from_execution(&completed_execution("a1"));
        store.save(&record).unwrap();
        store
            .save(&AuditRecord::from_execution(&completed_execution("a2")))
            .unwrap();

        let loaded = store.load("a1").unwrap().unwrap();
        assert_eq!(loaded.status, AuditStatus::Completed);
        assert_eq!(loaded.score, Some(82));
        assert_eq!(loaded.recommendations, record.recommendations);
        assert!(store.load("missing").unwrap().is_none());

        assert_eq!(store.list_all().unwrap().len(), 2);
        assert_eq!(store.list_by_domain("example.com").unwrap().len(), 2);
        assert!(store.list_by_domain("other.org").unwrap().is_empty());

        assert!(store.delete("a1").unwrap());
        assert!(!store.delete("a1").unwrap());

        drop(store);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_interrupted_record_restores_as_failed() {
        let db = AuditDb::open_in_memory().unwrap();
        let store = AuditStore::new(&db);

        let request = AuditRequest::new("a3", "https://example.com", 5);
        let running = AuditExecution::start(&request, "crawling", 25);
        store.save(&AuditRecord::from_execution(&running)).unwrap();

        let execution = store.load("a3").unwrap().unwrap().into_execution();
        assert_eq!(execution.status, AuditStatus::Failed);
        assert_eq!(execution.error.as_deref(), Some("interrupted by restart"));
        assert_eq!(execution.seed_url, "https://example.com");
    }
}
