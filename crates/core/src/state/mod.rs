pub mod audit_store;
pub mod db;

pub use audit_store::{AuditRecord, AuditStore};
pub use db::AuditDb;
