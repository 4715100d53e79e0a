//! Capability set implemented once per external CRM system.

use async_trait::async_trait;

use crate::value::{FieldMap, ObjectType, Record};
use crate::Result;

// ---------------------------------------------------------------------------
// CrmAdapter
// ---------------------------------------------------------------------------

/// An external record-keeping system.
///
/// Implementations report failures through [`CrmError`](crate::CrmError);
/// `TransientFetch` / `TransientUpsert` signal that the call may be retried,
/// every other variant is treated as permanent for that call.
#[async_trait]
pub trait CrmAdapter: Send + Sync {
    /// Stable identifier of the system (e.g. `"hubspot"`).
    fn system_id(&self) -> &str;

    /// Fetch one page of records of `object_type`, ordered stably by the
    /// system so that `offset` pagination is repeatable.
    async fn fetch(&self, object_type: ObjectType, limit: usize, offset: usize)
        -> Result<Vec<Record>>;

    /// Create a record and return the id assigned by the system.
    async fn create(&self, object_type: ObjectType, fields: &FieldMap) -> Result<String>;

    /// Update the given fields of an existing record. Fields not present in
    /// `fields` are left untouched.
    async fn update(&self, object_type: ObjectType, id: &str, fields: &FieldMap) -> Result<bool>;

    async fn get_contacts(&self, limit: usize, offset: usize) -> Result<Vec<Record>> {
        self.fetch(ObjectType::Contact, limit, offset).await
    }

    async fn create_contact(&self, fields: &FieldMap) -> Result<String> {
        self.create(ObjectType::Contact, fields).await
    }

    async fn update_contact(&self, id: &str, fields: &FieldMap) -> Result<bool> {
        self.update(ObjectType::Contact, id, fields).await
    }

    async fn get_deals(&self, limit: usize, offset: usize) -> Result<Vec<Record>> {
        self.fetch(ObjectType::Deal, limit, offset).await
    }

    async fn create_deal(&self, fields: &FieldMap) -> Result<String> {
        self.create(ObjectType::Deal, fields).await
    }
}
