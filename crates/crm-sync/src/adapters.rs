//! In-process CRM systems and the registry the orchestrator resolves system
//! ids through.
//!
//! [`MemoryAdapter`] is a complete working CRM held in memory. It backs the
//! CLI (loaded from and saved to JSON snapshots) and the tests, which use
//! its failure injection to exercise retry and partial-failure paths.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crm_types::{
    Clock, CrmAdapter, CrmError, FieldMap, FieldValue, ObjectType, Record, Result, SystemClock,
};

// ---------------------------------------------------------------------------
// SystemKind
// ---------------------------------------------------------------------------

/// Record id convention of an external system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemKind {
    Salesforce,
    Hubspot,
    Zoho,
    #[default]
    Generic,
}

impl SystemKind {
    /// Guess the kind from a system id such as `"hubspot-eu"`.
    pub fn infer(system_id: &str) -> Self {
        let id = system_id.to_lowercase();
        if id.contains("salesforce") || id.starts_with("sfdc") {
            SystemKind::Salesforce
        } else if id.contains("hubspot") {
            SystemKind::Hubspot
        } else if id.contains("zoho") {
            SystemKind::Zoho
        } else {
            SystemKind::Generic
        }
    }

    /// Id for the `seq`-th record of a type created in this system.
    pub fn make_id(&self, object_type: ObjectType, seq: u64) -> String {
        match self {
            SystemKind::Salesforce => {
                let prefix = match object_type {
                    ObjectType::Account => "001",
                    ObjectType::Contact => "003",
                    ObjectType::Deal => "006",
                };
                format!("{prefix}{seq:015}")
            }
            SystemKind::Hubspot => (100_000 + seq).to_string(),
            SystemKind::Zoho => (4_876_000_000_000_000 + seq).to_string(),
            SystemKind::Generic => format!("{object_type}_{seq}"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemKind::Salesforce => "salesforce",
            SystemKind::Hubspot => "hubspot",
            SystemKind::Zoho => "zoho",
            SystemKind::Generic => "generic",
        }
    }
}

impl fmt::Display for SystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SystemKind {
    type Err = CrmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "salesforce" => Ok(SystemKind::Salesforce),
            "hubspot" => Ok(SystemKind::Hubspot),
            "zoho" => Ok(SystemKind::Zoho),
            "generic" => Ok(SystemKind::Generic),
            other => Err(CrmError::Configuration(format!(
                "unknown system kind '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryAdapter
// ---------------------------------------------------------------------------

/// Records per object type, in creation order.
pub type Snapshot = BTreeMap<ObjectType, Vec<Record>>;

/// Injected write failure for records whose `field` equals `value`.
#[derive(Debug, Clone)]
struct WriteFailure {
    field: String,
    value: FieldValue,
    transient: bool,
    /// `None` fails forever.
    remaining: Option<usize>,
}

pub struct MemoryAdapter {
    system_id: String,
    kind: SystemKind,
    records: RwLock<Snapshot>,
    next_seq: AtomicU64,
    write_failures: Mutex<Vec<WriteFailure>>,
    fetch_failures: AtomicUsize,
    clock: Arc<dyn Clock>,
}

impl MemoryAdapter {
    pub fn new(system_id: impl Into<String>) -> Self {
        let system_id = system_id.into();
        Self {
            kind: SystemKind::infer(&system_id),
            system_id,
            records: RwLock::new(Snapshot::new()),
            next_seq: AtomicU64::new(1),
            write_failures: Mutex::new(Vec::new()),
            fetch_failures: AtomicUsize::new(0),
            clock: Arc::new(SystemClock),
        }
    }

    /// Adapter preloaded with a snapshot.
    pub fn from_snapshot(system_id: impl Into<String>, snapshot: Snapshot) -> Self {
        let adapter = Self::new(system_id);
        let count: usize = snapshot.values().map(Vec::len).sum();
        adapter.next_seq.store(count as u64 + 1, Ordering::SeqCst);
        *adapter.records.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
        adapter
    }

    #[must_use]
    pub fn with_kind(mut self, kind: SystemKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn kind(&self) -> SystemKind {
        self.kind
    }

    /// Add a record as-is, keeping its id and timestamp.
    pub fn seed(&self, object_type: ObjectType, record: Record) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(object_type)
            .or_default()
            .push(record);
    }

    pub fn records(&self, object_type: ObjectType) -> Vec<Record> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&object_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn find(&self, object_type: ObjectType, id: &str) -> Option<Record> {
        self.records(object_type).into_iter().find(|r| r.id == id)
    }

    pub fn count(&self, object_type: ObjectType) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&object_type)
            .map_or(0, Vec::len)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make every write whose fields carry `field == value` fail permanently.
    pub fn fail_writes_where(&self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.push_failure(field.into(), value.into(), false, None);
    }

    /// Make the next `times` matching writes fail with a transient error.
    pub fn fail_writes_transiently(
        &self,
        field: impl Into<String>,
        value: impl Into<FieldValue>,
        times: usize,
    ) {
        self.push_failure(field.into(), value.into(), true, Some(times));
    }

    /// Make the next `times` fetches fail with a transient error.
    pub fn fail_next_fetches(&self, times: usize) {
        self.fetch_failures.store(times, Ordering::SeqCst);
    }

    fn push_failure(&self, field: String, value: FieldValue, transient: bool, remaining: Option<usize>) {
        self.write_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(WriteFailure {
                field,
                value,
                transient,
                remaining,
            });
    }

    fn check_write(&self, fields: &FieldMap) -> Result<()> {
        let mut failures = self
            .write_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for failure in failures.iter_mut() {
            if fields.get(&failure.field) != Some(&failure.value) {
                continue;
            }
            match failure.remaining.as_mut() {
                Some(0) => continue,
                Some(n) => *n -= 1,
                None => {}
            }
            let message = format!("injected failure on {} = {}", failure.field, failure.value);
            return Err(if failure.transient {
                CrmError::TransientUpsert {
                    system: self.system_id.clone(),
                    message,
                }
            } else {
                CrmError::PermanentAdapter {
                    system: self.system_id.clone(),
                    message,
                }
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CrmAdapter for MemoryAdapter {
    fn system_id(&self) -> &str {
        &self.system_id
    }

    async fn fetch(
        &self,
        object_type: ObjectType,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Record>> {
        let pending = self.fetch_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.fetch_failures.store(pending - 1, Ordering::SeqCst);
            return Err(CrmError::TransientFetch {
                system: self.system_id.clone(),
                message: "injected fetch failure".into(),
            });
        }
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .get(&object_type)
            .map(|all| all.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn create(&self, object_type: ObjectType, fields: &FieldMap) -> Result<String> {
        self.check_write(fields)?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let id = self.kind.make_id(object_type, seq);
        let record = Record {
            id: id.clone(),
            fields: fields.clone(),
            modified_at: Some(self.clock.now()),
        };
        self.seed(object_type, record);
        tracing::debug!(system = %self.system_id, %object_type, %id, "Record created");
        Ok(id)
    }

    async fn update(&self, object_type: ObjectType, id: &str, fields: &FieldMap) -> Result<bool> {
        self.check_write(fields)?;
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let Some(record) = records
            .get_mut(&object_type)
            .and_then(|all| all.iter_mut().find(|r| r.id == id))
        else {
            return Ok(false);
        };
        record
            .fields
            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        record.modified_at = Some(self.clock.now());
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// AdapterRegistry
// ---------------------------------------------------------------------------

/// CRM adapters by system id.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn CrmAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn CrmAdapter>) {
        let id = adapter.system_id().to_string();
        self.adapters.insert(id, adapter);
    }

    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn CrmAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, system_id: &str) -> Result<Arc<dyn CrmAdapter>> {
        self.adapters.get(system_id).cloned().ok_or_else(|| {
            CrmError::Configuration(format!("no adapter registered for system '{system_id}'"))
        })
    }

    pub fn has(&self, system_id: &str) -> bool {
        self.adapters.contains_key(system_id)
    }

    pub fn system_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(email: &str) -> FieldMap {
        [("email".to_string(), FieldValue::from(email))].into()
    }

    #[test]
    fn id_conventions() {
        assert_eq!(
            SystemKind::Salesforce.make_id(ObjectType::Contact, 7),
            "003000000000000007"
        );
        assert_eq!(SystemKind::Hubspot.make_id(ObjectType::Deal, 1), "100001");
        assert_eq!(SystemKind::Generic.make_id(ObjectType::Account, 3), "account_3");
        assert_eq!(SystemKind::infer("HubSpot-EU"), SystemKind::Hubspot);
        assert_eq!(SystemKind::infer("legacy"), SystemKind::Generic);
        assert!("dynamics".parse::<SystemKind>().is_err());
    }

    #[tokio::test]
    async fn create_fetch_update() {
        let crm = MemoryAdapter::new("hubspot");
        let id = crm.create_contact(&contact("a@x.com")).await.unwrap();
        crm.create_contact(&contact("b@x.com")).await.unwrap();
        crm.create_contact(&contact("c@x.com")).await.unwrap();

        let page = crm.get_contacts(2, 1).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].get("email"), Some(&FieldValue::from("b@x.com")));

        let mut change = FieldMap::new();
        change.insert("phone".into(), FieldValue::from("555"));
        assert!(crm.update_contact(&id, &change).await.unwrap());
        let stored = crm.find(ObjectType::Contact, &id).unwrap();
        assert_eq!(stored.fields.len(), 2);
        assert!(!crm.update_contact("missing", &change).await.unwrap());
    }

    #[tokio::test]
    async fn injected_failures() {
        let crm = MemoryAdapter::new("generic");
        crm.fail_writes_where("email", "bad@x.com");
        crm.fail_writes_transiently("email", "flaky@x.com", 1);
        crm.fail_next_fetches(1);

        let err = crm.create_contact(&contact("bad@x.com")).await.unwrap_err();
        assert!(err.is_terminal());
        let err = crm.create_contact(&contact("flaky@x.com")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(crm.create_contact(&contact("flaky@x.com")).await.is_ok());

        assert!(crm.get_contacts(10, 0).await.unwrap_err().is_transient());
        assert_eq!(crm.get_contacts(10, 0).await.unwrap().len(), 1);
    }

    #[test]
    fn snapshot_round_trip_keeps_ids_unique() {
        let mut snapshot = Snapshot::new();
        snapshot.insert(
            ObjectType::Contact,
            vec![Record::new("contact_1").with_field("email", "a@x.com")],
        );
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        let crm = MemoryAdapter::from_snapshot("generic", back);
        assert_eq!(crm.count(ObjectType::Contact), 1);
        assert_eq!(crm.kind().make_id(ObjectType::Contact, 2), "contact_2");
    }

    #[test]
    fn registry_lookup() {
        let registry = AdapterRegistry::new()
            .with(Arc::new(MemoryAdapter::new("salesforce")))
            .with(Arc::new(MemoryAdapter::new("hubspot")));
        assert!(registry.get("salesforce").is_ok());
        assert!(registry.has("hubspot"));
        assert!(matches!(
            registry.get("zoho"),
            Err(CrmError::Configuration(_))
        ));
        assert_eq!(registry.system_ids(), vec!["hubspot", "salesforce"]);
    }
}
