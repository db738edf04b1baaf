//! Query index: searchable projections of committed properties.
//!
//! Each entry is swapped in whole, so a search sees either the previous or the
//! new projection of a property, never a mix. The index trails the store by
//! at most the time between a commit and the matching [`QueryIndex::upsert`].

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use hometrack_core::{
    resolve, DerivedHistory, IdentityError, Property, PropertyId, RawAddress, SearchQuery,
};
use hometrack_storage::{PropertyRecord, PropertyStore, StoreError};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexEntry {
    pub property: Property,
    pub history: DerivedHistory,
    /// Store version the projection was built from.
    pub version: u64,
}

impl IndexEntry {
    pub fn from_record(record: &PropertyRecord) -> Self {
        Self {
            property: record.property.clone(),
            history: record.history.derived(),
            version: record.version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchPage {
    pub properties: Vec<Property>,
    /// Pass as `after` to fetch the next page; absent on the last page.
    pub next_after: Option<PropertyId>,
}

#[derive(Debug, Default)]
struct IndexState {
    entries: BTreeMap<PropertyId, Arc<IndexEntry>>,
    by_canonical: HashMap<String, PropertyId>,
}

#[derive(Debug, Default)]
pub struct QueryIndex {
    state: RwLock<IndexState>,
}

impl QueryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the projection of one property. Older versions never replace newer ones.
    pub async fn upsert(&self, record: &PropertyRecord) -> bool {
        let entry = Arc::new(IndexEntry::from_record(record));
        let mut state = self.state.write().await;
        if let Some(current) = state.entries.get(&entry.property.id) {
            if current.version >= entry.version {
                debug!(property_id = %entry.property.id, version = entry.version, "skipping stale index update");
                return false;
            }
        }
        state
            .by_canonical
            .insert(entry.property.address.canonical(), entry.property.id.clone());
        state.entries.insert(entry.property.id.clone(), entry);
        true
    }

    pub async fn get(&self, id: &PropertyId) -> Option<Arc<IndexEntry>> {
        self.state.read().await.entries.get(id).cloned()
    }

    /// Resolves a free-text address and looks the property up.
    pub async fn get_by_address(&self, line: &str) -> Result<Option<Arc<IndexEntry>>, IdentityError> {
        let resolved = resolve(&RawAddress::line(line))?;
        let state = self.state.read().await;
        let id = state
            .by_canonical
            .get(&resolved.address.canonical())
            .unwrap_or(&resolved.id);
        Ok(state.entries.get(id).cloned())
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn properties(&self) -> Vec<Property> {
        self.state
            .read()
            .await
            .entries
            .values()
            .map(|e| e.property.clone())
            .collect()
    }

    /// Every match, ordered by identifier. `limit` and `after` are honoured.
    pub async fn search(&self, query: &SearchQuery) -> Vec<Property> {
        self.search_page(query).await.properties
    }

    pub async fn search_page(&self, query: &SearchQuery) -> SearchPage {
        let state = self.state.read().await;
        let lower = match &query.after {
            Some(after) => Bound::Excluded(after.clone()),
            None => Bound::Unbounded,
        };
        let mut matches = state
            .entries
            .range((lower, Bound::Unbounded))
            .filter(|(_, entry)| query.matches(&entry.property, &entry.history))
            .map(|(_, entry)| entry.property.clone());

        let mut properties = Vec::new();
        let mut next_after = None;
        loop {
            let Some(property) = matches.next() else {
                break;
            };
            if query.limit.is_some_and(|limit| properties.len() == limit) {
                next_after = properties.last().map(|p: &Property| p.id.clone());
                break;
            }
            properties.push(property);
        }
        SearchPage {
            properties,
            next_after,
        }
    }

    /// Rebuilds every projection from the store and swaps them in at once.
    pub async fn rebuild(&self, store: &dyn PropertyStore) -> Result<usize, StoreError> {
        let mut fresh = IndexState::default();
        for id in store.property_ids().await? {
            if let Some(record) = store.get(&id).await? {
                let entry = Arc::new(IndexEntry::from_record(&record));
                fresh
                    .by_canonical
                    .insert(entry.property.address.canonical(), id.clone());
                fresh.entries.insert(id, entry);
            }
        }
        let count = fresh.entries.len();
        *self.state.write().await = fresh;
        info!(properties = count, "query index rebuilt");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hometrack_core::{EventPayload, HistoryEvent, HistoryLog, Predicate, PropertyType};
    use hometrack_storage::{CommitBatch, InMemoryPropertyStore};

    fn record(line: &str, beds: f64, version: u64) -> PropertyRecord {
        let resolved = resolve(&RawAddress::line(line)).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
        let history = HistoryLog::from_events(vec![HistoryEvent::new(
            &resolved.id,
            "redfin",
            at,
            at,
            EventPayload::Listed { price: Some(500_000.0) },
        )]);
        let mut property = history.project(&resolved.id, &resolved.address).unwrap();
        property.bedrooms = Some(beds);
        property.property_type = PropertyType::Condo;
        PropertyRecord {
            property,
            history,
            conflicts: vec![],
            version,
        }
    }

    #[tokio::test]
    async fn pages_through_matches_in_identifier_order() {
        let index = QueryIndex::new();
        for (n, line) in ["1 Alder St, Seattle, WA 98101", "2 Birch St, Seattle, WA 98101", "3 Cedar St, Seattle, WA 98101"]
            .iter()
            .enumerate()
        {
            index.upsert(&record(line, n as f64 + 1.0, 1)).await;
        }

        let query = SearchQuery {
            limit: Some(2),
            ..SearchQuery::new()
        };
        let first = index.search_page(&query).await;
        assert_eq!(first.properties.len(), 2);
        assert!(first.properties[0].id < first.properties[1].id);
        let cursor = first.next_after.clone().unwrap();
        assert_eq!(cursor, first.properties[1].id);

        let second = index
            .search_page(&SearchQuery {
                after: Some(cursor),
                ..query.clone()
            })
            .await;
        assert_eq!(second.properties.len(), 1);
        assert!(second.next_after.is_none());

        let two_plus = SearchQuery::new().with(Predicate::Bedrooms(hometrack_core::NumericRange {
            min: Some(2.0),
            max: None,
        }));
        assert_eq!(index.search(&two_plus).await.len(), 2);
    }

    #[tokio::test]
    async fn stale_versions_do_not_replace_newer_entries() {
        let index = QueryIndex::new();
        assert!(index.upsert(&record("1 Alder St, Seattle, WA 98101", 3.0, 2)).await);
        assert!(!index.upsert(&record("1 Alder St, Seattle, WA 98101", 1.0, 1)).await);
        let entry = index
            .get_by_address("1 alder street, seattle, wa 98101")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.property.bedrooms, Some(3.0));
        assert!(index.get_by_address("PO Box 9, Seattle, WA 98101").await.is_err());
    }

    #[tokio::test]
    async fn rebuild_reads_everything_from_the_store() {
        let store = InMemoryPropertyStore::new();
        let stored = record("1 Alder St, Seattle, WA 98101", 3.0, 0);
        store
            .append_history(CommitBatch {
                property_id: stored.property.id.clone(),
                expected_version: 0,
                property: stored.property.clone(),
                new_events: stored.history.events().to_vec(),
                new_conflicts: vec![],
            })
            .await
            .unwrap();

        let index = QueryIndex::new();
        index.upsert(&record("2 Birch St, Seattle, WA 98101", 1.0, 1)).await;
        assert_eq!(index.rebuild(&store).await.unwrap(), 1);
        assert_eq!(index.len().await, 1);
        assert_eq!(index.get(&stored.property.id).await.unwrap().version, 1);
    }
}
