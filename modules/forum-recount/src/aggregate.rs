//! Folding raw rows into per-key count entries.
//!
//! Aggregation is two-pass when rows have a parent (posts in a topic):
//! [`FirstPostIndex::build`] must see the whole record set before any
//! row is filtered, since rows can arrive out of id order.

use std::collections::HashMap;

use forum_api::{RawRecord, RecordExt};
use serde::{Deserialize, Serialize};

/// Normalized grouping identity (lower-cased username, topic id, ...).
pub type AggregateKey = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateEntry {
    pub key: AggregateKey,
    /// Canonical external id, once known.
    pub id: Option<u64>,
    pub display_name: String,
    pub count: u64,
    /// One link per counted row, in input order.
    pub sample_links: Vec<String>,
}

impl AggregateEntry {
    pub fn is_resolved(&self) -> bool {
        self.id.is_some_and(|id| id > 0)
    }
}

/// What a single row contributes to its entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub key: AggregateKey,
    pub display_name: String,
    pub id: Option<u64>,
    pub link: Option<String>,
}

/// Insertion-ordered map of entries plus fold counters.
#[derive(Debug, Default, Clone)]
pub struct Aggregate {
    entries: Vec<AggregateEntry>,
    index: HashMap<AggregateKey, usize>,
    /// Rows rejected by the filter.
    pub filtered: u64,
    /// Rows that passed the filter but produced no key.
    pub unkeyed: u64,
}

impl Aggregate {
    pub fn fold(&mut self, sighting: Sighting) {
        let slot = match self.index.get(&sighting.key) {
            Some(&slot) => slot,
            None => {
                self.entries.push(AggregateEntry {
                    key: sighting.key.clone(),
                    id: None,
                    display_name: sighting.display_name,
                    count: 0,
                    sample_links: Vec::new(),
                });
                self.index.insert(sighting.key, self.entries.len() - 1);
                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[slot];
        entry.count += 1;
        if entry.id.is_none() {
            entry.id = sighting.id;
        }
        if let Some(link) = sighting.link {
            entry.sample_links.push(link);
        }
    }

    pub fn get(&self, key: &str) -> Option<&AggregateEntry> {
        self.index.get(key).map(|&slot| &self.entries[slot])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_count(&self) -> u64 {
        self.entries.iter().map(|e| e.count).sum()
    }

    /// Entries by descending count. Stable: ties keep first-insertion order.
    pub fn into_sorted(self) -> Vec<AggregateEntry> {
        let mut entries = self.entries;
        entries.sort_by(|a, b| b.count.cmp(&a.count));
        entries
    }
}

/// Fold every row that passes `filter` and yields a sighting.
pub fn aggregate<'a, I, S, F>(records: I, sight: S, filter: F) -> Aggregate
where
    I: IntoIterator<Item = &'a RawRecord>,
    S: Fn(&RawRecord) -> Option<Sighting>,
    F: Fn(&RawRecord) -> bool,
{
    let mut out = Aggregate::default();
    for record in records {
        if !filter(record) {
            out.filtered += 1;
            continue;
        }
        match sight(record) {
            Some(sighting) => out.fold(sighting),
            None => out.unkeyed += 1,
        }
    }
    out
}

/// Minimum row id per parent id. Pass one of a two-pass aggregation.
#[derive(Debug, Default, Clone)]
pub struct FirstPostIndex {
    first: HashMap<u64, u64>,
    parent_field: String,
    id_field: String,
}

impl FirstPostIndex {
    pub fn build<'a, I>(records: I, parent_field: &str, id_field: &str) -> Self
    where
        I: IntoIterator<Item = &'a RawRecord>,
    {
        let mut first: HashMap<u64, u64> = HashMap::new();
        for record in records {
            let (Some(parent), Some(id)) =
                (record.u64_field(parent_field), record.u64_field(id_field))
            else {
                continue;
            };
            first
                .entry(parent)
                .and_modify(|min| *min = (*min).min(id))
                .or_insert(id);
        }
        Self {
            first,
            parent_field: parent_field.to_string(),
            id_field: id_field.to_string(),
        }
    }

    pub fn first_id(&self, parent: u64) -> Option<u64> {
        self.first.get(&parent).copied()
    }

    /// True when `record` is the lowest-id row of its parent.
    pub fn is_first(&self, record: &RawRecord) -> bool {
        match (
            record.u64_field(&self.parent_field),
            record.u64_field(&self.id_field),
        ) {
            (Some(parent), Some(id)) => self.first_id(parent) == Some(id),
            _ => false,
        }
    }
}
