mod walk;

pub use walk::{ensure_layout, scan};

use crate::extract::Descriptor;
use ahash::AHashSet;
use serde::{Deserialize, Serialize};

/// One source image. `id` is the path relative to the collection root and never
/// changes for the lifetime of the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: String,
    pub display_name: String,
    pub byte_size: u64,
    pub descriptor: Option<Descriptor>,
}

impl ItemRecord {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, byte_size: u64) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            byte_size,
            descriptor: None,
        }
    }
}

/// An item whose descriptor could not be computed. It takes no part in matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedItem {
    pub id: String,
    pub display_name: String,
    pub reason: String,
}

/// Ordered (by id) set of items. Sole owner of descriptor payloads; everything
/// downstream refers to items by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemCatalog {
    items: Vec<ItemRecord>,
    quarantined: Vec<QuarantinedItem>,
}

impl ItemCatalog {
    /// Build a catalog from arbitrary records: sorted by id, first record wins on
    /// duplicate ids.
    pub fn from_records(mut records: Vec<ItemRecord>) -> Self {
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records.dedup_by(|later, first| later.id == first.id);
        Self {
            items: records,
            quarantined: Vec::new(),
        }
    }

    pub fn items(&self) -> &[ItemRecord] {
        &self.items
    }

    pub fn quarantined(&self) -> &[QuarantinedItem] {
        &self.quarantined
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ItemRecord> {
        self.items
            .binary_search_by(|item| item.id.as_str().cmp(id))
            .ok()
            .map(|idx| &self.items[idx])
    }

    /// Indices of items still waiting for a descriptor.
    pub fn pending_extraction(&self) -> Vec<usize> {
        let quarantined: AHashSet<&str> = self.quarantined.iter().map(|q| q.id.as_str()).collect();
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.descriptor.is_none() && !quarantined.contains(item.id.as_str()))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn set_descriptor(&mut self, index: usize, descriptor: Descriptor) {
        if let Some(item) = self.items.get_mut(index) {
            item.descriptor = Some(descriptor);
        }
    }

    /// Mark an item unreadable. It stays in `items` until `drop_quarantined` so
    /// that indices held by in-flight work remain valid.
    pub fn quarantine(&mut self, index: usize, reason: impl Into<String>) {
        if let Some(item) = self.items.get(index) {
            if self.quarantined.iter().any(|q| q.id == item.id) {
                return;
            }
            self.quarantined.push(QuarantinedItem {
                id: item.id.clone(),
                display_name: item.display_name.clone(),
                reason: reason.into(),
            });
        }
    }

    /// Remove quarantined items from the comparison universe. Returns how many
    /// records were removed.
    pub fn drop_quarantined(&mut self) -> usize {
        let quarantined: AHashSet<String> = self.quarantined.iter().map(|q| q.id.clone()).collect();
        let before = self.items.len();
        self.items.retain(|item| !quarantined.contains(&item.id));
        before - self.items.len()
    }

    /// True once every remaining item carries a descriptor.
    pub fn is_complete(&self) -> bool {
        self.pending_extraction().is_empty()
    }

    /// Ids of items that can take part in matching, in catalog order.
    pub fn ready_ids(&self) -> Vec<&str> {
        let quarantined: AHashSet<&str> = self.quarantined.iter().map(|q| q.id.as_str()).collect();
        self.items
            .iter()
            .filter(|item| item.descriptor.is_some() && !quarantined.contains(item.id.as_str()))
            .map(|item| item.id.as_str())
            .collect()
    }

    pub fn descriptor_bytes(&self) -> u64 {
        self.items
            .iter()
            .filter_map(|item| item.descriptor.as_ref())
            .map(|d| d.byte_len() as u64)
            .sum()
    }
}
