//! Session-lifetime caches shared by every table view.
//!
//! Entries are never evicted one by one; `clear` drops everything at once.

use crate::answers::AnswerRecord;
use crate::source::View;
use crate::taxonomy::CategoryNode;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct CorpusCache {
    categories: RwLock<HashMap<u32, CategoryNode>>,
    views: RwLock<Option<Arc<[View]>>>,
    answers: RwLock<HashMap<BatchKey, Arc<[AnswerRecord]>>>,
}

/// Sample plus the sorted taxonomy ids of one answer fetch.
type BatchKey = (String, Vec<u32>);

fn batch_key(sample: &str, ids: &[u32]) -> BatchKey {
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    (sample.to_string(), ids)
}

impl CorpusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(&self, id: u32) -> Option<CategoryNode> {
        self.categories.read().get(&id).cloned()
    }

    pub fn insert_category(&self, node: CategoryNode) {
        self.categories.write().insert(node.id, node);
    }

    pub fn insert_categories(&self, nodes: impl IntoIterator<Item = CategoryNode>) {
        let mut guard = self.categories.write();
        for node in nodes {
            guard.insert(node.id, node);
        }
    }

    /// Snapshot of every cached taxonomy name, keyed by id.
    pub fn category_names(&self) -> HashMap<u32, String> {
        self.categories
            .read()
            .values()
            .map(|node| (node.id, node.name.clone()))
            .collect()
    }

    pub fn views(&self) -> Option<Arc<[View]>> {
        self.views.read().clone()
    }

    pub fn set_views(&self, views: Vec<View>) -> Arc<[View]> {
        let views: Arc<[View]> = views.into();
        *self.views.write() = Some(Arc::clone(&views));
        views
    }

    pub fn answer_batch(&self, sample: &str, ids: &[u32]) -> Option<Arc<[AnswerRecord]>> {
        self.answers.read().get(&batch_key(sample, ids)).cloned()
    }

    pub fn insert_answer_batch(
        &self,
        sample: &str,
        ids: &[u32],
        records: Vec<AnswerRecord>,
    ) -> Arc<[AnswerRecord]> {
        let records: Arc<[AnswerRecord]> = records.into();
        self.answers
            .write()
            .insert(batch_key(sample, ids), Arc::clone(&records));
        records
    }

    pub fn clear(&self) {
        self.categories.write().clear();
        *self.views.write() = None;
        self.answers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u32, name: &str) -> CategoryNode {
        CategoryNode {
            id,
            name: name.to_string(),
            hierarchy: Vec::new(),
            has_children: false,
            path: None,
            parent: None,
        }
    }

    #[test]
    fn caches_until_cleared() {
        let cache = CorpusCache::new();
        cache.insert_categories([node(1, "Morphology"), node(2, "Plural")]);
        cache.insert_category(node(2, "Plural marking"));
        assert_eq!(cache.category(2).unwrap().name, "Plural marking");
        assert_eq!(cache.category_names().len(), 2);

        let views = cache.set_views(vec![View::new("a.html", "")]);
        assert_eq!(views.len(), 1);
        assert!(cache.views().is_some());

        cache.insert_answer_batch("S1", &[12, 3, 12], vec![AnswerRecord::new(12, Some("S1"))]);
        assert_eq!(cache.answer_batch("S1", &[3, 12]).unwrap().len(), 1);
        assert!(cache.answer_batch("S2", &[3, 12]).is_none());

        cache.clear();
        assert!(cache.category(1).is_none());
        assert!(cache.views().is_none());
        assert!(cache.answer_batch("S1", &[3, 12]).is_none());
    }
}
