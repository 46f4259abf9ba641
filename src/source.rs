//! The fetches the tables engine depends on, and a file-backed corpus.

use crate::answers::AnswerRecord;
use crate::taxonomy::CategoryNode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid corpus data: {0}")]
    Json(#[from] serde_json::Error),
    #[error("category #{0} not found")]
    CategoryNotFound(u32),
    #[error("corpus unavailable: {0}")]
    Unavailable(String),
}

/// A named template document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub filename: String,
    pub content: String,
}

impl View {
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }

    /// Filename without its extension.
    pub fn stem(&self) -> &str {
        Path::new(&self.filename)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&self.filename)
    }
}

/// Data access consumed by the tables engine.
pub trait CorpusSource {
    /// Answers for the given taxonomy ids, optionally restricted to a sample.
    fn answers(
        &self,
        ids: &[u32],
        sample: Option<&str>,
    ) -> impl Future<Output = Result<Vec<AnswerRecord>, SourceError>> + Send;

    fn category(&self, id: u32) -> impl Future<Output = Result<CategoryNode, SourceError>> + Send;

    fn views(&self) -> impl Future<Output = Result<Vec<View>, SourceError>> + Send;

    /// Children of a category; `None` lists the top level.
    fn children(
        &self,
        parent: Option<u32>,
    ) -> impl Future<Output = Result<Vec<CategoryNode>, SourceError>> + Send;
}

impl<T: CorpusSource + Send + Sync> CorpusSource for Arc<T> {
    fn answers(
        &self,
        ids: &[u32],
        sample: Option<&str>,
    ) -> impl Future<Output = Result<Vec<AnswerRecord>, SourceError>> + Send {
        (**self).answers(ids, sample)
    }

    fn category(&self, id: u32) -> impl Future<Output = Result<CategoryNode, SourceError>> + Send {
        (**self).category(id)
    }

    fn views(&self) -> impl Future<Output = Result<Vec<View>, SourceError>> + Send {
        (**self).views()
    }

    fn children(
        &self,
        parent: Option<u32>,
    ) -> impl Future<Output = Result<Vec<CategoryNode>, SourceError>> + Send {
        (**self).children(parent)
    }
}

/// A whole corpus held in memory, usually loaded from a JSON file of the form
/// `{"categories": [...], "views": [...], "answers": [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureCorpus {
    #[serde(default)]
    pub categories: Vec<CategoryNode>,
    #[serde(default)]
    pub views: Vec<View>,
    #[serde(default)]
    pub answers: Vec<AnswerRecord>,
}

impl FixtureCorpus {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, SourceError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Samples that have at least one answer, in first-seen order.
    pub fn samples(&self) -> Vec<&str> {
        let mut samples: Vec<&str> = Vec::new();
        for sample in self.answers.iter().filter_map(|answer| answer.sample.as_deref()) {
            if !samples.contains(&sample) {
                samples.push(sample);
            }
        }
        samples
    }
}

impl CorpusSource for FixtureCorpus {
    async fn answers(
        &self,
        ids: &[u32],
        sample: Option<&str>,
    ) -> Result<Vec<AnswerRecord>, SourceError> {
        Ok(self
            .answers
            .iter()
            .filter(|answer| ids.contains(&answer.taxonomy_id))
            .filter(|answer| sample.is_none_or(|sample| answer.sample.as_deref() == Some(sample)))
            .cloned()
            .collect())
    }

    async fn category(&self, id: u32) -> Result<CategoryNode, SourceError> {
        self.categories
            .iter()
            .find(|node| node.id == id)
            .cloned()
            .ok_or(SourceError::CategoryNotFound(id))
    }

    async fn views(&self) -> Result<Vec<View>, SourceError> {
        Ok(self.views.clone())
    }

    async fn children(&self, parent: Option<u32>) -> Result<Vec<CategoryNode>, SourceError> {
        Ok(self
            .categories
            .iter()
            .filter(|node| node.parent == parent)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORPUS: &str = r#"{
        "categories": [
            {"id": 1, "name": "Morphology", "hierarchy": ["RMS", "Morphology"], "has_children": true},
            {"id": 12, "name": "Plural", "hierarchy": ["RMS", "Morphology", "Plural"], "parent": 1, "path": "morphology/plural"}
        ],
        "views": [{"filename": "morphology-plural.html", "content": "<table></table>"}],
        "answers": [
            {"category": 12, "sample": "S1", "form": "cats"},
            {"question_id": 12, "sample": "S2", "form": "dogs"}
        ]
    }"#;

    #[tokio::test]
    async fn fixture_filters_answers_by_sample() {
        let corpus = FixtureCorpus::from_json_str(CORPUS).unwrap();
        let all = corpus.answers(&[12], None).await.unwrap();
        assert_eq!(all.len(), 2);
        let s2 = corpus.answers(&[12], Some("S2")).await.unwrap();
        assert_eq!(s2.len(), 1);
        assert_eq!(s2[0].resolve("form"), "dogs");
        assert!(corpus.answers(&[99], None).await.unwrap().is_empty());
        assert_eq!(corpus.samples(), vec!["S1", "S2"]);
    }

    #[tokio::test]
    async fn fixture_serves_tree_levels() {
        let corpus = Arc::new(FixtureCorpus::from_json_str(CORPUS).unwrap());
        let roots = corpus.children(None).await.unwrap();
        assert_eq!(roots.iter().map(|n| n.id).collect::<Vec<_>>(), vec![1]);
        let children = corpus.children(Some(1)).await.unwrap();
        assert_eq!(children[0].path.as_deref(), Some("morphology/plural"));
        assert!(matches!(
            corpus.category(5).await,
            Err(SourceError::CategoryNotFound(5))
        ));
    }

    #[test]
    fn view_stem_strips_extension() {
        assert_eq!(View::new("a-b.html", "").stem(), "a-b");
        assert_eq!(View::new("plain", "").stem(), "plain");
    }
}
