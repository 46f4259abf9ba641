//! Drives a table view from category selection to a bound document.
//!
//! The flow: a leaf category resolves to a view, the view's markup is parsed
//! once, answers for every referenced taxonomy id are fetched when a sample is
//! selected, and the parsed tree is bound. Taxonomy names that are not cached
//! yet are fetched afterwards; each arrival rebinds the same parsed tree.

use crate::answers::{Answer, group_answers};
use crate::binder::{self, BindContext};
use crate::cache::CorpusCache;
use crate::search::{CellClick, PendingCriterion, SearchCriterion, SearchOverlay};
use crate::source::{CorpusSource, SourceError, View};
use crate::taxonomy::{self, CategoryNavigator, CategoryNode, NodeState, Toggle, ViewNotFound};
use crate::template::{self, CellPath, FieldRef, TemplateDocument};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown category #{0}")]
    UnknownCategory(u32),
    #[error("category #{0} does not map to a table")]
    NotATable(u32),
    #[error("table not found: {0}")]
    TableNotFound(#[from] ViewNotFound),
    #[error("no table view is open")]
    NoView,
    #[error("no cell at {0:?}")]
    NoCell(CellPath),
}

/// A loaded view: the parsed template, the answers fetched for it and the
/// latest bound copy.
#[derive(Debug, Clone)]
pub struct LoadedView {
    pub filename: String,
    /// `None` when the markup could not be parsed.
    pub template: Option<TemplateDocument>,
    pub answers: HashMap<u32, Answer>,
    pub rendered: Option<TemplateDocument>,
}

/// Response to a cell click.
#[derive(Debug, Clone, PartialEq)]
pub enum CellAction {
    Ignored,
    ShowAnswer {
        field: FieldRef,
        answer: Option<Answer>,
    },
    CaptureCriterion(PendingCriterion),
}

pub struct TablesSession<S> {
    source: S,
    cache: Arc<CorpusCache>,
    navigator: CategoryNavigator,
    overlay: SearchOverlay,
    sample: Option<String>,
    current: Option<LoadedView>,
}

impl<S: CorpusSource> TablesSession<S> {
    pub fn new(source: S, cache: Arc<CorpusCache>) -> Self {
        Self {
            source,
            cache,
            navigator: CategoryNavigator::default(),
            overlay: SearchOverlay::default(),
            sample: None,
            current: None,
        }
    }

    pub fn navigator(&self) -> &CategoryNavigator {
        &self.navigator
    }

    pub fn sample(&self) -> Option<&str> {
        self.sample.as_deref()
    }

    pub fn current(&self) -> Option<&LoadedView> {
        self.current.as_ref()
    }

    pub fn rendered(&self) -> Option<&TemplateDocument> {
        self.current.as_ref().and_then(|view| view.rendered.as_ref())
    }

    pub fn is_search_mode(&self) -> bool {
        self.overlay.is_active()
    }

    pub fn criteria(&self) -> &[SearchCriterion] {
        self.overlay.criteria()
    }

    pub fn overlay(&self) -> &SearchOverlay {
        &self.overlay
    }

    /// Loads the top level of the category tree.
    pub async fn load_roots(&mut self) {
        let roots = match self.source.children(None).await {
            Ok(roots) => roots,
            Err(err) => {
                warn!(error = %err, "failed to load top-level categories");
                Vec::new()
            }
        };
        self.cache.insert_categories(roots.iter().cloned());
        self.navigator.set_roots(roots);
    }

    /// Toggles a node, fetching its children the first time it opens.
    pub async fn expand(&mut self, id: u32) -> Toggle {
        let toggle = self.navigator.toggle(id);
        if let Toggle::Fetch(parent) = toggle {
            match self.source.children(Some(parent)).await {
                Ok(children) => {
                    self.cache.insert_categories(children.iter().cloned());
                    self.navigator.finish_loading(parent, children);
                }
                Err(err) => {
                    warn!(error = %err, category = parent, "failed to load child categories");
                    self.navigator.fail_loading(parent);
                }
            }
        }
        toggle
    }

    /// Opens every node level by level. A node whose children fail to load
    /// is tried once and left collapsed.
    pub async fn expand_all(&mut self) {
        let mut attempted = HashSet::new();
        loop {
            let pending: Vec<u32> = self
                .navigator
                .flatten()
                .iter()
                .filter(|row| row.node.has_children && row.state == NodeState::Collapsed)
                .map(|row| row.node.id)
                .filter(|id| !attempted.contains(id))
                .collect();
            if pending.is_empty() {
                break;
            }
            for id in pending {
                attempted.insert(id);
                self.expand(id).await;
            }
        }
    }

    /// Opens the table a leaf category points to.
    pub async fn select_category(&mut self, id: u32) -> Result<&LoadedView, SessionError> {
        let node = match self.navigator.node(id).cloned() {
            Some(node) => node,
            None => {
                let node = fetch_category(&self.source, &self.cache, id)
                    .await
                    .map_err(|_| SessionError::UnknownCategory(id))?;
                self.navigator.remember(node.clone());
                node
            }
        };
        let Some(path) = node.path.as_deref().filter(|_| node.is_end_leaf()) else {
            return Err(SessionError::NotATable(id));
        };
        let views = self.views().await;
        let view = taxonomy::resolve_view(path, &views)?.clone();
        Ok(self.open(view).await)
    }

    /// Opens a view by exact filename or stem.
    pub async fn open_view(&mut self, filename: &str) -> Result<&LoadedView, SessionError> {
        let views = self.views().await;
        let view = views
            .iter()
            .find(|view| view.filename == filename || view.stem() == filename)
            .cloned()
            .ok_or_else(|| ViewNotFound {
                path: filename.to_string(),
                filename: filename.to_string(),
            })?;
        Ok(self.open(view).await)
    }

    /// Parses and binds markup that did not come from the view list.
    pub async fn open_markup(&mut self, filename: &str, markup: &str) -> &LoadedView {
        self.open(View::new(filename, markup)).await
    }

    async fn open(&mut self, view: View) -> &LoadedView {
        let template = template::parse(&view.content);
        debug!(view = %view.filename, parsed = template.is_some(), "opening view");
        let mut loaded = LoadedView {
            filename: view.filename,
            template,
            answers: HashMap::new(),
            rendered: None,
        };
        loaded.answers = load_answers(
            &self.source,
            &self.cache,
            loaded.template.as_ref(),
            self.sample.as_deref(),
        )
        .await;
        bind_view(&self.source, &self.cache, &mut loaded, self.sample.is_some()).await;
        self.current.insert(loaded)
    }

    /// Changes the active sample and rebinds the open view. Answers never
    /// show during search mode, so picking a sample leaves it.
    pub async fn select_sample(&mut self, sample: Option<String>) {
        self.sample = sample.filter(|sample| !sample.trim().is_empty());
        if self.sample.is_some() && self.overlay.is_active() {
            debug!("sample selected; leaving search mode");
            self.overlay.exit();
        }
        self.refresh().await;
    }

    /// Entering search mode clears the sample so no answers show while a query
    /// is built. Leaving it discards the collected criteria.
    pub async fn set_search_mode(&mut self, active: bool) {
        if active {
            self.overlay.enter();
            if self.sample.take().is_some() {
                self.refresh().await;
            }
        } else {
            self.overlay.exit();
        }
    }

    /// Refetches answers for the open view and binds it again.
    pub async fn refresh(&mut self) {
        let Some(view) = self.current.as_mut() else {
            return;
        };
        view.answers = load_answers(
            &self.source,
            &self.cache,
            view.template.as_ref(),
            self.sample.as_deref(),
        )
        .await;
        bind_view(&self.source, &self.cache, view, self.sample.is_some()).await;
    }

    pub async fn click_cell(&mut self, path: CellPath) -> Result<CellAction, SessionError> {
        let view = self.current.as_ref().ok_or(SessionError::NoView)?;
        let cell = view
            .template
            .as_ref()
            .and_then(|template| template.cell(&path))
            .ok_or(SessionError::NoCell(path))?;
        match self.overlay.click(&cell.binding) {
            CellClick::Ignored => Ok(CellAction::Ignored),
            CellClick::ShowAnswer(field) => {
                let answer = view.answers.get(&field.id).cloned();
                Ok(CellAction::ShowAnswer { field, answer })
            }
            CellClick::CaptureCriterion(mut pending) => {
                pending.label = fetch_category(&self.source, &self.cache, pending.question_id)
                    .await
                    .map(|node| node.hierarchy_label())
                    .map_err(|err| warn!(error = %err, "failed to load search hierarchy"))
                    .ok();
                self.overlay.begin_capture(pending.clone());
                Ok(CellAction::CaptureCriterion(pending))
            }
        }
    }

    pub fn confirm_criterion(&mut self, value: impl Into<String>) -> Option<SearchCriterion> {
        self.overlay.confirm(value).cloned()
    }

    pub fn cancel_criterion(&mut self) {
        self.overlay.cancel();
    }

    /// Forgets the open view, the sample, search state and every cache entry.
    pub fn reset(&mut self) {
        self.cache.clear();
        self.current = None;
        self.sample = None;
        self.overlay.exit();
    }

    async fn views(&self) -> Arc<[View]> {
        if let Some(views) = self.cache.views() {
            return views;
        }
        match self.source.views().await {
            Ok(views) => self.cache.set_views(views),
            Err(err) => {
                warn!(error = %err, "failed to load views");
                Arc::from(Vec::new())
            }
        }
    }
}

/// Answers for every id the template references, fetched once per sample.
async fn load_answers<S: CorpusSource>(
    source: &S,
    cache: &CorpusCache,
    template: Option<&TemplateDocument>,
    sample: Option<&str>,
) -> HashMap<u32, Answer> {
    let (Some(template), Some(sample)) = (template, sample) else {
        return HashMap::new();
    };
    let ids: Vec<u32> = template.referenced_ids().into_iter().collect();
    if ids.is_empty() {
        return HashMap::new();
    }
    if let Some(records) = cache.answer_batch(sample, &ids) {
        return group_answers(records.to_vec());
    }
    match source.answers(&ids, Some(sample)).await {
        Ok(records) => group_answers(cache.insert_answer_batch(sample, &ids, records).to_vec()),
        Err(err) => {
            warn!(error = %err, sample, "failed to load answers");
            HashMap::new()
        }
    }
}

/// Binds the parsed template, then fetches missing taxonomy names one by one
/// and rebinds the same parsed tree after each arrival.
async fn bind_view<S: CorpusSource>(
    source: &S,
    cache: &CorpusCache,
    view: &mut LoadedView,
    has_sample: bool,
) {
    let Some(template) = view.template.as_ref() else {
        view.rendered = None;
        return;
    };
    let names = cache.category_names();
    let outcome = binder::bind(
        template,
        &BindContext {
            answers: &view.answers,
            category_names: &names,
            has_sample,
        },
    );
    view.rendered = Some(outcome.document);

    for id in outcome.missing_names {
        if let Err(err) = fetch_category(source, cache, id).await {
            warn!(error = %err, category = id, "failed to load category name");
            continue;
        }
        let names = cache.category_names();
        let rebound = binder::bind(
            template,
            &BindContext {
                answers: &view.answers,
                category_names: &names,
                has_sample,
            },
        );
        view.rendered = Some(rebound.document);
    }
}

async fn fetch_category<S: CorpusSource>(
    source: &S,
    cache: &CorpusCache,
    id: u32,
) -> Result<CategoryNode, SourceError> {
    if let Some(node) = cache.category(id) {
        return Ok(node);
    }
    let node = source.category(id).await?;
    cache.insert_category(node.clone());
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answers::AnswerRecord;
    use crate::source::FixtureCorpus;
    use crate::template::CellContent;
    use parking_lot::Mutex;

    const CORPUS: &str = r#"{
        "categories": [
            {"id": 1, "name": "Morphology", "hierarchy": ["RMS", "Morphology"], "has_children": true},
            {"id": 12, "name": "Plural", "hierarchy": ["RMS", "Morphology", "Plural"], "parent": 1, "path": "morphology/plural"},
            {"id": 13, "name": "Dual", "hierarchy": ["RMS", "Morphology", "Dual"], "parent": 1},
            {"id": 14, "name": "Orphan", "parent": 1, "path": "morphology/orphan"}
        ],
        "views": [
            {"filename": "morphology-plural.html", "content": "<h2>Number</h2><table><tr><td>{id: 12, field: question}</td></tr><tr><td>{id: 12, field: form}</td></tr></table>"}
        ],
        "answers": [
            {"category": 12, "sample": "S1", "form": "cats"},
            {"category": 12, "sample": "S2", "form": "kittens"},
            {"category": 12, "sample": "S2", "form": "cats"}
        ]
    }"#;

    fn session() -> TablesSession<FixtureCorpus> {
        TablesSession::new(
            FixtureCorpus::from_json_str(CORPUS).unwrap(),
            Arc::new(CorpusCache::new()),
        )
    }

    fn cell_text(session: &TablesSession<impl CorpusSource>, row: usize) -> String {
        session.rendered().unwrap().sections[0].tables[0].rows[row].cells[0]
            .content
            .plain_text()
    }

    #[tokio::test]
    async fn selecting_a_leaf_renders_its_table() {
        let mut session = session();
        session.load_roots().await;
        session.expand(1).await;
        session.select_sample(Some("S1".to_string())).await;
        session.select_category(12).await.unwrap();
        assert_eq!(cell_text(&session, 0), "Plural");
        assert_eq!(cell_text(&session, 1), "cats");

        session.select_sample(Some("S2".to_string())).await;
        assert_eq!(cell_text(&session, 1), "kittens, cats");
    }

    #[tokio::test]
    async fn expand_all_opens_the_whole_tree() {
        let mut session = session();
        session.load_roots().await;
        session.expand_all().await;
        let ids: Vec<u32> = session.navigator().flatten().iter().map(|row| row.node.id).collect();
        assert_eq!(ids, vec![1, 12, 13, 14]);
    }

    #[tokio::test]
    async fn headers_fill_without_a_sample() {
        let mut session = session();
        session.select_category(12).await.unwrap();
        assert_eq!(cell_text(&session, 0), "Plural");
        assert_eq!(cell_text(&session, 1), "");
    }

    #[tokio::test]
    async fn non_leaf_and_unmapped_categories_fail() {
        let mut session = session();
        session.load_roots().await;
        session.expand(1).await;
        assert!(matches!(
            session.select_category(13).await,
            Err(SessionError::NotATable(13))
        ));
        assert!(matches!(
            session.select_category(14).await,
            Err(SessionError::TableNotFound(_))
        ));
        assert!(matches!(
            session.select_category(404).await,
            Err(SessionError::UnknownCategory(404))
        ));
    }

    #[tokio::test]
    async fn unparseable_markup_renders_nothing() {
        let mut session = session();
        let view = session.open_markup("broken", "<table><!-- never closed").await;
        assert!(view.template.is_none());
        assert!(session.rendered().is_none());
    }

    #[tokio::test]
    async fn search_mode_clears_sample_and_collects_criteria() {
        let mut session = session();
        session.select_sample(Some("S1".to_string())).await;
        session.open_view("morphology-plural").await.unwrap();
        let form_cell = CellPath {
            row: 1,
            ..CellPath::default()
        };

        let action = session.click_cell(form_cell).await.unwrap();
        let CellAction::ShowAnswer { answer, .. } = action else {
            panic!("expected answer details");
        };
        assert_eq!(answer.unwrap().resolve_field("form"), "cats");

        session.set_search_mode(true).await;
        assert_eq!(session.sample(), None);
        assert_eq!(cell_text(&session, 1), "");

        let CellAction::CaptureCriterion(pending) = session.click_cell(form_cell).await.unwrap()
        else {
            panic!("expected criterion capture");
        };
        assert_eq!(pending.label.as_deref(), Some("Morphology > Plural"));
        session.confirm_criterion("cats");
        session.click_cell(form_cell).await.unwrap();
        session.confirm_criterion("cats");
        assert_eq!(session.criteria().len(), 2);

        assert_eq!(
            session.click_cell(CellPath::default()).await.unwrap(),
            CellAction::Ignored
        );

        session.set_search_mode(false).await;
        assert!(session.criteria().is_empty());
    }

    #[tokio::test]
    async fn selecting_a_sample_leaves_search_mode() {
        let mut session = session();
        session.open_view("morphology-plural").await.unwrap();
        session.set_search_mode(true).await;
        session.select_sample(None).await;
        assert!(session.is_search_mode());

        session.select_sample(Some("S1".to_string())).await;
        assert!(!session.is_search_mode());
        assert_eq!(session.sample(), Some("S1"));
        assert_eq!(cell_text(&session, 1), "cats");
    }

    #[tokio::test]
    async fn missing_category_leaves_sibling_cells_bound() {
        let mut session = session();
        session.select_sample(Some("S1".to_string())).await;
        let view = session
            .open_markup(
                "inline",
                "<table><tr><td>{id: 99, field: question}</td><td>{id: 12, field: question}</td>\
                 <td>{id: 12, field: form}</td></tr></table>",
            )
            .await;
        let cells = &view.rendered.as_ref().unwrap().sections[0].tables[0].rows[0].cells;
        assert_eq!(cells[0].content, CellContent::BoundValue(String::new()));
        assert_eq!(cells[1].content, CellContent::BoundValue("Plural".to_string()));
        assert_eq!(cells[2].content, CellContent::BoundValue("cats".to_string()));
    }

    /// Records fetches and fails answers on demand.
    struct CountingSource {
        inner: FixtureCorpus,
        category_calls: Mutex<Vec<u32>>,
        fail_answers: bool,
    }

    impl CorpusSource for CountingSource {
        async fn answers(
            &self,
            ids: &[u32],
            sample: Option<&str>,
        ) -> Result<Vec<AnswerRecord>, SourceError> {
            if self.fail_answers {
                return Err(SourceError::Unavailable("answers offline".to_string()));
            }
            self.inner.answers(ids, sample).await
        }

        async fn category(&self, id: u32) -> Result<CategoryNode, SourceError> {
            self.category_calls.lock().push(id);
            self.inner.category(id).await
        }

        async fn views(&self) -> Result<Vec<View>, SourceError> {
            self.inner.views().await
        }

        async fn children(&self, parent: Option<u32>) -> Result<Vec<CategoryNode>, SourceError> {
            self.inner.children(parent).await
        }
    }

    fn counting(fail_answers: bool) -> CountingSource {
        CountingSource {
            inner: FixtureCorpus::from_json_str(CORPUS).unwrap(),
            category_calls: Mutex::new(Vec::new()),
            fail_answers,
        }
    }

    #[tokio::test]
    async fn category_names_are_fetched_once_per_session() {
        let cache = Arc::new(CorpusCache::new());
        let mut session = TablesSession::new(counting(false), Arc::clone(&cache));
        session.open_view("morphology-plural.html").await.unwrap();
        session.select_sample(Some("S1".to_string())).await;
        session.open_view("morphology-plural.html").await.unwrap();
        assert_eq!(*session.source.category_calls.lock(), vec![12]);

        session.reset();
        assert!(cache.category(12).is_none());
        assert!(session.rendered().is_none());
    }

    #[tokio::test]
    async fn answer_failures_degrade_to_empty_cells() {
        let mut session = TablesSession::new(counting(true), Arc::new(CorpusCache::new()));
        session.select_sample(Some("S1".to_string())).await;
        session.open_view("morphology-plural").await.unwrap();
        assert_eq!(cell_text(&session, 0), "Plural");
        assert_eq!(cell_text(&session, 1), "");
    }

    #[tokio::test]
    async fn late_names_preserve_bound_answers() {
        let mut session = session();
        session.select_sample(Some("S1".to_string())).await;
        let view = session
            .open_markup(
                "inline",
                "<table><tr><td>{id: 12, field: form}</td><td>{id: 12, field: question}</td></tr></table>",
            )
            .await;
        let row = &view.rendered.as_ref().unwrap().sections[0].tables[0].rows[0];
        assert_eq!(row.cells[0].content, CellContent::BoundValue("cats".to_string()));
        assert_eq!(row.cells[1].content, CellContent::BoundValue("Plural".to_string()));
    }
}
