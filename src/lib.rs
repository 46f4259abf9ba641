//! Table templates for a dialect corpus.
//!
//! A view is a markup document whose table cells carry binding directives
//! (`{id: 12, field: form}`, `[foreach] ... [endforeach]`). This crate parses
//! such views into a typed document, fills them with the answers recorded for
//! a sample, and lets bound cells act as search criteria instead.

pub mod answers;
pub mod binder;
pub mod cache;
pub mod directive;
pub mod markup;
pub mod render;
pub mod search;
pub mod session;
pub mod source;
pub mod taxonomy;
pub mod template;
#[cfg(feature = "web")]
pub mod web;

pub use answers::{Answer, AnswerRecord, CombinedAnswer, group_answers};
pub use binder::{BindContext, BindOutcome, bind};
pub use cache::CorpusCache;
pub use render::RenderMode;
pub use search::{SearchCriterion, SearchOverlay};
pub use session::{CellAction, LoadedView, SessionError, TablesSession};
pub use source::{CorpusSource, FixtureCorpus, SourceError, View};
pub use taxonomy::{CategoryNavigator, CategoryNode, ViewNotFound};
pub use template::{
    Binding, Cell, CellContent, CellPath, FieldRef, Section, Table, TemplateDocument,
};

use std::collections::HashMap;

/// Parses and binds a template in one go. Returns `None` when the markup
/// cannot be parsed. Missing taxonomy names are left empty.
pub fn render_template(
    markup: &str,
    answers: Vec<AnswerRecord>,
    category_names: &HashMap<u32, String>,
    has_sample: bool,
) -> Option<TemplateDocument> {
    let document = template::parse(markup)?;
    let answers = group_answers(answers);
    let outcome = bind(
        &document,
        &BindContext {
            answers: &answers,
            category_names,
            has_sample,
        },
    );
    Some(outcome.document)
}
