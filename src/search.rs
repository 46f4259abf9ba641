//! Search mode: bound cells become triggers that collect query criteria.

use crate::template::{Binding, FieldRef};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchCriterion {
    pub question_id: u32,
    pub field_name: String,
    pub value: String,
}

/// A criterion waiting for the user to supply a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCriterion {
    pub question_id: u32,
    pub field_name: String,
    /// Cleaned taxonomy hierarchy of the question, once known.
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellClick {
    Ignored,
    /// Outside search mode: show the answer behind the cell.
    ShowAnswer(FieldRef),
    CaptureCriterion(PendingCriterion),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchQuery<'a> {
    pub criteria: &'a [SearchCriterion],
}

#[derive(Debug, Clone, Default)]
pub struct SearchOverlay {
    active: bool,
    criteria: Vec<SearchCriterion>,
    pending: Option<PendingCriterion>,
}

impl SearchOverlay {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Returns true when the mode actually switched on. Criteria collected
    /// earlier are kept.
    pub fn enter(&mut self) -> bool {
        let switched = !self.active;
        self.active = true;
        switched
    }

    /// Leaving search mode drops every collected criterion.
    pub fn exit(&mut self) {
        self.active = false;
        self.criteria.clear();
        self.pending = None;
    }

    pub fn toggle(&mut self) -> bool {
        if self.active {
            self.exit();
        } else {
            self.enter();
        }
        self.active
    }

    pub fn click(&self, binding: &Binding) -> CellClick {
        let Some(field) = binding.field() else {
            return CellClick::Ignored;
        };
        if !self.active {
            return CellClick::ShowAnswer(field.clone());
        }
        if field.is_question() {
            return CellClick::Ignored;
        }
        CellClick::CaptureCriterion(PendingCriterion {
            question_id: field.id,
            field_name: field.field.clone(),
            label: None,
        })
    }

    pub fn begin_capture(&mut self, pending: PendingCriterion) {
        self.pending = Some(pending);
    }

    pub fn pending(&self) -> Option<&PendingCriterion> {
        self.pending.as_ref()
    }

    /// Appends the pending criterion with the given value. Duplicates are
    /// kept; order is insertion order.
    pub fn confirm(&mut self, value: impl Into<String>) -> Option<&SearchCriterion> {
        let pending = self.pending.take()?;
        self.criteria.push(SearchCriterion {
            question_id: pending.question_id,
            field_name: pending.field_name,
            value: value.into(),
        });
        self.criteria.last()
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn criteria(&self) -> &[SearchCriterion] {
        &self.criteria
    }

    pub fn query(&self) -> SearchQuery<'_> {
        SearchQuery {
            criteria: &self.criteria,
        }
    }
}
