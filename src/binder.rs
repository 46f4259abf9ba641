//! Fills a parsed template with answers and taxonomy names.
//!
//! Binding never changes the shape of the document: it returns a copy in which
//! only the payloads of bound cells differ. Running it again with the same
//! inputs gives the same document, so a caller can rebind freely whenever a
//! late taxonomy name arrives.

use crate::answers::Answer;
use crate::template::{Binding, Cell, CellContent, FieldRef, Row, TemplateDocument};
use quick_xml::escape::escape;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

pub struct BindContext<'a> {
    pub answers: &'a HashMap<u32, Answer>,
    pub category_names: &'a HashMap<u32, String>,
    /// Without a sample only `question` cells are filled.
    pub has_sample: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindOutcome {
    pub document: TemplateDocument,
    /// Taxonomy ids referenced as `question` whose names are not loaded yet.
    pub missing_names: BTreeSet<u32>,
}

pub fn bind(document: &TemplateDocument, ctx: &BindContext<'_>) -> BindOutcome {
    let mut document = document.clone();
    let mut binder = Binder {
        ctx,
        missing_names: BTreeSet::new(),
        bound: 0,
    };
    for table in document
        .sections
        .iter_mut()
        .flat_map(|section| section.tables.iter_mut())
    {
        binder.bind_rows(&mut table.rows);
    }
    debug!(
        bound = binder.bound,
        missing_names = binder.missing_names.len(),
        has_sample = ctx.has_sample,
        "bound template"
    );
    BindOutcome {
        document,
        missing_names: binder.missing_names,
    }
}

struct Binder<'c, 'a> {
    ctx: &'c BindContext<'a>,
    missing_names: BTreeSet<u32>,
    bound: usize,
}

impl Binder<'_, '_> {
    fn bind_rows(&mut self, rows: &mut [Row]) {
        for cell in rows.iter_mut().flat_map(|row| row.cells.iter_mut()) {
            self.bind_cell(cell);
        }
    }

    fn bind_cell(&mut self, cell: &mut Cell) {
        match &cell.binding {
            Binding::Static => {}
            Binding::Simple(field) => {
                let value = self.value(field);
                cell.content = CellContent::BoundValue(value);
                self.bound += 1;
            }
            Binding::ForeachDiv(field) => {
                let values = self.values(field);
                cell.content = CellContent::HtmlFragment(stack_divs(&values));
                self.bound += 1;
            }
            Binding::Foreach => {
                if let CellContent::NestedTable(table) = &mut cell.content {
                    self.bind_rows(&mut table.rows);
                }
            }
        }
    }

    fn question_name(&mut self, id: u32) -> String {
        match self.ctx.category_names.get(&id) {
            Some(name) => name.clone(),
            None => {
                self.missing_names.insert(id);
                String::new()
            }
        }
    }

    fn value(&mut self, field: &FieldRef) -> String {
        if field.is_question() {
            return self.question_name(field.id);
        }
        if !self.ctx.has_sample {
            return String::new();
        }
        self.ctx
            .answers
            .get(&field.id)
            .map(|answer| answer.resolve_field(&field.field))
            .unwrap_or_default()
    }

    fn values(&mut self, field: &FieldRef) -> Vec<String> {
        if field.is_question() {
            let name = self.question_name(field.id);
            return if name.is_empty() { Vec::new() } else { vec![name] };
        }
        if !self.ctx.has_sample {
            return Vec::new();
        }
        match self.ctx.answers.get(&field.id) {
            Some(answer @ Answer::Combined(_)) => answer.resolve_each(&field.field),
            Some(answer @ Answer::Single(_)) => {
                let value = answer.resolve_field(&field.field);
                if value.is_empty() { Vec::new() } else { vec![value] }
            }
            None => Vec::new(),
        }
    }
}

fn stack_divs(values: &[String]) -> String {
    values
        .iter()
        .map(|value| format!("<div>{}</div>", escape(value.as_str())))
        .collect()
}
