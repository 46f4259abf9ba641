//! Structural model of a table template and the parser that builds it.
//!
//! A template is a markup fragment of `h1`/`h2`/`h3` headings and `table`
//! elements in document order. Parsing yields sections of tables of rows of
//! cells; every cell carries its rendered content and the directive it was
//! bound with side by side, so the binder never has to look anything up in a
//! second tree.

use crate::directive;
use crate::markup::{self, Element, MarkupError};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, warn};

pub const QUESTION_FIELD: &str = "question";

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error(transparent)]
    Markup(#[from] MarkupError),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TemplateDocument {
    pub main_heading: String,
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Section {
    /// Heading shown for the section: the `h3` when present, else the `h2`.
    pub heading: String,
    pub h2_heading: Option<String>,
    pub h3_heading: Option<String>,
    pub tables: Vec<Table>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Table {
    pub caption: String,
    pub headers: Vec<String>,
    /// One span per header, same length as `headers`.
    pub header_spans: Vec<Span>,
    /// Header cells per header row; the counts sum to `headers.len()`.
    pub header_rows: Vec<usize>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Span {
    pub colspan: u32,
    pub rowspan: u32,
}

impl Default for Span {
    fn default() -> Self {
        Self {
            colspan: 1,
            rowspan: 1,
        }
    }
}

impl Span {
    fn from_element(element: &Element) -> Self {
        Self {
            colspan: span_attr(element, "colspan"),
            rowspan: span_attr(element, "rowspan"),
        }
    }
}

fn span_attr(element: &Element, name: &str) -> u32 {
    element
        .attr(name)
        .and_then(|value| value.trim().parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Row {
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cell {
    pub content: CellContent,
    pub binding: Binding,
    pub span: Span,
    pub is_header: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CellContent {
    StaticText(String),
    /// Resolved answer or taxonomy name; empty until bound.
    BoundValue(String),
    /// Pre-rendered markup, used for vertically stacked answers.
    HtmlFragment(String),
    NestedTable(Box<Table>),
}

impl CellContent {
    /// Plain text of the cell, flattening fragments and nested tables.
    pub fn plain_text(&self) -> String {
        match self {
            CellContent::StaticText(text) | CellContent::BoundValue(text) => text.clone(),
            CellContent::HtmlFragment(html) => markup::parse_fragment(html)
                .map(|fragment| {
                    fragment
                        .root()
                        .elements()
                        .map(|element| element.text_content())
                        .collect::<Vec<_>>()
                        .join(" / ")
                })
                .unwrap_or_else(|_| html.clone()),
            CellContent::NestedTable(table) => table
                .rows
                .iter()
                .map(|row| {
                    row.cells
                        .iter()
                        .map(|cell| cell.content.plain_text())
                        .filter(|text| !text.is_empty())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .filter(|text| !text.is_empty())
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Binding {
    Static,
    Simple(FieldRef),
    ForeachDiv(FieldRef),
    /// The rows of the nested table carry their own bindings.
    Foreach,
}

impl Binding {
    pub fn field(&self) -> Option<&FieldRef> {
        match self {
            Binding::Simple(field) | Binding::ForeachDiv(field) => Some(field),
            Binding::Static | Binding::Foreach => None,
        }
    }
}

/// Taxonomy id plus the answer field (or `|`-separated alternates) to show.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FieldRef {
    pub id: u32,
    pub field: String,
}

impl FieldRef {
    pub fn new(id: u32, field: impl Into<String>) -> Self {
        Self {
            id,
            field: field.into(),
        }
    }

    pub fn is_question(&self) -> bool {
        self.field == QUESTION_FIELD
    }

    pub fn alternates(&self) -> impl Iterator<Item = &str> + '_ {
        self.field
            .split('|')
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

/// Cell counts per section, table and row.
pub type Shape = Vec<Vec<Vec<usize>>>;

impl TemplateDocument {
    pub fn shape(&self) -> Shape {
        self.sections
            .iter()
            .map(|section| {
                section
                    .tables
                    .iter()
                    .map(|table| table.rows.iter().map(|row| row.cells.len()).collect())
                    .collect()
            })
            .collect()
    }

    /// Every taxonomy id referenced by a binding, nested tables included.
    pub fn referenced_ids(&self) -> BTreeSet<u32> {
        let mut ids = BTreeSet::new();
        for table in self.sections.iter().flat_map(|section| &section.tables) {
            collect_ids(&table.rows, &mut ids);
        }
        ids
    }

    pub fn cell(&self, path: &CellPath) -> Option<&Cell> {
        let table = self.sections.get(path.section)?.tables.get(path.table)?;
        let cell = table.rows.get(path.row)?.cells.get(path.cell)?;
        match path.nested {
            None => Some(cell),
            Some((row, index)) => match &cell.content {
                CellContent::NestedTable(nested) => nested.rows.get(row)?.cells.get(index),
                _ => None,
            },
        }
    }
}

fn collect_ids(rows: &[Row], ids: &mut BTreeSet<u32>) {
    for cell in rows.iter().flat_map(|row| &row.cells) {
        if let Some(field) = cell.binding.field() {
            ids.insert(field.id);
        }
        if let CellContent::NestedTable(table) = &cell.content {
            collect_ids(&table.rows, ids);
        }
    }
}

/// Position of a cell; `nested` addresses a cell inside a foreach table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, serde::Deserialize)]
pub struct CellPath {
    pub section: usize,
    pub table: usize,
    pub row: usize,
    pub cell: usize,
    #[serde(default)]
    pub nested: Option<(usize, usize)>,
}

/// Parses a template, treating any failure as "nothing to render".
pub fn parse(markup: &str) -> Option<TemplateDocument> {
    match try_parse(markup) {
        Ok(document) => Some(document),
        Err(err) => {
            warn!(error = %err, "template could not be parsed");
            None
        }
    }
}

pub fn try_parse(markup: &str) -> Result<TemplateDocument, TemplateError> {
    let fragment = markup::parse_fragment(markup)?;
    let mut builder = DocumentBuilder::default();
    for element in fragment.top_level() {
        match element.name() {
            "h1" => builder.document.main_heading = heading_text(element),
            "h2" => {
                builder.flush();
                builder.h2 = Some(heading_text(element));
                builder.h3 = None;
            }
            "h3" => {
                builder.flush();
                builder.h3 = Some(heading_text(element));
            }
            "table" => builder.tables.push(parse_table_element(element)),
            _ => {}
        }
    }
    builder.flush();
    let document = builder.document;
    debug!(
        sections = document.sections.len(),
        tables = document.sections.iter().map(|s| s.tables.len()).sum::<usize>(),
        "parsed template"
    );
    Ok(document)
}

fn heading_text(element: &Element) -> String {
    element.text_content().trim().to_string()
}

#[derive(Default)]
struct DocumentBuilder {
    document: TemplateDocument,
    h2: Option<String>,
    h3: Option<String>,
    tables: Vec<Table>,
}

impl DocumentBuilder {
    /// Emits the pending section. Sections without tables are dropped.
    fn flush(&mut self) {
        if self.tables.is_empty() {
            return;
        }
        let heading = self
            .h3
            .clone()
            .or_else(|| self.h2.clone())
            .unwrap_or_default();
        self.document.sections.push(Section {
            heading,
            h2_heading: self.h2.clone(),
            h3_heading: self.h3.clone(),
            tables: std::mem::take(&mut self.tables),
        });
    }
}

struct SourceRow<'a> {
    element: &'a Element,
    in_head: bool,
}

fn table_rows(table: &Element) -> Vec<SourceRow<'_>> {
    let mut rows = Vec::new();
    for child in table.elements() {
        match child.name() {
            "tr" => rows.push(SourceRow {
                element: child,
                in_head: false,
            }),
            "thead" | "tbody" | "tfoot" => {
                let in_head = child.name() == "thead";
                rows.extend(
                    child
                        .elements_named("tr")
                        .map(|element| SourceRow { element, in_head }),
                );
            }
            _ => {}
        }
    }
    rows
}

fn row_cells(row: &Element) -> impl Iterator<Item = &Element> + '_ {
    row.elements()
        .filter(|cell| matches!(cell.name(), "td" | "th"))
}

/// Parses one `<table>` element, including tables nested in foreach blocks.
pub fn parse_table_element(table: &Element) -> Table {
    let rows = table_rows(table);
    let caption = table
        .elements_named("caption")
        .next()
        .map(|caption| caption.text_content().trim().to_string())
        .unwrap_or_default();

    let headerless = rows.first().is_some_and(|row| {
        row_cells(row.element).any(|cell| directive::is_directive(&cell.text_content()))
    });

    let mut headers = Vec::new();
    let mut header_spans = Vec::new();
    let mut header_rows = Vec::new();
    let data_rows: Vec<&SourceRow<'_>> = if headerless {
        rows.iter().collect()
    } else {
        let has_head = rows.iter().any(|row| row.in_head);
        let header_count = if has_head {
            rows.iter().filter(|row| row.in_head).count()
        } else {
            rows.len().min(1)
        };
        let (header_source, body): (Vec<_>, Vec<_>) = rows
            .iter()
            .enumerate()
            .partition(|(index, row)| if has_head { row.in_head } else { *index < header_count });
        for (_, row) in header_source {
            let before = headers.len();
            for cell in row_cells(row.element) {
                headers.push(cell.text_content().trim().to_string());
                header_spans.push(Span::from_element(cell));
            }
            if headers.len() > before {
                header_rows.push(headers.len() - before);
            }
        }
        body.into_iter().map(|(_, row)| row).collect()
    };

    let rows = data_rows
        .into_iter()
        .map(|row| Row {
            cells: row_cells(row.element).map(parse_cell).collect(),
        })
        .collect();

    Table {
        caption,
        headers,
        header_spans,
        header_rows,
        rows,
    }
}

fn parse_cell(element: &Element) -> Cell {
    let text = element.text_content();
    let source = if directive::has_foreach(&text) {
        element.inner_html()
    } else {
        text.trim().to_string()
    };
    let interpreted = directive::interpret(&source);
    Cell {
        content: interpreted.content,
        binding: interpreted.binding,
        span: Span::from_element(element),
        is_header: element.name() == "th",
    }
}
