//! Output for a bound document: HTML for the web front end, Markdown for the
//! terminal.

use crate::template::{Binding, Cell, CellContent, Row, Table, TemplateDocument};
use quick_xml::escape::escape;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    #[default]
    Answers,
    /// Bound answer cells become query targets.
    Search,
}

pub fn to_html(document: &TemplateDocument, mode: RenderMode) -> String {
    let mut html = String::with_capacity(1024);
    if !document.main_heading.is_empty() {
        let _ = writeln!(html, "<h1>{}</h1>", escape(document.main_heading.as_str()));
    }
    for (section_index, section) in document.sections.iter().enumerate() {
        let _ = writeln!(html, "<section class=\"corpus-section\">");
        if !section.heading.is_empty() {
            let level = if section.h3_heading.is_some() { 3 } else { 2 };
            let _ = writeln!(
                html,
                "<h{level}>{}</h{level}>",
                escape(section.heading.as_str())
            );
        }
        for (table_index, table) in section.tables.iter().enumerate() {
            let location = format!("{section_index}-{table_index}");
            write_table(&mut html, table, mode, &location);
        }
        html.push_str("</section>\n");
    }
    html
}

fn write_table(html: &mut String, table: &Table, mode: RenderMode, location: &str) {
    html.push_str("<table class=\"corpus-table\">\n");
    if !table.caption.is_empty() {
        let _ = writeln!(html, "<caption>{}</caption>", escape(table.caption.as_str()));
    }
    if !table.headers.is_empty() {
        html.push_str("<thead>\n");
        let mut headers = table.headers.iter().zip(&table.header_spans);
        let single = [table.headers.len()];
        let row_lengths = if table.header_rows.is_empty() {
            &single[..]
        } else {
            &table.header_rows[..]
        };
        for &length in row_lengths {
            html.push_str("<tr>");
            for (header, span) in headers.by_ref().take(length) {
                let _ = write!(
                    html,
                    "<th{}>{}</th>",
                    span_attrs(span.colspan, span.rowspan),
                    escape(header.as_str())
                );
            }
            html.push_str("</tr>\n");
        }
        html.push_str("</thead>\n");
    }
    html.push_str("<tbody>\n");
    for (row_index, row) in table.rows.iter().enumerate() {
        write_row(html, row, mode, &format!("{location}-{row_index}"));
    }
    html.push_str("</tbody>\n</table>\n");
}

fn write_row(html: &mut String, row: &Row, mode: RenderMode, location: &str) {
    html.push_str("<tr>");
    for (cell_index, cell) in row.cells.iter().enumerate() {
        write_cell(html, cell, mode, &format!("{location}-{cell_index}"));
    }
    html.push_str("</tr>\n");
}

fn write_cell(html: &mut String, cell: &Cell, mode: RenderMode, location: &str) {
    let tag = if cell.is_header { "th" } else { "td" };
    let _ = write!(
        html,
        "<{tag}{} data-cell=\"{location}\"",
        span_attrs(cell.span.colspan, cell.span.rowspan)
    );
    if let Some(field) = cell.binding.field() {
        let _ = write!(
            html,
            " data-question-id=\"{}\" data-field=\"{}\"",
            field.id,
            escape(field.field.as_str())
        );
        if mode == RenderMode::Search && !field.is_question() {
            html.push_str(" class=\"search-target\" role=\"button\"");
        }
    }
    html.push('>');
    match &cell.content {
        CellContent::StaticText(text) | CellContent::BoundValue(text) => {
            html.push_str(&escape(text.as_str()));
        }
        CellContent::HtmlFragment(fragment) => html.push_str(fragment),
        CellContent::NestedTable(table) => write_table(html, table, mode, location),
    }
    let _ = write!(html, "</{tag}>");
}

fn span_attrs(colspan: u32, rowspan: u32) -> String {
    let mut attrs = String::new();
    if colspan > 1 {
        let _ = write!(attrs, " colspan=\"{colspan}\"");
    }
    if rowspan > 1 {
        let _ = write!(attrs, " rowspan=\"{rowspan}\"");
    }
    attrs
}

/// Markdown tables for terminal output. Spans are flattened and nested
/// tables collapse into their text.
pub fn to_markdown(document: &TemplateDocument) -> String {
    let mut out = String::new();
    if !document.main_heading.is_empty() {
        let _ = writeln!(out, "# {}\n", document.main_heading);
    }
    for section in &document.sections {
        if !section.heading.is_empty() {
            let marks = if section.h3_heading.is_some() { "###" } else { "##" };
            let _ = writeln!(out, "{marks} {}\n", section.heading);
        }
        for table in &section.tables {
            write_markdown_table(&mut out, table);
            out.push('\n');
        }
    }
    out
}

fn write_markdown_table(out: &mut String, table: &Table) {
    if !table.caption.is_empty() {
        let _ = writeln!(out, "*{}*\n", table.caption);
    }
    let width = table
        .rows
        .iter()
        .map(|row| row.cells.len())
        .chain(std::iter::once(table.headers.len()))
        .max()
        .unwrap_or(0)
        .max(1);
    let mut header: Vec<String> = table.headers.iter().map(|h| markdown_cell(h)).collect();
    header.resize(width, String::new());
    let _ = writeln!(out, "| {} |", header.join(" | "));
    let _ = writeln!(out, "|{}", "---|".repeat(width));
    for row in &table.rows {
        let mut cells: Vec<String> = row
            .cells
            .iter()
            .map(|cell| markdown_cell(&cell.content.plain_text()))
            .collect();
        cells.resize(width, String::new());
        let _ = writeln!(out, "| {} |", cells.join(" | "));
    }
}

fn markdown_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ").trim().to_string()
}

/// Bound cells the search overlay can turn into criteria.
pub fn search_targets(document: &TemplateDocument) -> usize {
    fn count(rows: &[Row]) -> usize {
        rows.iter()
            .flat_map(|row| &row.cells)
            .map(|cell| match (&cell.binding, &cell.content) {
                (Binding::Foreach, CellContent::NestedTable(table)) => count(&table.rows),
                (binding, _) => binding
                    .field()
                    .is_some_and(|field| !field.is_question())
                    .into(),
            })
            .sum()
    }
    document
        .sections
        .iter()
        .flat_map(|section| &section.tables)
        .map(|table| count(&table.rows))
        .sum()
}
