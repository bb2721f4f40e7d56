//! Table markup: parse the layout service's per-page markup into cell grids
//! and render grids back into canonical HTML.
//!
//! The service emits HTML `<table>` markup for recognised tables; some
//! deployments emit GFM pipe tables instead. Both are read into the same
//! structure: tables → rows → cells → segments, where a segment is either a
//! run of text or an embedded image. Images are addressed by an explicit
//! [`ImageSlot`] so the resolver can rewrite one occurrence without touching
//! any other cell that happens to carry the same reference string.
//!
//! Each table remembers where it sits in the source, so an edited page is
//! written back by splicing only the edited tables into the original text.
//! Headings, notes and prose around the tables survive a rewrite untouched.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use std::collections::BTreeSet;
use std::ops::Range;
use thiserror::Error;

/// Widest `colspan` honoured; anything larger is treated as markup noise.
const MAX_COLSPAN: usize = 64;

static TABLE: Lazy<Selector> = Lazy::new(|| Selector::parse("table").unwrap());

static RE_TABLE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<(/?)table\b[^>]*>").unwrap());

static RE_ALIGNMENT_ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\|?\s*:?-{3,}:?\s*(\|\s*:?-{3,}:?\s*)*\|?\s*$").unwrap());

static RE_INLINE_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<img[^>]*?\bsrc\s*=\s*["']([^"']+)["'][^>]*>|!\[([^\]]*)\]\(([^)\s]+)\)"#)
        .unwrap()
});

/// Markup that cannot be read as tabular data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct MarkupError(String);

/// One piece of cell content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Image { src: String, alt: Option<String> },
}

/// One table cell: an ordered run of text and image segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cell {
    pub segments: Vec<Segment>,
}

impl Cell {
    pub fn text(s: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::Text(s.into())],
        }
    }

    /// Visible text with whitespace collapsed.
    pub fn plain_text(&self) -> String {
        let mut raw = String::new();
        for seg in &self.segments {
            if let Segment::Text(t) = seg {
                raw.push_str(t);
                raw.push(' ');
            }
        }
        raw.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    pub fn image_sources(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Image { src, .. } => Some(src.as_str()),
            Segment::Text(_) => None,
        })
    }

    /// True when the cell has no visible text and no image.
    pub fn is_blank(&self) -> bool {
        self.segments.iter().all(|s| match s {
            Segment::Text(t) => t.trim().is_empty(),
            Segment::Image { .. } => false,
        })
    }

    fn push_text(&mut self, s: &str) {
        if let Some(Segment::Text(prev)) = self.segments.last_mut() {
            prev.push_str(s);
        } else {
            self.segments.push(Segment::Text(s.to_string()));
        }
    }
}

/// Where a table sits in the markup it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSource {
    /// Byte range of the top-level `<table>…</table>` element.
    Html(Range<usize>),
    /// Byte range of each row's line, one per entry of `rows`.
    Pipe(Vec<Range<usize>>),
}

/// One table as a list of rows; rows may differ in length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableGrid {
    pub rows: Vec<Vec<Cell>>,
    /// Unknown when the element boundaries could not be matched up.
    pub source: Option<TableSource>,
}

/// Address of one image segment inside a [`ParsedMarkup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSlot {
    pub table: usize,
    pub row: usize,
    pub cell: usize,
    pub segment: usize,
    /// The `src` as it appeared in the markup.
    pub reference: String,
}

/// All tables found in one page's markup, in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMarkup {
    pub tables: Vec<TableGrid>,
    /// `(table, row)` pairs edited since parsing.
    edited: BTreeSet<(usize, usize)>,
}

impl ParsedMarkup {
    /// Every row of every table, in source order.
    pub fn rows(&self) -> impl Iterator<Item = &Vec<Cell>> {
        self.tables.iter().flat_map(|t| t.rows.iter())
    }

    pub fn image_slots(&self) -> Vec<ImageSlot> {
        let mut slots = Vec::new();
        for (ti, table) in self.tables.iter().enumerate() {
            for (ri, row) in table.rows.iter().enumerate() {
                for (ci, cell) in row.iter().enumerate() {
                    for (si, seg) in cell.segments.iter().enumerate() {
                        if let Segment::Image { src, .. } = seg {
                            slots.push(ImageSlot {
                                table: ti,
                                row: ri,
                                cell: ci,
                                segment: si,
                                reference: src.clone(),
                            });
                        }
                    }
                }
            }
        }
        slots
    }

    /// Point one image segment at a new source. Returns false if the slot
    /// does not address an image.
    pub fn set_image_src(&mut self, slot: &ImageSlot, new_src: &str) -> bool {
        let seg = self
            .tables
            .get_mut(slot.table)
            .and_then(|t| t.rows.get_mut(slot.row))
            .and_then(|r| r.get_mut(slot.cell))
            .and_then(|c| c.segments.get_mut(slot.segment));
        match seg {
            Some(Segment::Image { src, .. }) => {
                *src = new_src.to_string();
                self.edited.insert((slot.table, slot.row));
                true
            }
            _ => false,
        }
    }

    /// Write the edits back into `original`, the markup this was parsed
    /// from. An edited HTML table is re-rendered as a whole and an edited
    /// pipe table row by row; every byte outside those spans is kept. When
    /// a span is unknown the page falls back to [`render`].
    pub fn splice(&self, original: &str) -> String {
        let mut edits: Vec<(Range<usize>, String)> = Vec::new();
        for (ti, table) in self.tables.iter().enumerate() {
            let rows: Vec<usize> = self
                .edited
                .range((ti, 0)..=(ti, usize::MAX))
                .map(|&(_, r)| r)
                .collect();
            if rows.is_empty() {
                continue;
            }
            match &table.source {
                Some(TableSource::Html(span)) => edits.push((span.clone(), render_table(table))),
                Some(TableSource::Pipe(lines)) => {
                    for r in rows {
                        match (lines.get(r), table.rows.get(r)) {
                            (Some(span), Some(row)) => {
                                edits.push((span.clone(), render_pipe_row(row)))
                            }
                            _ => return render(self),
                        }
                    }
                }
                None => return render(self),
            }
        }
        edits.sort_by_key(|(span, _)| span.start);

        let mut out = String::with_capacity(original.len());
        let mut last = 0;
        for (span, text) in edits {
            match original.get(last..span.start) {
                Some(between) => out.push_str(between),
                None => return render(self),
            }
            out.push_str(&text);
            last = span.end;
        }
        match original.get(last..) {
            Some(rest) => out.push_str(rest),
            None => return render(self),
        }
        out
    }
}

/// Parse one page's markup.
///
/// Markup without any table is valid and yields no tables. HTML table tags
/// that produce no rows, or `<table>` tags that do not balance, are errors.
pub fn parse(markup: &str) -> Result<ParsedMarkup, MarkupError> {
    let lower = markup.to_ascii_lowercase();
    let has_html_table = lower.contains("<table");
    let has_html_cells = lower.contains("<tr") || lower.contains("<td") || lower.contains("<th");

    if has_html_table {
        let opens = lower.matches("<table").count();
        let closes = lower.matches("</table").count();
        if opens != closes {
            return Err(MarkupError(format!(
                "unbalanced table tags ({opens} opened, {closes} closed)"
            )));
        }
        let mut tables = parse_html(markup);
        if tables.iter().all(|t| t.rows.is_empty()) {
            return Err(MarkupError("table markup contains no rows".to_string()));
        }
        let spans = html_table_spans(markup);
        if spans.len() == tables.len() {
            for (table, span) in tables.iter_mut().zip(spans) {
                table.source = Some(TableSource::Html(span));
            }
        }
        return Ok(ParsedMarkup {
            tables,
            edited: BTreeSet::new(),
        });
    }

    if has_html_cells {
        return Err(MarkupError(
            "table cells outside of a <table> element".to_string(),
        ));
    }

    Ok(ParsedMarkup {
        tables: parse_pipe_tables(markup),
        edited: BTreeSet::new(),
    })
}

// ── HTML tables ──────────────────────────────────────────────────────────────

fn parse_html(markup: &str) -> Vec<TableGrid> {
    let doc = Html::parse_fragment(markup);
    doc.select(&TABLE)
        .filter(|table| !is_nested(table))
        .map(|table| TableGrid {
            rows: direct_rows(&table)
                .iter()
                .map(row_cells)
                .filter(|cells| !cells.is_empty())
                .collect(),
            source: None,
        })
        .collect()
}

/// Byte ranges of top-level `<table>` elements, in source order.
fn html_table_spans(markup: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for caps in RE_TABLE_TAG.captures_iter(markup) {
        let Some(tag) = caps.get(0) else { continue };
        let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
        if !closing {
            if depth == 0 {
                start = tag.start();
            }
            depth += 1;
        } else if depth > 0 {
            depth -= 1;
            if depth == 0 {
                spans.push(start..tag.end());
            }
        }
    }
    spans
}

fn is_nested(table: &ElementRef<'_>) -> bool {
    table
        .ancestors()
        .any(|n| n.value().as_element().is_some_and(|e| e.name() == "table"))
}

/// `<tr>` children of the table, including those under thead/tbody/tfoot.
fn direct_rows<'a>(table: &ElementRef<'a>) -> Vec<ElementRef<'a>> {
    let mut rows = Vec::new();
    for child in table.children().filter_map(ElementRef::wrap) {
        match child.value().name() {
            "tr" => rows.push(child),
            "thead" | "tbody" | "tfoot" => rows.extend(
                child
                    .children()
                    .filter_map(ElementRef::wrap)
                    .filter(|e| e.value().name() == "tr"),
            ),
            _ => {}
        }
    }
    rows
}

fn row_cells(row: &ElementRef<'_>) -> Vec<Cell> {
    let mut cells = Vec::new();
    for el in row.children().filter_map(ElementRef::wrap) {
        let name = el.value().name();
        if name != "td" && name != "th" {
            continue;
        }
        let mut cell = Cell::default();
        collect_segments(el, &mut cell);
        cells.push(cell);

        let span = el
            .value()
            .attr("colspan")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(1)
            .clamp(1, MAX_COLSPAN);
        cells.extend(std::iter::repeat_with(Cell::default).take(span - 1));
    }
    cells
}

fn collect_segments(el: ElementRef<'_>, cell: &mut Cell) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => cell.push_text(&text.text),
            Node::Element(e) => match e.name() {
                "img" => {
                    if let Some(src) = e.attr("src") {
                        cell.segments.push(Segment::Image {
                            src: src.to_string(),
                            alt: e.attr("alt").map(str::to_string),
                        });
                    }
                }
                "br" => cell.push_text("\n"),
                "table" => {}
                _ => {
                    if let Some(inner) = ElementRef::wrap(child) {
                        collect_segments(inner, cell);
                    }
                }
            },
            _ => {}
        }
    }
}

// ── Pipe tables ──────────────────────────────────────────────────────────────

fn parse_pipe_tables(markup: &str) -> Vec<TableGrid> {
    let mut tables = Vec::new();
    let mut rows = Vec::new();
    let mut spans = Vec::new();
    let mut offset = 0;

    for line in markup.split_inclusive('\n') {
        let start = offset;
        offset += line.len();
        let trimmed = line.trim();
        if !trimmed.starts_with('|') {
            flush_pipe_table(&mut tables, &mut rows, &mut spans);
            continue;
        }
        if RE_ALIGNMENT_ROW.is_match(trimmed) {
            continue;
        }
        let lead = line.len() - line.trim_start().len();
        spans.push(start + lead..start + line.trim_end().len());
        rows.push(split_pipe_row(trimmed));
    }
    flush_pipe_table(&mut tables, &mut rows, &mut spans);
    tables
}

fn flush_pipe_table(
    tables: &mut Vec<TableGrid>,
    rows: &mut Vec<Vec<Cell>>,
    spans: &mut Vec<Range<usize>>,
) {
    if !rows.is_empty() {
        tables.push(TableGrid {
            rows: std::mem::take(rows),
            source: Some(TableSource::Pipe(std::mem::take(spans))),
        });
    }
    spans.clear();
}

fn split_pipe_row(line: &str) -> Vec<Cell> {
    let inner = line.strip_prefix('|').unwrap_or(line);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(pipe_cell).collect()
}

fn pipe_cell(raw: &str) -> Cell {
    let mut cell = Cell::default();
    let mut last = 0;
    for caps in RE_INLINE_IMAGE.captures_iter(raw) {
        let Some(whole) = caps.get(0) else { continue };
        cell.push_text(&raw[last..whole.start()]);
        let (src, alt) = match (caps.get(1), caps.get(3)) {
            (Some(src), _) => (src.as_str(), None),
            (None, Some(src)) => (src.as_str(), caps.get(2).map(|a| a.as_str())),
            (None, None) => continue,
        };
        cell.segments.push(Segment::Image {
            src: src.to_string(),
            alt: alt.filter(|a| !a.is_empty()).map(str::to_string),
        });
        last = whole.end();
    }
    cell.push_text(&raw[last..]);
    if let Some(Segment::Text(t)) = cell.segments.first_mut() {
        *t = t.trim_start().to_string();
    }
    if let Some(Segment::Text(t)) = cell.segments.last_mut() {
        *t = t.trim_end().to_string();
    }
    cell.segments
        .retain(|s| !matches!(s, Segment::Text(t) if t.is_empty()));
    cell
}

// ── Rendering ────────────────────────────────────────────────────────────────

/// Render tables as canonical HTML, one `<table>` per line.
pub fn render(parsed: &ParsedMarkup) -> String {
    parsed
        .tables
        .iter()
        .map(render_table)
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_table(table: &TableGrid) -> String {
    let mut out = String::from("<table>");
    for row in &table.rows {
        out.push_str("<tr>");
        for cell in row {
            out.push_str("<td>");
            for seg in &cell.segments {
                match seg {
                    Segment::Text(t) => out.push_str(&escape_text(t)),
                    Segment::Image { src, alt } => {
                        out.push_str("<img src=\"");
                        out.push_str(&escape_attr(src));
                        out.push('"');
                        if let Some(alt) = alt {
                            out.push_str(" alt=\"");
                            out.push_str(&escape_attr(alt));
                            out.push('"');
                        }
                        out.push_str("/>");
                    }
                }
            }
            out.push_str("</td>");
        }
        out.push_str("</tr>");
    }
    out.push_str("</table>");
    out
}

/// One GFM row. Images use Markdown syntax unless the path would break it.
fn render_pipe_row(row: &[Cell]) -> String {
    let cells: Vec<String> = row
        .iter()
        .map(|cell| {
            cell.segments
                .iter()
                .map(|seg| match seg {
                    Segment::Text(t) => t.replace('\n', " "),
                    Segment::Image { src, alt } => {
                        if src.contains(|c: char| c.is_whitespace() || c == ')') {
                            format!("<img src=\"{src}\">")
                        } else {
                            format!("![{}]({src})", alt.as_deref().unwrap_or(""))
                        }
                    }
                })
                .collect()
        })
        .collect();
    format!("| {} |", cells.join(" | "))
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\n', "<br/>")
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
