//! Table stitching: merge per-page table fragments into one logical table.
//!
//! ## Rules
//!
//! 1. Fragments are ordered by page index; a page delivered twice is corrupt.
//! 2. Each table on a page is read into rows of cells (see [`markup`]).
//! 3. The first non-empty row of the first table is the header. The first
//!    non-empty row of every later table is dropped when it normalises to the
//!    same cells as that header (a header repeated on a continuation page).
//! 4. Rows whose cells are all empty are separators and are dropped.
//! 5. Data rows are right-padded to the widest data row. The header keeps its
//!    non-empty cells even when it is wider than the data.
//!
//! Output order is strictly (page index, in-page row order), so stitching the
//! same fragments twice yields byte-identical serialised output.

use crate::error::StitchError;
use crate::pipeline::extract::PageFragment;
use crate::pipeline::markup::{self, Cell};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Placeholder used when comparing image-only header cells.
const IMAGE_KEY: &str = "\u{fffc}";

/// One cell of the stitched table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellValue {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl CellValue {
    pub fn text(s: impl Into<String>) -> Self {
        Self {
            text: s.into(),
            images: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.images.is_empty()
    }

    fn from_cell(cell: &Cell) -> Self {
        Self {
            text: cell.plain_text(),
            images: cell.image_sources().map(str::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    Header,
    Data,
}

/// A retained row with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StitchedRow {
    pub kind: RowKind,
    pub cells: Vec<CellValue>,
    /// 0-based page index the row came from.
    pub page_index: usize,
    /// 0-based row position within that page, across all its tables.
    pub source_row: usize,
}

/// The single logical table built from all pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StitchedTable {
    pub width: usize,
    pub rows: Vec<StitchedRow>,
}

impl StitchedTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn header(&self) -> Option<&StitchedRow> {
        self.rows.iter().find(|r| r.kind == RowKind::Header)
    }

    /// Header texts, or an empty list when the table has no header.
    pub fn columns(&self) -> Vec<String> {
        self.header()
            .map(|h| h.cells.iter().map(|c| c.text.clone()).collect())
            .unwrap_or_default()
    }

    pub fn data_rows(&self) -> impl Iterator<Item = &StitchedRow> {
        self.rows.iter().filter(|r| r.kind == RowKind::Data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StitchOptions {
    /// Treat the first non-empty row as the header.
    pub first_row_is_header: bool,
}

impl Default for StitchOptions {
    fn default() -> Self {
        Self {
            first_row_is_header: true,
        }
    }
}

/// Counters describing what the stitcher removed or changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StitchStats {
    pub fragments: usize,
    pub tables: usize,
    pub headers_dropped: usize,
    pub separators_dropped: usize,
    pub rows_padded: usize,
}

/// Stitch page fragments into one table.
pub fn stitch(
    fragments: &[PageFragment],
    options: &StitchOptions,
) -> Result<(StitchedTable, StitchStats), StitchError> {
    let mut ordered: Vec<&PageFragment> = fragments.iter().collect();
    ordered.sort_by_key(|f| f.page_index);
    if let Some(dup) = ordered.windows(2).find(|w| w[0].page_index == w[1].page_index) {
        return Err(StitchError::DuplicatePage {
            page: dup[0].page_index + 1,
        });
    }

    let mut stats = StitchStats {
        fragments: ordered.len(),
        ..Default::default()
    };
    let mut header: Option<StitchedRow> = None;
    let mut header_key: Option<Vec<String>> = None;
    let mut data: Vec<StitchedRow> = Vec::new();

    for fragment in ordered {
        let parsed = markup::parse(&fragment.markup).map_err(|e| StitchError::Corrupt {
            page: fragment.page_index + 1,
            detail: e.to_string(),
        })?;

        let mut source_row = 0usize;
        for table in &parsed.tables {
            stats.tables += 1;
            let mut first_non_empty = true;

            for row in &table.rows {
                let cells: Vec<CellValue> = row.iter().map(CellValue::from_cell).collect();
                let position = source_row;
                source_row += 1;

                if cells.iter().all(CellValue::is_empty) {
                    stats.separators_dropped += 1;
                    continue;
                }
                let candidate = std::mem::take(&mut first_non_empty);

                if candidate && options.first_row_is_header {
                    let key = normalized_key(&cells);
                    if header_key.is_none() {
                        header_key = Some(key);
                        header = Some(StitchedRow {
                            kind: RowKind::Header,
                            cells,
                            page_index: fragment.page_index,
                            source_row: position,
                        });
                        continue;
                    }
                    if header_key.as_ref() == Some(&key) {
                        debug!(
                            "Page {}: dropping repeated header at row {}",
                            fragment.page_index + 1,
                            position
                        );
                        stats.headers_dropped += 1;
                        continue;
                    }
                }

                data.push(StitchedRow {
                    kind: RowKind::Data,
                    cells,
                    page_index: fragment.page_index,
                    source_row: position,
                });
            }
        }
    }

    let data_width = data.iter().map(|r| r.cells.len()).max().unwrap_or(0);
    let header_width = header
        .as_ref()
        .map(|h| h.cells.iter().rposition(|c| !c.is_empty()).map_or(0, |i| i + 1))
        .unwrap_or(0);
    let width = data_width.max(header_width);

    for row in &mut data {
        if row.cells.len() < width {
            row.cells.resize_with(width, CellValue::default);
            stats.rows_padded += 1;
        }
    }
    if let Some(h) = header.as_mut() {
        h.cells.resize_with(width, CellValue::default);
    }

    let mut rows = Vec::with_capacity(data.len() + 1);
    rows.extend(header);
    rows.extend(data);

    info!(
        "Stitched {} fragment(s) into {} row(s) × {} column(s) \
         ({} header(s), {} separator(s) dropped, {} row(s) padded)",
        stats.fragments,
        rows.len(),
        width,
        stats.headers_dropped,
        stats.separators_dropped,
        stats.rows_padded
    );

    Ok((StitchedTable { width, rows }, stats))
}

/// Comparison key for header equality: lower-case, whitespace collapsed,
/// trailing empty cells ignored.
fn normalized_key(cells: &[CellValue]) -> Vec<String> {
    let mut key: Vec<String> = cells
        .iter()
        .map(|c| {
            let text = c
                .text
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase();
            if text.is_empty() && !c.images.is_empty() {
                IMAGE_KEY.to_string()
            } else {
                text
            }
        })
        .collect();
    while key.last().is_some_and(|k| k.is_empty()) {
        key.pop();
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html(rows: &[&[&str]]) -> String {
        let mut s = String::from("<table>");
        for row in rows {
            s.push_str("<tr>");
            for cell in *row {
                s.push_str("<td>");
                s.push_str(cell);
                s.push_str("</td>");
            }
            s.push_str("</tr>");
        }
        s.push_str("</table>");
        s
    }

    fn page(index: usize, rows: &[&[&str]]) -> PageFragment {
        PageFragment::new(index, html(rows))
    }

    fn texts(row: &StitchedRow) -> Vec<&str> {
        row.cells.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn repeated_header_is_dropped() {
        let fragments = vec![
            page(0, &[&["H", "H"], &["a", "1"]]),
            page(1, &[&["H", "H"], &["b", "2"]]),
        ];
        let (table, stats) = stitch(&fragments, &StitchOptions::default()).unwrap();

        let headers = table.rows.iter().filter(|r| r.kind == RowKind::Header).count();
        assert_eq!(headers, 1);
        assert_eq!(stats.headers_dropped, 1);
        assert_eq!(table.rows.len(), 3);
        assert_eq!(texts(&table.rows[2]), vec!["b", "2"]);
    }

    #[test]
    fn header_match_ignores_case_whitespace_and_trailing_empties() {
        let fragments = vec![
            page(0, &[&["Item", "Unit  Rate"], &["chair", "10"]]),
            page(1, &[&["ITEM", " unit rate ", ""], &["desk", "20"]]),
        ];
        let (table, stats) = stitch(&fragments, &StitchOptions::default()).unwrap();
        assert_eq!(stats.headers_dropped, 1);
        assert_eq!(table.data_rows().count(), 2);
    }

    #[test]
    fn empty_rows_contribute_nothing() {
        let fragments = vec![page(0, &[&["H1", "H2", "H3"], &["", "", ""], &["a", "b", "c"]])];
        let (table, stats) = stitch(&fragments, &StitchOptions::default()).unwrap();
        assert_eq!(table.rows.len(), 2);
        assert_eq!(stats.separators_dropped, 1);
        assert_eq!(table.rows[1].source_row, 2);
    }

    #[test]
    fn image_only_cell_is_not_empty() {
        let fragments = vec![PageFragment::new(
            0,
            r#"<table><tr><td>Photo</td></tr><tr><td><img src="imgs/a.jpg"></td></tr></table>"#,
        )];
        let (table, stats) = stitch(&fragments, &StitchOptions::default()).unwrap();
        assert_eq!(stats.separators_dropped, 0);
        assert_eq!(table.rows[1].cells[0].images, vec!["imgs/a.jpg".to_string()]);
    }

    #[test]
    fn short_rows_are_padded_to_data_width() {
        let fragments = vec![page(0, &[&["A", "B", "C"], &["1", "2", "3"], &["4"]])];
        let (table, stats) = stitch(&fragments, &StitchOptions::default()).unwrap();
        assert_eq!(table.width, 3);
        assert!(table.rows.iter().all(|r| r.cells.len() == 3));
        assert_eq!(stats.rows_padded, 1);
    }

    #[test]
    fn header_is_never_truncated() {
        let fragments = vec![page(0, &[&["A", "B", "Remarks"], &["1", "2"]])];
        let (table, _) = stitch(&fragments, &StitchOptions::default()).unwrap();
        assert_eq!(table.width, 3);
        assert_eq!(table.columns(), vec!["A", "B", "Remarks"]);
        assert_eq!(table.rows[1].cells.len(), 3);
    }

    #[test]
    fn trailing_empty_header_cells_are_trimmed_to_data_width() {
        let fragments = vec![page(0, &[&["A", "B", "", ""], &["1", "2"]])];
        let (table, _) = stitch(&fragments, &StitchOptions::default()).unwrap();
        assert_eq!(table.width, 2);
        assert_eq!(table.columns(), vec!["A", "B"]);
    }

    #[test]
    fn rows_follow_page_order_regardless_of_input_order() {
        let fragments = vec![
            page(2, &[&["H"], &["c"]]),
            page(0, &[&["H"], &["a"]]),
            page(1, &[&["H"], &["b"]]),
        ];
        let (table, _) = stitch(&fragments, &StitchOptions::default()).unwrap();
        let pages: Vec<usize> = table.rows.iter().map(|r| r.page_index).collect();
        assert!(pages.windows(2).all(|w| w[0] <= w[1]));
        let data: Vec<&str> = table.data_rows().map(|r| r.cells[0].text.as_str()).collect();
        assert_eq!(data, vec!["a", "b", "c"]);
    }

    #[test]
    fn stitching_is_idempotent() {
        let fragments = vec![
            page(0, &[&["Item", "Qty"], &["chair", "2"]]),
            page(1, &[&["Item", "Qty"], &["desk", "1"], &["", ""]]),
        ];
        let (a, _) = stitch(&fragments, &StitchOptions::default()).unwrap();
        let (b, _) = stitch(&fragments, &StitchOptions::default()).unwrap();
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn zero_fragments_yield_empty_table() {
        let (table, stats) = stitch(&[], &StitchOptions::default()).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.width, 0);
        assert_eq!(stats, StitchStats::default());
    }

    #[test]
    fn page_without_tables_contributes_nothing() {
        let fragments = vec![
            PageFragment::new(0, "# Cover page\n\nNo tables here."),
            page(1, &[&["H"], &["x"]]),
        ];
        let (table, stats) = stitch(&fragments, &StitchOptions::default()).unwrap();
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].page_index, 1);
        assert_eq!(stats.tables, 1);
    }

    #[test]
    fn duplicate_page_is_corruption() {
        let fragments = vec![page(0, &[&["a"]]), page(0, &[&["b"]])];
        let err = stitch(&fragments, &StitchOptions::default()).unwrap_err();
        assert_eq!(err, StitchError::DuplicatePage { page: 1 });
    }

    #[test]
    fn truncated_markup_is_corruption() {
        let fragments = vec![
            page(0, &[&["H"], &["a"]]),
            PageFragment::new(1, "<table><tr><td>cut off"),
        ];
        let err = stitch(&fragments, &StitchOptions::default()).unwrap_err();
        assert!(matches!(err, StitchError::Corrupt { page: 2, .. }));
    }

    #[test]
    fn without_header_detection_every_row_is_data() {
        let fragments = vec![page(0, &[&["a", "1"]]), page(1, &[&["a", "1"]])];
        let options = StitchOptions {
            first_row_is_header: false,
        };
        let (table, stats) = stitch(&fragments, &options).unwrap();
        assert!(table.header().is_none());
        assert_eq!(table.data_rows().count(), 2);
        assert_eq!(stats.headers_dropped, 0);
    }

    #[test]
    fn second_table_on_same_page_drops_its_repeated_header() {
        let markup = format!(
            "{}\n{}",
            html(&[&["Item", "Rate"], &["a", "1"]]),
            html(&[&["Item", "Rate"], &["b", "2"]])
        );
        let (table, stats) =
            stitch(&[PageFragment::new(0, markup)], &StitchOptions::default()).unwrap();
        assert_eq!(stats.tables, 2);
        assert_eq!(stats.headers_dropped, 1);
        let positions: Vec<usize> = table.rows.iter().map(|r| r.source_row).collect();
        assert_eq!(positions, vec![0, 1, 3]);
    }
}
