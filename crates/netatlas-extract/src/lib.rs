//! Header resolution and row extraction for net-score tables.

use std::collections::BTreeMap;

use netatlas_core::{record_identity, FieldMap, Record, ScoreType, VariantSchema, ABSENT_FIELD};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

pub const CRATE_NAME: &str = "netatlas-extract";

static TABLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("table#mydata").expect("static selector"));
static THEAD_ROW_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("thead tr").expect("static selector"));
static TBODY_ROW_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("tbody tr").expect("static selector"));
static ROW_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").expect("static selector"));
static TH_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("th").expect("static selector"));
static TD_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("td").expect("static selector"));
static LINK_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("static selector"));
static TITLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("title").expect("static selector"));

static SCORE_TYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((SAY|SÖZ|EA|DİL)\)").expect("static regex"));
static UNIVERSITY_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"y=(\d+)").expect("static regex"));

/// One data row of a parsed table: raw cell texts plus the university code
/// recovered from the row's first `?y=<digits>` link, when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub cells: Vec<String>,
    pub university_code: Option<String>,
}

/// Header and data section of one `table#mydata` instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetTable {
    pub header: Vec<String>,
    pub rows: Vec<TableRow>,
}

/// Cheap marker check used by the fetcher's acceptance callback: a served
/// page without the data table is treated as a transient failure.
pub fn page_has_table(html: &str) -> bool {
    let document = Html::parse_document(html);
    document.select(&TABLE_SELECTOR).next().is_some()
}

/// Score type from the page `<title>`, e.g. `Tıp (SAY) Netler`.
pub fn detect_score_type(html: &str) -> Option<ScoreType> {
    let document = Html::parse_document(html);
    let title = document.select(&TITLE_SELECTOR).next()?;
    let text: String = title.text().collect();
    let captures = SCORE_TYPE_RE.captures(&text)?;
    ScoreType::from_label(captures.get(1)?.as_str())
}

/// Locate `table#mydata` and split it into header cells and data rows.
/// Returns `None` when the table or its header row is absent.
pub fn parse_net_table(html: &str) -> Option<NetTable> {
    let document = Html::parse_document(html);
    let table = document.select(&TABLE_SELECTOR).next()?;

    // Some older tables have no thead; then the first two rows are header
    // decoration and everything after is data.
    let (header_row, body_rows): (ElementRef, Vec<ElementRef>) =
        match table.select(&THEAD_ROW_SELECTOR).next() {
            Some(head) => (head, table.select(&TBODY_ROW_SELECTOR).collect()),
            None => {
                let all: Vec<ElementRef> = table.select(&ROW_SELECTOR).collect();
                let head = *all.first()?;
                (head, all.into_iter().skip(2).collect())
            }
        };

    let header: Vec<String> = header_row
        .select(&TH_SELECTOR)
        .map(|th| th.text().collect::<String>())
        .collect();
    if header.is_empty() {
        return None;
    }

    let rows = body_rows
        .into_iter()
        .filter_map(|tr| {
            let cells: Vec<String> = tr
                .select(&TD_SELECTOR)
                .map(|td| td.text().collect::<String>())
                .collect();
            if cells.is_empty() {
                return None;
            }
            let university_code = tr
                .select(&LINK_SELECTOR)
                .filter_map(|a| a.value().attr("href"))
                .find_map(|href| {
                    UNIVERSITY_CODE_RE
                        .captures(href)
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str().to_string())
                });
            Some(TableRow {
                cells,
                university_code,
            })
        })
        .collect();

    Some(NetTable { header, rows })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// Required header keys with no matching cell. The table instance must
    /// be skipped rather than emitting partially-populated rows.
    #[error("unresolved header keys: {}", missing.join(", "))]
    Unresolved { missing: Vec<String> },
    /// Two required fields resolved to the same column; the header layout
    /// is ambiguous and the table instance is rejected.
    #[error("fields {first} and {second} both resolve to column {index}")]
    Ambiguous {
        first: String,
        second: String,
        index: usize,
    },
}

/// Normalize header labels for binding: whitespace collapsed, blank cells
/// replaced with `EmptyColumn_<index>`, repeated labels disambiguated with
/// a numeric suffix on the second and later occurrences.
pub fn normalize_header_labels(header_cells: &[String]) -> Vec<String> {
    let mut labels = Vec::with_capacity(header_cells.len());
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    for (index, raw) in header_cells.iter().enumerate() {
        let mut label = normalize_cell(raw);
        if label.is_empty() {
            label = format!("EmptyColumn_{index}");
        }
        let occurrences = seen.entry(label.clone()).or_insert(0);
        if *occurrences > 0 {
            label = format!("{label}_{occurrences}");
        }
        *occurrences += 1;
        labels.push(label);
    }
    labels
}

/// Map each schema field to a column index. A field binds to the first cell
/// whose label equals its header key exactly, falling back to the first cell
/// containing the key as a substring (case-sensitive). Fails closed: missing
/// required keys or ambiguous bindings reject the whole table instance.
pub fn resolve_header(
    header_cells: &[String],
    schema: &VariantSchema,
) -> Result<FieldMap, ResolveError> {
    let labels = normalize_header_labels(header_cells);

    let mut map = FieldMap::new();
    let mut missing = Vec::new();
    let mut bound: BTreeMap<usize, String> = BTreeMap::new();

    for field in &schema.fields {
        let exact = labels.iter().position(|label| *label == field.header_key);
        let index = exact.or_else(|| {
            labels
                .iter()
                .position(|label| label.contains(&field.header_key))
        });

        match index {
            Some(index) => {
                if let Some(previous) = bound.get(&index) {
                    return Err(ResolveError::Ambiguous {
                        first: previous.clone(),
                        second: field.name.clone(),
                        index,
                    });
                }
                bound.insert(index, field.name.clone());
                map.bind(field.name.clone(), index);
            }
            None if field.required => missing.push(field.header_key.clone()),
            None => {}
        }
    }

    if !missing.is_empty() {
        return Err(ResolveError::Unresolved { missing });
    }
    Ok(map)
}

/// Collapse internal whitespace (including embedded newlines and NBSP) to
/// single spaces and strip the ends.
pub fn normalize_cell(raw: &str) -> String {
    raw.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lazy record stream over the data rows of one resolved table. Finite and
/// not restartable; rows shorter than the highest referenced column are
/// skipped, which is normal for decorative or summary rows.
pub struct RowExtractor<'a> {
    rows: std::slice::Iter<'a, TableRow>,
    field_map: &'a FieldMap,
    schema: &'a VariantSchema,
    program: &'a str,
}

impl<'a> RowExtractor<'a> {
    pub fn new(
        rows: &'a [TableRow],
        field_map: &'a FieldMap,
        schema: &'a VariantSchema,
        program: &'a str,
    ) -> Self {
        Self {
            rows: rows.iter(),
            field_map,
            schema,
            program,
        }
    }

    fn extract(&self, row: &TableRow) -> Option<Record> {
        let max_index = self.field_map.max_index()?;
        if row.cells.len() <= max_index {
            return None;
        }

        let mut fields = BTreeMap::new();
        for spec in &self.schema.fields {
            let value = match self.field_map.index_of(&spec.name) {
                Some(index) => normalize_cell(&row.cells[index]),
                None => ABSENT_FIELD.to_string(),
            };
            fields.insert(spec.name.clone(), value);
        }

        let year = fields.get("year").cloned().unwrap_or_default();
        let discriminator = row
            .university_code
            .clone()
            .filter(|code| !code.is_empty())
            .or_else(|| fields.get("university").cloned())
            .unwrap_or_default();

        Some(Record {
            identity: record_identity(self.program, &discriminator, &year),
            program: self.program.to_string(),
            score_type: self.schema.score_type,
            fields,
        })
    }
}

impl Iterator for RowExtractor<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        loop {
            let row = self.rows.next()?;
            if let Some(record) = self.extract(row) {
                return Some(record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netatlas_core::VariantConfig;

    fn base_header() -> Vec<String> {
        [
            "",
            "Üniversite",
            "Yılı",
            "Türü",
            "Katsayı",
            "Yerleşen Son Kişinin OBP",
            "Yerleşen",
            "TYT Türkçe(40)",
            "TYT Sosyal(20)",
            "TYT Mat(40)",
            "TYT Fen(20)",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    fn tyt_schema(config: &VariantConfig) -> &VariantSchema {
        config.schema(ScoreType::Tyt).unwrap()
    }

    #[test]
    fn resolves_base_header_with_exact_match_priority() {
        let config = VariantConfig::default();
        let map = resolve_header(&base_header(), tyt_schema(&config)).unwrap();

        // "Yerleşen" must bind to the exact cell, not to the OBP column that
        // also contains it as a substring.
        assert_eq!(map.index_of("obp"), Some(5));
        assert_eq!(map.index_of("placed_count"), Some(6));
        assert_eq!(map.index_of("university"), Some(1));
        assert_eq!(map.index_of("tyt_science"), Some(10));
        // Optional field absent from this table.
        assert_eq!(map.index_of("placed_score"), None);
    }

    #[test]
    fn missing_required_key_fails_closed() {
        let config = VariantConfig::default();
        let mut header = base_header();
        header.retain(|h| !h.contains("TYT Türkçe"));

        let err = resolve_header(&header, tyt_schema(&config)).unwrap_err();
        match err {
            ResolveError::Unresolved { missing } => {
                assert_eq!(missing, vec!["TYT Türkçe".to_string()]);
            }
            other => panic!("expected Unresolved, got {other:?}"),
        }
    }

    #[test]
    fn blank_and_duplicate_headers_get_placeholders() {
        let cells: Vec<String> = ["", "Puan", " \n ", "Puan", "Puan"]
            .into_iter()
            .map(String::from)
            .collect();
        let labels = normalize_header_labels(&cells);
        assert_eq!(
            labels,
            vec!["EmptyColumn_0", "Puan", "EmptyColumn_2", "Puan_1", "Puan_2"]
        );
    }

    #[test]
    fn short_rows_are_skipped_not_fatal() {
        let config = VariantConfig::default();
        let schema = tyt_schema(&config);
        let map = resolve_header(&base_header(), schema).unwrap();

        let rows = vec![
            TableRow {
                cells: vec!["Toplam".to_string(); 3],
                university_code: None,
            },
            TableRow {
                cells: [
                    "", "Örnek Üniversitesi", "2024", "Örgün", "0.12", "350.5", "42", "35", "18",
                    "33", "19",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
                university_code: Some("104810377".to_string()),
            },
        ];

        let records: Vec<Record> = RowExtractor::new(&rows, &map, schema, "Hemşirelik").collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].identity, "Hemşirelik|104810377|2024");
        assert_eq!(records[0].field("university"), Some("Örnek Üniversitesi"));
        assert_eq!(records[0].field("placed_score"), Some(ABSENT_FIELD));
    }

    #[test]
    fn whitespace_in_cells_is_normalized() {
        assert_eq!(normalize_cell("  Ankara\n Üniversitesi\u{a0} "), "Ankara Üniversitesi");
        assert_eq!(normalize_cell("\n \t"), "");
    }

    #[test]
    fn detects_score_type_from_title() {
        let html = "<html><head><title>Tıp (SAY) - Netler</title></head><body></body></html>";
        assert_eq!(detect_score_type(html), Some(ScoreType::Say));

        let html = "<html><head><title>Önlisans Netler</title></head><body></body></html>";
        assert_eq!(detect_score_type(html), None);
    }

    #[test]
    fn parses_table_and_recovers_university_code() {
        let html = r#"
            <html><body><table id="mydata">
              <thead><tr><th></th><th>Üniversite</th><th>Yılı</th></tr></thead>
              <tbody>
                <tr>
                  <td></td>
                  <td><a href="lisans.php?y=103390230">Örnek Üniversitesi</a></td>
                  <td>2024</td>
                </tr>
              </tbody>
            </table></body></html>"#;

        assert!(page_has_table(html));
        let table = parse_net_table(html).unwrap();
        assert_eq!(table.header.len(), 3);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].university_code.as_deref(), Some("103390230"));
        assert_eq!(normalize_cell(&table.rows[0].cells[1]), "Örnek Üniversitesi");
    }

    #[test]
    fn table_without_tbody_skips_two_decoration_rows() {
        let html = r#"
            <html><body><table id="mydata">
              <tr><th>Üniversite</th><th>Yılı</th></tr>
              <tr><th>alt başlık</th><th></th></tr>
              <tr><td>Örnek Üniversitesi</td><td>2023</td></tr>
            </table></body></html>"#;

        let table = parse_net_table(html).unwrap();
        assert_eq!(table.rows.len(), 1);
        assert_eq!(normalize_cell(&table.rows[0].cells[1]), "2023");
    }
}
