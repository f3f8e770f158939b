//! Core domain model for the net-table harvester.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "netatlas-core";

/// Placeholder written for fields that are structurally absent for the
/// active variant, as opposed to present-but-blank cells (empty string).
pub const ABSENT_FIELD: &str = "---";

/// One fetchable table: the display name of a program plus the URL of its
/// net-score table page. Supplied by an external enumeration step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    pub url: String,
}

/// Score-type tag of a program. Determines which subject-score columns the
/// row schema carries beyond the base fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScoreType {
    Say,
    Soz,
    Ea,
    Dil,
    /// Two-year (önlisans) programs carry only the base TYT columns.
    Tyt,
}

impl ScoreType {
    pub const ALL: [ScoreType; 5] = [
        ScoreType::Say,
        ScoreType::Soz,
        ScoreType::Ea,
        ScoreType::Dil,
        ScoreType::Tyt,
    ];

    /// Label as it appears in page titles, e.g. `(SAY)`.
    pub fn label(&self) -> &'static str {
        match self {
            ScoreType::Say => "SAY",
            ScoreType::Soz => "SÖZ",
            ScoreType::Ea => "EA",
            ScoreType::Dil => "DİL",
            ScoreType::Tyt => "TYT",
        }
    }

    /// ASCII stem used for output file names (`say.csv`, `soz.parquet`, ...).
    pub fn file_stem(&self) -> &'static str {
        match self {
            ScoreType::Say => "say",
            ScoreType::Soz => "soz",
            ScoreType::Ea => "ea",
            ScoreType::Dil => "dil",
            ScoreType::Tyt => "tyt",
        }
    }

    pub fn from_label(label: &str) -> Option<ScoreType> {
        ScoreType::ALL.into_iter().find(|t| t.label() == label)
    }
}

/// One logical output field of a variant schema.
///
/// `header_key` is matched against the source table's header cells;
/// `column_title` is the header written to the output files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub header_key: String,
    pub column_title: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl FieldSpec {
    pub fn required(name: &str, header_key: &str, column_title: &str) -> Self {
        Self {
            name: name.to_string(),
            header_key: header_key.to_string(),
            column_title: column_title.to_string(),
            required: true,
        }
    }

    pub fn optional(name: &str, header_key: &str, column_title: &str) -> Self {
        Self {
            name: name.to_string(),
            header_key: header_key.to_string(),
            column_title: column_title.to_string(),
            required: false,
        }
    }
}

/// Declared output schema for one score type: base fields common to every
/// variant followed by the variant-specific subject-score tail, in output
/// column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSchema {
    pub score_type: ScoreType,
    pub fields: Vec<FieldSpec>,
}

impl VariantSchema {
    pub fn required_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Required/optional field sets per variant. The reference sources disagree
/// on which columns are mandatory, so this is configuration data with
/// compiled-in defaults rather than a hard-coded constant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantConfig {
    pub variants: Vec<VariantSchema>,
}

impl VariantConfig {
    pub fn schema(&self, score_type: ScoreType) -> Option<&VariantSchema> {
        self.variants.iter().find(|v| v.score_type == score_type)
    }
}

impl Default for VariantConfig {
    fn default() -> Self {
        let base = || {
            vec![
                FieldSpec::required("university", "Üniversite", "Üniversite"),
                FieldSpec::required("year", "Yılı", "Yılı"),
                FieldSpec::required("kind", "Türü", "Türü"),
                FieldSpec::required("coefficient", "Katsayı", "Katsayı"),
                FieldSpec::required(
                    "obp",
                    "Yerleşen Son Kişinin OBP",
                    "Yerleşen Son Kişinin OBP",
                ),
                FieldSpec::optional(
                    "placed_score",
                    "Yerleşen Son Kişi Yerleştiği Puan",
                    "Yerleşen Son Kişi Yerleştiği Puan",
                ),
                FieldSpec::required("placed_count", "Yerleşen", "Yerleşen"),
                FieldSpec::required("tyt_turkish", "TYT Türkçe", "TYT Türkçe(40)"),
                FieldSpec::required("tyt_social", "TYT Sosyal", "TYT Sosyal(20)"),
                FieldSpec::required("tyt_math", "TYT Mat", "TYT Mat(40)"),
                FieldSpec::required("tyt_science", "TYT Fen", "TYT Fen(20)"),
            ]
        };

        let with_tail = |score_type: ScoreType, tail: Vec<FieldSpec>| {
            let mut fields = base();
            fields.extend(tail);
            VariantSchema { score_type, fields }
        };

        VariantConfig {
            variants: vec![
                with_tail(
                    ScoreType::Say,
                    vec![
                        FieldSpec::required("ayt_math", "AYT Mat", "AYT Mat(40)"),
                        FieldSpec::required("ayt_physics", "AYT Fizik", "AYT Fizik(14)"),
                        FieldSpec::required("ayt_chemistry", "AYT Kimya", "AYT Kimya(13)"),
                        FieldSpec::required("ayt_biology", "AYT Biyoloji", "AYT Biyoloji(13)"),
                    ],
                ),
                with_tail(
                    ScoreType::Ea,
                    vec![
                        FieldSpec::required("ayt_math", "AYT Mat", "AYT Mat(40)"),
                        FieldSpec::required("ayt_turkish", "AYT Türk Dili", "AYT Türk Dili(24)"),
                        FieldSpec::required("ayt_history1", "AYT Tarih1", "AYT Tarih1(10)"),
                        FieldSpec::required("ayt_geography1", "AYT Coğrafya1", "AYT Coğrafya1(6)"),
                    ],
                ),
                with_tail(
                    ScoreType::Soz,
                    vec![
                        FieldSpec::required("ayt_literature", "AYT TDE", "AYT TDE(24)"),
                        FieldSpec::required("ayt_history1", "AYT Tar1", "AYT Tar1(10)"),
                        FieldSpec::required("ayt_geography1", "AYT Coğ1", "AYT Coğ1(6)"),
                        FieldSpec::required("ayt_history2", "AYT Tar2", "AYT Tar2(11)"),
                        FieldSpec::required("ayt_geography2", "AYT Coğ2", "AYT Coğ2(11)"),
                        FieldSpec::required("ayt_philosophy", "AYT Fel", "AYT Fel(12)"),
                        FieldSpec::required("ayt_religion", "AYT Din", "AYT Din(6)"),
                    ],
                ),
                with_tail(
                    ScoreType::Dil,
                    vec![FieldSpec::required("ydt_language", "YDT Dil", "YDT Dil(80)")],
                ),
                with_tail(ScoreType::Tyt, Vec::new()),
            ],
        }
    }
}

/// Mapping from logical field name to a zero-based column index within one
/// table instance. Derived fresh per table; header layout may change between
/// programs and even between years of the same program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    bindings: BTreeMap<String, usize>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, field: impl Into<String>, index: usize) {
        self.bindings.insert(field.into(), index);
    }

    pub fn index_of(&self, field: &str) -> Option<usize> {
        self.bindings.get(field).copied()
    }

    /// Highest column index any field resolves to. Rows shorter than this
    /// cannot be extracted.
    pub fn max_index(&self) -> Option<usize> {
        self.bindings.values().copied().max()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.bindings.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// One normalized output row.
///
/// `identity` is derived from a stable natural key (program name plus a
/// row-level discriminator plus year), never a storage-assigned sequence
/// number, so it survives process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub identity: String,
    pub program: String,
    pub score_type: ScoreType,
    pub fields: BTreeMap<String, String>,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Natural-key identity for a row: program name, a row discriminator (the
/// university code when the source row links one, the university name
/// otherwise), and the admission year.
pub fn record_identity(program: &str, discriminator: &str, year: &str) -> String {
    format!("{program}|{discriminator}|{year}")
}
