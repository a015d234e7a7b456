//! Core domain model for the House financial-disclosure mirror.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "fdr-core";

/// One filing row from a yearly bulk index. Field values are kept verbatim
/// from the source XML; `filing_date` in particular preserves the clerk's
/// `MM/DD/YYYY` formatting rather than being reparsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilingRecord {
    pub doc_id: String,
    pub year: i64,
    pub prefix: String,
    pub last_name: String,
    pub first_name: String,
    pub suffix: String,
    pub filing_type: String,
    pub state_district: String,
    pub filing_date: String,
}

impl FilingRecord {
    /// Composite key used for deduplication. The key deliberately includes
    /// the filer name and district: source rows sharing a doc_id, date,
    /// year, and type can still describe different filers.
    pub fn natural_key(&self) -> NaturalKey<'_> {
        NaturalKey {
            doc_id: &self.doc_id,
            filing_date: &self.filing_date,
            year: self.year,
            filing_type: &self.filing_type,
            last_name: &self.last_name,
            first_name: &self.first_name,
            state_district: &self.state_district,
        }
    }

    /// Which remote document family holds this record's PDF. Only original
    /// filings (`O`) live under the financial endpoint; everything else is
    /// served from the periodic-transaction endpoint.
    pub fn document_kind(&self) -> DocumentKind {
        if self.filing_type == "O" {
            DocumentKind::Financial
        } else {
            DocumentKind::Ptr
        }
    }
}

/// Borrowed view of the fields that uniquely identify a filing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NaturalKey<'a> {
    pub doc_id: &'a str,
    pub filing_date: &'a str,
    pub year: i64,
    pub filing_type: &'a str,
    pub last_name: &'a str,
    pub first_name: &'a str,
    pub state_district: &'a str,
}

/// The two families of individually addressable PDFs on the clerk's site,
/// distinguished by URL path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentKind {
    Financial,
    Ptr,
}

impl DocumentKind {
    /// Path segment used by the individual-document endpoint.
    pub fn url_segment(self) -> &'static str {
        match self {
            DocumentKind::Financial => "financial_pdfs",
            DocumentKind::Ptr => "ptr_pdfs",
        }
    }

    /// File-name stem used for local copies.
    pub fn file_stem(self) -> &'static str {
        match self {
            DocumentKind::Financial => "financial_pdf",
            DocumentKind::Ptr => "ptr_pdf",
        }
    }

    /// Short label used in search-result file names.
    pub fn label(self) -> &'static str {
        match self {
            DocumentKind::Financial => "financial",
            DocumentKind::Ptr => "ptr",
        }
    }

    /// Classify a search-result link by its path convention.
    pub fn from_link(link: &str) -> Self {
        if link.contains("ptr-pdfs") {
            DocumentKind::Ptr
        } else {
            DocumentKind::Financial
        }
    }
}

/// Reference row describing one filing-type code. Display-only: pipeline
/// control flow keys on the raw code carried by [`FilingRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilingTypeDescriptor {
    pub code: String,
    pub description: String,
    pub meaning: String,
}

const KNOWN_FILING_TYPES: [(&str, &str, &str); 11] = [
    (
        "A",
        "Annual Report",
        "Regular yearly disclosure of financial information.",
    ),
    (
        "P",
        "Periodic Transaction Report (PTR)",
        "Report of stock trades and asset transactions under the STOCK Act.",
    ),
    (
        "O",
        "Original Filing",
        "First-time filing, often by new members or nominees.",
    ),
    (
        "T",
        "Termination Report",
        "Final report filed when leaving office.",
    ),
    (
        "X",
        "Amendment",
        "Correction or update to a previously filed report.",
    ),
    (
        "C",
        "Candidacy Report",
        "Financial disclosure submitted while running for office.",
    ),
    (
        "E",
        "Extension Request",
        "Request for an extension to file the disclosure.",
    ),
    (
        "D",
        "Delinquent Notice",
        "Filed after missing a required filing deadline.",
    ),
    ("G", "Gift Report", "Report focused on gifts received."),
    (
        "B",
        "Blind Trust Report",
        "Disclosure involving the establishment of a blind trust.",
    ),
    (
        "W",
        "Waiver Request",
        "Request to waive certain reporting requirements.",
    ),
];

impl FilingTypeDescriptor {
    /// The fixed reference set seeded into the metadata store.
    pub fn known() -> Vec<FilingTypeDescriptor> {
        KNOWN_FILING_TYPES
            .iter()
            .map(|(code, description, meaning)| FilingTypeDescriptor {
                code: (*code).to_string(),
                description: (*description).to_string(),
                meaning: (*meaning).to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(filing_type: &str) -> FilingRecord {
        FilingRecord {
            doc_id: "12345".into(),
            year: 2020,
            prefix: "Hon.".into(),
            last_name: "Smith".into(),
            first_name: "Jane".into(),
            suffix: String::new(),
            filing_type: filing_type.into(),
            state_district: "CA01".into(),
            filing_date: "05/01/2020".into(),
        }
    }

    #[test]
    fn natural_key_includes_filer_fields() {
        let a = record("P");
        let mut b = record("P");
        b.last_name = "Jones".into();
        assert_ne!(a.natural_key(), b.natural_key());
        assert_eq!(a.natural_key(), record("P").natural_key());
    }

    #[test]
    fn original_filings_use_the_financial_endpoint() {
        assert_eq!(record("O").document_kind(), DocumentKind::Financial);
        assert_eq!(record("P").document_kind(), DocumentKind::Ptr);
        assert_eq!(record("A").document_kind(), DocumentKind::Ptr);
    }

    #[test]
    fn link_classification_follows_path_convention() {
        assert_eq!(
            DocumentKind::from_link("/public_disc/ptr-pdfs/2024/20012345.pdf"),
            DocumentKind::Ptr
        );
        assert_eq!(
            DocumentKind::from_link("/public_disc/financial-pdfs/2024/10012345.pdf"),
            DocumentKind::Financial
        );
    }

    #[test]
    fn filing_type_reference_set_is_complete() {
        let known = FilingTypeDescriptor::known();
        assert_eq!(known.len(), 11);
        assert!(known.iter().any(|t| t.code == "P"));
        assert!(known.iter().all(|t| t.code.len() == 1));
    }
}
