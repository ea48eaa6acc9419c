//! Core domain model and provenance types for dermsync.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dermsync-core";

/// Text shown wherever a field could not be read from the source document.
pub const UNAVAILABLE: &str = "Not available";

/// Registry a trial record was ingested from. Status vocabularies are per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceFamily {
    #[serde(rename = "clinicaltrials-gov")]
    ClinicalTrialsGov,
    #[serde(rename = "ctis")]
    Ctis,
}

impl SourceFamily {
    pub const ALL: [SourceFamily; 2] = [SourceFamily::ClinicalTrialsGov, SourceFamily::Ctis];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFamily::ClinicalTrialsGov => "clinicaltrials-gov",
            SourceFamily::Ctis => "ctis",
        }
    }
}

impl fmt::Display for SourceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clinicaltrials-gov" | "ctgov" | "nct" => Ok(SourceFamily::ClinicalTrialsGov),
            "ctis" | "eudract" => Ok(SourceFamily::Ctis),
            other => Err(format!("unknown source family: {other}")),
        }
    }
}

/// Shape of a trial identifier, derived from its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentifierKind {
    EudraCt,
    Nct,
    Other,
}

/// Trial primary key. Immutable once a record exists; the only join key
/// between incoming drafts and stored records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialId(String);

impl TrialId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> IdentifierKind {
        let bytes = self.0.as_bytes();
        let upper = self.0.to_ascii_uppercase();
        if upper.starts_with("NCT") && bytes.len() > 3 && bytes[3..].iter().all(u8::is_ascii_digit) {
            return IdentifierKind::Nct;
        }
        let groups = self.0.split('-').collect::<Vec<_>>();
        let lens = groups.iter().map(|g| g.len()).collect::<Vec<_>>();
        let digits = groups.iter().all(|g| !g.is_empty() && g.bytes().all(|b| b.is_ascii_digit()));
        if digits && (lens == [4, 6, 2] || lens == [4, 6, 2, 2]) {
            IdentifierKind::EudraCt
        } else {
            IdentifierKind::Other
        }
    }
}

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A normalized value that is either present or explicitly unavailable.
///
/// Serialized as the bare value, or `null` when unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Field<T> {
    Available(T),
    #[default]
    Unavailable,
}

impl<T> Field<T> {
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Field::Available(v),
            None => Field::Unavailable,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Field::Available(v) => Some(v),
            Field::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Field::Available(_))
    }
}

impl Field<String> {
    /// Trimmed text; blank text counts as unavailable.
    pub fn text(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if !v.is_empty() => Field::Available(v.to_string()),
            _ => Field::Unavailable,
        }
    }

    pub fn as_deref(&self) -> Option<&str> {
        self.value().map(String::as_str)
    }
}

impl Field<Vec<String>> {
    /// Keeps source order and duplicates; drops blank entries.
    pub fn list<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let items = values
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if items.is_empty() {
            Field::Unavailable
        } else {
            Field::Available(items)
        }
    }
}

impl fmt::Display for Field<String> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Available(v) => f.write_str(v),
            Field::Unavailable => f.write_str(UNAVAILABLE),
        }
    }
}

impl fmt::Display for Field<Vec<String>> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Available(v) => f.write_str(&v.join("; ")),
            Field::Unavailable => f.write_str(UNAVAILABLE),
        }
    }
}

/// Where a record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub raw_artifact_id: Uuid,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    pub extractor_version: String,
}

/// Adapter handoff shape. Identical to [`TrialRecord`] except that the
/// identifier may be missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialDraft {
    pub identifier: Option<TrialId>,
    pub source: SourceFamily,
    pub title: Field<String>,
    pub overall_status: Field<String>,
    pub age_group: Field<Vec<String>>,
    pub conditions: Field<Vec<String>>,
    pub products: Field<Vec<String>>,
    pub phase: Field<String>,
    pub sponsor: Field<String>,
    pub primary_endpoint: Field<String>,
    pub linked_eudract: Field<TrialId>,
    pub provenance: Provenance,
}

/// Canonical persisted trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub identifier: TrialId,
    pub source: SourceFamily,
    pub title: Field<String>,
    pub overall_status: Field<String>,
    pub age_group: Field<Vec<String>>,
    pub conditions: Field<Vec<String>>,
    pub products: Field<Vec<String>>,
    pub phase: Field<String>,
    pub sponsor: Field<String>,
    pub primary_endpoint: Field<String>,
    pub linked_eudract: Field<TrialId>,
    pub provenance: Provenance,
}

/// A draft that carried no recognisable identifier. Reported, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlinkedTrial {
    pub source: SourceFamily,
    pub title: Field<String>,
    pub source_url: String,
}

impl TrialDraft {
    pub fn into_record(self) -> Result<TrialRecord, UnlinkedTrial> {
        let Some(identifier) = self.identifier else {
            return Err(UnlinkedTrial {
                source: self.source,
                title: self.title,
                source_url: self.provenance.source_url,
            });
        };
        Ok(TrialRecord {
            identifier,
            source: self.source,
            title: self.title,
            overall_status: self.overall_status,
            age_group: self.age_group,
            conditions: self.conditions,
            products: self.products,
            phase: self.phase,
            sponsor: self.sponsor,
            primary_endpoint: self.primary_endpoint,
            linked_eudract: self.linked_eudract,
            provenance: self.provenance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn provenance() -> Provenance {
        Provenance {
            raw_artifact_id: Uuid::nil(),
            source_url: "https://example.test/feed".to_string(),
            fetched_at: Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).single().unwrap(),
            extractor_version: "test".to_string(),
        }
    }

    fn draft(identifier: Option<TrialId>) -> TrialDraft {
        TrialDraft {
            identifier,
            source: SourceFamily::Ctis,
            title: Field::text(Some("A psoriasis study")),
            overall_status: Field::text(Some("Ongoing, recruiting")),
            age_group: Field::Unavailable,
            conditions: Field::list(["Psoriasis"]),
            products: Field::Unavailable,
            phase: Field::Unavailable,
            sponsor: Field::Unavailable,
            primary_endpoint: Field::Unavailable,
            linked_eudract: Field::Unavailable,
            provenance: provenance(),
        }
    }

    #[test]
    fn identifier_kind_follows_shape() {
        assert_eq!(TrialId::new("2021-001234-56").kind(), IdentifierKind::EudraCt);
        assert_eq!(TrialId::new("2021-001234-56-01").kind(), IdentifierKind::EudraCt);
        assert_eq!(TrialId::new("NCT01234567").kind(), IdentifierKind::Nct);
        assert_eq!(TrialId::new("2021-1234-56").kind(), IdentifierKind::Other);
    }

    #[test]
    fn unavailable_fields_serialize_as_null_and_read_back() {
        let record = draft(Some(TrialId::new("2021-001234-56"))).into_record().unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert!(json["phase"].is_null());
        assert_eq!(json["conditions"], serde_json::json!(["Psoriasis"]));
        let back: TrialRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn blank_text_is_unavailable() {
        assert_eq!(Field::text(Some("   ")), Field::Unavailable);
        assert_eq!(Field::<Vec<String>>::list(["", " "]), Field::Unavailable);
        assert_eq!(Field::<String>::Unavailable.to_string(), UNAVAILABLE);
    }

    #[test]
    fn draft_without_identifier_is_unlinked() {
        let unlinked = draft(None).into_record().unwrap_err();
        assert_eq!(unlinked.source, SourceFamily::Ctis);
        assert_eq!(unlinked.title.as_deref(), Some("A psoriasis study"));
    }

    #[test]
    fn source_family_serializes_as_its_registry_name() {
        for family in SourceFamily::ALL {
            let json = serde_json::to_value(family).unwrap();
            assert_eq!(json, serde_json::Value::String(family.as_str().to_string()));
            let back: SourceFamily = serde_json::from_value(json).unwrap();
            assert_eq!(back, family);
        }
    }

    #[test]
    fn source_family_parses_aliases() {
        assert_eq!("ctgov".parse::<SourceFamily>(), Ok(SourceFamily::ClinicalTrialsGov));
        assert_eq!("CTIS".parse::<SourceFamily>(), Ok(SourceFamily::Ctis));
        assert!("who".parse::<SourceFamily>().is_err());
    }
}
