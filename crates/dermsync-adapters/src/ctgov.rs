//! ClinicalTrials.gov v2 study JSON -> trial drafts.

use dermsync_core::{Field, Provenance, SourceFamily, TrialDraft};
use serde_json::Value as JsonValue;

use crate::identifier::{extract_eudract, nct_from_field};
use crate::{AdapterError, FetchedPage};

pub const EXTRACTOR_VERSION: &str = "ctgov-v2-json/1";

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

fn json_strings(value: &JsonValue, path: &[&str]) -> Vec<String> {
    json_at(value, path)
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// `studies[]` of a search page, or the study itself for a single-study
/// response.
fn studies_of(root: &JsonValue) -> Option<Vec<&JsonValue>> {
    if let Some(studies) = root.get("studies") {
        return studies.as_array().map(|arr| arr.iter().collect());
    }
    root.get("protocolSection").map(|_| vec![root])
}

pub fn next_page_token(body: &[u8]) -> Option<String> {
    let root: JsonValue = serde_json::from_slice(body).ok()?;
    json_str(&root, &["nextPageToken"])
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
}

fn protocol<'a>(path: &[&'a str]) -> Vec<&'a str> {
    let mut full = vec!["protocolSection"];
    full.extend_from_slice(path);
    full
}

/// Map one study document to a draft. Never fails: unreadable fields become
/// unavailable and a missing or malformed NCT id leaves the draft unlinked.
pub fn normalize_study(study: &JsonValue, provenance: Provenance) -> TrialDraft {
    let identifier = json_str(study, &protocol(&["identificationModule", "nctId"])).and_then(nct_from_field);
    let interventions = json_at(study, &protocol(&["armsInterventionsModule", "interventions"]))
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|i| i.get("name").and_then(JsonValue::as_str))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let phases = json_strings(study, &protocol(&["designModule", "phases"]));
    let primary_endpoint = json_at(study, &protocol(&["outcomesModule", "primaryOutcomes"]))
        .and_then(JsonValue::as_array)
        .and_then(|arr| arr.first())
        .and_then(|o| o.get("measure"))
        .and_then(JsonValue::as_str);
    let linked_eudract = serde_json::to_string(study)
        .ok()
        .and_then(|text| extract_eudract(&text));

    TrialDraft {
        identifier,
        source: SourceFamily::ClinicalTrialsGov,
        title: Field::text(json_str(study, &protocol(&["identificationModule", "briefTitle"]))),
        overall_status: Field::text(json_str(study, &protocol(&["statusModule", "overallStatus"]))),
        age_group: Field::list(json_strings(study, &protocol(&["eligibilityModule", "stdAges"]))),
        conditions: Field::list(json_strings(study, &protocol(&["conditionsModule", "conditions"]))),
        products: Field::list(interventions),
        phase: Field::text(Some(phases.join(", ").as_str())),
        sponsor: Field::text(json_str(
            study,
            &protocol(&["sponsorCollaboratorsModule", "leadSponsor", "name"]),
        )),
        primary_endpoint: Field::text(primary_endpoint),
        linked_eudract: Field::from_option(linked_eudract),
        provenance,
    }
}

pub(crate) fn parse_page(
    source_id: &str,
    page: &FetchedPage,
    provenance: Provenance,
) -> Result<Vec<TrialDraft>, AdapterError> {
    let root: JsonValue = serde_json::from_slice(&page.body).map_err(|e| AdapterError::Malformed {
        source_id: source_id.to_string(),
        reason: format!("invalid JSON: {e}"),
    })?;
    let studies = studies_of(&root).ok_or_else(|| AdapterError::Malformed {
        source_id: source_id.to_string(),
        reason: "neither a `studies` array nor a study document".to_string(),
    })?;
    Ok(studies
        .into_iter()
        .map(|study| normalize_study(study, provenance.clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use uuid::Uuid;

    fn provenance() -> Provenance {
        Provenance {
            raw_artifact_id: Uuid::nil(),
            source_url: "https://clinicaltrials.gov/api/v2/studies".to_string(),
            fetched_at: Utc.with_ymd_and_hms(2025, 9, 1, 6, 0, 0).single().unwrap(),
            extractor_version: EXTRACTOR_VERSION.to_string(),
        }
    }

    #[test]
    fn maps_protocol_section_fields() {
        let study = json!({
            "protocolSection": {
                "identificationModule": {"nctId": "NCT05123456", "briefTitle": "Dupilumab in Hand Eczema"},
                "statusModule": {"overallStatus": "RECRUITING"},
                "eligibilityModule": {"stdAges": ["ADULT", "OLDER_ADULT"]},
                "conditionsModule": {"conditions": ["Hand Eczema", "Atopic Dermatitis"]},
                "armsInterventionsModule": {"interventions": [{"name": "Dupilumab"}, {"name": "Placebo"}]},
                "designModule": {"phases": ["PHASE3"]},
                "sponsorCollaboratorsModule": {"leadSponsor": {"name": "Regeneron"}},
                "outcomesModule": {"primaryOutcomes": [{"measure": "HECSI-75 at week 16"}]},
                "referencesModule": {"seeAlsoLinks": []}
            }
        });
        let draft = normalize_study(&study, provenance());
        assert_eq!(draft.identifier.as_ref().map(|id| id.as_str()), Some("NCT05123456"));
        assert_eq!(draft.overall_status.as_deref(), Some("RECRUITING"));
        assert_eq!(
            draft.products,
            Field::Available(vec!["Dupilumab".to_string(), "Placebo".to_string()])
        );
        assert_eq!(draft.phase.as_deref(), Some("PHASE3"));
        assert_eq!(draft.primary_endpoint.as_deref(), Some("HECSI-75 at week 16"));
        assert_eq!(draft.linked_eudract, Field::Unavailable);
    }

    #[test]
    fn secondary_ids_link_to_eudract() {
        let study = json!({
            "protocolSection": {
                "identificationModule": {
                    "nctId": "NCT04000001",
                    "secondaryIdInfos": [{"id": "2019-001122-33", "type": "EUDRACT_NUMBER"}]
                }
            }
        });
        let draft = normalize_study(&study, provenance());
        assert_eq!(
            draft.linked_eudract.value().map(|id| id.as_str()),
            Some("2019-001122-33")
        );
        assert_eq!(draft.title, Field::Unavailable);
        assert_eq!(draft.conditions, Field::Unavailable);
        assert_eq!(draft.phase, Field::Unavailable);
    }

    #[test]
    fn missing_nct_leaves_draft_unlinked() {
        let study = json!({"protocolSection": {"identificationModule": {"nctId": "N/A"}}});
        assert!(normalize_study(&study, provenance()).identifier.is_none());
    }

    #[test]
    fn next_page_token_is_read_from_search_page() {
        assert_eq!(
            next_page_token(br#"{"studies": [], "nextPageToken": "abc"}"#),
            Some("abc".to_string())
        );
        assert_eq!(next_page_token(br#"{"studies": []}"#), None);
    }
}
