//! Trial identifier extraction.
//!
//! EudraCT / EU-CT numbers are found by pattern anywhere in free text. The
//! match is purely syntactic: the first token shaped like
//! `YYYY-NNNNNN-NN[-NN]` wins, wherever it appears, and the year is not
//! checked. Only neighbouring digits break a match, so `EudraCT2021-001234-56`
//! still yields the number. NCT numbers are only ever read from a structured field.

use std::sync::LazyLock;

use dermsync_core::TrialId;
use regex_lite::Regex;

static EUDRACT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^0-9])(\d{4}-\d{6}-\d{2}(?:-\d{2})?)(?:[^0-9]|$)")
        .expect("eudract pattern compiles")
});

/// First EudraCT-shaped token in `text`, or `None`.
pub fn extract_eudract(text: &str) -> Option<TrialId> {
    EUDRACT_PATTERN
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| TrialId::new(m.as_str()))
}

/// Accepts `NCT` followed by eight digits, in any case.
pub fn nct_from_field(value: &str) -> Option<TrialId> {
    let upper = value.trim().to_ascii_uppercase();
    let digits = upper.strip_prefix("NCT")?;
    if digits.len() == 8 && digits.bytes().all(|b| b.is_ascii_digit()) {
        Some(TrialId::new(upper))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_trial_number_in_rss_markup() {
        let text = "<b>Title</b>:Study X<br /><b>Trial number</b>:2021-001234-56-01<br /><b>Phase</b>:II<br />";
        assert_eq!(
            extract_eudract(text).map(|id| id.to_string()),
            Some("2021-001234-56-01".to_string())
        );
    }

    #[test]
    fn short_form_without_suffix_matches() {
        assert_eq!(
            extract_eudract("EudraCT Number: 2019-004567-12 (secondary id)").map(|id| id.to_string()),
            Some("2019-004567-12".to_string())
        );
    }

    #[test]
    fn returns_first_match_even_when_unrelated() {
        let text = "ref 1999-123456-00 then trial 2022-500123-44-00";
        assert_eq!(
            extract_eudract(text).map(|id| id.to_string()),
            Some("1999-123456-00".to_string())
        );
    }

    #[test]
    fn no_match_is_none() {
        assert!(extract_eudract("<b>Trial number</b>:pending<br />").is_none());
        assert!(extract_eudract("2021-01-15 and 2021-1234-56").is_none());
        assert!(extract_eudract("").is_none());
    }

    #[test]
    fn nct_field_is_normalized_and_validated() {
        assert_eq!(nct_from_field(" nct01234567 ").map(|id| id.to_string()), Some("NCT01234567".to_string()));
        assert!(nct_from_field("NCT0123").is_none());
        assert!(nct_from_field("N/A").is_none());
    }

    #[test]
    fn matches_when_glued_to_letters_or_underscores() {
        assert_eq!(
            extract_eudract("EudraCT2021-001234-56").map(|id| id.to_string()),
            Some("2021-001234-56".to_string())
        );
        assert_eq!(
            extract_eudract("id_2021-001234-56-01;").map(|id| id.to_string()),
            Some("2021-001234-56-01".to_string())
        );
        assert!(extract_eudract("12021-001234-56").is_none());
        assert!(extract_eudract("2021-001234-567").is_none());
    }
}
