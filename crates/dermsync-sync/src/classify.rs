//! Active/inactive view of each registry's status vocabulary.

use std::collections::BTreeMap;

use dermsync_core::{Field, SourceFamily};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusClass {
    Active,
    Inactive,
}

/// Statuses that keep a trial of `family` in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPolicy {
    pub family: SourceFamily,
    pub keep: Vec<String>,
}

impl StatusPolicy {
    pub fn new<I, S>(family: SourceFamily, keep: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            family,
            keep: keep.into_iter().map(Into::into).collect(),
        }
    }

    pub fn ctis_default() -> Self {
        Self::new(
            SourceFamily::Ctis,
            [
                "Ongoing, recruiting",
                "Ongoing, recruitment ended",
                "Authorised, recruiting",
                "Authorised, not recruiting",
            ],
        )
    }

    pub fn clinicaltrials_gov_default() -> Self {
        Self::new(
            SourceFamily::ClinicalTrialsGov,
            ["RECRUITING", "NOT_YET_RECRUITING", "ENROLLING_BY_INVITATION"],
        )
    }

    pub fn allows(&self, status: &str) -> bool {
        let status = status.trim();
        self.keep
            .iter()
            .any(|kept| kept.trim().eq_ignore_ascii_case(status))
    }
}

/// One allow-list per source family. Families without a policy classify
/// everything as inactive.
#[derive(Debug, Clone, Default)]
pub struct StatusClassifier {
    policies: BTreeMap<SourceFamily, StatusPolicy>,
}

impl StatusClassifier {
    pub fn new(policies: impl IntoIterator<Item = StatusPolicy>) -> Self {
        Self {
            policies: policies.into_iter().map(|p| (p.family, p)).collect(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new([
            StatusPolicy::clinicaltrials_gov_default(),
            StatusPolicy::ctis_default(),
        ])
    }

    pub fn policy(&self, family: SourceFamily) -> Option<&StatusPolicy> {
        self.policies.get(&family)
    }

    pub fn classify(&self, family: SourceFamily, status: &str) -> StatusClass {
        match self.policies.get(&family) {
            Some(policy) if policy.allows(status) => StatusClass::Active,
            _ => StatusClass::Inactive,
        }
    }

    /// Unavailable statuses are never on an allow-list.
    pub fn classify_field(&self, family: SourceFamily, status: &Field<String>) -> StatusClass {
        match status {
            Field::Available(text) => self.classify(family, text),
            Field::Unavailable => StatusClass::Inactive,
        }
    }
}
