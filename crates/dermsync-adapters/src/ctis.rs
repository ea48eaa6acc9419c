//! CTIS RSS update feed -> trial drafts.
//!
//! Each `<item>` carries an HTML description made of `<b>Label</b>:value<br />`
//! lines. The trial's status is read from the per-country status list for the
//! configured member state.

use std::sync::LazyLock;

use dermsync_core::{Field, Provenance, SourceFamily, TrialDraft};
use regex_lite::Regex;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};

use crate::identifier::extract_eudract;
use crate::{AdapterError, FetchedPage};

pub const EXTRACTOR_VERSION: &str = "ctis-rss/1";

pub const LABEL_TRIAL_NUMBER: &str = "Trial number";
pub const LABEL_CONDITIONS: &str = "Medical conditions";
pub const LABEL_AGE: &str = "Age of participants";
pub const LABEL_PRODUCT: &str = "Trial product";
pub const LABEL_PHASE: &str = "Phase";
pub const LABEL_SPONSOR: &str = "Sponsor";
pub const LABEL_ENDPOINT: &str = "Primary endpoint";
pub const LABEL_COUNTRY_STATUS: &str = "Status in each country";

static ITEM_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<item\b[^>]*>(.*?)</item>").expect("item pattern compiles"));
static TITLE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<title\b[^>]*>(.*?)</title>").expect("title pattern compiles"));
static DESCRIPTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<description\b[^>]*>(.*?)</description>").expect("description pattern compiles")
});
static LINK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<link\b[^>]*>(.*?)</link>").expect("link pattern compiles"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RssItem {
    pub title: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
}

fn decode_xml_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Element body with a CDATA wrapper removed, or entity-decoded otherwise.
fn element_text(pattern: &Regex, xml: &str) -> Option<String> {
    let raw = pattern.captures(xml)?.get(1)?.as_str().trim();
    let text = match raw
        .strip_prefix("<![CDATA[")
        .and_then(|rest| rest.strip_suffix("]]>"))
    {
        Some(inner) => inner.to_string(),
        None => decode_xml_entities(raw),
    };
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

pub fn parse_rss_items(xml: &str) -> Result<Vec<RssItem>, String> {
    if !xml.contains("<channel") {
        return Err("no RSS <channel> element".to_string());
    }
    Ok(ITEM_PATTERN
        .captures_iter(xml)
        .filter_map(|caps| caps.get(1))
        .map(|body| {
            let body = body.as_str();
            RssItem {
                title: element_text(&TITLE_PATTERN, body),
                description: element_text(&DESCRIPTION_PATTERN, body),
                link: element_text(&LINK_PATTERN, body),
            }
        })
        .collect())
}

/// `(label, value)` pairs from `<b>Label</b>:value<br />` markup, in order.
pub fn labeled_fields(description_html: &str) -> Vec<(String, String)> {
    let fragment = Html::parse_fragment(description_html);
    let Ok(bold) = Selector::parse("b") else {
        return Vec::new();
    };

    fragment
        .select(&bold)
        .map(|label_el| {
            let label = label_el.text().collect::<String>().trim().to_string();
            let mut value = String::new();
            let mut next = label_el.next_sibling();
            while let Some(node) = next {
                match node.value() {
                    Node::Text(text) => value.push_str(text),
                    Node::Element(el) if el.name() == "br" || el.name() == "b" => break,
                    Node::Element(_) => {
                        if let Some(inner) = ElementRef::wrap(node) {
                            value.extend(inner.text());
                        }
                    }
                    _ => {}
                }
                next = node.next_sibling();
            }
            let value = value.trim().trim_start_matches(':').trim().to_string();
            (label, value)
        })
        .collect()
}

fn field_value<'a>(fields: &'a [(String, String)], label: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(l, _)| l.eq_ignore_ascii_case(label))
        .map(|(_, v)| v.as_str())
}

/// Split `Ireland: Authorised, recruiting, Spain: Ongoing, recruiting` into
/// country/status pairs. Statuses may contain commas; country names never
/// contain colons.
pub fn country_statuses(text: &str) -> Vec<(String, String)> {
    let parts = text.split(':').collect::<Vec<_>>();
    if parts.len() < 2 {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut country = parts[0].trim().to_string();
    let last = parts.len() - 1;
    for (idx, part) in parts.iter().enumerate().skip(1) {
        let (status, next_country) = if idx == last {
            (part.trim(), "")
        } else {
            match part.rfind([',', ';']) {
                Some(pos) => (part[..pos].trim(), part[pos + 1..].trim()),
                None => (part.trim(), ""),
            }
        };
        let status = status.trim_end_matches([',', ';']).trim();
        if !country.is_empty() {
            out.push((country.clone(), status.to_string()));
        }
        country = next_country.to_string();
    }
    out
}

/// Status for `country`, or `None` when the trial lists no such member state.
pub fn status_for_country(text: &str, country: &str) -> Option<String> {
    country_statuses(text)
        .into_iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(country.trim()))
        .map(|(_, status)| status)
}

/// Map one feed item to a draft. Never fails; an item without a description
/// becomes an unlinked draft.
pub fn normalize_item(item: &RssItem, country: &str, provenance: Provenance) -> TrialDraft {
    let description = item.description.as_deref().unwrap_or_default();
    let fields = labeled_fields(description);
    let get = |label: &str| field_value(&fields, label);

    let identifier = get(LABEL_TRIAL_NUMBER)
        .and_then(extract_eudract)
        .or_else(|| extract_eudract(description));
    let status = get(LABEL_COUNTRY_STATUS).and_then(|text| status_for_country(text, country));
    let single = |label: &str| Field::list(get(label));

    TrialDraft {
        identifier,
        source: SourceFamily::Ctis,
        title: Field::text(item.title.as_deref()),
        overall_status: Field::text(status.as_deref()),
        age_group: single(LABEL_AGE),
        conditions: single(LABEL_CONDITIONS),
        products: single(LABEL_PRODUCT),
        phase: Field::text(get(LABEL_PHASE)),
        sponsor: Field::text(get(LABEL_SPONSOR)),
        primary_endpoint: Field::text(get(LABEL_ENDPOINT)),
        linked_eudract: Field::Unavailable,
        provenance,
    }
}

pub(crate) fn parse_feed(
    source_id: &str,
    country: &str,
    page: &FetchedPage,
    provenance: Provenance,
) -> Result<Vec<TrialDraft>, AdapterError> {
    let xml = String::from_utf8_lossy(&page.body);
    let items = parse_rss_items(&xml).map_err(|reason| AdapterError::Malformed {
        source_id: source_id.to_string(),
        reason,
    })?;
    Ok(items
        .iter()
        .map(|item| {
            let mut provenance = provenance.clone();
            if let Some(link) = &item.link {
                provenance.source_url = link.clone();
            }
            normalize_item(item, country, provenance)
        })
        .collect())
}
