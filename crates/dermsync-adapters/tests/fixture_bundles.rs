use std::path::Path;

use dermsync_adapters::{adapter_for, load_fixture_bundle};
use dermsync_core::SourceFamily;

#[test]
fn every_fixture_bundle_parses_to_its_snapshot_length() {
    let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
    for family in SourceFamily::ALL {
        let sample = fixtures.join(family.as_str()).join("sample");
        assert!(sample.join("bundle.json").exists(), "{family} bundle missing");
        assert!(sample.join("snapshot.json").exists(), "{family} snapshot missing");

        let bundle = load_fixture_bundle(sample.join("bundle.json")).unwrap();
        let adapter = adapter_for(family, &bundle.source_id, Some("Ireland"));
        let drafts = adapter.parse(&bundle.into_page()).unwrap();

        let snapshot: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(sample.join("snapshot.json")).unwrap()).unwrap();
        assert_eq!(drafts.len(), snapshot.len(), "{family} draft count");
        assert!(drafts.iter().all(|d| d.source == family));
    }
}
