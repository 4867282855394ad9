use chrono::NaiveDate;

use extract_bundler::domain::{BundleTarget, rewrite_entry_name};

#[test]
fn every_target_has_distinct_artifacts() {
    let date = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
    let mut keys = BundleTarget::ALL
        .iter()
        .map(|target| target.profile().primary_key(date))
        .collect::<Vec<_>>();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), BundleTarget::ALL.len());

    for target in BundleTarget::ALL {
        let profile = target.profile();
        assert!(profile.root_dir(date).starts_with("20241231_"));
        assert!(profile.root_dir(date).ends_with("_Data"));
        assert_ne!(profile.namespaced_key(true), profile.namespaced_key(false));
        assert!(!profile.required_sources.is_empty());
    }
}

#[test]
fn full_bundle_needs_every_registry() {
    let profile = BundleTarget::Full.profile();
    assert_eq!(profile.required_sources.len(), 9);
    for target in BundleTarget::ALL {
        for source in target.profile().required_sources {
            assert!(profile.requires(source), "{source} missing from full");
        }
    }
}

#[test]
fn rewrite_is_pure() {
    let root = "20240101_GRAR_Data";
    for name in ["Adres.shp", "Adres.shx", "Adres.prj", "Gebouweenheid_metadata.dbf"] {
        assert_eq!(
            rewrite_entry_name(root, name),
            format!("{root}/Shapefile/{name}")
        );
    }
    for name in ["CrabHuisnummer.dbf", "Gemeente.dbf", "readme.txt"] {
        assert_eq!(rewrite_entry_name(root, name), format!("{root}/dBASE/{name}"));
    }
}

#[test]
fn messages_match_labels() {
    let profile = BundleTarget::AddressLinks.profile();
    assert_eq!(profile.done_message(), "AddressLinks extract DONE.");
    assert_eq!(
        profile.metadata_updated_message(),
        "Metadata Updated for AddressLinks extract."
    );
    assert_eq!(
        profile.metadata_failed_message(),
        "Failed Update Metadata Center for AddressLinks extract."
    );
}
