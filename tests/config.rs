use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use extract_bundler::config::{Config, ConfigLoader, Credentials};
use extract_bundler::domain::BundleTarget;
use extract_bundler::error::BundlerError;
use extract_bundler::fetch::FetchPlan;

const CONFIG: &str = r#"{
    "bundlers": {
        "address": {
            "sources": ["AddressRegistry_Extract=https://extracts.test/address.zip"]
        },
        "address_links": {
            "sources": [
                { "name": "AddressRegistry_Extract", "url": "https://extracts.test/address.zip" },
                "BuildingRegistry_Links=https://extracts.test/building-links.zip",
                "ParcelRegistry_Links=https://extracts.test/parcel-links.zip"
            ],
            "fetch": { "groups": [["AddressRegistry_Extract"], ["BuildingRegistry_Links", "ParcelRegistry_Links"]] }
        },
        "street_name": { "enabled": false }
    },
    "metadata_center": {
        "base_url": "https://metadata.test/geonetwork",
        "identifiers": { "address": "addr-id", "address_links": "links-id" },
        "token_endpoint": "https://auth.test/token",
        "client_id": "bundler",
        "client_secret": "s3cret",
        "retry": { "max_attempts": 3, "delay_secs": 5 }
    },
    "primary_store": {
        "base_url": "https://s3.test",
        "bucket": "extracts",
        "region": "eu-west-1",
        "access_key_id": "AKIDEXAMPLE",
        "secret_access_key": "s3cret"
    },
    "namespaced_store": { "base_url": "https://blob.test/extracts", "sas_token": "sv=2022&sig=x", "is_test": false },
    "conversion": { "enabled": ["address_links"], "workspace": "/tmp/bundler" },
    "instruction_pdf": "/opt/bundler/HandleidingZipPakketten.pdf"
}"#;

#[test]
fn loads_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("extract-bundler.json");
    fs::write(&path, CONFIG).unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.targets.len(), 2);

    let address = resolved.target(BundleTarget::Address).unwrap();
    assert_eq!(address.plan, FetchPlan::Parallel);
    assert!(!address.convert);
    assert_eq!(address.catalog_identifier, "addr-id");

    let links = resolved.target(BundleTarget::AddressLinks).unwrap();
    assert!(links.convert);
    assert_matches!(&links.plan, FetchPlan::Groups(groups) if groups.len() == 2);
    assert!(resolved.target(BundleTarget::StreetName).is_none());

    assert_matches!(
        &resolved.catalog.credentials,
        Credentials::ClientCredentials { client_id, .. } if client_id == "bundler"
    );
    assert_eq!(resolved.catalog.retry.max_attempts, 3);
    assert_eq!(resolved.catalog.retry.delay, Duration::from_secs(5));
    assert_eq!(resolved.primary_store.prefix, "");
    assert_eq!(resolved.primary_store.credentials.access_key_id, "AKIDEXAMPLE");
    assert!(!resolved.namespaced_store.is_test);
    assert_eq!(resolved.conversion.workspace.as_str(), "/tmp/bundler");
}

#[test]
fn missing_identifier_is_rejected() {
    let mut config: Config = serde_json::from_str(CONFIG).unwrap();
    config.metadata_center.identifiers.address = None;
    let err = ConfigLoader::resolve_config(config).unwrap_err();
    assert_matches!(err, BundlerError::InvalidConfig(message) if message.contains("address"));
}

#[test]
fn fetch_groups_must_cover_every_source() {
    let json = CONFIG.replace(
        r#"[["AddressRegistry_Extract"], ["BuildingRegistry_Links", "ParcelRegistry_Links"]]"#,
        r#"[["AddressRegistry_Extract"], ["BuildingRegistry_Links"]]"#,
    );
    let config: Config = serde_json::from_str(&json).unwrap();
    let err = ConfigLoader::resolve_config(config).unwrap_err();
    assert_matches!(err, BundlerError::InvalidConfig(message) if message.contains("fetch groups"));
}

#[test]
fn unreadable_and_malformed_files() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(missing.to_str()),
        Err(BundlerError::ConfigRead(_))
    );

    let broken = dir.path().join("broken.json");
    fs::write(&broken, "{ not json").unwrap();
    assert_matches!(
        ConfigLoader::resolve(broken.to_str()),
        Err(BundlerError::ConfigParse(_))
    );
}
