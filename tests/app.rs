use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use chrono::{DateTime, NaiveDate, Utc};
use tempfile::TempDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use extract_bundler::app::{BundleResult, Bundler, BundlerSettings, Stage};
use extract_bundler::cancel::CancellationToken;
use extract_bundler::catalog::{CatalogDocument, MetadataCatalog};
use extract_bundler::config::TargetRequest;
use extract_bundler::convert::{CommandOutput, CommandRunner, ContainerConverter};
use extract_bundler::domain::{BundleTarget, INSTRUCTION_PDF, SourceSpec};
use extract_bundler::error::BundlerError;
use extract_bundler::fetch::{FetchPlan, SourceFetcher};
use extract_bundler::merge::{list_entries, read_entry};
use extract_bundler::output::JsonOutput;
use extract_bundler::upload::{ObjectMeta, ObjectStore};

fn zip_of(entries: &[&str]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for name in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(format!("content of {name}").as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Serves a fixed archive per source name; unknown names fail with 404.
struct StaticFetcher {
    archives: HashMap<String, Vec<u8>>,
}

impl StaticFetcher {
    fn street_name() -> Self {
        let archives = [
            (
                "MunicipalityRegistry_Extract",
                zip_of(&["Gemeente.dbf", "Gemeente_metadata.dbf"]),
            ),
            (
                "PostalRegistry_Extract",
                zip_of(&["Postinfo.dbf", "Postinfo_metadata.dbf"]),
            ),
            (
                "StreetNameRegistry_Extract",
                zip_of(&["Straatnaam.dbf", "Straatnaam_metadata.dbf"]),
            ),
        ]
        .into_iter()
        .map(|(name, bytes)| (name.to_string(), bytes))
        .collect();
        Self { archives }
    }

    fn without(mut self, name: &str) -> Self {
        self.archives.remove(name);
        self
    }
}

impl SourceFetcher for StaticFetcher {
    fn fetch(
        &self,
        source: &SourceSpec,
        _cancel: &CancellationToken,
    ) -> Result<Vec<u8>, BundlerError> {
        self.archives
            .get(&source.name)
            .cloned()
            .ok_or_else(|| BundlerError::SourceStatus {
                source_name: source.name.clone(),
                status: 404,
            })
    }
}

#[derive(Clone, Copy)]
enum CatalogBehaviour {
    Healthy,
    NoXsrf,
    Exhausted,
}

struct FakeCatalog {
    behaviour: CatalogBehaviour,
    published: Mutex<Vec<String>>,
}

impl FakeCatalog {
    fn new(behaviour: CatalogBehaviour) -> Self {
        Self {
            behaviour,
            published: Mutex::new(Vec::new()),
        }
    }
}

impl MetadataCatalog for FakeCatalog {
    fn publish(
        &self,
        identifier: &str,
        _timestamp: DateTime<Utc>,
        _cancel: &CancellationToken,
    ) -> Result<Option<CatalogDocument>, BundlerError> {
        match self.behaviour {
            CatalogBehaviour::Healthy => {
                self.published.lock().unwrap().push(identifier.to_string());
                Ok(Some(CatalogDocument("<csw:TransactionResponse/>".to_string())))
            }
            CatalogBehaviour::NoXsrf => Ok(None),
            CatalogBehaviour::Exhausted => Err(BundlerError::PublishExhausted { attempts: 10 }),
        }
    }

    fn fetch_xml(
        &self,
        identifier: &str,
        _cancel: &CancellationToken,
    ) -> Result<String, BundlerError> {
        Ok(format!("<gmd:MD_Metadata id=\"{identifier}\"/>"))
    }

    fn fetch_pdf(
        &self,
        _identifier: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<u8>, BundlerError> {
        Ok(vec![0x25, 0x50, 0x44, 0x46, 0x00, 0xff])
    }
}

#[derive(Default)]
struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

impl ObjectStore for MemoryStore {
    fn upload(
        &self,
        key: &str,
        content: &[u8],
        _cancel: &CancellationToken,
    ) -> Result<(), BundlerError> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), content.to_vec());
        Ok(())
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BundlerError> {
        let stored = self.objects.lock().unwrap().contains_key(key);
        Ok(stored.then(ObjectMeta::default))
    }
}

/// Pretends to be ogr2ogr: the first call creates the container file.
#[derive(Default)]
struct FakeOgr {
    calls: Mutex<Vec<Vec<String>>>,
    fail: bool,
}

impl CommandRunner for FakeOgr {
    fn run(
        &self,
        _program: &str,
        args: &[String],
        _cwd: &Path,
        _cancel: &CancellationToken,
    ) -> Result<CommandOutput, BundlerError> {
        self.calls.lock().unwrap().push(args.to_vec());
        if self.fail {
            return Ok(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "FAILURE: Unable to open datasource".to_string(),
            });
        }
        if !args.contains(&"-update".to_string()) {
            fs::write(&args[2], b"SQLite format 3").unwrap();
        }
        Ok(CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

type TestBundler = Bundler<StaticFetcher, FakeCatalog, MemoryStore, MemoryStore, FakeOgr>;

fn bundler(
    scratch: &TempDir,
    fetcher: StaticFetcher,
    catalog: FakeCatalog,
    ogr: FakeOgr,
) -> TestBundler {
    let instruction = scratch.path().join(INSTRUCTION_PDF);
    fs::write(&instruction, b"%PDF-1.4 instructions").unwrap();
    Bundler::new(
        fetcher,
        catalog,
        MemoryStore::default(),
        MemoryStore::default(),
        ContainerConverter::new(
            ogr,
            "ogr2ogr",
            Utf8PathBuf::from_path_buf(scratch.path().join("workspace")).unwrap(),
        ),
        BundlerSettings {
            instruction_pdf: Utf8PathBuf::from_path_buf(instruction).unwrap(),
            is_test: true,
        },
    )
    .with_date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
}

fn street_name_request(convert: bool) -> TargetRequest {
    TargetRequest {
        target: BundleTarget::StreetName,
        sources: BundleTarget::StreetName
            .profile()
            .required_sources
            .iter()
            .map(|name| SourceSpec {
                name: name.to_string(),
                url: format!("https://extracts.test/{name}.zip"),
            })
            .collect(),
        plan: FetchPlan::Parallel,
        catalog_identifier: "street-name-record".to_string(),
        convert,
    }
}

const PRIMARY_KEY: &str = "20240101-Downloadbestand-Gebouwen-Adressenregister_straatnamen.zip";
const NAMESPACED_KEY: &str = "31088/GRAR_Straatnamen.zip";

fn sorted_entries(bytes: &[u8]) -> Vec<String> {
    let mut names = list_entries(bytes).unwrap();
    names.sort();
    names
}

fn run(bundler: &TestBundler, request: &TargetRequest) -> BundleResult {
    bundler.run_bundle(request, &JsonOutput, &CancellationToken::new())
}

#[test]
fn street_name_bundle_end_to_end() {
    let scratch = tempfile::tempdir().unwrap();
    let bundler = bundler(
        &scratch,
        StaticFetcher::street_name(),
        FakeCatalog::new(CatalogBehaviour::Healthy),
        FakeOgr::default(),
    );
    let result = run(&bundler, &street_name_request(false));
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.artifacts_uploaded, vec![PRIMARY_KEY, NAMESPACED_KEY]);

    let flat = bundler_primary(&bundler, PRIMARY_KEY);
    assert_eq!(
        sorted_entries(&flat),
        vec![
            "Gemeente.dbf",
            "Gemeente_metadata.dbf",
            "Postinfo.dbf",
            "Postinfo_metadata.dbf",
            "Straatnaam.dbf",
            "Straatnaam_metadata.dbf",
        ]
    );
    assert_eq!(
        read_entry(&flat, "Straatnaam.dbf").unwrap(),
        b"content of Straatnaam.dbf"
    );

    let namespaced = bundler_namespaced(&bundler, NAMESPACED_KEY);
    let names = sorted_entries(&namespaced);
    assert_eq!(names.len(), 9);
    let root = "20240101_GRAR_Straatnamen_Data/dBASE/";
    assert_eq!(names.iter().filter(|name| name.starts_with(root)).count(), 6);
    assert!(names.contains(&"Meta_GRARStraatnamen.xml".to_string()));
    assert!(names.contains(&"Meta_GRARStraatnamen.pdf".to_string()));
    assert!(names.contains(&INSTRUCTION_PDF.to_string()));
    assert_eq!(
        read_entry(&namespaced, "Meta_GRARStraatnamen.pdf").unwrap(),
        vec![0x25, 0x50, 0x44, 0x46, 0x00, 0xff]
    );
}

#[test]
fn missing_source_blocks_every_upload() {
    let scratch = tempfile::tempdir().unwrap();
    let bundler = bundler(
        &scratch,
        StaticFetcher::street_name().without("PostalRegistry_Extract"),
        FakeCatalog::new(CatalogBehaviour::Healthy),
        FakeOgr::default(),
    );
    let result = run(&bundler, &street_name_request(true));

    assert!(!result.success);
    assert!(result.artifacts_uploaded.is_empty());
    assert!(
        result
            .errors
            .iter()
            .any(|failure| failure.stage == Stage::Fetch
                && failure.message.contains("PostalRegistry_Extract"))
    );
    assert_eq!(result.exit_code(), 3);
}

#[test]
fn exhausted_publication_keeps_primary_upload() {
    let scratch = tempfile::tempdir().unwrap();
    let bundler = bundler(
        &scratch,
        StaticFetcher::street_name(),
        FakeCatalog::new(CatalogBehaviour::Exhausted),
        FakeOgr::default(),
    );
    let result = run(&bundler, &street_name_request(true));

    assert!(!result.success);
    assert_eq!(result.artifacts_uploaded, vec![PRIMARY_KEY]);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].stage, Stage::Metadata);
    assert!(result.errors[0].message.contains("10 attempts"));
}

#[test]
fn missing_xsrf_token_is_an_authentication_failure() {
    let scratch = tempfile::tempdir().unwrap();
    let bundler = bundler(
        &scratch,
        StaticFetcher::street_name(),
        FakeCatalog::new(CatalogBehaviour::NoXsrf),
        FakeOgr::default(),
    );
    let result = run(&bundler, &street_name_request(false));

    assert!(!result.success);
    assert_eq!(result.errors[0].stage, Stage::Metadata);
    assert!(result.errors[0].message.contains("XSRF"));
}

#[test]
fn conversion_uploads_container() {
    let scratch = tempfile::tempdir().unwrap();
    let bundler = bundler(
        &scratch,
        StaticFetcher::street_name(),
        FakeCatalog::new(CatalogBehaviour::Healthy),
        FakeOgr::default(),
    );
    let result = run(&bundler, &street_name_request(true));

    assert!(result.success, "{:?}", result.errors);
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    assert_eq!(
        result.artifacts_uploaded.last().map(String::as_str),
        Some("31088/GRAR_Straatnamen_Gpkg.zip")
    );
    let container = bundler_namespaced(&bundler, "31088/GRAR_Straatnamen_Gpkg.zip");
    let names = list_entries(&container).unwrap();
    assert!(names.contains(&"GRAR_Straatnamen.gpkg".to_string()));
    assert!(!names.iter().any(|name| name.contains("/dBASE/")));
}

#[test]
fn failed_conversion_is_only_a_warning() {
    let scratch = tempfile::tempdir().unwrap();
    let bundler = bundler(
        &scratch,
        StaticFetcher::street_name(),
        FakeCatalog::new(CatalogBehaviour::Healthy),
        FakeOgr {
            fail: true,
            ..Default::default()
        },
    );
    let result = run(&bundler, &street_name_request(true));

    assert!(result.success);
    assert_eq!(result.artifacts_uploaded, vec![PRIMARY_KEY, NAMESPACED_KEY]);
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].stage, Stage::Conversion);
    assert!(result.warnings[0].message.contains("Unable to open datasource"));
}

#[test]
fn cancelled_run_uploads_nothing() {
    let scratch = tempfile::tempdir().unwrap();
    let bundler = bundler(
        &scratch,
        StaticFetcher::street_name(),
        FakeCatalog::new(CatalogBehaviour::Healthy),
        FakeOgr::default(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();
    let results = bundler.run_all(&[street_name_request(false)], &JsonOutput, &cancel);

    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert!(results[0].artifacts_uploaded.is_empty());
}

fn bundler_primary(bundler: &TestBundler, key: &str) -> Vec<u8> {
    bundler
        .primary_store()
        .get(key)
        .unwrap_or_else(|| panic!("{key} not uploaded"))
}

fn bundler_namespaced(bundler: &TestBundler, key: &str) -> Vec<u8> {
    bundler
        .namespaced_store()
        .get(key)
        .unwrap_or_else(|| panic!("{key} not uploaded"))
}
