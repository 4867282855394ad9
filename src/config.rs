use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};

use crate::catalog::RetryPolicy;
use crate::domain::{BundleTarget, SourceSpec};
use crate::error::BundlerError;
use crate::fetch::FetchPlan;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub bundlers: BundlersConfig,
    pub metadata_center: MetadataCenterConfig,
    pub primary_store: PrimaryStoreConfig,
    pub namespaced_store: NamespacedStoreConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub instruction_pdf: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct BundlersConfig {
    #[serde(default)]
    pub full: Option<BundlerEntry>,
    #[serde(default)]
    pub street_name: Option<BundlerEntry>,
    #[serde(default)]
    pub address: Option<BundlerEntry>,
    #[serde(default)]
    pub address_links: Option<BundlerEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BundlerEntry {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub fetch: Option<FetchEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SourceEntry {
    Shorthand(String),
    Detailed(SourceSpec),
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchEntry {
    Parallel,
    Groups(Vec<Vec<String>>),
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MetadataCenterConfig {
    /// GeoNetwork root including its context path; catalog paths are appended to it.
    pub base_url: String,
    #[serde(default)]
    pub identifiers: CatalogIdentifiers,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryEntry>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct CatalogIdentifiers {
    #[serde(default)]
    pub full: Option<String>,
    #[serde(default)]
    pub street_name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub address_links: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RetryEntry {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub delay_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PrimaryStoreConfig {
    pub base_url: String,
    pub bucket: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub virtual_host: bool,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct NamespacedStoreConfig {
    pub base_url: String,
    #[serde(default)]
    pub sas_token: Option<String>,
    #[serde(default)]
    pub is_test: bool,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ConversionConfig {
    #[serde(default)]
    pub enabled: Vec<BundleTarget>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TargetRequest {
    pub target: BundleTarget,
    pub sources: Vec<SourceSpec>,
    pub plan: FetchPlan,
    pub catalog_identifier: String,
    pub convert: bool,
}

#[derive(Debug, Clone)]
pub enum Credentials {
    Static(String),
    ClientCredentials {
        token_endpoint: String,
        client_id: String,
        client_secret: String,
    },
}

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub base_url: String,
    pub credentials: Credentials,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Keys {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PrimaryStoreSettings {
    pub base_url: String,
    pub bucket: String,
    pub prefix: String,
    pub region: String,
    pub virtual_host: bool,
    pub credentials: S3Keys,
}

#[derive(Debug, Clone)]
pub struct NamespacedStoreSettings {
    pub base_url: String,
    pub sas_token: Option<String>,
    pub is_test: bool,
}

#[derive(Debug, Clone)]
pub struct ConversionSettings {
    pub tool: String,
    pub workspace: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub targets: Vec<TargetRequest>,
    pub catalog: CatalogSettings,
    pub primary_store: PrimaryStoreSettings,
    pub namespaced_store: NamespacedStoreSettings,
    pub conversion: ConversionSettings,
    pub instruction_pdf: Utf8PathBuf,
}

impl ResolvedConfig {
    pub fn target(&self, target: BundleTarget) -> Option<&TargetRequest> {
        self.targets.iter().find(|request| request.target == target)
    }
}

pub const CONFIG_ENV: &str = "EXTRACT_BUNDLER_CONFIG";
const CONFIG_FILE: &str = "extract-bundler.json";

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, BundlerError> {
        let mut fallbacks = vec![PathBuf::from(CONFIG_FILE)];
        if let Some(dirs) = ProjectDirs::from("", "", "extract-bundler") {
            fallbacks.push(dirs.config_dir().join(CONFIG_FILE));
        }
        let config_path = Self::locate(path, std::env::var(CONFIG_ENV).ok(), &fallbacks)?;

        let content = fs::read_to_string(&config_path)
            .map_err(|_| BundlerError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| BundlerError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    /// Picks the config file: an explicit path, then the environment
    /// variable, then the first existing fallback.
    pub fn locate(
        explicit: Option<&str>,
        from_env: Option<String>,
        fallbacks: &[PathBuf],
    ) -> Result<PathBuf, BundlerError> {
        if let Some(path) = explicit {
            return Ok(PathBuf::from(path));
        }
        if let Some(path) = from_env.filter(|value| !value.trim().is_empty()) {
            return Ok(PathBuf::from(path));
        }
        fallbacks
            .iter()
            .find(|candidate| candidate.is_file())
            .cloned()
            .ok_or(BundlerError::MissingConfig)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, BundlerError> {
        let identifiers = config.metadata_center.identifiers.clone();
        let conversion_targets = config.conversion.enabled.clone();

        let entries = [
            (BundleTarget::Full, config.bundlers.full, identifiers.full),
            (
                BundleTarget::StreetName,
                config.bundlers.street_name,
                identifiers.street_name,
            ),
            (
                BundleTarget::Address,
                config.bundlers.address,
                identifiers.address,
            ),
            (
                BundleTarget::AddressLinks,
                config.bundlers.address_links,
                identifiers.address_links,
            ),
        ];

        let mut targets = Vec::new();
        for (target, entry, identifier) in entries {
            let Some(entry) = entry.filter(|entry| entry.enabled) else {
                continue;
            };
            let identifier = identifier
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| {
                    BundlerError::InvalidConfig(format!("missing catalog identifier for {target}"))
                })?;
            targets.push(resolve_target(
                target,
                entry,
                identifier,
                conversion_targets.contains(&target),
            )?);
        }

        let catalog = resolve_catalog(config.metadata_center)?;

        let primary_store = resolve_primary_store(config.primary_store, |name| {
            std::env::var(name).ok()
        })?;

        let namespaced_store = NamespacedStoreSettings {
            base_url: non_empty(config.namespaced_store.base_url, "namespaced_store.base_url")?,
            sas_token: config
                .namespaced_store
                .sas_token
                .map(|token| token.trim_start_matches('?').to_string())
                .filter(|token| !token.is_empty()),
            is_test: config.namespaced_store.is_test,
        };

        let workspace = match config.conversion.workspace {
            Some(path) => Utf8PathBuf::from(path),
            None => default_workspace()?,
        };
        let conversion = ConversionSettings {
            tool: config
                .conversion
                .tool
                .unwrap_or_else(|| "ogr2ogr".to_string()),
            workspace,
        };

        Ok(ResolvedConfig {
            targets,
            catalog,
            primary_store,
            namespaced_store,
            conversion,
            instruction_pdf: Utf8PathBuf::from(
                config
                    .instruction_pdf
                    .unwrap_or_else(|| crate::domain::INSTRUCTION_PDF.to_string()),
            ),
        })
    }
}

fn resolve_target(
    target: BundleTarget,
    entry: BundlerEntry,
    catalog_identifier: String,
    convert: bool,
) -> Result<TargetRequest, BundlerError> {
    let profile = target.profile();
    let sources = entry
        .sources
        .into_iter()
        .map(|source| match source {
            SourceEntry::Shorthand(value) => value.parse(),
            SourceEntry::Detailed(spec) => Ok(spec),
        })
        .collect::<Result<Vec<SourceSpec>, BundlerError>>()?;

    let mut seen = HashSet::new();
    for source in &sources {
        if !profile.requires(&source.name) {
            return Err(BundlerError::InvalidConfig(format!(
                "{target}: unknown source {}",
                source.name
            )));
        }
        if !seen.insert(source.name.as_str()) {
            return Err(BundlerError::InvalidConfig(format!(
                "{target}: source {} configured twice",
                source.name
            )));
        }
    }
    let missing = profile
        .required_sources
        .iter()
        .filter(|name| !seen.contains(**name))
        .map(|name| name.to_string())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(BundlerError::InvalidConfig(format!(
            "{target}: missing sources {}",
            missing.join(", ")
        )));
    }

    let plan = match entry.fetch {
        None | Some(FetchEntry::Parallel) => FetchPlan::Parallel,
        Some(FetchEntry::Groups(groups)) => {
            let listed = groups.iter().map(Vec::len).sum::<usize>();
            let grouped = groups.iter().flatten().collect::<HashSet<_>>();
            if listed != sources.len()
                || grouped.len() != sources.len()
                || sources.iter().any(|source| !grouped.contains(&source.name))
            {
                return Err(BundlerError::InvalidConfig(format!(
                    "{target}: fetch groups must list every source exactly once"
                )));
            }
            FetchPlan::Groups(groups)
        }
    };

    Ok(TargetRequest {
        target,
        sources,
        plan,
        catalog_identifier,
        convert,
    })
}

fn resolve_catalog(config: MetadataCenterConfig) -> Result<CatalogSettings, BundlerError> {
    let base_url = non_empty(config.base_url, "metadata_center.base_url")?;
    let credentials = match (
        config.access_token,
        config.token_endpoint,
        config.client_id,
        config.client_secret,
    ) {
        (_, Some(token_endpoint), Some(client_id), Some(client_secret)) => {
            Credentials::ClientCredentials {
                token_endpoint,
                client_id,
                client_secret,
            }
        }
        (Some(token), _, _, _) => Credentials::Static(token),
        _ => {
            return Err(BundlerError::InvalidConfig(
                "metadata_center needs access_token or token_endpoint/client_id/client_secret"
                    .to_string(),
            ));
        }
    };

    let mut retry = RetryPolicy::default();
    if let Some(entry) = config.retry {
        if let Some(max_attempts) = entry.max_attempts {
            retry.max_attempts = max_attempts.max(1);
        }
        if let Some(delay_secs) = entry.delay_secs {
            retry.delay = Duration::from_secs(delay_secs);
        }
    }

    Ok(CatalogSettings {
        base_url: base_url.trim_end_matches('/').to_string(),
        credentials,
        retry,
    })
}

/// Keys missing from the file fall back to the standard AWS environment variables.
fn resolve_primary_store(
    config: PrimaryStoreConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<PrimaryStoreSettings, BundlerError> {
    let pick = |value: Option<String>, var: &str| {
        value
            .or_else(|| env(var))
            .filter(|value| !value.trim().is_empty())
    };
    let access_key_id = pick(config.access_key_id, "AWS_ACCESS_KEY_ID");
    let secret_access_key = pick(config.secret_access_key, "AWS_SECRET_ACCESS_KEY");
    let (Some(access_key_id), Some(secret_access_key)) = (access_key_id, secret_access_key) else {
        return Err(BundlerError::InvalidConfig(
            "primary_store needs access_key_id and secret_access_key".to_string(),
        ));
    };
    Ok(PrimaryStoreSettings {
        base_url: non_empty(config.base_url, "primary_store.base_url")?,
        bucket: non_empty(config.bucket, "primary_store.bucket")?,
        prefix: normalize_prefix(config.prefix.as_deref().unwrap_or("")),
        region: pick(config.region, "AWS_REGION").unwrap_or_else(|| "eu-west-1".to_string()),
        virtual_host: config.virtual_host,
        credentials: S3Keys {
            access_key_id,
            secret_access_key,
            session_token: pick(config.session_token, "AWS_SESSION_TOKEN"),
        },
    })
}

fn non_empty(value: String, field: &str) -> Result<String, BundlerError> {
    if value.trim().is_empty() {
        return Err(BundlerError::InvalidConfig(format!("{field} is required")));
    }
    Ok(value)
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

fn default_workspace() -> Result<Utf8PathBuf, BundlerError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.cache_dir().join("extract-bundler").join("workspace"))
                .ok()
        })
        .ok_or_else(|| BundlerError::Filesystem("unable to resolve workspace directory".to_string()))
}

fn default_true() -> bool {
    true
}
