use std::collections::HashSet;
use std::fs;
use std::sync::mpsc::sync_channel;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use chrono::{Local, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::catalog::MetadataCatalog;
use crate::config::TargetRequest;
use crate::convert::{CommandRunner, ContainerConverter};
use crate::domain::{BundleTarget, INSTRUCTION_PDF, TargetProfile};
use crate::error::BundlerError;
use crate::fetch::{SourceEvent, SourceFetcher, fetch_all, format_bytes};
use crate::merge::{DestinationArchive, Layout, MergeTracker, merge_into};
use crate::upload::ObjectStore;

/// Pipeline step a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Merge,
    PrimaryUpload,
    Metadata,
    NamespacedUpload,
    Conversion,
    ContainerUpload,
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleFailure {
    pub stage: Stage,
    pub message: String,
    #[serde(skip)]
    pub exit_code: u8,
}

impl BundleFailure {
    fn new(stage: Stage, err: &BundlerError) -> Self {
        Self {
            stage,
            message: err.to_string(),
            exit_code: err.exit_code(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleResult {
    pub target: BundleTarget,
    pub success: bool,
    pub artifacts_uploaded: Vec<String>,
    pub errors: Vec<BundleFailure>,
    pub warnings: Vec<BundleFailure>,
}

impl BundleResult {
    fn new(target: BundleTarget) -> Self {
        Self {
            target,
            success: true,
            artifacts_uploaded: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn fail(&mut self, stage: Stage, err: &BundlerError) {
        error!(bundle = %self.target, stage = ?stage, %err, "bundle step failed");
        self.success = false;
        self.errors.push(BundleFailure::new(stage, err));
    }

    fn warn(&mut self, stage: Stage, err: &BundlerError) {
        warn!(bundle = %self.target, stage = ?stage, %err, "optional bundle step failed");
        self.warnings.push(BundleFailure::new(stage, err));
    }

    /// Highest-priority exit code among the recorded errors.
    pub fn exit_code(&self) -> u8 {
        self.errors
            .iter()
            .map(|failure| failure.exit_code)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub target: BundleTarget,
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub struct BundlerSettings {
    pub instruction_pdf: Utf8PathBuf,
    pub is_test: bool,
}

/// Runs bundle pipelines against the given fetcher, catalog and stores.
pub struct Bundler<F, C, P, N, R> {
    fetcher: F,
    catalog: C,
    primary: P,
    namespaced: N,
    converter: ContainerConverter<R>,
    settings: BundlerSettings,
    date: Option<NaiveDate>,
}

impl<F, C, P, N, R> Bundler<F, C, P, N, R>
where
    F: SourceFetcher,
    C: MetadataCatalog,
    P: ObjectStore,
    N: ObjectStore,
    R: CommandRunner,
{
    pub fn new(
        fetcher: F,
        catalog: C,
        primary: P,
        namespaced: N,
        converter: ContainerConverter<R>,
        settings: BundlerSettings,
    ) -> Self {
        Self {
            fetcher,
            catalog,
            primary,
            namespaced,
            converter,
            settings,
            date: None,
        }
    }

    /// Pins the date embedded in artifact names instead of using today.
    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn primary_store(&self) -> &P {
        &self.primary
    }

    pub fn namespaced_store(&self) -> &N {
        &self.namespaced
    }

    fn date(&self) -> NaiveDate {
        self.date.unwrap_or_else(|| Local::now().date_naive())
    }

    /// Runs every request concurrently; targets share no state.
    pub fn run_all(
        &self,
        requests: &[TargetRequest],
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Vec<BundleResult> {
        thread::scope(|scope| {
            let handles = requests
                .iter()
                .map(|request| {
                    (
                        request.target,
                        scope.spawn(move || self.run_bundle(request, sink, cancel)),
                    )
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|(target, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        let mut result = BundleResult::new(target);
                        result.fail(
                            Stage::Merge,
                            &BundlerError::Archive("bundle pipeline panicked".to_string()),
                        );
                        result
                    })
                })
                .collect()
        })
    }

    pub fn run_bundle(
        &self,
        request: &TargetRequest,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> BundleResult {
        let target = request.target;
        let profile = target.profile();
        let date = self.date();
        let start = Instant::now();
        let mut result = BundleResult::new(target);

        let flat = DestinationArchive::new(profile.primary_key(date), Layout::Flat);
        let namespaced = DestinationArchive::new(
            profile.namespaced_zip,
            Layout::Namespaced {
                root_dir: profile.root_dir(date),
            },
        );
        let tracker = MergeTracker::new(profile.required_sources.len());
        let mut merged = HashSet::new();
        let mut finalize = false;
        let mut merge_failed = false;

        sink.event(ProgressEvent {
            target,
            message: format!("phase=Fetch; {} sources", request.sources.len()),
            elapsed: None,
        });

        let (sender, receiver) = sync_channel::<SourceEvent>(1);
        thread::scope(|scope| {
            scope.spawn(move || {
                fetch_all(&self.fetcher, &request.sources, &request.plan, cancel, sender)
            });

            for event in receiver {
                match event {
                    SourceEvent::Ready { name, bytes } => {
                        if !profile.requires(&name) || merged.contains(&name) {
                            warn!(bundle = %target, source = %name, "ignoring unexpected source");
                            continue;
                        }
                        // The archives are already unusable; keep draining so fetchers finish.
                        if merge_failed {
                            debug!(bundle = %target, source = %name, "skipping merge after earlier failure");
                            continue;
                        }
                        match merge_into(&bytes, &[&flat, &namespaced], cancel) {
                            Ok(entries) => {
                                info!(bundle = %target, source = %name, entries, bytes = %format_bytes(bytes.len() as u64), "source merged");
                                sink.event(ProgressEvent {
                                    target,
                                    message: format!("phase=Merge; {name} ({entries} entries)"),
                                    elapsed: Some(start.elapsed()),
                                });
                                merged.insert(name);
                                if tracker.record_merged() {
                                    finalize = true;
                                }
                            }
                            Err(err) => {
                                merge_failed = true;
                                result.fail(Stage::Merge, &err);
                            }
                        }
                    }
                    SourceEvent::Failed { error, .. } => result.fail(Stage::Fetch, &error),
                }
            }
        });

        if !finalize {
            if cancel.is_cancelled() {
                result.fail(Stage::Fetch, &BundlerError::Cancelled);
            }
            let missing = profile
                .required_sources
                .iter()
                .filter(|name| !merged.contains(**name))
                .map(|name| name.to_string())
                .collect::<Vec<_>>();
            result.fail(Stage::Fetch, &BundlerError::IncompleteSources { missing });
            return result;
        }

        self.finalize(request, profile, date, flat, namespaced, sink, cancel, &mut result);
        if result.success {
            info!(bundle = %target, elapsed_ms = start.elapsed().as_millis() as u64, "{}", profile.done_message());
        }
        sink.event(ProgressEvent {
            target,
            message: format!("phase=Done; success={}", result.success),
            elapsed: Some(start.elapsed()),
        });
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        request: &TargetRequest,
        profile: &TargetProfile,
        date: NaiveDate,
        flat: DestinationArchive,
        namespaced: DestinationArchive,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
        result: &mut BundleResult,
    ) {
        let target = request.target;

        sink.event(ProgressEvent {
            target,
            message: "phase=Upload; primary archive".to_string(),
            elapsed: None,
        });
        let primary_key = profile.primary_key(date);
        match flat
            .finish()
            .and_then(|bytes| self.primary.upload(&primary_key, &bytes, cancel))
        {
            Ok(()) => result.artifacts_uploaded.push(primary_key),
            Err(err) => result.fail(Stage::PrimaryUpload, &err),
        }

        sink.event(ProgressEvent {
            target,
            message: "phase=Metadata; publishing".to_string(),
            elapsed: None,
        });
        if let Err(err) = self.attach_metadata(request, profile, &namespaced, cancel) {
            error!(bundle = %target, "{}", profile.metadata_failed_message());
            result.fail(Stage::Metadata, &err);
            return;
        }

        sink.event(ProgressEvent {
            target,
            message: "phase=Upload; namespaced archive".to_string(),
            elapsed: None,
        });
        let namespaced_key = profile.namespaced_key(self.settings.is_test);
        let namespaced_bytes = match namespaced.finish() {
            Ok(bytes) => bytes,
            Err(err) => {
                result.fail(Stage::NamespacedUpload, &err);
                return;
            }
        };
        match self
            .namespaced
            .upload(&namespaced_key, &namespaced_bytes, cancel)
        {
            Ok(()) => result.artifacts_uploaded.push(namespaced_key),
            Err(err) => {
                result.fail(Stage::NamespacedUpload, &err);
                return;
            }
        }

        if !request.convert {
            return;
        }
        sink.event(ProgressEvent {
            target,
            message: format!("phase=Convert; {}", profile.container_file),
            elapsed: None,
        });
        let container = match self.converter.convert(target, &namespaced_bytes, cancel) {
            Ok(container) => container,
            Err(err) => {
                result.warn(Stage::Conversion, &err);
                return;
            }
        };
        let container_key = profile.container_key(self.settings.is_test);
        match self.namespaced.upload(&container_key, &container, cancel) {
            Ok(()) => result.artifacts_uploaded.push(container_key),
            Err(err) => result.fail(Stage::ContainerUpload, &err),
        }
    }

    /// Publishes the catalog timestamp and adds the three documents to `namespaced`.
    fn attach_metadata(
        &self,
        request: &TargetRequest,
        profile: &TargetProfile,
        namespaced: &DestinationArchive,
        cancel: &CancellationToken,
    ) -> Result<(), BundlerError> {
        let identifier = request.catalog_identifier.as_str();
        self.catalog
            .publish(identifier, Utc::now(), cancel)?
            .ok_or_else(|| {
                BundlerError::Authentication("unable to retrieve XSRF-TOKEN".to_string())
            })?;
        info!(bundle = %request.target, "{}", profile.metadata_updated_message());

        let pdf = self.catalog.fetch_pdf(identifier, cancel)?;
        let xml = self.catalog.fetch_xml(identifier, cancel)?;
        let instruction = fs::read(&self.settings.instruction_pdf).map_err(|err| {
            BundlerError::Filesystem(format!("read {}: {err}", self.settings.instruction_pdf))
        })?;

        namespaced.add_content(profile.metadata_xml, xml.as_bytes())?;
        namespaced.add_content(profile.metadata_pdf, &pdf)?;
        namespaced.add_content(INSTRUCTION_PDF, &instruction)?;
        Ok(())
    }
}
