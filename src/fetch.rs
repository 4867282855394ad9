use std::io::Read;
use std::sync::mpsc::SyncSender;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::domain::SourceSpec;
use crate::error::BundlerError;

const READ_BUFFER: usize = 8192;
const PROGRESS_EVERY_READS: u64 = 1000;
/// Upper bound on the buffer reserved up front from an advertised length.
pub const MAX_PREALLOCATION: usize = 64 * 1024 * 1024;

/// How the sources of one bundle are scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchPlan {
    Parallel,
    /// Each group is fetched in parallel; a group starts once the previous one finished.
    Groups(Vec<Vec<String>>),
}

impl FetchPlan {
    pub fn groups<'a>(&self, sources: &'a [SourceSpec]) -> Vec<Vec<&'a SourceSpec>> {
        match self {
            FetchPlan::Parallel => vec![sources.iter().collect()],
            FetchPlan::Groups(groups) => groups
                .iter()
                .map(|names| {
                    names
                        .iter()
                        .filter_map(|name| sources.iter().find(|source| &source.name == name))
                        .collect::<Vec<_>>()
                })
                .filter(|group| !group.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug)]
pub enum SourceEvent {
    Ready { name: String, bytes: Vec<u8> },
    Failed { name: String, error: BundlerError },
}

pub trait SourceFetcher: Send + Sync {
    fn fetch(
        &self,
        source: &SourceSpec,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, BundlerError>;
}

#[derive(Clone)]
pub struct HttpSourceFetcher {
    client: Client,
}

impl HttpSourceFetcher {
    pub fn new() -> Result<Self, BundlerError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("extract-bundler/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| BundlerError::InvalidConfig(err.to_string()))?,
        );
        // Extracts are large; only the connect phase is bounded.
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Option::<Duration>::None)
            .build()
            .map_err(|err| BundlerError::SourceHttp {
                source_name: "client".to_string(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }
}

impl SourceFetcher for HttpSourceFetcher {
    fn fetch(
        &self,
        source: &SourceSpec,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, BundlerError> {
        cancel.check()?;
        let mut response =
            self.client
                .get(&source.url)
                .send()
                .map_err(|err| BundlerError::SourceHttp {
                    source_name: source.name.clone(),
                    message: err.to_string(),
                })?;
        if !response.status().is_success() {
            return Err(BundlerError::SourceStatus {
                source_name: source.name.clone(),
                status: response.status().as_u16(),
            });
        }

        let mut body = Vec::with_capacity(initial_capacity(response.content_length()));
        let mut buffer = [0u8; READ_BUFFER];
        let mut reads = 0u64;
        loop {
            cancel.check()?;
            let read = response
                .read(&mut buffer)
                .map_err(|err| BundlerError::SourceHttp {
                    source_name: source.name.clone(),
                    message: err.to_string(),
                })?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&buffer[..read]);
            reads += 1;
            if reads % PROGRESS_EVERY_READS == 0 {
                info!(source = %source.name, downloaded = %format_bytes(body.len() as u64), "download progress");
            }
        }
        info!(source = %source.name, size = %format_bytes(body.len() as u64), "download complete");
        Ok(body)
    }
}

/// Fetches every source according to `plan`, reporting each outcome on `sender`.
/// A failed source never stops its siblings. Returns once every fetch finished.
pub fn fetch_all<F: SourceFetcher + ?Sized>(
    fetcher: &F,
    sources: &[SourceSpec],
    plan: &FetchPlan,
    cancel: &CancellationToken,
    sender: SyncSender<SourceEvent>,
) {
    for group in plan.groups(sources) {
        if cancel.is_cancelled() {
            break;
        }
        thread::scope(|scope| {
            for source in group {
                let sender = sender.clone();
                scope.spawn(move || {
                    let event = match fetcher.fetch(source, cancel) {
                        Ok(bytes) => SourceEvent::Ready {
                            name: source.name.clone(),
                            bytes,
                        },
                        Err(error) => {
                            warn!(source = %source.name, url = %source.url, %error, "source download failed");
                            SourceEvent::Failed {
                                name: source.name.clone(),
                                error,
                            }
                        }
                    };
                    // The receiver only disappears when the run is being torn down.
                    let _ = sender.send(event);
                });
            }
        });
    }
}

/// Capacity to reserve for a body of `advertised` bytes. The header is not
/// trusted beyond [`MAX_PREALLOCATION`]; the buffer grows past it as data arrives.
pub fn initial_capacity(advertised: Option<u64>) -> usize {
    advertised
        .map(|len| len.min(MAX_PREALLOCATION as u64) as usize)
        .unwrap_or(0)
}

pub fn format_bytes(size: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if size < 1024 {
        return format!("{size} B");
    }
    let mut value = size as f64 / 1024.0;
    for unit in &UNITS[..UNITS.len() - 1] {
        if value < 1024.0 {
            return format!("{value:.2} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.2} {}", UNITS[UNITS.len() - 1])
}
