//! Streaming merge of source archives into the flat and namespaced destination zips.

use std::collections::HashSet;
use std::io::{self, Cursor, Read, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::cancel::{CancellableReader, CancellationToken};
use crate::domain::rewrite_entry_name;
use crate::error::BundlerError;
use crate::fetch::initial_capacity;

/// Naming rule applied to every entry copied into a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// Source entry names are kept verbatim.
    Flat,
    /// Entries are filed under `{root_dir}/{Shapefile|dBASE}/{name}`.
    Namespaced { root_dir: String },
}

impl Layout {
    pub fn entry_name(&self, original: &str) -> String {
        match self {
            Layout::Flat => original.to_string(),
            Layout::Namespaced { root_dir } => rewrite_entry_name(root_dir, original),
        }
    }
}

struct ArchiveState {
    writer: Option<ZipWriter<Cursor<Vec<u8>>>>,
    entries: HashSet<String>,
}

/// In-memory zip being assembled for one destination. All writes go through a
/// single lock which is held for the full duration of each entry copy.
pub struct DestinationArchive {
    name: String,
    layout: Layout,
    state: Mutex<ArchiveState>,
}

impl DestinationArchive {
    pub fn new(name: impl Into<String>, layout: Layout) -> Self {
        Self {
            name: name.into(),
            layout,
            state: Mutex::new(ArchiveState {
                writer: Some(ZipWriter::new(Cursor::new(Vec::new()))),
                entries: HashSet::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Copies `reader` into a new entry named by this archive's layout.
    pub fn copy_entry(
        &self,
        original_name: &str,
        size_hint: u64,
        reader: &mut dyn Read,
        cancel: &CancellationToken,
    ) -> Result<(), BundlerError> {
        let entry_name = self.layout.entry_name(original_name);
        let mut reader = CancellableReader::new(reader, cancel);
        self.write_entry(entry_name, size_hint, &mut reader)
            .map_err(|err| match cancel.check() {
                Err(cancelled) => cancelled,
                Ok(()) => err,
            })
    }

    /// Adds `content` under `name` verbatim, bypassing the layout rule.
    pub fn add_content(&self, name: &str, content: &[u8]) -> Result<(), BundlerError> {
        let mut reader = content;
        self.write_entry(name.to_string(), content.len() as u64, &mut reader)
    }

    /// Adds an empty directory entry named by this archive's layout.
    pub fn copy_directory(&self, original_name: &str) -> Result<(), BundlerError> {
        let mut entry_name = self.layout.entry_name(original_name);
        if !entry_name.ends_with('/') {
            entry_name.push('/');
        }
        self.with_writer(entry_name, |writer, name| {
            writer
                .add_directory(name, entry_options(0))
                .map_err(BundlerError::archive)
        })
    }

    fn write_entry(
        &self,
        entry_name: String,
        size_hint: u64,
        reader: &mut dyn Read,
    ) -> Result<(), BundlerError> {
        self.with_writer(entry_name, |writer, name| {
            writer
                .start_file(name, entry_options(size_hint))
                .map_err(BundlerError::archive)?;
            io::copy(reader, writer).map_err(BundlerError::archive)?;
            writer.flush().map_err(BundlerError::archive)
        })
    }

    /// Claims `entry_name` and runs `write` with the lock held.
    fn with_writer<W>(&self, entry_name: String, write: W) -> Result<(), BundlerError>
    where
        W: FnOnce(&mut ZipWriter<Cursor<Vec<u8>>>, &str) -> Result<(), BundlerError>,
    {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BundlerError::Archive(format!("{} lock poisoned", self.name)))?;
        let ArchiveState { writer, entries } = &mut *state;
        let writer = writer
            .as_mut()
            .ok_or_else(|| BundlerError::Archive(format!("{} is already finished", self.name)))?;
        if !entries.insert(entry_name.clone()) {
            return Err(BundlerError::DuplicateEntry {
                archive: self.name.clone(),
                entry: entry_name,
            });
        }

        write(writer, &entry_name)?;
        debug!(archive = %self.name, entry = %entry_name, "ADD");
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.entries.len())
            .unwrap_or_default()
    }

    /// Writes the central directory and returns the archive bytes.
    pub fn finish(self) -> Result<Vec<u8>, BundlerError> {
        let state = self
            .state
            .into_inner()
            .map_err(|_| BundlerError::Archive(format!("{} lock poisoned", self.name)))?;
        let writer = state
            .writer
            .ok_or_else(|| BundlerError::Archive(format!("{} is already finished", self.name)))?;
        let cursor = writer.finish().map_err(BundlerError::archive)?;
        Ok(cursor.into_inner())
    }
}

fn entry_options(size_hint: u64) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(1))
        .large_file(size_hint >= u32::MAX as u64)
}

/// Copies every entry of `source`, directories included, into each of
/// `destinations`. Returns the number of source entries merged.
pub fn merge_into(
    source: &[u8],
    destinations: &[&DestinationArchive],
    cancel: &CancellationToken,
) -> Result<usize, BundlerError> {
    let mut archive = ZipArchive::new(Cursor::new(source)).map_err(BundlerError::archive)?;
    let mut merged = 0usize;
    for index in 0..archive.len() {
        let (name, size, is_dir) = {
            let entry = archive.by_index(index).map_err(BundlerError::archive)?;
            (entry.name().to_string(), entry.size(), entry.is_dir())
        };
        if is_dir {
            for destination in destinations {
                cancel.check()?;
                destination.copy_directory(&name)?;
            }
            merged += 1;
            continue;
        }
        // A zip entry reader is single-pass; reopen it for every destination.
        for destination in destinations {
            cancel.check()?;
            let mut entry = archive.by_index(index).map_err(BundlerError::archive)?;
            destination.copy_entry(&name, size, &mut entry, cancel)?;
        }
        merged += 1;
    }
    Ok(merged)
}

/// Counts merged sources and hands out the finalize step exactly once.
#[derive(Debug)]
pub struct MergeTracker {
    required: usize,
    merged: AtomicUsize,
    finalized: AtomicBool,
}

impl MergeTracker {
    pub fn new(required: usize) -> Self {
        Self {
            required,
            merged: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
        }
    }

    /// Records one merged source. Returns true for the single caller whose
    /// increment brings the count to the required total.
    pub fn record_merged(&self) -> bool {
        let merged = self.merged.fetch_add(1, Ordering::AcqRel) + 1;
        merged == self.required
            && self
                .finalized
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub fn merged(&self) -> usize {
        self.merged.load(Ordering::Acquire)
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }
}

pub fn list_entries(archive: &[u8]) -> Result<Vec<String>, BundlerError> {
    let archive = ZipArchive::new(Cursor::new(archive)).map_err(BundlerError::archive)?;
    Ok(archive.file_names().map(|name| name.to_string()).collect())
}

pub fn read_entry(archive: &[u8], name: &str) -> Result<Vec<u8>, BundlerError> {
    let mut archive = ZipArchive::new(Cursor::new(archive)).map_err(BundlerError::archive)?;
    let mut entry = archive.by_name(name).map_err(BundlerError::archive)?;
    let mut content = Vec::with_capacity(initial_capacity(Some(entry.size())));
    entry
        .read_to_end(&mut content)
        .map_err(BundlerError::archive)?;
    Ok(content)
}
