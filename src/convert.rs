//! Optional GeoPackage derivation from the namespaced bundle.
//!
//! The namespaced archive is unpacked into a scratch workspace and every layer is
//! written into one container file by sequential `ogr2ogr` invocations. The first
//! invocation creates the container; every later one opens it with
//! `-update -append`, so the file only ever has a single writer.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::domain::{BundleTarget, Bucket};
use crate::error::BundlerError;
use crate::fs_util;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs one external program to completion with fully drained output.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, BundlerError>;
}

#[derive(Debug, Default, Clone)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, BundlerError> {
        cancel.check()?;
        let executable = resolve_program(program)
            .ok_or_else(|| BundlerError::MissingTool(program.to_string()))?;
        let mut child = Command::new(executable)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| BundlerError::ToolFailed {
                program: program.to_string(),
                code: None,
                stdout: String::new(),
                stderr: err.to_string(),
            })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        thread::scope(|scope| {
            // Both pipes are drained concurrently so a chatty child never blocks.
            let stdout = scope.spawn(move || drain(stdout));
            let stderr = scope.spawn(move || drain(stderr));

            let status = loop {
                if cancel.is_cancelled() {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(BundlerError::Cancelled);
                }
                match child.try_wait() {
                    Ok(Some(status)) => break status,
                    Ok(None) => thread::sleep(POLL_INTERVAL),
                    Err(err) => return Err(BundlerError::filesystem(err)),
                }
            };

            Ok(CommandOutput {
                code: status.code(),
                stdout: stdout.join().unwrap_or_default(),
                stderr: stderr.join().unwrap_or_default(),
            })
        })
    }
}

fn drain(pipe: Option<impl Read>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).trim().to_string()
}

fn resolve_program(program: &str) -> Option<PathBuf> {
    let direct = Path::new(program);
    if direct.components().count() > 1 {
        return direct.exists().then(|| direct.to_path_buf());
    }
    find_in_path(program)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

/// Everything one conversion needs once the workspace has been unpacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionJob {
    pub workspace: Utf8PathBuf,
    pub data_root: Utf8PathBuf,
    pub spatial_inputs: Vec<Utf8PathBuf>,
    pub table_inputs: Vec<Utf8PathBuf>,
    pub output: Utf8PathBuf,
}

impl ConversionJob {
    /// Builds the job for an unpacked workspace.
    pub fn discover(workspace: &Utf8Path, container_file: &str) -> Result<Self, BundlerError> {
        let data_root = find_data_root(workspace)?;
        let shapefile_dir = data_root.join(Bucket::Shapefile.dir_name());
        let dbase_dir = data_root.join(Bucket::Dbase.dir_name());

        let spatial_inputs = list_files(&shapefile_dir, |name| name.ends_with(".shp"))?;
        let mut table_inputs = list_files(&shapefile_dir, |name| name.ends_with("_metadata.dbf"))?;
        table_inputs.extend(list_files(&dbase_dir, |name| name.ends_with(".dbf"))?);

        Ok(Self {
            workspace: workspace.to_path_buf(),
            data_root,
            spatial_inputs,
            table_inputs,
            output: workspace.join(container_file),
        })
    }

    /// Argument lists for every layer, in execution order.
    pub fn layer_commands(&self) -> Vec<Vec<String>> {
        let spatial = self.spatial_inputs.iter().map(|input| (input, true));
        let tables = self.table_inputs.iter().map(|input| (input, false));
        spatial
            .chain(tables)
            .enumerate()
            .map(|(index, (input, is_spatial))| {
                let mut args = vec!["-f".to_string(), "GPKG".to_string()];
                if index > 0 {
                    args.push("-update".to_string());
                    args.push("-append".to_string());
                }
                args.push(self.output.to_string());
                args.push(input.to_string());
                args.push("-nln".to_string());
                args.push(input.file_stem().unwrap_or_default().to_string());
                args.push("-nlt".to_string());
                if is_spatial {
                    args.push("PROMOTE_TO_MULTI".to_string());
                    args.push("-lco".to_string());
                    args.push("SPATIAL_INDEX=YES".to_string());
                } else {
                    args.push("NONE".to_string());
                }
                args.push("-oo".to_string());
                args.push("ENCODING=UTF-8".to_string());
                args
            })
            .collect()
    }
}

/// The single directory directly under `workspace` named like `20240101_GRAR_Data`.
pub fn find_data_root(workspace: &Utf8Path) -> Result<Utf8PathBuf, BundlerError> {
    let pattern = Regex::new(r"^\d{8}_.+_Data$").map_err(BundlerError::filesystem)?;
    let mut matches = Vec::new();
    for entry in fs::read_dir(workspace).map_err(BundlerError::filesystem)? {
        let entry = entry.map_err(BundlerError::filesystem)?;
        let is_dir = entry
            .file_type()
            .map_err(BundlerError::filesystem)?
            .is_dir();
        let name = entry.file_name().to_string_lossy().to_string();
        if is_dir && pattern.is_match(&name) {
            matches.push(workspace.join(name));
        }
    }
    match matches.len() {
        1 => Ok(matches.remove(0)),
        found => Err(BundlerError::DataRoot { found }),
    }
}

fn list_files(
    dir: &Utf8Path,
    keep: impl Fn(&str) -> bool,
) -> Result<Vec<Utf8PathBuf>, BundlerError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in dir.read_dir_utf8().map_err(BundlerError::filesystem)? {
        let entry = entry.map_err(BundlerError::filesystem)?;
        if entry.file_type().map_err(BundlerError::filesystem)?.is_file() && keep(entry.file_name())
        {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

pub struct ContainerConverter<R> {
    runner: R,
    tool: String,
    workspace_root: Utf8PathBuf,
}

impl<R: CommandRunner> ContainerConverter<R> {
    pub fn new(runner: R, tool: impl Into<String>, workspace_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            runner,
            tool: tool.into(),
            workspace_root: workspace_root.into(),
        }
    }

    /// Scratch directory of one target; targets never share a workspace.
    pub fn workspace(&self, target: BundleTarget) -> Utf8PathBuf {
        self.workspace_root.join(target.as_str())
    }

    /// Derives the zipped container for `target` from its namespaced archive bytes.
    pub fn convert(
        &self,
        target: BundleTarget,
        namespaced_archive: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, BundlerError> {
        let profile = target.profile();
        let workspace = self.workspace(target);
        fs_util::recreate_dir(workspace.as_std_path())?;

        let mut materialized = NamedTempFile::new().map_err(BundlerError::filesystem)?;
        std::io::Write::write_all(&mut materialized, namespaced_archive)
            .map_err(BundlerError::filesystem)?;
        fs_util::extract_zip(materialized.path(), workspace.as_std_path(), cancel)?;
        drop(materialized);

        let job = ConversionJob::discover(&workspace, profile.container_file)?;
        info!(
            bundle = %target,
            spatial = job.spatial_inputs.len(),
            tables = job.table_inputs.len(),
            "building {}",
            profile.container_file
        );
        for args in job.layer_commands() {
            cancel.check()?;
            debug!(bundle = %target, args = ?args, "running {}", self.tool);
            let output = self
                .runner
                .run(&self.tool, &args, workspace.as_std_path(), cancel)?;
            if !output.success() {
                return Err(BundlerError::ToolFailed {
                    program: self.tool.clone(),
                    code: output.code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                });
            }
        }

        for bucket in [Bucket::Shapefile, Bucket::Dbase] {
            let dir = job.data_root.join(bucket.dir_name());
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(BundlerError::filesystem)?;
            }
        }
        fs_util::zip_directory(workspace.as_std_path(), cancel)
    }
}
