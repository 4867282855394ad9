use std::io::{self, Write};

use serde::Serialize;

use crate::app::{BundleResult, ProgressEvent, ProgressSink};
use crate::domain::BundleTarget;
use crate::verify::VerifyReport;

#[derive(Debug, Clone, Serialize)]
pub struct TargetRow {
    pub target: BundleTarget,
    pub label: &'static str,
    pub required_sources: Vec<&'static str>,
    pub namespaced_zip: &'static str,
    pub container_zip: &'static str,
    pub catalog_prefix_test: &'static str,
    pub catalog_prefix_production: &'static str,
}

impl From<BundleTarget> for TargetRow {
    fn from(target: BundleTarget) -> Self {
        let profile = target.profile();
        Self {
            target,
            label: profile.label,
            required_sources: profile.required_sources.to_vec(),
            namespaced_zip: profile.namespaced_zip,
            container_zip: profile.container_zip,
            catalog_prefix_test: profile.catalog_prefix_test,
            catalog_prefix_production: profile.catalog_prefix_production,
        }
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_results(results: &[BundleResult]) -> io::Result<()> {
        Self::print_json(&results)
    }

    pub fn print_verify(report: &VerifyReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_targets(rows: &[TargetRow]) -> io::Result<()> {
        Self::print_json(&rows)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}
