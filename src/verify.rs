use chrono::NaiveDate;
use serde::Serialize;
use tracing::warn;

use crate::domain::BundleTarget;
use crate::error::BundlerError;
use crate::upload::ObjectStore;

#[derive(Debug, Clone, Serialize)]
pub struct VerifyEntry {
    pub target: BundleTarget,
    pub primary_key: String,
    pub primary_exists: bool,
    pub namespaced_key: String,
    pub namespaced_exists: bool,
    /// RFC 3339 modification time reported for the namespaced blob.
    pub namespaced_last_modified: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub date: String,
    pub entries: Vec<VerifyEntry>,
    pub missing: Vec<String>,
}

impl VerifyReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Checks that both published objects of every target exist for `date`.
/// The namespaced key carries no date, so that blob only counts when it was
/// last modified on `date` (UTC).
pub fn verify_extracts(
    targets: &[BundleTarget],
    primary: &dyn ObjectStore,
    namespaced: &dyn ObjectStore,
    date: NaiveDate,
    is_test: bool,
) -> Result<VerifyReport, BundlerError> {
    let mut entries = Vec::with_capacity(targets.len());
    let mut missing = Vec::new();
    for target in targets {
        let profile = target.profile();
        let primary_key = profile.primary_key(date);
        let namespaced_key = profile.namespaced_key(is_test);
        let primary_exists = primary.exists(&primary_key)?;
        let last_modified = namespaced
            .head(&namespaced_key)?
            .and_then(|meta| meta.last_modified);
        let namespaced_exists = last_modified.is_some_and(|modified| modified.date_naive() == date);

        if !primary_exists {
            let message = format!("S3 blob {primary_key} does not exist.");
            warn!(bundle = %target, "{message}");
            missing.push(message);
        }
        if !namespaced_exists {
            let message = format!("Azure blob {namespaced_key} does not exist.");
            warn!(bundle = %target, last_modified = ?last_modified, "{message}");
            missing.push(message);
        }
        entries.push(VerifyEntry {
            target: *target,
            primary_key,
            primary_exists,
            namespaced_key,
            namespaced_exists,
            namespaced_last_modified: last_modified.map(|modified| modified.to_rfc3339()),
        });
    }
    Ok(VerifyReport {
        date: date.format("%Y-%m-%d").to_string(),
        entries,
        missing,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::cancel::CancellationToken;
    use crate::upload::ObjectMeta;

    struct KeySet(HashMap<String, Option<DateTime<Utc>>>);

    impl KeySet {
        fn of(entries: &[(String, Option<DateTime<Utc>>)]) -> Self {
            Self(entries.iter().cloned().collect())
        }
    }

    impl ObjectStore for KeySet {
        fn upload(
            &self,
            _key: &str,
            _content: &[u8],
            _cancel: &CancellationToken,
        ) -> Result<(), BundlerError> {
            Ok(())
        }

        fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BundlerError> {
            Ok(self.0.get(key).map(|last_modified| ObjectMeta {
                last_modified: *last_modified,
            }))
        }
    }

    fn at(year: i32, month: u32, day: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(year, month, day, 7, 0, 0).unwrap())
    }

    #[test]
    fn reports_missing_objects() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let primary = KeySet::of(&[(BundleTarget::Full.profile().primary_key(date), None)]);
        let namespaced = KeySet::of(&[
            ("31086/GRAR.zip".to_string(), at(2024, 3, 5)),
            ("31088/GRAR_Straatnamen.zip".to_string(), at(2024, 3, 5)),
        ]);

        let report = verify_extracts(
            &[BundleTarget::Full, BundleTarget::StreetName],
            &primary,
            &namespaced,
            date,
            true,
        )
        .unwrap();

        assert!(!report.is_complete());
        assert_eq!(
            report.missing,
            vec![
                "S3 blob 20240305-Downloadbestand-Gebouwen-Adressenregister_straatnamen.zip does not exist."
                    .to_string()
            ]
        );
        assert!(report.entries[0].primary_exists && report.entries[0].namespaced_exists);
    }

    #[test]
    fn stale_namespaced_blob_counts_as_missing() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let primary = KeySet::of(&[]);
        let namespaced = KeySet::of(&[("10145/GRAR_Adressen.zip".to_string(), at(2024, 1, 1))]);

        let report =
            verify_extracts(&[BundleTarget::Address], &primary, &namespaced, date, false).unwrap();

        assert_eq!(
            report.missing,
            vec![
                "S3 blob 20240601-Downloadbestand-Gebouwen-Adressenregister_adressen.zip does not exist."
                    .to_string(),
                "Azure blob 10145/GRAR_Adressen.zip does not exist.".to_string(),
            ]
        );
        assert_eq!(
            report.entries[0].namespaced_last_modified.as_deref(),
            Some("2024-01-01T07:00:00+00:00")
        );
    }

    #[test]
    fn namespaced_blob_without_modification_time_is_not_trusted() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let primary = KeySet::of(&[(BundleTarget::Address.profile().primary_key(date), None)]);
        let namespaced = KeySet::of(&[("10145/GRAR_Adressen.zip".to_string(), None)]);

        let report =
            verify_extracts(&[BundleTarget::Address], &primary, &namespaced, date, false).unwrap();

        assert_eq!(
            report.missing,
            vec!["Azure blob 10145/GRAR_Adressen.zip does not exist.".to_string()]
        );
    }
}
