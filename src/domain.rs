use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::BundlerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BundleTarget {
    Full,
    StreetName,
    Address,
    AddressLinks,
}

impl BundleTarget {
    pub const ALL: [BundleTarget; 4] = [
        BundleTarget::Full,
        BundleTarget::StreetName,
        BundleTarget::Address,
        BundleTarget::AddressLinks,
    ];

    pub fn profile(self) -> &'static TargetProfile {
        match self {
            BundleTarget::Full => &FULL,
            BundleTarget::StreetName => &STREET_NAME,
            BundleTarget::Address => &ADDRESS,
            BundleTarget::AddressLinks => &ADDRESS_LINKS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BundleTarget::Full => "full",
            BundleTarget::StreetName => "street_name",
            BundleTarget::Address => "address",
            BundleTarget::AddressLinks => "address_links",
        }
    }
}

impl fmt::Display for BundleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BundleTarget {
    type Err = BundlerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "full" => Ok(BundleTarget::Full),
            "street_name" | "streetname" => Ok(BundleTarget::StreetName),
            "address" => Ok(BundleTarget::Address),
            "address_links" | "addresslinks" => Ok(BundleTarget::AddressLinks),
            _ => Err(BundlerError::InvalidTarget(value.to_string())),
        }
    }
}

/// Static description of one distributable bundle: which sources it needs and
/// how every artifact it produces is named.
#[derive(Debug)]
pub struct TargetProfile {
    pub label: &'static str,
    pub required_sources: &'static [&'static str],
    pub primary_key_suffix: &'static str,
    pub namespaced_zip: &'static str,
    pub root_dir_suffix: &'static str,
    pub container_file: &'static str,
    pub container_zip: &'static str,
    pub metadata_xml: &'static str,
    pub metadata_pdf: &'static str,
    pub catalog_prefix_test: &'static str,
    pub catalog_prefix_production: &'static str,
}

pub const INSTRUCTION_PDF: &str = "HandleidingZipPakketten.pdf";

const FULL: TargetProfile = TargetProfile {
    label: "Full",
    required_sources: &[
        "AddressRegistry_Extract",
        "AddressRegistry_Crab",
        "BuildingRegistry_Extract",
        "BuildingRegistry_Links",
        "MunicipalityRegistry_Extract",
        "ParcelRegistry_Extract",
        "ParcelRegistry_Links",
        "PostalRegistry_Extract",
        "StreetNameRegistry_Extract",
    ],
    primary_key_suffix: "",
    namespaced_zip: "GRAR.zip",
    root_dir_suffix: "GRAR_Data",
    container_file: "GRAR.gpkg",
    container_zip: "GRAR_Gpkg.zip",
    metadata_xml: "Meta_GRAR.xml",
    metadata_pdf: "Meta_GRAR.pdf",
    catalog_prefix_test: "31086",
    catalog_prefix_production: "10142",
};

const STREET_NAME: TargetProfile = TargetProfile {
    label: "StreetName",
    required_sources: &[
        "MunicipalityRegistry_Extract",
        "PostalRegistry_Extract",
        "StreetNameRegistry_Extract",
    ],
    primary_key_suffix: "_straatnamen",
    namespaced_zip: "GRAR_Straatnamen.zip",
    root_dir_suffix: "GRAR_Straatnamen_Data",
    container_file: "GRAR_Straatnamen.gpkg",
    container_zip: "GRAR_Straatnamen_Gpkg.zip",
    metadata_xml: "Meta_GRARStraatnamen.xml",
    metadata_pdf: "Meta_GRARStraatnamen.pdf",
    catalog_prefix_test: "31088",
    catalog_prefix_production: "10143",
};

const ADDRESS: TargetProfile = TargetProfile {
    label: "Address",
    required_sources: &["AddressRegistry_Extract"],
    primary_key_suffix: "_adressen",
    namespaced_zip: "GRAR_Adressen.zip",
    root_dir_suffix: "GRAR_Adressen_Data",
    container_file: "GRAR_Adressen.gpkg",
    container_zip: "GRAR_Adressen_Gpkg.zip",
    metadata_xml: "Meta_GRARAdressen.xml",
    metadata_pdf: "Meta_GRARAdressen.pdf",
    catalog_prefix_test: "31087",
    catalog_prefix_production: "10145",
};

const ADDRESS_LINKS: TargetProfile = TargetProfile {
    label: "AddressLinks",
    required_sources: &[
        "AddressRegistry_Extract",
        "BuildingRegistry_Links",
        "ParcelRegistry_Links",
    ],
    primary_key_suffix: "_adreskoppelingen",
    namespaced_zip: "GRAR_Adreskoppelingen.zip",
    root_dir_suffix: "GRAR_Adreskoppelingen_Data",
    container_file: "GRAR_Adreskoppelingen.gpkg",
    container_zip: "GRAR_Adreskoppelingen_Gpkg.zip",
    metadata_xml: "Meta_GRARAdreskoppelingen.xml",
    metadata_pdf: "Meta_GRARAdreskoppelingen.pdf",
    catalog_prefix_test: "31089",
    catalog_prefix_production: "10144",
};

impl TargetProfile {
    pub fn primary_key(&self, date: NaiveDate) -> String {
        format!(
            "{}-Downloadbestand-Gebouwen-Adressenregister{}.zip",
            date_stamp(date),
            self.primary_key_suffix
        )
    }

    pub fn root_dir(&self, date: NaiveDate) -> String {
        format!("{}_{}", date_stamp(date), self.root_dir_suffix)
    }

    pub fn catalog_prefix(&self, is_test: bool) -> &'static str {
        if is_test {
            self.catalog_prefix_test
        } else {
            self.catalog_prefix_production
        }
    }

    pub fn namespaced_key(&self, is_test: bool) -> String {
        format!("{}/{}", self.catalog_prefix(is_test), self.namespaced_zip)
    }

    pub fn container_key(&self, is_test: bool) -> String {
        format!("{}/{}", self.catalog_prefix(is_test), self.container_zip)
    }

    pub fn done_message(&self) -> String {
        format!("{} extract DONE.", self.label)
    }

    pub fn metadata_updated_message(&self) -> String {
        format!("Metadata Updated for {} extract.", self.label)
    }

    pub fn metadata_failed_message(&self) -> String {
        format!("Failed Update Metadata Center for {} extract.", self.label)
    }

    pub fn requires(&self, source_name: &str) -> bool {
        self.required_sources.contains(&source_name)
    }
}

pub fn date_stamp(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    pub url: String,
}

impl FromStr for SourceSpec {
    type Err = BundlerError;

    /// Parses the `name=url` shorthand used in config files.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (name, url) = value
            .split_once('=')
            .map(|(name, url)| (name.trim(), url.trim()))
            .filter(|(name, url)| !name.is_empty() && !url.is_empty())
            .ok_or_else(|| BundlerError::InvalidConfig(format!("invalid source: {value}")))?;
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
        })
    }
}

/// Subdirectory of the namespaced layout an entry is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Shapefile,
    Dbase,
}

impl Bucket {
    pub fn dir_name(self) -> &'static str {
        match self {
            Bucket::Shapefile => "Shapefile",
            Bucket::Dbase => "dBASE",
        }
    }
}

const SHAPEFILE_TABLES: &[&str] = &[
    "Adres.dbf",
    "Gebouw.dbf",
    "Gebouweenheid.dbf",
    "Adres_metadata.dbf",
    "Gebouw_metadata.dbf",
    "Gebouweenheid_metadata.dbf",
];

pub fn classify_entry(name: &str) -> Bucket {
    let spatial = name.ends_with(".prj")
        || name.ends_with(".shp")
        || name.ends_with(".shx")
        || SHAPEFILE_TABLES.contains(&name);
    if spatial {
        Bucket::Shapefile
    } else {
        Bucket::Dbase
    }
}

pub fn rewrite_entry_name(root_dir: &str, name: &str) -> String {
    format!("{root_dir}/{}/{name}", classify_entry(name).dir_name())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    #[test]
    fn rewrite_rule() {
        let root = STREET_NAME.root_dir(day());
        assert_eq!(root, "20240101_GRAR_Straatnamen_Data");
        assert_eq!(
            rewrite_entry_name(&root, "Adres.shp"),
            "20240101_GRAR_Straatnamen_Data/Shapefile/Adres.shp"
        );
        assert_eq!(
            rewrite_entry_name(&root, "CrabHuisnummer.dbf"),
            "20240101_GRAR_Straatnamen_Data/dBASE/CrabHuisnummer.dbf"
        );
        assert_eq!(
            rewrite_entry_name(&root, "Gebouw_metadata.dbf"),
            "20240101_GRAR_Straatnamen_Data/Shapefile/Gebouw_metadata.dbf"
        );
        assert_eq!(
            rewrite_entry_name(&root, "Adres.shp"),
            rewrite_entry_name(&root, "Adres.shp")
        );
    }

    #[test]
    fn classify_only_exact_base_tables() {
        assert_eq!(classify_entry("Adres.dbf"), Bucket::Shapefile);
        assert_eq!(classify_entry("Gebouw.prj"), Bucket::Shapefile);
        assert_eq!(classify_entry("AdresPerceelKoppelingen.dbf"), Bucket::Dbase);
        assert_eq!(classify_entry("Straatnaam_metadata.dbf"), Bucket::Dbase);
    }

    #[test]
    fn artifact_names() {
        assert_eq!(
            FULL.primary_key(day()),
            "20240101-Downloadbestand-Gebouwen-Adressenregister.zip"
        );
        assert_eq!(
            ADDRESS_LINKS.primary_key(day()),
            "20240101-Downloadbestand-Gebouwen-Adressenregister_adreskoppelingen.zip"
        );
        assert_eq!(FULL.namespaced_key(true), "31086/GRAR.zip");
        assert_eq!(ADDRESS.namespaced_key(false), "10145/GRAR_Adressen.zip");
        assert_eq!(
            STREET_NAME.container_key(false),
            "10143/GRAR_Straatnamen_Gpkg.zip"
        );
        assert_eq!(STREET_NAME.done_message(), "StreetName extract DONE.");
    }

    #[test]
    fn parse_target_and_source() {
        assert_eq!(
            "street-name".parse::<BundleTarget>().unwrap(),
            BundleTarget::StreetName
        );
        assert_matches!(
            "parcel".parse::<BundleTarget>(),
            Err(BundlerError::InvalidTarget(_))
        );
        let source: SourceSpec = "PostalRegistry_Extract = https://example.test/postal.zip"
            .parse()
            .unwrap();
        assert_eq!(source.name, "PostalRegistry_Extract");
        assert_eq!(source.url, "https://example.test/postal.zip");
        assert_matches!(
            "no-url".parse::<SourceSpec>(),
            Err(BundlerError::InvalidConfig(_))
        );
    }
}
