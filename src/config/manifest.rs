//! Installer manifests
//!
//! A manifest file holds one or more YAML documents of the form
//!
//! ```yaml
//! apiVersion: app.adi.io/v1alpha1
//! kind: ADCM
//! metadata:
//!   name: main
//!   namespace: prod
//!   annotations:
//!     app.adi.io/depends-on: postgres.main
//! spec: {}
//! ```

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::kind::ManagedKind;
use crate::domain::naming;
use crate::error::ConfigError;

/// Comma separated `kind.name` references to services this object waits for
pub const DEPENDS_ON_ANNOTATION: &str = "app.adi.io/depends-on";

/// Database name override for an object that owns one
pub const DATABASE_ANNOTATION: &str = "app.adi.io/database";

/// Extra project network to join
pub const NETWORK_ANNOTATION: &str = "app.adi.io/network";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Parsed `depends-on` references
    pub fn dependencies(&self) -> Result<Vec<ObjectRef>, ConfigError> {
        self.annotation(DEPENDS_ON_ANNOTATION)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(ObjectRef::parse)
                    .collect()
            })
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// A `kind.name` reference to another managed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub kind: ManagedKind,
    pub name: String,
}

impl ObjectRef {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            field: DEPENDS_ON_ANNOTATION.to_string(),
            value: format!("{raw}: {reason}"),
        };

        let (kind, name) = raw
            .split_once('.')
            .ok_or_else(|| invalid("expected <kind>.<name>"))?;
        let kind: ManagedKind = kind.parse().map_err(|_| invalid("unknown kind"))?;
        Ok(Self {
            kind,
            name: name.to_string(),
        })
    }

    /// Service key the referenced object is converted into
    pub fn service_name(&self) -> String {
        naming::service_name(self.kind.name(), &self.name)
    }
}

/// One manifest document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: serde_yaml::Value,
}

impl Manifest {
    pub fn new(api_version: &str, kind: &str, metadata: ObjectMeta, spec: serde_yaml::Value) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            metadata,
            spec,
        }
    }

    /// Decode the spec into a kind's typed spec; a missing spec means defaults
    pub fn decode_spec<T: DeserializeOwned + Default>(&self) -> Result<T, ConfigError> {
        if self.spec.is_null() {
            return Ok(T::default());
        }
        serde_yaml::from_value(self.spec.clone()).map_err(|e| ConfigError::Parse {
            message: format!("{} {}: {}", self.kind, self.metadata.name, e),
        })
    }
}

/// Parse every document of a multi-document manifest file
///
/// Empty documents are skipped.
pub fn parse_manifests(raw: &str) -> Result<Vec<Manifest>, ConfigError> {
    let mut out = Vec::new();
    for document in serde_yaml::Deserializer::from_str(raw) {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        if value.is_null() {
            continue;
        }
        let manifest: Manifest = serde_yaml::from_value(value).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        out.push(manifest);
    }
    Ok(out)
}

/// Connection settings of an external database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatabaseSpec {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub name: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdcmSpec {
    pub image: Option<String>,
    pub tag: Option<String>,
    pub publish_port: Option<u16>,
    pub volume: Option<String>,
    pub url: Option<String>,
    pub database: DatabaseSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PostgresSpec {
    pub image: Option<String>,
    pub tag: Option<String>,
    pub publish_port: Option<u16>,
    pub volume: Option<String>,
    pub password: Option<String>,
    pub user: Option<String>,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VaultSpec {
    pub image: Option<String>,
    pub tag: Option<String>,
    pub publish_port: Option<u16>,
    /// `non-ha`, `ha` or `dev`
    pub mode: String,
    pub ui: bool,
    pub database: DatabaseSpec,
}

impl Default for VaultSpec {
    fn default() -> Self {
        Self {
            image: None,
            tag: None,
            publish_port: None,
            mode: "non-ha".to_string(),
            ui: true,
            database: DatabaseSpec::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConsulSpec {
    pub image: Option<String>,
    pub tag: Option<String>,
    pub publish_port: Option<u16>,
    pub volume: Option<String>,
}

/// A whole installation in one object
///
/// Components left out are not deployed; the database is on unless disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApplicationSpec {
    pub adcm: AdcmSpec,
    pub postgres: Option<PostgresSpec>,
    pub vault: Option<VaultSpec>,
    pub consul: Option<ConsulSpec>,
}

impl Default for ApplicationSpec {
    fn default() -> Self {
        Self {
            adcm: AdcmSpec::default(),
            postgres: Some(PostgresSpec::default()),
            vault: None,
            consul: None,
        }
    }
}
