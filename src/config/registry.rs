//! Kind registry
//!
//! Maps `apiVersion` + `kind` to the converter for that kind. Built once at
//! startup and only read afterwards.

use std::collections::BTreeMap;
use std::fmt;

use super::conversion::{self, Converted};
use super::manifest::Manifest;
use crate::domain::naming;
use crate::error::ConfigError;

pub const API_GROUP: &str = "app.adi.io";
pub const API_VERSION: &str = "v1alpha1";

/// Converts one manifest for a project in the given namespace
pub type ConvertFn = fn(&Manifest, &str) -> Result<Converted, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Split `group/version`; a bare version belongs to the core group
    pub fn parse(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

#[derive(Default)]
pub struct KindRegistry {
    converters: BTreeMap<GroupVersionKind, ConvertFn>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every kind the installer ships
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let kinds: [(&str, ConvertFn); 5] = [
            ("Application", conversion::application),
            ("ADCM", conversion::adcm),
            ("Postgres", conversion::postgres),
            ("Vault", conversion::vault),
            ("Consul", conversion::consul),
        ];
        for (kind, convert) in kinds {
            registry.register(GroupVersionKind::new(API_GROUP, API_VERSION, kind), convert);
        }
        registry
    }

    pub fn register(&mut self, gvk: GroupVersionKind, convert: ConvertFn) {
        self.converters.insert(gvk, convert);
    }

    pub fn kinds(&self) -> impl Iterator<Item = &GroupVersionKind> {
        self.converters.keys()
    }

    /// Validate and convert a manifest for the project `namespace`
    pub fn convert(&self, manifest: &Manifest, namespace: &str) -> Result<Converted, ConfigError> {
        let gvk = GroupVersionKind::parse(&manifest.api_version, &manifest.kind);
        let convert = self
            .converters
            .get(&gvk)
            .ok_or_else(|| ConfigError::UnknownKind {
                api_version: manifest.api_version.clone(),
                kind: manifest.kind.clone(),
            })?;

        if let Some(declared) = &manifest.metadata.namespace {
            if declared != namespace {
                return Err(ConfigError::NamespaceMismatch {
                    expected: namespace.to_string(),
                    actual: declared.clone(),
                });
            }
        }
        naming::validate_object_name("metadata.name", &manifest.metadata.name)?;

        convert(manifest, namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::manifest::ObjectMeta;

    fn manifest(kind: &str, namespace: Option<&str>) -> Manifest {
        let mut meta = ObjectMeta::named("main");
        meta.namespace = namespace.map(str::to_string);
        Manifest::new("app.adi.io/v1alpha1", kind, meta, serde_yaml::Value::Null)
    }

    #[test]
    fn test_gvk_parse() {
        let gvk = GroupVersionKind::parse("app.adi.io/v1alpha1", "Vault");
        assert_eq!(gvk.group, "app.adi.io");
        assert_eq!(gvk.api_version(), "app.adi.io/v1alpha1");
        assert_eq!(gvk.to_string(), "app.adi.io/v1alpha1, Kind=Vault");

        let core = GroupVersionKind::parse("v1", "Secret");
        assert_eq!(core.group, "");
        assert_eq!(core.api_version(), "v1");
    }

    #[test]
    fn test_builtin_kinds() {
        let registry = KindRegistry::builtin();
        let kinds: Vec<&str> = registry.kinds().map(|k| k.kind.as_str()).collect();
        assert_eq!(kinds, vec!["ADCM", "Application", "Consul", "Postgres", "Vault"]);
    }

    #[test]
    fn test_unknown_kind() {
        let registry = KindRegistry::builtin();
        let err = registry
            .convert(&manifest("Redis", None), "prod")
            .err()
            .unwrap();
        assert_eq!(
            err,
            ConfigError::UnknownKind {
                api_version: "app.adi.io/v1alpha1".to_string(),
                kind: "Redis".to_string(),
            }
        );
    }

    #[test]
    fn test_namespace_mismatch() {
        let registry = KindRegistry::builtin();
        let err = registry
            .convert(&manifest("Postgres", Some("staging")), "prod")
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::NamespaceMismatch { .. }));

        let converted = registry
            .convert(&manifest("Postgres", Some("prod")), "prod")
            .unwrap();
        assert_eq!(converted.services, vec!["postgres-main"]);
    }

    #[test]
    fn test_invalid_object_name() {
        let registry = KindRegistry::builtin();
        let mut bad = manifest("Consul", None);
        bad.metadata.name = "Main_Node".to_string();
        assert!(matches!(
            registry.convert(&bad, "prod"),
            Err(ConfigError::InvalidName { .. })
        ));
    }
}
