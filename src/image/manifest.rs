//! Manifest and index documents
//!
//! Covers the OCI image format and Docker distribution v2 formats. Image indexes
//! (manifest lists) are resolved to a single image manifest by platform.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Accept header sent on manifest requests
pub const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Whether an index entry for `candidate` satisfies this platform. A variant
    /// only has to match when both sides name one.
    pub fn matches(&self, candidate: &Platform) -> bool {
        self.os == candidate.os
            && self.architecture == candidate.architecture
            && match (&self.variant, &candidate.variant) {
                (Some(wanted), Some(offered)) => wanted == offered,
                _ => true,
            }
    }
}

impl FromStr for Platform {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    os: os.to_string(),
                    architecture: arch.to_string(),
                    variant: Some(variant.to_string()),
                })
            }
            _ => Err(StoreError::Validation(format!(
                "invalid platform {:?}, expected os/arch[/variant]",
                s
            ))),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// Picks the manifest for `platform`
    pub fn select(&self, platform: &Platform) -> Result<&Descriptor> {
        self.manifests
            .iter()
            .find(|m| m.platform.as_ref().is_some_and(|p| platform.matches(p)))
            .ok_or_else(|| {
                let offered: Vec<String> = self
                    .manifests
                    .iter()
                    .filter_map(|m| m.platform.as_ref().map(|p| p.to_string()))
                    .collect();
                StoreError::NotFound(format!(
                    "no manifest for platform {} (available: {})",
                    platform,
                    offered.join(", ")
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedManifest {
    Image(ImageManifest),
    Index(ImageIndex),
}

/// Parses a manifest response body, using the response content type when the
/// document itself doesn't say what it is.
pub fn parse_manifest(data: &[u8], content_type: Option<&str>) -> Result<ParsedManifest> {
    let value: serde_json::Value = serde_json::from_slice(data)
        .map_err(|e| StoreError::Parse(format!("Failed to parse manifest: {}", e)))?;

    if value.get("schemaVersion").and_then(|v| v.as_u64()) == Some(1) {
        return Err(StoreError::Unsupported(
            "Docker schema 1 manifests".to_string(),
        ));
    }

    let media_type = value
        .get("mediaType")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| content_type.map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string()));

    let is_index = match media_type.as_deref() {
        Some(OCI_INDEX_MEDIA_TYPE) | Some(DOCKER_MANIFEST_LIST_MEDIA_TYPE) => true,
        Some(OCI_MANIFEST_MEDIA_TYPE) | Some(DOCKER_MANIFEST_MEDIA_TYPE) => false,
        _ => value.get("manifests").is_some(),
    };

    if is_index {
        Ok(ParsedManifest::Index(serde_json::from_value(value)?))
    } else {
        Ok(ParsedManifest::Image(serde_json::from_value(value)?))
    }
}

/// How a layer blob is compressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCompression {
    None,
    Gzip,
}

impl LayerCompression {
    pub fn from_media_type(media_type: &str) -> Result<Self> {
        match media_type {
            "application/vnd.oci.image.layer.v1.tar"
            | "application/vnd.docker.image.rootfs.diff.tar" => Ok(Self::None),
            "application/vnd.oci.image.layer.v1.tar+gzip"
            | "application/vnd.docker.image.rootfs.diff.tar.gzip" => Ok(Self::Gzip),
            // Foreign layers live outside the registry and are never pulled.
            other if other.contains("foreign") || other.contains("nondistributable") => Err(
                StoreError::Unsupported(format!("foreign layer media type {}", other)),
            ),
            other => Err(StoreError::Unsupported(format!(
                "layer media type {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:1111111111111111111111111111111111111111111111111111111111111111",
                "size": 100,
                "platform": { "os": "linux", "architecture": "arm64", "variant": "v8" }
            },
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:2222222222222222222222222222222222222222222222222222222222222222",
                "size": 100,
                "platform": { "os": "linux", "architecture": "amd64" }
            }
        ]
    }"#;

    const MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": "sha256:3333333333333333333333333333333333333333333333333333333333333333",
            "size": 10
        },
        "layers": [
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "digest": "sha256:4444444444444444444444444444444444444444444444444444444444444444",
                "size": 20
            }
        ]
    }"#;

    #[test]
    fn index_selects_platform() {
        let ParsedManifest::Index(index) = parse_manifest(INDEX.as_bytes(), None).unwrap() else {
            panic!("expected index");
        };

        let amd64: Platform = "linux/amd64".parse().unwrap();
        assert!(index.select(&amd64).unwrap().digest.starts_with("sha256:2222"));

        let arm64: Platform = "linux/arm64".parse().unwrap();
        assert!(index.select(&arm64).unwrap().digest.starts_with("sha256:1111"));

        let arm64_v7: Platform = "linux/arm64/v7".parse().unwrap();
        let err = index.select(&arm64_v7).unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("linux/amd64"));
    }

    #[test]
    fn manifest_type_falls_back_to_content_type() {
        let parsed = parse_manifest(
            MANIFEST.as_bytes(),
            Some("application/vnd.docker.distribution.manifest.v2+json; charset=utf-8"),
        )
        .unwrap();
        let ParsedManifest::Image(manifest) = parsed else {
            panic!("expected image manifest");
        };
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(
            LayerCompression::from_media_type(&manifest.layers[0].media_type).unwrap(),
            LayerCompression::Gzip
        );
    }

    #[test]
    fn schema1_is_unsupported() {
        let err = parse_manifest(br#"{"schemaVersion": 1, "fsLayers": []}"#, None).unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(_)));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            parse_manifest(b"<html>", None),
            Err(StoreError::Parse(_))
        ));
    }

    #[test]
    fn layer_compression_by_media_type() {
        assert_eq!(
            LayerCompression::from_media_type("application/vnd.oci.image.layer.v1.tar").unwrap(),
            LayerCompression::None
        );
        assert_eq!(
            LayerCompression::from_media_type("application/vnd.oci.image.layer.v1.tar+gzip")
                .unwrap(),
            LayerCompression::Gzip
        );
        assert!(
            LayerCompression::from_media_type("application/vnd.oci.image.layer.v1.tar+zstd")
                .is_err()
        );
        for foreign in [
            "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip",
            "application/vnd.oci.image.layer.nondistributable.v1.tar",
            "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip",
        ] {
            assert!(matches!(
                LayerCompression::from_media_type(foreign),
                Err(StoreError::Unsupported(_))
            ));
        }
    }

    #[test]
    fn platform_parsing() {
        let p: Platform = "linux/arm/v7".parse().unwrap();
        assert_eq!(p.variant.as_deref(), Some("v7"));
        assert_eq!(p.to_string(), "linux/arm/v7");
        assert!("linux".parse::<Platform>().is_err());
        assert!("linux//".parse::<Platform>().is_err());
    }
}
