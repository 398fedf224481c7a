//! In-memory model of a Docker image: per-layer metadata, runtime
//! configuration, the V2.2 image config and the registry manifest schemas.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use docker2aci_core::error::{ConvertError, Result};
use serde::Deserialize;

/// Runtime configuration embedded in a layer's JSON or in a V2.2 image
/// config. Field names follow the Docker wire format.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "User", default)]
    pub user: String,
    #[serde(rename = "Env", default)]
    pub env: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: String,
    /// Set of `port[/proto]` keys; the values are empty objects.
    #[serde(rename = "ExposedPorts", default)]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    /// Deprecated predecessor of `ExposedPorts`.
    #[serde(rename = "PortSpecs", default)]
    pub port_specs: Option<Vec<String>>,
    /// Set of absolute paths; the values are empty objects.
    #[serde(rename = "Volumes", default)]
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(rename = "Labels", default)]
    pub labels: Option<BTreeMap<String, String>>,
}

/// Metadata of one Docker layer, as found in the v1 layer JSON (registry v1,
/// "docker save" tars and V2.1 history blobs all carry this shape).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LayerMetadata {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub config: Option<RuntimeConfig>,
}

/// V2.2 / OCI image configuration blob.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfigV22 {
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub config: Option<RuntimeConfig>,
    #[serde(default)]
    pub rootfs: Option<RootFs>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type", default)]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

/// Content descriptor used by V2.2 and OCI manifests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

/// Docker V2.1 (schema 1) manifest: blob sums plus embedded history JSON.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestV21 {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(rename = "fsLayers", default)]
    pub fs_layers: Vec<BlobSum>,
    #[serde(default)]
    pub history: Vec<V1Compatibility>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlobSum {
    #[serde(rename = "blobSum", default)]
    pub blob_sum: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct V1Compatibility {
    #[serde(rename = "v1Compatibility", default)]
    pub v1_compatibility: String,
}

impl ManifestV21 {
    /// Extract the layer chain, base-first. The wire format lists layers
    /// top-first with one history entry per layer.
    pub fn layer_chain(&self) -> Result<Vec<(String, LayerMetadata)>> {
        if self.fs_layers.len() != self.history.len() {
            return Err(ConvertError::Serialization(format!(
                "manifest layer/history length mismatch: {} != {}",
                self.fs_layers.len(),
                self.history.len()
            )));
        }
        let mut chain = Vec::with_capacity(self.fs_layers.len());
        for (blob, compat) in self.fs_layers.iter().zip(self.history.iter()).rev() {
            let metadata: LayerMetadata = serde_json::from_str(&compat.v1_compatibility)?;
            chain.push((blob.blob_sum.clone(), metadata));
        }
        Ok(chain)
    }
}

/// Docker V2.2 (schema 2) and OCI V1 manifests share this shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestV22 {
    #[serde(rename = "schemaVersion", default)]
    pub schema_version: u32,
    #[serde(default)]
    pub config: Descriptor,
    /// Layer descriptors, base-first.
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

/// A registry manifest, tagged by the media type it was served with.
#[derive(Debug, Clone)]
pub enum RegistryManifest {
    V21(ManifestV21),
    V22(ManifestV22),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_metadata_from_docker_json() {
        let json = r#"{
            "id": "deadbeef",
            "parent": "cafebabe",
            "created": "2016-06-02T21:43:31.291506236Z",
            "author": "rkt developer <rkt-dev@googlegroups.com>",
            "os": "linux",
            "architecture": "amd64",
            "config": {
                "User": "1000:1000",
                "Env": ["FOO=1", "BAR=2"],
                "Entrypoint": ["/bin/sh", "-c", "echo"],
                "Cmd": ["foo"],
                "WorkingDir": "/",
                "ExposedPorts": {"80": {}, "443/tcp": {}}
            }
        }"#;
        let layer: LayerMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(layer.id, "deadbeef");
        assert_eq!(layer.parent, "cafebabe");
        assert_eq!(layer.os, "linux");
        let config = layer.config.unwrap();
        assert_eq!(config.user, "1000:1000");
        assert_eq!(
            config.entrypoint,
            Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "echo".to_string()
            ])
        );
        let ports: Vec<&String> = config.exposed_ports.as_ref().unwrap().keys().collect();
        assert_eq!(ports, vec!["443/tcp", "80"]);
    }

    #[test]
    fn test_layer_metadata_minimal() {
        let layer: LayerMetadata = serde_json::from_str(r#"{"id": "abc"}"#).unwrap();
        assert_eq!(layer.id, "abc");
        assert!(layer.parent.is_empty());
        assert!(layer.created.is_none());
        assert!(layer.config.is_none());
    }

    #[test]
    fn test_manifest_v21_layer_chain() {
        let json = r#"{
            "name": "library/busybox",
            "tag": "latest",
            "fsLayers": [
                {"blobSum": "sha256:top"},
                {"blobSum": "sha256:base"}
            ],
            "history": [
                {"v1Compatibility": "{\"id\": \"top\", \"parent\": \"base\"}"},
                {"v1Compatibility": "{\"id\": \"base\"}"}
            ]
        }"#;
        let manifest: ManifestV21 = serde_json::from_str(json).unwrap();
        let chain = manifest.layer_chain().unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].0, "sha256:base");
        assert_eq!(chain[0].1.id, "base");
        assert_eq!(chain[1].0, "sha256:top");
        assert_eq!(chain[1].1.parent, "base");
    }

    #[test]
    fn test_manifest_v21_length_mismatch() {
        let json = r#"{
            "fsLayers": [{"blobSum": "sha256:top"}],
            "history": []
        }"#;
        let manifest: ManifestV21 = serde_json::from_str(json).unwrap();
        assert!(manifest.layer_chain().is_err());
    }

    #[test]
    fn test_manifest_v22() {
        let json = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": "sha256:cfg",
                "size": 100
            },
            "layers": [
                {
                    "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                    "digest": "sha256:layer1",
                    "size": 200
                }
            ]
        }"#;
        let manifest: ManifestV22 = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.schema_version, 2);
        assert_eq!(manifest.config.digest, "sha256:cfg");
        assert_eq!(manifest.layers.len(), 1);
    }

    #[test]
    fn test_image_config_v22() {
        let json = r#"{
            "created": "2016-06-02T21:43:31.291506236Z",
            "architecture": "amd64",
            "os": "linux",
            "config": {"Env": ["FOO=1"], "Cmd": ["foo"]},
            "rootfs": {"type": "layers", "diff_ids": ["sha256:a", "sha256:b"]}
        }"#;
        let config: ImageConfigV22 = serde_json::from_str(json).unwrap();
        assert_eq!(config.os, "linux");
        assert_eq!(config.rootfs.unwrap().diff_ids.len(), 2);
    }
}
