//! ACI manifest synthesis from Docker layer metadata.
//!
//! One synthesis routine serves the v1 family (registry v1, "docker save"
//! tars, V2.1 history blobs) and the V2.2/OCI path; the flavor controls the
//! few places the schemas disagree (the `layer` label, the default group,
//! dependency shape).

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use docker2aci_core::error::{ConvertError, Result};

use crate::aci::{
    self, AciManifest, App, Dependency, EnvironmentVariable, MountPoint, Port,
    APPC_DOCKER_CMD, APPC_DOCKER_ENTRYPOINT, APPC_DOCKER_IMAGE_ID, APPC_DOCKER_MANIFEST_HASH,
    APPC_DOCKER_ORIGINAL_NAME, APPC_DOCKER_PARENT_IMAGE_ID, APPC_DOCKER_REGISTRY_URL,
    APPC_DOCKER_REPOSITORY, APPC_DOCKER_TAG,
};
use crate::image::{LayerMetadata, RuntimeConfig};
use crate::reference::ImageReference;

/// Source schema family the manifest is synthesised from.
pub enum ManifestFlavor<'a> {
    /// Registry v1, "docker save" layers and V2.1 history blobs.
    V1,
    /// V2.2 / OCI layers.
    V22 {
        /// Manifests of all lower layers; non-empty only for the top layer,
        /// which depends on every one of them.
        lower_manifests: &'a [AciManifest],
        /// Overrides the `imageid` annotation for the top layer, which
        /// carries the image's manifest digest rather than a blob digest.
        image_id: Option<&'a str>,
    },
}

/// Synthesise the ACI manifest for one layer.
pub fn assemble_manifest(
    layer: &LayerMetadata,
    reference: &ImageReference,
    manifest_hash: &str,
    flavor: &ManifestFlavor,
) -> Result<AciManifest> {
    let name = layer_image_name(reference, &layer.id);
    let mut manifest = AciManifest::new(name);

    let tag = reference.tag.as_deref().unwrap_or("");

    let mut labels = BTreeMap::new();
    let mut parent_labels = BTreeMap::new();
    if matches!(flavor, ManifestFlavor::V1) {
        aci::set_label(&mut labels, "layer", &layer.id);
    }
    aci::set_label(&mut labels, "version", tag);
    if let Some((os, arch)) = aci::appc_os_arch(&layer.os, &layer.architecture) {
        aci::set_label(&mut labels, "os", &os);
        aci::set_label(&mut parent_labels, "os", &os);
        aci::set_label(&mut labels, "arch", &arch);
        aci::set_label(&mut parent_labels, "arch", &arch);
    }

    let mut annotations = BTreeMap::new();
    aci::set_annotation(&mut annotations, "authors", &layer.author);
    if let Some(created) = layer.created {
        if created != DateTime::<Utc>::UNIX_EPOCH {
            aci::set_annotation(
                &mut annotations,
                "created",
                &created.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            );
        }
    }
    aci::set_annotation(&mut annotations, "docker-comment", &layer.comment);

    aci::set_annotation(&mut annotations, APPC_DOCKER_REGISTRY_URL, &reference.index_url);
    aci::set_annotation(&mut annotations, APPC_DOCKER_REPOSITORY, &reference.repository);
    let image_id = match flavor {
        ManifestFlavor::V22 {
            image_id: Some(id), ..
        } => *id,
        _ => layer.id.as_str(),
    };
    aci::set_annotation(&mut annotations, APPC_DOCKER_IMAGE_ID, image_id);
    aci::set_annotation(&mut annotations, APPC_DOCKER_PARENT_IMAGE_ID, &layer.parent);
    aci::set_annotation(&mut annotations, APPC_DOCKER_MANIFEST_HASH, manifest_hash);
    aci::set_annotation(
        &mut annotations,
        APPC_DOCKER_ORIGINAL_NAME,
        &reference.original_name,
    );

    if let Some(config) = &layer.config {
        let entrypoint = config.entrypoint.clone().unwrap_or_default();
        let cmd = config.cmd.clone().unwrap_or_default();
        if !entrypoint.is_empty() {
            aci::set_annotation(
                &mut annotations,
                APPC_DOCKER_ENTRYPOINT,
                &serde_json::to_string(&entrypoint)?,
            );
        }
        if !cmd.is_empty() {
            aci::set_annotation(&mut annotations, APPC_DOCKER_CMD, &serde_json::to_string(&cmd)?);
        }

        let mut exec = entrypoint;
        exec.extend(cmd);
        if !exec.is_empty() {
            let v22 = matches!(flavor, ManifestFlavor::V22 { .. });
            let (user, group) = parse_docker_user(&config.user, v22);
            manifest.app = Some(App {
                exec,
                user,
                group,
                environment: convert_env(config),
                working_directory: config.working_dir.clone(),
                ports: convert_ports(config)?,
                mount_points: convert_volumes(config),
            });
        }
    }

    let mut deps: Vec<Dependency> = Vec::new();
    match flavor {
        ManifestFlavor::V22 { lower_manifests, .. } if !lower_manifests.is_empty() => {
            for lower in lower_manifests.iter() {
                deps.push(Dependency {
                    image_name: lower.name.clone(),
                    labels: aci::labels_from_map(parent_labels.clone()),
                });
            }
        }
        _ => {
            if !layer.parent.is_empty() {
                deps.push(Dependency {
                    image_name: layer_image_name(reference, &layer.parent),
                    labels: aci::labels_from_map(parent_labels.clone()),
                });
            }
        }
    }
    if !deps.is_empty() {
        aci::set_annotation(&mut annotations, APPC_DOCKER_TAG, tag);
    }

    manifest.labels = aci::labels_from_map(labels);
    manifest.annotations = aci::annotations_from_map(annotations);
    manifest.dependencies = deps;

    Ok(manifest)
}

/// ACI identifier for one layer: `sanitize(index/repository-layerID)`.
fn layer_image_name(reference: &ImageReference, layer_id: &str) -> String {
    aci::sanitize_ac_identifier(&format!(
        "{}/{}-{}",
        reference.index_url, reference.repository, layer_id
    ))
}

/// Parse a Docker `uid[:gid]` user string. When only the uid is given the
/// v1 family defaults the group to root while V2.2 defaults it to the uid.
fn parse_docker_user(user: &str, v22: bool) -> (String, String) {
    if user.is_empty() {
        return ("0".to_string(), "0".to_string());
    }
    match user.split_once(':') {
        Some((uid, gid)) => (uid.to_string(), gid.to_string()),
        None if v22 => (user.to_string(), user.to_string()),
        None => (user.to_string(), "0".to_string()),
    }
}

/// Split `KEY=VAL` environment entries; malformed entries are skipped.
fn convert_env(config: &RuntimeConfig) -> Vec<EnvironmentVariable> {
    config
        .env
        .iter()
        .flatten()
        .filter_map(|entry| {
            entry.split_once('=').map(|(name, value)| EnvironmentVariable {
                name: name.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

/// Derive appc ports from `ExposedPorts`, falling back to the deprecated
/// `PortSpecs` field only when `ExposedPorts` is absent entirely.
fn convert_ports(config: &RuntimeConfig) -> Result<Vec<Port>> {
    let mut ports = Vec::new();
    match (&config.exposed_ports, &config.port_specs) {
        (Some(exposed), _) => {
            for spec in exposed.keys() {
                ports.push(parse_docker_port(spec)?);
            }
        }
        (None, Some(specs)) => {
            tracing::debug!("docker image uses deprecated PortSpecs field");
            for spec in specs {
                ports.push(parse_docker_port(spec)?);
            }
        }
        (None, None) => {}
    }
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(ports)
}

/// Parse a `port[/proto]` spec; the protocol defaults to tcp.
fn parse_docker_port(spec: &str) -> Result<Port> {
    let (port_str, proto) = match spec.split_once('/') {
        Some((port, proto)) => (port, proto),
        None => (spec, "tcp"),
    };
    let port: u64 = port_str
        .parse()
        .map_err(|_| ConvertError::ConfigInvalid(format!("error parsing port {:?}", port_str)))?;
    Ok(Port {
        name: aci::sanitize_ac_name(spec),
        protocol: proto.to_string(),
        port,
        count: 1,
        socket_activated: false,
    })
}

/// Turn volume declarations into mount points. Sanitised names that
/// collide get a numeric suffix.
fn convert_volumes(config: &RuntimeConfig) -> Vec<MountPoint> {
    let mut mount_points = Vec::new();
    let mut dup: HashMap<String, u32> = HashMap::new();
    for path in config.volumes.iter().flat_map(|v| v.keys()) {
        let joined = if path.starts_with('/') {
            format!("volume{}", path)
        } else {
            format!("volume/{}", path)
        };
        let mut name = aci::sanitize_ac_name(&joined);
        match dup.get_mut(&name) {
            Some(count) => {
                let suffixed = format!("{}-{}", name, *count);
                *count += 1;
                name = suffixed;
            }
            None => {
                dup.insert(name.clone(), 1);
            }
        }
        mount_points.push(MountPoint {
            name,
            path: path.clone(),
            read_only: false,
        });
    }
    mount_points.sort_by(|a, b| a.name.cmp(&b.name));
    mount_points
}
