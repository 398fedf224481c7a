//! Backend for remote Docker registries.
//!
//! Discovers the layer chain over the v2 API (schema 2.1 history blobs or
//! schema 2.2/OCI config + layer digests) and falls back to the v1
//! token+endpoint protocol when the registry predates v2.

use std::fs::File;
use std::path::Path;

use docker2aci_core::config::{
    Compression, MediaTypeSet, RegistryOptionSet, RemoteConfig, MEDIA_TYPE_DOCKER_V21_MANIFEST,
    MEDIA_TYPE_DOCKER_V21_SIGNED_MANIFEST, MEDIA_TYPE_DOCKER_V22_MANIFEST,
    MEDIA_TYPE_OCI_V1_MANIFEST,
};
use docker2aci_core::error::{ConvertError, Result};

use crate::image::{ImageConfigV22, LayerMetadata, ManifestV21, ManifestV22, RegistryManifest};
use crate::manifest::{assemble_manifest, ManifestFlavor};
use crate::reference::ImageReference;
use crate::registry::{RegistryClient, RepoData};
use crate::squash::ConvertedLayer;

use super::{aci_file_name, generate_aci, ImageInfo, ImageSource};

pub struct RemoteSource {
    username: Option<String>,
    password: Option<String>,
    insecure: docker2aci_core::config::InsecureConfig,
    registry_options: RegistryOptionSet,
    media_types: MediaTypeSet,
    state: Option<State>,
}

struct State {
    client: RegistryClient,
    discovered: Discovered,
}

enum Discovered {
    V1 {
        repo_data: RepoData,
    },
    V21 {
        /// (blob digest, layer metadata), base-first.
        chain: Vec<(String, LayerMetadata)>,
        manifest_hash: String,
    },
    V22 {
        /// Per-layer metadata projected from the image config, base-first.
        chain: Vec<(String, LayerMetadata)>,
        manifest_hash: String,
    },
}

impl RemoteSource {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            username: config.username.clone(),
            password: config.password.clone(),
            insecure: config.insecure,
            registry_options: config.registry_options.clone(),
            media_types: config.media_types.clone(),
            state: None,
        }
    }

    fn discover_v2(
        &mut self,
        client: &mut RegistryClient,
        reference: &ImageReference,
    ) -> Result<Discovered> {
        let accept = self.media_types.manifest_media_types();
        let (body, media_type, digest) = client.get_v2_manifest(
            &reference.repository,
            reference.manifest_reference(),
            &accept,
        )?;

        match parse_manifest(&body, &media_type)? {
            RegistryManifest::V21(manifest) => Ok(Discovered::V21 {
                chain: manifest.layer_chain()?,
                manifest_hash: digest,
            }),
            RegistryManifest::V22(manifest) => {
                self.check_v22_media_types(&manifest)?;
                let mut config_bytes = Vec::new();
                client.fetch_v2_blob(
                    &reference.repository,
                    &manifest.config.digest,
                    &mut config_bytes,
                )?;
                let config: ImageConfigV22 = serde_json::from_slice(&config_bytes)?;

                let digests: Vec<String> =
                    manifest.layers.iter().map(|l| l.digest.clone()).collect();
                Ok(Discovered::V22 {
                    chain: v22_layer_chain(&config, &digests),
                    manifest_hash: digest,
                })
            }
        }
    }

    fn check_v22_media_types(&self, manifest: &ManifestV22) -> Result<()> {
        let config_types = self.media_types.config_media_types();
        if !config_types.contains(&manifest.config.media_type.as_str()) {
            return Err(ConvertError::BadManifestMediaType {
                media_type: manifest.config.media_type.clone(),
            });
        }
        let layer_types = self.media_types.layer_media_types();
        for layer in &manifest.layers {
            if !layer_types.contains(&layer.media_type.as_str()) {
                return Err(ConvertError::BadManifestMediaType {
                    media_type: layer.media_type.clone(),
                });
            }
        }
        Ok(())
    }

    fn discover_v1(
        &mut self,
        client: &mut RegistryClient,
        reference: &ImageReference,
    ) -> Result<(Vec<String>, Discovered)> {
        if reference.digest.is_some() {
            return Err(ConvertError::BadReference {
                reference: reference.original_name.clone(),
                message: "digest references require a v2 registry".to_string(),
            });
        }

        let repo_data = client.get_v1_repo_data(&reference.repository)?;
        let endpoint = repo_data.endpoints[0].clone();
        let tag = reference.tag.as_deref().unwrap_or("latest");

        let image_id =
            client.get_v1_image_id(&endpoint, &reference.repository, tag, &repo_data)?;
        let mut ancestry = client.get_v1_ancestry(&endpoint, &image_id, &repo_data)?;
        // Served top-first.
        ancestry.reverse();

        Ok((ancestry, Discovered::V1 { repo_data }))
    }

    fn build_from_v1(
        &mut self,
        info: &ImageInfo,
        output_dir: &Path,
        tmp_dir: &Path,
        compression: Compression,
    ) -> Result<Vec<ConvertedLayer>> {
        let state = self.state.as_mut().ok_or_else(|| {
            ConvertError::RegistryUnreachable("image info not discovered".to_string())
        })?;
        let repo_data = match &state.discovered {
            Discovered::V1 { repo_data } => repo_data.clone(),
            _ => unreachable!(),
        };
        let endpoint = repo_data.endpoints[0].clone();

        let mut layers = Vec::with_capacity(info.layer_ids.len());
        let mut cur_pwl: Vec<String> = Vec::new();
        for (i, layer_id) in info.layer_ids.iter().enumerate() {
            let scratch = tempfile::Builder::new()
                .prefix("docker2aci-")
                .tempdir_in(tmp_dir)?;

            let (json, size) =
                state
                    .client
                    .get_v1_layer_json(&endpoint, layer_id, &repo_data)?;
            let metadata: LayerMetadata = serde_json::from_slice(&json)?;
            tracing::info!(layer = %metadata.id, size = ?size, "downloading layer");

            let layer_path = scratch.path().join("layer.tar");
            let mut dest = File::create(&layer_path)?;
            state
                .client
                .fetch_v1_layer(&endpoint, layer_id, &repo_data, &mut dest)?;
            drop(dest);

            let manifest = assemble_manifest(&metadata, &info.reference, "", &ManifestFlavor::V1)?;
            let output_path = output_dir.join(aci_file_name(&info.reference, &metadata, i));
            let converted = generate_aci(
                File::open(&layer_path)?,
                manifest,
                output_path,
                &cur_pwl,
                compression,
            )?;
            cur_pwl = converted.manifest.path_whitelist.clone();
            layers.push(converted);
        }
        Ok(layers)
    }

    fn build_from_v2(
        &mut self,
        info: &ImageInfo,
        output_dir: &Path,
        tmp_dir: &Path,
        compression: Compression,
    ) -> Result<Vec<ConvertedLayer>> {
        let state = self.state.as_mut().ok_or_else(|| {
            ConvertError::RegistryUnreachable("image info not discovered".to_string())
        })?;
        let (chain, manifest_hash, v22) = match &state.discovered {
            Discovered::V21 {
                chain,
                manifest_hash,
            } => (chain.clone(), manifest_hash.clone(), false),
            Discovered::V22 {
                chain,
                manifest_hash,
            } => (chain.clone(), manifest_hash.clone(), true),
            Discovered::V1 { .. } => unreachable!(),
        };

        let mut layers: Vec<ConvertedLayer> = Vec::with_capacity(chain.len());
        let mut lower_manifests = Vec::with_capacity(chain.len());
        let mut cur_pwl: Vec<String> = Vec::new();
        let top = chain.len().saturating_sub(1);

        for (i, (blob_digest, metadata)) in chain.iter().enumerate() {
            let scratch = tempfile::Builder::new()
                .prefix("docker2aci-")
                .tempdir_in(tmp_dir)?;

            tracing::info!(layer = %metadata.id, digest = %blob_digest, "downloading layer");
            let layer_path = scratch.path().join("layer.tar");
            let mut dest = File::create(&layer_path)?;
            state
                .client
                .fetch_v2_blob(&info.reference.repository, blob_digest, &mut dest)?;
            drop(dest);

            let flavor = if v22 {
                ManifestFlavor::V22 {
                    lower_manifests: if i == top {
                        lower_manifests.as_slice()
                    } else {
                        &[]
                    },
                    image_id: (i == top).then_some(manifest_hash.as_str()),
                }
            } else {
                ManifestFlavor::V1
            };
            let manifest =
                assemble_manifest(metadata, &info.reference, &manifest_hash, &flavor)?;

            let output_path = output_dir.join(aci_file_name(&info.reference, metadata, i));
            let converted = generate_aci(
                File::open(&layer_path)?,
                manifest,
                output_path,
                &cur_pwl,
                compression,
            )?;
            cur_pwl = converted.manifest.path_whitelist.clone();
            lower_manifests.push(converted.manifest.clone());
            layers.push(converted);
        }
        Ok(layers)
    }
}

impl ImageSource for RemoteSource {
    fn get_image_info(&mut self, input: &str) -> Result<ImageInfo> {
        let reference = ImageReference::parse(input)?;
        let mut client = RegistryClient::new(
            &reference.index_url,
            self.username.clone(),
            self.password.clone(),
            self.insecure,
        )?;

        let (layer_ids, manifest_hash, discovered) =
            if self.registry_options.allows_v2() && client.supports_v2()? {
                tracing::debug!(index = %reference.index_url, "registry speaks v2");
                let discovered = self.discover_v2(&mut client, &reference)?;
                let (layer_ids, manifest_hash) = match &discovered {
                    Discovered::V21 {
                        chain,
                        manifest_hash,
                    }
                    | Discovered::V22 {
                        chain,
                        manifest_hash,
                    } => (
                        chain.iter().map(|(_, m)| m.id.clone()).collect(),
                        manifest_hash.clone(),
                    ),
                    Discovered::V1 { .. } => unreachable!(),
                };
                (layer_ids, manifest_hash, discovered)
            } else if self.registry_options.allows_v1() {
                tracing::debug!(index = %reference.index_url, "falling back to registry v1");
                let (layer_ids, discovered) = self.discover_v1(&mut client, &reference)?;
                (layer_ids, String::new(), discovered)
            } else {
                return Err(ConvertError::RegistryUnreachable(format!(
                    "{} supports none of the allowed registry protocols",
                    reference.index_url
                )));
            };

        tracing::info!(image = %reference, layers = layer_ids.len(), "discovered remote image");
        self.state = Some(State { client, discovered });

        Ok(ImageInfo {
            layer_ids,
            manifest_hash,
            reference,
        })
    }

    fn build_aci(
        &mut self,
        info: &ImageInfo,
        output_dir: &Path,
        tmp_dir: &Path,
        compression: Compression,
    ) -> Result<Vec<ConvertedLayer>> {
        match self.state.as_ref().map(|s| &s.discovered) {
            Some(Discovered::V1 { .. }) => {
                self.build_from_v1(info, output_dir, tmp_dir, compression)
            }
            Some(_) => self.build_from_v2(info, output_dir, tmp_dir, compression),
            None => Err(ConvertError::RegistryUnreachable(
                "image info not discovered".to_string(),
            )),
        }
    }
}

/// Parse a manifest body according to the media type it was served with.
fn parse_manifest(body: &[u8], media_type: &str) -> Result<RegistryManifest> {
    match media_type {
        MEDIA_TYPE_DOCKER_V21_MANIFEST | MEDIA_TYPE_DOCKER_V21_SIGNED_MANIFEST => {
            let manifest: ManifestV21 = serde_json::from_slice(body)?;
            Ok(RegistryManifest::V21(manifest))
        }
        MEDIA_TYPE_DOCKER_V22_MANIFEST | MEDIA_TYPE_OCI_V1_MANIFEST => {
            let manifest: ManifestV22 = serde_json::from_slice(body)?;
            Ok(RegistryManifest::V22(manifest))
        }
        other => Err(ConvertError::BadManifestMediaType {
            media_type: other.to_string(),
        }),
    }
}

/// Project a V2.2 image config onto per-layer metadata. Layers are chained
/// by digest; only the top layer carries the runtime configuration.
fn v22_layer_chain(config: &ImageConfigV22, digests: &[String]) -> Vec<(String, LayerMetadata)> {
    let top = digests.len().saturating_sub(1);
    let mut parent = String::new();
    digests
        .iter()
        .enumerate()
        .map(|(i, digest)| {
            let id = digest_hex(digest).to_string();
            let mut metadata = LayerMetadata {
                id: id.clone(),
                parent: std::mem::take(&mut parent),
                os: config.os.clone(),
                architecture: config.architecture.clone(),
                ..Default::default()
            };
            if i == top {
                metadata.created = config.created;
                metadata.author = config.author.clone();
                metadata.config = config.config.clone();
            }
            parent = id;
            (digest.clone(), metadata)
        })
        .collect()
}

/// Hex part of an `algo:hex` digest.
fn digest_hex(digest: &str) -> &str {
    digest.split(':').next_back().unwrap_or(digest)
}
