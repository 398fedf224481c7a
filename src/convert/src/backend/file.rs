//! Backend for tars produced by "docker save".
//!
//! Layout: a top-level `repositories` JSON mapping name→tag→top layer ID,
//! plus one directory per layer holding `json` and `layer.tar`. The input
//! file is re-seeked to the start for every traversal pass.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use docker2aci_core::config::Compression;
use docker2aci_core::error::{ConvertError, Result};

use crate::image::LayerMetadata;
use crate::manifest::{assemble_manifest, ManifestFlavor};
use crate::reference::ImageReference;
use crate::squash::ConvertedLayer;

use super::{aci_file_name, generate_aci, ImageInfo, ImageSource};

/// name → tag → layer ID
type Repositories = HashMap<String, HashMap<String, String>>;

pub struct FileSource {
    file: File,
}

impl FileSource {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(File::open(path)?))
    }

    /// Read one file out of the save tar.
    fn tar_file_bytes(&mut self, wanted: &str) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut archive = tar::Archive::new(&mut self.file);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            if clean_name(&name) == wanted {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                return Ok(data);
            }
        }
        Err(ConvertError::NotFound(format!(
            "file {:?} not found in archive",
            wanted
        )))
    }

    /// Extract `<id>/layer.tar` into `dest`, returning a reader over it.
    fn extract_layer(&mut self, layer_id: &str, dest: &Path) -> Result<File> {
        let wanted = format!("{}/layer.tar", layer_id);
        self.file.seek(SeekFrom::Start(0))?;
        let mut archive = tar::Archive::new(&mut self.file);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            if clean_name(&name) == wanted {
                let mut out = File::create(dest)?;
                std::io::copy(&mut entry, &mut out)?;
                drop(out);
                return Ok(File::open(dest)?);
            }
        }
        Err(ConvertError::NotFound(format!(
            "file {:?} not found in archive",
            wanted
        )))
    }

    fn layer_metadata(&mut self, layer_id: &str) -> Result<LayerMetadata> {
        let json = self.tar_file_bytes(&format!("{}/json", layer_id))?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Resolve the starting layer ID from the `repositories` file and the
    /// optional selector, completing the reference along the way.
    fn resolve_image(
        &mut self,
        selector: Option<&ImageReference>,
    ) -> Result<(String, ImageReference)> {
        let data = self.tar_file_bytes("repositories").map_err(|_| {
            ConvertError::InvalidLayer("repositories file not found".to_string())
        })?;
        let repositories: Repositories = serde_json::from_slice(&data)
            .map_err(|_| ConvertError::Serialization("error parsing repositories file".to_string()))?;

        let name = match selector {
            Some(reference) => reference.repository.clone(),
            None => {
                let mut names: Vec<String> = repositories.keys().cloned().collect();
                names.sort();
                match names.len() {
                    0 => {
                        return Err(ConvertError::InvalidLayer(
                            "no images found".to_string(),
                        ))
                    }
                    1 => names.remove(0),
                    _ => return Err(ConvertError::SeveralImages { images: names }),
                }
            }
        };

        let tags = repositories
            .get(&name)
            .ok_or_else(|| ConvertError::NotFound(format!("image {:?}", name)))?;

        let mut tag = selector
            .and_then(|r| r.tag.clone())
            .unwrap_or_else(|| "latest".to_string());
        if !tags.contains_key(&tag) {
            if tags.len() == 1 {
                // Sole tag wins when the requested one is absent.
                tag = tags.keys().next().cloned().unwrap_or(tag);
            } else {
                return Err(ConvertError::NotFound(format!("tag {:?}", tag)));
            }
        }
        let layer_id = tags
            .get(&tag)
            .cloned()
            .ok_or_else(|| ConvertError::NotFound(format!("tag {:?}", tag)))?;

        let reference = match selector {
            Some(reference) => {
                let mut reference = reference.clone();
                reference.tag = Some(tag);
                reference
            }
            None => ImageReference {
                index_url: String::new(),
                repository: name.clone(),
                tag: Some(tag),
                digest: None,
                original_name: name,
            },
        };

        Ok((layer_id, reference))
    }

    /// Follow parent pointers from the top layer down, returning the chain
    /// base-first.
    fn ancestry(&mut self, top_layer_id: &str) -> Result<Vec<String>> {
        let mut chain = Vec::new();
        let mut current = top_layer_id.to_string();
        while !current.is_empty() {
            if chain.contains(&current) {
                return Err(ConvertError::InvalidLayer(format!(
                    "layer chain cycle at {:?}",
                    current
                )));
            }
            chain.push(current.clone());
            current = self.layer_metadata(&current)?.parent;
        }
        chain.reverse();
        Ok(chain)
    }
}

impl ImageSource for FileSource {
    fn get_image_info(&mut self, input: &str) -> Result<ImageInfo> {
        let selector = if input.is_empty() {
            None
        } else {
            Some(ImageReference::for_file(input)?)
        };

        let (top_layer_id, reference) = self.resolve_image(selector.as_ref())?;
        let layer_ids = self.ancestry(&top_layer_id)?;
        tracing::info!(image = %reference, layers = layer_ids.len(), "discovered image in save tar");

        Ok(ImageInfo {
            layer_ids,
            manifest_hash: String::new(),
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
        let mut layers = Vec::with_capacity(info.layer_ids.len());
        let mut cur_pwl: Vec<String> = Vec::new();

        for (i, layer_id) in info.layer_ids.iter().enumerate() {
            let scratch = tempfile::Builder::new()
                .prefix("docker2aci-")
                .tempdir_in(tmp_dir)?;

            let metadata = self.layer_metadata(layer_id)?;
            tracing::info!(layer = %short_id(layer_id), "extracting layer");
            let layer_path = scratch.path().join(format!("{}.tar", layer_id));
            let layer_file = self.extract_layer(layer_id, &layer_path)?;

            let manifest = assemble_manifest(&metadata, &info.reference, "", &ManifestFlavor::V1)?;
            let output_path = output_dir.join(aci_file_name(&info.reference, &metadata, i));
            tracing::debug!(output = %output_path.display(), "generating layer ACI");
            let converted =
                generate_aci(layer_file, manifest, output_path, &cur_pwl, compression)?;

            cur_pwl = converted.manifest.path_whitelist.clone();
            layers.push(converted);
        }

        Ok(layers)
    }
}

fn clean_name(name: &str) -> String {
    let mut name = name.trim_start_matches('/');
    while let Some(rest) = name.strip_prefix("./") {
        name = rest;
    }
    name.trim_end_matches('/').to_string()
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn layer_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_size(content.len() as u64);
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    struct SavedLayer {
        id: &'static str,
        parent: Option<&'static str>,
        tar: Vec<u8>,
    }

    fn build_save_tar(
        dir: &Path,
        repositories: serde_json::Value,
        layers: Vec<SavedLayer>,
    ) -> std::path::PathBuf {
        let path = dir.join("saved.tar");
        let mut builder = tar::Builder::new(File::create(&path).unwrap());

        let repos = serde_json::to_vec(&repositories).unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(repos.len() as u64);
        builder
            .append_data(&mut header, "repositories", &repos[..])
            .unwrap();

        for layer in layers {
            let mut json = json!({
                "id": layer.id,
                "os": "linux",
                "architecture": "amd64"
            });
            if let Some(parent) = layer.parent {
                json["parent"] = json!(parent);
            }
            let json = serde_json::to_vec(&json).unwrap();

            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_size(json.len() as u64);
            builder
                .append_data(&mut header, format!("{}/json", layer.id), &json[..])
                .unwrap();

            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_size(layer.tar.len() as u64);
            builder
                .append_data(
                    &mut header,
                    format!("{}/layer.tar", layer.id),
                    &layer.tar[..],
                )
                .unwrap();
        }
        builder.into_inner().unwrap();
        path
    }

    fn two_layer_fixture(dir: &Path) -> std::path::PathBuf {
        build_save_tar(
            dir,
            json!({"myimage": {"v1": "top"}}),
            vec![
                SavedLayer {
                    id: "base",
                    parent: None,
                    tar: layer_tar(&[("thisisafile", b"contents")]),
                },
                SavedLayer {
                    id: "top",
                    parent: Some("base"),
                    tar: layer_tar(&[("thisisadifferentfile", b"other")]),
                },
            ],
        )
    }

    #[test]
    fn test_get_image_info_single_image() {
        let dir = TempDir::new().unwrap();
        let path = two_layer_fixture(dir.path());
        let mut source = FileSource::open(&path).unwrap();

        let info = source.get_image_info("").unwrap();
        assert_eq!(info.layer_ids, vec!["base", "top"]);
        assert_eq!(info.reference.repository, "myimage");
        assert_eq!(info.reference.tag, Some("v1".to_string()));
        assert!(info.manifest_hash.is_empty());
    }

    #[test]
    fn test_get_image_info_with_selector() {
        let dir = TempDir::new().unwrap();
        let path = two_layer_fixture(dir.path());
        let mut source = FileSource::open(&path).unwrap();

        let info = source.get_image_info("myimage:v1").unwrap();
        assert_eq!(info.reference.repository, "myimage");
        assert_eq!(info.layer_ids.len(), 2);
    }

    #[test]
    fn test_sole_tag_fallback() {
        let dir = TempDir::new().unwrap();
        let path = two_layer_fixture(dir.path());
        let mut source = FileSource::open(&path).unwrap();

        // "latest" is absent but there is exactly one tag.
        let info = source.get_image_info("myimage").unwrap();
        assert_eq!(info.reference.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_several_images_requires_selector() {
        let dir = TempDir::new().unwrap();
        let path = build_save_tar(
            dir.path(),
            json!({
                "imagea": {"latest": "base"},
                "imageb": {"latest": "base"}
            }),
            vec![SavedLayer {
                id: "base",
                parent: None,
                tar: layer_tar(&[("f", b"x")]),
            }],
        );
        let mut source = FileSource::open(&path).unwrap();

        match source.get_image_info("") {
            Err(ConvertError::SeveralImages { images }) => {
                assert_eq!(images, vec!["imagea", "imageb"]);
            }
            other => panic!("expected SeveralImages, got {:?}", other.map(|_| ())),
        }

        let info = source.get_image_info("imageb").unwrap();
        assert_eq!(info.reference.repository, "imageb");
    }

    #[test]
    fn test_unknown_image_and_tag() {
        let dir = TempDir::new().unwrap();
        let path = build_save_tar(
            dir.path(),
            json!({"myimage": {"v1": "base", "v2": "base"}}),
            vec![SavedLayer {
                id: "base",
                parent: None,
                tar: layer_tar(&[("f", b"x")]),
            }],
        );
        let mut source = FileSource::open(&path).unwrap();

        assert!(matches!(
            source.get_image_info("nosuchimage"),
            Err(ConvertError::NotFound(_))
        ));
        // Two tags, neither is "v3": no fallback.
        assert!(matches!(
            source.get_image_info("myimage:v3"),
            Err(ConvertError::NotFound(_))
        ));
    }

    #[test]
    fn test_build_aci_threads_whitelist() {
        let dir = TempDir::new().unwrap();
        let path = two_layer_fixture(dir.path());
        let mut source = FileSource::open(&path).unwrap();
        let info = source.get_image_info("").unwrap();

        let output = TempDir::new().unwrap();
        let tmp = TempDir::new().unwrap();
        let layers = source
            .build_aci(&info, output.path(), tmp.path(), Compression::Gzip)
            .unwrap();

        assert_eq!(layers.len(), 2);
        assert!(layers[0]
            .manifest
            .path_whitelist
            .contains(&"/thisisafile".to_string()));
        // Layer 2's whitelist is cumulative.
        assert!(layers[1]
            .manifest
            .path_whitelist
            .contains(&"/thisisafile".to_string()));
        assert!(layers[1]
            .manifest
            .path_whitelist
            .contains(&"/thisisadifferentfile".to_string()));
        // The top layer depends on the base layer.
        assert_eq!(layers[1].manifest.dependencies.len(), 1);
        assert!(layers[0].path.exists());
        assert!(layers[1].path.exists());
    }

    #[test]
    fn test_empty_layer_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = build_save_tar(
            dir.path(),
            json!({"myimage": {"latest": "only"}}),
            vec![SavedLayer {
                id: "only",
                parent: None,
                tar: Vec::new(),
            }],
        );
        let mut source = FileSource::open(&path).unwrap();
        let info = source.get_image_info("").unwrap();

        let output = TempDir::new().unwrap();
        let tmp = TempDir::new().unwrap();
        let layers = source
            .build_aci(&info, output.path(), tmp.path(), Compression::Gzip)
            .unwrap();
        assert_eq!(layers.len(), 1);
        // Only the injected stdio symlinks.
        assert_eq!(layers[0].manifest.path_whitelist.len(), 4);
    }

    #[test]
    fn test_ancestry_cycle_detected() {
        let dir = TempDir::new().unwrap();
        let path = build_save_tar(
            dir.path(),
            json!({"myimage": {"latest": "a"}}),
            vec![
                SavedLayer {
                    id: "a",
                    parent: Some("b"),
                    tar: layer_tar(&[("f", b"x")]),
                },
                SavedLayer {
                    id: "b",
                    parent: Some("a"),
                    tar: layer_tar(&[("g", b"y")]),
                },
            ],
        );
        let mut source = FileSource::open(&path).unwrap();
        assert!(matches!(
            source.get_image_info(""),
            Err(ConvertError::InvalidLayer(_))
        ));
    }
}
