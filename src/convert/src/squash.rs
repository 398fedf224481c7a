//! Layer squashing: flattens a chain of converted ACIs into a single ACI
//! equivalent to the rendered overlay.
//!
//! The top layer's path whitelist already encodes every whiteout applied on
//! the way up, so the rendered file set is exactly the whitelisted paths,
//! each owned by the highest layer that carries it.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use docker2aci_core::config::Compression;
use docker2aci_core::error::{ConvertError, Result};
use sha2::{Digest, Sha256};

use crate::aci::AciManifest;
use crate::reference::ImageReference;
use crate::tarball::{self, AciWriter};

/// One converted layer: the ACI on disk, its manifest and a content key.
#[derive(Debug)]
pub struct ConvertedLayer {
    pub path: PathBuf,
    pub manifest: AciManifest,
    /// sha256 digest of the ACI file bytes.
    pub key: String,
}

/// Digest the bytes of a file into a content key.
pub fn file_key(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Squash converted layers (base→top) into one ACI under `output_dir`.
pub fn squash_layers(
    layers: &[ConvertedLayer],
    reference: &ImageReference,
    output_dir: &Path,
    compression: Compression,
) -> Result<PathBuf> {
    let top = layers
        .last()
        .ok_or_else(|| ConvertError::InvalidLayer("no layers to squash".to_string()))?;

    tracing::debug!(layers = layers.len(), image = %reference, "squashing layers");

    // The rendered file set: paths surviving every whiteout up to the top.
    let rendered: HashSet<&str> = top
        .manifest
        .path_whitelist
        .iter()
        .map(String::as_str)
        .collect();

    // Top wins: walking top→base, the first layer carrying a rendered path
    // owns it.
    let mut owner: HashMap<String, usize> = HashMap::new();
    for (index, layer) in layers.iter().enumerate().rev() {
        for_each_entry(&layer.path, |entry| {
            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            if let Some(absolute) = rootfs_path(&name) {
                if rendered.contains(absolute.as_str()) && !owner.contains_key(&absolute) {
                    owner.insert(absolute, index);
                }
            }
            Ok(())
        })?;
    }

    let output = output_dir.join(squashed_file_name(reference));
    let mut builder = tar::Builder::new(AciWriter::create(&output, compression)?);

    let mut header = tarball::rootfs_dir_header();
    builder.append_data(&mut header, "rootfs", std::io::empty())?;

    for (index, layer) in layers.iter().enumerate() {
        for_each_entry(&layer.path, |mut entry| {
            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let absolute = match rootfs_path(&name) {
                Some(absolute) => absolute,
                None => return Ok(()),
            };
            if owner.get(&absolute) != Some(&index) {
                return Ok(());
            }
            let mut header = entry.header().clone();
            match header.entry_type() {
                tar::EntryType::Link | tar::EntryType::Symlink => {
                    let link = entry
                        .link_name_bytes()
                        .map(|b| String::from_utf8_lossy(&b).into_owned())
                        .unwrap_or_default();
                    builder.append_link(&mut header, &name, &link)?;
                }
                _ => {
                    builder.append_data(&mut header, &name, &mut entry)?;
                }
            }
            Ok(())
        })?;
    }

    let manifest = merge_manifest(&top.manifest);
    let encoded = serde_json::to_vec(&manifest)?;
    let mut header = tarball::manifest_header(encoded.len() as u64);
    builder.append_data(&mut header, "manifest", &encoded[..])?;

    builder.into_inner()?.finish()?;

    Ok(output)
}

/// Derive the squashed manifest from the top layer's: no dependencies, no
/// `layer` label, no path whitelist, and the `-<layerID>` name suffix
/// stripped.
fn merge_manifest(top: &AciManifest) -> AciManifest {
    let mut manifest = top.clone();
    manifest.dependencies.clear();
    manifest.labels.retain(|l| l.name != "layer");
    manifest.path_whitelist.clear();
    if let Some(pos) = manifest.name.rfind('-') {
        manifest.name.truncate(pos);
    }
    manifest
}

/// `<repository with '/'→'-'>[-<tag>].aci`
fn squashed_file_name(reference: &ImageReference) -> String {
    let mut name = reference.repository.replace('/', "-");
    if let Some(ref tag) = reference.tag {
        name.push('-');
        name.push_str(tag);
    }
    name.push_str(".aci");
    name
}

/// The whitelist path of a `rootfs/`-prefixed entry, or `None` for the
/// `rootfs` directory itself and the `manifest` entry.
fn rootfs_path(name: &str) -> Option<String> {
    name.strip_prefix("rootfs/")
        .map(|rest| format!("/{}", rest.trim_end_matches('/')))
}

fn for_each_entry<F>(path: &Path, mut f: F) -> Result<()>
where
    F: FnMut(tar::Entry<'_, tarball::DecompressedReader<File>>) -> Result<()>,
{
    let file = File::open(path)?;
    let mut archive = tar::Archive::new(tarball::decompressed(file)?);
    for entry in archive.entries()? {
        f(entry?)?;
    }
    Ok(())
}
