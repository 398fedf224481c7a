//! Image sources: where Docker layers come from.
//!
//! Two implementations of a common contract: [`remote::RemoteSource`] pulls
//! from a Docker registry, [`file::FileSource`] reads a "docker save" tar.

pub mod file;
pub mod remote;

use std::fs::File;
use std::path::{Path, PathBuf};

use docker2aci_core::config::Compression;
use docker2aci_core::error::Result;

use crate::aci::AciManifest;
use crate::image::LayerMetadata;
use crate::reference::ImageReference;
use crate::rewrite;
use crate::squash::{self, ConvertedLayer};
use crate::validate;

/// What a backend discovers about an image before conversion starts.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Layer identifiers, base-first.
    pub layer_ids: Vec<String>,
    /// Digest of the registry manifest; empty for v1 and file sources.
    pub manifest_hash: String,
    /// The canonical parsed reference.
    pub reference: ImageReference,
}

/// A place Docker layers can be converted from.
pub trait ImageSource {
    /// Discover the layer chain and canonical reference for `input`.
    fn get_image_info(&mut self, input: &str) -> Result<ImageInfo>;

    /// Convert every layer to an ACI in `output_dir`, base-first, threading
    /// the cumulative path whitelist from layer to layer.
    fn build_aci(
        &mut self,
        info: &ImageInfo,
        output_dir: &Path,
        tmp_dir: &Path,
        compression: Compression,
    ) -> Result<Vec<ConvertedLayer>>;
}

/// Output file name for one layer's ACI.
pub(crate) fn aci_file_name(
    reference: &ImageReference,
    layer: &LayerMetadata,
    layer_number: usize,
) -> String {
    let mut name = format!("{}-{}", reference.repository.replace('/', "-"), layer.id);
    if let Some(ref tag) = reference.tag {
        name.push('-');
        name.push_str(tag);
    }
    if !layer.os.is_empty() {
        name.push('-');
        name.push_str(&layer.os);
        if !layer.architecture.is_empty() {
            name.push('-');
            name.push_str(&layer.architecture);
        }
    }
    name.push_str(&format!("-{}.aci", layer_number));
    name
}

/// Rewrite one layer file into a validated ACI.
pub(crate) fn generate_aci(
    layer_file: File,
    manifest: AciManifest,
    output_path: PathBuf,
    cur_pwl: &[String],
    compression: Compression,
) -> Result<ConvertedLayer> {
    let manifest = rewrite::write_aci(layer_file, manifest, cur_pwl, &output_path, compression)?;
    validate::validate_aci(&output_path)?;
    let key = squash::file_key(&output_path)?;
    Ok(ConvertedLayer {
        path: output_path,
        manifest,
        key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aci_file_name() {
        let reference = ImageReference::parse("gcr.io/google-samples/node-hello:1.0").unwrap();
        let layer = LayerMetadata {
            id: "abc123".to_string(),
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            ..Default::default()
        };
        assert_eq!(
            aci_file_name(&reference, &layer, 0),
            "google-samples-node-hello-abc123-1.0-linux-amd64-0.aci"
        );
    }

    #[test]
    fn test_aci_file_name_minimal() {
        let reference = ImageReference::parse("busybox@sha256:abc").unwrap();
        let layer = LayerMetadata {
            id: "abc123".to_string(),
            ..Default::default()
        };
        assert_eq!(
            aci_file_name(&reference, &layer, 2),
            "library-busybox-abc123-2.aci"
        );
    }
}
