//! Conversion orchestration: discovery, per-layer rewriting, optional
//! squashing, validation.

use std::path::{Path, PathBuf};

use docker2aci_core::config::{CommonConfig, FileConfig, RemoteConfig};
use docker2aci_core::error::Result;

use crate::backend::file::FileSource;
use crate::backend::remote::RemoteSource;
use crate::backend::ImageSource;
use crate::squash;
use crate::validate;

/// Convert an image from a remote registry. Returns the produced ACI
/// paths, base-first (a single element when squashing).
pub fn convert_remote_repo(image: &str, config: &RemoteConfig) -> Result<Vec<PathBuf>> {
    let mut source = RemoteSource::from_config(config);
    convert_with(&mut source, image, &config.common)
}

/// Convert an image from a "docker save" tar.
pub fn convert_saved_file(path: &Path, config: &FileConfig) -> Result<Vec<PathBuf>> {
    let mut source = FileSource::open(path)?;
    let selector = config.image.as_deref().unwrap_or("");
    convert_with(&mut source, selector, &config.common)
}

fn convert_with<B: ImageSource>(
    source: &mut B,
    input: &str,
    common: &CommonConfig,
) -> Result<Vec<PathBuf>> {
    let info = source.get_image_info(input)?;

    // When squashing, the per-layer ACIs are scratch files that go away
    // with the directory; without squashing they are the output.
    let scratch = if common.squash {
        Some(
            tempfile::Builder::new()
                .prefix("docker2aci-")
                .tempdir_in(&common.tmp_dir)?,
        )
    } else {
        None
    };
    let layers_dir = scratch
        .as_ref()
        .map(|d| d.path().to_path_buf())
        .unwrap_or_else(|| common.output_dir.clone());

    let layers = source.build_aci(&info, &layers_dir, &common.tmp_dir, common.compression)?;

    if common.squash {
        let output = squash::squash_layers(
            &layers,
            &info.reference,
            &common.output_dir,
            common.compression,
        )?;
        validate::validate_aci(&output)?;
        tracing::info!(output = %output.display(), "squashed image written");
        Ok(vec![output])
    } else {
        Ok(layers.into_iter().map(|l| l.path).collect())
    }
}
