//! Structural validation of produced ACIs.
//!
//! Re-opens an ACI and checks the archive shape: a parseable `manifest`
//! entry and nothing outside `rootfs/`.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use docker2aci_core::error::{ConvertError, Result};

use crate::aci::AciManifest;
use crate::tarball;

/// Validate the archive at `path`.
pub fn validate_aci(path: &Path) -> Result<()> {
    manifest_from_aci(path).map(|_| ())
}

/// Extract and parse the manifest of an ACI, validating the archive layout
/// along the way.
pub fn manifest_from_aci(path: &Path) -> Result<AciManifest> {
    let file = File::open(path)?;
    let mut archive = tar::Archive::new(tarball::decompressed(file)?);

    let mut manifest: Option<AciManifest> = None;
    let mut saw_rootfs = false;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let name = name.trim_end_matches('/');
        if name == "manifest" {
            if manifest.is_some() {
                return Err(ConvertError::AciValidationFailed(
                    "duplicate manifest entry".to_string(),
                ));
            }
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            manifest = Some(serde_json::from_slice(&data).map_err(|err| {
                ConvertError::AciValidationFailed(format!("bad manifest: {}", err))
            })?);
        } else if name == "rootfs" {
            saw_rootfs = true;
        } else if !name.starts_with("rootfs/") {
            return Err(ConvertError::AciValidationFailed(format!(
                "entry {:?} outside rootfs/",
                name
            )));
        }
    }

    if !saw_rootfs {
        return Err(ConvertError::AciValidationFailed(
            "missing rootfs directory".to_string(),
        ));
    }
    manifest.ok_or_else(|| {
        ConvertError::AciValidationFailed("missing manifest entry".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aci::AciManifest;
    use crate::rewrite::write_aci;
    use docker2aci_core::config::Compression;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_validate_produced_aci() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.aci");
        let manifest = AciManifest::new("example.com/img-abc".to_string());
        write_aci(
            Cursor::new(Vec::new()),
            manifest,
            &[],
            &path,
            Compression::Gzip,
        )
        .unwrap();

        validate_aci(&path).unwrap();
        let manifest = manifest_from_aci(&path).unwrap();
        assert_eq!(manifest.name, "example.com/img-abc");
    }

    #[test]
    fn test_reject_stray_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.aci");
        let mut builder = tar::Builder::new(std::fs::File::create(&path).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(2);
        builder.append_data(&mut header, "stray", &b"xx"[..]).unwrap();
        builder.into_inner().unwrap();

        assert!(matches!(
            validate_aci(&path),
            Err(ConvertError::AciValidationFailed(_))
        ));
    }

    #[test]
    fn test_reject_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.aci");
        let mut builder = tar::Builder::new(std::fs::File::create(&path).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        builder.append_data(&mut header, "rootfs", &b""[..]).unwrap();
        builder.into_inner().unwrap();

        assert!(matches!(
            validate_aci(&path),
            Err(ConvertError::AciValidationFailed(_))
        ));
    }
}
