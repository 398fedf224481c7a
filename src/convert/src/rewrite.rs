//! The layer rewriter: turns one Docker layer tar into an ACI.
//!
//! Entries are reparented under `rootfs/`, whiteout markers are dropped and
//! recorded, hardlink targets are rewritten, missing stdio symlinks are
//! injected and the synthesised manifest is appended last. The layer stream
//! is copied entry by entry; nothing is staged on the filesystem.

use std::collections::HashSet;
use std::io::{self, Read};
use std::path::Path;

use docker2aci_core::config::Compression;
use docker2aci_core::error::{ConvertError, Result};

use crate::aci::AciManifest;
use crate::tarball::{self, AciWriter};

/// Stdio symlinks Docker guarantees inside a container. stdout/stderr point
/// at /dev/console rather than /proc/self/fd/{1,2} so they keep working when
/// stdout is a Unix socket.
const STDIO_SYMLINKS: [(&str, &str); 4] = [
    ("/dev/stdin", "/proc/self/fd/0"),
    ("/dev/stdout", "/dev/console"),
    ("/dev/stderr", "/dev/console"),
    ("/dev/fd", "/proc/self/fd"),
];

/// Write one layer as an ACI at `output`.
///
/// `cur_pwl` is the cumulative path whitelist of all lower layers; the
/// returned manifest carries the updated whitelist for the next layer.
pub fn write_aci<R: Read>(
    layer: R,
    mut manifest: AciManifest,
    cur_pwl: &[String],
    output: &Path,
    compression: Compression,
) -> Result<AciManifest> {
    let mut builder = tar::Builder::new(AciWriter::create(output, compression)?);

    let mut header = tarball::rootfs_dir_header();
    builder.append_data(&mut header, "rootfs", io::empty())?;

    let mut pwl: Vec<String> = cur_pwl.to_vec();
    let mut pwl_seen: HashSet<String> = pwl.iter().cloned().collect();
    let mut file_map: HashSet<String> = HashSet::new();
    let mut written: HashSet<String> = HashSet::new();
    let mut whiteouts: Vec<String> = Vec::new();

    let mut archive = tar::Archive::new(tarball::decompressed(layer)?);
    let mut entries_seen = 0usize;
    for entry in archive.entries()? {
        let mut entry = match entry {
            Ok(entry) => entry,
            // Empty layers produced by "docker save" are not valid tar
            // files; a stream that fails before yielding a single entry
            // still converts to an ACI with just rootfs/ and the manifest.
            Err(err) if entries_seen == 0 => {
                tracing::debug!(error = %err, "treating unreadable layer as empty");
                break;
            }
            Err(err) => return Err(err.into()),
        };
        entries_seen += 1;

        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let name = clean_entry_name(&name);
        if name.is_empty() {
            continue;
        }
        let rootfs_name = format!("rootfs/{}", name);
        let absolute_path = format!("/{}", name);

        if absolute_path == "/dev" && entry.header().entry_type() != tar::EntryType::Directory {
            return Err(ConvertError::InvalidLayer(
                "\"/dev\" is not a directory".to_string(),
            ));
        }

        file_map.insert(absolute_path.clone());
        if let Some(whiteout) = whiteout_target(&absolute_path) {
            whiteouts.push(whiteout);
            continue;
        }

        let mut header = entry.header().clone();
        match header.entry_type() {
            tar::EntryType::Link => {
                let link = entry
                    .link_name_bytes()
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_default();
                let link = format!("rootfs/{}", clean_entry_name(&link));
                builder.append_link(&mut header, &rootfs_name, &link)?;
            }
            tar::EntryType::Symlink => {
                let link = entry
                    .link_name_bytes()
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_default();
                builder.append_link(&mut header, &rootfs_name, &link)?;
            }
            _ => {
                builder.append_data(&mut header, &rootfs_name, &mut entry)?;
            }
        }

        written.insert(absolute_path.clone());
        if pwl_seen.insert(absolute_path.clone()) {
            pwl.push(absolute_path);
        }
    }

    let mut pwl = subtract_whiteouts(pwl, &whiteouts, &written);

    for (name, target) in STDIO_SYMLINKS {
        if file_map.contains(name) {
            continue;
        }
        let mut header = tarball::epoch_header();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        builder.append_link(&mut header, format!("rootfs{}", name), target)?;
        if !pwl.iter().any(|p| p == name) {
            pwl.push(name.to_string());
        }
    }

    pwl.sort();
    manifest.path_whitelist = pwl;

    let encoded = serde_json::to_vec(&manifest)?;
    let mut header = tarball::manifest_header(encoded.len() as u64);
    builder.append_data(&mut header, "manifest", &encoded[..])?;

    builder.into_inner()?.finish()?;

    Ok(manifest)
}

/// Strip `./` prefixes and trailing slashes from a tar entry name. The
/// archive-root entry cleans to the empty string.
fn clean_entry_name(name: &str) -> String {
    let mut name = name.trim_start_matches('/');
    while let Some(rest) = name.strip_prefix("./") {
        name = rest;
    }
    let name = name.trim_end_matches('/');
    if name == "." {
        return String::new();
    }
    name.to_string()
}

/// Classify a whiteout entry. Returns the whited-out path: the containing
/// directory for an opaque marker, the hidden sibling otherwise.
fn whiteout_target(absolute_path: &str) -> Option<String> {
    if !absolute_path.contains("/.wh.") {
        return None;
    }
    let (parent, base) = match absolute_path.rfind('/') {
        Some(0) => ("/", &absolute_path[1..]),
        Some(pos) => (&absolute_path[..pos], &absolute_path[pos + 1..]),
        None => return None,
    };
    if base == ".wh..wh..opq" {
        Some(parent.to_string())
    } else {
        Some(absolute_path.replacen(".wh.", "", 1))
    }
}

/// Remove from the whitelist every path with a whited-out ancestor
/// (including the path itself). Whiteouts delete lower-layer content, so
/// paths in `current_layer` — written by the layer that declared the
/// whiteouts — are kept. The result is sorted so manifest output is
/// deterministic.
pub fn subtract_whiteouts(
    path_whitelist: Vec<String>,
    whiteouts: &[String],
    current_layer: &HashSet<String>,
) -> Vec<String> {
    let mut kept: Vec<String> = path_whitelist
        .into_iter()
        .filter(|path| {
            if current_layer.contains(path.as_str()) {
                return true;
            }
            let mut cur: &str = path;
            while cur != "/" {
                if whiteouts.iter().any(|w| w == cur) {
                    return false;
                }
                cur = match cur.rfind('/') {
                    Some(0) => "/",
                    Some(pos) => &cur[..pos],
                    None => return true,
                };
            }
            true
        })
        .collect();
    kept.sort();
    kept
}
