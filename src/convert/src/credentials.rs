//! Registry credentials from the Docker config files.
//!
//! Looks up `~/.docker/config.json` first and falls back to the legacy
//! `~/.dockercfg`. Auth entries are base64-encoded `user:password` pairs.

use std::collections::HashMap;
use std::path::Path;

use base64::Engine;
use docker2aci_core::error::{ConvertError, Result};
use serde::Deserialize;

use crate::reference::{ImageReference, DEFAULT_INDEX_URL};

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: String,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

/// The index a reference's credentials are filed under.
pub fn get_index_name(reference: &str) -> String {
    match ImageReference::parse(reference) {
        Ok(parsed) => parsed.index_url,
        Err(_) => DEFAULT_INDEX_URL.to_string(),
    }
}

/// Credentials for `index_url` from the user's Docker config files.
/// Returns `(None, None)` when no entry exists.
pub fn dockercfg_auth(index_url: &str) -> Result<(Option<String>, Option<String>)> {
    let home = match dirs::home_dir() {
        Some(home) => home,
        None => return Ok((None, None)),
    };
    dockercfg_auth_from(
        &home.join(".docker").join("config.json"),
        &home.join(".dockercfg"),
        index_url,
    )
}

fn dockercfg_auth_from(
    config_json: &Path,
    dockercfg: &Path,
    index_url: &str,
) -> Result<(Option<String>, Option<String>)> {
    let auths = if config_json.exists() {
        let data = std::fs::read_to_string(config_json)?;
        let config: DockerConfig = serde_json::from_str(&data)?;
        config.auths
    } else if dockercfg.exists() {
        let data = std::fs::read_to_string(dockercfg)?;
        serde_json::from_str(&data)?
    } else {
        return Ok((None, None));
    };

    for key in candidate_keys(index_url) {
        if let Some(entry) = auths.get(&key) {
            if entry.auth.is_empty() {
                continue;
            }
            let (user, password) = decode_docker_auth(&entry.auth)?;
            return Ok((Some(user), Some(password)));
        }
    }
    Ok((None, None))
}

/// Keys an index may be filed under. Docker Hub historically used the
/// full v1 endpoint URL.
fn candidate_keys(index_url: &str) -> Vec<String> {
    let mut keys = vec![
        index_url.to_string(),
        format!("https://{}", index_url),
        format!("https://{}/v1/", index_url),
    ];
    if index_url == DEFAULT_INDEX_URL || index_url == "docker.io" {
        keys.push("https://index.docker.io/v1/".to_string());
        keys.push("index.docker.io".to_string());
    }
    keys
}

/// Decode a base64 `user:password` auth entry.
fn decode_docker_auth(encoded: &str) -> Result<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|err| ConvertError::ConfigInvalid(format!("invalid auth entry: {}", err)))?;
    let decoded = String::from_utf8_lossy(&decoded).into_owned();
    let (user, password) = decoded.split_once(':').ok_or_else(|| {
        ConvertError::ConfigInvalid("invalid auth configuration file".to_string())
    })?;
    Ok((
        user.to_string(),
        password.trim_end_matches('\0').to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn auth_paths(home: &Path) -> (PathBuf, PathBuf) {
        (
            home.join(".docker").join("config.json"),
            home.join(".dockercfg"),
        )
    }

    fn encode(user: &str, password: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password))
    }

    #[test]
    fn test_decode_docker_auth() {
        let (user, password) = decode_docker_auth(&encode("alice", "s3cret")).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(password, "s3cret");
    }

    #[test]
    fn test_decode_docker_auth_nul_padding() {
        let (_, password) = decode_docker_auth(&encode("bob", "pw\0\0")).unwrap();
        assert_eq!(password, "pw");
    }

    #[test]
    fn test_decode_docker_auth_malformed() {
        assert!(decode_docker_auth("!!!").is_err());
        let no_colon = base64::engine::general_purpose::STANDARD.encode("nocolon");
        assert!(decode_docker_auth(&no_colon).is_err());
    }

    #[test]
    fn test_config_json_lookup() {
        let home = TempDir::new().unwrap();
        let (config_json, dockercfg) = auth_paths(home.path());
        std::fs::create_dir_all(config_json.parent().unwrap()).unwrap();
        std::fs::write(
            &config_json,
            format!(
                r#"{{"auths": {{"gcr.io": {{"auth": "{}"}}}}}}"#,
                encode("user", "pass")
            ),
        )
        .unwrap();

        let (user, password) =
            dockercfg_auth_from(&config_json, &dockercfg, "gcr.io").unwrap();
        assert_eq!(user.as_deref(), Some("user"));
        assert_eq!(password.as_deref(), Some("pass"));

        let (user, password) =
            dockercfg_auth_from(&config_json, &dockercfg, "quay.io").unwrap();
        assert_eq!(user, None);
        assert_eq!(password, None);
    }

    #[test]
    fn test_legacy_dockercfg_lookup() {
        let home = TempDir::new().unwrap();
        let (config_json, dockercfg) = auth_paths(home.path());
        std::fs::write(
            &dockercfg,
            format!(
                r#"{{"https://index.docker.io/v1/": {{"auth": "{}"}}}}"#,
                encode("hubuser", "hubpass")
            ),
        )
        .unwrap();

        let (user, _) =
            dockercfg_auth_from(&config_json, &dockercfg, DEFAULT_INDEX_URL).unwrap();
        assert_eq!(user.as_deref(), Some("hubuser"));
    }

    #[test]
    fn test_missing_files() {
        let home = TempDir::new().unwrap();
        let (config_json, dockercfg) = auth_paths(home.path());
        let (user, password) =
            dockercfg_auth_from(&config_json, &dockercfg, "gcr.io").unwrap();
        assert_eq!(user, None);
        assert_eq!(password, None);
    }

    #[test]
    fn test_get_index_name() {
        assert_eq!(get_index_name("busybox"), "registry-1.docker.io");
        assert_eq!(get_index_name("gcr.io/foo/bar:1"), "gcr.io");
    }
}
