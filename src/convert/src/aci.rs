//! App Container Image manifest schema and appc naming helpers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// appc spec version stamped into every produced manifest.
pub const ACI_SCHEMA_VERSION: &str = "0.8.11";

/// The only manifest kind this tool emits.
pub const IMAGE_MANIFEST_KIND: &str = "ImageManifest";

pub const APPC_DOCKER_REGISTRY_URL: &str = "appc.io/docker/registryurl";
pub const APPC_DOCKER_REPOSITORY: &str = "appc.io/docker/repository";
pub const APPC_DOCKER_IMAGE_ID: &str = "appc.io/docker/imageid";
pub const APPC_DOCKER_PARENT_IMAGE_ID: &str = "appc.io/docker/parentimageid";
pub const APPC_DOCKER_TAG: &str = "appc.io/docker/tag";
pub const APPC_DOCKER_MANIFEST_HASH: &str = "appc.io/docker/manifesthash";
pub const APPC_DOCKER_ORIGINAL_NAME: &str = "appc.io/docker/originalname";
pub const APPC_DOCKER_ENTRYPOINT: &str = "appc.io/docker/entrypoint";
pub const APPC_DOCKER_CMD: &str = "appc.io/docker/cmd";

/// ACI image manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AciManifest {
    #[serde(rename = "acKind")]
    pub ac_kind: String,
    #[serde(rename = "acVersion")]
    pub ac_version: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<App>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
    #[serde(
        rename = "pathWhitelist",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub path_whitelist: Vec<String>,
}

impl AciManifest {
    /// An empty manifest carrying only the kind, version and name.
    pub fn new(name: String) -> Self {
        Self {
            ac_kind: IMAGE_MANIFEST_KIND.to_string(),
            ac_version: ACI_SCHEMA_VERSION.to_string(),
            name,
            labels: Vec::new(),
            app: None,
            annotations: Vec::new(),
            dependencies: Vec::new(),
            path_whitelist: Vec::new(),
        }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.annotations
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub exec: Vec<String>,
    pub user: String,
    pub group: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<EnvironmentVariable>,
    #[serde(
        rename = "workingDirectory",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub working_directory: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,
    #[serde(rename = "mountPoints", default, skip_serializing_if = "Vec::is_empty")]
    pub mount_points: Vec<MountPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    pub protocol: String,
    pub port: u64,
    pub count: u64,
    #[serde(rename = "socketActivated")]
    pub socket_activated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountPoint {
    pub name: String,
    pub path: String,
    #[serde(rename = "readOnly", default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(rename = "imageName")]
    pub image_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

/// Sanitise a string into an AC identifier: lowercase, any character
/// outside `[a-z0-9._/~-]` becomes `-`, runs of `-` collapse, and
/// leading/trailing separators are trimmed so the result starts and ends
/// alphanumeric.
pub fn sanitize_ac_identifier(s: &str) -> String {
    sanitize(s, |c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '/' | '~' | '-')
    })
}

/// Sanitise a string into an AC name: lowercase alphanumerics and dashes.
pub fn sanitize_ac_name(s: &str) -> String {
    sanitize(s, |c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'
    })
}

fn sanitize(s: &str, allowed: impl Fn(char) -> bool) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_dash = false;
    for c in s.to_lowercase().chars() {
        if allowed(c) && c != '-' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed: &str = out.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    trimmed.to_string()
}

/// Translate a Docker os/arch pair to the appc equivalents.
///
/// Unknown pairs yield `None` so the caller emits no os/arch labels.
pub fn appc_os_arch(os: &str, arch: &str) -> Option<(String, String)> {
    if os.is_empty() {
        return None;
    }
    let appc_arch = match (os, arch) {
        (_, "") => "",
        ("linux" | "freebsd" | "darwin", "amd64") => "amd64",
        ("linux" | "freebsd" | "darwin", "386") => "i386",
        ("linux", "arm64") => "aarch64",
        ("linux" | "freebsd", "arm") => "armv7l",
        ("linux", "ppc64") => "ppc64",
        ("linux", "ppc64le") => "ppc64le",
        ("linux", "s390x") => "s390x",
        _ => return None,
    };
    match os {
        "linux" | "freebsd" | "darwin" => Some((os.to_string(), appc_arch.to_string())),
        _ => None,
    }
}

/// Insert a label only when both the key and the value are non-empty.
pub fn set_label(labels: &mut BTreeMap<String, String>, key: &str, value: &str) {
    if !key.is_empty() && !value.is_empty() {
        labels.insert(key.to_string(), value.to_string());
    }
}

/// Insert an annotation only when both the key and the value are non-empty.
pub fn set_annotation(annotations: &mut BTreeMap<String, String>, key: &str, value: &str) {
    if !key.is_empty() && !value.is_empty() {
        annotations.insert(key.to_string(), value.to_string());
    }
}

/// Convert a sorted map into the manifest's label list.
pub fn labels_from_map(map: BTreeMap<String, String>) -> Vec<Label> {
    map.into_iter()
        .map(|(name, value)| Label { name, value })
        .collect()
}

/// Convert a sorted map into the manifest's annotation list.
pub fn annotations_from_map(map: BTreeMap<String, String>) -> Vec<Annotation> {
    map.into_iter()
        .map(|(name, value)| Annotation { name, value })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(
            sanitize_ac_identifier("gcr.io/google-samples/node-hello-abc123"),
            "gcr.io/google-samples/node-hello-abc123"
        );
        assert_eq!(sanitize_ac_identifier("Repo:Tag"), "repo-tag");
        assert_eq!(sanitize_ac_identifier("a@@b"), "a-b");
        assert_eq!(sanitize_ac_identifier("/library/busybox-id"), "library/busybox-id");
    }

    #[test]
    fn test_sanitize_identifier_idempotent() {
        let inputs = [
            "Example.com/My App-1",
            "registry-1.docker.io/library/busybox-abcdef",
            "weird___name//with::stuff",
            "-leading-and-trailing-",
        ];
        for input in inputs {
            let once = sanitize_ac_identifier(input);
            assert_eq!(sanitize_ac_identifier(&once), once, "input {:?}", input);
        }
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_ac_name("80/tcp"), "80-tcp");
        assert_eq!(sanitize_ac_name("volume/var/lib"), "volume-var-lib");
        assert_eq!(sanitize_ac_name(sanitize_ac_name("8080/UDP").as_str()), "8080-udp");
    }

    #[test]
    fn test_appc_os_arch() {
        assert_eq!(
            appc_os_arch("linux", "amd64"),
            Some(("linux".to_string(), "amd64".to_string()))
        );
        assert_eq!(
            appc_os_arch("linux", "arm64"),
            Some(("linux".to_string(), "aarch64".to_string()))
        );
        assert_eq!(
            appc_os_arch("freebsd", "386"),
            Some(("freebsd".to_string(), "i386".to_string()))
        );
        assert_eq!(appc_os_arch("", ""), None);
        assert_eq!(appc_os_arch("templeos", "ia64"), None);
    }

    #[test]
    fn test_set_label() {
        let mut labels = BTreeMap::new();
        set_label(&mut labels, "", "amd64");
        set_label(&mut labels, "freebsd", "");
        set_label(&mut labels, "", "");
        assert!(labels.is_empty());

        set_label(&mut labels, "version", "1.2.3");
        set_label(&mut labels, "os", "linux");
        set_label(&mut labels, "arch", "aarch64");
        set_label(&mut labels, "arch", "amd64");
        assert_eq!(labels.get("arch").map(String::as_str), Some("amd64"));
        assert_eq!(labels.len(), 3);
    }

    #[test]
    fn test_set_annotation() {
        let mut annotations = BTreeMap::new();
        set_annotation(&mut annotations, "", "name");
        set_annotation(&mut annotations, "gentoo", "");
        assert!(annotations.is_empty());

        set_annotation(&mut annotations, "entrypoint", "/bin/bash");
        set_annotation(&mut annotations, "entrypoint", "/bin/sh");
        set_annotation(&mut annotations, "cmd", "-c");
        assert_eq!(
            annotations.get("entrypoint").map(String::as_str),
            Some("/bin/sh")
        );
        assert_eq!(annotations.len(), 2);
    }

    #[test]
    fn test_labels_sorted_lexicographically() {
        let mut map = BTreeMap::new();
        set_label(&mut map, "version", "latest");
        set_label(&mut map, "arch", "amd64");
        set_label(&mut map, "os", "linux");
        set_label(&mut map, "layer", "deadbeef");
        let labels = labels_from_map(map);
        let names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["arch", "layer", "os", "version"]);
    }

    #[test]
    fn test_manifest_round_trip() {
        let mut manifest = AciManifest::new("example.com/app-abc".to_string());
        manifest.labels = vec![Label {
            name: "version".to_string(),
            value: "latest".to_string(),
        }];
        manifest.path_whitelist = vec!["/a".to_string(), "/a/b".to_string()];

        let encoded = serde_json::to_string(&manifest).unwrap();
        let decoded: AciManifest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, manifest);
        assert_eq!(serde_json::to_string(&decoded).unwrap(), encoded);
    }

    #[test]
    fn test_empty_fields_omitted() {
        let manifest = AciManifest::new("example.com/app".to_string());
        let encoded = serde_json::to_string(&manifest).unwrap();
        assert!(!encoded.contains("dependencies"));
        assert!(!encoded.contains("pathWhitelist"));
        assert!(!encoded.contains("app"));
        assert!(encoded.contains("\"acKind\":\"ImageManifest\""));
    }
}
