//! Conversion configuration types.

use std::path::PathBuf;

/// Docker V2.1 manifest media type.
pub const MEDIA_TYPE_DOCKER_V21_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v1+json";
/// Docker V2.1 signed manifest media type.
pub const MEDIA_TYPE_DOCKER_V21_SIGNED_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// Docker V2.2 manifest media type.
pub const MEDIA_TYPE_DOCKER_V22_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
/// Docker V2.2 image config media type.
pub const MEDIA_TYPE_DOCKER_V22_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
/// Docker V2.2 layer media type.
pub const MEDIA_TYPE_DOCKER_V22_ROOTFS: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";
/// OCI V1 manifest media type.
pub const MEDIA_TYPE_OCI_V1_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI V1 image config media type.
pub const MEDIA_TYPE_OCI_V1_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// OCI V1 layer media type.
pub const MEDIA_TYPE_OCI_V1_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Compression applied to produced ACIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Plain tar output.
    None,
    /// Gzipped tar output (default).
    Gzip,
}

impl Default for Compression {
    fn default() -> Self {
        Self::Gzip
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Gzip => write!(f, "gzip"),
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            _ => Err(format!(
                "unknown compression method: '{}' (supported: gzip, none)",
                s
            )),
        }
    }
}

/// Registry protocol generations the remote backend may speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryOption {
    V1,
    V2,
}

/// Set of allowed registry protocols. An empty set allows everything.
#[derive(Debug, Clone, Default)]
pub struct RegistryOptionSet(pub Vec<RegistryOption>);

impl RegistryOptionSet {
    pub fn allows_v1(&self) -> bool {
        self.0.is_empty() || self.0.contains(&RegistryOption::V1)
    }

    pub fn allows_v2(&self) -> bool {
        self.0.is_empty() || self.0.contains(&RegistryOption::V2)
    }
}

/// Manifest schema families the remote backend may accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaTypeOption {
    DockerV21,
    DockerV22,
    OciV1,
}

/// Set of accepted manifest families. An empty set accepts everything.
#[derive(Debug, Clone, Default)]
pub struct MediaTypeSet(pub Vec<MediaTypeOption>);

impl MediaTypeSet {
    fn selects(&self, option: MediaTypeOption) -> bool {
        self.0.is_empty() || self.0.contains(&option)
    }

    /// Manifest media types to offer in the Accept header.
    pub fn manifest_media_types(&self) -> Vec<&'static str> {
        let mut types = Vec::new();
        if self.selects(MediaTypeOption::DockerV21) {
            types.push(MEDIA_TYPE_DOCKER_V21_MANIFEST);
            types.push(MEDIA_TYPE_DOCKER_V21_SIGNED_MANIFEST);
        }
        if self.selects(MediaTypeOption::DockerV22) {
            types.push(MEDIA_TYPE_DOCKER_V22_MANIFEST);
        }
        if self.selects(MediaTypeOption::OciV1) {
            types.push(MEDIA_TYPE_OCI_V1_MANIFEST);
        }
        types
    }

    /// Image config media types we recognise for the selected families.
    pub fn config_media_types(&self) -> Vec<&'static str> {
        let mut types = Vec::new();
        if self.selects(MediaTypeOption::DockerV22) {
            types.push(MEDIA_TYPE_DOCKER_V22_CONFIG);
        }
        if self.selects(MediaTypeOption::OciV1) {
            types.push(MEDIA_TYPE_OCI_V1_CONFIG);
        }
        types
    }

    /// Layer media types we recognise for the selected families.
    pub fn layer_media_types(&self) -> Vec<&'static str> {
        let mut types = Vec::new();
        if self.selects(MediaTypeOption::DockerV22) {
            types.push(MEDIA_TYPE_DOCKER_V22_ROOTFS);
        }
        if self.selects(MediaTypeOption::OciV1) {
            types.push(MEDIA_TYPE_OCI_V1_LAYER);
        }
        types
    }
}

/// Options shared by every conversion entry point.
#[derive(Debug, Clone)]
pub struct CommonConfig {
    /// Squash all layers into a single ACI.
    pub squash: bool,
    /// Directory the produced ACIs are written to.
    pub output_dir: PathBuf,
    /// Base directory for per-conversion scratch space.
    pub tmp_dir: PathBuf,
    /// Compression of the produced ACIs.
    pub compression: Compression,
}

/// TLS/transport relaxations for the remote backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsecureConfig {
    /// Skip TLS certificate verification.
    pub skip_verify: bool,
    /// Fall back to plain HTTP when HTTPS is unavailable.
    pub allow_http: bool,
}

/// Configuration for converting from a remote registry.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub common: CommonConfig,
    pub username: Option<String>,
    pub password: Option<String>,
    pub insecure: InsecureConfig,
    /// Registry protocols to try. Empty means both.
    pub registry_options: RegistryOptionSet,
    /// Manifest families to accept. Empty means all.
    pub media_types: MediaTypeSet,
}

/// Configuration for converting from a "docker save" tar.
#[derive(Debug, Clone)]
pub struct FileConfig {
    pub common: CommonConfig,
    /// Selects an image when the tar contains several. Format: NAME[:TAG].
    pub image: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_from_str() {
        assert_eq!("gzip".parse::<Compression>().unwrap(), Compression::Gzip);
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::None);
        assert!("zstd".parse::<Compression>().is_err());
    }

    #[test]
    fn test_registry_option_set() {
        let cases = [
            (vec![RegistryOption::V1], true, false),
            (vec![RegistryOption::V2], false, true),
            (vec![RegistryOption::V1, RegistryOption::V2], true, true),
            (vec![], true, true),
        ];
        for (options, v1, v2) in cases {
            let set = RegistryOptionSet(options);
            assert_eq!(set.allows_v1(), v1);
            assert_eq!(set.allows_v2(), v2);
        }
    }

    #[test]
    fn test_media_type_set_single_family() {
        let set = MediaTypeSet(vec![MediaTypeOption::DockerV21]);
        assert_eq!(
            set.manifest_media_types(),
            vec![
                MEDIA_TYPE_DOCKER_V21_MANIFEST,
                MEDIA_TYPE_DOCKER_V21_SIGNED_MANIFEST
            ]
        );
        assert!(set.config_media_types().is_empty());
        assert!(set.layer_media_types().is_empty());

        let set = MediaTypeSet(vec![MediaTypeOption::DockerV22]);
        assert_eq!(set.manifest_media_types(), vec![MEDIA_TYPE_DOCKER_V22_MANIFEST]);
        assert_eq!(set.config_media_types(), vec![MEDIA_TYPE_DOCKER_V22_CONFIG]);
        assert_eq!(set.layer_media_types(), vec![MEDIA_TYPE_DOCKER_V22_ROOTFS]);
    }

    #[test]
    fn test_media_type_set_empty_accepts_all() {
        let set = MediaTypeSet::default();
        assert_eq!(set.manifest_media_types().len(), 4);
        assert_eq!(set.config_media_types().len(), 2);
        assert_eq!(set.layer_media_types().len(), 2);
    }

    #[test]
    fn test_media_type_set_mixed() {
        let set = MediaTypeSet(vec![MediaTypeOption::DockerV21, MediaTypeOption::OciV1]);
        assert!(set
            .manifest_media_types()
            .contains(&MEDIA_TYPE_OCI_V1_MANIFEST));
        assert_eq!(set.config_media_types(), vec![MEDIA_TYPE_OCI_V1_CONFIG]);
        assert_eq!(set.layer_media_types(), vec![MEDIA_TYPE_OCI_V1_LAYER]);
    }
}
