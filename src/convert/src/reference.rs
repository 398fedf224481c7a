//! Docker image reference parsing.
//!
//! Parses references like `gcr.io/google-samples/node-hello:1.0` or
//! `alpine@sha256:ea0d...` into structured components.

use docker2aci_core::error::{ConvertError, Result};

/// Default index when the reference carries no registry host.
pub const DEFAULT_INDEX_URL: &str = "registry-1.docker.io";

/// Default tag when neither a tag nor a digest is given.
const DEFAULT_TAG: &str = "latest";

/// Parsed Docker image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Index (registry) host, e.g. "registry-1.docker.io", "gcr.io".
    /// Empty for images read from a "docker save" tar.
    pub index_url: String,
    /// Repository path, e.g. "library/busybox".
    pub repository: String,
    /// Tag; `None` when the image is addressed by digest.
    pub tag: Option<String>,
    /// Digest, e.g. "sha256:ea0d...". Mutually exclusive with `tag`.
    pub digest: Option<String>,
    /// The reference string as the user typed it.
    pub original_name: String,
}

impl ImageReference {
    /// Parse a reference of the form `[indexURL/]repository[:tag | @digest]`.
    ///
    /// The first path segment is taken as the index when it contains a dot.
    /// One-segment repositories on the default index get the `library/`
    /// prefix; the tag defaults to `latest` unless a digest is given.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ConvertError::BadReference {
                reference: reference.to_string(),
                message: "empty image reference".to_string(),
            });
        }

        // Split off the digest first (@ separator).
        let (name_tag, digest) = match reference.rfind('@') {
            Some(at_pos) => {
                let digest_part = &reference[at_pos + 1..];
                if !digest_part.contains(':') {
                    return Err(ConvertError::BadReference {
                        reference: reference.to_string(),
                        message: "invalid digest, expected algorithm:hex".to_string(),
                    });
                }
                (&reference[..at_pos], Some(digest_part.to_string()))
            }
            None => (reference, None),
        };

        // Split the tag: a colon after the last slash.
        let (name, tag) = match split_tag(name_tag) {
            Some((name, tag)) => (name, Some(tag.to_string())),
            None => (name_tag, None),
        };

        let (index_url, mut repository) = split_index_repository(name);
        if repository.is_empty() {
            return Err(ConvertError::BadReference {
                reference: reference.to_string(),
                message: "empty repository".to_string(),
            });
        }
        if index_url == DEFAULT_INDEX_URL && !repository.contains('/') {
            repository = format!("library/{}", repository);
        }

        // Digest references carry no tag; everything else defaults to latest.
        let tag = if digest.is_some() {
            None
        } else {
            tag.or_else(|| Some(DEFAULT_TAG.to_string()))
        };

        Ok(ImageReference {
            index_url,
            repository,
            tag,
            digest,
            original_name: reference.to_string(),
        })
    }

    /// Build a reference for an image inside a "docker save" tar.
    ///
    /// Such images have no index; `selector` is `NAME[:TAG]`.
    pub fn for_file(selector: &str) -> Result<Self> {
        let selector = selector.trim();
        if selector.is_empty() {
            return Err(ConvertError::BadReference {
                reference: selector.to_string(),
                message: "empty image selector".to_string(),
            });
        }
        let (name, tag) = match split_tag(selector) {
            Some((name, tag)) => (name, tag.to_string()),
            None => (selector, DEFAULT_TAG.to_string()),
        };
        Ok(ImageReference {
            index_url: String::new(),
            repository: name.to_string(),
            tag: Some(tag),
            digest: None,
            original_name: selector.to_string(),
        })
    }

    /// The tag or digest used when talking to a v2 registry.
    pub fn manifest_reference(&self) -> &str {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest,
            (None, Some(tag)) => tag,
            (None, None) => DEFAULT_TAG,
        }
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.index_url.is_empty() {
            write!(f, "{}", self.repository)?;
        } else {
            write!(f, "{}/{}", self.index_url, self.repository)?;
        }
        if let Some(ref digest) = self.digest {
            write!(f, "@{}", digest)
        } else if let Some(ref tag) = self.tag {
            write!(f, ":{}", tag)
        } else {
            Ok(())
        }
    }
}

/// Split `name[:tag]`, where the colon must come after the last slash.
fn split_tag(name_tag: &str) -> Option<(&str, &str)> {
    let after_slash_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
    let after_slash = &name_tag[after_slash_start..];
    after_slash.rfind(':').map(|colon| {
        let colon = after_slash_start + colon;
        (&name_tag[..colon], &name_tag[colon + 1..])
    })
}

/// Split a name into index and repository. The first segment is an index
/// when it contains a dot; otherwise the default index is assumed.
fn split_index_repository(name: &str) -> (String, String) {
    if let Some(slash_pos) = name.find('/') {
        let first = &name[..slash_pos];
        if first.contains('.') {
            return (first.to_string(), name[slash_pos + 1..].to_string());
        }
    }
    (DEFAULT_INDEX_URL.to_string(), name.to_string())
}
