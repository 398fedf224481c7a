//! docker2aci - convert Docker images to App Container Images.
//!
//! Images come either from a Docker registry (v1 or v2, speaking the
//! schema 1, schema 2 and OCI manifest formats) or from a tar produced by
//! "docker save". Every layer is rewritten into an ACI: the filesystem is
//! reparented under `rootfs/`, whiteouts are resolved into the manifest's
//! path whitelist and an ACI manifest is synthesised from the Docker
//! configuration. Optionally the layer chain is squashed into a single
//! flat ACI.

pub mod aci;
pub mod backend;
mod convert;
pub mod credentials;
pub mod image;
pub mod manifest;
pub mod reference;
pub mod registry;
pub mod rewrite;
pub mod squash;
pub mod tarball;
pub mod validate;

pub use aci::{AciManifest, ACI_SCHEMA_VERSION};
pub use backend::{ImageInfo, ImageSource};
pub use convert::{convert_remote_repo, convert_saved_file};
pub use credentials::{dockercfg_auth, get_index_name};
pub use reference::ImageReference;
pub use squash::ConvertedLayer;
pub use validate::manifest_from_aci;

pub use docker2aci_core::config::{
    CommonConfig, Compression, FileConfig, InsecureConfig, MediaTypeOption, MediaTypeSet,
    RegistryOption, RegistryOptionSet, RemoteConfig,
};
pub use docker2aci_core::error::{ConvertError, Result};
