//! Shared types for docker2aci: the error taxonomy and the conversion
//! configuration accepted by the entry points.

pub mod config;
pub mod error;

pub use config::{
    CommonConfig, Compression, FileConfig, InsecureConfig, MediaTypeOption, MediaTypeSet,
    RegistryOption, RegistryOptionSet, RemoteConfig,
};
pub use error::{ConvertError, Result};
