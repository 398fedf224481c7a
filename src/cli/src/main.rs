//! docker2aci CLI entry point.

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use docker2aci::{
    convert_remote_repo, convert_saved_file, manifest_from_aci, CommonConfig, Compression,
    FileConfig, InsecureConfig, MediaTypeSet, RegistryOptionSet, RemoteConfig,
};

/// Convert a Docker image to one or more ACIs.
#[derive(Parser)]
#[command(name = "docker2aci", version, about)]
struct Cli {
    /// docker://[REGISTRYURL/]IMAGE_NAME[:TAG], or the path to a file
    /// generated with "docker save"
    image: String,

    /// Don't squash layers and output every layer as ACI
    #[arg(long)]
    nosquash: bool,

    /// When converting a local file, selects a particular image to
    /// convert. Format: IMAGE_NAME[:TAG]
    #[arg(long = "image", value_name = "NAME[:TAG]")]
    selector: Option<String>,

    /// Enables debug messages
    #[arg(long)]
    debug: bool,

    /// Uses unencrypted connections when fetching images
    #[arg(long)]
    insecure: bool,

    /// Type of compression to use; allowed values: gzip, none
    #[arg(long, default_value = "gzip")]
    compression: Compression,
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let common = CommonConfig {
        squash: !cli.nosquash,
        output_dir: PathBuf::from("."),
        tmp_dir: std::env::temp_dir(),
        compression: cli.compression,
    };

    let aci_paths = if let Some(image) = cli.image.strip_prefix("docker://") {
        if cli.selector.is_some() {
            return Err("flag --image works only with files".into());
        }

        let index = docker2aci::get_index_name(image);
        let (username, password) = docker2aci::dockercfg_auth(&index)?;

        let config = RemoteConfig {
            common,
            username,
            password,
            insecure: InsecureConfig {
                skip_verify: cli.insecure,
                allow_http: cli.insecure,
            },
            registry_options: RegistryOptionSet::default(),
            media_types: MediaTypeSet::default(),
        };
        convert_remote_repo(image, &config)?
    } else {
        let config = FileConfig {
            common,
            image: cli.selector,
        };
        convert_saved_file(Path::new(&cli.image), &config)?
    };

    // The last manifest carries everything accumulated over the chain;
    // when squashing it is the only one.
    if let Some(last) = aci_paths.last() {
        let manifest = manifest_from_aci(last)?;
        print_converted_volumes(&manifest);
        print_converted_ports(&manifest);
    }

    println!("\nGenerated ACI(s):");
    for path in &aci_paths {
        println!("{}", path.display());
    }

    Ok(())
}

fn print_converted_volumes(manifest: &docker2aci::AciManifest) {
    if let Some(app) = &manifest.app {
        if !app.mount_points.is_empty() {
            println!("\nConverted volumes:");
            for mp in &app.mount_points {
                println!(
                    "\tname: {:?}, path: {:?}, readOnly: {}",
                    mp.name, mp.path, mp.read_only
                );
            }
        }
    }
}

fn print_converted_ports(manifest: &docker2aci::AciManifest) {
    if let Some(app) = &manifest.app {
        if !app.ports.is_empty() {
            println!("\nConverted ports:");
            for port in &app.ports {
                println!(
                    "\tname: {:?}, protocol: {:?}, port: {}, count: {}, socketActivated: {}",
                    port.name, port.protocol, port.port, port.count, port.socket_activated
                );
            }
        }
    }
}
