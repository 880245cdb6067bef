//! Command-line entry points: `serve` runs the HTTP+WebSocket control
//! plane, `pull` drives a single download from the terminal without
//! standing up a server, useful for scripting and smoke-testing the
//! engine directly.

use clap::{Parser, Subcommand};

use crate::config::{parse_platform, EngineConfig};
use crate::coord::{ImageCoordinate, Platform, Source};
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "fetchd", version, about = "Container image download engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP+WebSocket control plane.
    Serve {
        /// Override `FETCHD_BIND_ADDR` for this run.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Pull a single image to disk and print its final task record.
    Pull {
        /// Image name, e.g. "nginx" or "library/nginx".
        image: String,
        /// Tag or digest reference.
        #[arg(long, default_value = "latest")]
        tag: String,
        /// Registry source: dockerhub, quay, ghcr, or a custom host.
        #[arg(long, default_value = "dockerhub")]
        source: String,
        /// Platform selector, `os/architecture[/variant]`.
        #[arg(long)]
        platform: Option<String>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as Parser>::parse()
    }
}

/// Build the `ImageCoordinate`/`Platform` pair for a `pull` invocation.
pub fn pull_target(image: &str, tag: &str, source: &str, platform: Option<&str>) -> Result<(ImageCoordinate, Platform)> {
    let source = Source::parse(source);
    let coord = ImageCoordinate::new(source, image, tag)?;
    let platform = match platform {
        Some(p) => {
            let (os, architecture, variant) = parse_platform(p)?;
            Platform { os, architecture, variant }
        }
        None => Platform::default(),
    };
    Ok((coord, platform))
}

/// Apply CLI overrides on top of the environment-loaded configuration.
pub fn apply_overrides(mut config: EngineConfig, bind: Option<String>) -> EngineConfig {
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    config
}
