//! Daemon configuration.
//!
//! Settings resolve in three layers: built-in defaults, then an
//! optional TOML file, then command-line flags. Later layers win.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use parley_protocol::{DEFAULT_MAX_FRAME, DEFAULT_PORT};

use crate::args::Args;

/// Lowest port the daemon will bind; everything below is privileged.
const MIN_PORT: u16 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("port {0} is out of range, use 1024-65535")]
    PortOutOfRange(u16),
}

/// On-disk configuration; every key is optional.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub address: Option<IpAddr>,
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub max_frame: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }
}

/// Fully resolved daemon settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub max_frame: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            data_dir: PathBuf::from("./parley-data"),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl Settings {
    /// Resolves settings from the optional config file and CLI flags.
    pub fn resolve(args: &Args) -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Some(path) = &args.config {
            settings.apply_file(FileConfig::load(path)?);
        }
        settings.apply_args(args);

        if settings.bind.port() < MIN_PORT {
            return Err(ConfigError::PortOutOfRange(settings.bind.port()));
        }
        Ok(settings)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(address) = file.address {
            self.bind.set_ip(address);
        }
        if let Some(port) = file.port {
            self.bind.set_port(port);
        }
        if let Some(dir) = file.data_dir {
            self.data_dir = dir;
        }
        if let Some(max_frame) = file.max_frame {
            self.max_frame = max_frame;
        }
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(address) = args.address {
            self.bind.set_ip(address);
        }
        if let Some(port) = args.port {
            self.bind.set_port(port);
        }
        if let Some(dir) = &args.data_dir {
            self.data_dir = dir.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_without_file_or_flags() {
        let args = Args::parse_from(["parleyd"]);
        let settings = Settings::resolve(&args).unwrap();
        assert_eq!(settings.bind.port(), DEFAULT_PORT);
        assert_eq!(settings.max_frame, DEFAULT_MAX_FRAME);
        assert_eq!(settings.data_dir, PathBuf::from("./parley-data"));
    }

    #[test]
    fn flags_override_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.toml");
        std::fs::write(&path, "address = \"127.0.0.1\"\nport = 7500\n").unwrap();

        let args = Args::parse_from([
            "parleyd",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "7600",
        ]);
        let settings = Settings::resolve(&args).unwrap();

        // Address comes from the file, port from the flag.
        assert_eq!(settings.bind, "127.0.0.1:7600".parse().unwrap());
    }

    #[test]
    fn privileged_ports_are_rejected() {
        let args = Args::parse_from(["parleyd", "--port", "80"]);
        match Settings::resolve(&args) {
            Err(ConfigError::PortOutOfRange(80)) => {}
            other => panic!("expected port error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();

        let args = Args::parse_from(["parleyd", "--config", path.to_str().unwrap()]);
        assert!(matches!(
            Settings::resolve(&args),
            Err(ConfigError::Parse { .. })
        ));
    }
}
