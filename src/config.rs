//! CLI surface, mirroring `fuser`'s own `examples/common/args.rs`
//! pattern: a `clap::Parser` derive struct with scalar options given
//! `default_value_t`s, validated once in `main` before anything is
//! connected or mounted.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about = "Mount an MQTT broker's topic namespace as a FUSE filesystem")]
pub struct Config {
    /// Directory to mount the filesystem at.
    pub mountpoint: PathBuf,

    /// Broker hostname or address.
    #[clap(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Broker TCP port.
    #[clap(long, default_value_t = 1883)]
    pub port: u16,

    /// Keepalive interval advertised in CONNECT, in seconds.
    #[clap(long, default_value_t = 60)]
    pub keepalive: u16,

    /// Delay applied to every outbound publish before it is sent, in
    /// milliseconds.
    #[clap(long, default_value_t = 0)]
    pub holdback_ms: u64,

    /// Automatically unmount on process exit.
    #[clap(long)]
    pub auto_unmount: bool,
}

impl Config {
    /// Validate fields clap itself can't enforce (the mountpoint must
    /// exist and be a directory; the broker port and keepalive must be
    /// nonzero).
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("port must be nonzero".to_string());
        }
        if self.keepalive == 0 {
            return Err("keepalive must be nonzero".to_string());
        }
        if !self.mountpoint.is_dir() {
            return Err(format!(
                "mountpoint {} does not exist or is not a directory",
                self.mountpoint.display()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_port() {
        let cfg = Config {
            mountpoint: PathBuf::from("."),
            host: "localhost".to_string(),
            port: 0,
            keepalive: 60,
            holdback_ms: 0,
            auto_unmount: false,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_keepalive() {
        let cfg = Config {
            mountpoint: PathBuf::from("."),
            host: "localhost".to_string(),
            port: 1883,
            keepalive: 0,
            holdback_ms: 0,
            auto_unmount: false,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_missing_mountpoint() {
        let cfg = Config {
            mountpoint: PathBuf::from("/definitely/not/a/real/path/mqttfs-test"),
            host: "localhost".to_string(),
            port: 1883,
            keepalive: 60,
            holdback_ms: 0,
            auto_unmount: false,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            mountpoint: dir.path().to_path_buf(),
            host: "localhost".to_string(),
            port: 1883,
            keepalive: 60,
            holdback_ms: 0,
            auto_unmount: false,
        };
        assert!(cfg.validate().is_ok());
    }
}
