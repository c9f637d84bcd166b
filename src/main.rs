mod broker;
mod buffer;
mod codec;
mod config;
mod context;
mod error;
mod fs;
mod tree;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fuser::{MountOption, Session};
use log::{error, info};
use parking_lot::Mutex;

use config::Config;
use context::MqttFsContext;
use fs::MqttFs;

fn main() -> ExitCode {
    env_logger::init();
    let config = Config::parse();

    if let Err(msg) = config.validate() {
        error!("invalid configuration: {msg}");
        return ExitCode::FAILURE;
    }

    let notifier_source = Arc::new(Mutex::new(None));
    let ctx = match MqttFsContext::new(
        &config.host,
        config.port,
        Duration::from_secs(config.keepalive as u64),
        Duration::from_millis(config.holdback_ms),
        notifier_source.clone(),
    ) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!("failed to connect to broker at {}:{}: {e}", config.host, config.port);
            return ExitCode::FAILURE;
        }
    };

    let mut options = fs::default_mount_options("mqttfs");
    if config.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }

    let filesystem = MqttFs::new(ctx.clone());
    let session = match Session::new(filesystem, &config.mountpoint, &options) {
        Ok(session) => session,
        Err(e) => {
            error!("failed to create FUSE session: {e}");
            ctx.shutdown();
            return ExitCode::FAILURE;
        }
    };

    let background = match session.spawn() {
        Ok(bg) => bg,
        Err(e) => {
            error!("failed to mount at {}: {e}", config.mountpoint.display());
            ctx.shutdown();
            return ExitCode::FAILURE;
        }
    };
    *notifier_source.lock() = Some(background.notifier());

    info!(
        "mounted mqttfs at {} (broker {}:{})",
        config.mountpoint.display(),
        config.host,
        config.port
    );

    // Mount syscall/lifetime management and process-level signal
    // handling are delegated to `fuser` and the OS respectively; this
    // just keeps the mount (and the background session thread behind
    // it) alive until the process is killed or the filesystem is
    // unmounted out from under it.
    let _background = background;
    loop {
        std::thread::park();
    }
}
