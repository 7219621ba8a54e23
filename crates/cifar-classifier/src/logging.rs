use std::path::Path;

use tracing_core::{Level, LevelFilter};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, Layer};

use crate::error::{ClassifierError, Result};

/// If a global tracing subscriber is not already configured, log to `file_path`
/// and to stderr, and add a panic hook pointing at the log file.
///
/// Returns whether this call installed the subscriber.
pub fn install_file_logger<P: AsRef<Path>>(file_path: P) -> Result<bool> {
    let path = file_path.as_ref();
    let file_name = path.file_name().ok_or_else(|| {
        ClassifierError::InvalidConfig(format!(
            "the log path '{}' must point to a file",
            path.display()
        ))
    })?;
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(directory)?;

    let writer = tracing_appender::rolling::never(directory, file_name);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(LevelFilter::INFO)
        .with_filter(filter_fn(|metadata| {
            if let Some(path) = metadata.module_path() {
                // The wgpu crate is logging too much, so we skip `info` level.
                if path.starts_with("wgpu") && *metadata.level() >= Level::INFO {
                    return false;
                }
            }
            true
        }));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(LevelFilter::INFO)
        .with_filter(filter_fn(|metadata| {
            metadata.module_path().is_some_and(|path| {
                path.starts_with(env!("CARGO_CRATE_NAME")) || path.starts_with("cifar10")
            })
        }));

    let installed = registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();
    if installed {
        update_panic_hook(path);
    }

    Ok(installed)
}

fn update_panic_hook(file_path: &Path) {
    let hook = std::panic::take_hook();
    let file_path = file_path.display().to_string();

    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC => {info}");
        eprintln!(
            "=== PANIC ===\nA fatal error happened, you can check the experiment logs here => \
             '{file_path}'\n============="
        );
        hook(info);
    }));
}
