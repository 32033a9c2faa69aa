use crate::domain::settings::{LogRotation, LogSettings, DEFAULT_LOG_FILTER};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub struct LoggingGuard {
    // Flushes the file writer on drop
    _file: Option<WorkerGuard>,
}

fn rotation(rotation: LogRotation) -> Rotation {
    match rotation {
        LogRotation::Minutely => Rotation::MINUTELY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the configured filter;
/// an unparsable filter falls back to [`DEFAULT_LOG_FILTER`].
pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let mut rejected_filter = None;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(&settings.filter).unwrap_or_else(|e| {
            rejected_filter = Some(e);
            EnvFilter::new(DEFAULT_LOG_FILTER)
        })
    });

    let console_layer = settings.console.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_target(settings.show_target)
            .with_ansi(settings.ansi_colors)
    });

    let (file_layer, file_guard) = match &settings.log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::new(
                rotation(settings.rotation),
                dir,
                &settings.file_name_prefix,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(settings.show_file_line)
                .with_line_number(settings.show_file_line)
                .with_target(settings.show_target);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))?;

    if let Some(e) = rejected_filter {
        tracing::warn!(
            "Invalid log filter {:?} ({}), using {}",
            settings.filter,
            e,
            DEFAULT_LOG_FILTER
        );
    }
    if let Some(dir) = &settings.log_dir {
        tracing::info!("Logging to {}", dir.display());
    }

    Ok(LoggingGuard { _file: file_guard })
}
