use flexi_logger::{Age, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};

use crate::settings::ServerSettings;

/// Start the file logger. Keep the returned handle alive for the process lifetime.
pub fn init_logger(settings: &ServerSettings) -> anyhow::Result<LoggerHandle> {
    std::fs::create_dir_all(&settings.log_dir)?;

    let handle = Logger::try_with_str(&settings.log_spec)?
        .log_to_file(
            FileSpec::default()
                .directory(&settings.log_dir)
                .basename("fleet_server"),
        )
        .rotate(
            Criterion::Age(Age::Day),
            Naming::Numbers,
            Cleanup::KeepLogFiles(7),
        )
        .duplicate_to_stderr(Duplicate::Warn)
        .start()?;

    Ok(handle)
}
