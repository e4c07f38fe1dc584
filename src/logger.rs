use std::env;
use log::LevelFilter;
use env_logger::Builder;
use std::io::Write;

/// Initialize logging for the application.
/// `RUST_LOG` wins over the level passed by the caller.
pub fn init_logger(default_level: LevelFilter) -> crate::Result<()> {
    let mut builder = Builder::new();

    let level = env::var("RUST_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default_level);

    builder
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .target(env_logger::Target::Stdout);

    builder.try_init()
        .map_err(|e| crate::ApiTestError::ConfigInit(format!("logger already initialized: {e}")))?;

    log::debug!("apicase logger initialized at level {level}");
    Ok(())
}

/// Log case progress unless the case runs as a quiet dependency.
#[macro_export]
macro_rules! progress {
    ($quiet:expr, $($arg:tt)+) => {
        if !$quiet {
            log::info!($($arg)+);
        }
    };
}
