//! Tracing subscriber setup shared by the parcel binaries.

use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Target used by the HTTP access-log middleware.
pub const ACCESS_TARGET: &str = "http.access";

static ACCESS_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Install the global subscriber. Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer();
    let registry = tracing_subscriber::registry().with(fmt_layer.with_filter(filter));

    match access_log_settings() {
        Some(settings) => {
            if std::fs::create_dir_all(&settings.dir).is_err() {
                tracing::warn!(directory = %settings.dir, "failed to create access log directory");
            }
            let writer = match settings.rotation.as_str() {
                "hourly" => tracing_appender::rolling::hourly(&settings.dir, &settings.prefix),
                "minutely" => tracing_appender::rolling::minutely(&settings.dir, &settings.prefix),
                "never" => tracing_appender::rolling::never(&settings.dir, &settings.prefix),
                _ => tracing_appender::rolling::daily(&settings.dir, &settings.prefix),
            };
            let (nb, guard) = tracing_appender::non_blocking(writer);
            let _ = ACCESS_GUARD.set(guard);
            let targets = Targets::new().with_target(ACCESS_TARGET, tracing::Level::INFO);
            let access_layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(nb)
                .with_filter(targets);
            let _ = registry.with(access_layer).try_init();
        }
        None => {
            let _ = registry.try_init();
        }
    }
}

#[derive(Debug, PartialEq)]
struct AccessLogSettings {
    dir: String,
    prefix: String,
    rotation: String,
}

fn access_log_settings() -> Option<AccessLogSettings> {
    settings_from(|key| std::env::var(key).ok())
}

fn settings_from<F>(lookup: F) -> Option<AccessLogSettings>
where
    F: Fn(&str) -> Option<String>,
{
    if lookup("PARCEL_ACCESS_LOG_ROLL").as_deref() != Some("1") {
        return None;
    }
    let dir = lookup("PARCEL_ACCESS_LOG_DIR")
        .or_else(|| lookup("PARCEL_LOGS_DIR"))
        .unwrap_or_else(|| "logs".to_string());
    let prefix = lookup("PARCEL_ACCESS_LOG_PREFIX").unwrap_or_else(|| "http-access".into());
    let rotation = lookup("PARCEL_ACCESS_LOG_ROTATION")
        .unwrap_or_else(|| "daily".into())
        .to_lowercase();
    Some(AccessLogSettings {
        dir,
        prefix,
        rotation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_log_is_opt_in() {
        assert_eq!(settings_from(|_| None), None);
    }

    #[test]
    fn rolling_log_falls_back_to_logs_dir() {
        let settings = settings_from(|key| match key {
            "PARCEL_ACCESS_LOG_ROLL" => Some("1".into()),
            "PARCEL_LOGS_DIR" => Some("/var/log/parcel".into()),
            "PARCEL_ACCESS_LOG_ROTATION" => Some("Hourly".into()),
            _ => None,
        })
        .expect("enabled");
        assert_eq!(settings.dir, "/var/log/parcel");
        assert_eq!(settings.prefix, "http-access");
        assert_eq!(settings.rotation, "hourly");
    }
}
