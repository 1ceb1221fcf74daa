use std::io::IsTerminal;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing_subscriber::{
    fmt::{self, format::Writer, time::FormatTime},
    prelude::__tracing_subscriber_SubscriberExt,
    EnvFilter, Layer,
};

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

struct LocalTimer;
impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f")
        )
    }
}

static ADDITION_DIRECTIVE: &[&str] = &[
    "tokio_util=warn",
    "mio=warn",
    "async_io=warn",
    "polling=warn",
];

pub fn init(config: &Config) -> Result<()> {
    let mut filter = EnvFilter::from_default_env().add_directive(
        config
            .level
            .parse()
            .with_context(|| format!("invalid log level: {}", config.level))?,
    );
    for d in ADDITION_DIRECTIVE {
        filter = filter.add_directive(d.parse()?);
    }

    let std_out = fmt::Layer::new()
        .with_ansi(std::io::stdout().is_terminal())
        .with_timer(LocalTimer)
        .with_target(true)
        .with_writer(std::io::stdout)
        .with_file(false)
        .with_filter(filter);

    let collector = tracing_subscriber::registry().with(std_out);
    tracing::subscriber::set_global_default(collector).context("logger already initialized")?;
    Ok(())
}

/// Runs an expression returning `Result` and logs the error, if any.
/// For fire-and-forget calls whose failure is not acted upon.
#[macro_export]
macro_rules! log_if_err {
    ($run:expr) => {
        $crate::log_if_err!($run, stringify!($run))
    };

    ($run:expr, $msg:expr $(,)?) => {
        if let Err(err) = $run {
            ::tracing::error!(?err, concat!("FAILED: ", $msg))
        }
    };
}
