//! Global `tracing` subscriber setup shared by the binaries of this
//! workspace.
//!
//! The filter comes from `RUST_LOG`. When it is unset, `info` and above are
//! shown so that progress messages of a calibration run are visible by
//! default.

use time::{UtcOffset, format_description::well_known::Iso8601};
use tracing_subscriber::{
    EnvFilter,
    fmt::{
        self,
        format::{DefaultFields, Format, Full},
        time::OffsetTime,
    },
    layer::SubscriberExt,
};

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Filter directive used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

/// Keeps logging alive. Hold it until the program ends.
#[must_use]
pub struct Guard {
    path: Option<std::path::PathBuf>,
}

impl Guard {
    /// The log file, if one was requested.
    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            tracing::trace!("closing log file \"{}\"", path.display());
        }
    }
}

/// Log to the console only. Any error setting up the subscriber (for
/// example one was already installed) is printed and otherwise ignored.
pub fn init() -> Guard {
    match initiate_logging::<&str>(None, false) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("logging not initialized: {e}");
            Guard { path: None }
        }
    }
}

type Timer = OffsetTime<Iso8601>;

/// Common formatting of the file and console layers: timestamps plus the
/// source location of each event.
fn located_layer<S>(timer: Timer) -> fmt::Layer<S, DefaultFields, Format<Full, Timer>> {
    fmt::layer()
        .with_timer(timer)
        .with_file(true)
        .with_line_number(true)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Start logging to file and console, both optional.
pub fn initiate_logging<P: AsRef<std::path::Path>>(
    path: Option<P>,
    disable_console: bool,
) -> Result<Guard, Error> {
    // Fixed offset taken from the local timezone right now.
    let timer = OffsetTime::new(
        UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?,
        Iso8601::DEFAULT,
    );

    let file_layer = if let Some(path) = &path {
        let file = std::fs::File::create(path)?;
        Some(
            located_layer(timer.clone())
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false),
        )
    } else {
        None
    };

    let console_layer = if disable_console {
        None
    } else {
        Some(
            located_layer(timer)
                .with_ansi(!cfg!(windows))
                .with_target(false),
        )
    };

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(env_filter());
    tracing::subscriber::set_global_default(collector)?;

    let log_var = match std::env::var("RUST_LOG") {
        Ok(var) => format!(" with RUST_LOG=\"{var}\"."),
        Err(_) => format!(" with default filter \"{DEFAULT_FILTER}\"."),
    };
    if let Some(path) = &path {
        tracing::debug!(
            "Logging initiated to file \"{}\"{log_var}",
            path.as_ref().display()
        );
    }
    if !disable_console {
        tracing::debug!("Logging initiated to console{log_var}");
    }

    Ok(Guard {
        path: path.map(|p| p.as_ref().to_path_buf()),
    })
}
