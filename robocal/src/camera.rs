use std::path::Path;

use eyre::WrapErr;
use robocam::{FrameSource, SourceConfig};

/// A camera backend chosen at runtime.
pub type DynSource = Box<dyn FrameSource>;

/// Build the source configuration from a TOML file if given, otherwise
/// from the command line selector.
pub fn source_config(selector: &str, config_file: Option<&Path>) -> eyre::Result<SourceConfig> {
    let config = match config_file {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading \"{}\"", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("parsing source config \"{}\"", path.display()))?
        }
        None => SourceConfig::from_selector(selector)?,
    };
    config.validate()?;
    Ok(config)
}

/// Construct the backend for `config`. Nothing is opened yet.
#[cfg(feature = "gst")]
pub fn open_source(config: &SourceConfig) -> robocam::Result<DynSource> {
    Ok(Box::new(robocam_gst::GstFrameSource::new(config.clone())?))
}

#[cfg(not(feature = "gst"))]
pub fn open_source(config: &SourceConfig) -> robocam::Result<DynSource> {
    config.validate()?;
    Err(robocam::Error::UnsupportedSource(format!(
        "{config}: built without camera support, rebuild with the `gst` feature"
    )))
}
