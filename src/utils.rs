use std::path::Path;

use config::{Environment, File};
use tracing::info;

use crate::error::Result;
use crate::Config;

/// Prefix of environment overrides, e.g. `FRAMERELAY__PIPELINE__PACING=FreeRunning`
pub const ENV_PREFIX: &str = "FRAMERELAY";

/// Build the effective configuration: built-in defaults, then the optional
/// file, then environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut builder =
        config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

    if let Some(path) = path {
        info!("Loading configuration from {}", path.display());
        builder = builder.add_source(File::from(path).required(true));
    }

    let config: Config = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Buffering, PacingMode, RelayError};
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.capture.buffering, Config::default().capture.buffering);
        assert_eq!(config.output.time_scale, crate::DEFAULT_TIME_SCALE);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[capture]
buffering = "SharedSlot"

[pipeline]
pacing = "FreeRunning"
output_latency_frames = 5

[loopback]
run_seconds = 2
"#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.capture.buffering, Buffering::SharedSlot);
        assert_eq!(config.pipeline.pacing, PacingMode::FreeRunning);
        assert_eq!(config.pipeline.output_latency_frames, 5);
        assert_eq!(config.pipeline.preroll_frames, 3);
        assert_eq!(config.loopback.run_seconds, Some(2));
    }

    #[test]
    fn invalid_file_values_are_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[output]\ntime_scale = 0").unwrap();
        assert!(matches!(
            load_config(Some(file.path())),
            Err(RelayError::InvalidConfig(_))
        ));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(matches!(load_config(Some(&missing)), Err(RelayError::Config(_))));
    }
}
