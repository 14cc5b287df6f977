//! Configuration of the instrumentation, read from the compiler's environment.

use core::fmt;
use std::{
    env,
    io::{self, IsTerminal},
    path::PathBuf,
};

use distafl_bolts::Error;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{ids::DEFAULT_ID_FILE, sampling::InstRatio};

/// Percentage of blocks to instrument
pub const ENV_INST_RATIO: &str = crate::sampling::INST_RATIO_ENV;
/// Silence banner and summary
pub const ENV_QUIET: &str = "AFL_QUIET";
/// The build is hardened
pub const ENV_HARDEN: &str = "AFL_HARDEN";
/// The build uses ASAN
pub const ENV_USE_ASAN: &str = "AFL_USE_ASAN";
/// The build uses MSAN
pub const ENV_USE_MSAN: &str = "AFL_USE_MSAN";
/// Path of the join point id counter
pub const ENV_CUR_ID_FILE: &str = "AFL_CUR_ID_FILE";
/// Lock the id counter while instrumenting
pub const ENV_CUR_ID_LOCK: &str = "AFL_CUR_ID_LOCK";
/// Fixed seed for sampling and locations
pub const ENV_INST_SEED: &str = "AFL_INST_SEED";
/// Where to write the JSON instrumentation report
pub const ENV_INST_REPORT: &str = "AFL_INST_REPORT";

/// How the instrumented program is built. Only shows up in the summary.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardeningMode {
    /// `AFL_HARDEN`
    Hardened,
    /// `AFL_USE_ASAN` or `AFL_USE_MSAN`
    Sanitized,
    /// Neither
    #[default]
    NonHardened,
}

impl fmt::Display for HardeningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardeningMode::Hardened => write!(f, "hardened"),
            HardeningMode::Sanitized => write!(f, "ASAN/MSAN"),
            HardeningMode::NonHardened => write!(f, "non-hardened"),
        }
    }
}

/// Everything the [`crate::pass::DistanceCoveragePass`] can be told.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct InstrumentationConfig {
    /// Percentage of blocks to instrument
    #[builder(default)]
    pub ratio: InstRatio,
    /// Don't log banner and summary
    #[builder(default = false)]
    pub quiet: bool,
    /// Reported in the summary
    #[builder(default)]
    pub mode: HardeningMode,
    /// The durable id counter
    #[builder(default = PathBuf::from(DEFAULT_ID_FILE), setter(into))]
    pub id_file: PathBuf,
    /// Hold an exclusive lock on [`Self::id_file`] while instrumenting
    #[builder(default = false)]
    pub lock_id_file: bool,
    /// Seed for the sampling and location rng. The clock is used if unset.
    #[builder(default = None, setter(strip_option))]
    pub seed: Option<u64>,
    /// Write an [`crate::report::InstrumentationReport`] as JSON here
    #[builder(default = None, setter(strip_option, into))]
    pub report_path: Option<PathBuf>,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl InstrumentationConfig {
    /// Reads the configuration from the process environment.
    ///
    /// Output is also silenced when stderr is not a terminal.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::from_lookup(|name| {
            env::var_os(name).map(|value| value.to_string_lossy().into_owned())
        })?;
        config.quiet |= !io::stderr().is_terminal();
        Ok(config)
    }

    /// Reads the configuration through `lookup`, which returns the value of a variable if
    /// it is set. Variables used as flags only need to be set, their value is ignored.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let is_set = |name: &str| lookup(name).is_some();

        let ratio = lookup(ENV_INST_RATIO)
            .map(|value| value.parse::<InstRatio>())
            .transpose()?
            .unwrap_or_default();

        let mode = if is_set(ENV_HARDEN) {
            HardeningMode::Hardened
        } else if is_set(ENV_USE_ASAN) || is_set(ENV_USE_MSAN) {
            HardeningMode::Sanitized
        } else {
            HardeningMode::NonHardened
        };

        let seed = lookup(ENV_INST_SEED)
            .map(|value| {
                value.trim().parse::<u64>().map_err(|_| {
                    Error::illegal_argument(format!(
                        "Bad value of {ENV_INST_SEED} (must be an unsigned integer), got {value:?}"
                    ))
                })
            })
            .transpose()?;

        Ok(Self {
            ratio,
            quiet: is_set(ENV_QUIET),
            mode,
            id_file: lookup(ENV_CUR_ID_FILE)
                .filter(|path| !path.is_empty())
                .map_or_else(|| PathBuf::from(DEFAULT_ID_FILE), PathBuf::from),
            lock_id_file: is_set(ENV_CUR_ID_LOCK),
            seed,
            report_path: lookup(ENV_INST_REPORT)
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{env, path::PathBuf};

    use distafl_bolts::Error;
    use hashbrown::HashMap;
    use serial_test::serial;

    use super::{
        HardeningMode, InstrumentationConfig, ENV_CUR_ID_FILE, ENV_HARDEN, ENV_INST_RATIO,
        ENV_INST_REPORT, ENV_INST_SEED, ENV_QUIET, ENV_USE_MSAN,
    };
    use crate::{ids::DEFAULT_ID_FILE, sampling::InstRatio};

    fn config_of(vars: &[(&str, &str)]) -> Result<InstrumentationConfig, Error> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        InstrumentationConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_of(&[]).unwrap();
        assert_eq!(config, InstrumentationConfig::default());
        assert_eq!(config.ratio, InstRatio::ALL);
        assert_eq!(config.id_file, PathBuf::from(DEFAULT_ID_FILE));
        assert_eq!(config.mode, HardeningMode::NonHardened);
        assert!(!config.quiet && !config.lock_id_file);
        assert!(config.seed.is_none() && config.report_path.is_none());
    }

    #[test]
    fn test_values() {
        let config = config_of(&[
            (ENV_INST_RATIO, "30"),
            (ENV_QUIET, ""),
            (ENV_USE_MSAN, "1"),
            (ENV_CUR_ID_FILE, "/var/tmp/ids"),
            (ENV_INST_SEED, "1337"),
            (ENV_INST_REPORT, "report.json"),
        ])
        .unwrap();
        assert_eq!(config.ratio.percent(), 30);
        assert!(config.quiet);
        assert_eq!(config.mode, HardeningMode::Sanitized);
        assert_eq!(config.mode.to_string(), "ASAN/MSAN");
        assert_eq!(config.id_file, PathBuf::from("/var/tmp/ids"));
        assert_eq!(config.seed, Some(1337));
        assert_eq!(config.report_path, Some(PathBuf::from("report.json")));

        let hardened = config_of(&[(ENV_HARDEN, "1"), (ENV_USE_MSAN, "1")]).unwrap();
        assert_eq!(hardened.mode.to_string(), "hardened");
    }

    #[test]
    fn test_bad_values_are_fatal() {
        for bad in ["0", "101", "abc", ""] {
            assert!(matches!(
                config_of(&[(ENV_INST_RATIO, bad)]),
                Err(Error::IllegalArgument(..))
            ));
        }
        assert!(config_of(&[(ENV_INST_SEED, "-1")]).is_err());
    }

    #[test]
    fn test_builder() {
        let config = InstrumentationConfig::builder()
            .seed(7)
            .report_path("out.json")
            .id_file("ids")
            .build();
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.report_path, Some(PathBuf::from("out.json")));
        assert_eq!(config.id_file, PathBuf::from("ids"));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        env::set_var(ENV_INST_RATIO, "55");
        env::set_var(ENV_HARDEN, "1");
        let config = InstrumentationConfig::from_env();
        env::remove_var(ENV_INST_RATIO);
        env::remove_var(ENV_HARDEN);

        let config = config.unwrap();
        assert_eq!(config.ratio.percent(), 55);
        assert_eq!(config.mode, HardeningMode::Hardened);
    }
}
