/// Supervisor configuration loaded from `SUPERVISOR_*` environment variables.
///
/// Every setting is required. There are no defaults: a missing or empty
/// variable is a configuration error reported before the child is started.
///
/// | Variable                    | Meaning                                        |
/// |-----------------------------|------------------------------------------------|
/// | `SUPERVISOR_PROMURL`        | Metrics endpoint (e.g. `http://127.0.0.1:8041`) |
/// | `SUPERVISOR_METRIC`         | Name of the counter to track                   |
/// | `SUPERVISOR_METRICDELTA`    | Minimum increase per check to count as progress |
/// | `SUPERVISOR_WARMUPDURATION` | Seconds to wait at startup and after a signal (> 0) |
/// | `SUPERVISOR_CHECKDURATION`  | Seconds between checks while progressing (> 0) |
/// | `SUPERVISOR_FAILSIGNAL`     | Signal number sent on repeated stalls          |
/// | `SUPERVISOR_HANGSIGNAL`     | Signal number sent on the first stall after progress |
///
/// Signal numbers may be any signal the platform supports, real-time signals
/// included. `SUPERVISOR_FETCHTIMEOUT` (seconds, > 0) is optional and bounds
/// each metric fetch.
use crate::signals::is_valid_signal;
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_PREFIX: &str = "SUPERVISOR";

const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Resolved supervisor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorConfig {
    pub metrics_url: String,
    pub metric_name: String,
    pub metric_delta: i64,
    pub warmup_secs: u64,
    pub check_secs: u64,
    pub fail_signal: i32,
    pub hang_signal: i32,
    pub fetch_timeout_secs: u64,
}

/// Errors produced while reading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    Missing { var: String },
    /// A variable is set but its value does not parse.
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing { var } => {
                write!(f, "environment variable \"{}\" is not set", var)
            }
            ConfigError::Invalid { var, value, reason } => {
                write!(
                    f,
                    "environment variable \"{}\" has invalid value {:?}: {}",
                    var, value, reason
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl SupervisorConfig {
    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = EnvReader { lookup };
        let fetch_timeout_secs = match vars.optional("FETCHTIMEOUT")? {
            Some(secs) => vars.positive("FETCHTIMEOUT", secs)?,
            None => DEFAULT_FETCH_TIMEOUT_SECS,
        };

        Ok(Self {
            metrics_url: vars.required("PROMURL")?,
            metric_name: vars.required("METRIC")?,
            metric_delta: vars.required("METRICDELTA")?,
            warmup_secs: vars.required_positive("WARMUPDURATION")?,
            check_secs: vars.required_positive("CHECKDURATION")?,
            fail_signal: vars.signal("FAILSIGNAL")?,
            hang_signal: vars.signal("HANGSIGNAL")?,
            fetch_timeout_secs,
        })
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Render the resolved settings as TOML for `--dry-run`.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_else(|e| format!("# failed to render: {e}\n"))
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn var_name(name: &str) -> String {
        format!("{ENV_PREFIX}_{name}")
    }

    fn raw(&self, name: &str) -> Option<(String, String)> {
        let var = Self::var_name(name);
        (self.lookup)(&var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|v| (var, v))
    }

    fn required<T>(&self, name: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(name) {
            Some((var, value)) => parse(var, value),
            None => Err(ConfigError::Missing {
                var: Self::var_name(name),
            }),
        }
    }

    fn optional<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.raw(name)
            .map(|(var, value)| parse(var, value))
            .transpose()
    }

    /// A required duration in seconds. Zero would turn the watchdog into a
    /// busy loop whenever the endpoint is down.
    fn required_positive(&self, name: &str) -> Result<u64, ConfigError> {
        let secs = self.required(name)?;
        self.positive(name, secs)
    }

    fn positive(&self, name: &str, secs: u64) -> Result<u64, ConfigError> {
        if secs == 0 {
            return Err(ConfigError::Invalid {
                var: Self::var_name(name),
                value: secs.to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(secs)
    }

    /// A required signal number that this platform can deliver.
    fn signal(&self, name: &str) -> Result<i32, ConfigError> {
        let number: i32 = self.required(name)?;
        if !is_valid_signal(number) {
            return Err(ConfigError::Invalid {
                var: Self::var_name(name),
                value: number.to_string(),
                reason: "not a signal number on this platform".to_string(),
            });
        }
        Ok(number)
    }
}

fn parse<T>(var: String, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        reason: e.to_string(),
        var,
        value,
    })
}
