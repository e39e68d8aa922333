use std::{env, fs, net::IpAddr, path::Path, path::PathBuf, time::Duration};

use crate::{errors::Error, reconnect::ReconnectPolicy, Result};

/// Typed process configuration, read from the environment (and `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // HTTP
    pub port: u16,
    pub bind_addr: IpAddr,

    // Storage
    pub credentials_dir: PathBuf,
    pub database_url: String,

    // Behavior flags
    pub normalize_br_numbers: bool,

    // Optional Telegram notifier
    pub telegram_bot_token: Option<String>,

    pub session: SessionSettings,
}

/// Timing and capacity knobs shared by every session.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub connection_limit: usize,
    pub limiter_timeout: Duration,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_max_failures: u32,
    pub health_sweep_interval: Duration,
    pub start_jitter_max: Duration,
    pub challenge_wait: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connection_limit: 2,
            limiter_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_max_failures: 3,
            health_sweep_interval: Duration::from_secs(240),
            start_jitter_max: Duration::from_millis(3000),
            challenge_wait: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the process env in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let port = vars.parse::<u16>("PORT")?.unwrap_or(3001);
        let bind_addr = vars
            .parse::<IpAddr>("BIND_ADDR")?
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));

        let credentials_dir = vars
            .str("CREDENTIALS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./sessions"));
        let database_url = vars
            .str("DATABASE_URL")
            .unwrap_or_else(|| "crb.sqlite3".to_string());

        let normalize_br_numbers = vars.bool("NORMALIZE_BR_NUMBERS").unwrap_or(false);
        let telegram_bot_token = vars.str("TELEGRAM_BOT_TOKEN");

        let defaults = SessionSettings::default();
        let connection_limit = vars
            .parse::<usize>("MAX_CONCURRENT_CONNECTIONS")?
            .unwrap_or(defaults.connection_limit);
        if connection_limit == 0 {
            return Err(Error::Config(
                "MAX_CONCURRENT_CONNECTIONS must be at least 1".to_string(),
            ));
        }

        let secs = |key: &str, default: Duration| -> Result<Duration> {
            Ok(vars
                .parse::<u64>(key)?
                .map(Duration::from_secs)
                .unwrap_or(default))
        };
        let millis = |key: &str, default: Duration| -> Result<Duration> {
            Ok(vars
                .parse::<u64>(key)?
                .map(Duration::from_millis)
                .unwrap_or(default))
        };

        // Periodic tasks sleep for these between runs; zero would spin.
        let period = |key: &str, default: Duration| -> Result<Duration> {
            let d = secs(key, default)?;
            if d.is_zero() {
                return Err(Error::Config(format!("{key} must be at least 1")));
            }
            Ok(d)
        };

        let rp = defaults.reconnect;
        let reconnect = ReconnectPolicy {
            base: millis("RECONNECT_BASE_MS", rp.base)?,
            ceiling: millis("RECONNECT_MAX_MS", rp.ceiling)?,
            max_attempts: vars
                .parse::<u32>("RECONNECT_MAX_ATTEMPTS")?
                .unwrap_or(rp.max_attempts),
            challenge_retry: millis("CHALLENGE_RETRY_MS", rp.challenge_retry)?,
            server_restart: millis("SERVER_RESTART_MS", rp.server_restart)?,
            conflict_backoff: millis("CONFLICT_BACKOFF_MS", rp.conflict_backoff)?,
        };
        if reconnect.ceiling < reconnect.base {
            return Err(Error::Config(
                "RECONNECT_MAX_MS must not be lower than RECONNECT_BASE_MS".to_string(),
            ));
        }

        let session = SessionSettings {
            connection_limit,
            limiter_timeout: secs("LIMITER_TIMEOUT_SECS", defaults.limiter_timeout)?,
            connect_timeout: secs("CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
            heartbeat_interval: period("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            heartbeat_max_failures: vars
                .parse::<u32>("HEARTBEAT_MAX_FAILURES")?
                .unwrap_or(defaults.heartbeat_max_failures)
                .max(1),
            health_sweep_interval: period(
                "HEALTH_SWEEP_INTERVAL_SECS",
                defaults.health_sweep_interval,
            )?,
            start_jitter_max: millis("START_JITTER_MAX_MS", defaults.start_jitter_max)?,
            challenge_wait: secs("CHALLENGE_WAIT_SECS", defaults.challenge_wait)?,
            reconnect,
        };

        Ok(Self {
            port,
            bind_addr,
            credentials_dir,
            database_url,
            normalize_br_numbers,
            telegram_bot_token,
            session,
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn str(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn bool(&self, key: &str) -> Option<bool> {
        self.str(key).map(|s| {
            matches!(
                s.to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.str(key)
            .map(|s| {
                s.parse::<T>()
                    .map_err(|e| Error::Config(format!("invalid {key}={s:?}: {e}")))
            })
            .transpose()
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}
