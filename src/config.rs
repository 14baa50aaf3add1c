//! Server settings, read from `KEYTURN_*` environment variables.

use std::fmt::Display;
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;

use tracing::info;

use crate::limits::{
    DEFAULT_PAYMENT_GRACE_MS, MAX_RENTAL_DAYS, OWNER_DECISION_WINDOW_MS, SWEEP_INTERVAL_SECS,
};
use crate::model::Ms;
use crate::tls::TlsFiles;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last rewrite that trigger the next one.
    pub compact_threshold: u64,
    pub payment_grace: Ms,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsFiles>,
}

impl Settings {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// A variable that is set but does not parse is an error naming it; unset
    /// variables take their defaults.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let payment_grace = match parsed::<Ms, _>(&var, "KEYTURN_PAYMENT_GRACE_MS")? {
            Some(ms) if ms < 0 => {
                return Err(invalid("KEYTURN_PAYMENT_GRACE_MS", &ms.to_string(), "must not be negative"));
            }
            Some(ms) => ms,
            None => DEFAULT_PAYMENT_GRACE_MS,
        };
        let max_connections: usize = parsed(&var, "KEYTURN_MAX_CONNECTIONS")?.unwrap_or(256);
        if max_connections == 0 {
            return Err(invalid("KEYTURN_MAX_CONNECTIONS", "0", "must be at least 1"));
        }

        Ok(Self {
            bind: var("KEYTURN_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&var, "KEYTURN_PORT")?.unwrap_or(5433),
            data_dir: var("KEYTURN_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: var("KEYTURN_PASSWORD").unwrap_or_else(|| "keyturn".into()),
            max_connections,
            compact_threshold: parsed(&var, "KEYTURN_COMPACT_THRESHOLD")?.unwrap_or(1000),
            payment_grace,
            metrics_port: parsed(&var, "KEYTURN_METRICS_PORT")?,
            tls: TlsFiles::pair(var("KEYTURN_TLS_CERT"), var("KEYTURN_TLS_KEY"))?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Where the server listens and which booking rules it enforces. The password is
    /// never logged.
    pub fn log_startup(&self) {
        info!(
            addr = %self.addr(),
            data_dir = %self.data_dir.display(),
            max_connections = self.max_connections,
            tls = self.tls.is_some(),
            metrics_port = ?self.metrics_port,
            "keyturn listening"
        );
        info!(
            owner_decision_window_ms = OWNER_DECISION_WINDOW_MS,
            payment_grace_ms = self.payment_grace,
            sweep_interval_secs = SWEEP_INTERVAL_SECS,
            compact_threshold = self.compact_threshold,
            max_rental_days = MAX_RENTAL_DAYS,
            "booking rules"
        );
    }
}

fn parsed<T, F>(var: &F, name: &str) -> io::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| invalid(name, &raw, &e.to_string()))
        })
        .transpose()
}

fn invalid(name: &str, raw: &str, why: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, format!("{name}={raw:?}: {why}"))
}
