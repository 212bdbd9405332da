use std::{env, path::PathBuf, str::FromStr};

use crate::error::{AggError, AggResult};

pub const DEFAULT_LOCAL_ROOT: &str = "/data/logs";
pub const DEFAULT_REMOTE_ROOT: &str = "/data/aggregated";
pub const DEFAULT_FORMATS: &str = "framed";
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_MAX_SESSIONS: usize = 2;

/// Configuración de despliegue de la agregación.
///
/// Se lee de variables de entorno (`AGG_*`), con valores por defecto para
/// correr dentro del contenedor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationConfig {
    /// Raíz de los logs locales: `{local_root}/{app}/{unit}/{archivo}`.
    pub local_root: PathBuf,
    /// Raíz del almacenamiento durable.
    pub remote_root: PathBuf,
    /// Variantes de formato; la primera se usa para escribir.
    pub formats: Vec<String>,
    pub overwrite: bool,
    pub retention: i64,
    /// Borrar los logs locales después de subirlos.
    pub delete_local: bool,
    pub scan_interval_secs: u64,
    pub max_sessions: usize,
    pub node_port: u16,
    pub run_once: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            local_root: PathBuf::from(DEFAULT_LOCAL_ROOT),
            remote_root: PathBuf::from(DEFAULT_REMOTE_ROOT),
            formats: vec![DEFAULT_FORMATS.to_string()],
            overwrite: true,
            retention: 0,
            delete_local: false,
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            max_sessions: DEFAULT_MAX_SESSIONS,
            node_port: 0,
            run_once: false,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, raw: Option<String>, default: T) -> AggResult<T> {
    match raw {
        None => Ok(default),
        Some(s) if s.trim().is_empty() => Ok(default),
        Some(s) => s
            .trim()
            .parse::<T>()
            .map_err(|_| AggError::invalid_config(format!("{key}={s:?} no es válido"))),
    }
}

fn parse_bool(key: &str, raw: Option<String>, default: bool) -> AggResult<bool> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(other) => Err(AggError::invalid_config(format!(
            "{key}={other:?} no es un booleano"
        ))),
    }
}

impl AggregationConfig {
    pub fn from_env() -> AggResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que [`from_env`](Self::from_env) pero con otra fuente de
    /// variables (útil en tests).
    pub fn from_lookup<F>(lookup: F) -> AggResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();

        let formats = match lookup("AGG_FORMATS") {
            Some(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => d.formats,
        };

        let max_sessions = parse_var("AGG_MAX_SESSIONS", lookup("AGG_MAX_SESSIONS"), d.max_sessions)?;
        if max_sessions == 0 {
            return Err(AggError::invalid_config("AGG_MAX_SESSIONS debe ser >= 1"));
        }

        Ok(Self {
            local_root: lookup("AGG_LOCAL_ROOT").map(PathBuf::from).unwrap_or(d.local_root),
            remote_root: lookup("AGG_REMOTE_ROOT").map(PathBuf::from).unwrap_or(d.remote_root),
            formats,
            overwrite: parse_bool("AGG_OVERWRITE", lookup("AGG_OVERWRITE"), d.overwrite)?,
            retention: parse_var("AGG_RETENTION", lookup("AGG_RETENTION"), d.retention)?,
            delete_local: parse_bool("AGG_DELETE_LOCAL", lookup("AGG_DELETE_LOCAL"), d.delete_local)?,
            scan_interval_secs: parse_var(
                "AGG_SCAN_INTERVAL_SECS",
                lookup("AGG_SCAN_INTERVAL_SECS"),
                d.scan_interval_secs,
            )?,
            max_sessions,
            node_port: parse_var("AGG_NODE_PORT", lookup("AGG_NODE_PORT"), d.node_port)?,
            run_once: parse_bool("AGG_RUN_ONCE", lookup("AGG_RUN_ONCE"), d.run_once)?,
        })
    }
}
