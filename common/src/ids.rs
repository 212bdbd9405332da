use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::{AggError, AggResult};

/* =========================
   Identificadores
   ========================= */

/// Valida que `value` se pueda usar como un único componente de ruta.
pub(crate) fn check_path_component(kind: &str, value: &str) -> AggResult<()> {
    if value.is_empty() {
        return Err(AggError::invalid_config(format!("{kind} vacío")));
    }
    if value == "." || value == ".." {
        return Err(AggError::invalid_config(format!(
            "{kind} no puede ser {value:?}"
        )));
    }
    if value.contains(['/', '\\', '\0']) {
        return Err(AggError::invalid_config(format!(
            "{kind} {value:?} contiene separadores de ruta"
        )));
    }
    Ok(())
}

/// Aplicación: agrupa muchas unidades de trabajo.
/// Se muestra como `application_<cluster_ts>_<seq:04>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ApplicationId {
    pub cluster_timestamp: u64,
    pub sequence: u32,
}

impl ApplicationId {
    pub fn new(cluster_timestamp: u64, sequence: u32) -> Self {
        Self {
            cluster_timestamp,
            sequence,
        }
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "application_{}_{:04}", self.cluster_timestamp, self.sequence)
    }
}

impl FromStr for ApplicationId {
    type Err = AggError;

    fn from_str(s: &str) -> AggResult<Self> {
        let bad = || AggError::invalid_config(format!("ApplicationId inválido: {s:?}"));

        let rest = s.strip_prefix("application_").ok_or_else(bad)?;
        let (ts, seq) = rest.split_once('_').ok_or_else(bad)?;
        let cluster_timestamp = ts.parse::<u64>().map_err(|_| bad())?;
        let sequence = seq.parse::<u32>().map_err(|_| bad())?;
        Ok(Self::new(cluster_timestamp, sequence))
    }
}

impl TryFrom<String> for ApplicationId {
    type Error = AggError;

    fn try_from(value: String) -> AggResult<Self> {
        value.parse()
    }
}

impl From<ApplicationId> for String {
    fn from(value: ApplicationId) -> Self {
        value.to_string()
    }
}

/// Unidad de trabajo (contenedor). Opaco: sólo se valida que sirva como
/// nombre de directorio.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskUnitId(String);

impl TaskUnitId {
    pub fn new(value: impl Into<String>) -> AggResult<Self> {
        let value = value.into();
        check_path_component("TaskUnitId", &value)?;
        Ok(Self(value))
    }

    /// Genera un id con la forma clásica de contenedor:
    /// `container_<ts>_<app:04>_<attempt:02>_<seq:06>`.
    pub fn for_application(app: &ApplicationId, attempt: u32, seq: u64) -> Self {
        Self(format!(
            "container_{}_{:04}_{:02}_{:06}",
            app.cluster_timestamp, app.sequence, attempt, seq
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskUnitId {
    type Err = AggError;

    fn from_str(s: &str) -> AggResult<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for TaskUnitId {
    type Error = AggError;

    fn try_from(value: String) -> AggResult<Self> {
        Self::new(value)
    }
}

impl From<TaskUnitId> for String {
    fn from(value: TaskUnitId) -> Self {
        value.0
    }
}

/// Nodo worker que ejecutó las unidades (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerNodeId {
    host: String,
    port: u16,
}

impl WorkerNodeId {
    pub fn new(host: impl Into<String>, port: u16) -> AggResult<Self> {
        let host = host.into();
        if host.is_empty()
            || host.contains([':', '/', '\\'])
            || host.chars().any(char::is_whitespace)
        {
            return Err(AggError::invalid_config(format!(
                "host de nodo inválido: {host:?}"
            )));
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for WorkerNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for WorkerNodeId {
    type Err = AggError;

    fn from_str(s: &str) -> AggResult<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AggError::invalid_config(format!("WorkerNodeId sin puerto: {s:?}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| AggError::invalid_config(format!("puerto inválido en {s:?}")))?;
        Self::new(host, port)
    }
}

impl TryFrom<String> for WorkerNodeId {
    type Error = AggError;

    fn try_from(value: String) -> AggResult<Self> {
        value.parse()
    }
}

impl From<WorkerNodeId> for String {
    fn from(value: WorkerNodeId) -> Self {
        value.to_string()
    }
}

/// Identidad con la que se actúa (dueño de la aplicación).
/// Se pasa explícitamente a cada operación que la necesita.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user: String,
}

impl Identity {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }

    /// Nombre corto: quita `/instancia` y `@REALM` de un principal.
    /// `nm/host1@EXAMPLE.COM` -> `nm`.
    pub fn short_name(&self) -> &str {
        let end = self
            .user
            .find(['/', '@'])
            .unwrap_or(self.user.len());
        &self.user[..end]
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_id_display_y_parse() {
        let app = ApplicationId::new(1_700_000_000_000, 7);
        let s = app.to_string();
        assert_eq!(s, "application_1700000000000_0007");
        assert_eq!(s.parse::<ApplicationId>().unwrap(), app);

        // secuencias grandes no se truncan
        let big = ApplicationId::new(1, 123_456);
        assert_eq!(big.to_string(), "application_1_123456");
        assert_eq!(big.to_string().parse::<ApplicationId>().unwrap(), big);
    }

    #[test]
    fn application_id_rechaza_formatos_raros() {
        assert!("app_1_2".parse::<ApplicationId>().is_err());
        assert!("application_x_2".parse::<ApplicationId>().is_err());
        assert!("application_1".parse::<ApplicationId>().is_err());
    }

    #[test]
    fn task_unit_id_valida_componente_de_ruta() {
        assert!(TaskUnitId::new("container_1").is_ok());
        assert!(TaskUnitId::new("").is_err());
        assert!(TaskUnitId::new("..").is_err());
        assert!(TaskUnitId::new("a/b").is_err());
    }

    #[test]
    fn task_unit_id_para_aplicacion() {
        let app = ApplicationId::new(42, 3);
        let unit = TaskUnitId::for_application(&app, 1, 12);
        assert_eq!(unit.as_str(), "container_42_0003_01_000012");
    }

    #[test]
    fn worker_node_id_roundtrip_por_string() {
        let node = WorkerNodeId::new("host-1.example", 8041).unwrap();
        assert_eq!(node.to_string(), "host-1.example:8041");
        assert_eq!("host-1.example:8041".parse::<WorkerNodeId>().unwrap(), node);
        assert!(WorkerNodeId::new("a:b", 1).is_err());
        assert!(WorkerNodeId::new("", 1).is_err());
    }

    #[test]
    fn identity_short_name() {
        assert_eq!(Identity::new("nm/host1@EXAMPLE.COM").short_name(), "nm");
        assert_eq!(Identity::new("alice@EXAMPLE.COM").short_name(), "alice");
        assert_eq!(Identity::new("bob").short_name(), "bob");
    }

    #[test]
    fn ids_se_serializan_como_string() {
        let app = ApplicationId::new(5, 1);
        let json = serde_json::to_string(&app).unwrap();
        assert_eq!(json, "\"application_5_0001\"");
        let back: ApplicationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, app);

        let bad: Result<TaskUnitId, _> = serde_json::from_str("\"../x\"");
        assert!(bad.is_err());
    }
}
