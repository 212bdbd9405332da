use std::{io, path::PathBuf};

use thiserror::Error;

use crate::ids::TaskUnitId;

pub type AggResult<T> = Result<T, AggError>;

/// Errores de todo el subsistema de agregación.
#[derive(Debug, Error)]
pub enum AggError {
    /// Configuración inválida (contexto, ids, variables de entorno).
    /// Siempre se detecta antes de tocar el filesystem.
    #[error("configuración inválida: {reason}")]
    InvalidConfig { reason: String },

    #[error("error de almacenamiento en {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("permiso denegado en {path:?}: {reason}")]
    Permission { path: PathBuf, reason: String },

    /// La entrada no existe: un artefacto que no está, o un directorio que
    /// no aparece justo después de crearlo.
    #[error("no se encontró {path:?}")]
    NotFound { path: PathBuf },

    /// Fallo al escribir un solo registro; la sesión sigue siendo válida.
    #[error("no se pudo agregar la unidad {unit}: {reason}")]
    Record { unit: TaskUnitId, reason: String },

    #[error("formato de agregación no soportado: {name:?}")]
    UnsupportedFormat { name: String },

    #[error("operación {op} inválida en estado {state}")]
    IllegalState { op: &'static str, state: String },

    #[error("artefacto corrupto en {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl AggError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        AggError::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Traduce un error de I/O: `PermissionDenied` se reporta como
    /// `Permission`, el resto como `Storage`.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::PermissionDenied {
            AggError::Permission {
                path,
                reason: source.to_string(),
            }
        } else {
            AggError::Storage { path, source }
        }
    }

    pub fn record(unit: &TaskUnitId, reason: impl Into<String>) -> Self {
        AggError::Record {
            unit: unit.clone(),
            reason: reason.into(),
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        AggError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Unidad afectada, sólo para fallos de registro.
    pub fn unit(&self) -> Option<&TaskUnitId> {
        match self {
            AggError::Record { unit, .. } => Some(unit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_permission_denied_se_mapea_a_permission() {
        let err = AggError::io(
            "/tmp/x",
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(matches!(err, AggError::Permission { .. }));

        let err = AggError::io("/tmp/x", io::Error::new(io::ErrorKind::Other, "disk"));
        assert!(matches!(err, AggError::Storage { .. }));
    }

    #[test]
    fn record_lleva_la_unidad() {
        let unit: TaskUnitId = "container_1_0001_01_000001".parse().unwrap();
        let err = AggError::record(&unit, "falta out.log");
        assert_eq!(err.unit(), Some(&unit));
        assert!(err.to_string().contains("container_1_0001_01_000001"));
    }
}
