//! Convención de rutas del almacenamiento durable.
//!
//! `{remote_root}/{application_id}/{host}_{port}`
//!
//! Todo es función pura de sus argumentos (sin reloj ni aleatoriedad), así
//! writer y reader calculan la misma ruta.

use std::path::{Path, PathBuf};

use crate::error::{AggError, AggResult};
use crate::ids::{ApplicationId, WorkerNodeId};

const LOCK_SUFFIX: &str = "lock";
const TMP_SUFFIX: &str = "tmp";

/// Nombre del artefacto de un nodo: `host:port` con `:` -> `_`.
pub fn node_string(node: &WorkerNodeId) -> String {
    format!("{}_{}", node.host(), node.port())
}

/// Inversa de [`node_string`]. El puerto es siempre el último segmento.
pub fn parse_node_string(name: &str) -> AggResult<WorkerNodeId> {
    let (host, port) = name
        .rsplit_once('_')
        .ok_or_else(|| AggError::invalid_config(format!("nombre de nodo inválido: {name:?}")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| AggError::invalid_config(format!("puerto inválido en {name:?}")))?;
    WorkerNodeId::new(host, port)
}

pub fn remote_app_dir(root: &Path, app: &ApplicationId) -> PathBuf {
    root.join(app.to_string())
}

/// Ruta del artefacto durable para (aplicación, nodo).
pub fn layout(root: &Path, app: &ApplicationId, node: &WorkerNodeId) -> PathBuf {
    remote_app_dir(root, app).join(node_string(node))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".");
    s.push(suffix);
    PathBuf::from(s)
}

/// Lock exclusivo del destino (uno por sesión de escritura).
pub fn lock_path(destination: &Path) -> PathBuf {
    with_suffix(destination, LOCK_SUFFIX)
}

/// Donde se escribe mientras la sesión está abierta.
pub fn default_finalize_path(destination: &Path) -> PathBuf {
    with_suffix(destination, TMP_SUFFIX)
}

/// Copia rotada número `n` (n >= 1) de un artefacto anterior.
pub fn rotated_path(destination: &Path, n: u32) -> PathBuf {
    with_suffix(destination, &n.to_string())
}

/// `true` si `name` es un artefacto final (no lock, tmp ni copia rotada).
pub fn is_artifact_name(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((_, ext)) => {
            ext != LOCK_SUFFIX && ext != TMP_SUFFIX && ext.parse::<u32>().is_err()
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn node(host: &str, port: u16) -> WorkerNodeId {
        WorkerNodeId::new(host, port).unwrap()
    }

    #[test]
    fn layout_es_determinista() {
        let root = Path::new("/remote/logs");
        let app = ApplicationId::new(1000, 1);
        let n = node("nm1", 8041);

        let a = layout(root, &app, &n);
        let b = layout(root, &app, &n);
        assert_eq!(a, b);
        assert_eq!(a, PathBuf::from("/remote/logs/application_1000_0001/nm1_8041"));
    }

    #[test]
    fn layout_es_inyectivo() {
        let root = Path::new("/r");
        let apps = [
            ApplicationId::new(1, 1),
            ApplicationId::new(1, 11),
            ApplicationId::new(11, 1),
        ];
        let nodes = [
            node("a", 1),
            node("a", 11),
            node("a_1", 1),
            node("a_1_1", 1),
            node("b", 1),
        ];

        let mut seen = HashSet::new();
        for app in &apps {
            for n in &nodes {
                assert!(seen.insert(layout(root, app, n)), "colisión para {app} {n}");
            }
        }
        assert_eq!(seen.len(), apps.len() * nodes.len());
    }

    #[test]
    fn node_string_se_puede_invertir() {
        for n in [node("a", 1), node("a_1", 22), node("host.dom", 0)] {
            assert_eq!(parse_node_string(&node_string(&n)).unwrap(), n);
        }
        assert!(parse_node_string("sinpuerto").is_err());
        assert!(parse_node_string("host_x").is_err());
    }

    #[test]
    fn rutas_hermanas_del_destino() {
        let dest = Path::new("/r/app/nm1_1");
        assert_eq!(lock_path(dest), PathBuf::from("/r/app/nm1_1.lock"));
        assert_eq!(default_finalize_path(dest), PathBuf::from("/r/app/nm1_1.tmp"));
        assert_eq!(rotated_path(dest, 2), PathBuf::from("/r/app/nm1_1.2"));

        assert!(is_artifact_name("nm1_1"));
        assert!(is_artifact_name("host.dom_8041"));
        assert!(!is_artifact_name("nm1_1.lock"));
        assert!(!is_artifact_name("nm1_1.tmp"));
        assert!(!is_artifact_name("nm1_1.3"));
    }
}
