use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::codec::{self, ArtifactHeader, DecodedArtifact, LogFormat, LogRecord};
use crate::error::{AggError, AggResult};
use crate::ids::{ApplicationId, TaskUnitId, WorkerNodeId};
use crate::layout;

/// Lector de artefactos. Acepta las variantes configuradas; la variante de
/// cada artefacto se detecta por su contenido.
#[derive(Debug, Clone)]
pub struct AggregationReader {
    accepted: Vec<LogFormat>,
}

impl AggregationReader {
    pub fn new(accepted: Vec<LogFormat>) -> Self {
        Self { accepted }
    }

    pub fn accepted(&self) -> &[LogFormat] {
        &self.accepted
    }

    pub fn open(&self, path: &Path) -> AggResult<AggregatedLogs> {
        let bytes = fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => AggError::NotFound {
                path: path.to_path_buf(),
            },
            _ => AggError::io(path, e),
        })?;

        let artifact = codec::decode_artifact(path, &bytes)?;
        if !self.accepted.contains(&artifact.format) {
            return Err(AggError::UnsupportedFormat {
                name: artifact.format.name().to_string(),
            });
        }

        debug!(
            "artefacto {} leído: {} registros, formato={}, completo={}",
            path.display(),
            artifact.records.len(),
            artifact.format,
            artifact.is_complete()
        );

        Ok(AggregatedLogs {
            path: path.to_path_buf(),
            artifact,
        })
    }

    /// Abre el artefacto de (aplicación, nodo) según el layout.
    pub fn open_node(
        &self,
        root: &Path,
        app: &ApplicationId,
        node: &WorkerNodeId,
    ) -> AggResult<AggregatedLogs> {
        self.open(&layout::layout(root, app, node))
    }

    /// Nodos con artefacto para la aplicación, ordenados.
    pub fn list_nodes(&self, root: &Path, app: &ApplicationId) -> AggResult<Vec<WorkerNodeId>> {
        let dir = layout::remote_app_dir(root, app);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AggError::io(&dir, e)),
        };

        let mut nodes = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| AggError::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !layout::is_artifact_name(&name) {
                continue;
            }
            match layout::parse_node_string(&name) {
                Ok(node) => nodes.push(node),
                Err(_) => debug!("ignorando {:?} en {}", name, dir.display()),
            }
        }
        nodes.sort();
        Ok(nodes)
    }

    /// Todos los artefactos de la aplicación, uno por nodo.
    pub fn open_all(
        &self,
        root: &Path,
        app: &ApplicationId,
    ) -> AggResult<Vec<(WorkerNodeId, AggregatedLogs)>> {
        self.list_nodes(root, app)?
            .into_iter()
            .map(|node| {
                let logs = self.open_node(root, app, &node)?;
                Ok((node, logs))
            })
            .collect()
    }
}

/// Artefacto abierto.
#[derive(Debug, Clone)]
pub struct AggregatedLogs {
    path: PathBuf,
    artifact: DecodedArtifact,
}

impl AggregatedLogs {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ArtifactHeader {
        &self.artifact.header
    }

    pub fn format(&self) -> LogFormat {
        self.artifact.format
    }

    pub fn is_complete(&self) -> bool {
        self.artifact.is_complete()
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.artifact.records
    }

    /// Unidades en el orden en que se escribieron (con repetidos si los hay).
    pub fn list(&self) -> Vec<&TaskUnitId> {
        self.artifact.records.iter().map(|r| &r.unit).collect()
    }

    /// Primer registro de la unidad.
    pub fn read(&self, unit: &TaskUnitId) -> Option<&LogRecord> {
        self.artifact.records.iter().find(|r| &r.unit == unit)
    }

    pub fn read_all(&self, unit: &TaskUnitId) -> Vec<&LogRecord> {
        self.artifact
            .records
            .iter()
            .filter(|r| &r.unit == unit)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{LogKey, LogValue};
    use crate::context::AggregationContext;
    use crate::ids::Identity;
    use crate::local_store;
    use crate::writer::AggregationWriter;
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("reader_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn unit(s: &str) -> TaskUnitId {
        TaskUnitId::new(s).unwrap()
    }

    /// Agrega `units` (cada una con sus archivos) para (app, nodo).
    fn aggregate(
        base: &Path,
        format: LogFormat,
        app: ApplicationId,
        node: &WorkerNodeId,
        units: &[(&str, &[(&str, &str)])],
    ) {
        let local = base.join("local");
        let app_dir = local.join(app.to_string());
        for (u, files) in units {
            local_store::put_files(&app_dir, &unit(u), *files).unwrap();
        }

        let ctx = AggregationContext::for_layout(
            &base.join("remote"),
            app,
            node.clone(),
            Identity::new("alice"),
        )
        .unwrap();
        let mut w = AggregationWriter::new(format);
        w.initialize(ctx).unwrap();
        for (u, _) in units {
            let value = LogValue::new(vec![local.clone()], unit(u), "alice");
            w.write(&LogKey(unit(u)), &value).unwrap();
        }
        w.close().unwrap();
    }

    #[test]
    fn roundtrip_conserva_unidades_archivos_y_orden() {
        for format in LogFormat::ALL {
            let base = temp_dir(&format!("roundtrip_{format}"));
            let app = ApplicationId::new(7, 1);
            let node = WorkerNodeId::new("nm1", 1).unwrap();
            let c1: &[(&str, &str)] = &[("stdout", "uno"), ("stderr", "")];
            let c2: &[(&str, &str)] = &[("syslog", "dos\ntres\n")];
            aggregate(&base, format, app, &node, &[("c1", c1), ("c2", c2)]);

            let reader = AggregationReader::new(LogFormat::ALL.to_vec());
            let logs = reader.open_node(&base.join("remote"), &app, &node).unwrap();

            assert_eq!(logs.format(), format);
            assert!(logs.is_complete());
            assert_eq!(logs.list(), vec![&unit("c1"), &unit("c2")]);

            let r1 = logs.read(&unit("c1")).unwrap();
            // sin lista de inclusión se ordenan por nombre
            let names: Vec<&str> = r1.files.iter().map(|f| f.name.as_str()).collect();
            assert_eq!(names, vec!["stderr", "stdout"]);
            assert_eq!(r1.file("stdout").unwrap().content, b"uno");
            assert_eq!(r1.file("stderr").unwrap().content, b"");

            let r2 = logs.read(&unit("c2")).unwrap();
            assert_eq!(r2.file("syslog").unwrap().content, b"dos\ntres\n");
            assert!(logs.read(&unit("c3")).is_none());
        }
    }

    #[test]
    fn variante_no_aceptada_es_unsupported() {
        let base = temp_dir("not_accepted");
        let app = ApplicationId::new(7, 2);
        let node = WorkerNodeId::new("nm1", 1).unwrap();
        let files: &[(&str, &str)] = &[("out.log", "x")];
        aggregate(&base, LogFormat::Jsonl, app, &node, &[("c1", files)]);

        let reader = AggregationReader::new(vec![LogFormat::Framed]);
        let err = reader
            .open_node(&base.join("remote"), &app, &node)
            .unwrap_err();
        assert!(matches!(err, AggError::UnsupportedFormat { .. }));
    }

    #[test]
    fn artefacto_inexistente_es_not_found() {
        let base = temp_dir("missing");
        let reader = AggregationReader::new(LogFormat::ALL.to_vec());
        let err = reader.open(&base.join("nada")).unwrap_err();
        assert!(matches!(err, AggError::NotFound { .. }));
    }

    #[test]
    fn list_nodes_y_open_all_recorren_la_aplicacion() {
        let base = temp_dir("all_nodes");
        let app = ApplicationId::new(7, 3);
        let n1 = WorkerNodeId::new("nm1", 1).unwrap();
        let n2 = WorkerNodeId::new("nm2", 2).unwrap();
        let f: &[(&str, &str)] = &[("out.log", "x")];
        aggregate(&base, LogFormat::Framed, app, &n2, &[("c2", f)]);
        aggregate(&base, LogFormat::Framed, app, &n1, &[("c1", f)]);

        // basura que no es artefacto
        let app_dir = layout::remote_app_dir(&base.join("remote"), &app);
        fs::write(app_dir.join("nm1_1.lock"), b"{}").unwrap();
        fs::write(app_dir.join("nm1_1.3"), b"").unwrap();

        let reader = AggregationReader::new(LogFormat::ALL.to_vec());
        let remote = base.join("remote");
        assert_eq!(reader.list_nodes(&remote, &app).unwrap(), vec![n1.clone(), n2.clone()]);

        let all = reader.open_all(&remote, &app).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].1.list(), vec![&unit("c1")]);
        assert_eq!(all[1].1.list(), vec![&unit("c2")]);

        let other = ApplicationId::new(7, 4);
        assert!(reader.list_nodes(&remote, &other).unwrap().is_empty());
    }
}
