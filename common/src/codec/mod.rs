//! Formato de los artefactos agregados.
//!
//! Un artefacto es: cabecera, registros (uno por unidad, en el orden en que
//! llegaron) y un trailer que marca que la sesión terminó bien. Hay dos
//! variantes con el mismo contenido lógico:
//!
//! - `framed`: binario, frames con longitud + crc32c.
//! - `jsonl`: un objeto JSON por línea, contenido en base64.
//!
//! El reader detecta la variante por los primeros bytes.

mod framed;
mod jsonl;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::context::{AccessControl, AggregationContext};
use crate::error::{AggError, AggResult};
use crate::ids::{ApplicationId, TaskUnitId, WorkerNodeId};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{what} demasiado grande ({len} bytes)")]
    TooLarge { what: &'static str, len: usize },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

impl CodecError {
    fn invalid(reason: impl Into<String>) -> Self {
        CodecError::Invalid(reason.into())
    }
}

/* =========================
   Modelo de un registro
   ========================= */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub name: String,
    pub content: Vec<u8>,
}

impl LogFile {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Logs de una unidad tal como quedan en el artefacto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub unit: TaskUnitId,
    pub user: String,
    pub files: Vec<LogFile>,
}

impl LogRecord {
    pub fn file(&self, name: &str) -> Option<&LogFile> {
        self.files.iter().find(|f| f.name == name)
    }
}

/// Clave de un registro: la unidad.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogKey(pub TaskUnitId);

impl LogKey {
    pub fn unit(&self) -> &TaskUnitId {
        &self.0
    }
}

impl From<TaskUnitId> for LogKey {
    fn from(unit: TaskUnitId) -> Self {
        Self(unit)
    }
}

/// Qué leer para una unidad: directorios raíz donde buscar
/// (`{root}/{app}/{unit}`), archivos a incluir (vacío = todos) y el usuario
/// con el que se leen.
#[derive(Debug, Clone)]
pub struct LogValue {
    pub root_dirs: Vec<PathBuf>,
    pub unit: TaskUnitId,
    pub user: String,
    pub include: Vec<String>,
}

impl LogValue {
    pub fn new(root_dirs: Vec<PathBuf>, unit: TaskUnitId, user: impl Into<String>) -> Self {
        Self {
            root_dirs,
            unit,
            user: user.into(),
            include: Vec::new(),
        }
    }

    pub fn include<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = names.into_iter().map(Into::into).collect();
        self
    }

    /// Lee los archivos de la unidad. Recorre los directorios raíz en orden;
    /// dentro de cada uno, sin lista de inclusión, los archivos van ordenados
    /// por nombre. Cualquier fallo es un `Record` con la unidad.
    pub fn collect(&self, app: &ApplicationId) -> AggResult<Vec<LogFile>> {
        let mut files = Vec::new();
        let mut found_dir = false;
        let mut missing: Vec<&str> = self.include.iter().map(String::as_str).collect();

        for root in &self.root_dirs {
            let dir = root.join(app.to_string()).join(self.unit.as_str());
            if !dir.is_dir() {
                continue;
            }
            found_dir = true;

            if self.include.is_empty() {
                let mut names = self.list_files(&dir)?;
                names.sort();
                for name in names {
                    files.push(self.read_file(&dir, &name)?);
                }
            } else {
                for name in &self.include {
                    if dir.join(name).is_file() {
                        files.push(self.read_file(&dir, name)?);
                        missing.retain(|m| *m != name.as_str());
                    }
                }
            }
        }

        if !found_dir {
            return Err(AggError::record(
                &self.unit,
                format!("no hay logs locales en {:?}", self.root_dirs),
            ));
        }
        if let Some(name) = missing.first() {
            return Err(AggError::record(
                &self.unit,
                format!("falta el archivo {name:?}"),
            ));
        }
        Ok(files)
    }

    /// Lee y arma el registro completo.
    pub fn to_record(&self, app: &ApplicationId) -> AggResult<LogRecord> {
        Ok(LogRecord {
            unit: self.unit.clone(),
            user: self.user.clone(),
            files: self.collect(app)?,
        })
    }

    fn list_files(&self, dir: &Path) -> AggResult<Vec<String>> {
        let entries = fs::read_dir(dir).map_err(|e| self.fault(dir, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.fault(dir, e))?;
            let is_file = entry
                .file_type()
                .map_err(|e| self.fault(&entry.path(), e))?
                .is_file();
            if !is_file {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => debug!(
                    "unidad {}: se ignora {:?} (nombre no es utf-8)",
                    self.unit, raw
                ),
            }
        }
        Ok(names)
    }

    fn read_file(&self, dir: &Path, name: &str) -> AggResult<LogFile> {
        let path = dir.join(name);
        let content = fs::read(&path).map_err(|e| self.fault(&path, e))?;
        Ok(LogFile::new(name, content))
    }

    fn fault(&self, path: &Path, e: io::Error) -> AggError {
        AggError::record(&self.unit, format!("{}: {}", path.display(), e))
    }
}

/* =========================
   Cabecera y trailer
   ========================= */

/// Metadatos del artefacto: quién lo escribió y quién puede leerlo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub version: u32,
    pub application: ApplicationId,
    pub node: WorkerNodeId,
    pub owner: String,
    pub acls: AccessControl,
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl ArtifactHeader {
    pub fn for_session(ctx: &AggregationContext, session_id: Uuid) -> Self {
        Self {
            version: FORMAT_VERSION,
            application: *ctx.application(),
            node: ctx.node().clone(),
            owner: ctx.identity().user.clone(),
            acls: ctx.acls().clone(),
            session_id,
            created_at: Utc::now(),
        }
    }
}

/// Marca de finalización.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactTrailer {
    pub records: u64,
    pub finished_at: DateTime<Utc>,
}

/* =========================
   Variantes
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Framed,
    Jsonl,
}

impl LogFormat {
    pub const ALL: [LogFormat; 2] = [LogFormat::Framed, LogFormat::Jsonl];

    pub fn name(self) -> &'static str {
        match self {
            LogFormat::Framed => "framed",
            LogFormat::Jsonl => "jsonl",
        }
    }

    /// Detecta la variante por los primeros bytes del artefacto.
    pub fn detect(bytes: &[u8]) -> Option<LogFormat> {
        if framed::looks_like(bytes) {
            Some(LogFormat::Framed)
        } else if jsonl::looks_like(bytes) {
            Some(LogFormat::Jsonl)
        } else {
            None
        }
    }

    pub fn encode_header(self, header: &ArtifactHeader) -> Result<Vec<u8>, CodecError> {
        match self {
            LogFormat::Framed => framed::encode_header(header),
            LogFormat::Jsonl => jsonl::encode_header(header),
        }
    }

    pub fn encode_record(self, record: &LogRecord) -> Result<Vec<u8>, CodecError> {
        match self {
            LogFormat::Framed => framed::encode_record(record),
            LogFormat::Jsonl => jsonl::encode_record(record),
        }
    }

    pub fn encode_trailer(self, trailer: &ArtifactTrailer) -> Result<Vec<u8>, CodecError> {
        match self {
            LogFormat::Framed => framed::encode_trailer(trailer),
            LogFormat::Jsonl => jsonl::encode_trailer(trailer),
        }
    }

    fn decode(self, bytes: &[u8]) -> Result<Decoded, CodecError> {
        match self {
            LogFormat::Framed => framed::decode(bytes),
            LogFormat::Jsonl => jsonl::decode(bytes),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LogFormat {
    type Err = AggError;

    fn from_str(s: &str) -> AggResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "framed" => Ok(LogFormat::Framed),
            "jsonl" => Ok(LogFormat::Jsonl),
            other => Err(AggError::UnsupportedFormat {
                name: other.to_string(),
            }),
        }
    }
}

/// Lo que devuelven los decodificadores de cada variante.
struct Decoded {
    header: ArtifactHeader,
    records: Vec<LogRecord>,
    trailer: Option<ArtifactTrailer>,
}

/// Artefacto completo ya leído.
#[derive(Debug, Clone)]
pub struct DecodedArtifact {
    pub format: LogFormat,
    pub header: ArtifactHeader,
    pub records: Vec<LogRecord>,
    pub trailer: Option<ArtifactTrailer>,
}

impl DecodedArtifact {
    /// `false` si la sesión no llegó a cerrarse (falta el trailer).
    pub fn is_complete(&self) -> bool {
        self.trailer.is_some()
    }
}

/// Decodifica un artefacto detectando su variante.
pub fn decode_artifact(path: &Path, bytes: &[u8]) -> AggResult<DecodedArtifact> {
    let format = LogFormat::detect(bytes)
        .ok_or_else(|| AggError::corrupt(path, "formato de artefacto desconocido"))?;
    let decoded = format
        .decode(bytes)
        .map_err(|e| AggError::corrupt(path, e.to_string()))?;

    if let Some(trailer) = &decoded.trailer {
        if trailer.records != decoded.records.len() as u64 {
            return Err(AggError::corrupt(
                path,
                format!(
                    "el trailer declara {} registros pero hay {}",
                    trailer.records,
                    decoded.records.len()
                ),
            ));
        }
    }

    Ok(DecodedArtifact {
        format,
        header: decoded.header,
        records: decoded.records,
        trailer: decoded.trailer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AccessType;
    use crate::ids::Identity;
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("codec_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn unit(s: &str) -> TaskUnitId {
        TaskUnitId::new(s).unwrap()
    }

    pub(super) fn sample_header() -> ArtifactHeader {
        let ctx = AggregationContext::builder(
            ApplicationId::new(1, 1),
            WorkerNodeId::new("n1", 1).unwrap(),
            Identity::new("alice"),
        )
        .destination("/r/x")
        .acl(AccessType::View, "alice")
        .acl(AccessType::Modify, "ops")
        .build()
        .unwrap();
        ArtifactHeader::for_session(&ctx, Uuid::new_v4())
    }

    pub(super) fn sample_records() -> Vec<LogRecord> {
        vec![
            LogRecord {
                unit: unit("c1"),
                user: "alice".into(),
                files: vec![
                    LogFile::new("stdout", "hola\n"),
                    LogFile::new("stderr", vec![0u8, 159, 146, 150, 255]),
                ],
            },
            LogRecord {
                unit: unit("c2"),
                user: "alice".into(),
                files: vec![],
            },
            // duplicado a propósito: el codec no deduplica
            LogRecord {
                unit: unit("c1"),
                user: "alice".into(),
                files: vec![LogFile::new("out.log", "")],
            },
        ]
    }

    fn encode_all(format: LogFormat, trailer: bool) -> Vec<u8> {
        let records = sample_records();
        let mut bytes = format.encode_header(&sample_header()).unwrap();
        for r in &records {
            bytes.extend(format.encode_record(r).unwrap());
        }
        if trailer {
            bytes.extend(
                format
                    .encode_trailer(&ArtifactTrailer {
                        records: records.len() as u64,
                        finished_at: Utc::now(),
                    })
                    .unwrap(),
            );
        }
        bytes
    }

    #[test]
    fn ambas_variantes_recuperan_nombres_y_bytes() {
        for format in LogFormat::ALL {
            let bytes = encode_all(format, true);
            let art = decode_artifact(Path::new("mem"), &bytes).unwrap();

            assert_eq!(art.format, format);
            assert!(art.is_complete());
            assert_eq!(art.records, sample_records(), "variante {format}");
            assert_eq!(art.header.acls.len(), 2);
            assert_eq!(art.header.owner, "alice");
        }
    }

    #[test]
    fn sin_trailer_queda_incompleto() {
        for format in LogFormat::ALL {
            let bytes = encode_all(format, false);
            let art = decode_artifact(Path::new("mem"), &bytes).unwrap();
            assert!(!art.is_complete());
            assert_eq!(art.records.len(), 3);
        }
    }

    #[test]
    fn cola_truncada_se_descarta() {
        for format in LogFormat::ALL {
            let mut bytes = encode_all(format, false);
            let extra = format.encode_record(&sample_records()[0]).unwrap();
            bytes.extend(&extra[..extra.len() / 2]);

            let art = decode_artifact(Path::new("mem"), &bytes).unwrap();
            assert!(!art.is_complete());
            assert_eq!(art.records.len(), 3, "variante {format}");
        }
    }

    #[test]
    fn trailer_con_cuenta_incorrecta_es_corrupto() {
        for format in LogFormat::ALL {
            let mut bytes = encode_all(format, false);
            bytes.extend(
                format
                    .encode_trailer(&ArtifactTrailer {
                        records: 99,
                        finished_at: Utc::now(),
                    })
                    .unwrap(),
            );
            let err = decode_artifact(Path::new("mem"), &bytes).unwrap_err();
            assert!(matches!(err, AggError::Corrupt { .. }));
        }
    }

    #[test]
    fn bytes_desconocidos_son_corruptos() {
        let err = decode_artifact(Path::new("mem"), b"garbage").unwrap_err();
        assert!(matches!(err, AggError::Corrupt { .. }));
    }

    #[test]
    fn log_format_desde_string() {
        assert_eq!("framed".parse::<LogFormat>().unwrap(), LogFormat::Framed);
        assert_eq!(" JSONL ".parse::<LogFormat>().unwrap(), LogFormat::Jsonl);
        let err = "tfile".parse::<LogFormat>().unwrap_err();
        assert!(matches!(err, AggError::UnsupportedFormat { ref name } if name == "tfile"));
    }

    #[test]
    fn log_value_lee_todos_los_archivos_ordenados() {
        let tmp = temp_dir("collect_all");
        let app = ApplicationId::new(1, 1);
        let dir = tmp.join(app.to_string()).join("c1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stdout"), b"o").unwrap();
        fs::write(dir.join("stderr"), b"e").unwrap();
        fs::write(dir.join("app.log"), b"a").unwrap();

        let value = LogValue::new(vec![tmp.clone()], unit("c1"), "alice");
        let files = value.collect(&app).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["app.log", "stderr", "stdout"]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn log_value_ignora_nombres_que_no_son_utf8() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let tmp = temp_dir("collect_non_utf8");
        let app = ApplicationId::new(1, 1);
        let dir = tmp.join(app.to_string()).join("c1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stdout"), b"o").unwrap();
        fs::write(dir.join(OsStr::from_bytes(b"raro\xff.log")), b"x").unwrap();

        let files = LogValue::new(vec![tmp.clone()], unit("c1"), "alice")
            .collect(&app)
            .unwrap();
        assert_eq!(files, vec![LogFile::new("stdout", "o")]);
    }

    #[test]
    fn log_value_respeta_lista_de_inclusion_y_varios_roots() {
        let tmp = temp_dir("collect_include");
        let app = ApplicationId::new(1, 1);
        let root_a = tmp.join("a");
        let root_b = tmp.join("b");
        fs::create_dir_all(root_a.join(app.to_string()).join("c1")).unwrap();
        fs::create_dir_all(root_b.join(app.to_string()).join("c1")).unwrap();
        fs::write(root_a.join(app.to_string()).join("c1").join("stdout"), b"A").unwrap();
        fs::write(root_b.join(app.to_string()).join("c1").join("stderr"), b"B").unwrap();
        fs::write(root_b.join(app.to_string()).join("c1").join("ignorado"), b"x").unwrap();

        let value = LogValue::new(vec![root_a, root_b], unit("c1"), "alice")
            .include(["stderr", "stdout"]);
        let files = value.collect(&app).unwrap();

        assert_eq!(
            files,
            vec![LogFile::new("stdout", "A"), LogFile::new("stderr", "B")]
        );
    }

    #[test]
    fn log_value_sin_directorio_o_sin_archivo_es_fallo_de_registro() {
        let tmp = temp_dir("collect_missing");
        let app = ApplicationId::new(1, 1);

        let err = LogValue::new(vec![tmp.clone()], unit("c1"), "alice")
            .collect(&app)
            .unwrap_err();
        assert_eq!(err.unit(), Some(&unit("c1")));

        fs::create_dir_all(tmp.join(app.to_string()).join("c1")).unwrap();
        let err = LogValue::new(vec![tmp.clone()], unit("c1"), "alice")
            .include(["out.log"])
            .collect(&app)
            .unwrap_err();
        assert!(matches!(err, AggError::Record { .. }));
    }
}
