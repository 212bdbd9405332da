//! Variante JSONL: una línea por cabecera, registro y trailer, con el campo
//! `kind` como discriminante. El contenido de los archivos va en base64.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use super::{ArtifactHeader, ArtifactTrailer, CodecError, Decoded, LogFile, LogRecord};
use crate::ids::TaskUnitId;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Line {
    Header(ArtifactHeader),
    Record(RecordLine),
    Trailer(ArtifactTrailer),
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordLine {
    unit: TaskUnitId,
    user: String,
    files: Vec<FileLine>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileLine {
    name: String,
    content: String,
}

pub(super) fn looks_like(bytes: &[u8]) -> bool {
    bytes.first() == Some(&b'{')
}

fn encode_line(line: &Line) -> Result<Vec<u8>, CodecError> {
    let mut buf = serde_json::to_vec(line)?;
    buf.push(b'\n');
    Ok(buf)
}

pub(super) fn encode_header(header: &ArtifactHeader) -> Result<Vec<u8>, CodecError> {
    encode_line(&Line::Header(header.clone()))
}

pub(super) fn encode_record(record: &LogRecord) -> Result<Vec<u8>, CodecError> {
    let files = record
        .files
        .iter()
        .map(|f| FileLine {
            name: f.name.clone(),
            content: STANDARD.encode(&f.content),
        })
        .collect();

    encode_line(&Line::Record(RecordLine {
        unit: record.unit.clone(),
        user: record.user.clone(),
        files,
    }))
}

pub(super) fn encode_trailer(trailer: &ArtifactTrailer) -> Result<Vec<u8>, CodecError> {
    encode_line(&Line::Trailer(trailer.clone()))
}

fn into_record(line: RecordLine) -> Result<LogRecord, CodecError> {
    let mut files = Vec::with_capacity(line.files.len());
    for f in line.files {
        let content = STANDARD
            .decode(f.content.as_bytes())
            .map_err(|e| CodecError::invalid(format!("base64 inválido en {}: {e}", f.name)))?;
        files.push(LogFile {
            name: f.name,
            content,
        });
    }
    Ok(LogRecord {
        unit: line.unit,
        user: line.user,
        files,
    })
}

pub(super) fn decode(bytes: &[u8]) -> Result<Decoded, CodecError> {
    // la última línea sin '\n' es una cola cortada: se ignora
    let complete = match bytes.iter().rposition(|b| *b == b'\n') {
        Some(idx) => &bytes[..=idx],
        None => return Err(CodecError::invalid("cabecera truncada")),
    };

    let mut lines = complete
        .split(|b| *b == b'\n')
        .filter(|l| !l.is_empty());

    let header = match lines.next() {
        Some(first) => match serde_json::from_slice::<Line>(first)? {
            Line::Header(h) => h,
            _ => return Err(CodecError::invalid("la primera línea no es la cabecera")),
        },
        None => return Err(CodecError::invalid("artefacto vacío")),
    };

    let mut records = Vec::new();
    let mut trailer = None;

    for raw in lines {
        if trailer.is_some() {
            return Err(CodecError::invalid("datos después del trailer"));
        }
        match serde_json::from_slice::<Line>(raw)? {
            Line::Record(r) => records.push(into_record(r)?),
            Line::Trailer(t) => trailer = Some(t),
            Line::Header(_) => return Err(CodecError::invalid("cabecera repetida")),
        }
    }

    Ok(Decoded {
        header,
        records,
        trailer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::{sample_header, sample_records};

    #[test]
    fn cada_registro_es_una_linea_con_kind() {
        let bytes = encode_record(&sample_records()[0]).unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);

        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["kind"], "record");
        assert_eq!(v["unit"], "c1");
        assert_eq!(v["files"][0]["name"], "stdout");
        assert_eq!(v["files"][0]["content"], STANDARD.encode("hola\n"));
    }

    #[test]
    fn cabecera_repetida_es_error() {
        let mut bytes = encode_header(&sample_header()).unwrap();
        bytes.extend(encode_header(&sample_header()).unwrap());
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn base64_roto_es_error() {
        let mut bytes = encode_header(&sample_header()).unwrap();
        bytes.extend_from_slice(
            br#"{"kind":"record","unit":"c1","user":"u","files":[{"name":"x","content":"%%%"}]}"#,
        );
        bytes.push(b'\n');
        assert!(decode(&bytes).is_err());
    }
}
