//! Variante binaria.
//!
//! ```text
//! "LAGG" | version u32
//! frame*: kind u8 | len u32 | crc32c(body) u32 | body
//! ```
//!
//! Enteros en little-endian. Frames: `H` cabecera (JSON), `R` registro,
//! `E` trailer (JSON). Un frame cortado al final se descarta: es la cola de
//! una sesión que no llegó a cerrarse.

use crc32c::crc32c;

use super::{ArtifactHeader, ArtifactTrailer, CodecError, Decoded, LogFile, LogRecord, FORMAT_VERSION};
use crate::ids::TaskUnitId;

const MAGIC: &[u8; 4] = b"LAGG";
const PREAMBLE_LEN: usize = MAGIC.len() + 4;
const FRAME_HEADER_LEN: usize = 9;

const KIND_HEADER: u8 = b'H';
const KIND_RECORD: u8 = b'R';
const KIND_TRAILER: u8 = b'E';

pub(super) fn looks_like(bytes: &[u8]) -> bool {
    bytes.starts_with(MAGIC)
}

fn frame(kind: u8, body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = u32::try_from(body.len()).map_err(|_| CodecError::TooLarge {
        what: "frame",
        len: body.len(),
    })?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.push(kind);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&crc32c(body).to_le_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    let len = u32::try_from(s.len()).map_err(|_| CodecError::TooLarge {
        what: "string",
        len: s.len(),
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

pub(super) fn encode_header(header: &ArtifactHeader) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.extend(frame(KIND_HEADER, &serde_json::to_vec(header)?)?);
    Ok(buf)
}

pub(super) fn encode_record(record: &LogRecord) -> Result<Vec<u8>, CodecError> {
    let mut body = Vec::new();
    put_str(&mut body, record.unit.as_str())?;
    put_str(&mut body, &record.user)?;

    let count = u32::try_from(record.files.len()).map_err(|_| CodecError::TooLarge {
        what: "lista de archivos",
        len: record.files.len(),
    })?;
    body.extend_from_slice(&count.to_le_bytes());

    for file in &record.files {
        put_str(&mut body, &file.name)?;
        body.extend_from_slice(&(file.content.len() as u64).to_le_bytes());
        body.extend_from_slice(&file.content);
    }

    frame(KIND_RECORD, &body)
}

pub(super) fn encode_trailer(trailer: &ArtifactTrailer) -> Result<Vec<u8>, CodecError> {
    frame(KIND_TRAILER, &serde_json::to_vec(trailer)?)
}

/* ---------------- lectura ---------------- */

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::invalid("registro truncado"));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::invalid("string no es utf-8"))
    }

    /// Siguiente frame completo, o `None` si no queda uno entero.
    fn frame(&mut self) -> Result<Option<(u8, &'a [u8])>, CodecError> {
        if self.remaining() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let start = self.pos;
        let kind = self.take(1)?[0];
        let len = self.u32()? as usize;
        let expected_crc = self.u32()?;
        if self.remaining() < len {
            self.pos = start;
            return Ok(None);
        }
        let body = self.take(len)?;
        let actual_crc = crc32c(body);
        if actual_crc != expected_crc {
            return Err(CodecError::invalid(format!(
                "crc incorrecto en offset {start}: esperado {expected_crc:#x}, obtenido {actual_crc:#x}"
            )));
        }
        Ok(Some((kind, body)))
    }
}

fn decode_record(body: &[u8]) -> Result<LogRecord, CodecError> {
    let mut c = Cursor::new(body);
    let unit = TaskUnitId::new(c.string()?).map_err(|e| CodecError::invalid(e.to_string()))?;
    let user = c.string()?;
    let count = c.u32()? as usize;

    let mut files = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let name = c.string()?;
        let len = usize::try_from(c.u64()?)
            .map_err(|_| CodecError::invalid("longitud de archivo fuera de rango"))?;
        let content = c.take(len)?.to_vec();
        files.push(LogFile { name, content });
    }

    if c.remaining() != 0 {
        return Err(CodecError::invalid("bytes sobrantes en el registro"));
    }
    Ok(LogRecord { unit, user, files })
}

pub(super) fn decode(bytes: &[u8]) -> Result<Decoded, CodecError> {
    if bytes.len() < PREAMBLE_LEN || !looks_like(bytes) {
        return Err(CodecError::invalid("preámbulo inválido"));
    }
    let mut c = Cursor::new(bytes);
    c.take(MAGIC.len())?;
    let version = c.u32()?;
    if version != FORMAT_VERSION {
        return Err(CodecError::invalid(format!(
            "versión {version} no soportada (se espera {FORMAT_VERSION})"
        )));
    }

    let header = match c.frame()? {
        Some((KIND_HEADER, body)) => serde_json::from_slice::<ArtifactHeader>(body)?,
        Some((kind, _)) => {
            return Err(CodecError::invalid(format!(
                "se esperaba cabecera, llegó frame {:?}",
                kind as char
            )))
        }
        None => return Err(CodecError::invalid("cabecera truncada")),
    };

    let mut records = Vec::new();
    let mut trailer = None;

    while let Some((kind, body)) = c.frame()? {
        if trailer.is_some() {
            return Err(CodecError::invalid("datos después del trailer"));
        }
        match kind {
            KIND_RECORD => records.push(decode_record(body)?),
            KIND_TRAILER => trailer = Some(serde_json::from_slice::<ArtifactTrailer>(body)?),
            other => {
                return Err(CodecError::invalid(format!(
                    "tipo de frame desconocido {:?}",
                    other as char
                )))
            }
        }
    }

    Ok(Decoded {
        header,
        records,
        trailer,
    })
}
