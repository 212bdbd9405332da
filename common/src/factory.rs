use std::collections::HashSet;
use tracing::debug;

use crate::codec::LogFormat;
use crate::config::AggregationConfig;
use crate::error::{AggError, AggResult};
use crate::reader::AggregationReader;
use crate::writer::AggregationWriter;

/// Elige la variante de writer/reader según la configuración.
///
/// Sólo mapea nombres de formato a constructores: no hace I/O.
#[derive(Debug, Clone)]
pub struct AggregationFactory {
    formats: Vec<String>,
}

impl AggregationFactory {
    pub fn new<I, S>(formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            formats: formats.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &AggregationConfig) -> Self {
        Self::new(config.formats.iter().cloned())
    }

    fn resolve(&self) -> AggResult<Vec<LogFormat>> {
        if self.formats.is_empty() {
            return Err(AggError::invalid_config("no hay formatos configurados"));
        }
        self.formats.iter().map(|s| s.parse::<LogFormat>()).collect()
    }

    /// Variante con la que se escribe: la primera configurada.
    pub fn write_format(&self) -> AggResult<LogFormat> {
        let formats = self.resolve()?;
        Ok(formats[0])
    }

    /// Writer nuevo en estado `Created`.
    pub fn writer(&self) -> AggResult<AggregationWriter> {
        let format = self.write_format()?;
        debug!("writer de agregación con formato {}", format);
        Ok(AggregationWriter::new(format))
    }

    /// Reader que acepta todas las variantes configuradas.
    pub fn reader(&self) -> AggResult<AggregationReader> {
        let mut formats = self.resolve()?;
        let mut seen = HashSet::new();
        formats.retain(|f| seen.insert(*f));
        Ok(AggregationReader::new(formats))
    }
}
