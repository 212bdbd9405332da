//! Logs locales de cada worker: `{root}/{app}/{unit}/{archivo}`.
//!
//! Las operaciones que borran y recrean directorios no toman locks; quien
//! llama se encarga de serializarlas.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::error::{AggError, AggResult};
use crate::ids::{check_path_component, ApplicationId, TaskUnitId};

/// Crea `path` vacío (borrando lo que hubiera) y comprueba que exista.
pub fn ensure_dir(path: &Path) -> AggResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => debug!("directorio {} recreado", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(AggError::io(path, e)),
    }

    fs::create_dir_all(path).map_err(|e| AggError::io(path, e))?;

    // el store podría fallar sin error: re-leemos
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(AggError::NotFound {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(AggError::NotFound {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(AggError::io(path, e)),
    }
}

/// Escribe `app_dir/unit/file_name` con `content`. El directorio de la
/// unidad se recrea, así que sólo queda este archivo.
pub fn put(app_dir: &Path, unit: &TaskUnitId, file_name: &str, content: &[u8]) -> AggResult<PathBuf> {
    let mut written = put_files(app_dir, unit, &[(file_name, content)])?;
    written.pop().ok_or_else(|| AggError::NotFound {
        path: app_dir.join(unit.as_str()).join(file_name),
    })
}

/// Igual que [`put`] pero con varios archivos en la misma unidad.
pub fn put_files<N, C>(app_dir: &Path, unit: &TaskUnitId, files: &[(N, C)]) -> AggResult<Vec<PathBuf>>
where
    N: AsRef<str>,
    C: AsRef<[u8]>,
{
    for (name, _) in files {
        check_path_component("nombre de archivo", name.as_ref())?;
    }

    let unit_dir = app_dir.join(unit.as_str());
    ensure_dir(&unit_dir)?;

    let mut written = Vec::with_capacity(files.len());
    for (name, content) in files {
        let path = unit_dir.join(name.as_ref());
        fs::write(&path, content.as_ref()).map_err(|e| AggError::io(&path, e))?;
        written.push(path);
    }
    Ok(written)
}

/// Vista de los logs locales de un nodo bajo un directorio raíz.
#[derive(Debug, Clone)]
pub struct LocalLogStore {
    root: PathBuf,
}

impl LocalLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn app_dir(&self, app: &ApplicationId) -> PathBuf {
        self.root.join(app.to_string())
    }

    pub fn unit_dir(&self, app: &ApplicationId, unit: &TaskUnitId) -> PathBuf {
        self.app_dir(app).join(unit.as_str())
    }

    /// Deja el directorio de la aplicación vacío.
    pub fn prepare_app(&self, app: &ApplicationId) -> AggResult<PathBuf> {
        let dir = self.app_dir(app);
        ensure_dir(&dir)?;
        Ok(dir)
    }

    pub fn put(
        &self,
        app: &ApplicationId,
        unit: &TaskUnitId,
        file_name: &str,
        content: &[u8],
    ) -> AggResult<PathBuf> {
        put(&self.app_dir(app), unit, file_name, content)
    }

    /// Unidades con directorio propio, ordenadas. Si la aplicación no tiene
    /// directorio devuelve una lista vacía. Las entradas ocultas (marcadores)
    /// y los nombres que no son ids válidos se ignoran.
    pub fn list_units(&self, app: &ApplicationId) -> AggResult<Vec<TaskUnitId>> {
        let dir = self.app_dir(app);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AggError::io(&dir, e)),
        };

        let mut units = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| AggError::io(&dir, e))?;
            let file_type = entry.file_type().map_err(|e| AggError::io(entry.path(), e))?;
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            match TaskUnitId::new(name) {
                Ok(unit) => units.push(unit),
                Err(e) => debug!("ignorando entrada {:?}: {}", entry.path(), e),
            }
        }

        units.sort();
        Ok(units)
    }

    /// Borra los logs locales de la aplicación (después de subirlos).
    pub fn remove_app(&self, app: &ApplicationId) -> AggResult<()> {
        let dir = self.app_dir(app);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AggError::io(&dir, e)),
        }
    }
}
