//! Coordinador: junta los logs locales de una aplicación en un nodo y los
//! sube como un artefacto.

use serde::Serialize;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

use crate::codec::{LogKey, LogValue};
use crate::config::AggregationConfig;
use crate::context::{AccessType, AggregationContext};
use crate::error::{AggError, AggResult};
use crate::factory::AggregationFactory;
use crate::ids::{ApplicationId, Identity, TaskUnitId, WorkerNodeId};
use crate::layout;
use crate::local_store::{self, LocalLogStore};
use crate::writer::with_session;

/// Qué hacer cuando falla el registro de una unidad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnRecordError {
    /// Se anota y se sigue con la siguiente unidad.
    #[default]
    Continue,
    /// Se corta la sesión (igual se cierra el artefacto con lo escrito).
    Abort,
}

#[derive(Debug, Clone)]
pub struct AggregationRequest {
    pub application: ApplicationId,
    pub node: WorkerNodeId,
    pub identity: Identity,
    pub overwrite: bool,
    pub retention: i64,
    /// Archivos a incluir por unidad (vacío = todos).
    pub include: Vec<String>,
    pub on_record_error: OnRecordError,
    /// Borrar el directorio remoto de la aplicación antes de subir.
    pub reset_remote_app_dir: bool,
}

impl AggregationRequest {
    pub fn new(application: ApplicationId, node: WorkerNodeId, identity: Identity) -> Self {
        Self {
            application,
            node,
            identity,
            overwrite: true,
            retention: 0,
            include: Vec::new(),
            on_record_error: OnRecordError::Continue,
            reset_remote_app_dir: false,
        }
    }

    pub fn from_config(
        config: &AggregationConfig,
        application: ApplicationId,
        node: WorkerNodeId,
        identity: Identity,
    ) -> Self {
        Self {
            overwrite: config.overwrite,
            retention: config.retention,
            ..Self::new(application, node, identity)
        }
    }

    fn context(&self, remote_root: &Path) -> AggResult<AggregationContext> {
        let destination = layout::layout(remote_root, &self.application, &self.node);
        AggregationContext::builder(self.application, self.node.clone(), self.identity.clone())
            .destination(destination)
            .overwrite(self.overwrite)
            .retention(self.retention)
            .acl(AccessType::View, self.identity.user.clone())
            .build()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregationReport {
    pub application: ApplicationId,
    pub node: WorkerNodeId,
    pub artifact: PathBuf,
    pub written: Vec<TaskUnitId>,
    pub failed: Vec<(TaskUnitId, String)>,
}

impl AggregationReport {
    /// `true` si alguna unidad quedó afuera.
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Sube los logs locales de `request.application` al artefacto de
/// (aplicación, nodo) bajo `remote_root`.
///
/// La configuración se valida antes de tocar el filesystem. El writer se
/// cierra siempre; con `OnRecordError::Abort` el primer fallo de registro
/// se devuelve como error después de cerrar.
pub fn aggregate_application(
    factory: &AggregationFactory,
    local: &LocalLogStore,
    remote_root: &Path,
    request: &AggregationRequest,
) -> AggResult<AggregationReport> {
    let ctx = request.context(remote_root)?;
    let mut writer = factory.writer()?;

    let units = local.list_units(&request.application)?;
    if units.is_empty() {
        warn!(
            "app {} sin unidades con logs en {}",
            request.application,
            local.root().display()
        );
    }

    if request.reset_remote_app_dir {
        reset_app_dir(&layout::remote_app_dir(remote_root, &request.application))?;
    }

    let artifact = ctx.destination().to_path_buf();
    let user = request.identity.short_name().to_string();
    let mut report = AggregationReport {
        application: request.application,
        node: request.node.clone(),
        artifact,
        written: Vec::new(),
        failed: Vec::new(),
    };

    with_session(&mut writer, ctx, |w| {
        for unit in &units {
            let value = LogValue::new(vec![local.root().to_path_buf()], unit.clone(), user.clone())
                .include(request.include.iter().cloned());

            match w.write(&LogKey(unit.clone()), &value) {
                Ok(()) => report.written.push(unit.clone()),
                Err(e @ AggError::Record { .. }) => {
                    report.failed.push((unit.clone(), e.to_string()));
                    if request.on_record_error == OnRecordError::Abort {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    })?;

    info!(
        "app {} nodo {}: {} unidades agregadas, {} fallidas -> {}",
        report.application,
        report.node,
        report.written.len(),
        report.failed.len(),
        report.artifact.display()
    );
    Ok(report)
}

/// Vacía el directorio remoto de la aplicación. Se niega si algún nodo
/// tiene una sesión de escritura abierta (hay un `.lock` adentro).
fn reset_app_dir(app_dir: &Path) -> AggResult<()> {
    let entries = match fs::read_dir(app_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return local_store::ensure_dir(app_dir),
        Err(e) => return Err(AggError::io(app_dir, e)),
    };
    for entry in entries {
        let path = entry.map_err(|e| AggError::io(app_dir, e))?.path();
        if path.extension().is_some_and(|ext| ext == "lock") {
            return Err(AggError::Storage {
                path,
                source: io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "sesión de escritura abierta, no se puede vaciar el directorio",
                ),
            });
        }
    }
    local_store::ensure_dir(app_dir)
}
