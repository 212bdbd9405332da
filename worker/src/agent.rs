use anyhow::{Context, Result};
use common::{
    aggregate_application, AggregationConfig, AggregationFactory, AggregationReport,
    AggregationRequest, ApplicationId, Identity, LocalLogStore, WorkerNodeId, AGGREGATED_MARKER,
    FINISHED_MARKER,
};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_USER: &str = "logagg";

/// Todo lo que necesita una sesión de agregación, compartido entre tareas.
struct Agent {
    config: AggregationConfig,
    factory: AggregationFactory,
    node: WorkerNodeId,
    identity: Identity,
}

/// Loop principal del agente.
/// - Busca aplicaciones terminadas en la raíz local.
/// - Agrega cada una en un hilo de bloqueo (hasta AGG_MAX_SESSIONS a la vez).
/// - Marca las aplicaciones ya subidas (o borra sus logs locales).
pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=info,common=info")),
        )
        .init();

    let config = AggregationConfig::from_env().context("configuración inválida")?;
    let factory = AggregationFactory::from_config(&config);
    // Formato inválido: mejor fallar al arrancar que en cada aplicación.
    let format = factory.write_format()?;

    let node = node_id(config.node_port)?;
    let identity = Identity::new(env::var("USER").unwrap_or_else(|_| DEFAULT_USER.to_string()));

    info!(
        "agente {} (usuario {}) local={} remoto={} formato={} sesiones={}",
        node,
        identity.user,
        config.local_root.display(),
        config.remote_root.display(),
        format,
        config.max_sessions
    );

    let sem = Arc::new(Semaphore::new(config.max_sessions));
    let run_once = config.run_once;
    let interval = Duration::from_secs(config.scan_interval_secs);
    let agent = Arc::new(Agent {
        config,
        factory,
        node,
        identity,
    });

    loop {
        let pending = match pending_applications(&agent.config.local_root) {
            Ok(apps) => apps,
            Err(e) => {
                warn!("no se pudo recorrer la raíz local: {:#}", e);
                Vec::new()
            }
        };
        if pending.is_empty() {
            debug!("no hay aplicaciones pendientes");
        }

        let mut handles = Vec::with_capacity(pending.len());
        for app in pending {
            let permit = sem.clone().acquire_owned().await?;
            let agent = agent.clone();

            handles.push(tokio::spawn(async move {
                let result = tokio::task::spawn_blocking(move || agent.aggregate(app)).await;

                match result {
                    Ok(Ok(report)) if report.is_partial() => {
                        warn!(
                            "app {} subida con {} unidades fallidas",
                            app,
                            report.failed.len()
                        );
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!("error agregando app {}: {:#}", app, e),
                    Err(e) => warn!("panic o join error agregando app {}: {:?}", app, e),
                }

                drop(permit);
            }));
        }

        // Esperamos la pasada entera para no tomar dos veces la misma app.
        for handle in handles {
            let _ = handle.await;
        }

        if run_once {
            info!("AGG_RUN_ONCE activo, termina el agente");
            return Ok(());
        }
        sleep(interval).await;
    }
}

impl Agent {
    /// Sube una aplicación y deja constancia local.
    fn aggregate(&self, app: ApplicationId) -> Result<AggregationReport> {
        let local = LocalLogStore::new(&self.config.local_root);
        let request =
            AggregationRequest::from_config(&self.config, app, self.node.clone(), self.identity.clone());

        let report = aggregate_application(&self.factory, &local, &self.config.remote_root, &request)?;

        if self.config.delete_local {
            local.remove_app(&app)?;
            info!("logs locales de {} borrados", app);
        } else {
            mark_aggregated(&local.app_dir(&app), &report)?;
        }
        Ok(report)
    }
}

/// Id del nodo: hostname + puerto configurado.
fn node_id(port: u16) -> Result<WorkerNodeId> {
    let host = hostname::get()
        .context("no se pudo leer el hostname")?
        .to_string_lossy()
        .to_string();
    Ok(WorkerNodeId::new(host, port)?)
}

/// Aplicaciones con `.finished` y sin `.aggregated`, ordenadas.
fn pending_applications(local_root: &Path) -> Result<Vec<ApplicationId>> {
    let pattern = format!("{}/*/{}", local_root.display(), FINISHED_MARKER);

    let mut apps = Vec::new();
    for entry in glob::glob(&pattern).context("patrón de búsqueda inválido")? {
        let marker = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!("entrada ilegible en la raíz local: {}", e);
                continue;
            }
        };
        let Some(app_dir) = marker.parent() else {
            continue;
        };
        if app_dir.join(AGGREGATED_MARKER).exists() {
            continue;
        }

        let name = app_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match name.parse::<ApplicationId>() {
            Ok(app) => apps.push(app),
            Err(e) => debug!("ignorando {}: {}", app_dir.display(), e),
        }
    }

    apps.sort();
    apps.dedup();
    Ok(apps)
}

/// Escribe `.aggregated` con el reporte de la sesión.
fn mark_aggregated(app_dir: &Path, report: &AggregationReport) -> Result<PathBuf> {
    let marker = app_dir.join(AGGREGATED_MARKER);
    let json = serde_json::to_vec_pretty(report)?;
    fs::write(&marker, json).with_context(|| format!("escribiendo {}", marker.display()))?;
    Ok(marker)
}
