use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    aggregate_application, AggregatedLogs, AggregationConfig, AggregationFactory,
    AggregationReader, AggregationRequest, ApplicationId, Identity, LocalLogStore, LogFormat,
    OnRecordError, TaskUnitId, WorkerNodeId, FINISHED_MARKER,
};
use serde::Serialize;
use std::{env, fs, io::Write, path::PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para crear, agregar e inspeccionar logs de aplicaciones")]
struct Cli {
    /// Raíz de los logs locales (si no, AGG_LOCAL_ROOT)
    #[arg(long, global = true, value_name = "DIR")]
    local_root: Option<PathBuf>,

    /// Raíz del almacenamiento durable (si no, AGG_REMOTE_ROOT)
    #[arg(long, global = true, value_name = "DIR")]
    remote_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crea (o reemplaza) los logs locales de una unidad con un archivo
    Put {
        #[arg(value_name = "APP_ID")]
        app: ApplicationId,
        #[arg(value_name = "UNIT_ID")]
        unit: TaskUnitId,
        #[arg(value_name = "ARCHIVO")]
        file_name: String,

        /// Contenido literal
        #[arg(long, conflicts_with = "from")]
        content: Option<String>,

        /// Copiar el contenido de este archivo
        #[arg(long, value_name = "PATH")]
        from: Option<PathBuf>,
    },

    /// Marca la aplicación como terminada para que la tome el agente
    Finish {
        #[arg(value_name = "APP_ID")]
        app: ApplicationId,
    },

    /// Agrega ya los logs locales de una aplicación para un nodo
    Aggregate {
        #[arg(value_name = "APP_ID")]
        app: ApplicationId,

        /// Nodo dueño de los logs (host:puerto)
        #[arg(long, value_name = "HOST:PORT")]
        node: WorkerNodeId,

        /// Usuario dueño (por defecto $USER)
        #[arg(long)]
        user: Option<String>,

        /// Archivos a incluir por unidad, separados por coma
        #[arg(long, value_delimiter = ',')]
        include: Vec<String>,

        /// Cortar en el primer fallo de una unidad
        #[arg(long)]
        abort_on_error: bool,

        /// Borrar antes el directorio remoto de la aplicación
        #[arg(long)]
        reset: bool,

        /// No reemplazar un artefacto existente
        #[arg(long)]
        no_overwrite: bool,

        /// Copias anteriores a conservar (si no, AGG_RETENTION)
        #[arg(long, allow_hyphen_values = true)]
        retention: Option<i64>,

        /// Formato de escritura (framed | jsonl)
        #[arg(long)]
        format: Option<String>,
    },

    /// Lista las unidades agregadas de una aplicación
    List {
        #[arg(value_name = "APP_ID")]
        app: ApplicationId,

        /// Sólo el artefacto de este nodo
        #[arg(long, value_name = "HOST:PORT")]
        node: Option<WorkerNodeId>,

        /// Salida en JSON
        #[arg(long)]
        json: bool,
    },

    /// Muestra los logs agregados de una unidad
    Cat {
        #[arg(value_name = "APP_ID")]
        app: ApplicationId,
        #[arg(value_name = "UNIT_ID")]
        unit: TaskUnitId,
        /// Sólo este archivo
        #[arg(value_name = "ARCHIVO")]
        file: Option<String>,

        #[arg(long, value_name = "HOST:PORT")]
        node: Option<WorkerNodeId>,
    },

    /// Nodos con artefacto para una aplicación
    Nodes {
        #[arg(value_name = "APP_ID")]
        app: ApplicationId,
    },
}

/// Fila de `list --json`.
#[derive(Serialize)]
struct UnitEntry<'a> {
    node: &'a WorkerNodeId,
    unit: &'a TaskUnitId,
    user: &'a str,
    files: Vec<FileEntry<'a>>,
}

#[derive(Serialize)]
struct FileEntry<'a> {
    name: &'a str,
    bytes: usize,
}

/// Para inspeccionar se acepta cualquier variante conocida.
fn inspection_reader() -> AggregationReader {
    AggregationReader::new(LogFormat::ALL.to_vec())
}

fn open_artifacts(
    config: &AggregationConfig,
    app: &ApplicationId,
    node: Option<&WorkerNodeId>,
) -> Result<Vec<(WorkerNodeId, AggregatedLogs)>> {
    let reader = inspection_reader();
    let artifacts = match node {
        Some(node) => vec![(
            node.clone(),
            reader.open_node(&config.remote_root, app, node)?,
        )],
        None => reader.open_all(&config.remote_root, app)?,
    };
    if artifacts.is_empty() {
        bail!("no hay logs agregados para {}", app);
    }
    Ok(artifacts)
}

pub fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = AggregationConfig::from_env().context("configuración inválida")?;
    if let Some(root) = cli.local_root {
        config.local_root = root;
    }
    if let Some(root) = cli.remote_root {
        config.remote_root = root;
    }
    let store = LocalLogStore::new(&config.local_root);

    match cli.command {
        Commands::Put {
            app,
            unit,
            file_name,
            content,
            from,
        } => {
            let bytes = match (content, from) {
                (Some(text), None) => text.into_bytes(),
                (None, Some(path)) => {
                    fs::read(&path).with_context(|| format!("leyendo {}", path.display()))?
                }
                _ => bail!("hay que indicar --content o --from"),
            };

            let path = store.put(&app, &unit, &file_name, &bytes)?;
            println!("Log local creado:");
            println!("  app: {}", app);
            println!("  unidad: {}", unit);
            println!("  archivo: {}", path.display());
            println!("  bytes: {}", bytes.len());
        }

        Commands::Finish { app } => {
            let dir = store.app_dir(&app);
            if !dir.is_dir() {
                bail!("no hay logs locales para {} en {}", app, dir.display());
            }
            let marker = dir.join(FINISHED_MARKER);
            fs::write(&marker, b"").with_context(|| format!("escribiendo {}", marker.display()))?;
            println!("Aplicación {} marcada como terminada", app);
        }

        Commands::Aggregate {
            app,
            node,
            user,
            include,
            abort_on_error,
            reset,
            no_overwrite,
            retention,
            format,
        } => {
            let mut formats = config.formats.clone();
            if let Some(format) = format {
                formats.insert(0, format);
            }
            let factory = AggregationFactory::new(formats);

            let user = user
                .or_else(|| env::var("USER").ok())
                .unwrap_or_else(|| "logagg".to_string());

            let mut request = AggregationRequest::from_config(&config, app, node, Identity::new(user));
            request.include = include;
            request.reset_remote_app_dir = reset;
            if no_overwrite {
                request.overwrite = false;
            }
            if let Some(retention) = retention {
                request.retention = retention;
            }
            if abort_on_error {
                request.on_record_error = OnRecordError::Abort;
            }

            let report = aggregate_application(&factory, &store, &config.remote_root, &request)?;

            println!("Agregación terminada:");
            println!("  app: {}", report.application);
            println!("  nodo: {}", report.node);
            println!("  artefacto: {}", report.artifact.display());
            println!("  unidades agregadas: {}", report.written.len());
            if report.is_partial() {
                println!("  unidades fallidas: {}", report.failed.len());
                for (unit, reason) in &report.failed {
                    println!("    - {}: {}", unit, reason);
                }
            }
        }

        Commands::List { app, node, json } => {
            let artifacts = open_artifacts(&config, &app, node.as_ref())?;

            if json {
                let entries: Vec<UnitEntry> = artifacts
                    .iter()
                    .flat_map(|(node, logs)| {
                        logs.records().iter().map(move |r| UnitEntry {
                            node,
                            unit: &r.unit,
                            user: &r.user,
                            files: r
                                .files
                                .iter()
                                .map(|f| FileEntry {
                                    name: &f.name,
                                    bytes: f.content.len(),
                                })
                                .collect(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for (node, logs) in &artifacts {
                    println!("Nodo {}:", node);
                    println!("  artefacto: {}", logs.path().display());
                    println!("  formato: {}", logs.format());
                    println!("  dueño: {}", logs.header().owner);
                    if !logs.is_complete() {
                        println!("  (incompleto: sin trailer)");
                    }
                    if logs.records().is_empty() {
                        println!("  (sin unidades)");
                    }
                    for record in logs.records() {
                        let names: Vec<&str> =
                            record.files.iter().map(|f| f.name.as_str()).collect();
                        println!("  - {} [{}]", record.unit, names.join(", "));
                    }
                    println!();
                }
            }
        }

        Commands::Cat {
            app,
            unit,
            file,
            node,
        } => {
            let artifacts = open_artifacts(&config, &app, node.as_ref())?;
            let mut stdout = std::io::stdout().lock();
            let mut found = false;

            for (node, logs) in &artifacts {
                for record in logs.read_all(&unit) {
                    for f in &record.files {
                        if file.as_deref().is_some_and(|name| name != f.name) {
                            continue;
                        }
                        found = true;
                        writeln!(stdout, "==> {} / {} / {} <==", node, record.unit, f.name)?;
                        stdout.write_all(&f.content)?;
                        if !f.content.ends_with(b"\n") {
                            writeln!(stdout)?;
                        }
                    }
                }
            }

            if !found {
                match file {
                    Some(name) => bail!("no hay archivo {:?} para la unidad {}", name, unit),
                    None => bail!("no hay logs agregados para la unidad {}", unit),
                }
            }
        }

        Commands::Nodes { app } => {
            let nodes = inspection_reader().list_nodes(&config.remote_root, &app)?;
            if nodes.is_empty() {
                println!("No hay artefactos para {}", app);
            } else {
                println!("Nodos con logs de {}:", app);
                for node in nodes {
                    println!("  - {}", node);
                }
            }
        }
    }

    Ok(())
}
