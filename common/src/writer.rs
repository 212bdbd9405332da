//! Sesión de escritura de un artefacto agregado.
//!
//! ```text
//! Created --initialize--> Initialized --(abre)--> Writing --write*--> Writing --close--> Closed
//! ```
//!
//! Un solo dueño por sesión y un solo writer por destino: el destino se
//! bloquea con un archivo `{destino}.lock` creado en modo exclusivo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{self, ArtifactHeader, ArtifactTrailer, LogFormat, LogKey, LogValue};
use crate::context::AggregationContext;
use crate::error::{AggError, AggResult};
use crate::ids::{ApplicationId, TaskUnitId};
use crate::layout;

const ARTIFACT_MODE: u32 = 0o640;
/// Un lock sin metadatos legibles se considera abandonado pasado este tiempo.
const UNREADABLE_LOCK_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Created,
    Initialized,
    Writing,
    Closed,
}

impl fmt::Display for WriterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WriterState::Created => "CREATED",
            WriterState::Initialized => "INITIALIZED",
            WriterState::Writing => "WRITING",
            WriterState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/* =========================
   Lock del destino
   ========================= */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMeta {
    pub session_id: Uuid,
    #[serde(default)]
    pub host: String,
    pub pid: u32,
    pub user: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ArtifactLock {
    path: PathBuf,
    released: bool,
}

impl ArtifactLock {
    /// Toma el lock del destino. Si está tomado por una sesión muerta de
    /// este host (o es ilegible y viejo), se descarta y se reintenta una vez.
    fn acquire(destination: &Path, meta: &LockMeta) -> AggResult<Self> {
        let path = layout::lock_path(destination);
        let mut file = match create_lock_file(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = read_lock_meta(&path);
                if !is_stale(&path, holder.as_ref()) {
                    return Err(lock_held(path, holder));
                }
                warn!(
                    "lock abandonado en {} ({}), se descarta",
                    path.display(),
                    describe_holder(holder.as_ref())
                );
                remove_if_exists(&path).map_err(|e| AggError::io(&path, e))?;
                match create_lock_file(&path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        let holder = read_lock_meta(&path);
                        return Err(lock_held(path, holder));
                    }
                    Err(e) => return Err(AggError::io(path, e)),
                }
            }
            Err(e) => return Err(AggError::io(path, e)),
        };

        let lock = Self {
            path,
            released: false,
        };
        let bytes = serde_json::to_vec(meta)
            .map_err(|e| AggError::io(&lock.path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
        file.write_all(&bytes)
            .map_err(|e| AggError::io(&lock.path, e))?;
        Ok(lock)
    }

    fn release(mut self) -> io::Result<()> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for ArtifactLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Quién tiene tomado el destino, si alguien lo tiene.
pub fn read_lock_meta(lock_path: &Path) -> Option<LockMeta> {
    let bytes = fs::read(lock_path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn create_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

fn lock_held(path: PathBuf, holder: Option<LockMeta>) -> AggError {
    AggError::Storage {
        path,
        source: io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("destino en uso por {}", describe_holder(holder.as_ref())),
        ),
    }
}

fn describe_holder(holder: Option<&LockMeta>) -> String {
    match holder {
        Some(m) => format!(
            "sesión {} de {} (pid {} en {})",
            m.session_id, m.user, m.pid, m.host
        ),
        None => "otra sesión".to_string(),
    }
}

pub(crate) fn local_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// Sin /proc no se puede saber: se asume vivo.
#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// Sólo se rompen locks de este host cuyo proceso ya no existe, o locks
/// ilegibles más viejos que `UNREADABLE_LOCK_TTL`.
fn is_stale(path: &Path, holder: Option<&LockMeta>) -> bool {
    match holder {
        Some(m) => !m.host.is_empty() && m.host == local_host() && !pid_alive(m.pid),
        None => fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .is_some_and(|age| age >= UNREADABLE_LOCK_TTL),
    }
}

/* =========================
   Sesión abierta
   ========================= */

#[derive(Debug)]
struct Session {
    ctx: AggregationContext,
    session_id: Uuid,
    file: File,
    lock: ArtifactLock,
    /// Offset del final del último registro bien escrito.
    end: u64,
    records: u64,
}

impl Session {
    /// Agrega bytes completos o nada: si falla, se trunca hasta `end`.
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        if let Err(e) = self.file.write_all(bytes).and_then(|_| self.file.flush()) {
            if let Err(trunc) = self.file.set_len(self.end) {
                warn!(
                    "no se pudo truncar {} tras un error de escritura: {}",
                    self.ctx.finalize_at().display(),
                    trunc
                );
            }
            return Err(e);
        }
        self.end += bytes.len() as u64;
        Ok(())
    }
}

/* =========================
   Writer
   ========================= */

/// Writer de una sesión de agregación. Lo entrega la
/// [`AggregationFactory`](crate::factory::AggregationFactory) en estado
/// `Created`.
#[derive(Debug)]
pub struct AggregationWriter {
    format: LogFormat,
    state: WriterState,
    session: Option<Session>,
    records_written: u64,
    failed_units: Vec<TaskUnitId>,
}

impl AggregationWriter {
    pub fn new(format: LogFormat) -> Self {
        Self {
            format,
            state: WriterState::Created,
            session: None,
            records_written: 0,
            failed_units: Vec::new(),
        }
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Unidades cuyo `write` falló en esta sesión.
    pub fn failed_units(&self) -> &[TaskUnitId] {
        &self.failed_units
    }

    pub fn context(&self) -> Option<&AggregationContext> {
        self.session.as_ref().map(|s| &s.ctx)
    }

    /// Abre el artefacto del contexto y escribe la cabecera con la ACL.
    ///
    /// Si falla no queda nada creado (ni lock ni archivo temporal) y el
    /// writer vuelve a `Created`, así que se puede reintentar.
    pub fn initialize(&mut self, ctx: AggregationContext) -> AggResult<()> {
        if self.state != WriterState::Created {
            return Err(AggError::IllegalState {
                op: "initialize",
                state: self.state.to_string(),
            });
        }
        self.state = WriterState::Initialized;

        match open_session(self.format, ctx) {
            Ok(session) => {
                info!(
                    "sesión {} abierta: app={} nodo={} destino={} formato={}",
                    session.session_id,
                    session.ctx.application(),
                    session.ctx.node(),
                    session.ctx.destination().display(),
                    self.format
                );
                self.session = Some(session);
                self.state = WriterState::Writing;
                Ok(())
            }
            Err(e) => {
                self.state = WriterState::Created;
                Err(e)
            }
        }
    }

    /// Agrega el registro de una unidad.
    ///
    /// Un fallo devuelve `Record` con la unidad y no deja bytes a medias en
    /// el artefacto; la sesión sigue abierta y quien llama decide si sigue.
    pub fn write(&mut self, key: &LogKey, value: &LogValue) -> AggResult<()> {
        let session = match (self.state, self.session.as_mut()) {
            (WriterState::Writing, Some(session)) => session,
            _ => {
                return Err(AggError::IllegalState {
                    op: "write",
                    state: self.state.to_string(),
                })
            }
        };

        let result = encode_value(self.format, session.ctx.application(), key, value)
            .and_then(|bytes| {
                session
                    .append(&bytes)
                    .map_err(|e| AggError::record(key.unit(), e.to_string()))
            });

        match result {
            Ok(()) => {
                session.records += 1;
                self.records_written += 1;
                debug!(
                    "unidad {} agregada en {}",
                    key.unit(),
                    session.ctx.finalize_at().display()
                );
                Ok(())
            }
            Err(e) => {
                warn!("fallo agregando unidad {}: {}", key.unit(), e);
                self.failed_units.push(key.unit().clone());
                Err(e)
            }
        }
    }

    /// Finaliza el artefacto: trailer, fsync, rotación y rename al destino.
    ///
    /// Idempotente. Nunca repite errores de `write`; sólo reporta (como
    /// `Storage`) lo que falle al finalizar, después de intentar todos los
    /// pasos.
    pub fn close(&mut self) -> AggResult<()> {
        match self.state {
            WriterState::Closed => return Ok(()),
            WriterState::Created => {
                self.state = WriterState::Closed;
                return Ok(());
            }
            WriterState::Initialized | WriterState::Writing => {}
        }
        self.state = WriterState::Closed;

        let Some(session) = self.session.take() else {
            return Ok(());
        };
        finish_session(self.format, session)
    }
}

impl Drop for AggregationWriter {
    fn drop(&mut self) {
        if self.session.is_some() {
            warn!("writer descartado sin close(), finalizando lo escrito");
            if let Err(e) = self.close() {
                warn!("error finalizando writer descartado: {}", e);
            }
        }
    }
}

/// Inicializa, ejecuta `body` y cierra siempre, también si `body` falla.
/// Si fallan los dos se devuelve el error de `body` y el de close queda en
/// el log.
pub fn with_session<T, F>(
    writer: &mut AggregationWriter,
    ctx: AggregationContext,
    body: F,
) -> AggResult<T>
where
    F: FnOnce(&mut AggregationWriter) -> AggResult<T>,
{
    writer.initialize(ctx)?;
    let result = body(writer);
    let closed = writer.close();

    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            warn!("close también falló después de un error: {}", close_err);
            Err(e)
        }
    }
}

/* ---------------- helpers ---------------- */

fn storage(path: &Path, source: io::Error) -> AggError {
    AggError::Storage {
        path: path.to_path_buf(),
        source,
    }
}

fn encode_value(
    format: LogFormat,
    app: &ApplicationId,
    key: &LogKey,
    value: &LogValue,
) -> AggResult<Vec<u8>> {
    if key.unit() != &value.unit {
        return Err(AggError::record(
            key.unit(),
            format!("la clave no coincide con el valor ({})", value.unit),
        ));
    }
    let record = value.to_record(app)?;
    format
        .encode_record(&record)
        .map_err(|e| AggError::record(key.unit(), e.to_string()))
}

#[cfg(unix)]
fn set_artifact_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(ARTIFACT_MODE))
}

#[cfg(not(unix))]
fn set_artifact_mode(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Dueño de un artefacto existente, si se puede leer.
fn existing_owner(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    match codec::decode_artifact(path, &bytes) {
        Ok(artifact) => Some(artifact.header.owner),
        Err(e) => {
            warn!("no se pudo leer la cabecera de {}: {}", path.display(), e);
            None
        }
    }
}

/// Revisa qué hacer con un artefacto previo en el destino.
fn check_destination(ctx: &AggregationContext) -> AggResult<()> {
    let dest = ctx.destination();
    if !dest.exists() {
        return Ok(());
    }

    if !ctx.overwrite() && ctx.retention() == 0 {
        return Err(storage(
            dest,
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                "el artefacto ya existe (sin overwrite ni retención)",
            ),
        ));
    }

    if ctx.overwrite() {
        if let Some(owner) = existing_owner(dest) {
            if owner != ctx.identity().user {
                return Err(AggError::Permission {
                    path: dest.to_path_buf(),
                    reason: format!(
                        "el artefacto pertenece a {owner}, no a {}",
                        ctx.identity()
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Libera el destino: lo reemplaza (overwrite) o rota las copias
/// anteriores conservando `retention`.
fn make_room(ctx: &AggregationContext) -> io::Result<()> {
    let dest = ctx.destination();
    if !dest.exists() {
        return Ok(());
    }

    if ctx.overwrite() || ctx.retention() == 0 {
        return fs::remove_file(dest);
    }

    let retention = ctx.retention();
    remove_if_exists(&layout::rotated_path(dest, retention))?;
    for n in (1..retention).rev() {
        let from = layout::rotated_path(dest, n);
        if from.exists() {
            fs::rename(&from, layout::rotated_path(dest, n + 1))?;
        }
    }
    fs::rename(dest, layout::rotated_path(dest, 1))
}

fn open_session(format: LogFormat, ctx: AggregationContext) -> AggResult<Session> {
    let dest = ctx.destination().to_path_buf();
    let tmp = ctx.finalize_at().to_path_buf();

    for dir in [dest.parent(), tmp.parent()].into_iter().flatten() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).map_err(|e| AggError::io(dir, e))?;
        }
    }

    let session_id = Uuid::new_v4();
    let lock = ArtifactLock::acquire(
        &dest,
        &LockMeta {
            session_id,
            host: local_host(),
            pid: std::process::id(),
            user: ctx.identity().user.clone(),
            started_at: Utc::now(),
        },
    )?;

    check_destination(&ctx)?;

    if ctx.finalizes_in_place() {
        // se escribe directo sobre el destino: hay que liberarlo ya
        make_room(&ctx).map_err(|e| AggError::io(&dest, e))?;
    } else if tmp.exists() {
        warn!(
            "borrando temporal abandonado {} (sesión anterior sin cerrar)",
            tmp.display()
        );
        fs::remove_file(&tmp).map_err(|e| AggError::io(&tmp, e))?;
    }

    let file = OpenOptions::new()
        .append(true)
        .create_new(true)
        .open(&tmp)
        .map_err(|e| AggError::io(&tmp, e))?;

    let mut session = Session {
        ctx,
        session_id,
        file,
        lock,
        end: 0,
        records: 0,
    };

    let prepared = set_artifact_mode(&tmp)
        .map_err(|e| AggError::io(&tmp, e))
        .and_then(|_| {
            let header = ArtifactHeader::for_session(&session.ctx, session_id);
            format
                .encode_header(&header)
                .map_err(|e| storage(&tmp, io::Error::new(io::ErrorKind::InvalidData, e)))
        })
        .and_then(|bytes| session.append(&bytes).map_err(|e| AggError::io(&tmp, e)));

    if let Err(e) = prepared {
        // sin artefacto a medias: el lock se suelta al soltar la sesión
        drop(session);
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(session)
}

fn finish_session(format: LogFormat, mut session: Session) -> AggResult<()> {
    let tmp = session.ctx.finalize_at().to_path_buf();
    let dest = session.ctx.destination().to_path_buf();
    let mut first_error: Option<AggError> = None;
    let mut note = |e: AggError| {
        warn!("error al finalizar {}: {}", dest.display(), e);
        if first_error.is_none() {
            first_error = Some(e);
        }
    };

    let trailer = ArtifactTrailer {
        records: session.records,
        finished_at: Utc::now(),
    };
    match format.encode_trailer(&trailer) {
        Ok(bytes) => {
            if let Err(e) = session.append(&bytes) {
                note(storage(&tmp, e));
            }
        }
        Err(e) => note(storage(&tmp, io::Error::new(io::ErrorKind::InvalidData, e))),
    }

    if let Err(e) = session.file.sync_all() {
        note(storage(&tmp, e));
    }

    let Session {
        ctx,
        session_id,
        file,
        lock,
        records,
        ..
    } = session;
    drop(file);

    if !ctx.finalizes_in_place() {
        let moved = make_room(&ctx).and_then(|_| fs::rename(&tmp, &dest));
        if let Err(e) = moved {
            note(storage(&dest, e));
        }
    }

    if let Err(e) = lock.release() {
        note(storage(&layout::lock_path(&dest), e));
    }

    match first_error {
        None => {
            info!(
                "sesión {} cerrada: {} registros en {}",
                session_id,
                records,
                dest.display()
            );
            Ok(())
        }
        Some(e) => Err(e),
    }
}
