use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::error::{AggError, AggResult};
use crate::ids::{ApplicationId, Identity, WorkerNodeId};
use crate::layout;

/// Capacidades de la ACL de una aplicación.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessType {
    /// Puede leer los logs agregados.
    View,
    Modify,
}

pub type AccessControl = BTreeMap<AccessType, String>;

/// Configuración inmutable de una sesión de agregación.
/// Sólo se construye validada (ver [`AggregationContextBuilder::build`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationContext {
    destination: PathBuf,
    finalize_at: PathBuf,
    overwrite: bool,
    retention: u32,
    application: ApplicationId,
    acls: AccessControl,
    node: WorkerNodeId,
    identity: Identity,
}

impl AggregationContext {
    pub fn builder(
        application: ApplicationId,
        node: WorkerNodeId,
        identity: Identity,
    ) -> AggregationContextBuilder {
        AggregationContextBuilder {
            destination: None,
            finalize_at: None,
            overwrite: false,
            retention: 0,
            application,
            acls: AccessControl::new(),
            node,
            identity,
        }
    }

    /// Contexto con destino = ruta del layout (se escribe en `{destino}.tmp`),
    /// sobrescritura activada y la ACL por defecto.
    pub fn for_layout(
        remote_root: &Path,
        application: ApplicationId,
        node: WorkerNodeId,
        identity: Identity,
    ) -> AggResult<Self> {
        let path = layout::layout(remote_root, &application, &node);
        Self::builder(application, node, identity)
            .destination(path)
            .overwrite(true)
            .build()
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Donde se escribe durante la sesión. Igual a `destination` cuando se
    /// finaliza en el lugar.
    pub fn finalize_at(&self) -> &Path {
        &self.finalize_at
    }

    pub fn finalizes_in_place(&self) -> bool {
        self.destination == self.finalize_at
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    /// Copias anteriores que se conservan cuando no se sobrescribe.
    pub fn retention(&self) -> u32 {
        self.retention
    }

    pub fn application(&self) -> &ApplicationId {
        &self.application
    }

    pub fn acls(&self) -> &AccessControl {
        &self.acls
    }

    pub fn node(&self) -> &WorkerNodeId {
        &self.node
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

#[derive(Debug, Clone)]
pub struct AggregationContextBuilder {
    destination: Option<PathBuf>,
    finalize_at: Option<PathBuf>,
    overwrite: bool,
    retention: i64,
    application: ApplicationId,
    acls: AccessControl,
    node: WorkerNodeId,
    identity: Identity,
}

impl AggregationContextBuilder {
    pub fn destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = Some(path.into());
        self
    }

    pub fn finalize_at(mut self, path: impl Into<PathBuf>) -> Self {
        self.finalize_at = Some(path.into());
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn retention(mut self, retention: i64) -> Self {
        self.retention = retention;
        self
    }

    pub fn acl(mut self, access: AccessType, principal: impl Into<String>) -> Self {
        self.acls.insert(access, principal.into());
        self
    }

    /// Valida y construye. No toca el filesystem.
    ///
    /// - `retention` negativo -> `InvalidConfig`
    /// - ninguna ruta -> `InvalidConfig`
    /// - ACL sin `View` -> `InvalidConfig` (si no se pasó ninguna ACL se usa
    ///   `View -> usuario actual`)
    pub fn build(self) -> AggResult<AggregationContext> {
        if self.retention < 0 {
            return Err(AggError::invalid_config(format!(
                "retention debe ser >= 0 (recibido {})",
                self.retention
            )));
        }
        let retention = u32::try_from(self.retention).map_err(|_| {
            AggError::invalid_config(format!("retention demasiado grande: {}", self.retention))
        })?;

        let (destination, finalize_at) = match (self.destination, self.finalize_at) {
            (None, None) => {
                return Err(AggError::invalid_config(
                    "hace falta destination o finalize_at",
                ))
            }
            (Some(dest), Some(tmp)) => (dest, tmp),
            (Some(dest), None) => {
                let tmp = layout::default_finalize_path(&dest);
                (dest, tmp)
            }
            (None, Some(tmp)) => (tmp.clone(), tmp),
        };

        let mut acls = self.acls;
        if acls.is_empty() {
            acls.insert(AccessType::View, self.identity.user.clone());
        }
        if !acls.contains_key(&AccessType::View) {
            return Err(AggError::invalid_config("la ACL debe incluir VIEW"));
        }

        Ok(AggregationContext {
            destination,
            finalize_at,
            overwrite: self.overwrite,
            retention,
            application: self.application,
            acls,
            node: self.node,
            identity: self.identity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> AggregationContextBuilder {
        AggregationContext::builder(
            ApplicationId::new(1, 1),
            WorkerNodeId::new("n1", 1).unwrap(),
            Identity::new("alice"),
        )
    }

    #[test]
    fn retention_negativa_es_invalida() {
        // ruta que no existe: si se tocara el filesystem fallaría distinto
        let err = builder()
            .destination("/definitivamente/no/existe/n1_1")
            .retention(-1)
            .build()
            .unwrap_err();
        assert!(matches!(err, AggError::InvalidConfig { .. }));
        assert!(!Path::new("/definitivamente").exists());
    }

    #[test]
    fn sin_rutas_es_invalido() {
        let err = builder().build().unwrap_err();
        assert!(matches!(err, AggError::InvalidConfig { .. }));
    }

    #[test]
    fn acl_sin_view_es_invalida() {
        let err = builder()
            .destination("/r/x")
            .acl(AccessType::Modify, "bob")
            .build()
            .unwrap_err();
        assert!(matches!(err, AggError::InvalidConfig { .. }));
    }

    #[test]
    fn acl_por_defecto_es_view_para_el_usuario() {
        let ctx = builder().destination("/r/x").build().unwrap();
        assert_eq!(ctx.acls().get(&AccessType::View).map(String::as_str), Some("alice"));
    }

    #[test]
    fn rutas_por_defecto() {
        let ctx = builder().destination("/r/x").build().unwrap();
        assert_eq!(ctx.finalize_at(), Path::new("/r/x.tmp"));
        assert!(!ctx.finalizes_in_place());

        let ctx = builder().finalize_at("/r/y").build().unwrap();
        assert_eq!(ctx.destination(), Path::new("/r/y"));
        assert!(ctx.finalizes_in_place());
    }

    #[test]
    fn for_layout_usa_la_ruta_del_layout() {
        let app = ApplicationId::new(9, 2);
        let node = WorkerNodeId::new("nm", 45454).unwrap();
        let ctx =
            AggregationContext::for_layout(Path::new("/remote"), app, node.clone(), Identity::new("u"))
                .unwrap();

        assert_eq!(ctx.destination(), layout::layout(Path::new("/remote"), &app, &node));
        assert!(ctx.overwrite());
        assert_eq!(ctx.node(), &node);
    }
}
