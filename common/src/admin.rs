use serde::{Deserialize, Serialize};

/// Pedido de refresco del mapeo usuario -> grupos.
///
/// Sin `sub_cluster_id` aplica al cluster local. Acá sólo vive el mensaje;
/// quien lo atiende está fuera de este workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshUserToGroupsMappingsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_cluster_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshTarget<'a> {
    Local,
    SubCluster(&'a str),
}

impl RefreshUserToGroupsMappingsRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_sub_cluster(sub_cluster_id: impl Into<String>) -> Self {
        Self {
            sub_cluster_id: Some(sub_cluster_id.into()),
        }
    }

    pub fn target(&self) -> RefreshTarget<'_> {
        match self.sub_cluster_id.as_deref() {
            Some(id) if !id.is_empty() => RefreshTarget::SubCluster(id),
            _ => RefreshTarget::Local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sin_sub_cluster_es_local() {
        let req = RefreshUserToGroupsMappingsRequest::new();
        assert_eq!(req.target(), RefreshTarget::Local);
        assert_eq!(serde_json::to_string(&req).unwrap(), "{}");
    }

    #[test]
    fn con_sub_cluster() {
        let req = RefreshUserToGroupsMappingsRequest::for_sub_cluster("SC-1");
        assert_eq!(req.target(), RefreshTarget::SubCluster("SC-1"));

        let json = serde_json::to_string(&req).unwrap();
        let back: RefreshUserToGroupsMappingsRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }
}
