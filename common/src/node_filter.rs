use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::ids::WorkerNodeId;

/// Recursos de un nodo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resource {
    pub memory_mb: u64,
    pub vcores: u32,
}

impl Resource {
    pub fn new(memory_mb: u64, vcores: u32) -> Self {
        Self { memory_mb, vcores }
    }

    /// `true` si cubre `other` en todas las dimensiones.
    pub fn fits(&self, other: &Resource) -> bool {
        self.memory_mb >= other.memory_mb && self.vcores >= other.vcores
    }
}

/// Lo que el scheduler sabe de un nodo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node: WorkerNodeId,
    pub capacity: Resource,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Criterio para quedarse con un subconjunto de los nodos del cluster.
/// Tiene que ser puro: sin estado y sin efectos.
pub trait NodeFilter {
    fn accept(&self, node: &NodeDescriptor) -> bool;
}

impl<F> NodeFilter for F
where
    F: Fn(&NodeDescriptor) -> bool,
{
    fn accept(&self, node: &NodeDescriptor) -> bool {
        self(node)
    }
}

/// Acepta nodos con al menos esta capacidad.
#[derive(Debug, Clone, Copy)]
pub struct MinCapacity(pub Resource);

impl NodeFilter for MinCapacity {
    fn accept(&self, node: &NodeDescriptor) -> bool {
        node.capacity.fits(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct HasLabel(pub String);

impl NodeFilter for HasLabel {
    fn accept(&self, node: &NodeDescriptor) -> bool {
        node.labels.contains(&self.0)
    }
}

/// Filtra conservando el orden relativo de entrada.
pub fn filter_nodes<'a, F>(nodes: &'a [NodeDescriptor], filter: &F) -> Vec<&'a NodeDescriptor>
where
    F: NodeFilter + ?Sized,
{
    nodes.iter().filter(|n| filter.accept(n)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(host: &str, vcores: u32) -> NodeDescriptor {
        NodeDescriptor {
            node: WorkerNodeId::new(host, 1).unwrap(),
            capacity: Resource::new(4096, vcores),
            labels: BTreeSet::new(),
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn capacidad_minima_conserva_el_orden() {
        let nodes = vec![node("a", 1), node("b", 5), node("c", 10)];
        let filter = MinCapacity(Resource::new(0, 5));

        let out: Vec<u32> = filter_nodes(&nodes, &filter)
            .iter()
            .map(|n| n.capacity.vcores)
            .collect();
        assert_eq!(out, vec![5, 10]);
    }

    #[test]
    fn closures_son_filtros() {
        let nodes = vec![node("c", 10), node("a", 1), node("b", 5)];
        let by_host = |n: &NodeDescriptor| n.node.host() != "a";

        let hosts: Vec<&str> = filter_nodes(&nodes, &by_host)
            .iter()
            .map(|n| n.node.host())
            .collect();
        assert_eq!(hosts, vec!["c", "b"]);
    }

    #[test]
    fn filtro_por_etiqueta() {
        let mut gpu = node("g", 8);
        gpu.labels.insert("gpu".to_string());
        let nodes = vec![node("a", 8), gpu];

        let out = filter_nodes(&nodes, &HasLabel("gpu".to_string()));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].node.host(), "g");
    }

    #[test]
    fn filtro_como_trait_object() {
        let nodes = vec![node("a", 1), node("b", 5)];
        let filters: Vec<Box<dyn NodeFilter>> = vec![
            Box::new(MinCapacity(Resource::new(0, 2))),
            Box::new(|_: &NodeDescriptor| false),
        ];
        assert_eq!(filter_nodes(&nodes, filters[0].as_ref()).len(), 1);
        assert!(filter_nodes(&nodes, filters[1].as_ref()).is_empty());
    }
}
