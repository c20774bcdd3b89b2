use hashbrown::HashMap;
use skein_model::KindSpec;

use crate::error::DagError;
use crate::transform::TransformerRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DagNode {
    Source,
    Kind(String),
    Transformer(String),
    Destination(String),
}

impl DagNode {
    fn label(&self) -> String {
        match self {
            Self::Source => "source".to_string(),
            Self::Kind(kind) => format!("kind:{kind}"),
            Self::Transformer(name) => format!("transformer:{name}"),
            Self::Destination(name) => format!("destination:{name}"),
        }
    }
}

/// The per-connection routing graph: source -> entity kinds -> transformer
/// chain -> destination. Built once at job start and validated before the
/// first entity is pulled.
#[derive(Debug, Clone)]
pub struct SyncDag {
    nodes: Vec<DagNode>,
    out: Vec<Vec<usize>>,
    kind_entry: HashMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct DagBuilder {
    nodes: Vec<DagNode>,
    edges: Vec<(usize, usize)>,
}

impl DagBuilder {
    pub fn node(&mut self, node: DagNode) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn edge(&mut self, from: usize, to: usize) -> &mut Self {
        self.edges.push((from, to));
        self
    }

    pub fn build(self) -> Result<SyncDag, DagError> {
        let mut out = vec![Vec::new(); self.nodes.len()];
        for (from, to) in self.edges {
            if from >= self.nodes.len() {
                return Err(DagError::UnknownNode(from));
            }
            if to >= self.nodes.len() {
                return Err(DagError::UnknownNode(to));
            }
            out[from].push(to);
        }

        let mut kind_entry = HashMap::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            if let DagNode::Kind(kind) = node {
                kind_entry.insert(kind.clone(), idx);
            }
        }

        let dag = SyncDag {
            nodes: self.nodes,
            out,
            kind_entry,
        };
        dag.validate()?;
        Ok(dag)
    }
}

impl SyncDag {
    pub fn builder() -> DagBuilder {
        DagBuilder::default()
    }

    /// The default per-connection graph: each emitted kind runs through the
    /// chunker (parent kinds only), then dense and sparse embedding, then
    /// the destination. One transformer node per chain keeps the
    /// one-outgoing-edge invariant intact.
    pub fn default_for(
        kind_specs: &[KindSpec],
        chunker: &'static str,
        dense_embed: &'static str,
        sparse_embed: Option<&'static str>,
        destination: &str,
    ) -> Result<Self, DagError> {
        let mut builder = Self::builder();
        let source = builder.node(DagNode::Source);
        let dest = builder.node(DagNode::Destination(destination.to_string()));

        for spec in kind_specs {
            let kind = builder.node(DagNode::Kind(spec.kind.clone()));
            builder.edge(source, kind);

            let mut tail = kind;
            if spec.produces_children {
                let chunk = builder.node(DagNode::Transformer(chunker.to_string()));
                builder.edge(tail, chunk);
                tail = chunk;
            }
            let dense = builder.node(DagNode::Transformer(dense_embed.to_string()));
            builder.edge(tail, dense);
            tail = dense;
            if let Some(sparse) = sparse_embed {
                let sparse = builder.node(DagNode::Transformer(sparse.to_string()));
                builder.edge(tail, sparse);
                tail = sparse;
            }
            builder.edge(tail, dest);
        }

        builder.build()
    }

    pub fn node(&self, idx: usize) -> &DagNode {
        &self.nodes[idx]
    }

    /// Entry node for an entity kind, if the graph routes it at all.
    pub fn entry(&self, kind: &str) -> Option<usize> {
        self.kind_entry.get(kind).copied()
    }

    /// The single successor of a kind or transformer node. Validation
    /// guarantees exactly one exists.
    pub fn next(&self, idx: usize) -> usize {
        self.out[idx][0]
    }

    pub fn destination_names(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                DagNode::Destination(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    fn validate(&self) -> Result<(), DagError> {
        if !self
            .nodes
            .iter()
            .any(|node| matches!(node, DagNode::Destination(_)))
        {
            return Err(DagError::NoDestination);
        }

        for (idx, node) in self.nodes.iter().enumerate() {
            let count = self.out[idx].len();
            match node {
                DagNode::Kind(kind) if count != 1 => {
                    return Err(DagError::KindFanOut {
                        kind: kind.clone(),
                        count,
                    });
                }
                DagNode::Transformer(name) if count != 1 => {
                    return Err(DagError::TransformerFanOut {
                        name: name.clone(),
                        count,
                    });
                }
                _ => {}
            }
        }

        // Every chain must reach a destination without revisiting a node.
        for (idx, node) in self.nodes.iter().enumerate() {
            let DagNode::Kind(kind) = node else { continue };
            let mut visited = vec![false; self.nodes.len()];
            let mut current = idx;
            loop {
                if visited[current] {
                    return Err(DagError::Cycle {
                        kind: kind.clone(),
                        node: self.nodes[current].label(),
                    });
                }
                visited[current] = true;
                match &self.nodes[current] {
                    DagNode::Destination(_) => break,
                    DagNode::Source => {
                        return Err(DagError::NoTerminalDestination { kind: kind.clone() });
                    }
                    _ => {
                        if self.out[current].is_empty() {
                            return Err(DagError::NoTerminalDestination { kind: kind.clone() });
                        }
                        current = self.out[current][0];
                    }
                }
            }
        }

        Ok(())
    }

    /// Second validation pass once the registries exist: every transformer
    /// node must be registered and every destination node configured.
    pub fn validate_registered(
        &self,
        transformers: &TransformerRegistry,
        destination_names: &[&str],
    ) -> Result<(), DagError> {
        for node in &self.nodes {
            match node {
                DagNode::Transformer(name) if !transformers.contains(name) => {
                    return Err(DagError::UnknownTransformer(name.clone()));
                }
                DagNode::Destination(name) if !destination_names.contains(&name.as_str()) => {
                    return Err(DagError::UnknownDestination(name.clone()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
