use crate::config::Config;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};

/// Node of the contact network, i.e. one agent of the community.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub age: Option<f64>,
}

/// Undirected edge of the contact network.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub contact_type: String,
    #[serde(default = "unit_weight")]
    pub weight: f64,
}

fn unit_weight() -> f64 {
    1.0
}

#[derive(Deserialize)]
struct NetworkFile {
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<Edge>,
}

/// Neighbour of an agent, as seen from that agent.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Contact {
    /// Index of the neighbouring agent.
    pub agent: usize,
    pub contact_type: String,
    pub weight: f64,
}

/// Static, weighted and undirected contact network.
///
/// Nodes are ordered by ID and every adjacency list is ordered by agent index,
/// which fixes the order in which random numbers are consumed.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ContactGraph {
    nodes: Vec<Node>,
    adjacency: Vec<Vec<Contact>>,
}

impl ContactGraph {
    /// Load a [`ContactGraph`] from a TOML file with `[[nodes]]` and `[[edges]]` tables.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let network: NetworkFile =
            toml::from_str(contents).context("failed to deserialize network")?;
        Self::new(network.nodes, network.edges)
    }

    pub fn new(mut nodes: Vec<Node>, edges: Vec<Edge>) -> Result<Self> {
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut index = BTreeMap::new();
        for (i_node, node) in nodes.iter().enumerate() {
            if index.insert(node.id.as_str(), i_node).is_some() {
                bail!("duplicate node {:?}", node.id);
            }
        }

        let mut adjacency: Vec<Vec<Contact>> = vec![Vec::new(); nodes.len()];
        for edge in &edges {
            let &a = index
                .get(edge.source.as_str())
                .with_context(|| format!("unknown source node {:?}", edge.source))?;
            let &b = index
                .get(edge.target.as_str())
                .with_context(|| format!("unknown target node {:?}", edge.target))?;
            if a == b {
                bail!("self loop at node {:?}", edge.source);
            }
            if !edge.weight.is_finite() || edge.weight < 0.0 {
                bail!(
                    "edge {:?} - {:?} has invalid weight {}",
                    edge.source,
                    edge.target,
                    edge.weight
                );
            }
            if adjacency[a].iter().any(|contact| contact.agent == b) {
                bail!("duplicate edge {:?} - {:?}", edge.source, edge.target);
            }

            adjacency[a].push(Contact {
                agent: b,
                contact_type: edge.contact_type.clone(),
                weight: edge.weight,
            });
            adjacency[b].push(Contact {
                agent: a,
                contact_type: edge.contact_type.clone(),
                weight: edge.weight,
            });
        }
        for contacts in &mut adjacency {
            contacts.sort_by_key(|contact| contact.agent);
        }

        Ok(Self { nodes, adjacency })
    }

    /// Check that every agent and contact type of the network is configured.
    pub fn validate_against(&self, cfg: &Config) -> Result<()> {
        for node in &self.nodes {
            cfg.type_config(&node.kind)
                .with_context(|| format!("invalid node {:?}", node.id))?;
        }
        for (i_node, contacts) in self.adjacency.iter().enumerate() {
            for contact in contacts {
                cfg.contact_weight(&contact.contact_type).with_context(|| {
                    format!("invalid edge at node {:?}", self.nodes[i_node].id)
                })?;
            }
        }
        Ok(())
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn contacts(&self, i_node: usize) -> &[Contact] {
        &self.adjacency[i_node]
    }
}

#[cfg(test)]
impl ContactGraph {
    pub fn edge(&self, a: usize, b: usize) -> Option<&Contact> {
        self.adjacency[a].iter().find(|contact| contact.agent == b)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.nodes
            .binary_search_by(|node| node.id.as_str().cmp(id))
            .ok()
    }
}
