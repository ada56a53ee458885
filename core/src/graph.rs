// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builds graph views over the persisted access model: the full graph
//! (optionally filtered by layer), a server's local subgraph, a key's
//! subgraph, and simple-path enumeration between two servers.
//!
//! Plain `HashMap`/`HashSet`/`VecDeque` adjacency lists and BFS — there is
//! no graph crate in this stack, so traversal is hand-rolled the way the
//! rest of the core favors explicit data structures over a generic library.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use crate::error::Result;
use crate::models::{AccessPath, UnreachableSource};
use crate::persistence::PersistenceStore;

/// Maximum hop count a returned simple path may contain.
pub const MAX_PATH_LENGTH: usize = 10;
/// Maximum number of simple paths `find_paths` will return.
pub const MAX_PATHS_RETURNED: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerFilter {
    Authorization,
    Usage,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeId {
    Server(Uuid),
    UnreachableSource(Uuid),
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: NodeId,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub source: NodeId,
    pub target: NodeId,
    pub ssh_key_id: Option<Uuid>,
    pub username: String,
    pub is_authorized: bool,
    pub is_used: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

fn edge_survives_filter(path: &AccessPath, filter: LayerFilter) -> bool {
    match filter {
        LayerFilter::Authorization => path.is_authorized,
        LayerFilter::Usage => path.is_used,
        LayerFilter::All => true,
    }
}

pub struct GraphBuilder {
    store: std::sync::Arc<dyn PersistenceStore>,
}

impl GraphBuilder {
    pub fn new(store: std::sync::Arc<dyn PersistenceStore>) -> Self {
        GraphBuilder { store }
    }

    /// The full graph, restricted by `filter`, with `UnreachableSource`
    /// rows included as pseudo-nodes directed at their target.
    pub async fn full_graph(&self, filter: LayerFilter) -> Result<Graph> {
        let servers = self.store.list_servers(Default::default()).await?.items;
        let mut nodes: Vec<GraphNode> = servers
            .iter()
            .map(|s| GraphNode {
                id: NodeId::Server(s.id),
                label: s.host_port(),
            })
            .collect();

        let mut edges = Vec::new();
        for server in &servers {
            let paths = self.store.access_paths_for_target(server.id).await?;
            for path in paths.iter().filter(|p| edge_survives_filter(p, filter)) {
                if let Some(source_id) = path.source_server_id {
                    edges.push(to_edge(NodeId::Server(source_id), NodeId::Server(server.id), path));
                }
            }

            let unreachable = self.store.list_unreachable_sources(Default::default()).await?;
            for source in unreachable.items.iter().filter(|u| u.target_server_id == server.id) {
                edges.push(unreachable_edge(source, server.id));
            }
        }

        // Unreachable sources are pseudo-nodes; collect them once rather
        // than re-listing per server iteration above.
        let unreachable = self.store.list_unreachable_sources(Default::default()).await?;
        for source in &unreachable.items {
            nodes.push(GraphNode {
                id: NodeId::UnreachableSource(source.id),
                label: source.reverse_dns.clone().unwrap_or_else(|| source.source_ip.clone()),
            });
        }

        Ok(Graph { nodes, edges })
    }

    /// BFS from `server_id` over `AccessPath` edges in both directions,
    /// depth-limited to `max_depth` hops.
    pub async fn server_subgraph(&self, server_id: Uuid, max_depth: u32) -> Result<Graph> {
        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut queue: VecDeque<(Uuid, u32)> = VecDeque::new();
        queue.push_back((server_id, 0));
        visited.insert(server_id);

        let mut nodes = Vec::new();
        let mut edges = Vec::new();

        while let Some((current, depth)) = queue.pop_front() {
            if let Some(server) = self.store.get_server(current).await? {
                nodes.push(GraphNode {
                    id: NodeId::Server(server.id),
                    label: server.host_port(),
                });
            }

            if depth >= max_depth {
                continue;
            }

            let paths = self.store.access_paths_involving_server(current).await?;
            for path in &paths {
                let other = other_end(path, current);
                edges.push(to_edge_from_path(path));
                if let Some(other_id) = other {
                    if visited.insert(other_id) {
                        queue.push_back((other_id, depth + 1));
                    }
                }
            }
        }

        Ok(Graph { nodes, edges })
    }

    /// All active `AccessPath`s for a single key, with their endpoint
    /// servers as nodes.
    pub async fn key_subgraph(&self, ssh_key_id: Uuid) -> Result<Graph> {
        let paths = self.store.access_paths_for_key(ssh_key_id).await?;
        let mut server_ids: HashSet<Uuid> = HashSet::new();
        for path in &paths {
            server_ids.insert(path.target_server_id);
            if let Some(src) = path.source_server_id {
                server_ids.insert(src);
            }
        }

        let mut nodes = Vec::new();
        for id in &server_ids {
            if let Some(server) = self.store.get_server(*id).await? {
                nodes.push(GraphNode {
                    id: NodeId::Server(server.id),
                    label: server.host_port(),
                });
            }
        }

        let edges = paths.iter().map(to_edge_from_path).collect();
        Ok(Graph { nodes, edges })
    }

    /// Enumerate simple paths from `src` to `dst` over the directed
    /// `AccessPath` graph, capped at `MAX_PATH_LENGTH` hops and
    /// `MAX_PATHS_RETURNED` results. Breadth-first so shorter paths are
    /// found (and the cap hit) before longer ones.
    pub async fn find_paths(&self, src: Uuid, dst: Uuid) -> Result<Vec<Vec<Uuid>>> {
        let adjacency = self.build_directed_adjacency().await?;

        let mut results = Vec::new();
        let mut queue: VecDeque<Vec<Uuid>> = VecDeque::new();
        queue.push_back(vec![src]);

        while let Some(path) = queue.pop_front() {
            if results.len() >= MAX_PATHS_RETURNED {
                break;
            }
            let Some(&last) = path.last() else {
                continue;
            };
            if last == dst && path.len() > 1 {
                results.push(path);
                continue;
            }
            if path.len() - 1 >= MAX_PATH_LENGTH {
                continue;
            }
            if let Some(next_hops) = adjacency.get(&last) {
                for &next in next_hops {
                    if !path.contains(&next) {
                        let mut extended = path.clone();
                        extended.push(next);
                        queue.push_back(extended);
                    }
                }
            }
        }

        Ok(results)
    }

    async fn build_directed_adjacency(&self) -> Result<HashMap<Uuid, Vec<Uuid>>> {
        let servers = self.store.list_servers(Default::default()).await?.items;
        let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for server in &servers {
            let paths = self.store.access_paths_for_target(server.id).await?;
            for path in paths {
                if let Some(src) = path.source_server_id {
                    adjacency.entry(src).or_default().push(server.id);
                }
            }
        }
        Ok(adjacency)
    }
}

fn to_edge(source: NodeId, target: NodeId, path: &AccessPath) -> GraphEdge {
    GraphEdge {
        source,
        target,
        ssh_key_id: path.ssh_key_id,
        username: path.username.clone(),
        is_authorized: path.is_authorized,
        is_used: path.is_used,
    }
}

fn to_edge_from_path(path: &AccessPath) -> GraphEdge {
    GraphEdge {
        source: path
            .source_server_id
            .map(NodeId::Server)
            .unwrap_or(NodeId::Server(path.target_server_id)),
        target: NodeId::Server(path.target_server_id),
        ssh_key_id: path.ssh_key_id,
        username: path.username.clone(),
        is_authorized: path.is_authorized,
        is_used: path.is_used,
    }
}

fn unreachable_edge(source: &UnreachableSource, target_server_id: Uuid) -> GraphEdge {
    GraphEdge {
        source: NodeId::UnreachableSource(source.id),
        target: NodeId::Server(target_server_id),
        ssh_key_id: source.ssh_key_id,
        username: source.username.clone().unwrap_or_default(),
        is_authorized: false,
        is_used: true,
    }
}

fn other_end(path: &AccessPath, current: Uuid) -> Option<Uuid> {
    if path.target_server_id == current {
        path.source_server_id
    } else {
        Some(path.target_server_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_filter_selects_expected_paths() {
        let authorized_only = AccessPath {
            id: Uuid::new_v4(),
            source_server_id: None,
            target_server_id: Uuid::new_v4(),
            ssh_key_id: None,
            username: "alice".into(),
            first_seen_at: chrono::Utc::now(),
            last_seen_at: chrono::Utc::now(),
            event_count: 0,
            is_active: true,
            is_authorized: true,
            is_used: false,
        };
        assert!(edge_survives_filter(&authorized_only, LayerFilter::Authorization));
        assert!(!edge_survives_filter(&authorized_only, LayerFilter::Usage));
        assert!(edge_survives_filter(&authorized_only, LayerFilter::All));
    }

    #[test]
    fn path_length_and_count_caps_match_spec() {
        assert_eq!(MAX_PATH_LENGTH, 10);
        assert_eq!(MAX_PATHS_RETURNED, 100);
    }
}
