//! Flush operation ordering for keystone sessions.
//!
//! This module decides the order statements are sent in:
//! - INSERT parent-first, following dependency edges between pending inserts
//! - UPDATE deferred foreign keys that closed a cycle
//! - UPDATE in creation order
//! - DELETE child-first
//!
//! Ties always break by creation order so a flush is deterministic.
//!
//! # Cycles
//!
//! Pending inserts can reference each other in a cycle. Each strongly
//! connected component of the insert graph may be split by leaving exactly
//! one *nullable* foreign key unset on insert and patching it afterwards.
//! When no single nullable edge breaks the component, ordering fails with
//! [`Error::CyclicDependency`] naming the cycle.

use crate::identity_map::InstanceId;
use keystone_core::{CycleError, Error, Result};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// A pending instance taking part in ordering.
#[derive(Debug, Clone)]
pub struct FlushNode {
    pub id: InstanceId,
    /// Creation order; smaller goes first when nothing else decides.
    pub seq: u64,
    /// Label used when reporting a cycle.
    pub label: String,
}

/// `dependent` holds a foreign key to `depends_on` through `attribute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub dependent: InstanceId,
    pub depends_on: InstanceId,
    pub attribute: &'static str,
    /// Whether the foreign key may be left NULL.
    pub nullable: bool,
}

/// Insert order plus the edges left unset on insert.
#[derive(Debug, Clone, Default)]
pub struct InsertOrder {
    pub order: Vec<InstanceId>,
    pub deferred: Vec<DependencyEdge>,
}

/// One statement of a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOp {
    /// INSERT the instance, leaving deferred foreign keys NULL.
    Insert(InstanceId),
    /// UPDATE a deferred foreign key once both sides have keys.
    Link(DependencyEdge),
    /// Guarded UPDATE of dirty attributes.
    Update(InstanceId),
    /// Guarded DELETE.
    Delete(InstanceId),
}

/// Ordered statements for one flush.
#[derive(Debug, Clone, Default)]
pub struct FlushPlan {
    pub ops: Vec<PendingOp>,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Number of ops of each kind: (inserts, links, updates, deletes).
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        self.ops.iter().fold((0, 0, 0, 0), |(i, l, u, d), op| match op {
            PendingOp::Insert(_) => (i + 1, l, u, d),
            PendingOp::Link(_) => (i, l + 1, u, d),
            PendingOp::Update(_) => (i, l, u + 1, d),
            PendingOp::Delete(_) => (i, l, u, d + 1),
        })
    }
}

/// Computes safe statement order from instance dependencies.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlushOrderer;

/// Edge between positions in the node slice: (from, to, edge index).
type Arrow = (usize, usize, usize);

impl FlushOrderer {
    pub fn new() -> Self {
        Self
    }

    /// Full statement plan for one flush.
    #[allow(clippy::result_large_err)]
    pub fn plan(
        &self,
        inserts: &[FlushNode],
        insert_edges: &[DependencyEdge],
        updates: &[FlushNode],
        deletes: &[FlushNode],
        delete_edges: &[DependencyEdge],
    ) -> Result<FlushPlan> {
        let InsertOrder { order, deferred } = self.order(inserts, insert_edges)?;

        let mut updates: Vec<&FlushNode> = updates.iter().collect();
        updates.sort_by_key(|n| n.seq);

        let mut ops = Vec::with_capacity(order.len() + deferred.len() + updates.len() + deletes.len());
        ops.extend(order.into_iter().map(PendingOp::Insert));
        ops.extend(deferred.into_iter().map(PendingOp::Link));
        ops.extend(updates.into_iter().map(|n| PendingOp::Update(n.id)));
        ops.extend(
            self.order_deletes(deletes, delete_edges)
                .into_iter()
                .map(PendingOp::Delete),
        );
        tracing::debug!(ops = ops.len(), "flush plan computed");
        Ok(FlushPlan { ops })
    }

    /// Topologically order pending inserts, parents first.
    ///
    /// Edges whose `depends_on` is not among `nodes` are ignored: that target
    /// already has its key.
    #[allow(clippy::result_large_err)]
    pub fn order(&self, nodes: &[FlushNode], edges: &[DependencyEdge]) -> Result<InsertOrder> {
        let arcs = internal_arcs(nodes, edges, |e| (e.depends_on, e.dependent));
        let mut active = vec![true; edges.len()];
        let mut deferred = Vec::new();

        for component in strongly_connected(nodes.len(), &arcs) {
            let members: HashSet<usize> = component.iter().copied().collect();
            let inner: Vec<Arrow> = arcs
                .iter()
                .filter(|(from, to, _)| members.contains(from) && members.contains(to))
                .copied()
                .collect();
            if inner.is_empty() {
                continue;
            }

            let mut candidates: Vec<Arrow> = inner
                .iter()
                .filter(|(_, _, e)| edges[*e].nullable)
                .copied()
                .collect();
            candidates.sort_by_key(|(_, to, e)| (nodes[*to].seq, edges[*e].attribute));

            let chosen = candidates
                .into_iter()
                .find(|(_, _, e)| is_acyclic(&inner, *e));
            match chosen {
                Some((_, to, e)) => {
                    active[e] = false;
                    tracing::debug!(
                        dependent = nodes[to].label.as_str(),
                        attribute = edges[e].attribute,
                        "deferring foreign key to break insert cycle"
                    );
                    deferred.push(edges[e].clone());
                }
                None => return Err(cycle_error(nodes, &inner)),
            }
        }

        let active_arcs: Vec<Arrow> = arcs.into_iter().filter(|(_, _, e)| active[*e]).collect();
        let (order, leftover) = kahn(nodes, &active_arcs);
        if !leftover.is_empty() {
            let path = leftover.iter().map(|&i| nodes[i].label.clone()).collect();
            return Err(Error::CyclicDependency(CycleError { path }));
        }
        Ok(InsertOrder {
            order: order.into_iter().map(|i| nodes[i].id).collect(),
            deferred,
        })
    }

    /// Order pending deletes so referencing instances go before their targets.
    ///
    /// Members of a reference cycle keep creation order among themselves.
    pub fn order_deletes(&self, nodes: &[FlushNode], edges: &[DependencyEdge]) -> Vec<InstanceId> {
        let arcs = internal_arcs(nodes, edges, |e| (e.dependent, e.depends_on));
        let (mut order, mut leftover) = kahn(nodes, &arcs);
        leftover.sort_by_key(|&i| nodes[i].seq);
        order.extend(leftover);
        order.into_iter().map(|i| nodes[i].id).collect()
    }
}

fn internal_arcs(
    nodes: &[FlushNode],
    edges: &[DependencyEdge],
    direction: impl Fn(&DependencyEdge) -> (InstanceId, InstanceId),
) -> Vec<Arrow> {
    let position: HashMap<InstanceId, usize> =
        nodes.iter().enumerate().map(|(i, n)| (n.id, i)).collect();
    edges
        .iter()
        .enumerate()
        .filter_map(|(e, edge)| {
            let (from, to) = direction(edge);
            Some((*position.get(&from)?, *position.get(&to)?, e))
        })
        .collect()
}

/// Kahn's algorithm with a min-heap on creation order.
/// Returns the ordered positions and the positions stuck on a cycle.
fn kahn(nodes: &[FlushNode], arcs: &[Arrow]) -> (Vec<usize>, Vec<usize>) {
    let mut indegree = vec![0usize; nodes.len()];
    let mut out: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for &(from, to, _) in arcs {
        out[from].push(to);
        indegree[to] += 1;
    }

    let mut ready: BinaryHeap<Reverse<(u64, usize)>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse((nodes[i].seq, i)))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse((_, i))) = ready.pop() {
        order.push(i);
        for &j in &out[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                ready.push(Reverse((nodes[j].seq, j)));
            }
        }
    }

    let leftover = (0..nodes.len()).filter(|i| indegree[*i] > 0).collect();
    (order, leftover)
}

/// Whether the component stays cyclic-free once `skip` is removed.
fn is_acyclic(arcs: &[Arrow], skip: usize) -> bool {
    let mut indegree: HashMap<usize, usize> = HashMap::new();
    let mut out: HashMap<usize, Vec<usize>> = HashMap::new();
    for &(from, to, e) in arcs {
        indegree.entry(from).or_default();
        if e == skip {
            indegree.entry(to).or_default();
            continue;
        }
        *indegree.entry(to).or_default() += 1;
        out.entry(from).or_default().push(to);
    }
    let mut ready: Vec<usize> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut seen = 0;
    while let Some(n) = ready.pop() {
        seen += 1;
        for &m in out.get(&n).map(Vec::as_slice).unwrap_or_default() {
            if let Some(d) = indegree.get_mut(&m) {
                *d -= 1;
                if *d == 0 {
                    ready.push(m);
                }
            }
        }
    }
    seen == indegree.len()
}

/// Name one cycle inside a strongly connected component, in
/// "A needs B needs ... needs A" order.
fn cycle_error(nodes: &[FlushNode], inner: &[Arrow]) -> Error {
    // Arcs run parent -> dependent; walk them backwards (dependent -> parent).
    let mut needs: HashMap<usize, Vec<usize>> = HashMap::new();
    for &(from, to, _) in inner {
        needs.entry(to).or_default().push(from);
    }
    for targets in needs.values_mut() {
        targets.sort_by_key(|&t| nodes[t].seq);
    }

    let start = needs
        .keys()
        .copied()
        .min_by_key(|&n| nodes[n].seq)
        .unwrap_or(0);
    let mut walk = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = needs.get(&current).and_then(|t| t.first()) else {
            break;
        };
        if let Some(pos) = walk.iter().position(|&n| n == next) {
            walk.drain(..pos);
            walk.push(next);
            break;
        }
        walk.push(next);
        current = next;
    }

    let path: Vec<String> = walk.iter().map(|&i| nodes[i].label.clone()).collect();
    tracing::warn!(cycle = %path.join(" -> "), "unbreakable dependency cycle");
    Error::CyclicDependency(CycleError { path })
}

/// Tarjan's strongly connected components over positions `0..n`.
fn strongly_connected(n: usize, arcs: &[Arrow]) -> Vec<Vec<usize>> {
    struct Tarjan<'a> {
        adj: &'a [Vec<usize>],
        index: Vec<Option<usize>>,
        low: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        next: usize,
        components: Vec<Vec<usize>>,
    }

    impl Tarjan<'_> {
        fn visit(&mut self, v: usize) {
            self.index[v] = Some(self.next);
            self.low[v] = self.next;
            self.next += 1;
            self.stack.push(v);
            self.on_stack[v] = true;

            for &w in &self.adj[v] {
                match self.index[w] {
                    None => {
                        self.visit(w);
                        self.low[v] = self.low[v].min(self.low[w]);
                    }
                    Some(wi) if self.on_stack[w] => {
                        self.low[v] = self.low[v].min(wi);
                    }
                    Some(_) => {}
                }
            }

            if Some(self.low[v]) == self.index[v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }

    let mut adj = vec![Vec::new(); n];
    for &(from, to, _) in arcs {
        adj[from].push(to);
    }
    let mut tarjan = Tarjan {
        adj: &adj,
        index: vec![None; n],
        low: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        next: 0,
        components: Vec::new(),
    };
    for v in 0..n {
        if tarjan.index[v].is_none() {
            tarjan.visit(v);
        }
    }
    tarjan.components
}
