//! Control-flow graph, dominators and the SSA verifier.
//!
//! Node `i` of the petgraph graph is always block `i` of the function,
//! so block ids convert to node indices without a lookup table.

use petgraph::algo::dominators::{self, Dominators};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::DfsPostOrder;
use petgraph::Direction;

use super::display::annotate;
use super::*;
use crate::diagnostic::Diagnostic;

pub struct Cfg {
    graph: DiGraph<BlockId, ()>,
    entry: NodeIndex,
    dominators: Dominators<NodeIndex>,
}

fn node(b: BlockId) -> NodeIndex {
    NodeIndex::new(b.index())
}

fn block_of(n: NodeIndex) -> BlockId {
    BlockId(n.index() as u32)
}

impl Cfg {
    pub fn new(func: &Function) -> Self {
        let mut graph = DiGraph::with_capacity(func.blocks.len(), func.blocks.len() * 2);
        for b in func.block_ids() {
            graph.add_node(b);
        }
        for b in func.block_ids() {
            for succ in func.successors(b) {
                graph.add_edge(node(b), node(succ), ());
            }
        }
        let entry = node(func.entry);
        let dominators = dominators::simple_fast(&graph, entry);
        Self {
            graph,
            entry,
            dominators,
        }
    }

    pub fn predecessors(&self, b: BlockId) -> Vec<BlockId> {
        let mut preds: Vec<BlockId> = self
            .graph
            .neighbors_directed(node(b), Direction::Incoming)
            .map(block_of)
            .collect();
        preds.sort();
        preds.dedup();
        preds
    }

    pub fn successors(&self, b: BlockId) -> Vec<BlockId> {
        let mut succs: Vec<BlockId> = self.graph.neighbors(node(b)).map(block_of).collect();
        succs.sort();
        succs.dedup();
        succs
    }

    pub fn is_reachable(&self, b: BlockId) -> bool {
        node(b) == self.entry || self.dominators.immediate_dominator(node(b)).is_some()
    }

    /// Whether `a` dominates `b` (reflexive). Unreachable blocks are
    /// dominated by nothing.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        match self.dominators.dominators(node(b)) {
            Some(mut doms) => doms.any(|d| d == node(a)),
            None => false,
        }
    }

    pub fn immediate_dominator(&self, b: BlockId) -> Option<BlockId> {
        self.dominators.immediate_dominator(node(b)).map(block_of)
    }

    /// Whether a path (possibly empty) leads from `from` to `to`.
    pub fn reaches(&self, from: BlockId, to: BlockId) -> bool {
        petgraph::algo::has_path_connecting(&self.graph, node(from), node(to), None)
    }

    /// Reachable blocks in reverse postorder from the entry.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut dfs = DfsPostOrder::new(&self.graph, self.entry);
        let mut order = Vec::new();
        while let Some(n) = dfs.next(&self.graph) {
            order.push(block_of(n));
        }
        order.reverse();
        order
    }
}

// ─── Verifier ─────────────────────────────────────────────────────

/// Check the structural and SSA invariants of a function:
/// one terminator per block (last), phis grouped at block start and
/// matching the predecessors, every operand defined exactly once, and
/// every definition dominating its uses.
pub fn verify_function(func: &Function) -> Result<(), Diagnostic> {
    let fail = |msg: String, b: BlockId, i: usize| {
        Err(annotate(
            Diagnostic::internal(format!("IR verification failed in `{}`: {}", func.name, msg)),
            func,
            b,
            i,
        ))
    };

    if func.entry.index() >= func.blocks.len() {
        return Err(Diagnostic::internal(format!(
            "IR verification failed in `{}`: entry {} does not exist",
            func.name, func.entry
        )));
    }

    let mut defs: Vec<Option<(BlockId, usize)>> = vec![None; func.num_values()];
    for (b, i, inst) in func.insts() {
        if let Some(r) = inst.result {
            if r.index() >= defs.len() {
                return fail(format!("{} has no type", r), b, i);
            }
            if defs[r.index()].is_some() {
                return fail(format!("{} is defined more than once", r), b, i);
            }
            defs[r.index()] = Some((b, i));
        }
    }

    for b in func.block_ids() {
        let insts = &func.block(b).insts;
        let Some(last) = insts.last() else {
            return Err(Diagnostic::internal(format!(
                "IR verification failed in `{}`: block {} is empty",
                func.name, b
            )));
        };
        if !last.is_terminator() {
            return fail(format!("block {} does not end in a terminator", b), b, insts.len() - 1);
        }
        let mut seen_non_phi = false;
        for (i, inst) in insts.iter().enumerate() {
            if inst.is_terminator() && i + 1 != insts.len() {
                return fail(format!("terminator in the middle of {}", b), b, i);
            }
            if inst.is_phi() {
                if seen_non_phi {
                    return fail(format!("phi after non-phi in {}", b), b, i);
                }
            } else {
                seen_non_phi = true;
            }
            for succ in inst.successors() {
                if succ.index() >= func.blocks.len() {
                    return fail(format!("branch to missing block {}", succ), b, i);
                }
            }
        }
    }

    let cfg = Cfg::new(func);
    for (b, i, inst) in func.insts() {
        if !cfg.is_reachable(b) {
            continue;
        }
        if let InstKind::Phi { incoming } = &inst.kind {
            let preds: Vec<BlockId> = cfg
                .predecessors(b)
                .into_iter()
                .filter(|&p| cfg.is_reachable(p))
                .collect();
            for &p in &preds {
                if incoming.iter().filter(|(_, from)| *from == p).count() != 1 {
                    return fail(format!("phi needs exactly one entry for {}", p), b, i);
                }
            }
            for &(v, from) in incoming {
                if !preds.contains(&from) && cfg.is_reachable(from) {
                    return fail(format!("phi entry for {} which is not a predecessor", from), b, i);
                }
                let Some(&Some((def_b, _))) = defs.get(v.index()) else {
                    return fail(format!("{} is used but never defined", v), b, i);
                };
                if cfg.is_reachable(from) && !cfg.dominates(def_b, from) {
                    return fail(format!("{} does not dominate the edge from {}", v, from), b, i);
                }
            }
            continue;
        }
        for v in inst.operands() {
            let Some(&Some((def_b, def_i))) = defs.get(v.index()) else {
                return fail(format!("{} is used but never defined", v), b, i);
            };
            let dominated = if def_b == b {
                def_i < i
            } else {
                cfg.dominates(def_b, b)
            };
            if !dominated {
                return fail(format!("{} does not dominate this use", v), b, i);
            }
        }
    }
    Ok(())
}
