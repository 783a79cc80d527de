//! Workgroup divergence analysis.
//!
//! A value is uniform when every invocation of a workgroup computes the
//! same value for it. Divergence originates at per-invocation hardware
//! registers, `ConvertToDivergent`, thread-varying built-ins and the
//! results of atomics, and flows forward through data dependences. A phi
//! is additionally divergent when the paths it joins may have been
//! selected by a divergent branch (sync dependence). That is approximated
//! conservatively: the phi's block is reachable from two different
//! successors of a divergent branch.

use super::cfg::Cfg;
use super::*;

pub struct Uniformity {
    divergent: Vec<bool>,
}

fn is_divergent_source(inst: &Inst) -> bool {
    match &inst.kind {
        InstKind::ReadHw(HwReg::ThreadIdInWave | HwReg::WaveIdInSubgroup) => true,
        InstKind::ConvertToDivergent { .. } => true,
        InstKind::AtomicRmw { .. } | InstKind::CmpXchg { .. } => true,
        InstKind::MeshTask(MeshTaskOp::ReadBuiltIn(b)) => b.is_thread_varying(),
        InstKind::MeshTask(
            MeshTaskOp::TaskPayloadAtomic { .. } | MeshTaskOp::TaskPayloadCmpXchg { .. },
        ) => true,
        _ => false,
    }
}

impl Uniformity {
    pub fn analyze(func: &Function) -> Self {
        let cfg = Cfg::new(func);
        let mut divergent = vec![false; func.num_values()];
        let mut divergent_branches: Vec<BlockId> = Vec::new();

        loop {
            let mut changed = false;

            for (b, _, inst) in func.insts() {
                if let InstKind::CondBr { cond, .. } = inst.kind {
                    if divergent[cond.index()] && !divergent_branches.contains(&b) {
                        divergent_branches.push(b);
                        changed = true;
                    }
                }

                let Some(r) = inst.result else { continue };
                if divergent[r.index()] {
                    continue;
                }
                let is_divergent = is_divergent_source(inst)
                    || inst.operands().iter().any(|v| divergent[v.index()])
                    || (inst.is_phi() && Self::sync_dependent(&cfg, b, &divergent_branches));
                if is_divergent {
                    divergent[r.index()] = true;
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }

        Self { divergent }
    }

    fn sync_dependent(cfg: &Cfg, join: BlockId, divergent_branches: &[BlockId]) -> bool {
        if cfg.predecessors(join).len() < 2 {
            return false;
        }
        divergent_branches.iter().any(|&d| {
            let succs = cfg.successors(d);
            succs.len() == 2 && succs.iter().all(|&s| cfg.reaches(s, join))
        })
    }

    pub fn is_uniform(&self, v: Value) -> bool {
        !self.is_divergent(v)
    }

    pub fn is_divergent(&self, v: Value) -> bool {
        self.divergent.get(v.index()).copied().unwrap_or(false)
    }
}
