//! Renault's parallel SCC decomposition.
//!
//! Workers run local Tarjan searches and publish every completed component
//! in a shared lock-free union-find. States of a dead component are skipped
//! by everyone, so the swarm splits the graph instead of each worker
//! covering all of it.

use crate::algorithm::tarjan::{ComponentSink, LocalTarjan};
use crate::algorithm::unionfind::RenaultUnionFind;
use crate::algorithm::{Algorithm, Shared, WorkerContext};
use crate::core::errors::Result;
use crate::stats::Counters;
use crate::store::Ref;
use tracing::debug;

impl ComponentSink for RenaultUnionFind {
    fn is_dead(&self, r: Ref) -> bool {
        RenaultUnionFind::is_dead(self, r)
    }

    fn claim(&self, r: Ref) -> bool {
        self.make_claim(r)
    }

    fn unite(&self, a: Ref, b: Ref) {
        self.union(a, b);
    }

    fn mark_dead(&self, root: Ref) -> bool {
        RenaultUnionFind::mark_dead(self, root)
    }
}

pub struct Renault {
    uf: RenaultUnionFind,
}

impl Algorithm for Renault {
    type Work = ();
    type Local = LocalTarjan;

    fn global_init(shared: &Shared<'_, Self::Work>) -> Result<Self> {
        Ok(Self {
            uf: RenaultUnionFind::new(shared.store.capacity()),
        })
    }

    fn local_init(&self, _ctx: &mut WorkerContext<'_, Self::Work>) -> Result<Self::Local> {
        Ok(LocalTarjan::new())
    }

    fn run(&self, ctx: &mut WorkerContext<'_, Self::Work>, local: &mut Self::Local) -> Result<()> {
        let (init, _) = ctx.initial()?;
        local.search(ctx, &self.uf, init)
    }

    fn print_stats(&self, total: &Counters) {
        debug!(
            sccs = total.sccs,
            self_loops = total.self_loops,
            explored = total.explored,
            "Renault done"
        );
    }
}
