//! Query compilation and execution
//!
//! This module contains the planner, the heuristic optimizer and the
//! pull-based operators that run a plan against one storage snapshot.

pub mod aggregate;
pub mod context;
pub mod cursor;
pub mod expr;
pub mod operators;
pub mod optimizer;
pub mod plan;
pub mod planner;
pub mod sort;

use std::sync::Arc;

use tracing::debug;

pub use context::{ExecContext, ExecOptions};
pub use cursor::Cursor;
pub use expr::PhysicalExpr;
pub use optimizer::HeuristicOptimizer;
pub use plan::{KeyRange, OutputColumn, Plan, PlanNode};
pub use planner::Planner;

use crate::catalog::{DatasetDef, GenerationLease};
use crate::dsl::Query;
use crate::error::{Error, Result};
use crate::storage::{Snapshot, StorageEngine, Value};
use operators::ScanSource;

/// Resolve and optimize a parsed query against one dataset generation
pub fn compile(def: &DatasetDef, query: &Query) -> Result<Plan> {
    let plan = Planner::new(def).plan(query)?;
    HeuristicOptimizer::new(def).optimize(plan)
}

/// Start running a plan.
///
/// The scan reads `snapshot`, followed by `overlay`, the querying session's
/// unflushed rows. Both must come from one `BatchBuilder::read_view` so no
/// row is seen twice. The returned cursor keeps `lease` until it is closed.
pub fn execute(
    plan: &Plan,
    lease: GenerationLease,
    storage: &Arc<StorageEngine>,
    snapshot: Snapshot,
    overlay: Vec<Vec<Value>>,
    ctx: ExecContext,
) -> Result<Cursor> {
    if lease.generation() != plan.generation {
        return Err(Error::Internal(format!(
            "plan compiled for generation {} run against generation {}",
            plan.generation,
            lease.generation()
        )));
    }
    debug!(
        dataset = %plan.dataset,
        generation = plan.generation,
        snapshot = snapshot.seq(),
        overlay = overlay.len(),
        "executing plan"
    );
    let mut source = ScanSource {
        storage,
        snapshot: &snapshot,
        overlay,
        batch_rows: ctx.options().batch_rows,
    };
    let root = operators::build(&plan.root, &mut source)?;
    Ok(Cursor::new(root, ctx, plan.output_schema(), lease))
}
