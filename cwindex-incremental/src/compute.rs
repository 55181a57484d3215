//! Formula evaluation
//!
//! [`compute`] runs a formula once at a block. [`RangeComputer`] produces the
//! change list of a formula over a height range: it evaluates at the start,
//! jumps straight to the first later write under the recorded dependencies,
//! evaluates again, and so on, so the number of evaluations is bounded by the
//! number of relevant writes rather than the number of blocks.

use crate::dependency::{DependencySet, DependentKey};
use crate::env::{ComputeContext, Env};
use crate::formula::{Formula, FormulaError};
use crate::store::first_change;
use cwindex_types::Block;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of one evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct ComputationOutput {
    /// Latest block among the rows read; the requested block for dynamic formulas
    pub block: Option<Block>,
    pub value: Value,
    pub dependencies: Vec<DependentKey>,
}

pub fn compute(
    ctx: ComputeContext<'_>,
    formula: &dyn Formula,
    target: &str,
    args: &Value,
    block: Block,
) -> Result<ComputationOutput, FormulaError> {
    let mut env = Env::new(ctx, target, args, block, formula.dynamic());
    let value = formula.compute(&mut env)?;
    let (dependencies, block) = env.finish();
    Ok(ComputationOutput {
        block,
        value,
        dependencies,
    })
}

/// One entry of a change list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeOutput {
    /// Height of the evaluation that produced this value
    pub at: u64,
    pub block: Option<Block>,
    pub value: Value,
    pub dependencies: Vec<DependentKey>,
    pub latest_block_height_valid: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeComputation {
    pub outputs: Vec<RangeOutput>,
    pub evaluations: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RangeComputer<'a> {
    ctx: ComputeContext<'a>,
    max_evaluations: Option<usize>,
}

impl<'a> RangeComputer<'a> {
    pub fn new(ctx: ComputeContext<'a>) -> Self {
        RangeComputer {
            ctx,
            max_evaluations: None,
        }
    }

    /// Fail instead of evaluating more than `max` times.
    pub fn with_max_evaluations(mut self, max: usize) -> Self {
        self.max_evaluations = Some(max);
        self
    }

    /// Change list of `formula` over `[start.height, end]`.
    ///
    /// Consecutive evaluations with equal values are merged into one entry
    /// whose dependencies are the union of both. Each entry's
    /// `latest_block_height_valid` is one below the next evaluation height,
    /// or `end` for the last entry.
    pub fn compute(
        &self,
        formula: &dyn Formula,
        target: &str,
        args: &Value,
        start: Block,
        end: u64,
    ) -> Result<RangeComputation, FormulaError> {
        let mut outputs: Vec<RangeOutput> = Vec::new();
        let mut evaluations = 0;
        if start.height > end {
            return Ok(RangeComputation {
                outputs,
                evaluations,
            });
        }

        let mut cursor = start;
        loop {
            if let Some(max) = self.max_evaluations {
                if evaluations >= max {
                    return Err(FormulaError::EvaluationLimit(max));
                }
            }
            let output = compute(self.ctx, formula, target, args, cursor)?;
            evaluations += 1;

            let next = first_change(self.ctx.store, &output.dependencies, cursor.height + 1, end)?;

            let unchanged = outputs
                .last()
                .is_some_and(|last| last.value == output.value);
            if unchanged {
                if let Some(last) = outputs.last_mut() {
                    let mut merged: DependencySet = last.dependencies.drain(..).collect();
                    merged.extend(output.dependencies);
                    last.dependencies = merged.into_vec();
                }
            } else {
                let block = entry_block(outputs.last(), output.block, cursor);
                outputs.push(RangeOutput {
                    at: cursor.height,
                    block,
                    value: output.value,
                    dependencies: output.dependencies,
                    latest_block_height_valid: end,
                });
            }

            if let Some(last) = outputs.last_mut() {
                last.latest_block_height_valid = next.map_or(end, |b| b.height - 1);
            }
            match next {
                Some(block) => cursor = block,
                None => break,
            }
        }

        tracing::debug!(
            target_address = target,
            start = start.height,
            end,
            evaluations,
            entries = outputs.len(),
            "range computed"
        );

        Ok(RangeComputation {
            outputs,
            evaluations,
        })
    }
}

/// Entry blocks must increase along the change list. A new value whose
/// reads are all older than the previous entry's block took effect at the
/// evaluation height itself.
fn entry_block(previous: Option<&RangeOutput>, read: Option<Block>, cursor: Block) -> Option<Block> {
    let Some(previous) = previous else {
        return read;
    };
    match read {
        Some(block) if Some(block.height) > previous.block.map(|b| b.height) => Some(block),
        _ => Some(cursor),
    }
}
