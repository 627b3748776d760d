use std::{
    path::{Path, PathBuf},
    sync::atomic::Ordering,
};

use anyhow::{Context as _, Result};
use common::{
    config::fuzzer::{
        EXECUTOR_RETRY_LIMIT, MINIMIZATION_STEPS, OPERATOR_WEIGHTS, RANDOM_MUTATIONS,
        RULES_MUTATION_STEPS, SEED_TREE_COUNT, SEED_TREE_LEN,
    },
    exit::{EXIT, TERM},
    random::FastRand,
    FxHashSet,
};
use enum_index::IndexEnum;
use enum_index_derive::IndexEnum;
use grammar::{find_recursions, ChunkStore, Context, Mutator, Tree, TreeMutation, TreeView};
use rand_distr::{Distribution, WeightedAliasIndex};
use variant_count::VariantCount;

use crate::{
    executor::{ExecutionResult, Executor, ExitReason},
    queue::{write_file_0600, ProcessingStage, Queue, QueueItem},
    statistics::Statistics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IndexEnum, VariantCount)]
enum MutationOperator {
    Random,
    RandomRecursion,
    Splice,
}

#[derive(Debug, Clone)]
pub struct FuzzerOptions {
    pub seed: Option<u64>,
    /// weights for random, random-recursion and splice
    pub operator_weights: [usize; 3],
}

impl Default for FuzzerOptions {
    fn default() -> Self {
        Self {
            seed: None,
            operator_weights: OPERATOR_WEIGHTS,
        }
    }
}

/// single-threaded round driver: pop -> minimize -> mutate -> finished
pub struct Fuzzer<E: Executor> {
    executor: E,
    queue: Queue,
    mutator: Mutator,
    chunkstore: ChunkStore,
    ctx: Context,
    work_dir: PathBuf,
    distribution_operator: WeightedAliasIndex<usize>,
    statistics: Statistics,
}

impl<E: Executor> Fuzzer<E> {
    pub fn new(ctx: Context, executor: E, work_dir: PathBuf, options: FuzzerOptions) -> Result<Self> {
        let seed = options.seed.unwrap_or_else(|| fastrand::u64(..));
        fastrand::seed(seed);
        log::debug!("initial random seed = {:#x?}", seed);

        assert_eq!(
            options.operator_weights.len(),
            MutationOperator::VARIANT_COUNT
        );
        let distribution_operator = WeightedAliasIndex::new(options.operator_weights.to_vec())
            .context("Failed to create a weighted operator distribution.")?;

        let queue = Queue::new(&work_dir)?;
        common::fs::create_dir(&work_dir.join("crashes"))?;
        common::fs::create_dir(&work_dir.join("hangs"))?;
        log::info!("coverage map has {} bytes", executor.map_size());

        Ok(Self {
            executor,
            queue,
            mutator: Mutator::new(),
            chunkstore: ChunkStore::new(),
            ctx,
            work_dir,
            distribution_operator,
            statistics: Statistics::new(),
        })
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn run(&mut self) -> Result<()> {
        log::info!("Started fuzzing ...");

        while !EXIT.load(Ordering::Relaxed) {
            self.round()?;
        }

        // orderly shutdown: return survivors to the active bag, queue files
        // are written eagerly so nothing else needs flushing
        if !TERM.load(Ordering::Relaxed) {
            self.queue.new_round();
        }
        log::info!(
            "shutdown after {} executions, {} queue entries",
            self.statistics.executions(),
            self.queue.num_entries()
        );

        Ok(())
    }

    /// one scheduling round; grammar-only generation seeds an empty corpus
    pub fn round(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            self.queue.new_round();
        }
        if self.queue.is_empty() {
            return self.seed_corpus();
        }

        let mut item = self.queue.pop().expect("queue is non-empty");
        log::debug!("processing queue entry {} at {:?}", item.id, item.stage);

        self.process_item(&mut item)?;
        self.queue.finished(item)?;

        self.statistics.maybe_report(
            self.queue.num_entries(),
            self.queue.num_indexed_bits(),
            self.chunkstore.num_chunks(),
        );

        Ok(())
    }

    fn seed_corpus(&mut self) -> Result<()> {
        log::info!("corpus is empty, seeding from grammar ...");
        let Self {
            executor,
            queue,
            ctx,
            statistics,
            work_dir,
            ..
        } = self;

        let mut tree = Tree::default();
        for _ in 0..SEED_TREE_COUNT {
            if EXIT.load(Ordering::Relaxed) {
                break;
            }

            tree.generate_from_nt(ctx.start(), SEED_TREE_LEN, ctx);
            offer(executor, queue, statistics, ctx, work_dir, &tree)?;
        }

        Ok(())
    }

    // advance the item through its stages, bounded per round so long scans
    // interleave; an early stage completing within its budget falls through
    // to the next
    fn process_item(&mut self, item: &mut QueueItem) -> Result<()> {
        let Self {
            executor,
            queue,
            mutator,
            chunkstore,
            ctx,
            work_dir,
            distribution_operator,
            statistics,
        } = self;

        loop {
            if EXIT.load(Ordering::Relaxed) {
                return Ok(());
            }

            match item.stage {
                ProcessingStage::MinimizeSubtrees(start) => {
                    let end = start + MINIMIZATION_STEPS;
                    let mut tester = |view: &TreeMutation, bits: &FxHashSet<usize>, ctx: &Context| {
                        preserves_bits(executor, statistics, ctx, view, bits)
                    };

                    let done = mutator
                        .minimize_tree(&mut item.tree, &item.fresh_bits, ctx, start, end, &mut tester)
                        .context("subtree minimization")?;
                    item.stage = if done {
                        ProcessingStage::MinimizeRecursions(0)
                    } else {
                        ProcessingStage::MinimizeSubtrees(end)
                    };
                    if !done {
                        return Ok(());
                    }
                }
                ProcessingStage::MinimizeRecursions(start) => {
                    let end = start + MINIMIZATION_STEPS;
                    let mut tester = |view: &TreeMutation, bits: &FxHashSet<usize>, ctx: &Context| {
                        preserves_bits(executor, statistics, ctx, view, bits)
                    };

                    let done = mutator
                        .minimize_rec(&mut item.tree, &item.fresh_bits, ctx, start, end, &mut tester)
                        .context("recursive minimization")?;
                    item.stage = if done {
                        ProcessingStage::DetRules(0)
                    } else {
                        ProcessingStage::MinimizeRecursions(end)
                    };
                    if !done {
                        return Ok(());
                    }

                    // the minimized tree is a good splice donor
                    chunkstore.add_tree(item.tree.clone(), ctx);
                }
                ProcessingStage::DetRules(start) => {
                    let end = start + RULES_MUTATION_STEPS;
                    let mut tester = |view: &TreeMutation, ctx: &Context| {
                        offer(executor, queue, statistics, ctx, work_dir, view).map(|_| ())
                    };

                    let done = mutator
                        .mut_rules(&item.tree, ctx, start, end, &mut tester)
                        .context("rules mutation")?;
                    item.stage = if done {
                        ProcessingStage::Random
                    } else {
                        ProcessingStage::DetRules(end)
                    };
                    if !done {
                        return Ok(());
                    }
                }
                ProcessingStage::Random => {
                    let recursions = find_recursions(&item.tree, ctx);
                    let mut tester = |view: &TreeMutation, ctx: &Context| {
                        offer(executor, queue, statistics, ctx, work_dir, view).map(|_| ())
                    };

                    for _ in 0..RANDOM_MUTATIONS {
                        if EXIT.load(Ordering::Relaxed) {
                            return Ok(());
                        }

                        let operator = MutationOperator::index_enum(
                            distribution_operator.sample(&mut FastRand),
                        )
                        .expect("operator index is valid");
                        match operator {
                            MutationOperator::Random => {
                                mutator.mut_random(&item.tree, ctx, &mut tester)?
                            }
                            MutationOperator::RandomRecursion => mutator.mut_random_recursion(
                                &item.tree,
                                &recursions,
                                ctx,
                                &mut tester,
                            )?,
                            MutationOperator::Splice => {
                                mutator.mut_splice(&item.tree, ctx, chunkstore, &mut tester)?
                            }
                        }
                    }

                    return Ok(());
                }
            }
        }
    }

    /// execute raw bytes once, without offering the outcome to the queue
    pub fn execute_bytes(&mut self, data: &[u8]) -> Result<ExecutionResult> {
        execute(&mut self.executor, &mut self.statistics, data)
    }

    /// full, unbudgeted minimization of a recorded tree against a recorded
    /// bit set
    pub fn minimize_recorded(
        &mut self,
        mut tree: Tree,
        fresh_bits: FxHashSet<usize>,
    ) -> Result<Tree> {
        let Self {
            executor,
            mutator,
            ctx,
            statistics,
            ..
        } = self;
        let mut tester = |view: &TreeMutation, bits: &FxHashSet<usize>, ctx: &Context| {
            preserves_bits(executor, statistics, ctx, view, bits)
        };

        mutator
            .minimize_tree(&mut tree, &fresh_bits, ctx, 0, usize::MAX, &mut tester)
            .context("subtree minimization")?;
        mutator
            .minimize_rec(&mut tree, &fresh_bits, ctx, 0, usize::MAX, &mut tester)
            .context("recursive minimization")?;

        Ok(tree)
    }
}

/// run the executor with a bounded number of retries on executor errors
fn execute<E: Executor>(
    executor: &mut E,
    statistics: &mut Statistics,
    data: &[u8],
) -> Result<ExecutionResult> {
    let mut attempt = 0;
    loop {
        match executor.execute(data) {
            Ok(result) => {
                statistics.process_execution(result.exit_reason);
                return Ok(result);
            }
            Err(err) => {
                attempt += 1;
                if attempt == EXECUTOR_RETRY_LIMIT {
                    return Err(err).context("executor failed repeatedly");
                }
                log::warn!("executor error (attempt {}): {:?}", attempt, err);
            }
        }
    }
}

/// boolean tester for minimization: does the view still trigger every fresh
/// bit?
fn preserves_bits<E: Executor>(
    executor: &mut E,
    statistics: &mut Statistics,
    ctx: &Context,
    view: &grammar::TreeMutation,
    bits: &FxHashSet<usize>,
) -> Result<bool> {
    let mut data = vec![];
    view.unparse_to(ctx, &mut data);
    let result = execute(executor, statistics, &data)?;

    Ok(bits
        .iter()
        .all(|&bit| result.coverage.get(bit).is_some_and(|&value| value != 0)))
}

/// mutation tester: execute the view and offer the outcome to the queue,
/// materializing only on admission
fn offer<E: Executor, T: TreeView>(
    executor: &mut E,
    queue: &mut Queue,
    statistics: &mut Statistics,
    ctx: &Context,
    work_dir: &Path,
    view: &T,
) -> Result<Option<u64>> {
    let mut data = vec![];
    view.unparse_to(ctx, &mut data);
    let result = execute(executor, statistics, &data)?;

    if !queue.has_fresh_bits(&result.coverage) {
        return Ok(None);
    }

    let id = queue.add(
        view.to_tree(ctx),
        result.coverage,
        result.exit_reason,
        ctx,
        result.execution_time,
    )?;
    if let Some(id) = id {
        write_artifact(work_dir, id, result.exit_reason, &data)?;
    }

    Ok(id)
}

/// mirror crashing and hanging inputs outside the queue, named like queue
/// entries
fn write_artifact(work_dir: &Path, id: u64, exit_reason: ExitReason, data: &[u8]) -> Result<()> {
    let dir = match exit_reason {
        ExitReason::Normal => return Ok(()),
        ExitReason::Crash => "crashes",
        ExitReason::Timeout | ExitReason::Hang => "hangs",
    };

    log::info!("new {} input {}", exit_reason, id);
    write_file_0600(
        &work_dir
            .join(dir)
            .join(format!("id:{:09},er:{}", id, exit_reason.code())),
        data,
    )
}
