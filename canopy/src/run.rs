use std::{fs, path::Path, time::Duration};

use anyhow::{Context as _, Result};
use common::{exit::register_signal_handlers, FxHashSet};
use fuzzer::{CommandExecutor, ExecutorError, Fuzzer, FuzzerOptions};
use grammar::{load_grammar, load_tree, Context, GrammarError, Tree, TreeView};

use crate::cli::{self, Arguments, Command};

pub fn run(opt: Arguments) -> Result<()> {
    let ctx = load_grammar(&opt.grammar)?;
    log::info!(
        "loaded grammar {:?}: {} nonterminals, {} productions",
        opt.grammar,
        ctx.nt_count(),
        ctx.rule_count()
    );
    common::fs::create_dir(&opt.work_dir)?;

    match opt.command {
        Command::Fuzz(args) => fuzz(ctx, &opt.work_dir, args),
        Command::Generate(args) => generate(ctx, &opt.work_dir, args),
        Command::Minimize(args) => minimize(ctx, &opt.work_dir, args),
    }
}

/// map error kinds to the documented exit codes: 2 grammar load error,
/// 3 executor setup error, 1 everything else
pub fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<GrammarError>().is_some() {
            return 2;
        }
        if cause.downcast_ref::<ExecutorError>().is_some() {
            return 3;
        }
    }

    1
}

fn fuzz(ctx: Context, work_dir: &Path, args: cli::FuzzArguments) -> Result<()> {
    register_signal_handlers()?;

    let executor = command_executor(&args.executor, work_dir)?;
    let options = FuzzerOptions {
        seed: args.seed,
        operator_weights: [
            args.weights.weight_random,
            args.weights.weight_recursion,
            args.weights.weight_splice,
        ],
    };

    Fuzzer::new(ctx, executor, work_dir.to_path_buf(), options)?.run()
}

fn generate(ctx: Context, work_dir: &Path, args: cli::GenerateArguments) -> Result<()> {
    let dir = work_dir.join("generated");
    common::fs::create_dir(&dir)?;

    let mut tree = Tree::default();
    let mut buffer = vec![];
    for i in 0..args.count {
        tree.generate_from_nt(ctx.start(), args.tree_len, &ctx);
        tree.unparse_to(&ctx, &mut buffer);

        let path = dir.join(format!("gen-{i:05}"));
        fs::write(&path, &buffer).with_context(|| format!("Failed to write {path:?}"))?;
    }

    log::info!("generated {} inputs in {:?}", args.count, dir);
    Ok(())
}

fn minimize(ctx: Context, work_dir: &Path, args: cli::MinimizeArguments) -> Result<()> {
    let tree = load_tree(&args.tree, &ctx)?;
    let mut data = vec![];
    tree.unparse_to(&ctx, &mut data);

    let executor = command_executor(&args.executor, work_dir)?;
    let mut fuzzer = Fuzzer::new(
        ctx,
        executor,
        work_dir.to_path_buf(),
        FuzzerOptions::default(),
    )?;

    // bits from the command line, or recorded from one execution
    let fresh_bits: FxHashSet<usize> = if args.bits.is_empty() {
        let result = fuzzer.execute_bytes(&data)?;
        result
            .coverage
            .iter()
            .enumerate()
            .filter(|(_, &value)| value != 0)
            .map(|(bit, _)| bit)
            .collect()
    } else {
        args.bits.iter().copied().collect()
    };
    anyhow::ensure!(
        !fresh_bits.is_empty(),
        "recorded bit set is empty, nothing to preserve"
    );
    log::info!(
        "minimizing a {} byte input against {} bits",
        data.len(),
        fresh_bits.len()
    );

    let minimized = fuzzer.minimize_recorded(tree, fresh_bits)?;
    let mut out = vec![];
    minimized.unparse_to(fuzzer.ctx(), &mut out);

    let path = work_dir.join("minimized");
    fs::write(&path, &out).with_context(|| format!("Failed to write {path:?}"))?;
    fs::write(
        work_dir.join("minimized.tree.json"),
        serde_json::to_vec(minimized.rules()).context("serialize tree")?,
    )
    .context("Failed to write minimized tree")?;
    log::info!("minimized input written to {:?} ({} bytes)", path, out.len());

    Ok(())
}

fn command_executor(args: &cli::ArgumentsExecutor, work_dir: &Path) -> Result<CommandExecutor> {
    let (command, put_args) = args.put.split_first().context("missing PUT command")?;

    Ok(CommandExecutor::new(
        command.into(),
        put_args.to_vec(),
        Duration::from_millis(args.timeout_ms),
        args.memory_mb,
        args.coverage_map_size,
        work_dir,
    )?)
}
