use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint};
use common::{
    config::fuzzer::{OPERATOR_WEIGHTS, SEED_TREE_LEN},
    log::LOG_INFO,
};

const PATH: &str = "PATH";

#[derive(Parser, Debug)]
#[command(name = "canopy", rename_all = "kebab-case")]
pub struct Arguments {
    /// Grammar file (JSON list of [nonterminal, production] pairs)
    #[arg(long, value_name = "GRAMMAR", value_hint = ValueHint::FilePath, display_order = 1)]
    pub grammar: PathBuf,

    /// Fuzzer working directory
    #[arg(
        long,
        value_name = PATH,
        default_value = "./work",
        value_hint = ValueHint::DirPath,
        display_order = 2
    )]
    pub work_dir: PathBuf,

    #[arg(long, default_value = LOG_INFO, value_hint = ValueHint::FilePath, display_order = 700)]
    pub log_config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum Command {
    /// Fuzz a PUT with coverage feedback
    #[command(name = "fuzz")]
    Fuzz(FuzzArguments),

    /// Produce inputs from the grammar without executing
    #[command(name = "generate")]
    Generate(GenerateArguments),

    /// Re-minimize a recorded tree against a recorded bit set
    #[command(name = "minimize")]
    Minimize(MinimizeArguments),
}

#[derive(Args, Debug)]
#[command(rename_all = "kebab-case")]
pub struct FuzzArguments {
    /// Use seed for a deterministic fuzzing run
    #[arg(long, value_name = "SEED", display_order = 120)]
    pub seed: Option<u64>,

    #[command(flatten)]
    pub weights: ArgumentsWeights,

    #[command(flatten)]
    pub executor: ArgumentsExecutor,
}

#[derive(Args, Debug)]
#[command(rename_all = "kebab-case")]
pub struct GenerateArguments {
    /// Number of inputs to produce
    #[arg(long, value_name = "N", default_value_t = 100, display_order = 20)]
    pub count: usize,

    /// Size budget per generated tree
    #[arg(long, value_name = "LEN", default_value_t = SEED_TREE_LEN, display_order = 21)]
    pub tree_len: usize,
}

#[derive(Args, Debug)]
#[command(rename_all = "kebab-case")]
pub struct MinimizeArguments {
    /// Recorded tree dump (a queue sidecar *.tree.json)
    #[arg(long, value_name = "TREE", value_hint = ValueHint::FilePath, display_order = 10)]
    pub tree: PathBuf,

    /// Coverage bits to preserve (default: every bit of one recording run)
    #[arg(long, value_name = "BITS", value_delimiter = ',', display_order = 11)]
    pub bits: Vec<usize>,

    #[command(flatten)]
    pub executor: ArgumentsExecutor,
}

#[derive(Args, Debug)]
#[command(rename_all = "kebab-case")]
pub struct ArgumentsExecutor {
    /// Per-execution timeout in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 1_000, display_order = 200)]
    pub timeout_ms: u64,

    /// PUT address space limit in MiB
    #[arg(long, value_name = "MB", display_order = 201)]
    pub memory_mb: Option<u64>,

    /// Coverage map size in bytes, fixed for the duration of a run
    #[arg(long, value_name = "BYTES", default_value_t = 0x10000, display_order = 202)]
    pub coverage_map_size: usize,

    /// PUT command line, input is passed on stdin
    #[arg(value_name = "PUT", required = true, num_args = 1.., last = true, display_order = 20)]
    pub put: Vec<String>,
}

#[derive(Args, Debug)]
#[command(rename_all = "kebab-case")]
pub struct ArgumentsWeights {
    /// Weight of the random mutation operator
    #[arg(long, value_name = "N", default_value_t = OPERATOR_WEIGHTS[0], display_order = 300)]
    pub weight_random: usize,

    /// Weight of the random-recursion mutation operator
    #[arg(long, value_name = "N", default_value_t = OPERATOR_WEIGHTS[1], display_order = 301)]
    pub weight_recursion: usize,

    /// Weight of the splicing mutation operator
    #[arg(long, value_name = "N", default_value_t = OPERATOR_WEIGHTS[2], display_order = 302)]
    pub weight_splice: usize,
}
