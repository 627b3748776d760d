pub mod grammar {
    // upper bound for random generation budgets, see Context::random_len_for_nt
    pub const MAX_RANDOM_LEN: usize = 100;
}

pub mod fuzzer {
    pub const SEED_TREE_COUNT: usize = 32;
    pub const SEED_TREE_LEN: usize = 128;

    // per-round step budgets so long minimizations interleave with mutation
    pub const MINIMIZATION_STEPS: usize = 64;
    pub const RULES_MUTATION_STEPS: usize = 32;
    pub const RANDOM_MUTATIONS: usize = 128;

    pub const EXECUTOR_RETRY_LIMIT: usize = 3;

    // default operator weights: random, random-recursion, splice
    pub const OPERATOR_WEIGHTS: [usize; 3] = [50, 25, 25];
}

pub mod mutation {
    use std::ops::RangeInclusive;

    // recursion body is replicated 2^k / body-len times
    pub const RECURSION_REPEAT_POW2: RangeInclusive<usize> = 1..=10;
}

pub mod chunkstore {
    pub const MAX_CHUNKS_PER_RULE: usize = 512;
    pub const MAX_CHUNK_SIZE: usize = 96;
}

pub mod statistics {
    use std::time::Duration;

    pub const REPORT_INTERVAL: Duration = Duration::from_secs(10);
}
