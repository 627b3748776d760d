pub mod cli;
mod run;

pub use run::{exit_code, run};

pub fn main() -> anyhow::Result<()> {
    use clap::Parser;

    let opt = match cli::Arguments::try_parse() {
        Ok(opt) => opt,
        Err(err) => {
            // clap renders help/version itself, usage problems are
            // configuration errors
            let _ = err.print();
            std::process::exit(if err.use_stderr() { 1 } else { 0 });
        }
    };

    common::log::init_log(&opt.log_config)?;
    log::trace!("Args: {:#?}", opt);

    run::run(opt)
}
