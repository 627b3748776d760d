fn main() {
    std::process::exit(match canopy::main() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err:?}");
            canopy::exit_code(&err)
        }
    });
}
