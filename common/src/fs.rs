use std::{
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::Path,
};

use anyhow::{Context, Result};

pub fn bufreader(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .with_context(|| format!("Failed to open file {path:?}"))
        .map(BufReader::new)
}

pub fn bufwriter(path: &Path) -> Result<BufWriter<File>> {
    File::create(path)
        .with_context(|| format!("Failed to create file {path:?}"))
        .map(BufWriter::new)
}

pub fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("Failed to create directory {path:?}"))
}
