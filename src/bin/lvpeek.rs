use anyhow::Result;

fn main() -> Result<()> {
    lvpeek::cli::run(lvpeek::cli::CliMode::Peek)
}
