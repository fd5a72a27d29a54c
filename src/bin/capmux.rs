use anyhow::Result;

fn main() -> Result<()> {
    capmux::cli::run()
}
