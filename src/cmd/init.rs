//! Default manifest generation: `dockyard init`.

use std::path::Path;

use anyhow::Result;
use console::style;

use dockyard::dev::manifest;

pub fn cmd_init(dir: &Path, file: &str) -> Result<()> {
    let generated = manifest::init(dir, file)?;
    if generated.is_empty() {
        println!(
            "{}",
            style(format!("Nothing to generate in {}", dir.display())).dim()
        );
    } else {
        println!("Generated: {}", generated.join(", "));
    }
    Ok(())
}
