//! Key management commands.
//!
//! `tde keys generate` - Generate a new master key.

use std::path::PathBuf;
use tde_crypto::MasterKey;

/// Generate a new master key.
pub fn generate(output: Option<PathBuf>) -> anyhow::Result<()> {
    let key = MasterKey::generate();

    if let Some(path) = output {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            anyhow::bail!("{} already exists, refusing to overwrite", path.display());
        }
        key.save_to_file(&path)?;

        println!("✔ Generated master key: {}", path.display());
        println!();
        println!("⚠️  Losing this key makes every encrypted column unreadable. Back it up.");
        println!();
        println!("Reference it from tde.yaml:");
        println!("  encryption:");
        println!("    master_key_file: {}", path.display());
    } else {
        println!("{}", key.to_hex());
        println!();
        println!("Use --output <file> to save the key to a file,");
        println!("or export it as TDE_MASTER_KEY.");
    }

    Ok(())
}
