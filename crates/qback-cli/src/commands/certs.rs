//! Development certificate generation.

use anyhow::{Context, Result};
use qback_core::crypto::generate_dev_certs;

use super::CertsArgs;

/// Run the certs command.
pub fn run(args: &CertsArgs) -> Result<()> {
    let written = generate_dev_certs(&args.dir, &args.names, args.force).with_context(|| {
        format!(
            "Failed to generate certificates in {} (use --force to overwrite)",
            args.dir.display()
        )
    })?;

    println!("  Generated a development CA for {}", args.names.join(", "));
    for path in &written {
        println!("    {}", path.display());
    }
    println!();
    println!("  Start the server with:  qback server --tls --certs {}", args.dir.display());
    println!("  Connect a client with:  qback client --tls --certs {} ping", args.dir.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn args(dir: PathBuf, force: bool) -> CertsArgs {
        CertsArgs {
            dir,
            names: vec!["localhost".to_string()],
            force,
        }
    }

    #[test]
    fn test_refuses_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        run(&args(dir.path().to_path_buf(), false)).unwrap();
        assert!(dir.path().join("ca.pem").exists());

        assert!(run(&args(dir.path().to_path_buf(), false)).is_err());
        run(&args(dir.path().to_path_buf(), true)).unwrap();
    }
}
