//! Command-line arguments for the diagnostic runner.

use std::path::PathBuf;

use clap::Parser;

/// Runs a Totem bytecode image to completion, writing the instruction
/// trace to a side file and printing execution statistics and a final
/// register dump.
#[derive(Debug, Parser)]
#[command(name = "totem", version, about)]
pub struct Args {
    /// Bytecode image to execute.
    #[arg(required_unless_present = "demo")]
    pub image: Option<PathBuf>,

    /// Where to write the instruction trace (default: the image path
    /// with a `.trace` extension).
    #[arg(long)]
    pub trace_file: Option<PathBuf>,

    /// Build and run the built-in demo image instead of loading one.
    #[arg(long, conflicts_with = "image")]
    pub demo: bool,

    /// Abort after this many `step` calls.
    #[arg(long, default_value_t = 10_000_000)]
    pub max_steps: u64,

    /// Actor id passed to library calls.
    #[arg(long, default_value_t = uuid::Uuid::nil())]
    pub actor: uuid::Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_is_required_without_demo() {
        assert!(Args::try_parse_from(["totem"]).is_err());
        assert!(Args::try_parse_from(["totem", "--demo"]).is_ok());
        assert!(Args::try_parse_from(["totem", "script.tvm"]).is_ok());
    }

    #[test]
    fn demo_conflicts_with_an_image_path() {
        assert!(Args::try_parse_from(["totem", "--demo", "script.tvm"]).is_err());
    }
}
