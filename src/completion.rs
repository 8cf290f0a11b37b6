//! # Shell Completion Module
//!
//! Completion scripts for the `cadence` binary, generated by `clap_complete`
//! from the CLI definition so they never drift from the actual flags.
//!
//! ## Usage
//!
//! ```bash
//! cadence completion bash > ~/.local/share/bash-completion/completions/cadence
//! cadence completion zsh > ~/.config/zsh/completions/_cadence
//! cadence completion fish > ~/.config/fish/completions/cadence.fish
//! ```

use crate::cli::{Args, Shell};
use clap::CommandFactory;
use clap_complete::{generate, Generator, Shell as CompletionShell};
use std::io::{self, Write};

/// Write completions for `gen` to `out`.
pub fn write_completions<G: Generator>(gen: G, out: &mut dyn Write) {
    let mut cmd = Args::command();
    let name = cmd.get_name().to_string();
    generate(gen, &mut cmd, name, out);
}

/// Print completions for `shell` to stdout.
pub fn print_completions(shell: Shell) {
    write_completions(shell_to_completion_shell(shell), &mut io::stdout());
}

/// Convert our Shell enum to clap_complete's Shell enum
#[must_use]
pub const fn shell_to_completion_shell(shell: Shell) -> CompletionShell {
    match shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    }
}
