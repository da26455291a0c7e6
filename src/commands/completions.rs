use edged::completions::{self, CompletionShell};

use crate::args::Cli;

pub(crate) fn cmd_completions(shell: CompletionShell) {
    completions::generate_completions::<Cli>(shell, "edged");
}
