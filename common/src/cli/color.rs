//! Standardized CLI color policy.
//!
//! - The command-line choice wins.
//! - `NO_COLOR` disables colors in `auto`.
//! - `EMACS` implies a non-interactive buffer in `auto`.
//! - Otherwise `auto` colors only a TTY.

use std::env;

/// When to emit ANSI colors. Usable directly as a `clap` value enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ColorWhen {
    /// Enable colors only when output is a TTY.
    #[default]
    Auto,

    /// Always enable colors.
    Always,

    /// Never enable colors.
    Never,
}

impl ColorWhen {
    // ---
    /// Returns whether ANSI color should be used for the given stream.
    pub fn should_color(self, stream: atty::Stream) -> bool {
        // ---
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => auto_allows_color() && atty::is(stream),
        }
    }

    /// Convenience helper for stderr, where tracing writes.
    pub fn should_color_stderr(self) -> bool {
        self.should_color(atty::Stream::Stderr)
    }
}

fn auto_allows_color() -> bool {
    env::var_os("NO_COLOR").is_none() && env::var_os("EMACS").is_none()
}
