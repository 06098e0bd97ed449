//! Run cases known to the orchestrator.
//!
//! A run case names both the per-case executable directory under the build
//! directory and the launch topology used for it.

use std::fmt;

/// A named configuration of the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum RunCase {
    /// Server, two gardeners and a flowerbed.
    #[value(name = "4-5")]
    FourFive,
    /// Adds a monitor started right after the server.
    #[value(name = "6-7")]
    SixSeven,
    #[value(name = "8")]
    Eight,
    #[value(name = "9-10")]
    NineTen,
}

impl RunCase {
    /// Configuration name, also the executable directory name.
    pub fn as_str(self) -> &'static str {
        match self {
            RunCase::FourFive => "4-5",
            RunCase::SixSeven => "6-7",
            RunCase::Eight => "8",
            RunCase::NineTen => "9-10",
        }
    }
}

impl fmt::Display for RunCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
