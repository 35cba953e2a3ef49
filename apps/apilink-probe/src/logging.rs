//! Tracing bootstrap for the probe CLI.
//!
//! One-shot checks log warnings only; the verdict goes to stdout. `--verbose`
//! and watch mode switch to the detailed profile.

use std::env;

use tracing_subscriber::EnvFilter;

const QUIET_FILTER: &str = "warn,apilink_probe=info";
const DETAILED_FILTER: &str = "info,apilink_client=debug,apilink_core=debug,apilink_probe=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Quiet,
    Detailed,
}

impl Profile {
    pub fn select(verbose: bool, watching: bool) -> Self {
        if verbose || watching {
            Self::Detailed
        } else {
            Self::Quiet
        }
    }

    fn default_filter(self) -> &'static str {
        match self {
            Self::Quiet => QUIET_FILTER,
            Self::Detailed => DETAILED_FILTER,
        }
    }
}

/// Install the global subscriber. `RUST_LOG`, then `APILINK_LOG`, override
/// the profile's default filter.
pub fn init(profile: Profile) {
    let detailed = profile == Profile::Detailed;
    let _ = tracing_subscriber::fmt()
        .with_target(detailed)
        .with_thread_ids(detailed)
        .with_writer(std::io::stderr)
        .with_env_filter(filter_from_env(profile))
        .try_init();
}

fn filter_from_env(profile: Profile) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    env::var("APILINK_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(profile.default_filter()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_mode_and_verbose_flag_select_detailed_profile() {
        assert_eq!(Profile::select(false, false), Profile::Quiet);
        assert_eq!(Profile::select(true, false), Profile::Detailed);
        assert_eq!(Profile::select(false, true), Profile::Detailed);
    }

    #[test]
    fn profile_defaults_parse_as_filters() {
        for profile in [Profile::Quiet, Profile::Detailed] {
            assert!(EnvFilter::try_new(profile.default_filter()).is_ok());
        }
    }
}
