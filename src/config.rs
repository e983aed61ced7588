//! Ordered, deduplicated string-list configuration.
//!
//! Two lists drive upload behavior: extra environment-variable names to
//! send as info tags, and glob patterns that exclude matching record
//! instance names from enumeration. Both lists are mutable only before
//! the driver leaves [`crate::driver::Phase::Init`]; mutation is a no-op
//! (with a warning) once the connection has started or shutdown has been
//! requested.

use globset::{Glob, GlobSet, GlobSetBuilder};

/// Built-in environment-variable names always looked up during upload, in
/// this order, ahead of anything the host adds with [`Config::add_env_vars`].
pub const DEFAULT_ENV_VARS: &[&str] = &[
    "HOSTNAME",
    "EPICS_BASE",
    "TOP",
    "ARCH",
    "IOC",
    "EPICS_CA_ADDR_LIST",
    "EPICS_CA_AUTO_ADDR_LIST",
    "EPICS_CA_MAX_ARRAY_BYTES",
    "RSRV_SERVER_PORT",
    "PVAS_SERVER_PORT",
    "PWD",
    "EPICS_HOST_ARCH",
    "IOCNAME",
    "ENGINEER",
    "LOCATION",
];

/// The two deduplicated string lists consumed during upload.
///
/// `env_vars` starts pre-seeded with [`DEFAULT_ENV_VARS`]; `exclude_patterns`
/// starts empty. Both grow only through their `add_*` methods, which apply
/// the dedup rules from the protocol's Config component.
#[derive(Debug, Clone)]
pub struct Config {
    env_vars: Vec<String>,
    exclude_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_vars: DEFAULT_ENV_VARS.iter().map(|s| s.to_string()).collect(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full ordered environment-variable list, including defaults and
    /// any extras added so far.
    pub fn env_vars(&self) -> &[String] {
        &self.env_vars
    }

    /// The ordered exclude-pattern list.
    pub fn exclude_patterns(&self) -> &[String] {
        &self.exclude_patterns
    }

    /// Add extra environment-variable names to look up during upload.
    ///
    /// Duplicates of entries already present (including the built-in
    /// defaults) are skipped with a `log::warn!`; empty strings are
    /// skipped the same way. `allow_mutation` gates whether this call is
    /// permitted at all (the caller passes `phase == Init && !shutdown`).
    pub fn add_env_vars<I, S>(&mut self, names: I, allow_mutation: bool) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !allow_mutation {
            log::warn!("ignoring add_env_vars: driver has left Init or is shutting down");
            return 0;
        }
        let mut added = 0;
        for name in names {
            let name = name.into();
            if name.is_empty() {
                log::warn!("ignoring empty env var name");
                continue;
            }
            if self.env_vars.iter().any(|existing| existing == &name) {
                log::warn!("ignoring duplicate env var name {name:?}");
                continue;
            }
            self.env_vars.push(name);
            added += 1;
        }
        added
    }

    /// Add exclusion glob patterns matched against record instance names.
    ///
    /// Same dedup rules as [`Self::add_env_vars`], minus the built-in
    /// default check (the exclude list has no pre-seeded defaults).
    pub fn add_exclude_patterns<I, S>(&mut self, patterns: I, allow_mutation: bool) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !allow_mutation {
            log::warn!("ignoring add_exclude_patterns: driver has left Init or is shutting down");
            return 0;
        }
        let mut added = 0;
        for pattern in patterns {
            let pattern = pattern.into();
            if pattern.is_empty() {
                log::warn!("ignoring empty exclude pattern");
                continue;
            }
            if self.exclude_patterns.iter().any(|existing| existing == &pattern) {
                log::warn!("ignoring duplicate exclude pattern {pattern:?}");
                continue;
            }
            self.exclude_patterns.push(pattern);
            added += 1;
        }
        added
    }

    /// Whether `name` matches any configured exclusion glob. Hosts glue
    /// this between record enumeration and `sendRecord`/`sendAlias`.
    pub fn is_excluded(&self, name: &str) -> bool {
        if self.exclude_patterns.is_empty() {
            return false;
        }
        match self.build_exclude_set() {
            Ok(set) => set.is_match(name),
            Err(e) => {
                log::error!("invalid exclude pattern set, treating as no match: {e}");
                false
            }
        }
    }

    fn build_exclude_set(&self) -> Result<GlobSet, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.exclude_patterns {
            builder.add(Glob::new(pattern)?);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_vars_preseeded_with_defaults() {
        let config = Config::new();
        assert_eq!(config.env_vars(), DEFAULT_ENV_VARS);
    }

    #[test]
    fn exclude_patterns_start_empty() {
        let config = Config::new();
        assert!(config.exclude_patterns().is_empty());
    }

    #[test]
    fn env_var_dedup_sequence_matches_scenario_s5() {
        let mut config = Config::new();
        config.add_env_vars(["SECTOR"], true);
        config.add_env_vars(["BUILDING", "CONTACT"], true);
        config.add_env_vars(["SECTOR"], true);
        config.add_env_vars(["CONTACT", "DEVICE"], true);
        config.add_env_vars(["FAMILY", "FAMILY"], true);

        let extras: Vec<&String> = config.env_vars()[DEFAULT_ENV_VARS.len()..].iter().collect();
        assert_eq!(extras, vec!["SECTOR", "BUILDING", "CONTACT", "DEVICE", "FAMILY"]);
    }

    #[test]
    fn env_var_rejects_default_duplicates() {
        let mut config = Config::new();
        let added = config.add_env_vars(["EPICS_BASE", "ENGINEER"], true);
        assert_eq!(added, 0);
        assert_eq!(config.env_vars(), DEFAULT_ENV_VARS);
    }

    #[test]
    fn env_var_mutation_blocked_after_init() {
        let mut config = Config::new();
        let added = config.add_env_vars(["SECTOR"], false);
        assert_eq!(added, 0);
        assert_eq!(config.env_vars(), DEFAULT_ENV_VARS);
    }

    #[test]
    fn env_var_skips_empty_strings() {
        let mut config = Config::new();
        let added = config.add_env_vars(["", "SECTOR"], true);
        assert_eq!(added, 1);
    }

    #[test]
    fn exclude_glob_matches_scenario_s6() {
        let mut config = Config::new();
        config.add_exclude_patterns(["TEST:*", "*_"], true);

        let names = ["X:1", "TEST:foo", "bar_", "baz"];
        let kept: Vec<&str> = names.iter().copied().filter(|n| !config.is_excluded(n)).collect();
        assert_eq!(kept, vec!["X:1", "baz"]);
    }

    #[test]
    fn exclude_pattern_dedup() {
        let mut config = Config::new();
        let added = config.add_exclude_patterns(["TEST:*", "TEST:*"], true);
        assert_eq!(added, 1);
    }

    #[test]
    fn is_excluded_false_with_no_patterns() {
        let config = Config::new();
        assert!(!config.is_excluded("anything"));
    }
}
