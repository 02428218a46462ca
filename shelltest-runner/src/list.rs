// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test manifests and the expanded test list.
//!
//! A [`Manifest`] is the declarative input: an ordered sequence of
//! [`TestDef`] records, typically deserialized from a TOML document.
//! [`TestList::new`] expands it into concrete [`TestUnit`]s, applying the
//! path filter, repeat count and optional shuffle.

use crate::errors::ManifestParseError;
use camino::Utf8PathBuf;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::Deserialize;
use std::{collections::BTreeMap, fmt};

/// Identifier for a test unit.
///
/// Ids default to the unit's path and are carried through every log record
/// and event.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TestId(String);

impl TestId {
    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TestId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// The outcome a unit is expected to produce.
///
/// A unit that is expected to fail and does fail is bookkept as "todo", not
/// as a pass.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ExpectedOutcome {
    /// The unit is expected to pass.
    #[default]
    Pass,
    /// The unit is a known failure.
    Fail,
}

impl ExpectedOutcome {
    /// The status string used in log records.
    pub fn status_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }
}

/// One manifest record.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestDef {
    /// Path to the test file, passed to the program as its final argument.
    pub path: Utf8PathBuf,

    /// Identifier used in logs. Defaults to the path.
    #[serde(default)]
    pub id: Option<String>,

    /// The expected outcome.
    #[serde(default)]
    pub expected: ExpectedOutcome,

    /// If set, the unit is skipped, with this string as the reason.
    ///
    /// `skip-if` conditions are evaluated by the manifest layer and arrive
    /// here already resolved.
    #[serde(default)]
    pub disabled: Option<String>,

    /// Runs this unit on the sequential queue.
    #[serde(default)]
    pub run_sequentially: bool,

    /// Multiplies the harness timeout for long-running units.
    #[serde(default = "default_timeout_factor")]
    pub request_timeout_factor: u32,

    /// Runs the unit with dark-matter-detector instrumentation enabled.
    #[serde(default)]
    pub dmd: bool,

    /// Extra environment variables for this unit.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Preferences serialized into the unit's profile directory.
    #[serde(default)]
    pub prefs: BTreeMap<String, String>,

    /// Reporting group. Defaults to the manifest's group.
    #[serde(default)]
    pub group: Option<String>,
}

impl TestDef {
    /// Creates a definition with default flags for the given path.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            id: None,
            expected: ExpectedOutcome::Pass,
            disabled: None,
            run_sequentially: false,
            request_timeout_factor: 1,
            dmd: false,
            env: BTreeMap::new(),
            prefs: BTreeMap::new(),
            group: None,
        }
    }
}

fn default_timeout_factor() -> u32 {
    1
}

/// A declarative test manifest.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Manifest {
    /// The test records, in manifest order.
    #[serde(rename = "test", default)]
    pub tests: Vec<TestDef>,
}

impl Manifest {
    /// Parses a manifest from a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ManifestParseError> {
        toml::from_str(input).map_err(|error| ManifestParseError { error })
    }
}

/// One schedulable test invocation.
#[derive(Clone, Debug)]
pub struct TestUnit {
    /// Position in queue order. Retries are drained in this order.
    pub index: usize,

    /// Identifier used in logs.
    pub id: TestId,

    /// Path to the test file.
    pub path: Utf8PathBuf,

    /// Reporting group.
    pub group: String,

    /// The expected outcome.
    pub expected: ExpectedOutcome,

    /// Skip reason, if the unit is disabled.
    pub disabled: Option<String>,

    /// Whether the unit runs on the sequential queue.
    pub sequential: bool,

    /// Harness timeout multiplier.
    pub timeout_factor: u32,

    /// Whether dark-matter-detector instrumentation is enabled.
    pub dmd: bool,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,

    /// Preferences serialized into the profile directory.
    pub prefs: BTreeMap<String, String>,
}

/// Settings for expanding a [`Manifest`] into a [`TestList`].
#[derive(Clone, Debug, Default)]
pub struct ListSettings {
    /// Number of extra runs per unit. Each definition produces
    /// `repeat + 1` units.
    pub repeat: usize,

    /// Shuffles the expanded list.
    pub shuffle: bool,

    /// Seed for the shuffle, for reproducible orderings.
    pub shuffle_seed: Option<u64>,

    /// Path-suffix filter. Selecting a single file this way is expected to
    /// force sequential mode (the caller's concern).
    pub filter: Option<String>,

    /// Group assigned to units without an explicit one, typically the
    /// manifest's file stem.
    pub default_group: Option<String>,
}

/// The expanded, ordered list of test units for one suite run.
#[derive(Clone, Debug, Default)]
pub struct TestList {
    units: Vec<TestUnit>,
}

impl TestList {
    /// Expands a manifest into concrete units.
    pub fn new(manifest: Manifest, settings: &ListSettings) -> Self {
        let default_group = settings.default_group.as_deref().unwrap_or("shelltest");

        let mut defs = manifest.tests;
        if let Some(filter) = &settings.filter {
            defs.retain(|def| def.path.as_str().ends_with(filter));
        }

        let mut units = Vec::with_capacity(defs.len() * (settings.repeat + 1));
        for def in defs {
            for _ in 0..settings.repeat + 1 {
                let id = def
                    .id
                    .clone()
                    .unwrap_or_else(|| def.path.as_str().to_owned());
                units.push(TestUnit {
                    index: units.len(),
                    id: TestId(id),
                    path: def.path.clone(),
                    group: def.group.clone().unwrap_or_else(|| default_group.to_owned()),
                    expected: def.expected,
                    disabled: def.disabled.clone(),
                    sequential: def.run_sequentially,
                    timeout_factor: def.request_timeout_factor.max(1),
                    dmd: def.dmd,
                    env: def.env.clone(),
                    prefs: def.prefs.clone(),
                });
            }
        }

        if settings.shuffle {
            match settings.shuffle_seed {
                Some(seed) => units.shuffle(&mut StdRng::seed_from_u64(seed)),
                None => units.shuffle(&mut rand::rng()),
            }
            // Queue order is position order, so reindex after shuffling.
            for (index, unit) in units.iter_mut().enumerate() {
                unit.index = index;
            }
        }

        Self { units }
    }

    /// The number of units in the list.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// The units in queue order.
    pub fn units(&self) -> &[TestUnit] {
        &self.units
    }

    /// Iterates over the units in queue order.
    pub fn iter(&self) -> impl Iterator<Item = &TestUnit> {
        self.units.iter()
    }

    /// Splits the list into the concurrent queue and the sequential queue,
    /// preserving queue order within each.
    ///
    /// With `force_sequential`, every unit lands on the sequential queue.
    pub fn partition(&self, force_sequential: bool) -> (Vec<&TestUnit>, Vec<&TestUnit>) {
        if force_sequential {
            return (Vec::new(), self.units.iter().collect());
        }
        self.units.iter().partition(|unit| !unit.sequential)
    }

    /// Group name to test ids, for suite-level log records.
    pub fn groups(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for unit in &self.units {
            groups
                .entry(unit.group.as_str())
                .or_default()
                .push(unit.id.as_str());
        }
        groups
    }
}
