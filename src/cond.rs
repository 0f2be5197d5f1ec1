//! Tri-valued condition store gating every service transition.
//!
//! Conditions are slash-delimited names (`net/eth0/up`, `pid/foo`,
//! `usr/ready`) with a persistent ON/OFF state and a derived FLUX state. A
//! condition is FLUX when it was asserted before the latest reconfiguration:
//! dependents then pause instead of stopping, and resume once the condition
//! is re-observed.
//!
//! The store is single-writer, owned by the event loop. Assertions are
//! stamped with a logical generation; the reconfiguration marker is the
//! current generation and bumping it sends every standing assertion into
//! FLUX. A filesystem mirror under the runtime directory lets external
//! processes observe ON/OFF by stat'ing entries; the mirror is never read
//! back by the core.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    constants::{COND_ASSERTED_DIR, COND_RECONF_FILE, COND_USR_DIR},
    error::CondError,
};

/// Observed state of a single condition or an aggregate expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondState {
    /// Asserted at the current generation.
    On,
    /// Asserted, but before the latest reconfiguration.
    Flux,
    /// Not asserted.
    Off,
}

impl CondState {
    /// Short lowercase label used in logs and status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            CondState::On => "on",
            CondState::Flux => "flux",
            CondState::Off => "off",
        }
    }
}

/// One term of a condition expression, e.g. `net/eth0/up` or `!pid/foo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CondTerm {
    /// Condition name, without the negation prefix.
    pub name: String,
    /// True when the term was written as `!name`.
    pub negated: bool,
}

/// A parsed condition expression: the comma-separated list from `<...>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CondExpr(pub Vec<CondTerm>);

impl CondExpr {
    /// Parses `a,b,!c`. Empty input yields the empty expression, which
    /// aggregates to ON.
    pub fn parse(raw: &str) -> Self {
        let terms = raw
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| match t.strip_prefix('!') {
                Some(name) => CondTerm {
                    name: name.to_string(),
                    negated: true,
                },
                None => CondTerm {
                    name: t.to_string(),
                    negated: false,
                },
            })
            .collect();
        CondExpr(terms)
    }

    /// True when the expression has no terms.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when any term references `name`.
    pub fn mentions(&self, name: &str) -> bool {
        self.0.iter().any(|t| t.name == name)
    }
}

impl std::fmt::Display for CondExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for term in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if term.negated {
                write!(f, "!")?;
            }
            write!(f, "{}", term.name)?;
        }
        Ok(())
    }
}

/// Validates a condition name: slash-delimited, no empty or dot segments.
pub fn valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 256 {
        return false;
    }
    name.split('/').all(|seg| {
        !seg.is_empty()
            && seg != "."
            && seg != ".."
            && seg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    })
}

/// The condition store.
#[derive(Debug)]
pub struct CondStore {
    entries: BTreeMap<String, u64>,
    generation: u64,
    root: PathBuf,
}

impl CondStore {
    /// Creates the store and (re)initializes the filesystem mirror under
    /// `root`: `asserted/`, `usr/` and the `reconf` marker.
    pub fn new(root: PathBuf) -> Result<Self, CondError> {
        fs::create_dir_all(root.join(COND_ASSERTED_DIR))?;
        fs::create_dir_all(root.join(COND_USR_DIR))?;
        fs::write(root.join(COND_RECONF_FILE), b"1\n")?;

        Ok(Self {
            entries: BTreeMap::new(),
            generation: 1,
            root,
        })
    }

    /// Current reconfiguration generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn mirror_path(&self, name: &str) -> PathBuf {
        match name.strip_prefix("usr/") {
            Some(rest) => self.root.join(COND_USR_DIR).join(rest),
            None => self.root.join(COND_ASSERTED_DIR).join(name),
        }
    }

    fn mirror_touch(&self, name: &str) {
        let path = self.mirror_path(name);
        if let Some(parent) = path.parent()
            && let Err(err) = fs::create_dir_all(parent)
        {
            warn!("cond: failed creating {:?}: {err}", parent);
            return;
        }
        if let Err(err) = fs::write(&path, b"") {
            warn!("cond: failed asserting {:?}: {err}", path);
        }
    }

    fn mirror_remove(&self, name: &str) {
        let path = self.mirror_path(name);
        if let Err(err) = fs::remove_file(&path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!("cond: failed clearing {:?}: {err}", path);
        }
    }

    /// Asserts `name` at the current generation.
    pub fn set(&mut self, name: &str) {
        if !valid_name(name) {
            warn!("cond: refusing to set invalid name '{name}'");
            return;
        }
        debug!("cond: +{name}");
        self.entries.insert(name.to_string(), self.generation);
        self.mirror_touch(name);
    }

    /// Clears `name`.
    pub fn clear(&mut self, name: &str) {
        if self.entries.remove(name).is_some() {
            debug!("cond: -{name}");
        }
        self.mirror_remove(name);
    }

    /// Backdates `name` so dependents observe FLUX until it is re-asserted.
    /// No-op when the condition is not asserted.
    pub fn flux(&mut self, name: &str) {
        let flux_stamp = self.generation.saturating_sub(1);
        if let Some(stamp) = self.entries.get_mut(name) {
            debug!("cond: ~{name}");
            *stamp = flux_stamp;
        }
    }

    /// Returns the state of a single condition.
    pub fn get(&self, name: &str) -> CondState {
        match self.entries.get(name) {
            None => CondState::Off,
            Some(stamp) if *stamp >= self.generation => CondState::On,
            Some(_) => CondState::Flux,
        }
    }

    /// Aggregates an expression: OFF if any positive term is OFF or any
    /// negated term is ON; FLUX if no OFF-ing term but any term is FLUX; ON
    /// otherwise. The empty expression is ON.
    pub fn get_agg(&self, expr: &CondExpr) -> CondState {
        let mut flux = false;
        for term in &expr.0 {
            match (self.get(&term.name), term.negated) {
                (CondState::Off, false) | (CondState::On, true) => return CondState::Off,
                (CondState::Flux, _) => flux = true,
                _ => {}
            }
        }
        if flux { CondState::Flux } else { CondState::On }
    }

    /// Advances the reconfiguration marker: every standing assertion becomes
    /// FLUX until re-stamped.
    pub fn bump_generation(&mut self) {
        self.generation += 1;
        debug!("cond: reconfiguration generation {}", self.generation);
        if let Err(err) = fs::write(
            self.root.join(COND_RECONF_FILE),
            format!("{}\n", self.generation),
        ) {
            warn!("cond: failed updating reconf marker: {err}");
        }
    }

    /// Re-stamps every asserted condition matching `prefix` at the current
    /// generation, forcing dependents through FLUX back to ON.
    pub fn reassert(&mut self, prefix: &str) {
        let generation = self.generation;
        let names: Vec<String> = self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            debug!("cond: reasserting {name}");
            self.entries.insert(name.clone(), generation);
            self.mirror_touch(&name);
        }
    }

    /// Clears every condition matching `prefix` without notifying
    /// dependents; the caller resynchronizes with ground truth before the
    /// next step.
    pub fn deassert(&mut self, prefix: &str) {
        let names: Vec<String> = self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            self.entries.remove(&name);
            self.mirror_remove(&name);
        }
    }

    /// Folds user-asserted conditions from the filesystem into the store.
    /// The `usr/` namespace is the one place where external writers are
    /// allowed; this runs during reload to pick their changes up.
    pub fn sync_usr(&mut self) {
        let usr_root = self.root.join(COND_USR_DIR);
        let mut found = Vec::new();
        collect_files(&usr_root, &usr_root, &mut found);

        let known: Vec<String> = self
            .entries
            .keys()
            .filter(|name| name.starts_with("usr/"))
            .cloned()
            .collect();

        for rel in &found {
            let name = format!("usr/{rel}");
            if valid_name(&name) && self.get(&name) == CondState::Off {
                self.entries.insert(name, self.generation);
            }
        }
        for name in known {
            let rel = name.trim_start_matches("usr/").to_string();
            if !found.contains(&rel) {
                self.entries.remove(&name);
            }
        }
    }

    /// Names of all asserted conditions, for `cond dump`.
    pub fn names(&self) -> impl Iterator<Item = (&str, CondState)> {
        self.entries
            .keys()
            .map(|name| (name.as_str(), self.get(name)))
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().into_owned());
        }
    }
}
