//! Target registry and resolver.
//!
//! Targets and groups accumulate here during initialization, each with its
//! declared origin package. Consumers may deregister a contributing
//! package wholesale; a deregistration only applies to entries registered
//! *before* it was issued, which is what makes deregister-then-reregister
//! work. Resolution runs once at the start of a run, applies the
//! deregistration scope rule, reclassifies the consumer's own entries as
//! local, rejects name conflicts, and freezes the registry.
//!
//! A process-wide registry backs the common case; [`Registry`] itself is
//! an ordinary value, so tests (and embedders) construct their own.

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{Result, TargError};
use crate::target::Member;

/// One registered entry with its attribution.
#[derive(Debug, Clone)]
struct Registration {
    entry: Member,
    source: String,
    source_file: String,
}

/// A resolved entry: the member plus its effective attribution (origin
/// cleared for entries reclassified as local).
#[derive(Debug, Clone)]
pub struct ResolvedEntry {
    /// The target or group.
    pub member: Member,
    /// Effective origin package; empty for local entries.
    pub source: String,
    /// Declaring source file, when known.
    pub source_file: String,
}

/// The outcome of registry resolution.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Surviving entries, in registration order.
    pub entries: Vec<ResolvedEntry>,
    /// Distinct package paths that were deregistered, in request order
    /// (shown by help as hidden packages).
    pub deregistered: Vec<String>,
}

/// Ordered registry of target descriptions with deregistration support.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<Registration>,
    deregistrations: Vec<(String, usize)>,
    main_module: Option<String>,
    resolved: Option<Resolution>,
}

impl Registry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append entries. Attribution comes from each entry's own declared
    /// source; entries without one are local.
    pub fn register<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = Member>,
    {
        self.register_from("", "", entries);
    }

    /// Append entries detected to come from `source` (the registration
    /// macro passes `module_path!()`/`file!()`). An explicit source on an
    /// entry is preserved; otherwise the detected one is recorded.
    pub fn register_from<I>(&mut self, source: &str, source_file: &str, entries: I)
    where
        I: IntoIterator<Item = Member>,
    {
        for entry in entries {
            let declared = entry.source();
            let effective = if declared.is_empty() {
                source.to_string()
            } else {
                declared.to_string()
            };
            self.entries.push(Registration {
                entry,
                source: effective,
                source_file: source_file.to_string(),
            });
        }
    }

    /// Queue removal of every entry `package` registered so far.
    ///
    /// Entries registered after this call are preserved, so a consumer can
    /// hide a remote package's targets wholesale and then reinstate
    /// selected ones under its own name. Queuing the same package twice is
    /// a no-op; deregistering after resolution is an error.
    pub fn deregister(&mut self, package: &str) -> Result<()> {
        if self.resolved.is_some() {
            return Err(TargError::PostResolutionDeregister {
                package: package.to_string(),
            });
        }
        if package.is_empty() {
            return Err(TargError::InvalidArgument {
                name: "package".to_string(),
                reason: "deregistration needs a package path".to_string(),
            });
        }
        if self.deregistrations.iter().any(|(p, _)| p == package) {
            return Ok(());
        }
        self.deregistrations
            .push((package.to_string(), self.entries.len()));
        tracing::debug!(package, at = self.entries.len(), "queued deregistration");
        Ok(())
    }

    /// Identify the consumer's own package so its entries (and entries of
    /// its submodules) resolve as local.
    pub fn set_main_module(&mut self, module: &str) {
        self.main_module = Some(module.to_string());
    }

    /// Whether resolution has run.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    /// Resolve the registry: apply deregistrations, reclassify local
    /// entries, and reject name conflicts. Runs the computation once;
    /// later calls return the same result.
    pub fn resolve(&mut self) -> Result<Resolution> {
        if let Some(resolution) = &self.resolved {
            return Ok(resolution.clone());
        }

        let mut entries: Vec<ResolvedEntry> = Vec::with_capacity(self.entries.len());
        for (index, reg) in self.entries.iter().enumerate() {
            let removed = self
                .deregistrations
                .iter()
                .any(|(package, at)| index < *at && reg.source == *package);
            if removed {
                continue;
            }
            let source = if self.is_main_module(&reg.source) {
                String::new()
            } else {
                reg.source.clone()
            };
            entries.push(ResolvedEntry {
                member: reg.entry.clone(),
                source,
                source_file: reg.source_file.clone(),
            });
        }

        let entries = dedup_by_name(entries)?;

        let mut deregistered = Vec::new();
        for (package, _) in &self.deregistrations {
            if !deregistered.contains(package) {
                deregistered.push(package.clone());
            }
        }

        let resolution = Resolution {
            entries,
            deregistered,
        };
        self.resolved = Some(resolution.clone());
        Ok(resolution)
    }

    fn is_main_module(&self, source: &str) -> bool {
        match &self.main_module {
            Some(main) => {
                source == main || source.strip_prefix(main.as_str()).is_some_and(|rest| {
                    rest.starts_with("::")
                })
            }
            None => false,
        }
    }
}

/// Collapse duplicate CLI names: a later entry from the same source
/// replaces the earlier one in place; the same name from two different
/// sources is a conflict.
fn dedup_by_name(entries: Vec<ResolvedEntry>) -> Result<Vec<ResolvedEntry>> {
    let mut out: Vec<ResolvedEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        let name = entry.member.name().to_string();
        match out.iter().position(|e| e.member.name() == name) {
            Some(i) if out[i].source == entry.source => out[i] = entry,
            Some(i) => {
                return Err(TargError::NameConflict {
                    name,
                    first: display_source(&out[i].source),
                    second: display_source(&entry.source),
                });
            }
            None => out.push(entry),
        }
    }
    Ok(out)
}

fn display_source(source: &str) -> String {
    if source.is_empty() {
        "local".to_string()
    } else {
        source.to_string()
    }
}

/// The process-wide registry backing the convenience functions below.
static GLOBAL: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(Registry::new()));

/// Register entries with the process-wide registry.
pub fn register<I>(entries: I)
where
    I: IntoIterator<Item = Member>,
{
    GLOBAL.lock().register(entries);
}

/// Register entries with detected attribution (used by
/// [`register_targets!`](crate::register_targets)).
pub fn register_from<I>(source: &str, source_file: &str, entries: I)
where
    I: IntoIterator<Item = Member>,
{
    GLOBAL.lock().register_from(source, source_file, entries);
}

/// Deregister a package from the process-wide registry.
pub fn deregister(package: &str) -> Result<()> {
    GLOBAL.lock().deregister(package)
}

/// Identify the consumer's own package on the process-wide registry.
pub fn set_main_module(module: &str) {
    GLOBAL.lock().set_main_module(module);
}

/// Resolve the process-wide registry.
pub fn resolve() -> Result<Resolution> {
    GLOBAL.lock().resolve()
}

/// Register targets/groups with the process-wide registry, stamping the
/// calling module as the origin of entries that do not declare one.
///
/// ```ignore
/// targ::register_targets![build, test, GroupSpec::new("ci", members)];
/// ```
#[macro_export]
macro_rules! register_targets {
    ($($entry:expr),+ $(,)?) => {
        $crate::registry::register_from(
            module_path!(),
            file!(),
            vec![$($crate::target::Member::from($entry)),+],
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetSpec;

    fn target(name: &str, source: &str) -> Member {
        let mut b = TargetSpec::builder(name).shell("true");
        if !source.is_empty() {
            b = b.source(source);
        }
        Member::Target(b.build().unwrap())
    }

    #[test]
    fn test_deregistration_scope() {
        let mut reg = Registry::new();
        reg.register([target("lint", "pkg-a"), target("fmt", "pkg-a")]);
        reg.deregister("pkg-a").unwrap();
        reg.register([target("lint", "pkg-a")]);

        let resolution = reg.resolve().unwrap();
        let names: Vec<_> = resolution
            .entries
            .iter()
            .map(|e| e.member.name())
            .collect();
        assert_eq!(names, vec!["lint"]);
        assert_eq!(resolution.deregistered, vec!["pkg-a".to_string()]);
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let mut reg = Registry::new();
        reg.register([target("lint", "pkg-a")]);
        reg.deregister("pkg-a").unwrap();
        reg.deregister("pkg-a").unwrap();
        reg.register([target("fmt", "pkg-a")]);

        let resolution = reg.resolve().unwrap();
        // Idempotent: the second call did not move the scope boundary, so
        // fmt (registered after the first call) survives.
        let names: Vec<_> = resolution
            .entries
            .iter()
            .map(|e| e.member.name())
            .collect();
        assert_eq!(names, vec!["fmt"]);
        assert_eq!(resolution.deregistered.len(), 1);
    }

    #[test]
    fn test_deregister_after_resolve_fails() {
        let mut reg = Registry::new();
        reg.register([target("lint", "pkg-a")]);
        reg.resolve().unwrap();
        let err = reg.deregister("pkg-a").unwrap_err();
        assert!(matches!(err, TargError::PostResolutionDeregister { .. }));
    }

    #[test]
    fn test_deregister_empty_path_fails() {
        let mut reg = Registry::new();
        assert!(matches!(
            reg.deregister(""),
            Err(TargError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let mut reg = Registry::new();
        reg.register([target("build", "")]);
        let first = reg.resolve().unwrap();
        let second = reg.resolve().unwrap();
        assert_eq!(first.entries.len(), second.entries.len());
        assert!(reg.is_resolved());
    }

    #[test]
    fn test_main_module_reclassified_local() {
        let mut reg = Registry::new();
        reg.set_main_module("myapp");
        reg.register([target("build", "myapp::tasks"), target("lint", "other")]);

        let resolution = reg.resolve().unwrap();
        assert_eq!(resolution.entries[0].source, "");
        assert_eq!(resolution.entries[1].source, "other");
    }

    #[test]
    fn test_name_conflict_across_sources() {
        let mut reg = Registry::new();
        reg.register([target("lint", "pkg-a"), target("lint", "pkg-b")]);
        let err = reg.resolve().unwrap_err();
        assert!(matches!(err, TargError::NameConflict { .. }));
        assert!(err.to_string().contains("pkg-a"));
        assert!(err.to_string().contains("pkg-b"));
    }

    #[test]
    fn test_same_source_rereg_replaces() {
        let mut reg = Registry::new();
        reg.register([target("lint", ""), target("lint", "")]);
        let resolution = reg.resolve().unwrap();
        assert_eq!(resolution.entries.len(), 1);
    }

    #[test]
    fn test_deregister_then_reregister_local() {
        // Scenario: package A registers lint and fmt; the consumer
        // deregisters A and re-registers lint as its own.
        let mut reg = Registry::new();
        reg.set_main_module("myapp");
        reg.register([target("lint", "pkg-a"), target("fmt", "pkg-a")]);
        reg.deregister("pkg-a").unwrap();
        reg.register_from("myapp", "src/main.rs", [target("lint", "")]);

        let resolution = reg.resolve().unwrap();
        assert_eq!(resolution.entries.len(), 1);
        assert_eq!(resolution.entries[0].member.name(), "lint");
        assert_eq!(resolution.entries[0].source, "");
        assert_eq!(resolution.deregistered, vec!["pkg-a".to_string()]);
    }
}
