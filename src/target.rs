/*
Copyright 2025 Google LLC

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

     https://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::eval::Evaluator;
use crate::exec::MakeCallback;
use crate::fileutil::get_timestamp;
use crate::log;
use crate::makefile::{LIBPATTERNS_SYM, Makefile};
use crate::rule::{BuildRule, PatternRule};
use crate::strutil::{Pattern, concat_dir, split_dir_file};
use crate::symtab::Symbol;
use crate::var::Vars;
use crate::{data_error, resolution_error};

pub type TargetRef = Arc<Mutex<Target>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MakeState {
    None,
    Working,
    Finished,
}

/// Is the dependency's modification time later than the target's? A
/// missing time on either side forces a rebuild: a `None` dependency
/// was (re)made this run or never existed, a `None` target does not
/// exist yet.
pub fn mtime_is_later(dep: Option<SystemTime>, target: Option<SystemTime>) -> bool {
    match (dep, target) {
        (None, _) => true,
        (_, None) => true,
        (Some(d), Some(t)) => d > t,
    }
}

/// The mutable per-name build node. Created lazily on first registry
/// lookup and cached for the lifetime of the makefile run.
pub struct Target {
    pub name: Symbol,
    pub rules: Vec<BuildRule>,
    /// The resolved on-disk path; `None` until vpath resolution ran.
    pub vpath_target: Option<Bytes>,
    /// Modification time of `vpath_target`; `None` = does not exist.
    pub mtime: Option<SystemTime>,
    /// Was this name ever mentioned as a goal or prerequisite in the
    /// makefile text, rather than only synthesized during resolution?
    pub explicit: bool,
    pub variables: Arc<Vars>,
    pub was_remade: bool,
    pub(crate) state: MakeState,
    pub(crate) make_error: bool,
    pub(crate) did_anything: bool,
    pub(crate) callbacks: Vec<MakeCallback>,
}

impl Target {
    pub fn new(name: Symbol) -> TargetRef {
        Arc::new(Mutex::new(Target {
            name,
            rules: Vec::new(),
            vpath_target: None,
            mtime: None,
            explicit: false,
            variables: Arc::new(Vars::new()),
            was_remade: false,
            state: MakeState::None,
            make_error: false,
            did_anything: false,
            callbacks: Vec::new(),
        }))
    }

    pub fn state(&self) -> MakeState {
        self.state
    }

    pub fn make_error(&self) -> bool {
        self.make_error
    }

    pub fn did_anything(&self) -> bool {
        self.did_anything
    }

    pub fn is_double_colon(&self) -> bool {
        self.rules.first().is_some_and(BuildRule::double_colon)
    }

    pub fn rules_with_commands(&self) -> usize {
        self.rules
            .iter()
            .filter(|r| !r.commands().is_empty())
            .count()
    }

    /// Attaches a parser-defined rule, validating colon-kind consistency
    /// and, for static-pattern instances, the pattern match.
    pub fn add_rule(&mut self, rule: BuildRule) -> Result<()> {
        if let Some(first) = self.rules.first()
            && first.double_colon() != rule.double_colon()
        {
            data_error!(
                rule.loc(),
                "*** target file '{}' has both : and :: entries.",
                self.name
            );
        }
        if let BuildRule::Implicit(instance) = &rule {
            if instance.rule.target_patterns.len() != 1 {
                data_error!(rule.loc(), "*** multiple target patterns.");
            }
            if instance.rule.target_patterns[0]
                .match_stem(&self.name.as_bytes())
                .is_none()
            {
                data_error!(
                    rule.loc(),
                    "*** target '{}' doesn't match the target pattern",
                    self.name
                );
            }
        }
        self.rules.push(rule);
        Ok(())
    }

    /// Bookkeeping when the target is actually rebuilt: drop any vpath
    /// prefix and force dependents to consider us newer.
    pub fn being_remade(&mut self) {
        self.vpath_target = Some(self.name.as_bytes());
        self.mtime = None;
        self.was_remade = true;
    }

    /// Resolve the on-disk path of this target: phony targets never
    /// resolve to a file, `-l` names search `.LIBPATTERNS`, everything
    /// else searches the name and then each vpath directory.
    pub fn resolve_vpath(&mut self, makefile: &Makefile) -> Result<()> {
        if self.vpath_target.is_some() {
            return Ok(());
        }
        let name = self.name.as_bytes();
        if makefile.is_phony(self.name) {
            self.vpath_target = Some(name);
            self.mtime = None;
            return Ok(());
        }

        if name.starts_with(b"-l") && self.resolve_library(makefile, &name)? {
            return Ok(());
        }

        let mut search = vec![name.clone()];
        if !name.starts_with(b"/") {
            for dir in makefile.get_vpath(&name)? {
                search.push(concat_dir(&dir, &name));
            }
        }
        for candidate in search {
            if let Some(mtime) = get_timestamp(&candidate)? {
                log!(
                    "vpath: '{}' found at '{}'",
                    self.name,
                    String::from_utf8_lossy(&candidate)
                );
                self.vpath_target = Some(candidate);
                self.mtime = Some(mtime);
                return Ok(());
            }
        }
        self.vpath_target = Some(name);
        self.mtime = None;
        Ok(())
    }

    /// `-l<name>` prerequisites search `.LIBPATTERNS` across the vpath
    /// directories. Returns false to fall through to the ordinary
    /// search when `.LIBPATTERNS` is unset or empty.
    fn resolve_library(&mut self, makefile: &Makefile, name: &Bytes) -> Result<bool> {
        let mut ev = Evaluator::new(makefile);
        let Some(libpatterns) = ev.resolve_var_split(*LIBPATTERNS_SYM)? else {
            return Ok(false);
        };
        let patterns: Vec<Pattern> = libpatterns.iter().map(Pattern::new).collect();
        if patterns.is_empty() {
            return Ok(false);
        }
        let stem = name.slice(2..);
        let mut search_dirs = vec![Bytes::new()];
        search_dirs.extend(makefile.get_vpath(name)?);
        for lp in &patterns {
            if !lp.is_pattern() {
                data_error!(None, "*** .LIBPATTERNS contains a non-pattern");
            }
            let libname = lp.resolve(b"", &stem);
            for dir in &search_dirs {
                let libpath = concat_dir(dir, &libname);
                if let Some(mtime) = get_timestamp(&libpath)? {
                    self.vpath_target = Some(libpath);
                    self.mtime = Some(mtime);
                    return Ok(true);
                }
            }
        }
        self.vpath_target = Some(name.clone());
        self.mtime = None;
        Ok(true)
    }
}

/// Recursively discover rules for `name` and (when `recursive`) its
/// prerequisites. `target_stack` is the chain of dependents being
/// resolved; re-entering it is a dependency cycle. `rule_stack` blocks
/// an implicit-rule chain from using the same pattern rule twice.
pub fn resolve_deps(
    makefile: &Makefile,
    name: Symbol,
    target_stack: &[Symbol],
    rule_stack: &[Arc<PatternRule>],
    recursive: bool,
) -> Result<()> {
    assert!(makefile.parsing_finished());
    if target_stack.contains(&name) {
        let chain = target_stack
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" -> ");
        resolution_error!(None, "Recursive dependency: {chain} -> {name}");
    }
    let target = makefile.get_target(name);
    let mut stack = target_stack.to_vec();
    stack.push(name);

    log!("Considering target '{name}'");

    {
        let mut t = target.lock();
        t.resolve_vpath(makefile)?;
        // A single-colon target takes commands from at most one rule.
        if !t.rules.is_empty() && !t.is_double_colon() && t.rules_with_commands() > 1 {
            data_error!(None, "Target '{name}' has multiple rules with commands.");
        }
    }

    // The implicit search examines and builds other targets; no lock is
    // held across it.
    let needs_implicit = target.lock().rules_with_commands() == 0;
    if needs_implicit {
        resolve_implicit_rule(makefile, &target, &stack, rule_stack)?;
    }

    {
        let t = target.lock();
        if t.rules.is_empty() && t.mtime.is_none() {
            // A mentioned target with an empty rule is a force sentinel;
            // one with no rule at all and no file cannot be made.
            if let Some(parent) = target_stack.last() {
                resolution_error!(None, "*** No rule to make target '{name}', needed by '{parent}'.");
            }
            resolution_error!(None, "*** No rule to make target '{name}'.");
        }
    }

    if recursive {
        let rules = target.lock().rules.clone();
        for r in &rules {
            let mut new_rule_stack = rule_stack.to_vec();
            if let Some(pr) = r.pattern_rule() {
                new_rule_stack.push(pr.clone());
            }
            for p in r
                .prerequisites()
                .into_iter()
                .chain(r.order_only_prerequisites())
            {
                let dep = makefile.get_target(p);
                let explicit = dep.lock().explicit;
                if explicit {
                    continue;
                }
                resolve_deps(makefile, p, &stack, &new_rule_stack, true)?;
            }
        }
    }

    {
        let t = target.lock();
        let name_bytes = t.name.as_bytes();
        for vars in makefile.pattern_variables_for(&name_bytes) {
            t.variables.merge_from(&vars);
        }
    }

    Ok(())
}

/// Implicit-rule search: two passes over the candidates in declaration
/// order. Pass one accepts a candidate whose prerequisites are all
/// explicit or on disk; a failing terminal (double-colon) candidate is
/// discarded outright, the rest retry in pass two with recursive
/// prerequisite resolution. The first fully-resolved candidate wins and
/// the search stops; there is no backtracking across that choice.
pub fn resolve_implicit_rule(
    makefile: &Makefile,
    target: &TargetRef,
    target_stack: &[Symbol],
    rule_stack: &[Arc<PatternRule>],
) -> Result<()> {
    let name = target.lock().name;
    let name_bytes = name.as_bytes();
    let (dir, file) = split_dir_file(&name_bytes);

    let has_specific_match = makefile
        .implicit_rules
        .iter()
        .any(|r| r.has_specific_match(&file));

    let mut candidates = Vec::new();
    for r in &makefile.implicit_rules {
        if rule_stack.iter().any(|s| Arc::ptr_eq(s, r)) {
            log!("{name}: Avoiding implicit rule recursion");
            continue;
        }
        if r.cmds.is_empty() {
            continue;
        }
        candidates.extend(PatternRule::matches_for(r, &dir, &file, has_specific_match));
    }

    let mut retry = Vec::new();

    for c in candidates {
        let mut dep_failed = None;
        for p in c.prerequisites() {
            let (explicit, mtime) = if p == name {
                let t = target.lock();
                (t.explicit, t.mtime)
            } else {
                let dep = makefile.get_target(p);
                let mut dep = dep.lock();
                dep.resolve_vpath(makefile)?;
                (dep.explicit, dep.mtime)
            };
            if !explicit && mtime.is_none() {
                dep_failed = Some(p);
                break;
            }
        }
        if let Some(failed) = dep_failed {
            if c.rule.double_colon {
                log!("{name}: Rejecting terminal rule because prerequisite '{failed}' does not exist");
            } else {
                retry.push(c);
            }
            continue;
        }
        log!("Selecting implicit rule for target '{name}'");
        target.lock().rules.push(BuildRule::Implicit(Arc::new(c)));
        return Ok(());
    }

    // Second pass: prerequisites may themselves be made by chained
    // implicit rules, but never by reusing the rule under consideration.
    for c in retry {
        let mut new_rule_stack = rule_stack.to_vec();
        new_rule_stack.push(c.rule.clone());
        let mut dep_failed = None;
        for p in c.prerequisites() {
            if let Err(err) = resolve_deps(makefile, p, target_stack, &new_rule_stack, true) {
                log!("{name}: prerequisite '{p}' cannot be made: {err}");
                dep_failed = Some(p);
                break;
            }
        }
        if let Some(failed) = dep_failed {
            log!("{name}: Rejecting implicit rule because prerequisite '{failed}' could not be made");
            continue;
        }
        log!("Selecting chained implicit rule for target '{name}'");
        target.lock().rules.push(BuildRule::Implicit(Arc::new(c)));
        return Ok(());
    }

    log!("{name}: Failed to find an implicit rule");
    Ok(())
}
