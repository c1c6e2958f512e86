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

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::data_error;
use crate::eval::Evaluator;
use crate::expr::Value;
use crate::loc::Loc;
use crate::rule::{BuildRule, PatternRule, PatternRuleInstance, Rule};
use crate::strutil::Pattern;
use crate::symtab::{Symbol, intern};
use crate::target::{Target, TargetRef};
use crate::var::{Var, Vars};

pub static SHELL_SYM: LazyLock<Symbol> = LazyLock::new(|| intern("SHELL"));
pub static VPATH_SYM: LazyLock<Symbol> = LazyLock::new(|| intern("VPATH"));
pub static LIBPATTERNS_SYM: LazyLock<Symbol> = LazyLock::new(|| intern(".LIBPATTERNS"));
pub static PHONY_SYM: LazyLock<Symbol> = LazyLock::new(|| intern(".PHONY"));
pub static NOTPARALLEL_SYM: LazyLock<Symbol> = LazyLock::new(|| intern(".NOTPARALLEL"));

/// Build-wide options, set by the driver before parsing finishes.
#[derive(Debug, Clone)]
pub struct Flags {
    pub jobs: usize,
    pub keep_going: bool,
    pub silent: bool,
    pub dry_run: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            jobs: 1,
            keep_going: false,
            silent: false,
            dry_run: false,
        }
    }
}

/// Process-wide registry for one build: every target, the ordered
/// implicit-rule list, pattern-scoped variables and vpaths, globals, and
/// the global error flag. Rule population happens before
/// `finish_parsing`; resolution and building only after.
pub struct Makefile {
    targets: Mutex<HashMap<Symbol, TargetRef>>,
    pub implicit_rules: Vec<Arc<PatternRule>>,
    pattern_vars: Vec<(Pattern, Arc<Vars>)>,
    pattern_vpaths: Vec<(Pattern, Vec<Bytes>)>,
    pub globals: Vars,
    pub flags: Flags,
    phony: HashSet<Symbol>,
    included: Vec<(Symbol, bool)>,
    first_target: Option<Symbol>,
    parsing_finished: bool,
    error: AtomicBool,
}

impl Makefile {
    pub fn new(flags: Flags) -> Makefile {
        Makefile {
            targets: Mutex::new(HashMap::new()),
            implicit_rules: Vec::new(),
            pattern_vars: Vec::new(),
            pattern_vpaths: Vec::new(),
            globals: Vars::new(),
            flags,
            phony: HashSet::new(),
            included: Vec::new(),
            first_target: None,
            parsing_finished: false,
            error: AtomicBool::new(false),
        }
    }

    pub fn parsing_finished(&self) -> bool {
        self.parsing_finished
    }

    pub fn error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    pub fn set_error(&self) {
        self.error.store(true, Ordering::SeqCst);
    }

    pub fn clear_error(&self) {
        self.error.store(false, Ordering::SeqCst);
    }

    /// Normalizes a target name: trailing slashes are stripped (a bare
    /// "/" stays). Wildcards must already be expanded by the parser.
    pub fn target_name(name: &[u8]) -> Symbol {
        let mut n = name;
        while n.len() > 1 && n.ends_with(b"/") {
            n = &n[..n.len() - 1];
        }
        debug_assert!(!n.is_empty(), "empty target name");
        debug_assert!(
            !n.iter().any(|c| matches!(c, b'*' | b'?' | b'[')),
            "wildcards should have been expanded by the parser: '{}'",
            String::from_utf8_lossy(n)
        );
        intern(Bytes::copy_from_slice(n))
    }

    fn normalize(name: Symbol) -> Symbol {
        let bytes = name.as_bytes();
        if bytes.len() > 1 && bytes.ends_with(b"/") {
            Self::target_name(&bytes)
        } else {
            name
        }
    }

    /// Idempotent registry lookup/creation: one node per distinct name
    /// for the lifetime of the build.
    pub fn get_target(&self, name: Symbol) -> TargetRef {
        let name = Self::normalize(name);
        let mut targets = self.targets.lock();
        targets
            .entry(name)
            .or_insert_with(|| Target::new(name))
            .clone()
    }

    /// Like `get_target`, also marking the name as mentioned in the
    /// makefile text (a goal or prerequisite), not merely synthesized.
    pub fn get_explicit_target(&self, name: Symbol) -> TargetRef {
        let target = self.get_target(name);
        target.lock().explicit = true;
        target
    }

    fn lookup_target(&self, name: Symbol) -> Option<TargetRef> {
        self.targets.lock().get(&name).cloned()
    }

    fn note_first_target(&mut self, name: Symbol) {
        if self.first_target.is_none() && !is_special_target(&name) {
            self.first_target = Some(name);
        }
    }

    /// One rule statement: a shared `Rule` attached to every listed
    /// target. Targets and prerequisites become explicit.
    pub fn add_rule(
        &mut self,
        targets: &[Symbol],
        prerequisites: Vec<Symbol>,
        order_only_prerequisites: Vec<Symbol>,
        cmds: Vec<Arc<Value>>,
        double_colon: bool,
        weak: bool,
        loc: Option<Loc>,
    ) -> Result<()> {
        assert!(!self.parsing_finished);
        let rule = Rule::new(
            prerequisites,
            order_only_prerequisites,
            cmds,
            double_colon,
            weak,
            loc,
        );
        for p in rule.prerequisites.iter().chain(&rule.order_only_prerequisites) {
            let _ = self.get_explicit_target(*p);
        }
        for t in targets {
            let name = Self::normalize(*t);
            let target = self.get_explicit_target(name);
            target.lock().add_rule(BuildRule::Explicit(rule.clone()))?;
            self.note_first_target(name);
        }
        Ok(())
    }

    /// A static pattern rule: every listed target gets its own
    /// stem-bound instance of the pattern. A target which doesn't match
    /// the pattern is a structural error.
    pub fn add_static_pattern_rule(
        &mut self,
        targets: &[Symbol],
        target_pattern: Pattern,
        prereq_patterns: Vec<Pattern>,
        cmds: Vec<Arc<Value>>,
        double_colon: bool,
        loc: Option<Loc>,
    ) -> Result<()> {
        assert!(!self.parsing_finished);
        if !target_pattern.is_pattern() {
            data_error!(loc, "*** target pattern contains no '%'.");
        }
        let prule = PatternRule::new(
            vec![target_pattern.clone()],
            prereq_patterns,
            cmds,
            double_colon,
            loc,
        );
        for t in targets {
            let name = Self::normalize(*t);
            let Some(stem) = target_pattern.match_stem(&name.as_bytes()) else {
                data_error!(loc, "*** target '{name}' doesn't match the target pattern");
            };
            let instance = PatternRuleInstance::new(prule.clone(), Bytes::new(), stem, false);
            for p in instance.prerequisites() {
                let _ = self.get_explicit_target(p);
            }
            let target = self.get_explicit_target(name);
            target
                .lock()
                .add_rule(BuildRule::Implicit(Arc::new(instance)))?;
            self.note_first_target(name);
        }
        Ok(())
    }

    /// An implicit rule definition; appended in declaration order, which
    /// is the search order.
    pub fn add_implicit_rule(
        &mut self,
        target_patterns: Vec<Pattern>,
        prerequisite_patterns: Vec<Pattern>,
        cmds: Vec<Arc<Value>>,
        double_colon: bool,
        loc: Option<Loc>,
    ) -> Result<()> {
        assert!(!self.parsing_finished);
        if target_patterns.is_empty() {
            data_error!(loc, "*** missing target pattern.");
        }
        for p in &target_patterns {
            if !p.is_pattern() {
                data_error!(loc, "*** target pattern contains no '%'.");
            }
        }
        self.implicit_rules.push(PatternRule::new(
            target_patterns,
            prerequisite_patterns,
            cmds,
            double_colon,
            loc,
        ));
        Ok(())
    }

    pub fn define_variable(&self, sym: Symbol, var: Var) {
        self.globals.assign(sym, var);
    }

    pub fn set_pattern_variable(&mut self, pattern: Pattern, sym: Symbol, var: Var) {
        if let Some((_, vars)) = self.pattern_vars.iter().find(|(p, _)| *p == pattern) {
            vars.assign(sym, var);
            return;
        }
        let vars = Arc::new(Vars::new());
        vars.assign(sym, var);
        self.pattern_vars.push((pattern, vars));
    }

    /// Pattern-scoped variable sets whose pattern matches `name`, in
    /// declaration order.
    pub fn pattern_variables_for(&self, name: &[u8]) -> Vec<Arc<Vars>> {
        self.pattern_vars
            .iter()
            .filter(|(p, _)| p.match_stem(name).is_some())
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn add_vpath(&mut self, pattern: Pattern, dirs: Vec<Bytes>) {
        self.pattern_vpaths.push((pattern, dirs));
    }

    pub fn clear_vpath(&mut self, pattern: &Pattern) {
        self.pattern_vpaths.retain(|(p, _)| p != pattern);
    }

    pub fn clear_all_vpaths(&mut self) {
        self.pattern_vpaths.clear();
    }

    /// Search directories for `target`: the `VPATH` global split on
    /// blanks and `:`, then matching `vpath` directives; first
    /// occurrence kept.
    pub fn get_vpath(&self, target: &[u8]) -> Result<Vec<Bytes>> {
        let mut dirs: Vec<Bytes> = Vec::new();
        let mut ev = Evaluator::new(self);
        if let Some(words) = ev.resolve_var_split(*VPATH_SYM)? {
            for w in words {
                for d in w.split(|c| *c == b':') {
                    if !d.is_empty() {
                        dirs.push(Bytes::copy_from_slice(d));
                    }
                }
            }
        }
        for (pattern, pdirs) in &self.pattern_vpaths {
            if pattern.match_stem(target).is_some() {
                dirs.extend(pdirs.iter().cloned());
            }
        }
        let mut seen = HashSet::new();
        dirs.retain(|d| seen.insert(d.clone()));
        Ok(dirs)
    }

    pub fn add_included_makefile(&mut self, path: Symbol, required: bool) {
        self.included.push((path, required));
    }

    pub fn included_makefiles(&self) -> &[(Symbol, bool)] {
        &self.included
    }

    pub fn is_phony(&self, name: Symbol) -> bool {
        self.phony.contains(&name)
    }

    pub fn default_goal(&self) -> Option<Symbol> {
        self.first_target
    }

    /// The shell commands run under; `/bin/sh` unless `SHELL` is set.
    pub fn shell(&self) -> Bytes {
        let mut ev = Evaluator::new(self);
        let mut buf = BytesMut::new();
        if ev.eval_var(*SHELL_SYM, &mut buf).is_ok() && !buf.is_empty() {
            buf.freeze()
        } else {
            Bytes::from_static(b"/bin/sh")
        }
    }

    /// Freezes the registry: harvests `.PHONY`, honors `.NOTPARALLEL`.
    /// Resolution and building are only valid afterwards.
    pub fn finish_parsing(&mut self) -> Result<()> {
        assert!(!self.parsing_finished);
        if let Some(target) = self.lookup_target(*PHONY_SYM) {
            let mut phony = Vec::new();
            {
                let t = target.lock();
                for r in &t.rules {
                    phony.extend(r.prerequisites());
                }
            }
            self.phony.extend(phony);
        }
        if let Some(target) = self.lookup_target(*NOTPARALLEL_SYM)
            && !target.lock().rules.is_empty()
        {
            self.flags.jobs = 1;
        }
        self.parsing_finished = true;
        Ok(())
    }
}

pub fn is_special_target(output: &Symbol) -> bool {
    let s = output.as_bytes();
    s.starts_with(b".") && !s[1..].starts_with(b".")
}
