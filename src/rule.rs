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

use std::fmt::Debug;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::expr::Value;
use crate::loc::Loc;
use crate::strutil::Pattern;
use crate::symtab::{Symbol, intern};

/// How a prerequisite participates in its dependent's build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    /// Built, and a newer modification time forces a rebuild.
    Normal,
    /// Built; a failure forces a rebuild of the dependent instead of
    /// counting as a hard error.
    Weak,
    /// Built, but never makes the dependent out of date.
    OrderOnly,
}

/// An explicit rule: prerequisites and commands shared by one or more
/// named targets, exactly as a makefile statement defined them.
#[derive(Clone)]
pub struct Rule {
    pub prerequisites: Vec<Symbol>,
    pub order_only_prerequisites: Vec<Symbol>,
    pub double_colon: bool,
    pub weak_deps: bool,
    pub cmds: Vec<Arc<Value>>,
    pub loc: Option<Loc>,
}

impl Rule {
    pub fn new(
        prerequisites: Vec<Symbol>,
        order_only_prerequisites: Vec<Symbol>,
        cmds: Vec<Arc<Value>>,
        double_colon: bool,
        weak_deps: bool,
        loc: Option<Loc>,
    ) -> Arc<Rule> {
        Arc::new(Rule {
            prerequisites,
            order_only_prerequisites,
            double_colon,
            weak_deps,
            cmds,
            loc,
        })
    }
}

impl Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "inputs={:?}", self.prerequisites)?;
        if !self.order_only_prerequisites.is_empty() {
            write!(f, " order_only_inputs={:?}", self.order_only_prerequisites)?;
        }
        if self.double_colon {
            write!(f, " is_double_colon")?;
        }
        if self.weak_deps {
            write!(f, " is_weak")?;
        }
        if !self.cmds.is_empty() {
            write!(f, " cmds={:?}", self.cmds)?;
        }
        Ok(())
    }
}

/// An implicit rule: target and prerequisite templates not yet bound to
/// a stem. Lives in the makefile's ordered rule list for the whole
/// build; declaration order is the search order.
pub struct PatternRule {
    pub target_patterns: Vec<Pattern>,
    pub prerequisite_patterns: Vec<Pattern>,
    pub double_colon: bool,
    pub cmds: Vec<Arc<Value>>,
    pub loc: Option<Loc>,
}

impl PatternRule {
    pub fn new(
        target_patterns: Vec<Pattern>,
        prerequisite_patterns: Vec<Pattern>,
        cmds: Vec<Arc<Value>>,
        double_colon: bool,
        loc: Option<Loc>,
    ) -> Arc<PatternRule> {
        Arc::new(PatternRule {
            target_patterns,
            prerequisite_patterns,
            double_colon,
            cmds,
            loc,
        })
    }

    /// True when a non-match-any target pattern of this rule matches
    /// `file`. Such a match suppresses single-colon match-any candidates
    /// of every rule during the implicit search.
    pub fn has_specific_match(&self, file: &[u8]) -> bool {
        self.target_patterns
            .iter()
            .any(|p| !p.is_match_any() && p.match_stem(file).is_some())
    }

    /// Every target pattern of `rule` which might produce `dir + file`,
    /// bound to its stem, in declaration order. A pattern is tried
    /// against the whole name first, then against the file part with
    /// the directory carried separately.
    pub fn matches_for(
        rule: &Arc<PatternRule>,
        dir: &Bytes,
        file: &Bytes,
        skip_single_colon_match_any: bool,
    ) -> Vec<PatternRuleInstance> {
        let full = if dir.is_empty() {
            file.clone()
        } else {
            let mut b = BytesMut::with_capacity(dir.len() + file.len());
            b.put_slice(dir);
            b.put_slice(file);
            b.freeze()
        };
        let mut r = Vec::new();
        for p in &rule.target_patterns {
            if p.is_match_any() {
                if skip_single_colon_match_any && !rule.double_colon {
                    continue;
                }
                r.push(PatternRuleInstance::new(
                    rule.clone(),
                    dir.clone(),
                    file.clone(),
                    true,
                ));
            } else if let Some(stem) = p.match_stem(&full) {
                r.push(PatternRuleInstance::new(rule.clone(), Bytes::new(), stem, false));
            } else if let Some(stem) = p.match_stem(file) {
                r.push(PatternRuleInstance::new(rule.clone(), dir.clone(), stem, false));
            }
        }
        r
    }
}

impl Debug for PatternRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "output_patterns={:?} input_patterns={:?}",
            self.target_patterns, self.prerequisite_patterns
        )?;
        if self.double_colon {
            write!(f, " is_double_colon")?;
        }
        Ok(())
    }
}

/// A `PatternRule` bound to a concrete directory and stem. Cheap to
/// create per candidate; discarded unless selected.
#[derive(Clone)]
pub struct PatternRuleInstance {
    pub rule: Arc<PatternRule>,
    pub dir: Bytes,
    pub stem: Bytes,
    pub is_match_any: bool,
}

impl PatternRuleInstance {
    pub fn new(rule: Arc<PatternRule>, dir: Bytes, stem: Bytes, is_match_any: bool) -> Self {
        PatternRuleInstance {
            rule,
            dir,
            stem,
            is_match_any,
        }
    }

    /// Prerequisite templates resolved for this instance's stem.
    pub fn prerequisites(&self) -> Vec<Symbol> {
        self.rule
            .prerequisite_patterns
            .iter()
            .map(|p| intern(p.resolve(&self.dir, &self.stem)))
            .collect()
    }
}

impl Debug for PatternRuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PatternRuleInstance(dir={:?} stem={:?} of {:?})",
            self.dir, self.stem, self.rule
        )
    }
}

/// The two ways a target can know how to build itself, behind one
/// accessor contract.
#[derive(Clone)]
pub enum BuildRule {
    Explicit(Arc<Rule>),
    Implicit(Arc<PatternRuleInstance>),
}

impl BuildRule {
    pub fn prerequisites(&self) -> Vec<Symbol> {
        match self {
            BuildRule::Explicit(r) => r.prerequisites.clone(),
            BuildRule::Implicit(i) => i.prerequisites(),
        }
    }

    pub fn order_only_prerequisites(&self) -> Vec<Symbol> {
        match self {
            BuildRule::Explicit(r) => r.order_only_prerequisites.clone(),
            BuildRule::Implicit(_) => Vec::new(),
        }
    }

    pub fn double_colon(&self) -> bool {
        match self {
            BuildRule::Explicit(r) => r.double_colon,
            BuildRule::Implicit(i) => i.rule.double_colon,
        }
    }

    pub fn commands(&self) -> &[Arc<Value>] {
        match self {
            BuildRule::Explicit(r) => &r.cmds,
            BuildRule::Implicit(i) => &i.rule.cmds,
        }
    }

    pub fn weak_deps(&self) -> bool {
        match self {
            BuildRule::Explicit(r) => r.weak_deps,
            BuildRule::Implicit(_) => false,
        }
    }

    pub fn loc(&self) -> Option<Loc> {
        match self {
            BuildRule::Explicit(r) => r.loc,
            BuildRule::Implicit(i) => i.rule.loc,
        }
    }

    pub fn stem(&self) -> Option<&Bytes> {
        match self {
            BuildRule::Explicit(_) => None,
            BuildRule::Implicit(i) => Some(&i.stem),
        }
    }

    pub fn pattern_rule(&self) -> Option<&Arc<PatternRule>> {
        match self {
            BuildRule::Explicit(_) => None,
            BuildRule::Implicit(i) => Some(&i.rule),
        }
    }

    /// Identity, not structural equality: the same shared rule object.
    pub fn same_rule(&self, other: &BuildRule) -> bool {
        match (self, other) {
            (BuildRule::Explicit(a), BuildRule::Explicit(b)) => Arc::ptr_eq(a, b),
            (BuildRule::Implicit(a), BuildRule::Implicit(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Debug for BuildRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildRule::Explicit(r) => write!(f, "{r:?}"),
            BuildRule::Implicit(i) => write!(f, "{i:?}"),
        }
    }
}
