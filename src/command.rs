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

use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use bytes::{Bytes, BytesMut};

use crate::eval::Evaluator;
use crate::loc::Loc;
use crate::makefile::Makefile;
use crate::rule::BuildRule;
use crate::strutil::{
    WordWriter, basename, dirname, find_end_of_line, trim_left_space,
};
use crate::symtab::{Symbol, intern};
use crate::target::{TargetRef, mtime_is_later};
use crate::var::{VarOrigin, Vars};

/// One concrete command line, ready for the runner.
#[derive(Debug, Clone)]
pub struct Command {
    pub target: Symbol,
    pub cmd: Bytes,
    pub echo: bool,
    pub ignore_error: bool,
    pub loc: Option<Loc>,
}

fn parse_command_prefixes(cmds: Bytes, echo: &mut bool, ignore_error: &mut bool) -> Bytes {
    let mut s = trim_left_space(&cmds);
    while !s.is_empty() {
        match s[0] {
            b'@' => {
                *echo = false;
            }
            b'-' => {
                *ignore_error = true;
            }
            b'+' => {
                // ignore recursion marker
            }
            _ => {
                break;
            }
        }
        s = trim_left_space(&s[1..]);
    }
    cmds.slice_ref(s)
}

/// First-occurrence dedup, preserving order.
fn without_dups(paths: &[Bytes]) -> Vec<Bytes> {
    let mut seen = HashSet::new();
    paths
        .iter()
        .filter(|p| seen.insert((*p).clone()))
        .cloned()
        .collect()
}

fn join_words<I: IntoIterator<Item = Bytes>>(items: I) -> Bytes {
    let mut out = BytesMut::new();
    {
        let mut ww = WordWriter::new(&mut out);
        for item in items {
            ww.write(&item);
        }
    }
    out.freeze()
}

/// One automatic variable plus its `D`/`F` directory/file-part siblings.
fn set_automatic(vars: &Vars, name: &str, paths: Vec<Bytes>) {
    vars.set_simple(
        intern(format!("{name}D")),
        join_words(paths.iter().map(dirname)),
        VarOrigin::Automatic,
    );
    vars.set_simple(
        intern(format!("{name}F")),
        join_words(paths.iter().map(|p| Bytes::copy_from_slice(basename(p)))),
        VarOrigin::Automatic,
    );
    vars.set_simple(intern(name.to_string()), join_words(paths), VarOrigin::Automatic);
}

fn resolved_path(dep: &TargetRef) -> (Bytes, Option<SystemTime>) {
    let d = dep.lock();
    (
        d.vpath_target.clone().unwrap_or_else(|| d.name.as_bytes()),
        d.mtime,
    )
}

/// Prerequisites used by the `$^` family: a single-colon target merges
/// prerequisites contributed by its other rules after the rule's own.
fn merged_prerequisites(target: &TargetRef, rule: &BuildRule) -> Vec<Symbol> {
    let mut prereqs = rule.prerequisites();
    if rule.double_colon() {
        return prereqs;
    }
    let t = target.lock();
    for other in &t.rules {
        if other.same_rule(rule) {
            continue;
        }
        for p in other.prerequisites() {
            if !prereqs.contains(&p) {
                prereqs.push(p);
            }
        }
    }
    prereqs
}

/// Derives `$@ $< $? $^ $+ $| $*` (and `D`/`F` forms). `target_mtime`
/// is the modification time as of the remake decision; prerequisites
/// are deduplicated by resolved path, first occurrence kept.
fn automatic_vars(
    makefile: &Makefile,
    target: &TargetRef,
    rule: &BuildRule,
    prereqs: &[Symbol],
    target_mtime: Option<SystemTime>,
) -> Arc<Vars> {
    let vars = Arc::new(Vars::new());
    let target_path = {
        let t = target.lock();
        t.vpath_target.clone().unwrap_or_else(|| t.name.as_bytes())
    };

    let mut all = Vec::new();
    let mut out_of_date = Vec::new();
    let mut seen = HashSet::new();
    for p in prereqs {
        let dep = makefile.get_target(*p);
        let (path, mtime) = resolved_path(&dep);
        if seen.insert(*p) && mtime_is_later(mtime, target_mtime) {
            out_of_date.push(path.clone());
        }
        all.push(path);
    }
    let order_only: Vec<Bytes> = rule
        .order_only_prerequisites()
        .iter()
        .map(|p| resolved_path(&makefile.get_target(*p)).0)
        .collect();

    set_automatic(&vars, "@", vec![target_path]);
    if let Some(first) = all.first() {
        set_automatic(&vars, "<", vec![first.clone()]);
    }
    set_automatic(&vars, "?", out_of_date);
    set_automatic(&vars, "^", without_dups(&all));
    set_automatic(&vars, "+", all);
    set_automatic(&vars, "|", without_dups(&order_only));
    if let Some(stem) = rule.stem() {
        set_automatic(&vars, "*", vec![stem.clone()]);
    }
    vars
}

/// Expands a rule's recipe into concrete command lines for `target`.
/// One recipe value may expand to several lines; each line re-parses
/// its `@`/`-`/`+` prefixes under the global silent flag.
pub fn eval_commands(
    makefile: &Makefile,
    target: &TargetRef,
    rule: &BuildRule,
    target_mtime: Option<SystemTime>,
) -> Result<Vec<Command>> {
    let prereqs = merged_prerequisites(target, rule);
    let auto = automatic_vars(makefile, target, rule, &prereqs, target_mtime);
    let (name, target_vars) = {
        let t = target.lock();
        (t.name, t.variables.clone())
    };

    let mut ev = Evaluator::with_scopes(makefile, vec![auto, target_vars]);
    ev.loc = rule.loc();

    let mut result = Vec::new();
    for v in rule.commands() {
        if v.loc().is_some() {
            ev.loc = v.loc();
        }
        let buf = ev.resolve_str(v)?;
        let mut global_echo = !makefile.flags.silent;
        let mut global_ignore_error = false;
        let mut cmds = parse_command_prefixes(buf, &mut global_echo, &mut global_ignore_error);
        while !cmds.is_empty() {
            let eol = find_end_of_line(&cmds);
            let mut cmd = eol.line.slice_ref(trim_left_space(&eol.line));
            cmds = eol.rest;

            let mut echo = global_echo;
            let mut ignore_error = global_ignore_error;
            cmd = parse_command_prefixes(cmd, &mut echo, &mut ignore_error);

            if !cmd.is_empty() {
                result.push(Command {
                    target: name,
                    cmd,
                    echo,
                    ignore_error,
                    loc: ev.loc,
                });
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Value;
    use crate::makefile::Flags;
    use crate::target::resolve_deps;
    use std::fs;

    fn sym(s: &str) -> Symbol {
        intern(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn test_parse_command_prefixes() {
        let mut echo = true;
        let mut ignore = false;
        let rest = parse_command_prefixes(Bytes::from_static(b"@-+echo hi"), &mut echo, &mut ignore);
        assert_eq!(rest, "echo hi");
        assert!(!echo);
        assert!(ignore);

        let mut echo = true;
        let mut ignore = false;
        let rest = parse_command_prefixes(Bytes::from_static(b"  echo hi"), &mut echo, &mut ignore);
        assert_eq!(rest, "echo hi");
        assert!(echo);
        assert!(!ignore);
    }

    #[test]
    fn test_without_dups() {
        let paths = vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"a"),
        ];
        assert_eq!(
            without_dups(&paths),
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
    }

    #[test]
    fn test_automatic_variables() {
        let dir = tempfile::tempdir().unwrap();
        let newer = dir.path().join("cmd_auto_new.c");
        let older = dir.path().join("cmd_auto_old.c");
        let out = dir.path().join("cmd_auto.out");
        fs::write(&newer, "n").unwrap();
        fs::write(&older, "o").unwrap();
        fs::write(&out, "t").unwrap();
        filetime::set_file_mtime(&older, filetime::FileTime::from_unix_time(1_000_000, 0)).unwrap();
        filetime::set_file_mtime(&out, filetime::FileTime::from_unix_time(2_000_000, 0)).unwrap();
        filetime::set_file_mtime(&newer, filetime::FileTime::from_unix_time(3_000_000, 0)).unwrap();

        let newer_sym = sym(newer.to_str().unwrap());
        let older_sym = sym(older.to_str().unwrap());
        let out_sym = sym(out.to_str().unwrap());

        let mut makefile = Makefile::new(Flags::default());
        makefile
            .add_rule(
                &[out_sym],
                vec![newer_sym, older_sym, newer_sym],
                vec![],
                vec![Value::list(vec![
                    Value::literal("echo "),
                    Value::sym_ref(intern("?")),
                    Value::literal(" / "),
                    Value::sym_ref(intern("^")),
                    Value::literal(" / "),
                    Value::sym_ref(intern("+")),
                    Value::literal(" / "),
                    Value::sym_ref(intern("<")),
                    Value::literal(" / "),
                    Value::sym_ref(intern("@F")),
                ])],
                false,
                false,
                None,
            )
            .unwrap();
        makefile.finish_parsing().unwrap();
        resolve_deps(&makefile, out_sym, &[], &[], false).unwrap();
        for p in [newer_sym, older_sym] {
            resolve_deps(&makefile, p, &[], &[], false).unwrap();
        }

        let target = makefile.get_target(out_sym);
        let target_mtime = target.lock().mtime;
        let rule = target.lock().rules[0].clone();
        let commands = eval_commands(&makefile, &target, &rule, target_mtime).unwrap();
        assert_eq!(commands.len(), 1);
        let line = String::from_utf8_lossy(&commands[0].cmd).to_string();
        let newer_str = newer.to_str().unwrap();
        let older_str = older.to_str().unwrap();
        let parts: Vec<&str> = line.splitn(6, " / ").collect();
        // $? is only the newer prerequisite, deduplicated.
        assert_eq!(parts[0], format!("echo {newer_str}"));
        // $^ deduplicates, $+ keeps duplicates.
        assert_eq!(parts[1], format!("{newer_str} {older_str}"));
        assert_eq!(parts[2], format!("{newer_str} {older_str} {newer_str}"));
        // $< is the first prerequisite.
        assert_eq!(parts[3], newer_str);
        // $@F is the file part of the target.
        assert_eq!(parts[4], "cmd_auto.out");
    }

    #[test]
    fn test_stem_variable_for_pattern_rule() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cmd_stem_foo.c"), "x").unwrap();

        let mut makefile = Makefile::new(Flags::default());
        makefile
            .add_implicit_rule(
                vec![crate::strutil::Pattern::new(&Bytes::from_static(b"%.o"))],
                vec![crate::strutil::Pattern::new(&Bytes::from_static(b"%.c"))],
                vec![Value::list(vec![
                    Value::literal("echo "),
                    Value::sym_ref(intern("*")),
                ])],
                false,
                None,
            )
            .unwrap();
        makefile.finish_parsing().unwrap();

        let obj = sym(&format!("{}/cmd_stem_foo.o", dir.path().to_str().unwrap()));
        resolve_deps(&makefile, obj, &[], &[], false).unwrap();
        let target = makefile.get_target(obj);
        let rule = target.lock().rules[0].clone();
        let commands = eval_commands(&makefile, &target, &rule, None).unwrap();
        let line = String::from_utf8_lossy(&commands[0].cmd).to_string();
        assert_eq!(line, format!("echo {}/cmd_stem_foo", dir.path().to_str().unwrap()));
    }

    #[test]
    fn test_multi_line_recipe_splits() {
        let mut makefile = Makefile::new(Flags::default());
        let t = sym("/nonexistent/cmd_split");
        makefile
            .add_rule(
                &[t],
                vec![],
                vec![],
                vec![Value::literal("@echo one\n-echo two")],
                false,
                false,
                None,
            )
            .unwrap();
        makefile.finish_parsing().unwrap();
        resolve_deps(&makefile, t, &[], &[], false).unwrap();
        let target = makefile.get_target(t);
        let rule = target.lock().rules[0].clone();
        let commands = eval_commands(&makefile, &target, &rule, None).unwrap();
        assert_eq!(commands.len(), 2);
        // The first prefix applies globally, the second only locally.
        assert_eq!(commands[0].cmd, "echo one");
        assert!(!commands[0].echo);
        assert!(!commands[0].ignore_error);
        assert_eq!(commands[1].cmd, "echo two");
        assert!(!commands[1].echo);
        assert!(commands[1].ignore_error);
    }
}
