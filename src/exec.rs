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

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;

use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::command::{self, Command};
use crate::fileutil::{RedirectStderr, run_command};
use crate::makefile::Makefile;
use crate::resolution_error;
use crate::rule::{BuildRule, DepKind};
use crate::symtab::Symbol;
use crate::target::{MakeState, TargetRef, mtime_is_later, resolve_deps};
use crate::{log, warn};

/// Completion callback of one target's build: `(error, did_anything)`.
pub type MakeCallback = Box<dyn FnOnce(&mut BuildContext, bool, bool)>;
type CommandCallback = Box<dyn FnOnce(&mut BuildContext, bool)>;
type Work = Box<dyn FnOnce(&mut BuildContext)>;

struct FinishedCommand {
    id: u64,
    exit_code: Option<i32>,
    success: bool,
    output: Vec<u8>,
}

/// The build's single control thread: a deferred-work queue plus a
/// bounded set of in-flight shell commands on worker threads. Every
/// scheduling callback is serialized here; only command execution is
/// parallel, up to the job ceiling.
pub struct BuildContext {
    makefile: Arc<Makefile>,
    jobs: usize,
    queue: VecDeque<Work>,
    pending: HashMap<u64, (Command, CommandCallback)>,
    waiting: VecDeque<(u64, Command)>,
    running: usize,
    next_id: u64,
    tx: Sender<FinishedCommand>,
    rx: Receiver<FinishedCommand>,
    shell: Bytes,
}

impl BuildContext {
    pub fn new(makefile: Arc<Makefile>) -> BuildContext {
        let (tx, rx) = channel();
        let jobs = makefile.flags.jobs.max(1);
        let shell = makefile.shell();
        BuildContext {
            makefile,
            jobs,
            queue: VecDeque::new(),
            pending: HashMap::new(),
            waiting: VecDeque::new(),
            running: 0,
            next_id: 0,
            tx,
            rx,
            shell,
        }
    }

    pub fn makefile(&self) -> &Arc<Makefile> {
        &self.makefile
    }

    pub fn serial(&self) -> bool {
        self.jobs == 1
    }

    pub fn defer(&mut self, f: impl FnOnce(&mut BuildContext) + 'static) {
        self.queue.push_back(Box::new(f));
    }

    /// Echo (unless suppressed) and run one command; `cb` fires back on
    /// the control thread with the final error flag.
    fn run_command(&mut self, cmd: Command, cb: CommandCallback) {
        if cmd.echo {
            println!("{}", String::from_utf8_lossy(&cmd.cmd));
        }
        if self.makefile.flags.dry_run {
            self.defer(move |ctx| cb(ctx, false));
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        if self.running < self.jobs {
            self.spawn(id, cmd.clone());
        } else {
            self.waiting.push_back((id, cmd.clone()));
        }
        let _ = self.pending.insert(id, (cmd, cb));
    }

    fn spawn(&mut self, id: u64, cmd: Command) {
        self.running += 1;
        let tx = self.tx.clone();
        let shell = self.shell.clone();
        let spawned = thread::Builder::new().name("rmake-job".into()).spawn(move || {
            let finished = match run_command(&shell, b"-c", &cmd.cmd, RedirectStderr::Stdout) {
                Ok((status, output)) => FinishedCommand {
                    id,
                    exit_code: status.code(),
                    success: status.success(),
                    output,
                },
                Err(err) => FinishedCommand {
                    id,
                    exit_code: None,
                    success: false,
                    output: format!("{err}\n").into_bytes(),
                },
            };
            let _ = tx.send(finished);
        });
        if spawned.is_err() {
            let _ = self.tx.send(FinishedCommand {
                id,
                exit_code: None,
                success: false,
                output: b"failed to spawn job thread\n".to_vec(),
            });
        }
    }

    /// Drains deferred work and command completions until idle.
    pub fn run(&mut self) {
        loop {
            if let Some(work) = self.queue.pop_front() {
                work(self);
                continue;
            }
            if self.running == 0 {
                break;
            }
            let Ok(finished) = self.rx.recv() else { break };
            self.finish_command(finished);
        }
    }

    fn finish_command(&mut self, finished: FinishedCommand) {
        self.running -= 1;
        if self.running < self.jobs
            && let Some((id, cmd)) = self.waiting.pop_front()
        {
            self.spawn(id, cmd);
        }
        let Some((cmd, cb)) = self.pending.remove(&finished.id) else {
            return;
        };
        print!("{}", String::from_utf8_lossy(&finished.output));
        let _ = std::io::stdout().flush();
        let mut error = !finished.success;
        if error {
            let code = finished.exit_code.unwrap_or(1);
            if cmd.ignore_error {
                warn!("rmake: [{}] Error {} (ignored)", cmd.target, code);
                error = false;
            } else {
                match cmd.loc {
                    Some(loc) => warn!("{}: *** [{}] Error {}", loc, cmd.target, code),
                    None => warn!("rmake: *** [{}] Error {}", cmd.target, code),
                }
            }
        }
        cb(self, error);
    }
}

/// Per-rule task: carries its own dependency countdown and whether
/// commands must run. Dependency resolution is concurrent; commands of
/// one rule run strictly after its own prerequisites completed.
struct RuleContext {
    target: TargetRef,
    rule: Option<BuildRule>,
    deps: Vec<(TargetRef, DepKind)>,
    target_stack: Vec<Symbol>,
    avoid_remake_loop: bool,
    error: bool,
    /// A weak dependency reported an error: rebuild, not fatal.
    remake: bool,
    did_anything: bool,
    deps_remaining: usize,
    resolve_list: VecDeque<(TargetRef, DepKind)>,
    resolve_cb: Option<MakeCallback>,
    run_cb: Option<CommandCallback>,
    commands: VecDeque<Command>,
    running: bool,
}

type RuleContextRef = Arc<Mutex<RuleContext>>;

impl RuleContext {
    fn new(
        target: TargetRef,
        rule: Option<BuildRule>,
        deps: Vec<(TargetRef, DepKind)>,
        target_stack: Vec<Symbol>,
        avoid_remake_loop: bool,
    ) -> RuleContextRef {
        // One extra countdown tick keeps an empty dependency list from
        // completing before every start has been dispatched.
        let deps_remaining = deps.len() + 1;
        Arc::new(Mutex::new(RuleContext {
            target,
            rule,
            deps,
            target_stack,
            avoid_remake_loop,
            error: false,
            remake: false,
            did_anything: false,
            deps_remaining,
            resolve_list: VecDeque::new(),
            resolve_cb: None,
            run_cb: None,
            commands: VecDeque::new(),
            running: false,
        }))
    }
}

fn rule_resolve_deps(rc: &RuleContextRef, ctx: &mut BuildContext, serial: bool, cb: MakeCallback) {
    {
        let mut r = rc.lock();
        r.resolve_cb = Some(cb);
        r.did_anything = false;
    }
    if serial {
        {
            let mut r = rc.lock();
            r.resolve_list = r.deps.clone().into();
        }
        rule_dep_finished_serial(rc.clone(), ctx, false, false);
    } else {
        let tick = rc.clone();
        ctx.defer(move |ctx| rule_dep_finished_parallel(&tick, ctx, false, false));
        let deps = rc.lock().deps.clone();
        for (dep, kind) in deps {
            let rc2 = rc.clone();
            ctx.defer(move |ctx| rule_start_dep_parallel(&rc2, ctx, dep, kind));
        }
    }
}

fn rule_dep_finished_serial(
    rc: RuleContextRef,
    ctx: &mut BuildContext,
    error: bool,
    did_anything: bool,
) {
    let next = {
        let mut r = rc.lock();
        if did_anything {
            r.did_anything = true;
        }
        if error {
            r.error = true;
            if !ctx.makefile.flags.keep_going {
                let cb = r.resolve_cb.take();
                let da = r.did_anything;
                drop(r);
                if let Some(cb) = cb {
                    cb(ctx, true, da);
                }
                return;
            }
        }
        r.resolve_list.pop_front()
    };
    match next {
        Some((dep, kind)) => {
            let stack = rc.lock().target_stack.clone();
            let cbrc = rc.clone();
            ctx.defer(move |ctx| {
                let done: MakeCallback = Box::new(move |ctx, err, da| {
                    if kind == DepKind::Weak {
                        if err {
                            cbrc.lock().remake = true;
                        }
                        rule_dep_finished_serial(cbrc, ctx, false, da);
                    } else {
                        rule_dep_finished_serial(cbrc, ctx, err, da);
                    }
                });
                make_target(ctx, &dep, stack, done, false, true);
            });
        }
        None => {
            let (cb, err, da) = {
                let mut r = rc.lock();
                (r.resolve_cb.take(), r.error, r.did_anything)
            };
            if let Some(cb) = cb {
                cb(ctx, err, da);
            }
        }
    }
}

fn rule_start_dep_parallel(rc: &RuleContextRef, ctx: &mut BuildContext, dep: TargetRef, kind: DepKind) {
    let stack = rc.lock().target_stack.clone();
    let cbrc = rc.clone();
    let done: MakeCallback = Box::new(move |ctx, err, da| {
        if kind == DepKind::Weak {
            if err {
                cbrc.lock().remake = true;
            }
            rule_dep_finished_parallel(&cbrc, ctx, false, da);
        } else {
            rule_dep_finished_parallel(&cbrc, ctx, err, da);
        }
    });
    make_target(ctx, &dep, stack, done, false, true);
}

fn rule_dep_finished_parallel(
    rc: &RuleContextRef,
    ctx: &mut BuildContext,
    error: bool,
    did_anything: bool,
) {
    let done = {
        let mut r = rc.lock();
        if error {
            r.error = true;
        }
        if did_anything {
            r.did_anything = true;
        }
        r.deps_remaining -= 1;
        if r.deps_remaining == 0 {
            Some((r.resolve_cb.take(), r.error, r.did_anything))
        } else {
            None
        }
    };
    if let Some((cb, err, da)) = done
        && let Some(cb) = cb
    {
        cb(ctx, err, da);
    }
}

/// Decides whether this rule's target must be remade and runs the
/// commands when so, per the staleness policy: missing target, weak
/// dependency failure, a double-colon rule without prerequisites, or a
/// newer non-weak prerequisite.
fn rule_run_commands(rc: &RuleContextRef, ctx: &mut BuildContext, cb: CommandCallback) {
    let (target, rule, deps, avoid_remake_loop, weak_remake) = {
        let mut r = rc.lock();
        debug_assert!(!r.running);
        r.running = true;
        (
            r.target.clone(),
            r.rule.clone(),
            r.deps.clone(),
            r.avoid_remake_loop,
            r.remake,
        )
    };

    let Some(rule) = rule.filter(|r| !r.commands().is_empty()) else {
        // Nothing to run: only the bookkeeping that drops the vpath
        // prefix when the target is out of date.
        {
            let mut t = target.lock();
            if t.mtime.is_none() {
                t.being_remade();
            } else {
                log!("Not remaking {} because it would have no effect", t.name);
            }
        }
        cb(ctx, false);
        return;
    };

    let (name, target_mtime) = {
        let t = target.lock();
        (t.name, t.mtime)
    };

    let mut remake = weak_remake;
    if remake {
        log!("Remaking {name} because a weak dependency was remade");
    }
    if !remake && target_mtime.is_none() {
        remake = true;
        log!("Remaking {name} because it does not exist or is forced");
    }
    if !remake && rule.double_colon() && deps.is_empty() {
        if avoid_remake_loop {
            log!("Not remaking {name} because it would be dangerous");
        } else {
            remake = true;
            log!("Remaking {name} because a double-colon rule lists no prerequisites");
        }
    }
    if !remake {
        for (dep, kind) in &deps {
            if *kind != DepKind::Normal {
                continue;
            }
            let (dep_name, dep_mtime) = {
                let d = dep.lock();
                (d.name, d.mtime)
            };
            if mtime_is_later(dep_mtime, target_mtime) {
                remake = true;
                log!("Remaking {name} because {dep_name} is newer");
                break;
            }
        }
    }

    if !remake {
        cb(ctx, false);
        return;
    }

    // Commands are materialized against the pre-remake modification
    // time so `$?` reflects what actually triggered the rebuild.
    {
        let mut t = target.lock();
        t.being_remade();
        t.did_anything = true;
    }
    let commands = match command::eval_commands(&ctx.makefile, &target, &rule, target_mtime) {
        Ok(commands) => commands,
        Err(err) => {
            warn!("{err}");
            cb(ctx, true);
            return;
        }
    };
    {
        let mut r = rc.lock();
        r.commands = commands.into();
        r.run_cb = Some(cb);
    }
    rule_command_cb(rc.clone(), ctx, false);
}

fn rule_command_cb(rc: RuleContextRef, ctx: &mut BuildContext, error: bool) {
    if error {
        let cb = rc.lock().run_cb.take();
        if let Some(cb) = cb {
            cb(ctx, true);
        }
        return;
    }
    let next = rc.lock().commands.pop_front();
    match next {
        Some(cmd) => {
            let rc2 = rc.clone();
            ctx.run_command(cmd, Box::new(move |ctx, err| rule_command_cb(rc2, ctx, err)));
        }
        None => {
            let cb = rc.lock().run_cb.take();
            if let Some(cb) = cb {
                cb(ctx, false);
            }
        }
    }
}

fn target_error(target: &TargetRef, makefile: &Makefile, what: &str) {
    let name = {
        let mut t = target.lock();
        t.make_error = true;
        t.name
    };
    makefile.set_error();
    warn!("rmake: *** {what} '{name}'");
}

/// Flips the target to `Finished` (irreversible for the rest of the
/// build) and fans the cached result out to every registered caller.
fn target_notify_done(target: &TargetRef, ctx: &mut BuildContext) {
    let (callbacks, error, did_anything) = {
        let mut t = target.lock();
        debug_assert_eq!(t.state, MakeState::Working);
        t.state = MakeState::Finished;
        (std::mem::take(&mut t.callbacks), t.make_error, t.did_anything)
    };
    for cb in callbacks {
        ctx.defer(move |ctx| cb(ctx, error, did_anything));
    }
}

/// The single build entry point for one target: resolve synchronously,
/// then hand the rule list to the serial or parallel driver. `cb` fires
/// exactly once per caller; a target revisited while `Working` (a
/// diamond dependency) registers for notification instead of
/// re-entering, and a `Finished` target answers from its cache.
pub fn make_target(
    ctx: &mut BuildContext,
    target: &TargetRef,
    target_stack: Vec<Symbol>,
    cb: MakeCallback,
    avoid_remake_loop: bool,
    print_error: bool,
) {
    {
        let t = target.lock();
        if target_stack.contains(&t.name) {
            let name = t.name;
            drop(t);
            warn!("rmake: Circular {name} dependency dropped.");
            cb(ctx, false, false);
            return;
        }
    }

    let name = {
        let mut t = target.lock();
        match t.state {
            MakeState::Finished => {
                let (error, did_anything) = (t.make_error, t.did_anything);
                drop(t);
                cb(ctx, error, did_anything);
                return;
            }
            MakeState::Working => {
                t.callbacks.push(cb);
                return;
            }
            MakeState::None => {
                t.state = MakeState::Working;
                t.callbacks = vec![cb];
                t.make_error = false;
                t.did_anything = false;
                t.name
            }
        }
    };

    if let Err(err) = resolve_deps(&ctx.makefile, name, &target_stack, &[], false) {
        if print_error {
            warn!("{err}");
        }
        target.lock().make_error = true;
        ctx.makefile.set_error();
        target_notify_done(target, ctx);
        return;
    }

    let rlist: Vec<RuleContextRef> = {
        let t = target.lock();
        debug_assert!(t.vpath_target.is_some(), "target was never resolved: {}", t.name);
        if t.rules.is_empty() {
            drop(t);
            target_notify_done(target, ctx);
            return;
        }
        let mut stack = target_stack;
        stack.push(name);
        let rule_deps = |r: &BuildRule| -> Vec<(TargetRef, DepKind)> {
            let kind = if r.weak_deps() {
                DepKind::Weak
            } else {
                DepKind::Normal
            };
            let mut deps: Vec<(TargetRef, DepKind)> = r
                .prerequisites()
                .iter()
                .map(|p| (ctx.makefile.get_target(*p), kind))
                .collect();
            deps.extend(
                r.order_only_prerequisites()
                    .iter()
                    .map(|p| (ctx.makefile.get_target(*p), DepKind::OrderOnly)),
            );
            deps
        };
        if t.is_double_colon() {
            t.rules
                .iter()
                .map(|r| {
                    RuleContext::new(
                        target.clone(),
                        Some(r.clone()),
                        rule_deps(r),
                        stack.clone(),
                        avoid_remake_loop,
                    )
                })
                .collect()
        } else {
            let mut all_deps: Vec<(TargetRef, DepKind)> = Vec::new();
            let mut command_rule = None;
            for r in &t.rules {
                let rdeps = rule_deps(r);
                if !r.commands().is_empty() {
                    debug_assert!(command_rule.is_none());
                    command_rule = Some(r.clone());
                    // The command rule's dependencies resolve before
                    // those contributed by bare prerequisite rules.
                    let _ = all_deps.splice(0..0, rdeps);
                } else {
                    all_deps.extend(rdeps);
                }
            }
            vec![RuleContext::new(
                target.clone(),
                command_rule,
                all_deps,
                stack,
                avoid_remake_loop,
            )]
        }
    };

    if ctx.serial() {
        remake_target_serially(target.clone(), ctx, rlist);
    } else {
        remake_target_parallel(target.clone(), ctx, rlist);
    }
}

/// Strictly sequential: one rule's prerequisites, then its commands,
/// before the next rule.
struct SerialRemake {
    target: TargetRef,
    rlist: VecDeque<RuleContextRef>,
}

fn remake_target_serially(target: TargetRef, ctx: &mut BuildContext, rlist: Vec<RuleContextRef>) {
    let s = Arc::new(Mutex::new(SerialRemake {
        target,
        rlist: rlist.into(),
    }));
    serial_commands_cb(s, ctx, false);
}

fn serial_commands_cb(s: Arc<Mutex<SerialRemake>>, ctx: &mut BuildContext, error: bool) {
    let target = s.lock().target.clone();
    if error {
        target_error(&target, &ctx.makefile, "Error in commands of");
        if !ctx.makefile.flags.keep_going {
            target_notify_done(&target, ctx);
            return;
        }
    }
    let next = s.lock().rlist.front().cloned();
    match next {
        Some(rc) => {
            let s2 = s.clone();
            rule_resolve_deps(
                &rc,
                ctx,
                true,
                Box::new(move |ctx, err, da| serial_resolve_cb(s2, ctx, err, da)),
            );
        }
        None => target_notify_done(&target, ctx),
    }
}

fn serial_resolve_cb(
    s: Arc<Mutex<SerialRemake>>,
    ctx: &mut BuildContext,
    error: bool,
    did_anything: bool,
) {
    let target = s.lock().target.clone();
    if did_anything {
        target.lock().did_anything = true;
    }
    if error {
        target_error(&target, &ctx.makefile, "Error in dependency of");
        if !ctx.makefile.flags.keep_going {
            target_notify_done(&target, ctx);
            return;
        }
        // The failed branch is skipped: its commands never run, the
        // next rule proceeds.
        let _ = s.lock().rlist.pop_front();
        serial_commands_cb(s, ctx, false);
        return;
    }
    let rc = s.lock().rlist.pop_front();
    if let Some(rc) = rc {
        let s2 = s.clone();
        rule_run_commands(
            &rc,
            ctx,
            Box::new(move |ctx, err| serial_commands_cb(s2, ctx, err)),
        );
    }
}

/// Rule resolution is dispatched eagerly for every rule; commands still
/// run one rule at a time per target, in declaration order, skipping
/// rules whose dependencies already failed.
struct ParallelRemake {
    target: TargetRef,
    rlist: Vec<RuleContextRef>,
    rules_remaining: usize,
    cur_running: bool,
}

fn remake_target_parallel(target: TargetRef, ctx: &mut BuildContext, rlist: Vec<RuleContextRef>) {
    let p = Arc::new(Mutex::new(ParallelRemake {
        target,
        rules_remaining: rlist.len(),
        rlist,
        cur_running: false,
    }));
    let contexts = p.lock().rlist.clone();
    for rc in contexts {
        let p2 = p.clone();
        ctx.defer(move |ctx| parallel_do_resolve(p2, rc, ctx));
    }
}

fn parallel_do_resolve(p: Arc<Mutex<ParallelRemake>>, rc: RuleContextRef, ctx: &mut BuildContext) {
    if ctx.makefile.error() && !ctx.makefile.flags.keep_going {
        // Cancelled before starting: not-yet-started rule contexts are
        // failed without running anything.
        {
            let mut r = rc.lock();
            r.error = true;
            r.deps_remaining = 0;
        }
        parallel_resolve_cb(p, ctx, true, false);
    } else {
        let p2 = p.clone();
        rule_resolve_deps(
            &rc,
            ctx,
            false,
            Box::new(move |ctx, err, da| parallel_resolve_cb(p2, ctx, err, da)),
        );
    }
}

fn parallel_resolve_cb(
    p: Arc<Mutex<ParallelRemake>>,
    ctx: &mut BuildContext,
    error: bool,
    did_anything: bool,
) {
    let target = p.lock().target.clone();
    if error {
        target_error(&target, &ctx.makefile, "Error in dependency of");
    }
    if did_anything {
        target.lock().did_anything = true;
    }
    let run = {
        let mut pl = p.lock();
        pl.rules_remaining -= 1;
        !pl.cur_running
    };
    if run {
        parallel_run_next(p, ctx);
    }
}

fn parallel_run_next(p: Arc<Mutex<ParallelRemake>>, ctx: &mut BuildContext) {
    enum Next {
        Done(TargetRef),
        Wait,
        Run(RuleContextRef),
    }
    let next = {
        let mut pl = p.lock();
        debug_assert!(!pl.cur_running);
        if ctx.makefile.error() && !ctx.makefile.flags.keep_going {
            pl.rlist.clear();
        } else {
            while pl.rlist.first().is_some_and(|rc| rc.lock().error) {
                let _ = pl.rlist.remove(0);
            }
        }
        if pl.rlist.is_empty() {
            if pl.rules_remaining == 0 {
                Next::Done(pl.target.clone())
            } else {
                Next::Wait
            }
        } else if pl.rlist[0].lock().deps_remaining != 0 {
            // Its resolution is still outstanding; its completion
            // re-enters here.
            Next::Wait
        } else {
            pl.cur_running = true;
            Next::Run(pl.rlist.remove(0))
        }
    };
    match next {
        Next::Done(target) => target_notify_done(&target, ctx),
        Next::Wait => {}
        Next::Run(rc) => {
            let p2 = p.clone();
            ctx.defer(move |ctx| {
                let p3 = p2.clone();
                rule_run_commands(
                    &rc,
                    ctx,
                    Box::new(move |ctx, err| parallel_commands_cb(p3, ctx, err)),
                );
            });
        }
    }
}

fn parallel_commands_cb(p: Arc<Mutex<ParallelRemake>>, ctx: &mut BuildContext, error: bool) {
    let target = p.lock().target.clone();
    if error {
        target_error(&target, &ctx.makefile, "Error in commands of");
    }
    {
        let mut pl = p.lock();
        debug_assert!(pl.cur_running);
        pl.cur_running = false;
    }
    parallel_run_next(p, ctx);
}

/// Builds `goals` in order (or the default goal), returning true when
/// any target reported an error; the driving CLI's exit status is
/// non-zero exactly then.
pub fn make(makefile: &Arc<Makefile>, goals: &[Symbol]) -> Result<bool> {
    assert!(makefile.parsing_finished());
    let goals: Vec<Symbol> = if goals.is_empty() {
        match makefile.default_goal() {
            Some(goal) => vec![goal],
            None => resolution_error!(None, "*** No targets."),
        }
    } else {
        goals.to_vec()
    };

    let mut ctx = BuildContext::new(makefile.clone());
    let mut any_error = false;
    for goal in goals {
        let target = makefile.get_explicit_target(goal);
        let result: Arc<Mutex<Option<(bool, bool)>>> = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        make_target(
            &mut ctx,
            &target,
            Vec::new(),
            Box::new(move |_, error, did_anything| {
                *result2.lock() = Some((error, did_anything));
            }),
            false,
            true,
        );
        ctx.run();
        let (error, did_anything) = result.lock().take().unwrap_or((true, false));
        if error {
            any_error = true;
            if !makefile.flags.keep_going {
                break;
            }
        } else if !did_anything {
            println!("rmake: Nothing to be done for `{goal}'.");
        }
    }
    Ok(any_error)
}

/// Rebuilds every recorded included makefile, guarding double-colon
/// remake loops. Returns true when any was remade and the caller should
/// reload and restart the whole run.
pub fn remake_makefiles(makefile: &Arc<Makefile>) -> Result<bool> {
    assert!(makefile.parsing_finished());
    let mut ctx = BuildContext::new(makefile.clone());
    let mut remade = false;
    for (path, required) in makefile.included_makefiles().to_vec() {
        let target = makefile.get_explicit_target(path);
        let result: Arc<Mutex<Option<(bool, bool)>>> = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        make_target(
            &mut ctx,
            &target,
            Vec::new(),
            Box::new(move |_, error, _| {
                *result2.lock() = Some((error, false));
            }),
            true,
            required,
        );
        ctx.run();
        let (error, _) = result.lock().take().unwrap_or((true, false));
        if error && required {
            resolution_error!(None, "Failed to remake required makefile '{path}'");
        }
        if target.lock().was_remade {
            remade = true;
        }
    }
    Ok(remade)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Value;
    use crate::makefile::{Flags, PHONY_SYM};
    use crate::symtab::intern;
    use std::fs;
    use std::path::Path;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn sym(s: &str) -> Symbol {
        intern(Bytes::copy_from_slice(s.as_bytes()))
    }

    fn path_sym(p: &Path) -> Symbol {
        sym(p.to_str().unwrap())
    }

    fn sh(cmd: String) -> Vec<Arc<Value>> {
        vec![Value::literal(cmd)]
    }

    fn set_mtime(p: &Path, secs: i64) {
        filetime::set_file_mtime(p, filetime::FileTime::from_unix_time(secs, 0)).unwrap();
    }

    fn flags(jobs: usize, keep_going: bool) -> Flags {
        Flags {
            jobs,
            keep_going,
            silent: true,
            dry_run: false,
        }
    }

    #[test]
    fn test_simple_build() {
        init_logging();
        for jobs in [1, 4] {
            let dir = tempfile::tempdir().unwrap();
            let src = dir.path().join("in.txt");
            let out = dir.path().join("out.txt");
            fs::write(&src, "payload").unwrap();

            let mut makefile = Makefile::new(flags(jobs, false));
            makefile
                .add_rule(
                    &[path_sym(&out)],
                    vec![path_sym(&src)],
                    vec![],
                    sh(format!("cp {} {}", src.display(), out.display())),
                    false,
                    false,
                    None,
                )
                .unwrap();
            makefile.finish_parsing().unwrap();
            let makefile = Arc::new(makefile);
            let error = make(&makefile, &[path_sym(&out)]).unwrap();
            assert!(!error);
            assert_eq!(fs::read_to_string(&out).unwrap(), "payload");
        }
    }

    #[test]
    fn test_up_to_date_does_nothing() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.txt");
        let out = dir.path().join("out.txt");
        let log = dir.path().join("ran.log");
        fs::write(&src, "s").unwrap();
        fs::write(&out, "o").unwrap();
        set_mtime(&src, 1_000_000);
        set_mtime(&out, 2_000_000);

        let mut makefile = Makefile::new(flags(1, false));
        makefile
            .add_rule(
                &[path_sym(&out)],
                vec![path_sym(&src)],
                vec![],
                sh(format!("echo ran >> {}", log.display())),
                false,
                false,
                None,
            )
            .unwrap();
        makefile.finish_parsing().unwrap();
        let makefile = Arc::new(makefile);
        let error = make(&makefile, &[path_sym(&out)]).unwrap();
        assert!(!error);
        assert!(!log.exists());
        let t = makefile.get_target(path_sym(&out));
        assert!(!t.lock().did_anything());

        // A finished target answers from its cache.
        let error = make(&makefile, &[path_sym(&out)]).unwrap();
        assert!(!error);
        assert!(!log.exists());
    }

    #[test]
    fn test_stale_target_rebuilt() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.txt");
        let out = dir.path().join("out.txt");
        fs::write(&src, "s").unwrap();
        fs::write(&out, "o").unwrap();
        set_mtime(&out, 1_000_000);
        set_mtime(&src, 2_000_000);

        let mut makefile = Makefile::new(flags(1, false));
        makefile
            .add_rule(
                &[path_sym(&out)],
                vec![path_sym(&src)],
                vec![],
                sh(format!("cp {} {}", src.display(), out.display())),
                false,
                false,
                None,
            )
            .unwrap();
        makefile.finish_parsing().unwrap();
        let makefile = Arc::new(makefile);
        let error = make(&makefile, &[path_sym(&out)]).unwrap();
        assert!(!error);
        assert_eq!(fs::read_to_string(&out).unwrap(), "s");
        let t = makefile.get_target(path_sym(&out));
        assert!(t.lock().did_anything());
        assert!(t.lock().was_remade);
    }

    #[test]
    fn test_diamond_builds_once() {
        init_logging();
        for jobs in [1, 4] {
            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("d.log");
            let top = dir.path().join("top");
            let b = dir.path().join("b");
            let c = dir.path().join("c");
            let d = dir.path().join("d");

            let mut makefile = Makefile::new(flags(jobs, false));
            makefile
                .add_rule(
                    &[path_sym(&top)],
                    vec![path_sym(&b), path_sym(&c)],
                    vec![],
                    sh("true".to_string()),
                    false,
                    false,
                    None,
                )
                .unwrap();
            for mid in [&b, &c] {
                makefile
                    .add_rule(
                        &[path_sym(mid)],
                        vec![path_sym(&d)],
                        vec![],
                        sh("true".to_string()),
                        false,
                        false,
                        None,
                    )
                    .unwrap();
            }
            makefile
                .add_rule(
                    &[path_sym(&d)],
                    vec![],
                    vec![],
                    sh(format!("echo once >> {}", log.display())),
                    false,
                    false,
                    None,
                )
                .unwrap();
            makefile.finish_parsing().unwrap();
            let makefile = Arc::new(makefile);
            let error = make(&makefile, &[path_sym(&top)]).unwrap();
            assert!(!error);
            let lines = fs::read_to_string(&log).unwrap();
            assert_eq!(lines.lines().count(), 1, "jobs={jobs}");
        }
    }

    #[test]
    fn test_parallel_independent_prerequisites() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let top = dir.path().join("top");
        let names: Vec<_> = ["x", "y", "z"].iter().map(|n| dir.path().join(n)).collect();

        let mut makefile = Makefile::new(flags(4, false));
        makefile
            .add_rule(
                &[path_sym(&top)],
                names.iter().map(|p| path_sym(p)).collect(),
                vec![],
                sh(format!("touch {}", top.display())),
                false,
                false,
                None,
            )
            .unwrap();
        for n in &names {
            makefile
                .add_rule(
                    &[path_sym(n)],
                    vec![],
                    vec![],
                    sh(format!("sleep 0.05 && touch {}", n.display())),
                    false,
                    false,
                    None,
                )
                .unwrap();
        }
        makefile.finish_parsing().unwrap();
        let makefile = Arc::new(makefile);
        let error = make(&makefile, &[path_sym(&top)]).unwrap();
        assert!(!error);
        assert!(top.exists());
        for n in &names {
            assert!(n.exists());
        }
    }

    #[test]
    fn test_no_rule_to_make_target() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");

        let build = || {
            let mut makefile = Makefile::new(flags(1, false));
            makefile
                .add_rule(
                    &[path_sym(&a)],
                    vec![path_sym(&b), path_sym(&c)],
                    vec![],
                    sh(format!("touch {}", a.display())),
                    false,
                    false,
                    None,
                )
                .unwrap();
            makefile
                .add_rule(
                    &[path_sym(&b)],
                    vec![],
                    vec![],
                    sh(format!("touch {}", b.display())),
                    false,
                    false,
                    None,
                )
                .unwrap();
            makefile.finish_parsing().unwrap();
            make(&Arc::new(makefile), &[path_sym(&a)]).unwrap()
        };

        // `c` has no rule and does not exist: resolution fails.
        assert!(build());
        assert!(!a.exists());

        // Once `c` exists on disk it is an always-satisfied input.
        fs::write(&c, "here").unwrap();
        assert!(!build());
        assert!(a.exists());
    }

    #[test]
    fn test_implicit_rule_build() {
        init_logging();
        for jobs in [1, 2] {
            let dir = tempfile::tempdir().unwrap();
            let src = dir.path().join("mod.c");
            fs::write(&src, "int f;").unwrap();
            let obj = dir.path().join("mod.o");

            let mut makefile = Makefile::new(flags(jobs, false));
            makefile
                .add_implicit_rule(
                    vec![crate::strutil::Pattern::new(&Bytes::from_static(b"%.o"))],
                    vec![crate::strutil::Pattern::new(&Bytes::from_static(b"%.c"))],
                    vec![Value::list(vec![
                        Value::literal("cp "),
                        Value::sym_ref(intern("<")),
                        Value::literal(" "),
                        Value::sym_ref(intern("@")),
                    ])],
                    false,
                    None,
                )
                .unwrap();
            makefile.finish_parsing().unwrap();
            let makefile = Arc::new(makefile);
            let error = make(&makefile, &[path_sym(&obj)]).unwrap();
            assert!(!error);
            assert_eq!(fs::read_to_string(&obj).unwrap(), "int f;");
        }
    }

    #[test]
    fn test_double_colon_independent_failure() {
        init_logging();
        for jobs in [1, 4] {
            let dir = tempfile::tempdir().unwrap();
            let t = dir.path().join("dc");
            let marker = dir.path().join("marker");

            let mut makefile = Makefile::new(flags(jobs, true));
            makefile
                .add_rule(&[path_sym(&t)], vec![], vec![], sh("false".to_string()), true, false, None)
                .unwrap();
            makefile
                .add_rule(
                    &[path_sym(&t)],
                    vec![],
                    vec![],
                    sh(format!("touch {}", marker.display())),
                    true,
                    false,
                    None,
                )
                .unwrap();
            makefile.finish_parsing().unwrap();
            let makefile = Arc::new(makefile);
            let error = make(&makefile, &[path_sym(&t)]).unwrap();
            assert!(error);
            // With keep-going, the second rule's commands still ran.
            assert!(marker.exists(), "jobs={jobs}");
        }
    }

    #[test]
    fn test_double_colon_failure_without_keep_going() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let t = dir.path().join("dc");
        let marker = dir.path().join("marker");

        let mut makefile = Makefile::new(flags(1, false));
        makefile
            .add_rule(&[path_sym(&t)], vec![], vec![], sh("false".to_string()), true, false, None)
            .unwrap();
        makefile
            .add_rule(
                &[path_sym(&t)],
                vec![],
                vec![],
                sh(format!("touch {}", marker.display())),
                true,
                false,
                None,
            )
            .unwrap();
        makefile.finish_parsing().unwrap();
        let makefile = Arc::new(makefile);
        let error = make(&makefile, &[path_sym(&t)]).unwrap();
        assert!(error);
        assert!(!marker.exists());
    }

    #[test]
    fn test_double_colon_no_prereqs_always_remade() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let t = dir.path().join("dc_exists");
        let log = dir.path().join("dc.log");
        fs::write(&t, "present").unwrap();

        let mut makefile = Makefile::new(flags(1, false));
        makefile
            .add_rule(
                &[path_sym(&t)],
                vec![],
                vec![],
                sh(format!("echo ran >> {}", log.display())),
                true,
                false,
                None,
            )
            .unwrap();
        makefile.finish_parsing().unwrap();
        let makefile = Arc::new(makefile);
        let error = make(&makefile, &[path_sym(&t)]).unwrap();
        assert!(!error);
        assert!(log.exists());
    }

    #[test]
    fn test_failed_dependency_skips_commands() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");

        for keep_going in [false, true] {
            let _ = fs::remove_file(&a);
            let _ = fs::remove_file(&c);
            let mut makefile = Makefile::new(flags(1, keep_going));
            makefile
                .add_rule(
                    &[path_sym(&a)],
                    vec![path_sym(&b), path_sym(&c)],
                    vec![],
                    sh(format!("touch {}", a.display())),
                    false,
                    false,
                    None,
                )
                .unwrap();
            makefile
                .add_rule(&[path_sym(&b)], vec![], vec![], sh("false".to_string()), false, false, None)
                .unwrap();
            makefile
                .add_rule(
                    &[path_sym(&c)],
                    vec![],
                    vec![],
                    sh(format!("touch {}", c.display())),
                    false,
                    false,
                    None,
                )
                .unwrap();
            makefile.finish_parsing().unwrap();
            let makefile = Arc::new(makefile);
            let error = make(&makefile, &[path_sym(&a)]).unwrap();
            assert!(error);
            // The failed branch never runs its dependent's commands.
            assert!(!a.exists());
            // Keep-going still finishes unrelated siblings.
            assert_eq!(c.exists(), keep_going);
        }
    }

    #[test]
    fn test_phony_always_rebuilds() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let clean = dir.path().join("clean");
        let log = dir.path().join("clean.log");
        fs::write(&clean, "a file by that name").unwrap();

        for _ in 0..2 {
            let mut makefile = Makefile::new(flags(1, false));
            makefile
                .add_rule(&[*PHONY_SYM], vec![path_sym(&clean)], vec![], vec![], false, false, None)
                .unwrap();
            makefile
                .add_rule(
                    &[path_sym(&clean)],
                    vec![],
                    vec![],
                    sh(format!("echo ran >> {}", log.display())),
                    false,
                    false,
                    None,
                )
                .unwrap();
            makefile.finish_parsing().unwrap();
            let error = make(&Arc::new(makefile), &[path_sym(&clean)]).unwrap();
            assert!(!error);
        }
        assert_eq!(fs::read_to_string(&log).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_order_only_prerequisite_not_staleness() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let src = dir.path().join("src");
        let oo = dir.path().join("oo");
        let log = dir.path().join("oo.log");
        fs::write(&out, "o").unwrap();
        fs::write(&src, "s").unwrap();
        fs::write(&oo, "d").unwrap();
        set_mtime(&src, 1_000_000);
        set_mtime(&out, 2_000_000);
        set_mtime(&oo, 3_000_000);

        let mut makefile = Makefile::new(flags(1, false));
        makefile
            .add_rule(
                &[path_sym(&out)],
                vec![path_sym(&src)],
                vec![path_sym(&oo)],
                sh(format!("echo ran >> {}", log.display())),
                false,
                false,
                None,
            )
            .unwrap();
        makefile.finish_parsing().unwrap();
        let error = make(&Arc::new(makefile), &[path_sym(&out)]).unwrap();
        assert!(!error);
        // The newer order-only prerequisite does not make `out` stale.
        assert!(!log.exists());
    }

    #[test]
    fn test_weak_dependency_failure_forces_remake() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let weak = dir.path().join("weak.d");
        let log = dir.path().join("weak.log");
        fs::write(&out, "fresh").unwrap();
        // The weak dependency does not exist, so its (failing) rule runs.

        let mut makefile = Makefile::new(flags(1, false));
        makefile
            .add_rule(
                &[path_sym(&out)],
                vec![path_sym(&weak)],
                vec![],
                sh(format!("echo rebuilt >> {}", log.display())),
                false,
                true,
                None,
            )
            .unwrap();
        makefile
            .add_rule(&[path_sym(&weak)], vec![], vec![], sh("false".to_string()), false, false, None)
            .unwrap();
        makefile.finish_parsing().unwrap();
        let makefile = Arc::new(makefile);
        let error = make(&makefile, &[path_sym(&out)]).unwrap();
        // The weak failure is demoted to "rebuild the dependent".
        assert!(!error);
        assert!(log.exists());
    }

    #[test]
    fn test_circular_dependency_dropped() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");

        let mut makefile = Makefile::new(flags(1, false));
        makefile
            .add_rule(
                &[path_sym(&a)],
                vec![path_sym(&b)],
                vec![],
                sh(format!("touch {}", a.display())),
                false,
                false,
                None,
            )
            .unwrap();
        makefile
            .add_rule(
                &[path_sym(&b)],
                vec![path_sym(&a)],
                vec![],
                sh(format!("touch {}", b.display())),
                false,
                false,
                None,
            )
            .unwrap();
        makefile.finish_parsing().unwrap();
        let error = make(&Arc::new(makefile), &[path_sym(&a)]).unwrap();
        assert!(!error);
        assert!(a.exists());
        assert!(b.exists());
    }

    #[test]
    fn test_dry_run_runs_nothing() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");

        let mut makefile = Makefile::new(Flags {
            jobs: 1,
            keep_going: false,
            silent: true,
            dry_run: true,
        });
        makefile
            .add_rule(
                &[path_sym(&out)],
                vec![],
                vec![],
                sh(format!("touch {}", out.display())),
                false,
                false,
                None,
            )
            .unwrap();
        makefile.finish_parsing().unwrap();
        let makefile = Arc::new(makefile);
        let error = make(&makefile, &[path_sym(&out)]).unwrap();
        assert!(!error);
        assert!(!out.exists());
        let t = makefile.get_target(path_sym(&out));
        assert!(t.lock().did_anything());
    }

    #[test]
    fn test_remake_makefiles() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let inc = dir.path().join("inc.mk");

        let build = || {
            let mut makefile = Makefile::new(flags(1, false));
            makefile
                .add_rule(
                    &[path_sym(&inc)],
                    vec![],
                    vec![],
                    sh(format!("touch {}", inc.display())),
                    false,
                    false,
                    None,
                )
                .unwrap();
            makefile.add_included_makefile(path_sym(&inc), true);
            makefile.finish_parsing().unwrap();
            remake_makefiles(&Arc::new(makefile)).unwrap()
        };

        // Missing on the first pass: remade, restart required.
        assert!(build());
        assert!(inc.exists());
        // Present and current on the second: nothing to do.
        assert!(!build());
    }
}
