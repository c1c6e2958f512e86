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

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::expr::Value;
use crate::loc::Loc;
use crate::symtab::Symbol;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VarOrigin {
    Default,
    Environment,
    File,
    CommandLine,
    Override,
    Automatic,
}

pub fn get_origin_str(origin: VarOrigin) -> &'static str {
    match origin {
        VarOrigin::Default => "default",
        VarOrigin::Environment => "environment",
        VarOrigin::File => "file",
        VarOrigin::CommandLine => "command line",
        VarOrigin::Override => "override",
        VarOrigin::Automatic => "automatic",
    }
}

pub type Var = Arc<RwLock<Variable>>;

#[derive(Debug)]
pub struct Variable {
    loc: Option<Loc>,
    origin: VarOrigin,
    value: InnerVar,
}

#[derive(Debug)]
enum InnerVar {
    Simple(Vec<u8>),
    Recursive(Arc<Value>),
}

/// A variable's content, cloned out of the lock so recursive expansion
/// never re-enters it.
#[derive(Debug, Clone)]
pub enum VarContent {
    Simple(Bytes),
    Recursive(Arc<Value>),
}

impl Variable {
    pub fn with_simple_string(value: Bytes, origin: VarOrigin, loc: Option<Loc>) -> Var {
        Arc::new(RwLock::new(Self {
            loc,
            origin,
            value: InnerVar::Simple(value.to_vec()),
        }))
    }

    pub fn new_recursive(v: Arc<Value>, origin: VarOrigin, loc: Option<Loc>) -> Var {
        Arc::new(RwLock::new(Self {
            loc,
            origin,
            value: InnerVar::Recursive(v),
        }))
    }

    pub fn loc(&self) -> Option<Loc> {
        self.loc
    }

    pub fn origin(&self) -> VarOrigin {
        self.origin
    }

    pub fn flavor(&self) -> &'static str {
        match &self.value {
            InnerVar::Simple(_) => "simple",
            InnerVar::Recursive(_) => "recursive",
        }
    }

    pub fn immediate_eval(&self) -> bool {
        matches!(&self.value, InnerVar::Simple(_))
    }

    pub fn content(&self) -> VarContent {
        match &self.value {
            InnerVar::Simple(s) => VarContent::Simple(Bytes::copy_from_slice(s)),
            InnerVar::Recursive(v) => VarContent::Recursive(v.clone()),
        }
    }

    pub fn append_str(&mut self, buf: &Bytes) {
        match &mut self.value {
            InnerVar::Simple(s) => {
                s.push(b' ');
                s.extend_from_slice(buf);
            }
            InnerVar::Recursive(prev) => {
                *prev = Arc::new(Value::List(
                    prev.loc(),
                    vec![
                        prev.clone(),
                        Arc::new(Value::Literal(None, Bytes::from_static(b" "))),
                        Arc::new(Value::Literal(None, buf.clone())),
                    ],
                ));
            }
        }
    }
}

pub struct Vars(pub Mutex<HashMap<Symbol, Var>>);

impl Default for Vars {
    fn default() -> Self {
        Self::new()
    }
}

impl Vars {
    pub fn new() -> Self {
        Vars(Mutex::new(HashMap::new()))
    }

    pub fn lookup(&self, sym: Symbol) -> Option<Var> {
        self.0.lock().get(&sym).cloned()
    }

    pub fn assign(&self, sym: Symbol, var: Var) {
        let _ = self.0.lock().insert(sym, var);
    }

    pub fn set_simple(&self, sym: Symbol, value: Bytes, origin: VarOrigin) {
        self.assign(sym, Variable::with_simple_string(value, origin, None));
    }

    pub fn merge_from(&self, vars: &Vars) {
        let mut to = self.0.lock();
        let from = vars.0.lock();
        for (sym, var) in from.iter() {
            let _ = to.insert(*sym, var.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

impl Clone for Vars {
    fn clone(&self) -> Self {
        let m = self.0.lock();
        Self(Mutex::new(m.clone()))
    }
}

impl Debug for Vars {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let vars = self.0.lock();
        f.debug_map().entries(vars.iter()).finish()
    }
}
