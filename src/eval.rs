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

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};

use crate::data_error;
use crate::expr::{Evaluable, Value};
use crate::loc::Loc;
use crate::makefile::Makefile;
use crate::strutil::word_scanner;
use crate::symtab::Symbol;
use crate::var::{Var, VarContent, Vars};

/// Materializes expression trees against a stack of variable scopes:
/// innermost (automatic) first, then target-local, then the makefile
/// globals. Tracks in-progress recursive expansions so a variable that
/// references itself is reported instead of looping.
pub struct Evaluator<'a> {
    makefile: &'a Makefile,
    scopes: Vec<Arc<Vars>>,
    pub loc: Option<Loc>,
    expanding: Vec<Symbol>,
}

impl<'a> Evaluator<'a> {
    pub fn new(makefile: &'a Makefile) -> Self {
        Evaluator {
            makefile,
            scopes: Vec::new(),
            loc: None,
            expanding: Vec::new(),
        }
    }

    pub fn with_scopes(makefile: &'a Makefile, scopes: Vec<Arc<Vars>>) -> Self {
        Evaluator {
            makefile,
            scopes,
            loc: None,
            expanding: Vec::new(),
        }
    }

    pub fn lookup_var(&self, sym: Symbol) -> Option<Var> {
        for scope in &self.scopes {
            if let Some(var) = scope.lookup(sym) {
                return Some(var);
            }
        }
        self.makefile.globals.lookup(sym)
    }

    pub(crate) fn eval_var(&mut self, sym: Symbol, out: &mut dyn BufMut) -> Result<()> {
        let Some(var) = self.lookup_var(sym) else {
            // An undefined variable expands to nothing.
            return Ok(());
        };
        let content = var.read().content();
        match content {
            VarContent::Simple(s) => out.put_slice(&s),
            VarContent::Recursive(v) => {
                if self.expanding.contains(&sym) {
                    data_error!(
                        self.loc,
                        "*** Recursive variable '{sym}' references itself (eventually)."
                    );
                }
                self.expanding.push(sym);
                let res = v.eval(self, out);
                let _ = self.expanding.pop();
                res?;
            }
        }
        Ok(())
    }

    pub fn resolve_str(&mut self, value: &Value) -> Result<Bytes> {
        value.eval_to_buf(self)
    }

    pub fn resolve_split(&mut self, value: &Value) -> Result<Vec<Bytes>> {
        let buf = value.eval_to_buf(self)?;
        Ok(word_scanner(&buf).map(Bytes::copy_from_slice).collect())
    }

    /// The value of a variable as a whitespace-split list, or `None`
    /// when the variable is not set at all.
    pub fn resolve_var_split(&mut self, sym: Symbol) -> Result<Option<Vec<Bytes>>> {
        if self.lookup_var(sym).is_none() {
            return Ok(None);
        }
        let mut buf = BytesMut::new();
        self.eval_var(sym, &mut buf)?;
        let buf = buf.freeze();
        Ok(Some(
            word_scanner(&buf).map(Bytes::copy_from_slice).collect(),
        ))
    }
}
