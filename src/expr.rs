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

use crate::eval::Evaluator;
use crate::loc::Loc;
use crate::strutil::{WordWriter, subst_ref, word_scanner};
use crate::symtab::{Symbol, intern};

pub trait Evaluable {
    fn eval(&self, ev: &mut Evaluator<'_>, out: &mut dyn BufMut) -> Result<()>;

    fn eval_to_buf_mut(&self, ev: &mut Evaluator<'_>) -> Result<BytesMut> {
        let mut out = BytesMut::new();
        self.eval(ev, &mut out)?;
        Ok(out)
    }

    fn eval_to_buf(&self, ev: &mut Evaluator<'_>) -> Result<Bytes> {
        Ok(self.eval_to_buf_mut(ev)?.freeze())
    }
}

/// An unexpanded expression tree, as the parser collaborator hands it
/// over: command lines and recursive variable bodies are made of these.
#[derive(Debug, PartialEq)]
pub enum Value {
    Literal(Option<Loc>, Bytes),
    List(Option<Loc>, Vec<Arc<Value>>),
    SymRef(Option<Loc>, Symbol),
    VarRef(Option<Loc>, Arc<Value>),
    VarSubst {
        loc: Option<Loc>,
        name: Arc<Value>,
        pat: Arc<Value>,
        subst: Arc<Value>,
    },
}

impl Value {
    pub fn literal<T: Into<Bytes> + AsRef<[u8]>>(s: T) -> Arc<Value> {
        Arc::new(Value::Literal(None, s.into()))
    }

    pub fn sym_ref(sym: Symbol) -> Arc<Value> {
        Arc::new(Value::SymRef(None, sym))
    }

    pub fn list(values: Vec<Arc<Value>>) -> Arc<Value> {
        Arc::new(Value::List(None, values))
    }

    pub fn loc(&self) -> Option<Loc> {
        match self {
            Value::Literal(loc, _)
            | Value::List(loc, _)
            | Value::SymRef(loc, _)
            | Value::VarRef(loc, _) => *loc,
            Value::VarSubst { loc, .. } => *loc,
        }
    }
}

impl Evaluable for Value {
    fn eval(&self, ev: &mut Evaluator<'_>, out: &mut dyn BufMut) -> Result<()> {
        match self {
            Value::Literal(_, lit) => out.put_slice(lit),
            Value::List(_, vec) => {
                for v in vec {
                    v.eval(ev, out)?;
                }
            }
            Value::SymRef(_, sym) => ev.eval_var(*sym, out)?,
            Value::VarRef(_, name) => {
                let name = name.eval_to_buf(ev)?;
                ev.eval_var(intern(name), out)?;
            }
            Value::VarSubst {
                loc: _,
                name,
                pat,
                subst,
            } => {
                let name = name.eval_to_buf(ev)?;
                let sym = intern(name);
                let pat = pat.eval_to_buf(ev)?;
                let subst = subst.eval_to_buf(ev)?;
                let mut value = BytesMut::new();
                ev.eval_var(sym, &mut value)?;
                let value = value.freeze();
                let mut ww = WordWriter::new(out);
                for tok in word_scanner(&value) {
                    ww.write(&subst_ref(&pat, &subst, tok));
                }
            }
        }
        Ok(())
    }
}
