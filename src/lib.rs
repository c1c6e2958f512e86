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

// TODO: Add docs
#![allow(missing_docs)]
#![deny(unsafe_code)]

use std::fmt::{Display, Formatter};

use crate::loc::Loc;

pub mod command;
pub mod eval;
pub mod exec;
pub mod expr;
pub mod fileutil;
pub mod loc;
pub mod makefile;
pub mod rule;
pub mod strutil;
pub mod symtab;
pub mod target;
pub mod var;

#[macro_export]
macro_rules! log {
    ($fmt:expr $(, $($arg:tt)*)?) => {
        log::trace!($fmt, $($($arg)*)?)
    };
}

#[macro_export]
macro_rules! warn {
    ($fmt:expr $(, $($arg:tt)*)?) => {
        eprintln!($fmt, $($($arg)*)?)
    };
}

/// A dependency cannot be satisfied: missing target, no applicable rule,
/// or a recursive dependency chain. Local to one target's build attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionError(pub String);

impl ResolutionError {
    pub fn at(loc: Option<Loc>, msg: String) -> Self {
        match loc {
            Some(loc) => ResolutionError(format!("{loc}: {msg}")),
            None => ResolutionError(msg),
        }
    }
}

impl Display for ResolutionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ResolutionError {}

/// A structural inconsistency in the makefile data: mixed colon kinds,
/// a static-pattern mismatch, a malformed `.LIBPATTERNS`, or a
/// self-referential recursive variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataError(pub String);

impl DataError {
    pub fn at(loc: Option<Loc>, msg: String) -> Self {
        match loc {
            Some(loc) => DataError(format!("{loc}: {msg}")),
            None => DataError(msg),
        }
    }
}

impl Display for DataError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DataError {}

#[macro_export]
macro_rules! resolution_error {
    ($loc:expr, $fmt:expr $(, $($arg:tt)*)?) => {
        return Err($crate::ResolutionError::at($loc, format!($fmt, $($($arg)*)?)).into())
    };
}

#[macro_export]
macro_rules! data_error {
    ($loc:expr, $fmt:expr $(, $($arg:tt)*)?) => {
        return Err($crate::DataError::at($loc, format!($fmt, $($($arg)*)?)).into())
    };
}
