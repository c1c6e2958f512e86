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

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use memchr::{memchr, memchr2, memrchr};

use crate::DataError;

pub fn is_space_byte(c: &u8) -> bool {
    let c = *c;
    (b'\t'..=b'\r').contains(&c) || c == b' '
}

pub fn skip_until(s: &[u8], pattern: &[u8]) -> usize {
    s.iter()
        .position(|c| pattern.contains(c))
        .unwrap_or(s.len())
}

pub fn skip_until2(s: &[u8], needle1: u8, needle2: u8) -> usize {
    memchr2(needle1, needle2, s).unwrap_or(s.len())
}

pub fn word_scanner(s: &[u8]) -> impl Iterator<Item = &[u8]> {
    s.split(is_space_byte).filter(|s| !s.is_empty())
}

pub struct WordWriter<'a> {
    pub out: &'a mut dyn BufMut,
    needs_space: bool,
}

impl<'a> WordWriter<'a> {
    pub fn new(out: &'a mut dyn BufMut) -> WordWriter<'a> {
        WordWriter {
            out,
            needs_space: false,
        }
    }

    pub fn maybe_add_space(&mut self) {
        if self.needs_space {
            self.out.put_slice(b" ")
        } else {
            self.needs_space = true;
        }
    }

    pub fn write(&mut self, s: &[u8]) {
        self.maybe_add_space();
        self.out.put_slice(s);
    }
}

pub fn trim_left_space(s: &[u8]) -> &[u8] {
    let mut s = s;
    loop {
        if s.is_empty() {
            return s;
        }
        s = s.trim_ascii_start();
        if s.starts_with(b"\\\r") || s.starts_with(b"\\\n") {
            s = &s[2..];
        } else {
            return s;
        }
    }
}

pub fn dirname(s: &Bytes) -> Bytes {
    match memrchr(b'/', s) {
        Some(0) => Bytes::from_static(b"/"),
        Some(found) => s.slice(..found),
        None => Bytes::from_static(b"."),
    }
}

pub fn basename(s: &[u8]) -> &[u8] {
    match memrchr(b'/', s) {
        Some(found) => &s[found + 1..],
        None => s,
    }
}

/// Splits a target name into its directory part (trailing slash kept)
/// and file part.
pub fn split_dir_file(s: &Bytes) -> (Bytes, Bytes) {
    match memrchr(b'/', s) {
        Some(idx) => (s.slice(..idx + 1), s.slice(idx + 1..)),
        None => (Bytes::new(), s.clone()),
    }
}

pub fn normalize_path(mut o: &[u8]) -> Bytes {
    if o.is_empty() {
        return Bytes::new();
    }
    let mut ret = BytesMut::new();
    if o.starts_with(b"/") {
        ret.put_u8(b'/');
        o = &o[1..];
    }
    while !o.is_empty() {
        let idx = memchr(b'/', o);
        let (dir, rest) = match idx {
            Some(idx) => (&o[..idx], &o[idx + 1..]),
            None => (o, [].as_slice()),
        };
        o = rest;

        if dir == b"." || (dir == b".." && ret.as_ref() == b"/") {
            continue;
        } else if dir == b".." && !ret.is_empty() && ret.as_ref() != b".." && !ret.ends_with(b"/..")
        {
            match memrchr(b'/', ret.as_ref()) {
                Some(index) => {
                    if index == 0 {
                        ret.truncate(1);
                    } else {
                        ret.truncate(index);
                    }
                }
                None => {
                    ret.truncate(0);
                }
            }
        } else if !dir.is_empty() {
            if !ret.is_empty() && !ret.ends_with(b"/") {
                ret.put_u8(b'/');
            }
            ret.put_slice(dir);
        }
    }
    ret.into()
}

pub fn concat_dir(b: &[u8], n: &[u8]) -> Bytes {
    let mut r = BytesMut::new();
    if !b.is_empty() && !n.starts_with(b"/") {
        r.put_slice(b);
        r.put_u8(b'/');
    }
    r.put_slice(n);
    normalize_path(&r)
}

#[derive(Debug, PartialEq)]
pub struct EndOfLine {
    pub line: Bytes,
    pub rest: Bytes,
}

/// Finds the end of the first command line in `buf`: an unescaped
/// newline. Backslash continuations stay inside the line for the shell.
pub fn find_end_of_line(buf: &Bytes) -> EndOfLine {
    let mut e = 0usize;
    while e < buf.len() {
        e += skip_until2(&buf[e..], b'\n', b'\\');
        if e >= buf.len() {
            break;
        }
        let c = &buf[e..];
        if c.starts_with(b"\\\r\n") {
            e += 3;
        } else if c.starts_with(b"\\\n") || c.starts_with(b"\\\\") {
            e += 2;
        } else if c.starts_with(b"\\") {
            e += 1;
        } else {
            return EndOfLine {
                line: buf.slice(..e),
                rest: buf.slice(e + 1..),
            };
        }
    }
    EndOfLine {
        line: buf.clone(),
        rest: Bytes::new(),
    }
}

pub fn escape_shell(s: &Bytes) -> Bytes {
    let delimiters = b"\"$\\`";
    let mut prev = 0;
    let mut i = skip_until(s, delimiters);
    if i == s.len() {
        return s.clone();
    }

    let mut r = BytesMut::new();
    while i < s.len() {
        r.put_slice(&s[prev..i]);
        let c = s[i];
        r.put_u8(b'\\');
        if s[i..].starts_with(b"$$") {
            r.put_u8(b'$');
            i += 1;
        }
        r.put_u8(c);
        i += 1;
        prev = i;
        i += skip_until(&s[i..], delimiters);
    }
    r.put_slice(&s[prev..]);
    r.into()
}

/// A `%` template split into its prefix and suffix. Backslash escapes
/// (`\%`, `\\`) are understood only up to the first real `%`; a template
/// without one matches only itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    prefix: Bytes,
    suffix: Option<Bytes>,
}

impl Pattern {
    pub fn new(template: &Bytes) -> Pattern {
        let mut prefix = BytesMut::with_capacity(template.len());
        let mut i = 0;
        while i < template.len() {
            match template[i] {
                b'\\' => {
                    let start = i;
                    while i < template.len() && template[i] == b'\\' {
                        i += 1;
                    }
                    let n = i - start;
                    if i < template.len() && template[i] == b'%' {
                        for _ in 0..n / 2 {
                            prefix.put_u8(b'\\');
                        }
                        if n % 2 == 1 {
                            prefix.put_u8(b'%');
                            i += 1;
                        } else {
                            return Pattern {
                                prefix: prefix.freeze(),
                                suffix: Some(template.slice(i + 1..)),
                            };
                        }
                    } else {
                        for _ in 0..n {
                            prefix.put_u8(b'\\');
                        }
                    }
                }
                b'%' => {
                    return Pattern {
                        prefix: prefix.freeze(),
                        suffix: Some(template.slice(i + 1..)),
                    };
                }
                c => {
                    prefix.put_u8(c);
                    i += 1;
                }
            }
        }
        Pattern {
            prefix: prefix.freeze(),
            suffix: None,
        }
    }

    pub fn is_pattern(&self) -> bool {
        self.suffix.is_some()
    }

    pub fn is_match_any(&self) -> bool {
        self.prefix.is_empty() && self.suffix.as_ref().is_some_and(|s| s.is_empty())
    }

    /// Returns the stem matched by `%`, or the whole word when the
    /// template has no `%` and equals the word exactly.
    pub fn match_stem(&self, word: &[u8]) -> Option<Bytes> {
        match &self.suffix {
            Some(suffix) => {
                if word.len() >= self.prefix.len() + suffix.len()
                    && word.starts_with(&self.prefix)
                    && word.ends_with(suffix)
                {
                    Some(Bytes::copy_from_slice(
                        &word[self.prefix.len()..word.len() - suffix.len()],
                    ))
                } else {
                    None
                }
            }
            None => (word == self.prefix).then(|| Bytes::copy_from_slice(word)),
        }
    }

    /// Re-inserts `stem` into the template, prefixed by `dir`.
    pub fn resolve(&self, dir: &[u8], stem: &[u8]) -> Bytes {
        match &self.suffix {
            Some(suffix) => {
                let mut out = BytesMut::with_capacity(
                    dir.len() + self.prefix.len() + stem.len() + suffix.len(),
                );
                out.put_slice(dir);
                out.put_slice(&self.prefix);
                out.put_slice(stem);
                out.put_slice(suffix);
                out.freeze()
            }
            None => self.prefix.clone(),
        }
    }

    /// Substitutes the stem of `word` into `replacement`'s own `%`. A
    /// replacement without `%` is returned verbatim.
    pub fn subst(&self, replacement: &Bytes, word: &[u8], must_match: bool) -> Result<Bytes> {
        match self.match_stem(word) {
            Some(stem) => {
                if !self.is_pattern() {
                    return Ok(replacement.clone());
                }
                Ok(Pattern::new(replacement).resolve(b"", &stem))
            }
            None => {
                if must_match {
                    return Err(DataError(format!(
                        "target '{}' doesn't match the target pattern",
                        String::from_utf8_lossy(word)
                    ))
                    .into());
                }
                Ok(Bytes::copy_from_slice(word))
            }
        }
    }
}

/// `$(VAR:pat=subst)` reference semantics: a pattern without `%`
/// replaces a trailing suffix instead of the whole word.
pub fn subst_ref(pat: &Bytes, subst: &Bytes, word: &[u8]) -> Bytes {
    let p = Pattern::new(pat);
    if p.is_pattern() {
        match p.match_stem(word) {
            Some(stem) => Pattern::new(subst).resolve(b"", &stem),
            None => Bytes::copy_from_slice(word),
        }
    } else if let Some(stripped) = word.strip_suffix(pat.as_ref()) {
        let mut out = BytesMut::with_capacity(stripped.len() + subst.len());
        out.put_slice(stripped);
        out.put_slice(subst);
        out.freeze()
    } else {
        Bytes::copy_from_slice(word)
    }
}
