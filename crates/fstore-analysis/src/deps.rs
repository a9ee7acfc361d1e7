//! Dependency detection from source text.
//!
//! Third-party packages come from `import` statements, with standard library
//! modules filtered out and import names mapped to their distribution names.
//! Internal references are calls to other stored functions by name.

use std::collections::{BTreeSet, HashSet};

use rustpython_parser::ast::{Expr, Stmt};

use fstore_core::packages;

use crate::python::{self, Node};

const STDLIB: &[&str] = &[
  "__future__", "abc", "argparse", "array", "ast", "asyncio", "base64", "binascii",
  "bisect", "builtins", "bz2", "calendar", "cmath", "codecs", "collections",
  "colorsys", "concurrent", "configparser", "contextlib", "copy", "csv", "ctypes",
  "dataclasses", "datetime", "decimal", "difflib", "dis", "email", "enum", "errno",
  "fnmatch", "fractions", "functools", "gc", "getpass", "glob", "gzip", "hashlib",
  "heapq", "hmac", "html", "http", "importlib", "inspect", "io", "ipaddress",
  "itertools", "json", "keyword", "locale", "logging", "lzma", "math", "mimetypes",
  "multiprocessing", "numbers", "operator", "os", "pathlib", "pickle", "platform",
  "pprint", "queue", "random", "re", "secrets", "select", "shlex", "shutil",
  "signal", "socket", "sqlite3", "ssl", "statistics", "string", "struct",
  "subprocess", "sys", "tempfile", "textwrap", "threading", "time", "timeit",
  "tomllib", "traceback", "types", "typing", "unicodedata", "unittest", "urllib",
  "uuid", "warnings", "weakref", "xml", "zipfile", "zlib", "zoneinfo",
];

/// Map an import name to the package that provides it.
pub fn map_alias(name: &str) -> &str { packages::distribution_for(name) }

pub fn is_stdlib(name: &str) -> bool { STDLIB.contains(&name) }

/// Third-party distributions imported by `code`, sorted and deduplicated.
///
/// Unparseable code yields an empty set; the gate reports the syntax error.
pub fn extract_imports(code: &str) -> BTreeSet<String> {
  let Ok(body) = python::parse_module(code) else {
    return BTreeSet::new();
  };

  let mut roots = Vec::new();
  python::walk(&body, &mut |node| match node {
    Node::Stmt(Stmt::Import(s)) => {
      roots.extend(s.names.iter().map(|alias| top_level(alias.name.as_str())));
    }
    Node::Stmt(Stmt::ImportFrom(s)) => {
      let relative = s.level.as_ref().is_some_and(|level| level.to_u32() > 0);
      if let (Some(module), false) = (&s.module, relative) {
        roots.push(top_level(module.as_str()));
      }
    }
    _ => {}
  });

  roots
    .into_iter()
    .filter(|root| !root.is_empty() && !is_stdlib(root))
    .map(|root| map_alias(root).to_owned())
    .collect()
}

fn top_level(module: &str) -> &str { module.split('.').next().unwrap_or(module) }

/// Names from `known_names` that `code` calls, excluding names the code
/// defines itself.
pub fn find_internal_references<S: AsRef<str>>(
  code: &str,
  known_names: &[S],
) -> BTreeSet<String> {
  let Ok(body) = python::parse_module(code) else {
    return BTreeSet::new();
  };

  let known: HashSet<&str> = known_names.iter().map(|n| n.as_ref()).collect();
  let defined: HashSet<&str> = body
    .iter()
    .filter_map(|stmt| match stmt {
      Stmt::FunctionDef(f) => Some(f.name.as_str()),
      Stmt::AsyncFunctionDef(f) => Some(f.name.as_str()),
      Stmt::ClassDef(c) => Some(c.name.as_str()),
      _ => None,
    })
    .collect();

  let mut found = BTreeSet::new();
  python::walk(&body, &mut |node| {
    if let Node::Expr(Expr::Call(call)) = node
      && let Expr::Name(name) = call.func.as_ref()
    {
      let id = name.id.as_str();
      if known.contains(id) && !defined.contains(id) {
        found.insert(id.to_owned());
      }
    }
  });
  found
}

/// Order `root` and everything it transitively references so that every
/// function appears after the functions it calls. Cycles are broken at the
/// first revisit.
pub fn bundle_order<F>(root: &str, mut references: F) -> Vec<String>
where
  F: FnMut(&str) -> Vec<String>,
{
  fn visit<F: FnMut(&str) -> Vec<String>>(
    name: &str,
    references: &mut F,
    seen: &mut HashSet<String>,
    order: &mut Vec<String>,
  ) {
    if !seen.insert(name.to_owned()) {
      return;
    }
    for dep in references(name) {
      visit(&dep, references, seen, order);
    }
    order.push(name.to_owned());
  }

  let mut seen = HashSet::new();
  let mut order = Vec::new();
  visit(root, &mut references, &mut seen, &mut order);
  order
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;

  use super::*;

  #[test]
  fn imports_are_mapped_and_filtered() {
    let code = "\
import os, sys
import numpy as np
import cv2
from PIL import Image
from sklearn.linear_model import LinearRegression
from collections import defaultdict
from . import sibling
from .local_module import helper
";
    let deps: Vec<_> = extract_imports(code).into_iter().collect();
    assert_eq!(deps, vec!["Pillow", "numpy", "opencv-python", "scikit-learn"]);
  }

  #[test]
  fn nested_imports_are_found() {
    let code = "def f():\n    import requests\n    return requests.get('x')\n";
    assert_eq!(
      extract_imports(code).into_iter().collect::<Vec<_>>(),
      vec!["requests"]
    );
  }

  #[test]
  fn unparseable_code_has_no_imports() {
    assert!(extract_imports("import (").is_empty());
  }

  #[test]
  fn internal_references_exclude_own_definitions() {
    let code = "\
def helper(x):
    return normalize(x)

def main(x):
    return helper(x) + scale(x)
";
    let refs = find_internal_references(code, &["normalize", "scale", "helper", "unused"]);
    assert_eq!(refs.into_iter().collect::<Vec<_>>(), vec!["normalize", "scale"]);
  }

  #[test]
  fn bundle_order_puts_dependencies_first_and_survives_cycles() {
    let graph: HashMap<&str, Vec<String>> = HashMap::from([
      ("main", vec!["b".to_owned(), "a".to_owned()]),
      ("a", vec!["c".to_owned()]),
      ("b", vec!["c".to_owned()]),
      ("c", vec!["main".to_owned()]),
    ]);
    let order = bundle_order("main", |name| graph.get(name).cloned().unwrap_or_default());
    assert_eq!(order, vec!["c", "b", "a", "main"]);
  }
}
