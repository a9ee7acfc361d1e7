//! Parsing and tree walking shared by the gate and the dependency resolver.

use rustpython_parser::{
  Mode as ParseMode,
  ast::{self as pyast, Expr, Stmt},
  parse as parse_python,
};

use fstore_core::Rejection;

/// Parse `code` as a module and return its top-level statements.
pub(crate) fn parse_module(code: &str) -> Result<Vec<Stmt>, Rejection> {
  match parse_python(code, ParseMode::Module, "<snippet>") {
    Ok(pyast::Mod::Module(module)) => Ok(module.body),
    Ok(_) => Ok(Vec::new()),
    Err(err) => {
      let offset = (u32::from(err.offset) as usize).min(code.len());
      let line = code
        .get(..offset)
        .map_or(1, |prefix| prefix.matches('\n').count() + 1);
      Err(Rejection::Syntax { line, message: err.error.to_string() })
    }
  }
}

/// A node visited by [`walk`].
#[derive(Clone, Copy)]
pub(crate) enum Node<'a> {
  Stmt(&'a Stmt),
  Expr(&'a Expr),
}

/// Visit every statement and expression reachable from `body`, parents before
/// children.
pub(crate) fn walk<'a, F: FnMut(Node<'a>)>(body: &'a [Stmt], visit: &mut F) {
  for stmt in body {
    walk_stmt(stmt, visit);
  }
}

fn walk_exprs<'a, F: FnMut(Node<'a>)>(exprs: &'a [Expr], visit: &mut F) {
  for expr in exprs {
    walk_expr(expr, visit);
  }
}

fn walk_opt<'a, F: FnMut(Node<'a>)>(expr: &'a Option<Box<Expr>>, visit: &mut F) {
  if let Some(expr) = expr {
    walk_expr(expr, visit);
  }
}

fn walk_defaults<'a, F: FnMut(Node<'a>)>(args: &'a pyast::Arguments, visit: &mut F) {
  for arg in args.posonlyargs.iter().chain(&args.args).chain(&args.kwonlyargs) {
    walk_opt(&arg.default, visit);
  }
}

fn walk_handlers<'a, F: FnMut(Node<'a>)>(
  handlers: &'a [pyast::ExceptHandler],
  visit: &mut F,
) {
  for handler in handlers {
    let pyast::ExceptHandler::ExceptHandler(handler) = handler;
    walk_opt(&handler.type_, visit);
    walk(&handler.body, visit);
  }
}

fn walk_with_items<'a, F: FnMut(Node<'a>)>(items: &'a [pyast::WithItem], visit: &mut F) {
  for item in items {
    walk_expr(&item.context_expr, visit);
    walk_opt(&item.optional_vars, visit);
  }
}

fn walk_stmt<'a, F: FnMut(Node<'a>)>(stmt: &'a Stmt, visit: &mut F) {
  visit(Node::Stmt(stmt));
  match stmt {
    Stmt::FunctionDef(s) => {
      walk_exprs(&s.decorator_list, visit);
      walk_defaults(&s.args, visit);
      walk(&s.body, visit);
    }
    Stmt::AsyncFunctionDef(s) => {
      walk_exprs(&s.decorator_list, visit);
      walk_defaults(&s.args, visit);
      walk(&s.body, visit);
    }
    Stmt::ClassDef(s) => {
      walk_exprs(&s.decorator_list, visit);
      walk_exprs(&s.bases, visit);
      walk(&s.body, visit);
    }
    Stmt::Return(s) => walk_opt(&s.value, visit),
    Stmt::Delete(s) => walk_exprs(&s.targets, visit),
    Stmt::Assign(s) => {
      walk_exprs(&s.targets, visit);
      walk_expr(&s.value, visit);
    }
    Stmt::AugAssign(s) => {
      walk_expr(&s.target, visit);
      walk_expr(&s.value, visit);
    }
    Stmt::AnnAssign(s) => {
      walk_expr(&s.target, visit);
      walk_opt(&s.value, visit);
    }
    Stmt::For(s) => {
      walk_expr(&s.target, visit);
      walk_expr(&s.iter, visit);
      walk(&s.body, visit);
      walk(&s.orelse, visit);
    }
    Stmt::AsyncFor(s) => {
      walk_expr(&s.target, visit);
      walk_expr(&s.iter, visit);
      walk(&s.body, visit);
      walk(&s.orelse, visit);
    }
    Stmt::While(s) => {
      walk_expr(&s.test, visit);
      walk(&s.body, visit);
      walk(&s.orelse, visit);
    }
    Stmt::If(s) => {
      walk_expr(&s.test, visit);
      walk(&s.body, visit);
      walk(&s.orelse, visit);
    }
    Stmt::With(s) => {
      walk_with_items(&s.items, visit);
      walk(&s.body, visit);
    }
    Stmt::AsyncWith(s) => {
      walk_with_items(&s.items, visit);
      walk(&s.body, visit);
    }
    Stmt::Raise(s) => {
      walk_opt(&s.exc, visit);
      walk_opt(&s.cause, visit);
    }
    Stmt::Try(s) => {
      walk(&s.body, visit);
      walk_handlers(&s.handlers, visit);
      walk(&s.orelse, visit);
      walk(&s.finalbody, visit);
    }
    Stmt::TryStar(s) => {
      walk(&s.body, visit);
      walk_handlers(&s.handlers, visit);
      walk(&s.orelse, visit);
      walk(&s.finalbody, visit);
    }
    Stmt::Assert(s) => {
      walk_expr(&s.test, visit);
      walk_opt(&s.msg, visit);
    }
    Stmt::Expr(s) => walk_expr(&s.value, visit),
    Stmt::Match(s) => {
      walk_expr(&s.subject, visit);
      for case in &s.cases {
        walk_opt(&case.guard, visit);
        walk(&case.body, visit);
      }
    }
    _ => {}
  }
}

fn walk_generators<'a, F: FnMut(Node<'a>)>(
  generators: &'a [pyast::Comprehension],
  visit: &mut F,
) {
  for generator in generators {
    walk_expr(&generator.target, visit);
    walk_expr(&generator.iter, visit);
    walk_exprs(&generator.ifs, visit);
  }
}

fn walk_expr<'a, F: FnMut(Node<'a>)>(expr: &'a Expr, visit: &mut F) {
  visit(Node::Expr(expr));
  match expr {
    Expr::BoolOp(e) => walk_exprs(&e.values, visit),
    Expr::NamedExpr(e) => {
      walk_expr(&e.target, visit);
      walk_expr(&e.value, visit);
    }
    Expr::BinOp(e) => {
      walk_expr(&e.left, visit);
      walk_expr(&e.right, visit);
    }
    Expr::UnaryOp(e) => walk_expr(&e.operand, visit),
    Expr::Lambda(e) => {
      walk_defaults(&e.args, visit);
      walk_expr(&e.body, visit);
    }
    Expr::IfExp(e) => {
      walk_expr(&e.test, visit);
      walk_expr(&e.body, visit);
      walk_expr(&e.orelse, visit);
    }
    Expr::Dict(e) => {
      for key in e.keys.iter().flatten() {
        walk_expr(key, visit);
      }
      walk_exprs(&e.values, visit);
    }
    Expr::Set(e) => walk_exprs(&e.elts, visit),
    Expr::ListComp(e) => {
      walk_expr(&e.elt, visit);
      walk_generators(&e.generators, visit);
    }
    Expr::SetComp(e) => {
      walk_expr(&e.elt, visit);
      walk_generators(&e.generators, visit);
    }
    Expr::DictComp(e) => {
      walk_expr(&e.key, visit);
      walk_expr(&e.value, visit);
      walk_generators(&e.generators, visit);
    }
    Expr::GeneratorExp(e) => {
      walk_expr(&e.elt, visit);
      walk_generators(&e.generators, visit);
    }
    Expr::Await(e) => walk_expr(&e.value, visit),
    Expr::Yield(e) => walk_opt(&e.value, visit),
    Expr::YieldFrom(e) => walk_expr(&e.value, visit),
    Expr::Compare(e) => {
      walk_expr(&e.left, visit);
      walk_exprs(&e.comparators, visit);
    }
    Expr::Call(e) => {
      walk_expr(&e.func, visit);
      walk_exprs(&e.args, visit);
      for keyword in &e.keywords {
        walk_expr(&keyword.value, visit);
      }
    }
    Expr::FormattedValue(e) => walk_expr(&e.value, visit),
    Expr::JoinedStr(e) => walk_exprs(&e.values, visit),
    Expr::Attribute(e) => walk_expr(&e.value, visit),
    Expr::Subscript(e) => {
      walk_expr(&e.value, visit);
      walk_expr(&e.slice, visit);
    }
    Expr::Starred(e) => walk_expr(&e.value, visit),
    Expr::List(e) => walk_exprs(&e.elts, visit),
    Expr::Tuple(e) => walk_exprs(&e.elts, visit),
    Expr::Slice(e) => {
      walk_opt(&e.lower, visit);
      walk_opt(&e.upper, visit);
      walk_opt(&e.step, visit);
    }
    _ => {}
  }
}

/// The dotted name of a call target, e.g. `os.system` or `eval`. `None` for
/// targets that are not plain names or attribute chains.
pub(crate) fn dotted_name(expr: &Expr) -> Option<String> {
  match expr {
    Expr::Name(name) => Some(name.id.as_str().to_owned()),
    Expr::Attribute(attr) => {
      let base = dotted_name(&attr.value)?;
      Some(format!("{base}.{}", attr.attr.as_str()))
    }
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn syntax_error_reports_line() {
    let err = parse_module("x = 1\ndef f(:\n  pass\n").unwrap_err();
    match err {
      Rejection::Syntax { line, .. } => assert_eq!(line, 2),
      other => panic!("unexpected rejection: {other:?}"),
    }
  }

  #[test]
  fn walk_reaches_nested_calls() {
    let body = parse_module(
      "def outer():\n  if True:\n    for i in range(3):\n      helper(i)\n",
    )
    .unwrap();
    let mut calls = Vec::new();
    walk(&body, &mut |node| {
      if let Node::Expr(Expr::Call(call)) = node {
        calls.extend(dotted_name(&call.func));
      }
    });
    assert_eq!(calls, vec!["range".to_owned(), "helper".to_owned()]);
  }
}
