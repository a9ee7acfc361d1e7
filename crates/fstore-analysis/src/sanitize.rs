//! Input normalisation applied to a submission before it is gated.
//!
//! Emoji are stripped everywhere for terminal stability, full-width spaces
//! become ASCII spaces, and the text fields get redundant separators
//! collapsed. Code keeps its whitespace untouched apart from U+3000.

use std::sync::LazyLock;

use regex::Regex;

use fstore_core::function::NewFunction;

static EMOJI: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(concat!(
    "[",
    r"\x{1F300}-\x{1F5FF}",
    r"\x{1F600}-\x{1F64F}",
    r"\x{1F680}-\x{1F6FF}",
    r"\x{1F900}-\x{1F9FF}",
    r"\x{1F1E0}-\x{1F1FF}",
    r"\x{2300}-\x{23FF}",
    r"\x{2600}-\x{26FF}",
    r"\x{2700}-\x{27BF}",
    r"\x{FE0F}",
    "]+",
  ))
  .expect("emoji ranges are a valid pattern")
});

static SPACES: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(" {2,}").expect("literal pattern is valid"));
static UNDERSCORES: LazyLock<Regex> =
  LazyLock::new(|| Regex::new("_{2,}").expect("literal pattern is valid"));

fn replace_all(re: &Regex, text: &str, with: &str) -> String {
  re.replace_all(text, with).into_owned()
}

fn strip_emoji(text: &str) -> String { replace_all(&EMOJI, text, "") }

/// Normalise a name, description or tag.
pub fn clean_text(text: &str) -> String {
  let text = strip_emoji(&text.replace('\u{3000}', " "));
  let text = replace_all(&SPACES, &text, " ");
  let text = replace_all(&UNDERSCORES, &text, "_");
  text.trim().to_owned()
}

/// Strip emoji and full-width spaces from source code.
pub fn clean_code(code: &str) -> String { strip_emoji(code).replace('\u{3000}', " ") }

/// Sanitise every free-text field of a submission in place.
pub fn sanitize(input: &mut NewFunction) {
  input.name = clean_text(&input.name);
  input.code = clean_code(&input.code);
  input.description = clean_text(&input.description);
  input.description_en = input.description_en.as_deref().map(clean_text);
  input.description_jp = input.description_jp.as_deref().map(clean_text);
  input.tags = input
    .tags
    .iter()
    .map(|tag| clean_text(tag))
    .filter(|tag| !tag.is_empty())
    .collect();
  input.entry_point = input
    .entry_point
    .as_deref()
    .map(str::trim)
    .filter(|ep| !ep.is_empty())
    .map(str::to_owned);
}
