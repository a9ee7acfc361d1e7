//! Python packages whose import name differs from their distribution name.

/// `(import name, distribution name)` pairs.
pub const ALIASES: &[(&str, &str)] = &[
  ("cv2", "opencv-python"),
  ("PIL", "Pillow"),
  ("yaml", "PyYAML"),
  ("sklearn", "scikit-learn"),
  ("skimage", "scikit-image"),
  ("bs4", "beautifulsoup4"),
  ("dateutil", "python-dateutil"),
  ("dotenv", "python-dotenv"),
  ("jwt", "PyJWT"),
  ("serial", "pyserial"),
  ("Crypto", "pycryptodome"),
];

/// The distribution that provides the module `import`.
pub fn distribution_for(import: &str) -> &str {
  ALIASES.iter().find(|(i, _)| *i == import).map_or(import, |(_, dist)| *dist)
}

/// The top-level module installed by `distribution`. Distribution names are
/// matched case-insensitively; unknown ones import under their own name with
/// dashes turned into underscores.
pub fn import_for(distribution: &str) -> String {
  ALIASES
    .iter()
    .find(|(_, dist)| dist.eq_ignore_ascii_case(distribution))
    .map_or_else(|| distribution.replace('-', "_"), |(import, _)| (*import).to_owned())
}
