//! Source-language checks for generated patches
//!
//! A candidate must look like source code from its first line and, for the
//! languages we have grammars for, parse without error nodes.

use regex::Regex;
use std::cell::RefCell;
use std::path::Path;
use std::sync::OnceLock;
use tree_sitter::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Rust,
    JavaScript,
    TypeScript,
    Python,
    Go,
    Unknown,
}

impl Language {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "rs" => Language::Rust,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "tsx" => Language::TypeScript,
            "py" | "pyi" => Language::Python,
            "go" => Language::Go,
            _ => Language::Unknown,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(Language::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Python => "python",
            Language::Go => "go",
            Language::Unknown => "unknown",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  THREAD-LOCAL PARSER POOL
// ═══════════════════════════════════════════════════════════════════════════

thread_local! {
    static RUST_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // A language that fails to load surfaces as a parse failure below
        let _ = p.set_language(&tree_sitter_rust::LANGUAGE.into());
        p
    });

    static JS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_javascript::LANGUAGE.into());
        p
    });

    static TS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into());
        p
    });

    static TSX_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_typescript::LANGUAGE_TSX.into());
        p
    });

    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });

    static GO_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_go::LANGUAGE.into());
        p
    });
}

fn parse_with_pooled_parser(
    content: &str,
    language: Language,
    path: &Path,
) -> anyhow::Result<tree_sitter::Tree> {
    let parse_result = match language {
        Language::Rust => RUST_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::JavaScript => JS_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::TypeScript => {
            let use_tsx = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("tsx"))
                .unwrap_or(false);
            if use_tsx {
                TSX_PARSER.with(|p| p.borrow_mut().parse(content, None))
            } else {
                TS_PARSER.with(|p| p.borrow_mut().parse(content, None))
            }
        }
        Language::Python => PYTHON_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Go => GO_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Unknown => return Err(anyhow::anyhow!("Unknown language")),
    };

    parse_result.ok_or_else(|| anyhow::anyhow!("Failed to parse {}", path.display()))
}

/// `Some(true)` if parsing produced error nodes, `None` for unsupported languages.
pub fn has_syntax_errors(path: &Path, content: &str) -> anyhow::Result<Option<bool>> {
    let language = Language::from_path(path);
    if language == Language::Unknown {
        return Ok(None);
    }
    let tree = parse_with_pooled_parser(content, language, path)?;
    Ok(Some(tree.root_node().has_error()))
}

/// Openers that mean the model answered in prose instead of code.
const CHATTER_PREFIXES: &[&str] = &[
    "here is",
    "here's",
    "sure",
    "certainly",
    "below is",
    "the following",
    "i've",
    "i have",
    "i ",
    "this ",
    "to fix",
    "the issue",
    "the error",
];

fn first_line_pattern(language: Language) -> Option<&'static Regex> {
    static PATTERNS: OnceLock<Vec<(Language, Regex)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            (
                Language::Python,
                r#"^(#|import\s|from\s|"""|'''|def\s|class\s|async\s|@|if\s|try:|with\s|[A-Za-z_][A-Za-z0-9_.]*\s*(=|:|\())"#,
            ),
            (
                Language::Rust,
                r"^(//|/\*|#!?\[|use\s|mod\s|pub\b|fn\s|struct\s|enum\s|const\s|static\s|impl\b|extern\s|type\s|trait\s|unsafe\s|async\s|macro_rules!)",
            ),
            (
                Language::JavaScript,
                r#"^(//|/\*|#!|import\b|export\s|const\s|let\s|var\s|function\b|class\s|async\s|['"]use strict['"]|module\.|require\(|\(|[A-Za-z_$][A-Za-z0-9_$.]*\s*(=|\())"#,
            ),
            (
                Language::TypeScript,
                r#"^(//|/\*|#!|import\b|export\s|const\s|let\s|var\s|function\b|class\s|async\s|interface\s|type\s|declare\s|enum\s|abstract\s|@|['"]use strict['"]|[A-Za-z_$][A-Za-z0-9_$.]*\s*(=|\())"#,
            ),
            (Language::Go, r"^(//|/\*|package\s)"),
        ]
        .into_iter()
        .filter_map(|(lang, p)| Regex::new(p).ok().map(|re| (lang, re)))
        .collect()
    });
    patterns
        .iter()
        .find(|(lang, _)| *lang == language)
        .map(|(_, re)| re)
}

/// Whether the candidate starts the way a source file in this language would.
///
/// When the original opens with a shebang the candidate must keep one.
pub fn plausible_preamble(path: &Path, original: &str, candidate: &str) -> bool {
    let Some(first) = candidate.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return false;
    };

    let lower = first.to_lowercase();
    if CHATTER_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return false;
    }

    if original.starts_with("#!") && !candidate.trim_start().starts_with("#!") {
        return false;
    }

    match first_line_pattern(Language::from_path(path)) {
        Some(re) => re.is_match(first),
        None => true,
    }
}
