use std::path::Path;

/// Guess an editor filetype name from a file extension.
pub fn filetype_for(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let name = match ext.as_str() {
        "rs" => "rust",
        "py" | "pyi" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "ts" | "mts" => "typescript",
        "tsx" => "typescriptreact",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
        "cs" => "cs",
        "kt" | "kts" => "kotlin",
        "rb" => "ruby",
        "sh" | "bash" => "sh",
        "hs" => "haskell",
        "ml" | "mli" => "ocaml",
        "md" | "markdown" => "markdown",
        "htm" | "html" => "html",
        "clj" | "cljs" => "clojure",
        "scm" | "ss" => "scheme",
        "el" | "lisp" => "lisp",
        "ex" | "exs" => "elixir",
        "erl" | "hrl" => "erlang",
        "yml" => "yaml",
        "vimrc" => "vim",
        other => other,
    };
    name.to_string()
}
