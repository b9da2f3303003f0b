/// Comment delimiters for a filetype. `suffix` is empty for line comments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommentDelimiters {
    pub prefix: String,
    pub suffix: String,
}

impl CommentDelimiters {
    pub fn line(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            suffix: String::new(),
        }
    }

    pub fn block(prefix: &str, suffix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        }
    }

    pub fn is_block(&self) -> bool {
        !self.suffix.is_empty()
    }

    /// Parse an editor comment string such as `// %s` or `<!-- %s -->`.
    pub fn from_commentstring(commentstring: &str) -> Option<Self> {
        let (prefix, suffix) = commentstring.split_once("%s")?;
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return None;
        }
        Some(Self::block(prefix, suffix.trim()))
    }
}

/// Look up delimiters for a filetype. Unknown filetypes fall back to `#`.
pub fn detect_comment_delimiters(filetype: &str) -> CommentDelimiters {
    match filetype {
        "c" | "cpp" | "cs" | "dart" | "go" | "java" | "javascript" | "javascriptreact"
        | "kotlin" | "php" | "proto" | "rust" | "scala" | "swift" | "typescript"
        | "typescriptreact" | "zig" | "jsonc" => CommentDelimiters::line("//"),
        "lua" | "sql" | "haskell" | "elm" | "ada" => CommentDelimiters::line("--"),
        "vim" => CommentDelimiters::line("\""),
        "lisp" | "scheme" | "clojure" | "fennel" | "asm" => CommentDelimiters::line(";"),
        "erlang" | "elixir_eex" | "tex" | "latex" | "matlab" => CommentDelimiters::line("%"),
        "html" | "xml" | "markdown" | "vue" | "svelte" => CommentDelimiters::block("<!--", "-->"),
        "css" | "scss" | "less" => CommentDelimiters::block("/*", "*/"),
        "ocaml" => CommentDelimiters::block("(*", "*)"),
        _ => CommentDelimiters::line("#"),
    }
}
