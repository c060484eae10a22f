//! Script snippets and the `main` wrapper
//!
//! General scripts may `return` at top level, so their body is embedded in a
//! synthetic `main` function. Module imports must stay at module scope and
//! are hoisted above the wrapper.

use regex::Regex;

const IMPORT_STATEMENT: &str = r#"import([ \n\t]*(?:[^ \n\t\{\}]+[ \n\t]*,?)?(?:[ \n\t]*\{(?:[ \n\t]*[^ \n\t"'\{\}]+[ \n\t]*,?)+\})?[ \n\t]*)from[ \n\t]*(['"])([^'"\n]+)(?:['"])"#;

/// One parsed import statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportStatement {
    /// The statement as written
    pub line: String,
    /// Default binding, `x` in `import x from 'm'`
    pub default_binding: Option<String>,
    /// Named bindings as `(exported, local)` pairs
    pub named: Vec<(String, String)>,
    pub module: String,
}

/// Recognizes import lines
#[derive(Debug, Clone)]
pub struct ImportPattern {
    pattern: Regex,
}

impl ImportPattern {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(IMPORT_STATEMENT)?,
        })
    }

    pub fn parse(&self, line: &str) -> Option<ImportStatement> {
        let captures = self.pattern.captures(line)?;
        let clause = captures.get(1).map_or("", |m| m.as_str());
        let module = captures.get(3)?.as_str().to_string();

        let (outside, inside) = match (clause.find('{'), clause.rfind('}')) {
            (Some(open), Some(close)) if open < close => (
                format!("{}{}", &clause[..open], &clause[close + 1..]),
                &clause[open + 1..close],
            ),
            _ => (clause.to_string(), ""),
        };

        let default_binding = outside
            .split(|c: char| c == ',' || c.is_whitespace())
            .find(|part| !part.is_empty())
            .map(str::to_string);

        let mut named = Vec::new();
        for item in inside.split(',') {
            let words: Vec<&str> = item.split_whitespace().collect();
            match words.as_slice() {
                [name] => named.push((name.to_string(), name.to_string())),
                [name, "as", alias] => named.push((name.to_string(), alias.to_string())),
                _ => {}
            }
        }

        Some(ImportStatement {
            line: line.to_string(),
            default_binding,
            named,
            module,
        })
    }

    /// Split `source` into import lines and the remaining body lines
    pub fn split(&self, source: &str) -> (Vec<ImportStatement>, String) {
        if !self.pattern.is_match(source) {
            return (Vec::new(), source.to_string());
        }
        let mut imports = Vec::new();
        let mut body = Vec::new();
        for line in source.lines() {
            match self.parse(line) {
                Some(import) => imports.push(import),
                None => body.push(line),
            }
        }
        (imports, body.join("\n"))
    }
}

/// A script about to be compiled
#[derive(Debug, Clone)]
pub struct Snippet {
    /// Method or property the script belongs to
    pub name: String,
    pub source: String,
    /// Id of the schema node or entity the source came from
    pub code_source: Option<String>,
    /// Rows to add to reported error positions
    pub start_row: usize,
    /// Wrap the body in `main`
    pub embed: bool,
    pub imports: Vec<ImportStatement>,
    /// Source without its import lines
    pub body: String,
}

impl Snippet {
    pub fn new(name: &str, source: &str, imports: &ImportPattern) -> Self {
        let (found, body) = imports.split(source);
        Self {
            name: name.to_string(),
            source: source.to_string(),
            code_source: None,
            start_row: 0,
            embed: true,
            imports: found,
            body,
        }
    }

    pub fn with_code_source(mut self, code_source: Option<&str>) -> Self {
        self.code_source = code_source.map(str::to_string);
        self
    }

    pub fn with_start_row(mut self, start_row: usize) -> Self {
        self.start_row = start_row;
        self
    }

    pub fn unwrapped(mut self) -> Self {
        self.embed = false;
        self
    }

    /// Imports force module semantics
    pub fn is_module(&self) -> bool {
        !self.imports.is_empty()
    }
}

/// Default wrapper: hoisted imports, then `function main() {...}` and a call
pub fn embed_in_function(snippet: &Snippet) -> String {
    if !snippet.embed {
        return snippet.source.clone();
    }
    if snippet.is_module() {
        let imports: Vec<&str> = snippet.imports.iter().map(|i| i.line.as_str()).collect();
        format!(
            "{}\nfunction main() {{\n{}\n}}\n\nmain();",
            imports.join("\n"),
            snippet.body
        )
    } else {
        format!("function main() {{{}\n}}\n\nmain();", snippet.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern() -> ImportPattern {
        ImportPattern::new().unwrap()
    }

    #[test]
    fn test_plain_source_gets_the_unqualified_wrapper() {
        let snippet = Snippet::new("test", " return 1; ", &pattern());
        assert!(!snippet.is_module());
        assert_eq!(embed_in_function(&snippet), "function main() { return 1; \n}\n\nmain();");
    }

    #[test]
    fn test_imports_are_hoisted_above_main() {
        let source = "let a = 1;\nimport helper from 'lib/helper';\nimport { x, y } from \"lib/xy\";\nreturn helper(a);";
        let snippet = Snippet::new("test", source, &pattern());
        let wrapped = embed_in_function(&snippet);

        let main_at = wrapped.find("function main()").unwrap();
        assert!(wrapped.find("import helper").unwrap() < main_at);
        assert!(wrapped.find("import { x, y }").unwrap() < main_at);
        assert!(wrapped.find("let a = 1;").unwrap() > main_at);
        assert!(wrapped.find("return helper(a);").unwrap() > main_at);
        assert!(wrapped.ends_with("\n}\n\nmain();"));
    }

    #[test]
    fn test_import_bindings_are_parsed() {
        let import = pattern().parse("import base, { one, two as second } from 'mod'").unwrap();
        assert_eq!(import.default_binding.as_deref(), Some("base"));
        assert_eq!(
            import.named,
            vec![("one".to_string(), "one".to_string()), ("two".to_string(), "second".to_string())]
        );
        assert_eq!(import.module, "mod");
    }

    #[test]
    fn test_unwrapped_snippet_keeps_source() {
        let snippet = Snippet::new("test", "return 2", &pattern()).unwrapped();
        assert_eq!(embed_in_function(&snippet), "return 2");
    }
}
