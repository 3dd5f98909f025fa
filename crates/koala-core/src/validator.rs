//! Static screening of scripts before any session is spawned
//!
//! This is a lexical pass, not an interpreter: it tokenizes the script the way
//! Python would (strings, comments, f-string expressions, bracket nesting) and
//! then applies a fixed set of rules to the token stream. It cannot prove a
//! dynamically typed script harmless, so it only exists to turn away obviously
//! hostile scripts cheaply; the isolation backend is still the real control.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

use crate::config::ValidatorSettings;

/// Which rule turned a script away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionRule {
    ScriptTooLarge,
    Syntax,
    DisallowedImport,
    DeniedIdentifier,
    ReflectiveAccess,
    EnvironmentAccess,
    HostPath,
    NetworkLocation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub rule: RejectionRule,
    pub reason: String,
    /// 1-based line of the offending token, 0 when not tied to a line
    pub line: usize,
}

impl Rejection {
    fn new(rule: RejectionRule, line: usize, reason: impl Into<String>) -> Self {
        Self {
            rule,
            reason: reason.into(),
            line,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line > 0 {
            write!(f, "{} (line {})", self.reason, self.line)
        } else {
            f.write_str(&self.reason)
        }
    }
}

impl std::error::Error for Rejection {}

/// Built-ins and attributes that evaluate code, reach into the process, the
/// filesystem or the network, or walk the object graph.
const DENIED_NAMES: &[&str] = &[
    // dynamic evaluation and reflection
    "eval", "exec", "globals", "locals", "vars", "getattr", "setattr", "delattr",
    "hasattr", "dir", "breakpoint", "memoryview", "attrgetter", "methodcaller",
    "mro", "f_globals", "f_locals", "f_back", "f_builtins",
    "gi_frame", "gi_code", "cr_frame", "co_code", "tb_frame", "func_globals",
    // file access
    "open", "read_pickle", "to_pickle", "unlink", "rmdir", "rmtree", "chmod",
    "chown", "symlink", "ctypeslib", "f2py",
    // process control
    "system", "popen", "Popen", "fork", "forkpty", "spawnl", "spawnle", "spawnlp",
    "spawnlpe", "spawnv", "spawnve", "spawnvp", "spawnvpe", "posix_spawn",
    "posix_spawnp", "execl", "execle", "execlp", "execlpe", "execv", "execve",
    "execvp", "execvpe", "fork_exec", "kill", "killpg", "setsid",
    // network
    "socket", "create_connection", "urlopen", "urlretrieve",
    // modules that must not be reachable even through another module's attributes
    "os", "sys", "subprocess", "shutil", "pathlib", "ctypes", "cffi", "importlib",
    "builtins", "pickle", "marshal", "shelve", "multiprocessing", "threading",
    "pty", "urllib", "requests", "ftplib", "telnetlib", "webbrowser", "gc", "io",
    "tempfile", "fcntl", "mmap", "posix", "operator",
];

/// Built-ins whose names are also ordinary methods elsewhere (`re.compile`),
/// so only the bare name is refused.
const BUILTIN_ONLY_NAMES: &[&str] = &["compile", "input", "help", "exit", "quit"];

const ENVIRONMENT_NAMES: &[&str] = &["environ", "environb", "getenv", "putenv", "unsetenv"];

static URL_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b[a-z][a-z0-9+.\-]*://").expect("valid url regex"));
static HOST_PATH_LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(?:/|~|[A-Za-z]:[\\/]|\\\\)|(?:^|[\\/])\.\.(?:[\\/]|$)"#)
        .expect("valid path regex")
});

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Name(String),
    Str { value: String },
    Number,
    Op(char),
    Newline,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    tok: Tok,
    line: usize,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    brackets: Vec<char>,
    tokens: Vec<Token>,
}

fn syntax(line: usize, reason: impl Into<String>) -> Rejection {
    Rejection::new(RejectionRule::Syntax, line, reason)
}

fn is_string_prefix(word: &str) -> bool {
    word.len() <= 2 && word.chars().all(|c| "rRbBuUfF".contains(c))
}

impl Lexer {
    fn new(src: &str, first_line: usize) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            line: first_line,
            brackets: Vec::new(),
            tokens: Vec::new(),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn push_newline(&mut self) {
        if self.brackets.is_empty() && !matches!(self.tokens.last(), Some(Token { tok: Tok::Newline, .. }) | None) {
            self.push(Tok::Newline);
        }
    }

    fn run(mut self) -> Result<Vec<Token>, Rejection> {
        while let Some(c) = self.peek(0) {
            match c {
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '\n' => {
                    self.push_newline();
                    self.line += 1;
                    self.pos += 1;
                }
                '#' => {
                    while self.peek(0).is_some_and(|c| c != '\n') {
                        self.pos += 1;
                    }
                }
                '\\' => {
                    let next = if self.peek(1) == Some('\r') { self.peek(2) } else { self.peek(1) };
                    if next != Some('\n') {
                        return Err(syntax(self.line, "unexpected character after line continuation"));
                    }
                    while self.peek(0) != Some('\n') {
                        self.pos += 1;
                    }
                    self.pos += 1;
                    self.line += 1;
                }
                '\'' | '"' => self.string(false)?,
                '0'..='9' => self.number(),
                '.' if self.peek(1).is_some_and(|c| c.is_ascii_digit()) => self.number(),
                c if c.is_ascii_alphabetic() || c == '_' => self.word()?,
                '(' | '[' | '{' => {
                    self.brackets.push(c);
                    self.push(Tok::Op(c));
                    self.pos += 1;
                }
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    if self.brackets.pop() != Some(expected) {
                        return Err(syntax(self.line, format!("unmatched '{}'", c)));
                    }
                    self.push(Tok::Op(c));
                    self.pos += 1;
                }
                ';' => {
                    self.push_newline();
                    self.pos += 1;
                }
                '\0' => return Err(syntax(self.line, "script contains a NUL byte")),
                c if c.is_ascii_punctuation() => {
                    self.push(Tok::Op(c));
                    self.pos += 1;
                }
                c if c.is_alphabetic() => {
                    // Python folds identifiers with NFKC, so lookalike letters could spell denied names
                    return Err(syntax(self.line, format!("non-ASCII identifier character '{}'", c)));
                }
                c => return Err(syntax(self.line, format!("unexpected character '{}'", c))),
            }
        }

        if let Some(open) = self.brackets.last() {
            return Err(syntax(self.line, format!("'{}' was never closed", open)));
        }
        Ok(self.tokens)
    }

    fn number(&mut self) {
        while let Some(c) = self.peek(0) {
            let exponent_sign = (c == '+' || c == '-')
                && matches!(self.chars.get(self.pos.wrapping_sub(1)), Some('e') | Some('E'));
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || exponent_sign {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.push(Tok::Number);
    }

    fn word(&mut self) -> Result<(), Rejection> {
        let start = self.pos;
        while self.peek(0).is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        if self.peek(0).is_some_and(|c| !c.is_ascii() && c.is_alphanumeric()) {
            return Err(syntax(self.line, "non-ASCII identifier"));
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        if matches!(self.peek(0), Some('\'') | Some('"')) && is_string_prefix(&word) {
            let fstring = word.contains(['f', 'F']);
            return self.string(fstring);
        }
        self.push(Tok::Name(word));
        Ok(())
    }

    fn string(&mut self, fstring: bool) -> Result<(), Rejection> {
        let quote = self.chars[self.pos];
        let start_line = self.line;
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut value = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                return Err(syntax(start_line, "unterminated string literal"));
            };
            if c == '\\' {
                value.push(c);
                if let Some(next) = self.peek(1) {
                    if next == '\n' {
                        self.line += 1;
                    }
                    value.push(next);
                }
                self.pos += 2;
                continue;
            }
            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
            }
            if c == '\n' {
                if !triple {
                    return Err(syntax(start_line, "unterminated string literal"));
                }
                self.line += 1;
            }
            value.push(c);
            self.pos += 1;
        }

        if fstring {
            let (literal, expressions) = split_fstring(&value, start_line)?;
            for (expr, line) in expressions {
                let inner = Lexer::new(&expr, line).run()?;
                self.tokens.extend(inner.into_iter().filter(|t| t.tok != Tok::Newline));
            }
            self.tokens.push(Token {
                tok: Tok::Str { value: literal },
                line: start_line,
            });
        } else {
            self.tokens.push(Token {
                tok: Tok::Str { value },
                line: start_line,
            });
        }
        Ok(())
    }
}

/// Separate an f-string body into its literal text and its `{...}` expressions.
fn split_fstring(body: &str, first_line: usize) -> Result<(String, Vec<(String, usize)>), Rejection> {
    let chars: Vec<char> = body.chars().collect();
    let mut literal = String::new();
    let mut expressions = Vec::new();
    let mut line = first_line;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            line += 1;
        }
        if (c == '{' || c == '}') && chars.get(i + 1) == Some(&c) {
            literal.push(c);
            i += 2;
            continue;
        }
        if c != '{' {
            literal.push(c);
            i += 1;
            continue;
        }

        let expr_line = line;
        let mut depth = 1;
        let mut expr = String::new();
        let mut quote: Option<char> = None;
        i += 1;
        while i < chars.len() {
            let d = chars[i];
            if d == '\n' {
                line += 1;
            }
            match quote {
                Some(q) if d == q => quote = None,
                Some(_) => {}
                None => match d {
                    '\'' | '"' => quote = Some(d),
                    '{' | '[' | '(' => depth += 1,
                    '}' | ']' | ')' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                },
            }
            expr.push(d);
            i += 1;
        }
        if depth != 0 {
            return Err(syntax(expr_line, "unterminated expression in f-string"));
        }
        expressions.push((expr, expr_line));
        i += 1;
    }
    Ok((literal, expressions))
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

/// Pure, side-effect free screening of script text.
#[derive(Debug, Clone)]
pub struct Validator {
    allowed_modules: HashSet<String>,
    max_script_bytes: usize,
}

impl Validator {
    pub fn new(settings: &ValidatorSettings) -> Self {
        Self {
            allowed_modules: settings.allowed_modules.iter().cloned().collect(),
            max_script_bytes: settings.max_script_bytes,
        }
    }

    /// Ok when no rule matched, otherwise the first rule that did.
    pub fn validate(&self, script: &str) -> Result<(), Rejection> {
        if script.len() > self.max_script_bytes {
            return Err(Rejection::new(
                RejectionRule::ScriptTooLarge,
                0,
                format!(
                    "script is {} bytes, above the {} byte limit",
                    script.len(),
                    self.max_script_bytes
                ),
            ));
        }

        let tokens = Lexer::new(script, 1).run()?;
        for (i, token) in tokens.iter().enumerate() {
            match &token.tok {
                Tok::Name(name) => self.check_name(&tokens, i, name, token.line)?,
                Tok::Str { value } => check_literal(value, token.line)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn check_name(&self, tokens: &[Token], i: usize, name: &str, line: usize) -> Result<(), Rejection> {
        let is_attribute = i > 0 && tokens[i - 1].tok == Tok::Op('.');

        if !is_attribute {
            match name {
                "import" => self.check_import_list(tokens, i + 1)?,
                "from" => self.check_from_import(tokens, i)?,
                _ => {}
            }
        }

        if is_dunder(name) {
            return Err(Rejection::new(
                RejectionRule::ReflectiveAccess,
                line,
                format!("access to '{}' is not allowed", name),
            ));
        }
        if is_attribute && name.starts_with('_') {
            return Err(Rejection::new(
                RejectionRule::ReflectiveAccess,
                line,
                format!("access to private attribute '{}' is not allowed", name),
            ));
        }
        if ENVIRONMENT_NAMES.contains(&name) {
            return Err(Rejection::new(
                RejectionRule::EnvironmentAccess,
                line,
                format!("reading host environment through '{}' is not allowed", name),
            ));
        }
        if DENIED_NAMES.contains(&name) || (!is_attribute && BUILTIN_ONLY_NAMES.contains(&name)) {
            return Err(Rejection::new(
                RejectionRule::DeniedIdentifier,
                line,
                format!("use of '{}' is not allowed", name),
            ));
        }
        Ok(())
    }

    fn check_module(&self, module: &str, line: usize) -> Result<(), Rejection> {
        if self.allowed_modules.contains(module) {
            Ok(())
        } else {
            Err(Rejection::new(
                RejectionRule::DisallowedImport,
                line,
                format!("import of module '{}' is not allowed", module),
            ))
        }
    }

    /// `import a.b as c, d`
    fn check_import_list(&self, tokens: &[Token], mut j: usize) -> Result<(), Rejection> {
        loop {
            match tokens.get(j) {
                Some(Token { tok: Tok::Name(module), line }) => self.check_module(module, *line)?,
                Some(token) => return Err(syntax(token.line, "expected a module name after 'import'")),
                None => return Err(syntax(0, "expected a module name after 'import'")),
            }
            j += 1;
            // skip the rest of the dotted path and an optional alias
            while let Some(token) = tokens.get(j) {
                match &token.tok {
                    Tok::Op('.') => j += 1,
                    Tok::Name(_) => j += 1,
                    _ => break,
                }
            }
            match tokens.get(j) {
                Some(Token { tok: Tok::Op(','), .. }) => j += 1,
                _ => return Ok(()),
            }
        }
    }

    /// `from a.b import c`; `raise X from Y` and `yield from` fall through.
    fn check_from_import(&self, tokens: &[Token], i: usize) -> Result<(), Rejection> {
        let mut j = i + 1;
        let mut relative = false;
        while let Some(Token { tok: Tok::Op('.'), .. }) = tokens.get(j) {
            relative = true;
            j += 1;
        }

        let first = match tokens.get(j) {
            Some(Token { tok: Tok::Name(name), line }) if name != "import" => {
                j += 1;
                Some((name.clone(), *line))
            }
            _ => None,
        };
        while let (Some(Token { tok: Tok::Op('.'), .. }), Some(Token { tok: Tok::Name(_), .. })) =
            (tokens.get(j), tokens.get(j + 1))
        {
            j += 2;
        }

        let is_import = matches!(tokens.get(j), Some(Token { tok: Tok::Name(kw), .. }) if kw == "import");
        if !is_import {
            return Ok(());
        }
        if relative {
            return Err(Rejection::new(
                RejectionRule::DisallowedImport,
                tokens[i].line,
                "relative imports are not allowed",
            ));
        }
        match first {
            Some((module, line)) => self.check_module(&module, line),
            None => Err(syntax(tokens[i].line, "expected a module name after 'from'")),
        }
    }
}

fn check_literal(value: &str, line: usize) -> Result<(), Rejection> {
    if URL_LITERAL.is_match(value) {
        return Err(Rejection::new(
            RejectionRule::NetworkLocation,
            line,
            "network locations are not reachable from analysis scripts",
        ));
    }
    if HOST_PATH_LITERAL.is_match(value.trim()) {
        return Err(Rejection::new(
            RejectionRule::HostPath,
            line,
            format!("path '{}' points outside the working directory", value.trim()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Validator {
        Validator::new(&ValidatorSettings::default())
    }

    fn rule_of(script: &str) -> RejectionRule {
        validator().validate(script).unwrap_err().rule
    }

    #[test]
    fn test_plain_analysis_passes() {
        let script = r#"
import pandas as pd
import numpy as np
from matplotlib import pyplot as plt

summary = sales.groupby("region")["revenue"].sum()  # totals
result = summary.sort_values(ascending=False).head(10)
open_rate = 3
label = f"{result.index[0]} leads with {{braces}}"
plt.bar(result.index, result.values)
"#;
        assert_eq!(validator().validate(script), Ok(()));
        assert_eq!(validator().validate("result = 2 + 2"), Ok(()));
    }

    #[test]
    fn test_disallowed_imports() {
        assert_eq!(rule_of("import os"), RejectionRule::DisallowedImport);
        assert_eq!(rule_of("import numpy, subprocess"), RejectionRule::DisallowedImport);
        assert_eq!(rule_of("from socket import socket"), RejectionRule::DisallowedImport);
        assert_eq!(rule_of("if True: import shutil"), RejectionRule::DisallowedImport);
        assert_eq!(rule_of("from . import helpers"), RejectionRule::DisallowedImport);
        assert_eq!(rule_of("x = 1; import pty"), RejectionRule::DisallowedImport);
    }

    #[test]
    fn test_raise_from_is_not_an_import() {
        let script = "try:\n    x = 1 / 0\nexcept ZeroDivisionError as err:\n    raise ValueError('bad') from err\n";
        assert_eq!(validator().validate(script), Ok(()));
    }

    #[test]
    fn test_denied_builtins() {
        assert_eq!(rule_of("eval('1 + 1')"), RejectionRule::DeniedIdentifier);
        assert_eq!(rule_of("f = open('data.csv')"), RejectionRule::DeniedIdentifier);
        assert_eq!(rule_of("getattr(df, 'x')"), RejectionRule::DeniedIdentifier);
        assert_eq!(rule_of("pd.io.common.os.system('id')"), RejectionRule::DeniedIdentifier);
        assert_eq!(rule_of("rx = compile('x', 'f', 'eval')"), RejectionRule::DeniedIdentifier);
        assert_eq!(rule_of("name = input()"), RejectionRule::DeniedIdentifier);
    }

    #[test]
    fn test_methods_sharing_a_builtin_name_pass() {
        let script = "import re\npattern = re.compile('[0-9]+')\nresult = sales.name.str.contains(pattern)\n";
        assert_eq!(validator().validate(script), Ok(()));
        assert_eq!(validator().validate("rx = re.compile('a|b').pattern"), Ok(()));
    }

    #[test]
    fn test_routes_to_process_control_are_refused() {
        assert_eq!(rule_of("import operator"), RejectionRule::DisallowedImport);
        assert_eq!(rule_of("from operator import attrgetter"), RejectionRule::DisallowedImport);
        assert_eq!(
            rule_of("m = attrgetter('io.common.os')(pd)"),
            RejectionRule::DeniedIdentifier
        );
        assert_eq!(
            rule_of("rc = methodcaller('system', 'sleep 1 &')(m)"),
            RejectionRule::DeniedIdentifier
        );
        assert_eq!(rule_of("f = pd.core.ops.operator"), RejectionRule::DeniedIdentifier);
        for call in ["m.fork()", "m.posix_spawn('x', [], {})", "m.execvpe('sh', [], {})", "m.setsid()"] {
            assert_eq!(rule_of(call), RejectionRule::DeniedIdentifier, "{}", call);
        }
    }

    #[test]
    fn test_reflective_access() {
        assert_eq!(rule_of("x = ().__class__.__bases__"), RejectionRule::ReflectiveAccess);
        assert_eq!(rule_of("__import__('os')"), RejectionRule::ReflectiveAccess);
        assert_eq!(rule_of("blocks = df._mgr"), RejectionRule::ReflectiveAccess);
        // a private local is fine, only private attributes are not
        assert_eq!(validator().validate("_tmp = 3\nresult = _tmp"), Ok(()));
    }

    #[test]
    fn test_environment_access() {
        assert_eq!(rule_of("home = environ['HOME']"), RejectionRule::EnvironmentAccess);
        assert_eq!(rule_of("getenv('SECRET')"), RejectionRule::EnvironmentAccess);
    }

    #[test]
    fn test_paths_and_urls_in_literals() {
        assert_eq!(rule_of("pd.read_csv('/etc/passwd')"), RejectionRule::HostPath);
        assert_eq!(rule_of("pd.read_csv('../other/sales.csv')"), RejectionRule::HostPath);
        assert_eq!(rule_of("pd.read_csv('~/.ssh/id_rsa')"), RejectionRule::HostPath);
        assert_eq!(rule_of("pd.read_csv('C:\\\\Windows\\\\x')"), RejectionRule::HostPath);
        assert_eq!(rule_of("pd.read_csv('https://example.com/x.csv')"), RejectionRule::NetworkLocation);
        assert_eq!(rule_of("pd.read_csv(f'https://{host}/x.csv')"), RejectionRule::NetworkLocation);
        assert_eq!(validator().validate("df.to_csv('out/summary.csv')"), Ok(()));
        assert_eq!(validator().validate("ratio = 'a/b'"), Ok(()));
    }

    #[test]
    fn test_fstring_expressions_are_scanned() {
        assert_eq!(rule_of("s = f\"{eval('1')}\""), RejectionRule::DeniedIdentifier);
        assert_eq!(rule_of("s = f'{x!r:>{open}}'"), RejectionRule::DeniedIdentifier);
        assert_eq!(validator().validate("s = f'{{eval}} is literal'"), Ok(()));
        assert_eq!(validator().validate("s = rb'\\d+'"), Ok(()));
    }

    #[test]
    fn test_comments_and_plain_strings_are_ignored() {
        assert_eq!(validator().validate("# import os\nresult = 1"), Ok(()));
        assert_eq!(validator().validate("note = 'please do not eval this'"), Ok(()));
        assert_eq!(
            validator().validate("doc = '''\nimport os\n'''\nresult = 1"),
            Ok(())
        );
    }

    #[test]
    fn test_syntax_problems() {
        assert_eq!(rule_of("x = (1, 2"), RejectionRule::Syntax);
        assert_eq!(rule_of("x = [1, 2)"), RejectionRule::Syntax);
        assert_eq!(rule_of("s = 'open"), RejectionRule::Syntax);
        assert_eq!(rule_of("s = '''never closed"), RejectionRule::Syntax);
        assert_eq!(rule_of("x = 1 \\ 2"), RejectionRule::Syntax);
        assert_eq!(rule_of("\u{ff45}val('1')"), RejectionRule::Syntax);
    }

    #[test]
    fn test_line_numbers_are_reported() {
        let rejection = validator()
            .validate("import pandas as pd\n\nx = (\n  1,\n)\nimport os\n")
            .unwrap_err();
        assert_eq!(rejection.line, 6);
        assert!(rejection.to_string().contains("'os'"));
        assert!(rejection.to_string().ends_with("(line 6)"));
    }

    #[test]
    fn test_script_size_limit() {
        let settings = ValidatorSettings {
            max_script_bytes: 10,
            ..ValidatorSettings::default()
        };
        let rejection = Validator::new(&settings).validate("result = 1 + 2 + 3").unwrap_err();
        assert_eq!(rejection.rule, RejectionRule::ScriptTooLarge);
    }
}
