//! Command line and environment block composition.
//!
//! The console backend hands the child a single command line string and a
//! UTF-16 environment block, so argument vectors and environment entries are
//! serialized here. The child reconstructs its arguments with the usual
//! Windows C runtime rules; [`split_command_line`] implements the same rules
//! so composition can be checked without spawning anything.

use std::borrow::Cow;
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};

/// Key comparison used when deduplicating environment entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvCase {
    /// Keys differing only in case are distinct (POSIX).
    Sensitive,
    /// Keys differing only in case are the same variable (Windows).
    Insensitive,
}

impl EnvCase {
    /// Key comparison of the host platform.
    pub const fn native() -> Self {
        if cfg!(windows) {
            EnvCase::Insensitive
        } else {
            EnvCase::Sensitive
        }
    }
}

/// Quote a single argument so the child's parser yields it back unchanged.
pub fn quote_arg(arg: &str) -> Cow<'_, str> {
    if arg.is_empty() {
        return Cow::Borrowed("\"\"");
    }

    let needs_backslash = arg.contains(|c: char| c == '"' || c == '\\');
    let has_space = arg.contains(|c: char| c == ' ' || c == '\t');

    if !needs_backslash && !has_space {
        return Cow::Borrowed(arg);
    }

    let mut out = String::with_capacity(arg.len() + 2);
    if !needs_backslash {
        out.push('"');
        out.push_str(arg);
        out.push('"');
        return Cow::Owned(out);
    }

    if has_space {
        out.push('"');
    }

    let mut slashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => slashes += 1,
            '"' => {
                // Backslashes preceding a quote are doubled, then the quote escaped
                out.extend(std::iter::repeat('\\').take(slashes + 1));
                slashes = 0;
            }
            _ => slashes = 0,
        }
        out.push(c);
    }

    if has_space {
        // Trailing backslashes would otherwise escape the closing quote
        out.extend(std::iter::repeat('\\').take(slashes));
        out.push('"');
    }

    Cow::Owned(out)
}

/// Compose an argument vector into one command line.
pub fn compose_command_line<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = String::new();
    for (i, arg) in args.into_iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        line.push_str(&quote_arg(arg.as_ref()));
    }
    line
}

/// Split a command line the way the child's C runtime does.
pub fn split_command_line(line: &str) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    let mut args = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == ' ' || chars[i] == '\t' {
            i += 1;
            continue;
        }

        let mut arg = String::new();
        let mut in_quote = false;
        let mut slashes = 0usize;

        while i < chars.len() {
            let c = chars[i];
            match c {
                ' ' | '\t' if !in_quote => break,
                '\\' => {
                    slashes += 1;
                    i += 1;
                    continue;
                }
                '"' => {
                    arg.extend(std::iter::repeat('\\').take(slashes / 2));
                    if slashes % 2 == 0 {
                        // "" inside a quoted run is a literal quote
                        if in_quote && chars.get(i + 1) == Some(&'"') {
                            arg.push('"');
                            i += 1;
                        } else {
                            in_quote = !in_quote;
                        }
                    } else {
                        arg.push('"');
                    }
                    slashes = 0;
                    i += 1;
                    continue;
                }
                _ => {}
            }
            arg.extend(std::iter::repeat('\\').take(slashes));
            slashes = 0;
            arg.push(c);
            i += 1;
        }

        arg.extend(std::iter::repeat('\\').take(slashes));
        args.push(arg);
    }

    args
}

/// Split a `KEY=VALUE` entry.
///
/// A leading `=` belongs to the key, which is how Windows stores per-drive
/// working directories (`=C:=C:\work`). Entries without a separator or with
/// an empty key yield `None`.
pub fn parse_env_entry(entry: &OsStr) -> Option<(OsString, OsString)> {
    let text = entry.to_string_lossy();
    let split = text
        .char_indices()
        .skip(1)
        .find(|&(_, c)| c == '=')
        .map(|(i, _)| i)?;
    let (key, value) = text.split_at(split);
    Some((OsString::from(key), OsString::from(&value[1..])))
}

/// Remove duplicate keys; the last entry for a key wins.
///
/// The surviving entries keep the order of their last occurrence.
pub fn dedup_environment<I>(entries: I, case: EnvCase) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let entries: Vec<_> = entries.into_iter().collect();
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(entries.len());

    for (key, value) in entries.into_iter().rev() {
        if key.is_empty() {
            continue;
        }
        let normalized = match case {
            EnvCase::Sensitive => key.to_string_lossy().into_owned(),
            EnvCase::Insensitive => key.to_string_lossy().to_uppercase(),
        };
        if seen.insert(normalized) {
            out.push((key, value));
        }
    }

    out.reverse();
    out
}

/// Force-add `SYSTEMROOT` when absent; some system DLLs fail to load without it.
pub fn ensure_system_root(entries: &mut Vec<(OsString, OsString)>, system_root: Option<OsString>) {
    let present = entries
        .iter()
        .any(|(key, _)| key.to_string_lossy().eq_ignore_ascii_case("SYSTEMROOT"));
    if present {
        return;
    }
    if let Some(value) = system_root {
        entries.push((OsString::from("SYSTEMROOT"), value));
    }
}

/// Serialize entries into a double-NUL terminated UTF-16 environment block.
pub fn environment_block(entries: &[(OsString, OsString)]) -> Vec<u16> {
    let mut block = Vec::new();
    for (key, value) in entries {
        block.extend(to_wide(key));
        block.push('=' as u16);
        block.extend(to_wide(value));
        block.push(0);
    }
    if block.is_empty() {
        // An empty block still needs both terminators
        block.push(0);
    }
    block.push(0);
    block
}

/// Parse a double-NUL terminated UTF-16 environment block.
pub fn parse_environment_block(block: &[u16]) -> Vec<(OsString, OsString)> {
    block
        .split(|&unit| unit == 0)
        .take_while(|entry| !entry.is_empty())
        .filter_map(|entry| parse_env_entry(&from_wide(entry)))
        .collect()
}

/// UTF-16 encoding without a terminator.
#[cfg(windows)]
pub(crate) fn to_wide(s: &OsStr) -> Vec<u16> {
    use std::os::windows::ffi::OsStrExt;
    s.encode_wide().collect()
}

#[cfg(not(windows))]
pub(crate) fn to_wide(s: &OsStr) -> Vec<u16> {
    s.to_string_lossy().encode_utf16().collect()
}

#[cfg(windows)]
pub(crate) fn from_wide(units: &[u16]) -> OsString {
    use std::os::windows::ffi::OsStringExt;
    OsString::from_wide(units)
}

#[cfg(not(windows))]
pub(crate) fn from_wide(units: &[u16]) -> OsString {
    OsString::from(String::from_utf16_lossy(units))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(entries: &[&str]) -> Vec<(OsString, OsString)> {
        entries
            .iter()
            .filter_map(|e| parse_env_entry(OsStr::new(e)))
            .collect()
    }

    #[test]
    fn test_quote_plain_and_empty() {
        assert_eq!(quote_arg("plain"), "plain");
        assert_eq!(quote_arg(""), "\"\"");
        assert_eq!(quote_arg("hello world"), "\"hello world\"");
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote_arg(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(quote_arg(r"C:\dir\"), r"C:\dir\");
        assert_eq!(quote_arg(r"C:\my dir\"), r#""C:\my dir\\""#);
        assert_eq!(quote_arg(r#"a\"b"#), r#"a\\\"b"#);
    }

    #[test]
    fn test_command_line_round_trip() {
        let args = ["prog", "hello world", r#"say "hi""#];
        let line = compose_command_line(args);
        assert_eq!(line, r#"prog "hello world" "say \"hi\"""#);
        assert_eq!(split_command_line(&line), args);
    }

    #[test]
    fn test_split_doubled_quote_inside_quotes() {
        assert_eq!(split_command_line(r#""a""b" c"#), vec![r#"a"b"#, "c"]);
        assert_eq!(split_command_line("  a\t\tb  "), vec!["a", "b"]);
        assert_eq!(split_command_line(r#""" x"#), vec!["", "x"]);
    }

    #[test]
    fn test_parse_env_entry() {
        assert_eq!(
            parse_env_entry(OsStr::new("PATH=/a=b")),
            Some((OsString::from("PATH"), OsString::from("/a=b")))
        );
        assert_eq!(
            parse_env_entry(OsStr::new("=C:=C:\\work")),
            Some((OsString::from("=C:"), OsString::from("C:\\work")))
        );
        assert_eq!(parse_env_entry(OsStr::new("NOVALUE")), None);
        assert_eq!(parse_env_entry(OsStr::new("EMPTY=")), Some(("EMPTY".into(), "".into())));
    }

    #[test]
    fn test_dedup_case_insensitive_last_wins() {
        let env = dedup_environment(pairs(&["PATH=/a", "HOME=/h", "path=/b"]), EnvCase::Insensitive);
        let paths: Vec<_> = env
            .iter()
            .filter(|(k, _)| k.to_string_lossy().eq_ignore_ascii_case("PATH"))
            .collect();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].1, OsString::from("/b"));
        // Order follows the last occurrence of each key
        assert_eq!(env[0].0, OsString::from("HOME"));
    }

    #[test]
    fn test_dedup_case_sensitive_keeps_both() {
        let env = dedup_environment(pairs(&["PATH=/a", "path=/b", "PATH=/c"]), EnvCase::Sensitive);
        assert_eq!(env, pairs(&["path=/b", "PATH=/c"]));
    }

    #[test]
    fn test_ensure_system_root() {
        let mut env = pairs(&["SystemRoot=C:\\Windows"]);
        ensure_system_root(&mut env, Some("D:\\Other".into()));
        assert_eq!(env.len(), 1);

        let mut env = pairs(&["PATH=/a"]);
        ensure_system_root(&mut env, Some("C:\\Windows".into()));
        assert_eq!(env.last().unwrap().0, OsString::from("SYSTEMROOT"));

        let mut env = Vec::new();
        ensure_system_root(&mut env, None);
        assert!(env.is_empty());
    }

    #[test]
    fn test_environment_block_layout() {
        let block = environment_block(&pairs(&["A=1", "B=2"]));
        let expected: Vec<u16> = "A=1\0B=2\0\0".encode_utf16().collect();
        assert_eq!(block, expected);
        assert_eq!(environment_block(&[]), vec![0, 0]);
        assert_eq!(parse_environment_block(&block), pairs(&["A=1", "B=2"]));
    }
}
