//! Windows command-line construction.
//!
//! Process creation on Windows takes one flat UTF-16 string, not an argv
//! vector; the child's C runtime (and `CommandLineToArgvW`) split it back.
//! These helpers quote and escape each argument so the backend observes
//! exactly the strings the operator configured, whatever whitespace,
//! quotes, or backslashes they contain.

/// Escape one argument following the `CommandLineToArgvW` conventions.
///
/// Plain arguments pass through untouched. An empty argument becomes `""`.
/// Arguments containing spaces, tabs, double quotes, or backslashes are
/// quoted and escaped so they round-trip exactly.
pub fn escape_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "\"\"".to_string();
    }

    let needs_backslash = arg.bytes().any(|b| b == b'"' || b == b'\\');
    let has_space = arg.bytes().any(|b| b == b' ' || b == b'\t');

    if !needs_backslash && !has_space {
        return arg.to_string();
    }
    if !needs_backslash {
        // Whitespace only; wrapping in quotes is enough.
        return format!("\"{arg}\"");
    }

    let mut out = String::with_capacity(arg.len() + 2);
    if has_space {
        out.push('"');
    }
    let mut slashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => slashes += 1,
            '"' => {
                // Backslashes directly before a quote must be doubled, and
                // the quote itself escaped.
                for _ in 0..slashes {
                    out.push('\\');
                }
                slashes = 0;
                out.push('\\');
            }
            _ => slashes = 0,
        }
        out.push(c);
    }
    if has_space {
        // A trailing backslash run would otherwise escape the closing quote.
        for _ in 0..slashes {
            out.push('\\');
        }
        out.push('"');
    }
    out
}

/// Build the flat command line handed to process creation.
///
/// The program path is quoted like any argument; `CreateProcess*` receives
/// the unquoted path separately as the application name, so this only has
/// to satisfy the child's own argv parsing.
pub fn build_command_line(program: &str, args: &[String]) -> String {
    let mut line = escape_arg(program);
    for arg in args {
        line.push(' ');
        line.push_str(&escape_arg(arg));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Split a command line by the same rules `CommandLineToArgvW` applies:
    /// 2n backslashes before a quote collapse to n with the quote toggling
    /// quoted mode, 2n+1 yield n plus a literal quote, and backslashes not
    /// followed by a quote are literal.
    fn split_command_line(line: &str) -> Vec<String> {
        let mut args = Vec::new();
        let mut current = String::new();
        let mut in_arg = false;
        let mut in_quotes = false;
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                ' ' | '\t' if !in_quotes => {
                    if in_arg {
                        args.push(std::mem::take(&mut current));
                        in_arg = false;
                    }
                }
                '\\' => {
                    in_arg = true;
                    let mut slashes = 1usize;
                    while chars.peek() == Some(&'\\') {
                        chars.next();
                        slashes += 1;
                    }
                    if chars.peek() == Some(&'"') {
                        for _ in 0..slashes / 2 {
                            current.push('\\');
                        }
                        if slashes % 2 == 1 {
                            chars.next();
                            current.push('"');
                        }
                    } else {
                        for _ in 0..slashes {
                            current.push('\\');
                        }
                    }
                }
                '"' => {
                    in_arg = true;
                    in_quotes = !in_quotes;
                }
                other => {
                    in_arg = true;
                    current.push(other);
                }
            }
        }
        if in_arg {
            args.push(current);
        }
        args
    }

    #[test]
    fn plain_arguments_pass_through() {
        assert_eq!(escape_arg("simple"), "simple");
        assert_eq!(escape_arg("--payload"), "--payload");
        assert_eq!(escape_arg("key=value"), "key=value");
    }

    #[test]
    fn empty_argument_becomes_a_quoted_pair() {
        assert_eq!(escape_arg(""), "\"\"");
    }

    #[test]
    fn whitespace_is_quoted() {
        assert_eq!(escape_arg("two words"), "\"two words\"");
        assert_eq!(escape_arg("tab\there"), "\"tab\there\"");
    }

    #[test]
    fn quotes_are_backslash_escaped() {
        assert_eq!(escape_arg("a\"b"), "a\\\"b");
        assert_eq!(escape_arg("say \"hi\""), "\"say \\\"hi\\\"\"");
    }

    #[test]
    fn backslashes_without_quotes_or_spaces_are_untouched() {
        assert_eq!(escape_arg(r"C:\plain\path.exe"), r"C:\plain\path.exe");
        assert_eq!(escape_arg(r"trail\"), r"trail\");
    }

    #[test]
    fn backslashes_before_a_quote_are_doubled() {
        assert_eq!(escape_arg(r#"\""#), r#"\\\""#);
        assert_eq!(escape_arg(r#"path\"quoted"#), r#"path\\\"quoted"#);
    }

    #[test]
    fn trailing_backslash_is_doubled_inside_quotes() {
        assert_eq!(escape_arg(r"dir with space\"), r#""dir with space\\""#);
        assert_eq!(escape_arg(r"a \\"), r#""a \\\\""#);
    }

    #[test]
    fn command_line_quotes_the_program_when_needed() {
        assert_eq!(
            build_command_line(r"C:\backend.exe", &["--payload".to_string()]),
            r"C:\backend.exe --payload"
        );
        assert_eq!(
            build_command_line(r"C:\Program Files\Argus\backend.exe", &[]),
            r#""C:\Program Files\Argus\backend.exe""#
        );
    }

    #[test]
    fn command_lines_round_trip_through_argv_rules() {
        let cases: &[&[&str]] = &[
            &[r"C:\backend\secrets.exe"],
            &[r"C:\Program Files\Argus\backend.exe", "--payload"],
            &["backend", "one two", "three"],
            &["backend", "quote\"inside", "trail\\"],
            &["backend", "", "--flag=with space"],
            &["backend", r"\\server\share", r#"a\"b"#],
            &["backend", r"tricky\\", r#""quoted""#],
            &["backend", "mix \"of\tall\\ three\""],
        ];
        for argv in cases {
            let (program, args) = argv.split_first().unwrap();
            let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
            let line = build_command_line(program, &args);
            let parsed = split_command_line(&line);
            let expected: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
            assert_eq!(parsed, expected, "argv did not round-trip through: {line}");
        }
    }
}
