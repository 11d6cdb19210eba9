/// Names a level script may not mention. Everything here either loads
/// code, reaches the host environment, or unpicks the metatable
/// sandbox. The runtime also nils these out of the globals, so the
/// validator is the advisory first line, not the only one. Note that
/// bare `load` is absent: scripts define a `load()` hook, and the
/// builtin of that name is stripped from the sandbox instead.
const BANNED_NAMES: &[&str] = &[
    "require",
    "dofile",
    "loadfile",
    "loadstring",
    "os",
    "io",
    "package",
    "debug",
    "getmetatable",
    "setmetatable",
    "rawget",
    "rawset",
    "rawequal",
    "rawlen",
    "collectgarbage",
    "coroutine",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub line: usize,
    pub column: usize,
    pub name: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "`{}` at line {} column {}",
            self.name, self.line, self.column
        )
    }
}

/// Static scan for banned identifiers outside strings and comments.
/// Field accesses (`foo.os`) are allowed; only free names are flagged.
pub fn validate(source: &str) -> Option<Violation> {
    let bytes = source.as_bytes();
    let mut i = 0;
    let mut line = 1;
    let mut column = 1;
    let mut previous_significant = 0u8;

    let advance = |byte: u8, line: &mut usize, column: &mut usize| {
        if byte == b'\n' {
            *line += 1;
            *column = 1;
        } else {
            *column += 1;
        }
    };

    while i < bytes.len() {
        let byte = bytes[i];

        // Comments: `--` to end of line, or a long `--[[ ]]` block.
        if byte == b'-' && bytes.get(i + 1) == Some(&b'-') {
            if bytes.get(i + 2) == Some(&b'[') && bytes.get(i + 3) == Some(&b'[') {
                i += 4;
                column += 4;
                while i < bytes.len() {
                    if bytes[i] == b']' && bytes.get(i + 1) == Some(&b']') {
                        advance(bytes[i], &mut line, &mut column);
                        advance(bytes[i + 1], &mut line, &mut column);
                        i += 2;
                        break;
                    }
                    advance(bytes[i], &mut line, &mut column);
                    i += 1;
                }
            } else {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                    column += 1;
                }
            }
            continue;
        }

        // String literals, including `[[ ]]` long strings.
        if byte == b'"' || byte == b'\'' {
            let quote = byte;
            advance(byte, &mut line, &mut column);
            i += 1;
            while i < bytes.len() {
                if bytes[i] == b'\\' && i + 1 < bytes.len() {
                    advance(bytes[i], &mut line, &mut column);
                    advance(bytes[i + 1], &mut line, &mut column);
                    i += 2;
                    continue;
                }
                let done = bytes[i] == quote;
                advance(bytes[i], &mut line, &mut column);
                i += 1;
                if done {
                    break;
                }
            }
            previous_significant = quote;
            continue;
        }
        if byte == b'[' && bytes.get(i + 1) == Some(&b'[') {
            i += 2;
            column += 2;
            while i < bytes.len() {
                if bytes[i] == b']' && bytes.get(i + 1) == Some(&b']') {
                    advance(bytes[i], &mut line, &mut column);
                    advance(bytes[i + 1], &mut line, &mut column);
                    i += 2;
                    break;
                }
                advance(bytes[i], &mut line, &mut column);
                i += 1;
            }
            previous_significant = b']';
            continue;
        }

        // Identifier tokens.
        if byte.is_ascii_alphabetic() || byte == b'_' {
            let start = i;
            let start_line = line;
            let start_column = column;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                advance(bytes[i], &mut line, &mut column);
                i += 1;
            }
            let word = &source[start..i];
            let is_field = previous_significant == b'.' || previous_significant == b':';
            if !is_field && BANNED_NAMES.contains(&word) {
                return Some(Violation {
                    line: start_line,
                    column: start_column,
                    name: word.to_string(),
                });
            }
            previous_significant = b'a';
            continue;
        }

        if !byte.is_ascii_whitespace() {
            previous_significant = byte;
        }
        advance(byte, &mut line, &mut column);
        i += 1;
    }

    None
}
