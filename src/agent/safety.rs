//! Command safety classification.
//!
//! Pure, deterministic triage of shell commands into SAFE / WRITE / BLOCKED.
//! No I/O, no state — the execution decision layer calls this before letting
//! any shell intent anywhere near a tool provider.
//!
//! Precedence: denylisted destructive patterns always win, then known
//! read-only commands, then everything else is treated as state-mutating.
//! Unrecognized commands default to WRITE, never SAFE or BLOCKED.

use once_cell::sync::Lazy;
use regex::Regex;

/// Safety category for a shell command.
///
/// Ordering matters: `Safe < Write < Blocked`, so a compound command takes
/// the worst category of its segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommandSafety {
    Safe,
    Write,
    Blocked,
}

/// Destructive patterns that are blocked unconditionally.
static BLOCKED_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Recursive/forced deletes.
        r"\brm\s+-[a-z]*[rf][a-z]*\s",
        r"\brm\s+-[a-z]*[rf][a-z]*$",
        r"\bdel\s+/[fq]\b",
        r"\brmdir\s+/s\b",
        // Raw device / filesystem destruction.
        r"\b(mkfs|diskpart)\b",
        r"\bformat\s+[a-z]:",
        r"\bdd\s+if=",
        r">\s*/dev/sd",
        // Privilege escalation.
        r"^\s*(sudo|su|doas)\b",
        r"\bchmod\s[^|;&]*\+s",
        // Host control.
        r"\b(shutdown|reboot|poweroff|halt)\b",
        // Fork bomb.
        r":\(\)\s*\{.*\};\s*:",
        // Piping untrusted input to an interpreter.
        r"curl\s.*\|\s*(sh|bash|python)",
        r"wget\s.*\|\s*(sh|bash|python)",
        r"base64\s.*-d.*\|\s*(sh|bash)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid blocked pattern"))
    .collect()
});

/// Commands that only list, read, search, or report status.
const SAFE_COMMANDS: &[&str] = &[
    "ls", "cat", "pwd", "cd", "grep", "rg", "find", "head", "tail", "echo", "wc", "which",
    "whoami", "date", "uname", "env", "printenv", "stat", "file", "du", "df", "ps", "top",
    "uptime", "free", "tree", "less", "more", "history", "man", "type",
];

/// Read-only subcommands of tools that otherwise mutate state.
const SAFE_SUBCOMMANDS: &[(&str, &[&str])] = &[
    ("git", &["status", "log", "diff", "show", "branch", "remote", "blame"]),
    ("docker", &["ps", "images", "logs", "inspect"]),
    ("cargo", &["check", "tree", "metadata"]),
    ("pip", &["list", "show", "freeze"]),
];

/// Normalize a command string for safety analysis.
///
/// Collapses whitespace, lowercases, and strips common evasion attempts
/// (backslashes or empty quotes inserted mid-command, e.g. `r\m` → `rm`).
fn normalize_command(command: &str) -> String {
    static ESCAPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\([^nrtav\\0])").unwrap());
    static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

    let mut normalized = ESCAPE_RE.replace_all(command, "$1").to_string();
    normalized = normalized.replace("\"\"", "");
    normalized = normalized.replace("''", "");
    normalized = WS_RE.replace_all(&normalized, " ").to_string();
    normalized.trim().to_lowercase()
}

/// Split a compound command on pipes, semicolons, `&&`, and `||`.
///
/// Respects single and double quoted strings (does not split inside them).
fn split_compound(command: &str) -> Vec<String> {
    let mut segments: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_single_quote = false;
    let mut in_double_quote = false;

    let mut push_segment = |current: &mut String, segments: &mut Vec<String>| {
        let trimmed = current.trim().to_string();
        if !trimmed.is_empty() {
            segments.push(trimmed);
        }
        current.clear();
    };

    while let Some(ch) = chars.next() {
        match ch {
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                current.push(ch);
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                current.push(ch);
            }
            '|' if !in_single_quote && !in_double_quote => {
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                push_segment(&mut current, &mut segments);
            }
            '&' if !in_single_quote && !in_double_quote => {
                if chars.peek() == Some(&'&') {
                    chars.next();
                }
                push_segment(&mut current, &mut segments);
            }
            ';' if !in_single_quote && !in_double_quote => {
                push_segment(&mut current, &mut segments);
            }
            _ => current.push(ch),
        }
    }
    push_segment(&mut current, &mut segments);

    segments
}

/// True when `needle` appears outside single or double quotes.
fn contains_unquoted(segment: &str, needle: char) -> bool {
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    for ch in segment.chars() {
        match ch {
            '\'' if !in_double_quote => in_single_quote = !in_single_quote,
            '"' if !in_single_quote => in_double_quote = !in_double_quote,
            c if c == needle && !in_single_quote && !in_double_quote => return true,
            _ => {}
        }
    }
    false
}

/// Classify one normalized segment, ignoring the denylist (already checked).
fn classify_segment(segment: &str) -> CommandSafety {
    // Output redirection writes to the filesystem; a quoted '>' is text.
    if contains_unquoted(segment, '>') {
        return CommandSafety::Write;
    }

    let mut tokens = segment.split_whitespace();
    let head = match tokens.next() {
        Some(h) => h,
        None => return CommandSafety::Write,
    };

    if SAFE_COMMANDS.contains(&head) {
        return CommandSafety::Safe;
    }

    if let Some((_, subs)) = SAFE_SUBCOMMANDS.iter().find(|(cmd, _)| *cmd == head) {
        if let Some(sub) = tokens.next() {
            if subs.contains(&sub) {
                return CommandSafety::Safe;
            }
        }
    }

    // Unknown or state-mutating: conservative default.
    CommandSafety::Write
}

/// Classify a shell command as SAFE, WRITE, or BLOCKED.
///
/// A compound command takes the worst category among its segments, and
/// blocked patterns are also matched against the full normalized command so
/// they can't hide across pipe boundaries.
pub fn classify_command(command: &str) -> CommandSafety {
    let full = normalize_command(command);
    if full.is_empty() {
        return CommandSafety::Write;
    }

    if BLOCKED_PATTERNS.iter().any(|re| re.is_match(&full)) {
        return CommandSafety::Blocked;
    }

    let mut worst = CommandSafety::Safe;
    for segment in split_compound(&full) {
        if BLOCKED_PATTERNS.iter().any(|re| re.is_match(&segment)) {
            return CommandSafety::Blocked;
        }
        worst = worst.max(classify_segment(&segment));
    }
    worst
}
