//! Terminal formatting for `show` output.
//!
//! Pure string transformations applied after content retrieval.  Syntax
//! highlighting is not done here; `color` only styles the line-number gutter.

const DIGIT_STYLE: &str = "\x1b[38;5;239m";
const BAR_STYLE: &str = "\x1b[38;5;236m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderOptions {
    pub line_numbers: bool,
    pub color: bool,
}

pub fn render(content: &str, opts: RenderOptions) -> String {
    if opts.line_numbers {
        with_line_numbers(content, opts.color)
    } else {
        content.to_string()
    }
}

/// Prefix every line with a right-aligned line number and a bar.
///
/// A trailing newline does not produce an extra numbered empty line.
pub fn with_line_numbers(content: &str, color: bool) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    // Digits are one byte each, so byte length is the display width.
    let width = lines.len().to_string().len();
    let last = lines.len() - 1;

    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            if i == last && line.is_empty() {
                return String::new();
            }
            let digit = format!("{:>width$}", i + 1);
            if color {
                format!(" {DIGIT_STYLE}{digit}{RESET} {BAR_STYLE}│{RESET} {line}")
            } else {
                format!(" {digit} │ {line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_right_aligned() {
        let content = (1..=10).map(|i| format!("l{i}")).collect::<Vec<_>>().join("\n");
        let out = with_line_numbers(&content, false);
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[0], "  1 │ l1");
        assert_eq!(lines[9], " 10 │ l10");
    }

    #[test]
    fn trailing_newline_is_not_numbered() {
        assert_eq!(with_line_numbers("a\nb\n", false), " 1 │ a\n 2 │ b\n");
    }

    #[test]
    fn color_styles_only_the_gutter() {
        let out = with_line_numbers("fn main() {}", true);
        assert!(out.contains(DIGIT_STYLE));
        assert!(out.ends_with("fn main() {}"));
    }

    #[test]
    fn plain_render_is_identity() {
        assert_eq!(render("x\ny", RenderOptions::default()), "x\ny");
    }
}
