// Terminal rendering for actflow commands
// Progress goes to stderr; step output goes to stdout so it can be piped

use actflow_engine::Conclusion;

const BOLD: &str = "1";
const DIM: &str = "2";
const RED: &str = "31";
const GREEN: &str = "32";
const YELLOW: &str = "33";
const MAGENTA: &str = "35";
const CYAN: &str = "36";

fn paint(code: &str, text: &str) -> String {
    format!("\x1b[{}m{}\x1b[0m", code, text)
}

fn color(conclusion: Conclusion) -> &'static str {
    match conclusion {
        Conclusion::Success => GREEN,
        Conclusion::Failure => RED,
        Conclusion::Cancelled => MAGENTA,
        Conclusion::Skipped => DIM,
    }
}

/// Symbol printed in front of a finished job or step
pub fn mark(conclusion: Conclusion) -> &'static str {
    match conclusion {
        Conclusion::Success => "\u{2713}",
        Conclusion::Failure => "\u{2717}",
        Conclusion::Cancelled => "\u{2298}",
        Conclusion::Skipped => "-",
    }
}

/// Right-aligned action word, as in `  Validating ci.yml`
pub fn status(action: &str, message: &str) {
    eprintln!("{} {}", paint("1;36", &format!("{:>12}", action)), message);
}

/// A validation check that passed
pub fn check(message: &str) {
    eprintln!("  {} {}", paint(GREEN, mark(Conclusion::Success)), message);
}

pub fn warning(message: &str) {
    eprintln!("  {} {}", paint(YELLOW, "!"), message);
}

pub fn error(message: &str) {
    eprintln!("{} {}", paint("1;31", "error:"), message);
}

pub fn info(message: &str) {
    eprintln!("  {} {}", paint(CYAN, "i"), message);
}

pub fn dim(message: &str) {
    eprintln!("{}", paint(DIM, message));
}

pub fn header(message: &str) {
    eprintln!("{}", paint(BOLD, &format!("==> {}", message)));
}

/// A job or step line coloured by how it concluded
pub fn concluded(indent: usize, conclusion: Conclusion, message: &str) {
    let line = format!("{} {}", mark(conclusion), message);
    eprintln!("{:indent$}{}", "", paint(color(conclusion), &line), indent = indent);
}

/// Final line of a run
pub fn run_finished(status: Conclusion, secs: f64) {
    let message = match status {
        Conclusion::Success => format!("Run completed successfully in {:.2}s", secs),
        Conclusion::Cancelled => format!("Run cancelled after {:.2}s", secs),
        _ => format!("Run failed after {:.2}s", secs),
    };
    eprintln!(
        "  {} {}",
        paint(&format!("{};{}", BOLD, color(status)), mark(status)),
        message
    );
}

/// One row of the post-run job table; `detail` is printed beneath it
pub fn summary_row(name: &str, conclusion: Conclusion, detail: Option<&str>) {
    let line = format!("{:<40} {}", name, conclusion);
    concluded(2, conclusion, &line);
    if let Some(detail) = detail {
        eprintln!("      {}", paint(DIM, detail));
    }
}

pub fn step_output(line: &str) {
    println!("        | {}", line);
}

pub fn step_error(line: &str) {
    eprintln!("        {}", paint(RED, &format!("| {}", line)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marks_are_distinct() {
        let marks = [
            Conclusion::Success,
            Conclusion::Failure,
            Conclusion::Cancelled,
            Conclusion::Skipped,
        ]
        .map(mark);
        for (i, a) in marks.iter().enumerate() {
            assert!(marks[i + 1..].iter().all(|b| a != b));
        }
    }

    #[test]
    fn test_paint_resets() {
        assert_eq!(paint(RED, "x"), "\x1b[31mx\x1b[0m");
    }
}
