//! Output post-processing
//!
//! Strips banner lines that auxiliary tooling (npm timing, audit and funding
//! notices) leaks into a program's transcript, so the visible output is the
//! program's own.

/// Line-based filter for tooling noise
#[derive(Debug, Clone, Copy, Default)]
pub struct NoiseFilter;

impl NoiseFilter {
    pub fn new() -> Self {
        Self
    }

    /// Drop noise lines; the remaining lines are joined with `\n`
    pub fn clean(&self, output: &str) -> String {
        output
            .lines()
            .filter(|line| !self.is_noise(line))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Whether a single line is tooling noise
    pub fn is_noise(&self, line: &str) -> bool {
        let trimmed = line.trim();

        // npm timing
        if line.contains("timing npm:") || (trimmed.starts_with("timing") && line.contains("Completed in")) {
            return true;
        }

        // npm install / funding / audit
        if (line.starts_with("added ") && line.contains("packages"))
            || line.contains("packages are looking for funding")
            || line.contains("run `npm fund`")
            || line.contains("found 0 vulnerabilities")
            || (line.contains("audited") && line.contains("packages in"))
            || line.to_lowercase().contains("up to date in")
        {
            return true;
        }

        // npm version banner
        if trimmed.starts_with("npm") && trimmed.contains('v') && trimmed.chars().count() < 15 {
            return true;
        }

        // "12 timing ..." style progress
        if line.contains("timing") && line.chars().take(10).any(|c| c.is_ascii_digit()) {
            return true;
        }

        is_counted_banner(trimmed)
    }
}

/// `"<count> <word> ..."` lines, excluding decimals such as `3.14 is pi`
fn is_counted_banner(trimmed: &str) -> bool {
    let starts_with_digit = trimmed.chars().next().is_some_and(|c| c.is_ascii_digit());
    if !starts_with_digit || is_decimal_start(trimmed) {
        return false;
    }

    let mut words = trimmed.split_whitespace();
    match (words.next(), words.next()) {
        (Some(first), Some(second)) => {
            first.chars().all(|c| c.is_ascii_digit()) && !second.starts_with('.')
        }
        _ => false,
    }
}

fn is_decimal_start(trimmed: &str) -> bool {
    let mut chars = trimmed.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some(d), Some('.')) if d.is_ascii_digit()
    )
}
