//! Solution harness
//!
//! Editor snippets often define a `class Solution` with a single method and no
//! entry point. When enabled, the harness appends a `__main__` guard that calls
//! that method with the request's stdin and prints the result.
//!
//! The append is opt-in and only happens when stdin is non-empty; code is never
//! rewritten with a made-up input.

use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

/// `def name(self, arg` - a method taking one argument besides `self`
fn method_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"def\s+(\w+)\s*\(\s*self\s*,\s*\w+").ok())
        .as_ref()
}

/// Appends a `__main__` guard to bare `Solution` classes
#[derive(Debug, Clone, Copy, Default)]
pub struct SolutionHarness {
    enabled: bool,
}

impl SolutionHarness {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Harnessed code, or `None` when the code is left untouched
    pub fn apply(&self, code: &str, stdin: Option<&str>) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let input = stdin.map(str::trim).filter(|input| !input.is_empty())?;

        let eligible = code.contains("class Solution")
            && code.contains("return ")
            && !code.contains("print(")
            && !code.contains("__main__");
        if !eligible {
            return None;
        }

        let method = method_pattern()?
            .captures_iter(code)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .find(|name| !name.starts_with("__"))?;

        debug!("Appending solution harness for method '{}'", method);
        Some(format!(
            "{}\n\nif __name__ == '__main__':\n    solution = Solution()\n    test_input = {}\n    result = solution.{}(test_input)\n    print(result)\n",
            code.trim_end(),
            input,
            method
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOLUTION: &str = "class Solution:\n    def twoSum(self, nums):\n        return sum(nums)\n";

    #[test]
    fn test_disabled_by_default() {
        assert!(SolutionHarness::default().apply(SOLUTION, Some("[1, 2]")).is_none());
    }

    #[test]
    fn test_appends_guard() {
        let harness = SolutionHarness::new(true);
        let code = harness.apply(SOLUTION, Some(" [1, 2]\n")).unwrap();

        assert!(code.starts_with("class Solution:"));
        assert!(code.contains("test_input = [1, 2]\n"));
        assert!(code.contains("result = solution.twoSum(test_input)"));
        assert!(code.ends_with("print(result)\n"));
    }

    #[test]
    fn test_requires_input() {
        let harness = SolutionHarness::new(true);
        assert!(harness.apply(SOLUTION, None).is_none());
        assert!(harness.apply(SOLUTION, Some("  \n")).is_none());
    }

    #[test]
    fn test_skips_complete_programs() {
        let harness = SolutionHarness::new(true);

        let with_print = format!("{}print(Solution().twoSum([1]))\n", SOLUTION);
        assert!(harness.apply(&with_print, Some("[1]")).is_none());

        let with_guard = format!("{}if __name__ == '__main__':\n    pass\n", SOLUTION);
        assert!(harness.apply(&with_guard, Some("[1]")).is_none());

        assert!(harness.apply("x = 1\nreturn_value = 2\n", Some("[1]")).is_none());
    }

    #[test]
    fn test_skips_dunder_methods() {
        let harness = SolutionHarness::new(true);
        let code = "class Solution:\n    def __init__(self, n):\n        self.n = n\n    def solve(self, xs):\n        return len(xs)\n";
        let harnessed = harness.apply(code, Some("[1]")).unwrap();
        assert!(harnessed.contains("solution.solve(test_input)"));
    }
}
