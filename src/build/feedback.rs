use colored::*;
use regex::Regex;
use std::sync::LazyLock;

static MISSING_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"fatal error: ([^:\s]+): No such file or directory").expect("static regex")
});

pub struct FeedbackAnalyzer;

impl FeedbackAnalyzer {
    /// Turn toolchain output into a hint for the user.
    pub fn analyze(output: &str) -> Option<String> {
        // 1. Missing header (compiler error)
        if let Some(caps) = MISSING_HEADER.captures(output) {
            let header = &caps[1];
            return Some(format!(
                "It looks like a {} error: {} was not found.\nInstall the library that provides it into one of the {} folders, or check the spelling of the {}.",
                "Missing Header".bold().red(),
                header.bold().yellow(),
                "--libraries".bold().green(),
                "#include".bold().yellow()
            ));
        }

        // 2. Sketch entry points (linker error)
        if output.contains("undefined reference to `setup'")
            || output.contains("undefined reference to `loop'")
        {
            return Some(format!(
                "Your sketch is missing a {} or {} function.",
                "setup()".bold().yellow(),
                "loop()".bold().yellow()
            ));
        }

        // 3. Generic undefined symbol (linker error)
        if output.contains("undefined reference to") {
            return Some(format!(
                "It looks like a {} error.\nA function is declared but never defined, or a library source was not compiled.\nRebuild with {} to see which objects were linked.",
                "Linker".bold().red(),
                "--verbose".bold().green()
            ));
        }

        // 4. Program too big for the board
        if output.contains("will not fit in region") || output.contains("overflowed by") {
            return Some(format!(
                "The {} does not fit in the board memory.\nRemove unused libraries or pick an optimization that favours size ({}).",
                "Sketch".bold().red(),
                "-Os".bold().yellow()
            ));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_header() {
        colored::control::set_override(false);
        let err = "Blink.ino:1:10: fatal error: Servo.h: No such file or directory";
        let msg = FeedbackAnalyzer::analyze(err).unwrap();
        assert!(msg.contains("Missing Header"));
        assert!(msg.contains("Servo.h was not found"));
    }

    #[test]
    fn test_missing_loop() {
        colored::control::set_override(false);
        let err = "main.cpp:(.text.main+0x2c): undefined reference to `loop'";
        let msg = FeedbackAnalyzer::analyze(err).unwrap();
        assert!(msg.contains("missing a setup() or loop() function"));
    }

    #[test]
    fn test_linker_error() {
        colored::control::set_override(false);
        let err = "sketch.ino.cpp.o: undefined reference to `blink()'";
        let msg = FeedbackAnalyzer::analyze(err).unwrap();
        assert!(msg.contains("Linker error"));
    }

    #[test]
    fn test_region_overflow() {
        colored::control::set_override(false);
        let err = "region `text' overflowed by 1024 bytes";
        assert!(FeedbackAnalyzer::analyze(err).unwrap().contains("does not fit"));
        assert!(FeedbackAnalyzer::analyze("all good").is_none());
    }
}
