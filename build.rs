use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own sources. Nothing else is scanned.
const SOURCE_DIRS: [&str; 5] = ["estimate", "diagnose", "cli", "tests", "benches"];

const CHANGE_LOG_WORDS: [&str; 14] = [
    "FIXED", "CORRECTED", "FIX", "FIXES", "NEW", "CHANGED", "CHANGES", "CHANGE", "MODIFIED",
    "MODIFIES", "MODIFY", "UPDATED", "UPDATES", "UPDATE",
];

// One source policy, checked line by line.
#[derive(Clone, Copy)]
enum Rule {
    UnderscoreBinding,
    ChangeLogComment,
    StarsInComment,
    ShoutingComment,
    AllowDeadCode,
}

impl Rule {
    const ALL: [Rule; 5] = [
        Rule::UnderscoreBinding,
        Rule::ChangeLogComment,
        Rule::StarsInComment,
        Rule::ShoutingComment,
        Rule::AllowDeadCode,
    ];

    fn pattern(self) -> &'static str {
        match self {
            Rule::UnderscoreBinding => r"\b(_[a-zA-Z0-9_]+)\b",
            Rule::ChangeLogComment => {
                r"(//|/\*).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)"
            }
            Rule::StarsInComment => r"(//|/\*).*\*\*",
            Rule::ShoutingComment => r"(//|/\*).*",
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        }
    }

    fn applies_to_build_script(self) -> bool {
        matches!(self, Rule::UnderscoreBinding)
    }

    // Decides whether a line the pattern matched really breaks the rule.
    fn is_violation(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        match self {
            Rule::UnderscoreBinding => {
                let is_comment = trimmed.starts_with("//") || line.contains("/*");
                let in_string = line
                    .split('"')
                    .enumerate()
                    .any(|(i, part)| i % 2 == 1 && part.contains('_'));
                !is_comment && !in_string
            }
            Rule::StarsInComment => {
                // Doc comments may use markdown emphasis unless they also carry a change-log word.
                !trimmed.starts_with("///")
                    || CHANGE_LOG_WORDS.iter().any(|word| line.contains(word))
            }
            Rule::ShoutingComment => {
                let comment = if let Some(rest) = trimmed.strip_prefix("///") {
                    rest
                } else if let Some(rest) = trimmed.strip_prefix("//") {
                    rest
                } else if let Some(idx) = line.find("/*") {
                    let rest = &line[idx + 2..];
                    rest.find("*/").map_or(rest, |end| &rest[..end])
                } else {
                    return false;
                };
                let mut letters = comment.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(char::is_uppercase)
            }
            Rule::ChangeLogComment | Rule::AllowDeadCode => true,
        }
    }

    fn explanation(self) -> &'static str {
        match self {
            Rule::UnderscoreBinding => {
                "Underscore-prefixed names are not allowed. Either use the binding (removing the underscore) or remove it completely."
            }
            Rule::ChangeLogComment => {
                "Comments narrating edits (FIX, FIXED, CORRECTED, NEW, CHANGED, MODIFIED, UPDATED and similar) are not allowed. Remove them completely."
            }
            Rule::StarsInComment => {
                "The '**' pattern is not allowed in regular comments (it is allowed in /// doc comments)."
            }
            Rule::ShoutingComment => {
                "Comments whose alphabetic characters are all uppercase are not allowed."
            }
            Rule::AllowDeadCode => {
                "#[allow(dead_code)] is not allowed. Either use the code or remove it completely."
            }
        }
    }
}

// Collects every violating line of one file for one rule.
struct RuleSink {
    rule: Rule,
    violations: Vec<String>,
}

impl Sink for RuleSink {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn source_files() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .filter(|dir| Path::new(dir).is_dir())
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn check_file(rule: Rule, matcher: &RegexMatcher, path: &Path) -> Result<(), Box<dyn Error>> {
    let mut sink = RuleSink {
        rule,
        violations: Vec::new(),
    };
    Searcher::new().search_path(matcher, path, &mut sink)?;
    if sink.violations.is_empty() {
        return Ok(());
    }
    let mut message = format!(
        "\n❌ ERROR: {} source policy violations in {}:\n",
        sink.violations.len(),
        path.display()
    );
    for violation in &sink.violations {
        message.push_str(&format!("   {violation}\n"));
    }
    message.push_str(&format!("\n⚠️ {}\n", rule.explanation()));
    Err(message.into())
}

fn scan_sources(files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    for rule in Rule::ALL {
        let matcher = RegexMatcher::new_line_matcher(rule.pattern())?;
        if rule.applies_to_build_script() {
            check_file(rule, &matcher, Path::new("build.rs"))?;
        }
        for path in files {
            check_file(rule, &matcher, path)?;
        }
    }
    Ok(())
}

// Compiles this script on its own with the strict lints so it obeys the policy it enforces.
fn check_build_script_lints() {
    let Ok(out_dir) = std::env::var("OUT_DIR") else {
        return;
    };
    let output = std::process::Command::new("rustc")
        .args([
            "--edition",
            "2021",
            "-D",
            "unused_variables",
            "-D",
            "dead_code",
            "-D",
            "unused_imports",
            "--crate-type",
            "bin",
            "--error-format",
            "human",
            "--out-dir",
            &out_dir,
            "build.rs",
        ])
        .output();

    match output {
        Ok(output) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let offence = [
                ("unused variable", "Unused variables"),
                ("is never used", "Unused functions"),
                ("unused import", "Unused imports"),
            ]
            .into_iter()
            .find(|(needle, _)| stderr.contains(needle));
            if let Some((_, what)) = offence {
                eprintln!("\n❌ ERROR: {what} detected in build.rs!");
                eprintln!("{stderr}");
                eprintln!("\n⚠️ {what} are not allowed in this project.");
                std::process::exit(1);
            }
        }
        Ok(_) => {}
        Err(_) => {
            println!("cargo:warning=Could not lint build.rs with rustc");
        }
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    check_build_script_lints();

    let files = source_files();
    if let Err(e) = scan_sources(&files) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
