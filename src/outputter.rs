use std::fmt::Display;
use std::io::Stdout;
use std::io::Write;

use console::Style;
use tracing::warn;

use crate::asserter::MismatchReport;
use crate::runner::Outcome;
use crate::runner::RunError;
use crate::runner::RunSummary;

pub struct OutPutter<W: Write> {
    out: W,
}

impl OutPutter<Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> OutPutter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn start(&mut self, test_path: &str, n_tests: usize) {
        let style = Style::new().bold().cyan();
        let open_text = format!("Running test file: {test_path} Found {n_tests} tests: Running...");

        self.line(style.apply_to(open_text));
    }

    pub fn running(&mut self, name: &str) {
        self.line(format!("running test {name}"));
    }

    pub fn outcome(&mut self, name: &str, outcome: &Outcome) {
        match outcome {
            Outcome::Passed | Outcome::NoRequest => {
                self.line(format!(
                    "{} {name}",
                    console::style("SUCCESS").green().bold()
                ));
            }
            Outcome::Failed(mismatch) => {
                self.line(format!("{} {name}", console::style("FAIL").red().bold()));
                self.line(MismatchReport(mismatch));
            }
        }
    }

    pub fn aborted(&mut self, error: &RunError) {
        self.line(format!(
            "{} {}: {}",
            console::style("FAIL").red().bold(),
            error.test,
            error.source,
        ));
    }

    /// An aborted run was already reported by [`OutPutter::aborted`], so it gets no line here.
    pub fn summary(&mut self, summary: &RunSummary) {
        self.line("");

        if !summary.failed.is_empty() {
            self.line(console::style("Summary of Failed Tests:").bold().red());
            for (idx, (name, mismatch)) in summary.failed.iter().enumerate() {
                self.line(format!("\n{}. {name}: {mismatch}", idx + 1));
            }
        } else if summary.aborted.is_none() {
            self.line(console::style("All tests passed! 🎉").bold().green());
        }
    }

    fn line(&mut self, line: impl Display) {
        if let Err(error) = writeln!(self.out, "{line}") {
            warn!(%error, "failed to write test output");
        }
    }
}
