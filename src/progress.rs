use std::time::{Duration, Instant};

use spinners_rs::{Spinner, Spinners};

// ESEQ is for "escape sequence"
pub const ESEQ_DELETE_LINE: &str = "\x1b[0J";
pub const ESEQ_RED: &str = "\x1b[38;5;1m";
pub const ESEQ_GREEN: &str = "\x1b[38;5;2m";
pub const ESEQ_WEAK: &str = "\x1b[38;5;240m";
pub const ESEQ_RESET: &str = "\x1b[m";

pub const SPINNER_MS: u64 = 50;

/// Terminal spinner for the phase currently running. A hidden view accepts every call and
/// draws nothing, which is what `--quiet`, pipes and tests get.
pub struct ProgressView {
    task: String,
    spinner: Option<Spinner>,
    running: bool,
    previous_update: Instant,
}

impl ProgressView {
    pub fn new(task: impl ToString, visible: bool) -> Self {
        let spinner = visible.then(|| {
            let mut spinner = Spinner::new(Spinners::BouncingBar, task.to_string());
            spinner.set_interval(SPINNER_MS);
            spinner
        });

        Self {
            task: task.to_string(),
            spinner,
            running: false,
            previous_update: Instant::now(),
        }
    }

    #[cfg(test)]
    pub fn hidden() -> Self {
        Self::new("", false)
    }

    fn start(&mut self) {
        if self.running {
            return;
        }
        if let Some(spinner) = self.spinner.as_mut() {
            spinner.start();
            self.running = true;
        }
    }

    /// Switches to a new phase, restarting the spinner if the previous one was stopped.
    pub fn begin(&mut self, new_task: &str) {
        self.task = new_task.to_string();
        if let Some(spinner) = self.spinner.as_mut() {
            spinner.set_message(new_task);
        }
        self.start();
    }

    pub fn report_intermediate(&mut self, done: usize, comment: Option<&str>) {
        if self.previous_update.elapsed() <= Duration::from_millis(SPINNER_MS * 2) {
            return;
        }
        self.previous_update = Instant::now();

        let Some(spinner) = self.spinner.as_mut() else {
            return;
        };
        spinner.set_message(format!(
            "{ESEQ_DELETE_LINE}[{}] {}{}{ESEQ_RESET}",
            done,
            self.task,
            comment
                .map(|comment| format!("{ESEQ_WEAK} - {comment}"))
                .unwrap_or("".to_owned())
        ));
    }

    pub fn success(&mut self, message: Option<&str>) {
        self.finish(ESEQ_GREEN, "✓", message);
    }

    pub fn failure(&mut self, message: Option<&str>) {
        self.finish(ESEQ_RED, "!", message);
    }

    fn finish(&mut self, color: &str, mark: &str, message: Option<&str>) {
        self.previous_update = Instant::now();

        if !self.running {
            return;
        }
        let Some(spinner) = self.spinner.as_mut() else {
            return;
        };
        self.running = false;
        spinner.stop_with_message(format!(
            "{ESEQ_DELETE_LINE}{color}{mark} {}{}{ESEQ_RESET}",
            self.task,
            message
                .map(|message| format!(" - {}", message))
                .unwrap_or("".to_owned())
        ));
        println!();
    }
}
