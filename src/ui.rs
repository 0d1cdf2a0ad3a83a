use std::sync::mpsc::{Receiver, Sender};

use console::{style, Style, Term};

use crate::controller::Event;
use crate::output::Output;
use crate::probe::VmStatus;

// sysexits.h catchall exit code for when the operation could not be run at all.
const EX_UNAVAILABLE: i32 = 69;

/// Console presentation layer.
///
/// Consumes worker updates relayed by the controller and renders them;
/// sends `Shutdown` back to the controller once a one-shot command has
/// seen its terminal event.
pub struct Ui {
    term: Term,
}

impl Default for Ui {
    fn default() -> Self {
        Self::new()
    }
}

impl Ui {
    /// Construct a UI writing to stdout.
    pub fn new() -> Self {
        Self {
            term: Term::stdout(),
        }
    }

    fn line(&self, line: &str) {
        // I don't see how writing to terminal could fail, but if it does,
        // we have no choice but to panic anyways.
        self.term.write_line(line).expect("Failed to write terminal");
    }

    fn status_line(&self, status: VmStatus) {
        let styled = Style::new().fg(status.color()).bold().apply_to(status.as_str());
        self.line(&format!("Status: {}", styled));
    }

    fn error_out(&self, err: &anyhow::Error) {
        // NB: use debug formatting to get the full error chain
        let err = format!("{:?}", err);
        for line in err.lines() {
            self.line(&style(line).red().bright().to_string());
        }
    }

    /// Drive one start/stop operation to completion.
    ///
    /// Prints the streamed log, then either the failure (returning the
    /// script's exit code, or EX_UNAVAILABLE if it could not be run) or,
    /// on success, the settle poll's status (returning 0).
    pub fn run_operation(&self, updates: Receiver<Output>, handle: Sender<Event>) -> i32 {
        let mut rc = EX_UNAVAILABLE;

        loop {
            let update = match updates.recv() {
                Ok(u) => u,
                // Controller hung up
                Err(_) => break,
            };

            match update {
                Output::OperationStart(action) => {
                    self.line(&style(format!("=> {}", action)).bold().to_string());
                }
                Output::Operation(line) => self.line(&style(line).dim().to_string()),
                Output::OperationEnd(Ok(0)) => {
                    self.line(&style("Operation completed successfully.").green().to_string());
                    rc = 0;
                    // A settle poll follows; stay around for its result
                }
                Output::OperationEnd(Ok(code)) => {
                    self.line(
                        &style(format!(
                            "Operation failed with exit code {}. See log above.",
                            code
                        ))
                        .red()
                        .bright()
                        .to_string(),
                    );
                    rc = code;
                    let _ = handle.send(Event::Shutdown);
                    break;
                }
                Output::OperationEnd(Err(e)) => {
                    self.error_out(&e);
                    rc = EX_UNAVAILABLE;
                    let _ = handle.send(Event::Shutdown);
                    break;
                }
                Output::ProbeStart => self.line("Checking VM status..."),
                Output::ProbeEnd(status) => {
                    self.status_line(status);
                    let _ = handle.send(Event::Shutdown);
                    break;
                }
            }
        }

        rc
    }

    /// Drive a single status poll and print the result.
    pub fn run_status(&self, updates: Receiver<Output>, handle: Sender<Event>) {
        loop {
            match updates.recv() {
                Ok(Output::ProbeEnd(status)) => {
                    self.status_line(status);
                    let _ = handle.send(Event::Shutdown);
                    break;
                }
                Ok(_) => (),
                Err(_) => break,
            }
        }
    }

    /// Print every poll result until the controller hangs up (in practice,
    /// until the process is killed).
    pub fn run_watch(&self, updates: Receiver<Output>) {
        loop {
            match updates.recv() {
                Ok(Output::ProbeEnd(status)) => self.status_line(status),
                Ok(_) => (),
                Err(_) => break,
            }
        }
    }
}
