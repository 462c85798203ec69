//! Output gate between the publish command and the user's terminal.
//!
//! Once the 2FA code is written to the command's input, the terminal echoes
//! it back. The gate swallows output from that point until the accumulated
//! muted output equals the code exactly, then lets everything after it
//! through again. If the echo never matches exactly (e.g. it arrives with a
//! trailing `\r\n`), output stays muted for the rest of the session.

use tracing::debug;

#[derive(Debug, Default)]
pub struct OutputGate {
    muted: bool,
    sentinel: String,
    suppressed: String,
}

impl OutputGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass `chunk` through, or hold it back while muted.
    pub fn feed<'a>(&mut self, chunk: &'a str) -> Option<&'a str> {
        if !self.muted {
            return Some(chunk);
        }

        self.suppressed.push_str(chunk);
        if self.suppressed == self.sentinel {
            debug!("injected input echo observed, resuming output");
            self.muted = false;
            self.suppressed.clear();
            self.sentinel.clear();
        }
        None
    }

    /// Suppress output until `sentinel` has been seen.
    pub fn mute(&mut self, sentinel: impl Into<String>) {
        self.muted = true;
        self.sentinel = sentinel.into();
        self.suppressed.clear();
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }
}
