/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Single-line terminal progress reporting with a scoped prefix stack.

use std::io::{self, IsTerminal, Write};
use std::sync::Mutex;

use once_cell::sync::Lazy;

static GLOBAL: Lazy<Progress> = Lazy::new(Progress::new);

/// Pseudo-function for transient status lines.
///
/// When stdout is a terminal, [`Progress::line`] overwrites a single
/// status line in place with a carriage return; otherwise transient
/// lines are dropped and only [`Progress::note`] output is emitted.
/// Prefixes pushed with [`Progress::prefix`] are prepended to every
/// line until the returned guard drops.
pub struct Progress {
    terse: bool,
    width: usize,
    prefixes: Mutex<Vec<String>>,
}

impl Progress {
    pub fn new() -> Progress {
        let terse = !io::stdout().is_terminal();
        let width = crossterm::terminal::size()
            .map(|(cols, _rows)| cols as usize)
            .ok()
            .filter(|w| *w > 0)
            .unwrap_or(80);
        Progress::with_width(terse, width)
    }

    /// The process-wide default reporter.
    pub fn global() -> &'static Progress {
        &GLOBAL
    }

    pub(crate) fn with_width(terse: bool, width: usize) -> Progress {
        Progress {
            terse,
            // Keep one column free so the cursor never wraps.
            width: width.saturating_sub(1).max(8),
            prefixes: Mutex::new(vec![String::new()]),
        }
    }

    pub fn push(&self, text: &str) {
        let mut stack = self.lock();
        let combined = format!("{}{}", stack.last().map(String::as_str).unwrap_or(""), text);
        stack.push(combined);
        drop(stack);
        self.line("");
    }

    pub fn pop(&self) {
        let mut stack = self.lock();
        if stack.len() > 1 {
            stack.pop();
        }
        drop(stack);
        self.line("");
    }

    /// Pushes *text* onto the prefix stack until the guard drops.
    pub fn prefix(&self, text: &str) -> PrefixGuard<'_> {
        self.push(text);
        PrefixGuard { progress: self }
    }

    /// Writes a transient status line, overwritten by the next one.
    pub fn line(&self, text: &str) {
        if self.terse {
            return;
        }
        let rendered = self.render(text);
        let mut out = io::stdout().lock();
        let _ = write!(out, "{}\r", rendered);
        let _ = out.flush();
    }

    /// Writes a permanent, newline-terminated line.
    pub fn note(&self, text: &str) {
        let rendered = self.render(text);
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{}", rendered.trim_end());
        let _ = out.flush();
    }

    /// Combines the current prefix with *text*, clipped and padded to
    /// the status-line width.
    pub(crate) fn render(&self, text: &str) -> String {
        let stack = self.lock();
        let full = format!("{}{}", stack.last().map(String::as_str).unwrap_or(""), text);
        drop(stack);
        let mut clipped: String = full.chars().take(self.width).collect();
        let padding = self.width.saturating_sub(clipped.chars().count());
        clipped.extend(std::iter::repeat(' ').take(padding));
        clipped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.prefixes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Progress {
    fn default() -> Progress {
        Progress::new()
    }
}

pub struct PrefixGuard<'a> {
    progress: &'a Progress,
}

impl Drop for PrefixGuard<'_> {
    fn drop(&mut self) {
        self.progress.pop();
    }
}
