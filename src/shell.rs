/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use once_cell::sync::Lazy;
use regex::Regex;

/// Characters that pass through a POSIX shell unmolested.
static SHELL_SAFE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_@%+=:,./-]+$").unwrap());

/// Quotes *token* so the device shell receives it as a single word.
///
/// Tokens made of safe characters are passed through as-is; everything
/// else is wrapped in single quotes, with embedded single quotes spliced
/// out through double quotes.
pub fn quote(token: &str) -> String {
    if !token.is_empty() && SHELL_SAFE.is_match(token) {
        return token.to_owned();
    }
    format!("'{}'", token.replace('\'', "'\"'\"'"))
}
