//! System-message patching
//!
//! Ordered edit operations over the system message text. The original and
//! patched texts can be dumped to a file, overwritten on each request.

use crate::config::SystemMessageConfig;
use tracing::warn;

/// Apply the configured patch operations: Remove, Replace, AddAfter,
/// AddToEnd, AddToBegin, in that order.
pub fn patch(config: &SystemMessageConfig, system_message: &str) -> String {
    let patch = &config.patch;
    let mut msg = system_message.to_string();

    for phrase in &patch.remove {
        if !phrase.is_empty() {
            msg = msg.replace(phrase.as_str(), "");
        }
    }

    for (old, new) in &patch.replace {
        if !old.is_empty() {
            msg = msg.replace(old.as_str(), new.as_str());
        }
    }

    for rule in &patch.add_after {
        if rule.find.is_empty() {
            continue;
        }
        let insertion = format!("{}{}", rule.find, rule.insert);
        msg = msg.replace(rule.find.as_str(), &insertion);
    }

    if !patch.add_to_end.is_empty() {
        for line in &patch.add_to_end {
            msg.push('\n');
            msg.push_str(line);
        }
    }

    if !patch.add_to_begin.is_empty() {
        let mut prefix = String::new();
        for line in &patch.add_to_begin {
            prefix.push('\n');
            prefix.push_str(line);
        }
        msg = format!("{}{}", prefix, msg);
    }

    msg
}

/// Overwrite the dump file with the original and patched texts.
pub fn dump(config: &SystemMessageConfig, original: &str, patched: &str) {
    let Some(path) = &config.dump_file else {
        return;
    };
    if path.is_empty() {
        return;
    }
    let content = format!(
        "{}\n\n=======================================\n\nPatched version:\n\n{}",
        original, patched
    );
    if let Err(e) = std::fs::write(path, content) {
        warn!(path = %path, error = %e, "error saving system message to file");
    }
}
