//! Terminal inspection for the command channel.

use std::io::IsTerminal;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

/// True when the process's stdin is attached to an interactive terminal.
pub fn stdin_is_terminal() -> bool {
    std::io::stdin().is_terminal()
}

/// Current size of the controlling terminal, if there is one. A terminal that
/// reports zero rows or columns counts as absent.
pub fn current_size() -> Option<TerminalSize> {
    let (terminal_size::Width(width), terminal_size::Height(height)) =
        terminal_size::terminal_size()?;
    (width > 0 && height > 0).then_some(TerminalSize { width, height })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_size_is_nonzero_when_present() {
        // Test harnesses usually run without a terminal; only check sanity.
        if let Some(size) = current_size() {
            assert!(size.width > 0);
            assert!(size.height > 0);
        }
    }
}
