//! Solver termination state.

use serde::{Deserialize, Serialize};

/// Monotone termination flag plus a human-readable reason.
///
/// Once reached it is never unset; the first reason recorded is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Termination {
    reached: bool,
    reason: Option<String>,
}

impl Termination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the solver as terminated. Later calls keep the original reason.
    pub fn reach(&mut self, reason: impl Into<String>) {
        if !self.reached {
            self.reached = true;
            self.reason = Some(reason.into());
        }
    }

    pub fn is_reached(&self) -> bool {
        self.reached
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_is_monotone() {
        let mut t = Termination::new();
        assert!(!t.is_reached());
        assert!(t.reason().is_none());

        t.reach("Chain length (100) reached");
        t.reach("Max function evaluations reached (500)");
        assert!(t.is_reached());
        assert_eq!(t.reason(), Some("Chain length (100) reached"));
    }
}
