//! Fast content screen run before the external classifier.

use log::warn;
use regex::Regex;

use super::Severity;

const PROFANITY: [&str; 4] = [
    r"(?i)\b(f[u*]ck|fuck|shit|sh[i*]t|bitch|b[i*]tch|ass|asshole|a[s*]{2}hole|damn|hell|crap)\b",
    r"(?i)\b(sex|porn|nude|n[u*]de|dick|d[i*]ck|pussy|p[u*]ssy|cock|c[o*]ck)\b",
    r"(?i)\b(kill yourself|kys|die|suicide|wtf|stfu)\b",
    r"(?i)\b(stupid|idiot|retard|moron|dumb)\s+(you|ass|bitch)\b",
];

const URL: &str = r"(?i)(https?://|www\.|\.[a-z]{2,4}/)";

const CAPS_RATIO: f64 = 0.7;
const CAPS_MIN_LEN: usize = 10;
const REPEATED_CHARS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternHit {
    pub reason: &'static str,
    pub severity: Severity,
}

pub struct PatternScreen {
    profanity: Vec<Regex>,
    url: Option<Regex>,
}

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("Content pattern failed to compile, skipping it: {e}");
            None
        }
    }
}

impl PatternScreen {
    pub fn new() -> Self {
        PatternScreen {
            profanity: PROFANITY.iter().filter_map(|p| compile(p)).collect(),
            url: compile(URL),
        }
    }

    /// First matching rule, checked in order: profanity, caps, repetition, links.
    pub fn check(&self, message: &str) -> Option<PatternHit> {
        if self.profanity.iter().any(|re| re.is_match(message)) {
            return Some(PatternHit {
                reason: "profanity_detected",
                severity: Severity::Moderate,
            });
        }

        if is_shouting(message) {
            return Some(PatternHit {
                reason: "excessive_caps",
                severity: Severity::Mild,
            });
        }

        if longest_run(message) >= REPEATED_CHARS {
            return Some(PatternHit {
                reason: "spam_pattern",
                severity: Severity::Moderate,
            });
        }

        if self.url.as_ref().is_some_and(|re| re.is_match(message)) {
            return Some(PatternHit {
                reason: "link_spam",
                severity: Severity::Moderate,
            });
        }

        None
    }
}

impl Default for PatternScreen {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::cast_precision_loss)]
fn is_shouting(message: &str) -> bool {
    let len = message.chars().count();
    if len <= CAPS_MIN_LEN {
        return false;
    }
    let upper = message.chars().filter(char::is_ascii_uppercase).count();
    upper as f64 / len as f64 > CAPS_RATIO
}

fn longest_run(message: &str) -> usize {
    let mut longest = 0;
    let mut run = 0;
    let mut prev = None;
    for c in message.chars() {
        if Some(c) == prev {
            run += 1;
        } else {
            run = 1;
            prev = Some(c);
        }
        longest = longest.max(run);
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(message: &str) -> Option<&'static str> {
        PatternScreen::new().check(message).map(|hit| hit.reason)
    }

    #[test]
    fn clean_messages_pass() {
        assert_eq!(reason("hello there, how is your evening going?"), None);
        assert_eq!(reason("hello"), None);
        assert_eq!(reason("class assignment"), None);
    }

    #[test]
    fn profanity_is_moderate() {
        let hit = PatternScreen::new().check("what the FUCK").unwrap();
        assert_eq!(hit.reason, "profanity_detected");
        assert_eq!(hit.severity, Severity::Moderate);
        assert_eq!(reason("stfu"), Some("profanity_detected"));
    }

    #[test]
    fn shouting_is_mild_only_when_long_enough() {
        let hit = PatternScreen::new().check("HELLO EVERYBODY").unwrap();
        assert_eq!(hit.reason, "excessive_caps");
        assert_eq!(hit.severity, Severity::Mild);
        assert_eq!(reason("HELLO"), None);
    }

    #[test]
    fn repeated_characters() {
        assert_eq!(reason("nooooo way"), Some("spam_pattern"));
        assert_eq!(reason("nooo way"), None);
    }

    #[test]
    fn links() {
        assert_eq!(reason("see https://example.com"), Some("link_spam"));
        assert_eq!(reason("go to www.example.com"), Some("link_spam"));
        assert_eq!(reason("example.com/path"), Some("link_spam"));
    }
}
