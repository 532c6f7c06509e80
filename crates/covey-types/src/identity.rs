//! Host identity probing and the bundled word list.
//!
//! Peer ids are `<hostname>/<fragment>`. The hostname comes from the
//! usual Linux sources with an environment fallback; the fragment is a
//! random pick from a word list embedded at compile time. The list is
//! parsed once into an immutable process-wide table.

use std::sync::LazyLock;

use rand::seq::IndexedRandom;
use tracing::debug;

/// One token per line, UTF-8. Embedded so the table can never be absent
/// at runtime.
static WORDS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    let words: Vec<&'static str> = include_str!("../assets/words.txt")
        .lines()
        .map(str::trim)
        .filter(|w| !w.is_empty())
        .collect();
    assert!(!words.is_empty(), "bundled word list is empty");
    words
});

/// Pick a random human-readable identifier fragment.
pub fn random_fragment() -> &'static str {
    WORDS
        .choose(&mut rand::rng())
        .copied()
        .expect("word list is non-empty")
}

/// Number of fragments in the bundled list.
pub fn word_count() -> usize {
    WORDS.len()
}

/// Determine this host's name.
///
/// Probes `/etc/hostname` and `/proc/sys/kernel/hostname`, then the
/// `HOSTNAME` environment variable, and falls back to `"localhost"`.
pub fn detect_hostname() -> String {
    for path in ["/etc/hostname", "/proc/sys/kernel/hostname"] {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let name = contents.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }

    if let Ok(name) = std::env::var("HOSTNAME") {
        let name = name.trim().to_string();
        if !name.is_empty() {
            return name;
        }
    }

    debug!("no hostname source available, using localhost");
    "localhost".to_string()
}
