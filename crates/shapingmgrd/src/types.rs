//! Core type definitions for the shaping pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Highest usable class id within one interface's namespace.
///
/// Class ids are tc minor handles, 16 bits wide; 0 is reserved for the
/// qdisc itself.
pub const CLASS_ID_MAX: u16 = 0xFFFF;

/// Major number of the root qdisc handle. All classes of the hierarchy
/// live in this major namespace.
pub const ROOT_QDISC_MAJOR: u16 = 1;

/// A tc handle: `major:minor` in the kernel's hexadecimal notation.
///
/// Qdisc handles have minor 0 and render as `major:`; class handles render
/// as `major:minor`. Both components are written and parsed in hex, which
/// is what `tc` itself does, so a handle survives the round trip through
/// `tc ... show` output unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TcHandle {
    /// Major number (qdisc namespace).
    pub major: u16,
    /// Minor number (class namespace; 0 for the qdisc itself).
    pub minor: u16,
}

impl TcHandle {
    /// Handle of a qdisc (`major:`).
    pub fn qdisc(major: u16) -> Self {
        Self { major, minor: 0 }
    }

    /// Handle of a class (`major:minor`).
    pub fn class(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Returns true if this is a qdisc handle.
    pub fn is_qdisc(&self) -> bool {
        self.minor == 0
    }
}

impl fmt::Display for TcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor == 0 {
            write!(f, "{:x}:", self.major)
        } else {
            write!(f, "{:x}:{:x}", self.major, self.minor)
        }
    }
}

impl FromStr for TcHandle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once(':')
            .ok_or_else(|| format!("handle '{}' has no ':'", s))?;
        let major = u16::from_str_radix(major, 16)
            .map_err(|_| format!("bad handle major '{}'", major))?;
        let minor = if minor.is_empty() {
            0
        } else {
            u16::from_str_radix(minor, 16).map_err(|_| format!("bad handle minor '{}'", minor))?
        };
        Ok(Self { major, minor })
    }
}

/// Queueing discipline kind.
///
/// Only `htb` is interpreted structurally (it is the one classful kind
/// this manager compiles); everything else is installed as a leaf with its
/// options passed through opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QdiscKind {
    /// Hierarchical Token Bucket.
    Htb,
    /// Stochastic Fairness Queueing.
    Sfq,
    /// Plain packet FIFO.
    Pfifo,
    /// Token Bucket Filter.
    Tbf,
    /// Any other discipline, passed through with opaque options.
    Other(String),
}

impl QdiscKind {
    /// Returns the tc name of this discipline.
    pub fn as_str(&self) -> &str {
        match self {
            QdiscKind::Htb => "htb",
            QdiscKind::Sfq => "sfq",
            QdiscKind::Pfifo => "pfifo",
            QdiscKind::Tbf => "tbf",
            QdiscKind::Other(name) => name,
        }
    }

    /// Returns true for kinds this manager knows beyond their name.
    pub fn is_recognized(&self) -> bool {
        !matches!(self, QdiscKind::Other(_))
    }

    /// Returns true if the kind accepts child classes in this manager.
    pub fn is_classful(&self) -> bool {
        matches!(self, QdiscKind::Htb)
    }
}

impl FromStr for QdiscKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "htb" => QdiscKind::Htb,
            "sfq" => QdiscKind::Sfq,
            "pfifo" => QdiscKind::Pfifo,
            "tbf" => QdiscKind::Tbf,
            other => QdiscKind::Other(other.to_string()),
        })
    }
}

impl fmt::Display for QdiscKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bandwidth rate literal, e.g. `768kbit`.
///
/// The declared text is preserved for emission; comparisons use the parsed
/// bit-per-second value, so `1mbit` and `1000kbit` compare equal and the
/// kernel's choice of printing unit never causes a spurious diff.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Rate {
    bits_per_second: u64,
    text: String,
}

impl Rate {
    /// Returns the rate in bits per second.
    pub fn bits_per_second(&self) -> u64 {
        self.bits_per_second
    }

    /// Returns the rate as originally declared.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl PartialEq for Rate {
    fn eq(&self, other: &Self) -> bool {
        self.bits_per_second == other.bits_per_second
    }
}

impl PartialOrd for Rate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.bits_per_second.cmp(&other.bits_per_second)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Rate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.is_empty() {
            return Err("empty rate".to_string());
        }
        let split = text
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(text.len());
        let (number, suffix) = text.split_at(split);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("bad rate number '{}'", number))?;
        if value < 0.0 {
            return Err(format!("negative rate '{}'", text));
        }
        // tc unit suffixes; *bit are bits/s, *bps are bytes/s
        let multiplier: f64 = match suffix.to_ascii_lowercase().as_str() {
            "" | "bit" => 1.0,
            "kbit" => 1_000.0,
            "mbit" => 1_000_000.0,
            "gbit" => 1_000_000_000.0,
            "bps" => 8.0,
            "kbps" => 8_000.0,
            "mbps" => 8_000_000.0,
            "gbps" => 8_000_000_000.0,
            other => return Err(format!("unknown rate unit '{}'", other)),
        };
        Ok(Rate {
            bits_per_second: (value * multiplier).round() as u64,
            text: text.to_string(),
        })
    }
}
