use std::fmt;

/// Matches a client's mesh identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IdentityMatch {
    /// An exact match.
    Exact(String),

    /// A suffix match. The empty suffix matches all identities.
    Suffix(Vec<String>),
}

// === impl IdentityMatch ===

impl std::str::FromStr for IdentityMatch {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Self::Suffix(vec![]));
        }
        if let Some(suffix) = s.strip_prefix("*.") {
            return Ok(Self::Suffix(suffix.split('.').map(Into::into).collect()));
        }
        Ok(Self::Exact(s.to_string()))
    }
}

impl fmt::Display for IdentityMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use std::fmt::Write;
        match self {
            Self::Exact(name) => name.fmt(f),
            Self::Suffix(suffix) => {
                f.write_char('*')?;
                for part in suffix {
                    write!(f, ".{part}")?;
                }
                Ok(())
            }
        }
    }
}
