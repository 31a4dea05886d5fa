//! Scaling governors

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// A cpufreq scaling governor
///
/// Unknown names are kept verbatim so that whatever the kernel reports can be
/// round-tripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Governor {
    Performance,
    Powersave,
    /// Required for [`super::FrequencyController::set_fixed_frequency`]
    Userspace,
    Ondemand,
    Conservative,
    Schedutil,
    Other(String),
}

impl Governor {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Performance => "performance",
            Self::Powersave => "powersave",
            Self::Userspace => "userspace",
            Self::Ondemand => "ondemand",
            Self::Conservative => "conservative",
            Self::Schedutil => "schedutil",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Governor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Governor {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "performance" => Self::Performance,
            "powersave" => Self::Powersave,
            "userspace" => Self::Userspace,
            "ondemand" => Self::Ondemand,
            "conservative" => Self::Conservative,
            "schedutil" => Self::Schedutil,
            other => Self::Other(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_and_unknown_names() {
        assert_eq!("userspace\n".parse::<Governor>().unwrap(), Governor::Userspace);
        assert_eq!(
            "interactive".parse::<Governor>().unwrap(),
            Governor::Other("interactive".to_string())
        );
        assert_eq!(Governor::Schedutil.to_string(), "schedutil");
    }
}
