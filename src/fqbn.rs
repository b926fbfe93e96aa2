//! Fully Qualified Board Name parsing (`package:arch:board[:opt=val,...]`).

use crate::error::BuildError;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fqbn {
    pub package: String,
    pub architecture: String,
    pub board_id: String,
    /// Menu selections in the order given.
    pub configs: Vec<(String, String)>,
}

impl Fqbn {
    pub fn parse(text: &str) -> Result<Self, BuildError> {
        let invalid = |reason: &str| BuildError::InvalidFqbn {
            fqbn: text.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = text.split(':').collect();
        if parts.len() < 3 || parts.len() > 4 {
            return Err(invalid("expected package:arch:board[:config]"));
        }
        if parts[..3].iter().any(|p| p.trim().is_empty()) {
            return Err(invalid("empty field"));
        }

        let mut configs = Vec::new();
        if let Some(options) = parts.get(3) {
            for option in options.split(',') {
                let Some((key, value)) = option.split_once('=') else {
                    return Err(invalid("config option must be key=value"));
                };
                if key.is_empty() || value.is_empty() {
                    return Err(invalid("empty config option"));
                }
                configs.push((key.to_string(), value.to_string()));
            }
        }

        Ok(Self {
            package: parts[0].to_string(),
            architecture: parts[1].to_string(),
            board_id: parts[2].to_string(),
            configs,
        })
    }
}

impl FromStr for Fqbn {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Fqbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.package, self.architecture, self.board_id)?;
        if !self.configs.is_empty() {
            let opts: Vec<String> = self
                .configs
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, ":{}", opts.join(","))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let fqbn = Fqbn::parse("arduino:avr:uno").unwrap();
        assert_eq!(fqbn.package, "arduino");
        assert_eq!(fqbn.architecture, "avr");
        assert_eq!(fqbn.board_id, "uno");
        assert!(fqbn.configs.is_empty());
        assert_eq!(fqbn.to_string(), "arduino:avr:uno");
    }

    #[test]
    fn test_parse_with_config() {
        let fqbn: Fqbn = "arduino:avr:nano:cpu=atmega328old,speed=16".parse().unwrap();
        assert_eq!(
            fqbn.configs,
            vec![
                ("cpu".to_string(), "atmega328old".to_string()),
                ("speed".to_string(), "16".to_string())
            ]
        );
        assert_eq!(fqbn.to_string(), "arduino:avr:nano:cpu=atmega328old,speed=16");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Fqbn::parse("arduino:avr").is_err());
        assert!(Fqbn::parse("arduino::uno").is_err());
        assert!(Fqbn::parse("arduino:avr:nano:cpu").is_err());
        assert!(Fqbn::parse("a:b:c:d=e:f").is_err());
    }
}
