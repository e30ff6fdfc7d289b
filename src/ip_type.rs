//! IP address type preference.

use std::fmt;
use std::str::FromStr;

use crate::error::ConnectorError;

/// Network path preference for dialing an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpType {
    Public,
    Private,
    Psc,
}

impl IpType {
    /// All supported values, in the order they are listed in error messages.
    pub const ALL: [IpType; 3] = [IpType::Public, IpType::Private, IpType::Psc];

    pub fn as_str(&self) -> &'static str {
        match self {
            IpType::Public => "PUBLIC",
            IpType::Private => "PRIVATE",
            IpType::Psc => "PSC",
        }
    }
}

impl fmt::Display for IpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IpType {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PUBLIC" => Ok(IpType::Public),
            "PRIVATE" => Ok(IpType::Private),
            "PSC" => Ok(IpType::Psc),
            _ => Err(ConnectorError::InvalidArgument(format!(
                "Incorrect value for ip_type, got '{}'. Want one of: 'PUBLIC', 'PRIVATE', 'PSC'.",
                s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("public".parse::<IpType>().unwrap(), IpType::Public);
        assert_eq!("Private".parse::<IpType>().unwrap(), IpType::Private);
        assert_eq!("PSC".parse::<IpType>().unwrap(), IpType::Psc);
    }

    #[test]
    fn rejects_unknown_value_with_pinned_message() {
        let err = "BAD-IP-TYPE".parse::<IpType>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Incorrect value for ip_type, got 'BAD-IP-TYPE'. Want one of: 'PUBLIC', 'PRIVATE', 'PSC'."
        );
    }

    #[test]
    fn displays_canonical_uppercase_form() {
        assert_eq!(IpType::Private.to_string(), "PRIVATE");
    }
}
