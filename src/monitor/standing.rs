//! IP address standing.

use serde::Serialize;

/// How the service treats requests from an IP address.
///
/// The numeric code is what the checkpoint file stores.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IpStanding {
    /// Requests are served.
    #[default]
    Ok = 0,
    /// Exceeded a threshold this period; reverts at a quiet housekeeping sweep.
    TemporarilyBlocked = 1,
    /// Set by an administrator. Only parole lifts it.
    Blacklisted = 2,
}

impl IpStanding {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IpStanding::Ok => "ok",
            IpStanding::TemporarilyBlocked => "temporarily_blocked",
            IpStanding::Blacklisted => "blacklisted",
        }
    }

    pub fn is_blocked(self) -> bool {
        self != IpStanding::Ok
    }
}

impl TryFrom<u8> for IpStanding {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(IpStanding::Ok),
            1 => Ok(IpStanding::TemporarilyBlocked),
            2 => Ok(IpStanding::Blacklisted),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for IpStanding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
