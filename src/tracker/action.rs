use crate::error::Error;

/// The action ids of the UDP tracker protocol.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    Connect = 0,
    Announce = 1,
    Scrape = 2,
    Error = 3,
}

impl TryFrom<u32> for Action {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Error> {
        match value {
            0 => Ok(Action::Connect),
            1 => Ok(Action::Announce),
            2 => Ok(Action::Scrape),
            3 => Ok(Action::Error),
            _ => Err(Error::TrackerResponse),
        }
    }
}
